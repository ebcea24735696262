use anyhow::Result;
use derive_builder::Builder;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{self, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::chain::{ChainOutput, ChainRunner};
use crate::config::DEFAULT_CHAIN_CONCURRENCY;
use crate::error::ChainError;
use crate::telemetry::{ProgressStats, TelemetryEvent};

/// Configuration for a batch of chains
#[derive(Debug, Clone, Builder)]
pub struct BatchConfig {
    /// Chains allowed to run at the same time
    #[builder(default = "DEFAULT_CHAIN_CONCURRENCY")]
    pub chain_concurrency: usize,
    /// Suppress progress bars
    #[builder(default)]
    pub quiet: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            chain_concurrency: DEFAULT_CHAIN_CONCURRENCY,
            quiet: false,
        }
    }
}

/// Final state of one chain in a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ChainSummary {
    Succeeded(ChainOutput),
    Failed {
        chain_id: String,
        step_number: u32,
        error: String,
        cancelled: bool,
    },
}

impl ChainSummary {
    pub(crate) fn from_result(result: Result<ChainOutput, ChainError>) -> Self {
        match result {
            Ok(output) => ChainSummary::Succeeded(output),
            Err(e) => ChainSummary::Failed {
                chain_id: e.chain_id().to_string(),
                step_number: e.step_number(),
                cancelled: e.is_cancelled(),
                error: e.to_string(),
            },
        }
    }

    pub fn chain_id(&self) -> &str {
        match self {
            ChainSummary::Succeeded(output) => &output.chain_id,
            ChainSummary::Failed { chain_id, .. } => chain_id,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ChainSummary::Succeeded(_))
    }
}

/// Result of a batch run; summaries follow input order
#[derive(Debug)]
pub struct BatchResult {
    pub batch_id: String,
    pub summaries: Vec<ChainSummary>,
    pub duration: Duration,
}

impl BatchResult {
    pub fn succeeded(&self) -> usize {
        self.summaries.iter().filter(|s| s.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.summaries.len() - self.succeeded()
    }
}

/// The BatchCoordinator runs one independent chain per input.
pub struct BatchCoordinator {
    runner: Arc<ChainRunner>,
    config: BatchConfig,
}

impl BatchCoordinator {
    pub fn new(runner: Arc<ChainRunner>, config: BatchConfig) -> Self {
        Self { runner, config }
    }

    /// Run one chain per input, each under a fresh chain id
    ///
    /// A failing chain never stops its siblings, including a chain whose task
    /// panicked. Cancellation is forwarded to every chain, and each reports
    /// its own cancelled summary.
    pub async fn run_batch(
        &self,
        batch_id: &str,
        inputs: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<BatchResult> {
        let start_time = Instant::now();
        let total = inputs.len();
        info!(batch_id, chains = total, "Starting batch");

        let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel::<TelemetryEvent>();
        let prog_jh = self.setup_progress_tracking(total, telemetry_rx)?;

        let concurrency = self.config.chain_concurrency.max(1);
        let mut join_set: JoinSet<ChainSummary> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, (usize, String)> = HashMap::new();
        let mut slots: Vec<Option<ChainSummary>> = vec![None; total];

        for (index, input) in inputs.into_iter().enumerate() {
            // Wait if we've reached concurrency limit
            while join_set.len() >= concurrency {
                if let Some(joined) = join_set.join_next_with_id().await {
                    Self::collect(joined, &mut in_flight, &mut slots);
                }
            }

            let runner = Arc::clone(&self.runner);
            let cancel = cancel.clone();
            let tx = telemetry_tx.clone();
            let chain_id = Uuid::new_v4().to_string();
            let task_chain_id = chain_id.clone();

            let handle = join_set.spawn(async move {
                let result = runner
                    .run_chain_with_telemetry(&task_chain_id, &input, &cancel, Some(&tx))
                    .await;
                ChainSummary::from_result(result)
            });
            in_flight.insert(handle.id(), (index, chain_id));
        }

        // Drop the coordinator's copy of the sender so the channel closes when chains finish
        drop(telemetry_tx);

        while let Some(joined) = join_set.join_next_with_id().await {
            Self::collect(joined, &mut in_flight, &mut slots);
        }

        // Wait for the progress bar to finish so we don't collide output
        if let Some(jh) = prog_jh {
            let _ = jh.await;
        }

        let summaries: Vec<ChainSummary> = slots.into_iter().flatten().collect();
        let result = BatchResult {
            batch_id: batch_id.to_string(),
            summaries,
            duration: start_time.elapsed(),
        };

        info!(
            "Batch complete: {} chains, {} succeeded, {} failed in {:.2}s",
            result.summaries.len(),
            result.succeeded(),
            result.failed(),
            result.duration.as_secs_f64()
        );

        Ok(result)
    }

    /// Store a finished chain in its input slot; a panicked task becomes a failed summary
    fn collect(
        joined: Result<(task::Id, ChainSummary), JoinError>,
        in_flight: &mut HashMap<task::Id, (usize, String)>,
        slots: &mut [Option<ChainSummary>],
    ) {
        let (id, summary) = match joined {
            Ok((id, summary)) => (id, Some(summary)),
            Err(e) => (e.id(), None),
        };
        let Some((index, chain_id)) = in_flight.remove(&id) else {
            warn!("Finished task {} does not belong to this batch", id);
            return;
        };

        let summary = summary.unwrap_or_else(|| {
            warn!(chain_id = %chain_id, "Chain task panicked");
            ChainSummary::Failed {
                error: format!("chain {chain_id} aborted: task panicked"),
                chain_id,
                step_number: 0,
                cancelled: false,
            }
        });
        slots[index] = Some(summary);
    }

    /// Setup progress tracking with progress bars
    fn setup_progress_tracking(
        &self,
        total_chains: usize,
        mut telemetry_rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    ) -> Result<Option<tokio::task::JoinHandle<()>>> {
        if self.config.quiet {
            return Ok(None);
        }

        let multi_progress = MultiProgress::new();

        let chain_bar = multi_progress.add(ProgressBar::new(total_chains as u64));
        chain_bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "[{elapsed_precise}] Chains: [{bar:30.cyan/blue}] {pos}/{len} ({percent}%) {msg}",
                )?
                .progress_chars("=>-"),
        );

        let stats_bar = multi_progress.add(ProgressBar::new(0));
        stats_bar.set_style(ProgressStyle::default_bar().template("[{elapsed_precise}] Steps: {msg}")?);

        Ok(Some(tokio::spawn(async move {
            let mut stats = ProgressStats::new();

            while let Some(event) = telemetry_rx.recv().await {
                stats.update(&event);

                chain_bar.set_position(stats.chains_finished() as u64);
                chain_bar.set_message(chain_message(&stats));

                stats_bar.set_message(step_message(&stats));
            }

            chain_bar.finish_with_message(chain_message(&stats));

            stats_bar.finish_with_message(step_message(&stats));
        })))
    }
}

fn chain_message(stats: &ProgressStats) -> String {
    format!(
        "running: {}, ok: {}, failed: {}",
        stats.chains_started.saturating_sub(stats.chains_finished()),
        stats.chains_succeeded,
        stats.chains_failed
    )
}

fn step_message(stats: &ProgressStats) -> String {
    let steps = stats.steps_succeeded + stats.steps_failed;
    match stats.get_percentiles() {
        (Some(p50), Some(p90), Some(p99)) => format!(
            "{} recorded ({} failed) | p50: {}ms, p90: {}ms, p99: {}ms",
            steps, stats.steps_failed, p50, p90, p99
        ),
        _ => format!("{} recorded ({} failed)", steps, stats.steps_failed),
    }
}
