//! High-level runner API for the chain executor.
//!
//! This module wires the outcome store, the completion client and the chain
//! runner together from a single [`ExecutorArgs`] value. It is the entry point
//! used by the CLI.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::coordination::{
    BatchConfig, BatchCoordinator, ChainRunner, RetryPolicy, StepExecutor, StepTemplates,
};
use crate::db::{self as db_pool, ensure_step_outcomes_table};
use crate::remote::{CompletionClient, ModelParams, OpenAiClient, RemoteSettings};
use crate::store::{LocalOutcomeStore, OutcomeStore, SqlOutcomeStore, StepOutcome};

pub use crate::config::{
    DEFAULT_BASE_URL, DEFAULT_CHAIN_CONCURRENCY, DEFAULT_DATABASE_URL, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE, DEFAULT_TOP_P,
};
pub use crate::coordination::{BatchResult, ChainOutput, ChainSummary};

/// Where step outcomes are recorded
#[derive(Debug, Clone)]
pub enum OutcomeBackend {
    /// `postgres://` or `sqlite:` URL
    Database {
        url: String,
        max_connections: u32,
    },
    /// Directory holding one JSON file per step
    LocalDir(PathBuf),
}

/// Arguments for running chains
#[derive(Clone)]
pub struct ExecutorArgs {
    pub backend: OutcomeBackend,
    pub remote: RemoteSettings,
    pub params: ModelParams,
    /// JSON template file; the built-in answer/confidence/verdict chain when unset
    pub templates_path: Option<PathBuf>,
    pub retry: RetryPolicy,
    pub batch: BatchConfig,

    // Test-only: inject a stub client and a pre-created store
    #[cfg(test)]
    pub test_client: Option<Arc<dyn CompletionClient>>,
    #[cfg(test)]
    pub test_store: Option<Arc<dyn OutcomeStore>>,
}

/// Run a single chain over `input`, recording its steps under `chain_id`
///
/// A failed chain is reported through [`ChainSummary::Failed`]; `Err` is
/// reserved for setup failures.
pub async fn run_chain(
    args: ExecutorArgs,
    chain_id: &str,
    input: &str,
    cancel: &CancellationToken,
) -> Result<ChainSummary> {
    let runner = build_runner(&args).await?;
    info!("Running chain {}", chain_id);

    let result = runner.run_chain(chain_id, input, cancel).await;
    Ok(ChainSummary::from_result(result))
}

/// Run one independent chain per input, reported under `batch_id`
pub async fn run_batch(
    args: ExecutorArgs,
    batch_id: &str,
    inputs: Vec<String>,
    cancel: &CancellationToken,
) -> Result<BatchResult> {
    let runner = build_runner(&args).await?;
    let coordinator = BatchCoordinator::new(Arc::new(runner), args.batch);
    coordinator.run_batch(batch_id, inputs, cancel).await
}

/// Read back every recorded step of a chain, ordered by step number
pub async fn show_chain(args: ExecutorArgs, chain_id: &str) -> Result<Vec<StepOutcome>> {
    let store = build_store(&args).await?;
    store
        .list_chain(chain_id)
        .await
        .with_context(|| format!("Failed to read chain {}", chain_id))
}

async fn build_runner(args: &ExecutorArgs) -> Result<ChainRunner> {
    let templates = match &args.templates_path {
        Some(path) => StepTemplates::from_json_file(path)?,
        None => StepTemplates::reference(),
    };
    info!("Chains run {} steps", templates.len());

    let client = build_client(args)?;
    let store = build_store(args).await?;

    let executor = StepExecutor::new(
        client,
        Arc::new(templates),
        args.params.clone(),
        args.retry.clone(),
    );
    Ok(ChainRunner::new(executor, store))
}

fn build_client(args: &ExecutorArgs) -> Result<Arc<dyn CompletionClient>> {
    #[cfg(test)]
    let injected = args.test_client.clone();
    #[cfg(not(test))]
    let injected: Option<Arc<dyn CompletionClient>> = None;
    if let Some(client) = injected {
        return Ok(client);
    }

    let client = OpenAiClient::new(&args.remote).context("Failed to create completion client")?;
    Ok(Arc::new(client))
}

async fn build_store(args: &ExecutorArgs) -> Result<Arc<dyn OutcomeStore>> {
    #[cfg(test)]
    let injected = args.test_store.clone();
    #[cfg(not(test))]
    let injected: Option<Arc<dyn OutcomeStore>> = None;
    if let Some(store) = injected {
        return Ok(store);
    }

    match &args.backend {
        OutcomeBackend::Database {
            url,
            max_connections,
        } => {
            let pool = db_pool::pool::connect(url, *max_connections).await?;
            ensure_step_outcomes_table(&pool).await?;
            Ok(Arc::new(SqlOutcomeStore::new(pool)))
        }
        OutcomeBackend::LocalDir(dir) => {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("Failed to create outcome directory {}", dir.display()))?;
            Ok(Arc::new(LocalOutcomeStore::new(dir.clone())))
        }
    }
}
