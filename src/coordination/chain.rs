//! Chain runner: executes the step templates in order for one input.
//!
//! Each outcome is recorded before the next step starts. A step that fails or
//! cannot be recorded ends the chain, and so does cancellation.

use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::step::{StepCancelled, StepExecutor};
use super::templates::{INPUT_PLACEHOLDER, PriorOutputs};
use crate::error::ChainError;
use crate::store::{OutcomeStore, StepOutcome};
use crate::telemetry::{TelemetryEvent, TelemetrySender};

/// Response of one successful step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutput {
    pub step_number: u32,
    pub name: String,
    pub response: String,
}

/// Result of a chain whose every step succeeded
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainOutput {
    pub chain_id: String,
    pub outputs: Vec<StepOutput>,
}

impl ChainOutput {
    /// Response of the last step
    pub fn final_response(&self) -> Option<&str> {
        self.outputs.last().map(|o| o.response.as_str())
    }
}

/// Runs every step of a chain in order, recording each outcome before moving on
pub struct ChainRunner {
    executor: StepExecutor,
    store: Arc<dyn OutcomeStore>,
}

impl ChainRunner {
    pub fn new(executor: StepExecutor, store: Arc<dyn OutcomeStore>) -> Self {
        Self { executor, store }
    }

    pub fn store(&self) -> &Arc<dyn OutcomeStore> {
        &self.store
    }

    /// Run one chain to completion or to its first failing step
    ///
    /// Every attempted step is recorded before the next one starts. A failed
    /// step ends the chain and its error is returned after it was recorded.
    pub async fn run_chain(
        &self,
        chain_id: &str,
        raw_input: &str,
        cancel: &CancellationToken,
    ) -> Result<ChainOutput, ChainError> {
        self.run_chain_with_telemetry(chain_id, raw_input, cancel, None)
            .await
    }

    pub(crate) async fn run_chain_with_telemetry(
        &self,
        chain_id: &str,
        raw_input: &str,
        cancel: &CancellationToken,
        telemetry: Option<&TelemetrySender>,
    ) -> Result<ChainOutput, ChainError> {
        emit(telemetry, TelemetryEvent::ChainStarted);
        info!(chain_id, steps = self.executor.step_count(), "starting chain");

        let result = self.run_steps(chain_id, raw_input, cancel, telemetry).await;

        match &result {
            Ok(_) => info!(chain_id, "chain completed"),
            Err(e) => warn!(chain_id, error = %e, "chain stopped"),
        }
        emit(
            telemetry,
            TelemetryEvent::ChainFinished {
                succeeded: result.is_ok(),
            },
        );

        result
    }

    async fn run_steps(
        &self,
        chain_id: &str,
        raw_input: &str,
        cancel: &CancellationToken,
        telemetry: Option<&TelemetrySender>,
    ) -> Result<ChainOutput, ChainError> {
        let mut prior = PriorOutputs::new();
        prior.insert(INPUT_PLACEHOLDER.to_string(), raw_input.to_string());
        let mut outputs = Vec::with_capacity(self.executor.step_count() as usize);

        for step_number in 1..=self.executor.step_count() {
            let outcome = match self
                .executor
                .execute_step(chain_id, step_number, &prior, cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(StepCancelled { outcome }) => {
                    // Best effort: the interrupted step is still described in the store
                    if let Err(e) = self.record(&outcome, telemetry).await {
                        warn!(chain_id, step_number, error = %e, "failed to record cancelled step");
                    }
                    return Err(ChainError::Cancelled {
                        chain_id: chain_id.to_string(),
                        step_number,
                    });
                }
            };

            self.record(&outcome, telemetry).await?;

            match (outcome.response, outcome.error_message) {
                (Some(response), None) => {
                    let name = self
                        .executor
                        .templates()
                        .get(step_number)
                        .map(|t| t.name.clone())
                        .unwrap_or_else(|| format!("step{step_number}"));
                    prior.insert(name.clone(), response.clone());
                    outputs.push(StepOutput {
                        step_number,
                        name,
                        response,
                    });
                }
                (_, error_message) => {
                    return Err(ChainError::StepFailed {
                        chain_id: chain_id.to_string(),
                        step_number,
                        message: error_message.unwrap_or_else(|| "step failed".to_string()),
                    });
                }
            }
        }

        Ok(ChainOutput {
            chain_id: chain_id.to_string(),
            outputs,
        })
    }

    async fn record(
        &self,
        outcome: &StepOutcome,
        telemetry: Option<&TelemetrySender>,
    ) -> Result<(), ChainError> {
        self.store
            .append_step_outcome(outcome)
            .await
            .map_err(|source| ChainError::Persistence {
                chain_id: outcome.chain_id.clone(),
                step_number: outcome.step_number,
                source,
            })?;

        emit(
            telemetry,
            TelemetryEvent::StepCompleted {
                duration_ms: outcome.execution_time_ms,
                success: outcome.is_success(),
            },
        );
        Ok(())
    }
}

fn emit(telemetry: Option<&TelemetrySender>, event: TelemetryEvent) {
    if let Some(tx) = telemetry {
        let _ = tx.send(event);
    }
}
