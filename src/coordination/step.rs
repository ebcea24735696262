//! Step execution: render one template, call the model with retries, and
//! time the attempt.
//!
//! The executor never touches the outcome store. It returns a [`StepOutcome`]
//! for the chain runner to record, with `completed_at - created_at` equal to
//! `execution_time_ms`.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, SubsecRound, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::retry::{RetryPolicy, invoke};
use super::templates::{PriorOutputs, StepTemplates};
use crate::error::InvokeError;
use crate::remote::{CompletionClient, ModelParams};
use crate::store::{StepOutcome, StepStatus};

/// A step interrupted by cancellation
///
/// Carries the error-status outcome describing the interrupted attempt so the
/// caller can decide whether to record it. It never has `status = success`.
#[derive(Debug, Clone)]
pub struct StepCancelled {
    pub outcome: StepOutcome,
}

/// Resolves, invokes and times one step of a chain
pub struct StepExecutor {
    client: Arc<dyn CompletionClient>,
    templates: Arc<StepTemplates>,
    params: ModelParams,
    retry: RetryPolicy,
}

impl StepExecutor {
    pub fn new(
        client: Arc<dyn CompletionClient>,
        templates: Arc<StepTemplates>,
        params: ModelParams,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            templates,
            params,
            retry,
        }
    }

    /// Number of steps every chain runs
    pub fn step_count(&self) -> u32 {
        self.templates.len() as u32
    }

    pub fn templates(&self) -> &StepTemplates {
        &self.templates
    }

    /// Execute one step and describe the attempt as a [`StepOutcome`]
    ///
    /// Remote failures, including exhausted retries, are reported through
    /// `status = error`. Only cancellation is returned as `Err`.
    pub async fn execute_step(
        &self,
        chain_id: &str,
        step_number: u32,
        prior: &PriorOutputs,
        cancel: &CancellationToken,
    ) -> Result<StepOutcome, StepCancelled> {
        let task_id = Uuid::new_v4().to_string();

        let prompt = match self.templates.render(step_number, prior) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!(chain_id, step_number, error = %e, "step prompt could not be resolved");
                let template = self
                    .templates
                    .get(step_number)
                    .map(|t| t.template.clone())
                    .unwrap_or_default();
                let now = Utc::now().trunc_subsecs(3);
                return Ok(finish(
                    task_id,
                    chain_id,
                    step_number,
                    template,
                    Err(e.to_string()),
                    now,
                    0,
                ));
            }
        };

        debug!(chain_id, step_number, prompt_len = prompt.len(), "invoking step");

        let created_at = Utc::now().trunc_subsecs(3);
        let started = Instant::now();

        let result = invoke(&self.retry, cancel, |_attempt| {
            self.client.complete(&prompt, &self.params)
        })
        .await;

        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => Ok(finish(
                task_id,
                chain_id,
                step_number,
                prompt,
                Ok(response),
                created_at,
                elapsed_ms,
            )),
            Err(InvokeError::Cancelled { attempts }) => {
                let message = format!("cancelled after {attempts} attempt(s)");
                Err(StepCancelled {
                    outcome: finish(
                        task_id,
                        chain_id,
                        step_number,
                        prompt,
                        Err(message),
                        created_at,
                        elapsed_ms,
                    ),
                })
            }
            Err(e @ InvokeError::Remote { .. }) => Ok(finish(
                task_id,
                chain_id,
                step_number,
                prompt,
                Err(e.to_string()),
                created_at,
                elapsed_ms,
            )),
        }
    }
}

/// Build an outcome whose `completed_at` is derived from `created_at`, so the
/// stored duration always matches the stored timestamps
fn finish(
    task_id: String,
    chain_id: &str,
    step_number: u32,
    prompt: String,
    result: Result<String, String>,
    created_at: DateTime<Utc>,
    elapsed_ms: u64,
) -> StepOutcome {
    let completed_at = created_at + chrono::Duration::milliseconds(elapsed_ms as i64);
    let (status, response, error_message) = match result {
        Ok(response) => (StepStatus::Success, Some(response), None),
        Err(message) => (StepStatus::Error, None, Some(message)),
    };

    StepOutcome {
        task_id,
        chain_id: chain_id.to_string(),
        step_number,
        prompt,
        response,
        status,
        error_message,
        created_at,
        completed_at,
        execution_time_ms: elapsed_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::retry::RetryPolicyBuilder;
    use crate::coordination::templates::INPUT_PLACEHOLDER;
    use crate::error::RemoteError;
    use crate::testing::ScriptedClient;
    use std::time::Duration;

    fn executor(client: Arc<ScriptedClient>, max_attempts: u32) -> StepExecutor {
        let retry = RetryPolicyBuilder::default()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(2))
            .build()
            .unwrap();
        StepExecutor::new(
            client,
            Arc::new(StepTemplates::reference()),
            ModelParams::default(),
            retry,
        )
    }

    fn input(text: &str) -> PriorOutputs {
        PriorOutputs::from([(INPUT_PLACEHOLDER.to_string(), text.to_string())])
    }

    #[tokio::test]
    async fn test_success_outcome() {
        let client = Arc::new(ScriptedClient::answering(|_| Ok("7".to_string())));
        let executor = executor(Arc::clone(&client), 3);

        let outcome = executor
            .execute_step("chain-1", 1, &input("42"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, StepStatus::Success);
        assert_eq!(outcome.response.as_deref(), Some("7"));
        assert!(outcome.error_message.is_none());
        assert!(outcome.prompt.contains("Question: 42"));
        assert_eq!(outcome.chain_id, "chain-1");
        assert_eq!(outcome.step_number, 1);
        assert_eq!(client.prompts(), vec![outcome.prompt.clone()]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_become_error_outcome() {
        let client = Arc::new(ScriptedClient::answering(|_| {
            Err(RemoteError::Transient("503 service unavailable".to_string()))
        }));
        let executor = executor(Arc::clone(&client), 3);

        let outcome = executor
            .execute_step("chain-1", 1, &input("42"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, StepStatus::Error);
        assert!(outcome.response.is_none());
        let message = outcome.error_message.unwrap();
        assert!(message.contains("503 service unavailable"));
        assert!(message.contains("after 3 attempt(s)"));
        assert_eq!(client.call_count(), 3);
    }

    #[tokio::test]
    async fn test_execution_time_matches_timestamps() {
        let client = Arc::new(ScriptedClient::answering(|_| Ok("ok".to_string())).with_latency(
            Duration::from_millis(20),
        ));
        let executor = executor(client, 1);

        let outcome = executor
            .execute_step("chain-1", 1, &input("42"), &CancellationToken::new())
            .await
            .unwrap();

        let derived = (outcome.completed_at - outcome.created_at).num_milliseconds();
        assert_eq!(derived, outcome.execution_time_ms as i64);
        assert!(outcome.execution_time_ms >= 20);
    }

    #[tokio::test]
    async fn test_unresolvable_prompt_is_error_without_remote_call() {
        let client = Arc::new(ScriptedClient::answering(|_| Ok("x".to_string())));
        let executor = executor(Arc::clone(&client), 3);

        // Step 2 needs the output of step 1, which is missing
        let outcome = executor
            .execute_step("chain-1", 2, &input("42"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.status, StepStatus::Error);
        assert!(outcome.error_message.unwrap().contains("answer"));
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_propagates() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = Arc::new(ScriptedClient::answering(|_| Ok("7".to_string())));
        let executor = executor(client, 3);

        let cancelled = executor
            .execute_step("chain-1", 1, &input("42"), &cancel)
            .await
            .unwrap_err();

        assert_eq!(cancelled.outcome.status, StepStatus::Error);
        assert!(
            cancelled
                .outcome
                .error_message
                .unwrap()
                .starts_with("cancelled")
        );
    }
}
