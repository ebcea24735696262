//! Stub collaborators shared by unit and integration tests

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{RemoteError, StoreError};
use crate::remote::{CompletionClient, ModelParams};
use crate::store::{OutcomeStore, StepOutcome};

type Script = Box<dyn Fn(&str) -> Result<String, RemoteError> + Send + Sync>;

/// Completion client answering every prompt from a closure
pub struct ScriptedClient {
    script: Script,
    latency: Option<Duration>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub fn answering(
        script: impl Fn(&str) -> Result<String, RemoteError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            latency: None,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Sleep before answering each call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// Every prompt received, in call order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, prompt: &str, _params: &ModelParams) -> Result<String, RemoteError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        (self.script)(prompt)
    }
}

/// Store that rejects every append with an I/O error
pub struct FailingStore;

#[async_trait]
impl OutcomeStore for FailingStore {
    async fn append_step_outcome(&self, _outcome: &StepOutcome) -> Result<(), StoreError> {
        Err(StoreError::Io(std::io::Error::other("disk full")))
    }

    async fn list_chain(&self, _chain_id: &str) -> Result<Vec<StepOutcome>, StoreError> {
        Ok(Vec::new())
    }
}
