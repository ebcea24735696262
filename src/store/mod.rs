//! Durable per-step outcome records
//!
//! The store is the only shared mutable resource of the executor. Each append
//! is an independent, atomically committed unit keyed by
//! `(chain_id, step_number)`.

pub mod local;
pub mod sql;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use local::LocalOutcomeStore;
pub use sql::SqlOutcomeStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Error,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(StepStatus::Success),
            "error" => Some(StepStatus::Error),
            _ => None,
        }
    }
}

/// The recorded attempt of one step of one chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub task_id: String,
    pub chain_id: String,
    pub step_number: u32,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub execution_time_ms: u64,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// Trait for step outcome persistence
///
/// Implementations can use a SQL database, the local filesystem, or other
/// storage backends. An append for an already recorded `(chain_id,
/// step_number)` must fail with [`StoreError::DuplicateStep`] and leave the
/// existing record untouched.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Durably record one step outcome
    async fn append_step_outcome(&self, outcome: &StepOutcome) -> Result<(), StoreError>;

    /// All recorded outcomes of a chain ordered by `step_number`
    async fn list_chain(&self, chain_id: &str) -> Result<Vec<StepOutcome>, StoreError>;
}
