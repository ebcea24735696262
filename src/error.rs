//! Error taxonomy shared by the remote client, retry loop, stores and chain runner.

use thiserror::Error;

/// Failure of a single remote completion call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failures, timeouts, rate limits and 5xx responses
    #[error("transient remote error: {0}")]
    Transient(String),

    /// Authentication failures, rejected requests and unusable responses
    #[error("fatal remote error: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Outcome of the retry loop when no successful response was produced
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InvokeError {
    #[error("{source} (after {attempts} attempt(s))")]
    Remote {
        attempts: u32,
        #[source]
        source: RemoteError,
    },

    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
}

/// Persistence failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("step {step_number} of chain {chain_id} has already been recorded")]
    DuplicateStep { chain_id: String, step_number: u32 },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid chain id '{0}'")]
    InvalidChainId(String),

    #[error("corrupt step record: {0}")]
    Corrupt(String),
}

/// Invalid step template configuration
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template list is empty")]
    Empty,

    #[error("step name '{0}' is reserved or used more than once")]
    DuplicateName(String),

    #[error("step {step_number} references '{placeholder}', which is not the input or an earlier step")]
    UnknownPlaceholder {
        step_number: u32,
        placeholder: String,
    },

    #[error("step {step_number} has an unterminated placeholder")]
    Unterminated { step_number: u32 },
}

/// Terminal failure of a chain, propagated after the failing step was recorded
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("chain {chain_id} failed at step {step_number}: {message}")]
    StepFailed {
        chain_id: String,
        step_number: u32,
        message: String,
    },

    #[error("chain {chain_id} cancelled at step {step_number}")]
    Cancelled { chain_id: String, step_number: u32 },

    #[error("chain {chain_id} could not record step {step_number}: {source}")]
    Persistence {
        chain_id: String,
        step_number: u32,
        #[source]
        source: StoreError,
    },
}

impl ChainError {
    pub fn chain_id(&self) -> &str {
        match self {
            ChainError::StepFailed { chain_id, .. }
            | ChainError::Cancelled { chain_id, .. }
            | ChainError::Persistence { chain_id, .. } => chain_id,
        }
    }

    pub fn step_number(&self) -> u32 {
        match self {
            ChainError::StepFailed { step_number, .. }
            | ChainError::Cancelled { step_number, .. }
            | ChainError::Persistence { step_number, .. } => *step_number,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChainError::Cancelled { .. })
    }
}
