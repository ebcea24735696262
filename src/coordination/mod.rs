//! Chain execution: retrying remote calls, single steps, whole chains and batches

pub mod chain;
pub mod coordinator;
pub mod retry;
pub mod step;
pub mod templates;

pub use chain::{ChainOutput, ChainRunner, StepOutput};
pub use coordinator::{BatchConfig, BatchConfigBuilder, BatchCoordinator, BatchResult, ChainSummary};
pub use retry::{Jitter, RetryPolicy, RetryPolicyBuilder};
pub use step::{StepCancelled, StepExecutor};
pub use templates::{PriorOutputs, StepTemplate, StepTemplates};
