//! Configuration constants for the chain executor
//!
//! This module centralizes all tunable parameters and defaults used throughout
//! the application.

use std::time::Duration;

// ============================================================================
// Retry Configuration
// ============================================================================

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound for a single backoff sleep
///
/// Full jitter draws from `[0, min(MAX, base * 2^attempt)]`, so with the
/// default base delay the cap is reached from the sixth retry onwards.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Timeout for an individual remote completion call
///
/// Long completions with large `max_tokens` can legitimately take over a
/// minute. A call that exceeds this is treated as a transient failure and
/// retried under the normal backoff schedule.
pub const REMOTE_CALL_TIMEOUT: Duration = Duration::from_secs(120); // 2 minutes

// ============================================================================
// Remote Endpoint Configuration
// ============================================================================

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub const DEFAULT_TEMPERATURE: f32 = 0.7;

pub const DEFAULT_MAX_TOKENS: u32 = 1024;

pub const DEFAULT_TOP_P: f32 = 1.0;

// ============================================================================
// Batch Configuration
// ============================================================================

/// Number of chains a batch drives at once
///
/// Steps inside a chain are sequential, so this is the effective number of
/// in-flight remote calls for a batch.
pub const DEFAULT_CHAIN_CONCURRENCY: usize = 8;

// ============================================================================
// Persistence Configuration
// ============================================================================

pub const STEP_OUTCOMES_TABLE: &str = "step_outcomes";

pub const DEFAULT_DATABASE_URL: &str = "sqlite://chains.db?mode=rwc";
