//! Bounded retry with exponential backoff and jitter around a remote call.

use std::future::Future;
use std::time::Duration;

use derive_builder::Builder;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY, REMOTE_CALL_TIMEOUT};
use crate::error::{InvokeError, RemoteError};

/// How the exponential backoff cap is turned into an actual sleep
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Jitter {
    /// Sleep a uniformly random duration in `[0, cap]`
    #[default]
    Full,
    /// Sleep exactly the cap
    None,
}

#[derive(Debug, Clone, Builder)]
pub struct RetryPolicy {
    /// Total calls allowed, including the first one
    #[builder(default = "DEFAULT_MAX_ATTEMPTS")]
    pub max_attempts: u32,
    #[builder(default = "DEFAULT_BASE_DELAY")]
    pub base_delay: Duration,
    #[builder(default = "DEFAULT_MAX_DELAY")]
    pub max_delay: Duration,
    #[builder(default)]
    pub jitter: Jitter,
    /// Per-call timeout; an elapsed call counts as a transient failure
    #[builder(default = "Some(REMOTE_CALL_TIMEOUT)")]
    pub call_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter: Jitter::Full,
            call_timeout: Some(REMOTE_CALL_TIMEOUT),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the sleep that follows failed attempt `attempt` (0-based)
    pub fn backoff_cap(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Sleep to take after failed attempt `attempt` (0-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let cap = self.backoff_cap(attempt);
        match self.jitter {
            Jitter::None => cap,
            Jitter::Full => {
                let cap_ms = cap.as_millis() as u64;
                Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
            }
        }
    }

    /// Sum of every backoff cap the policy can sleep through
    pub fn total_backoff_bound(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| self.backoff_cap(attempt))
            .sum()
    }
}

/// Run `call` until it succeeds, fails fatally, exhausts the policy or is cancelled
///
/// `call` receives the 1-based attempt number. Both the call and the backoff
/// sleep race `cancel`, so cancellation is observed promptly at either
/// suspension point and reported as [`InvokeError::Cancelled`].
pub async fn invoke<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, InvokeError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(InvokeError::Cancelled { attempts: attempt });
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(InvokeError::Cancelled { attempts: attempt + 1 });
            }
            result = call_with_timeout(policy.call_timeout, call(attempt + 1)) => result,
        };

        let error = match result {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let attempts = attempt + 1;
        if !error.is_retryable() {
            warn!(attempts, error = %error, "remote call failed with non-retryable error");
            return Err(InvokeError::Remote {
                attempts,
                source: error,
            });
        }
        if attempts >= max_attempts {
            warn!(attempts, error = %error, "remote call failed, retries exhausted");
            return Err(InvokeError::Remote {
                attempts,
                source: error,
            });
        }

        let delay = policy.backoff_delay(attempt);
        debug!(
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "remote call failed, backing off"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(InvokeError::Cancelled { attempts });
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    unreachable!("Retry loop should always return");
}

async fn call_with_timeout<T, Fut>(timeout: Option<Duration>, fut: Fut) -> Result<T, RemoteError>
where
    Fut: Future<Output = Result<T, RemoteError>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient(format!(
                "remote call timed out after {} seconds",
                limit.as_secs()
            ))),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicyBuilder::default()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(800))
            .build()
            .unwrap()
    }

    #[test]
    fn test_backoff_cap_grows_then_saturates() {
        let policy = fast_policy(10);
        let caps: Vec<u64> = (0..6)
            .map(|attempt| policy.backoff_cap(attempt).as_millis() as u64)
            .collect();
        assert_eq!(caps, vec![100, 200, 400, 800, 800, 800]);

        // Large exponents must not overflow
        assert_eq!(policy.backoff_cap(64), Duration::from_millis(800));
    }

    #[test]
    fn test_full_jitter_stays_within_cap() {
        let policy = fast_policy(10);
        for attempt in 0..8 {
            for _ in 0..50 {
                assert!(policy.backoff_delay(attempt) <= policy.backoff_cap(attempt));
            }
        }
    }

    #[test]
    fn test_total_backoff_bound() {
        let policy = fast_policy(4);
        // Three sleeps: 100 + 200 + 400
        assert_eq!(policy.total_backoff_bound(), Duration::from_millis(700));
    }

    #[test]
    fn test_builder_defaults() {
        let policy = RetryPolicyBuilder::default().build().unwrap();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.jitter, Jitter::Full);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result = invoke(&fast_policy(5), &cancel, |attempt| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(RemoteError::Transient("rate limited".to_string()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result, Ok("done"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_makes_exactly_max_attempts_within_backoff_bound() {
        let policy = fast_policy(10);
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let result: Result<(), _> = invoke(&policy, &cancel, |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Transient("503".to_string()))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(
            result,
            Err(InvokeError::Remote {
                attempts: 10,
                source: RemoteError::Transient("503".to_string()),
            })
        );
        assert!(started.elapsed() <= policy.total_backoff_bound());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let cancel = CancellationToken::new();

        let result: Result<(), _> = invoke(&fast_policy(10), &cancel, |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Fatal("401 unauthorized".to_string()))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(InvokeError::Remote {
                attempts: 1,
                source: RemoteError::Fatal(_)
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_transient_failure() {
        let policy = RetryPolicyBuilder::default()
            .max_attempts(2)
            .base_delay(Duration::from_millis(10))
            .max_delay(Duration::from_millis(10))
            .call_timeout(Some(Duration::from_secs(1)))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();

        let result: Result<(), _> = invoke(&policy, &cancel, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            result,
            Err(InvokeError::Remote {
                attempts: 2,
                source: RemoteError::Transient(_)
            })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff_sleep() {
        let policy = RetryPolicyBuilder::default()
            .max_attempts(5)
            .base_delay(Duration::from_secs(60))
            .max_delay(Duration::from_secs(60))
            .jitter(Jitter::None)
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result: Result<(), _> = invoke(&policy, &cancel, |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Transient("503".to_string()))
            }
        })
        .await;

        assert_eq!(result, Err(InvokeError::Cancelled { attempts: 1 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_in_flight_call() {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        let result: Result<(), _> = invoke(&fast_policy(3), &cancel, move |_| {
            let canceller = canceller.clone();
            async move {
                canceller.cancel();
                std::future::pending::<()>().await;
                Ok(())
            }
        })
        .await;

        assert_eq!(result, Err(InvokeError::Cancelled { attempts: 1 }));
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_calls() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), _> = invoke(&fast_policy(3), &cancel, |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(result, Err(InvokeError::Cancelled { attempts: 0 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
