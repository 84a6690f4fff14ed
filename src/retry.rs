//! Caller-side timeouts and bounded exponential backoff for external calls.
//!
//! Every market client call goes through [`RetryPolicy::run`]: each attempt is
//! bounded by `call_timeout_ms`, failures back off exponentially with jitter,
//! and after `max_attempts` the call fails loudly with [`RetryExhausted`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// 0.0-1.0; 0.2 means +-20%.
    pub jitter_factor: f64,
    pub call_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff_ms: 500,
            max_backoff_ms: 8_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            call_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Error)]
#[error("{op} failed after {attempts} attempt(s): {last_error}")]
pub struct RetryExhausted {
    pub op: String,
    pub attempts: u32,
    pub last_error: String,
}

impl RetryPolicy {
    /// Delay to wait after the `attempt`-th failure (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        backoff_delay(
            self.initial_backoff_ms,
            self.max_backoff_ms,
            self.backoff_multiplier,
            self.jitter_factor,
            attempt,
        )
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub async fn run<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, RetryExhausted>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match tokio::time::timeout(self.call_timeout(), call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => last_error = format!("{e:#}"),
                Err(_) => last_error = format!("timed out after {}ms", self.call_timeout_ms),
            }
            if attempt < attempts {
                let delay = self.backoff_for(attempt);
                warn!(op, attempt, delay_ms = delay.as_millis() as u64, error = %last_error, "retrying external call");
                tokio::time::sleep(delay).await;
            }
        }
        Err(RetryExhausted {
            op: op.to_string(),
            attempts,
            last_error,
        })
    }
}

/// Exponential backoff with symmetric jitter, capped at `max_ms`.
pub fn backoff_delay(initial_ms: u64, max_ms: u64, multiplier: f64, jitter: f64, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(32) as i32;
    let base = (initial_ms as f64 * multiplier.max(1.0).powi(exp)).min(max_ms as f64);
    let jitter = jitter.clamp(0.0, 1.0);
    let factor = if jitter > 0.0 {
        1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
    } else {
        1.0
    };
    Duration::from_millis((base * factor).max(0.0).min(max_ms as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 4,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            call_timeout_ms: 50,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let p = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff_for(1), Duration::from_millis(100));
        assert_eq!(p.backoff_for(2), Duration::from_millis(200));
        assert_eq!(p.backoff_for(3), Duration::from_millis(400));
        assert_eq!(p.backoff_for(10), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = fast_policy(3)
            .run("flaky", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        anyhow::bail!("transient {n}")
                    }
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_at_the_ceiling() {
        let calls = AtomicU32::new(0);
        let err = fast_policy(2)
            .run("down", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("boom")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert!(err.last_error.contains("boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let err = fast_policy(1)
            .run("slow", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(err.last_error.contains("timed out"));
    }
}
