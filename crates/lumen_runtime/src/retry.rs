//! Retry with exponential backoff and jitter for collaborator calls.
//!
//! Every error is treated as transient; callers that can tell permanent
//! failures apart should not wrap those calls.

use anyhow::Result;
use lumen_core::config::PersistenceConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Random extra delay, as a fraction of the base delay.
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter_fraction: 0.2,
        }
    }
}

impl From<&PersistenceConfig> for RetryConfig {
    fn from(c: &PersistenceConfig) -> Self {
        Self {
            max_attempts: c.max_attempts.max(1),
            initial_delay: Duration::from_secs_f64(c.initial_backoff_secs.max(0.0)),
            max_delay: Duration::from_secs_f64(c.max_backoff_secs.max(0.0)),
            backoff_factor: 2.0,
            jitter_fraction: c.jitter_fraction.clamp(0.0, 1.0),
        }
    }
}

impl RetryConfig {
    /// Base delay before retry number `retry` (1-based), without jitter.
    pub fn backoff(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1).min(30) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// `backoff(retry)` plus up to `jitter_fraction` of it.
    pub fn backoff_with_jitter(&self, retry: u32) -> Duration {
        with_jitter(self.backoff(retry), self.jitter_fraction)
    }
}

pub fn with_jitter(base: Duration, fraction: f64) -> Duration {
    if fraction <= 0.0 || base.is_zero() {
        return base;
    }
    let extra = rand::thread_rng().gen_range(0.0..=fraction);
    base.mul_f64(1.0 + extra)
}

/// Run `operation` until it succeeds or `max_attempts` is exhausted.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, label: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!("{} succeeded on attempt {}", label, attempt);
                }
                return Ok(value);
            }
            Err(e) => {
                tracing::warn!("{} failed on attempt {}/{}: {:#}", label, attempt, attempts, e);
                last_error = Some(e);
            }
        }

        if attempt < attempts {
            let sleep_time = config.backoff_with_jitter(attempt);
            tracing::debug!(
                "{} retrying in {:.2}s (attempt {}/{})",
                label,
                sleep_time.as_secs_f64(),
                attempt + 1,
                attempts
            );
            tokio::time::sleep(sleep_time).await;
        }
    }

    let last = last_error.map(|e| format!("{:#}", e)).unwrap_or_else(|| "unknown".to_string());
    anyhow::bail!("{}: all {} attempts exhausted. Last error: {}", label, attempts, last)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            ..Default::default()
        };
        assert_eq!(cfg.backoff(1), Duration::from_secs(1));
        assert_eq!(cfg.backoff(2), Duration::from_secs(2));
        assert_eq!(cfg.backoff(3), Duration::from_secs(4));
        assert_eq!(cfg.backoff(4), Duration::from_secs(5));
        assert_eq!(cfg.backoff(100), Duration::from_secs(5));
    }

    #[test]
    fn test_jitter_bounds() {
        let base = Duration::from_secs(2);
        for _ in 0..100 {
            let d = with_jitter(base, 0.2);
            assert!(d >= base);
            assert!(d <= base.mul_f64(1.2));
        }
        assert_eq!(with_jitter(base, 0.0), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let mut calls = 0u32;
        let result = with_retry(&RetryConfig::default(), "store", || {
            calls += 1;
            let n = calls;
            async move {
                if n < 3 {
                    anyhow::bail!("transient {}", n)
                }
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let mut calls = 0u32;
        let result: Result<()> = with_retry(&RetryConfig::default(), "store", || {
            calls += 1;
            async { anyhow::bail!("down") }
        })
        .await;
        let err = result.unwrap_err().to_string();
        assert!(err.contains("exhausted"));
        assert!(err.contains("down"));
        assert_eq!(calls, 3);
    }
}
