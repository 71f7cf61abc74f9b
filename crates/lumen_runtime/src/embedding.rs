//! Embedding adapters: timeout plus circuit breaker around any [`Embedder`],
//! and a deterministic feature-hashing embedder for demos and tests.

use async_trait::async_trait;
use lumen_core::config::EmbeddingConfig;
use lumen_core::{Embedder, EmbeddingError};
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

// ============================================================================
// Circuit breaker
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    /// Cooldown elapsed; one trial call is allowed through.
    HalfOpen,
}

/// Opens after `failure_threshold` consecutive failures, stays open for
/// `cooldown`, then lets a single trial through.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    pub fn state(&self, now: Instant) -> BreakerState {
        match self.opened_at {
            None => BreakerState::Closed,
            Some(t) if now.saturating_duration_since(t) >= self.cooldown => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }

    /// Ask permission for one call.
    pub fn try_acquire(&mut self, now: Instant) -> Result<(), EmbeddingError> {
        match self.state(now) {
            BreakerState::Closed => Ok(()),
            BreakerState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                tracing::debug!("Embedding circuit half-open, allowing trial call");
                Ok(())
            }
            _ => Err(EmbeddingError::CircuitOpen(self.remaining(now).as_secs_f64())),
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.opened_at
            .map(|t| self.cooldown.saturating_sub(now.saturating_duration_since(t)))
            .unwrap_or_default()
    }

    pub fn record_success(&mut self) {
        if self.opened_at.is_some() {
            tracing::info!("Embedding circuit closed");
        }
        self.consecutive_failures = 0;
        self.opened_at = None;
        self.trial_in_flight = false;
    }

    pub fn record_failure(&mut self, now: Instant) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.trial_in_flight {
            // Failed trial: back to a full cooldown.
            self.trial_in_flight = false;
            self.opened_at = Some(now);
            tracing::warn!("Embedding trial call failed, circuit re-opened");
        } else if self.opened_at.is_none() && self.consecutive_failures >= self.failure_threshold {
            self.opened_at = Some(now);
            tracing::warn!(
                "Embedding circuit opened after {} consecutive failures (cooldown {:.0}s)",
                self.consecutive_failures,
                self.cooldown.as_secs_f64()
            );
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

// ============================================================================
// Guarded embedder
// ============================================================================

pub struct GuardedEmbedder {
    inner: Arc<dyn Embedder>,
    timeout: Duration,
    breaker: Mutex<CircuitBreaker>,
}

impl GuardedEmbedder {
    pub fn new(inner: Arc<dyn Embedder>, config: &EmbeddingConfig) -> Self {
        Self {
            inner,
            timeout: Duration::from_secs_f64(config.timeout_secs.max(0.001)),
            breaker: Mutex::new(CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_secs_f64(config.cooldown_secs.max(0.0)),
            )),
        }
    }

    pub async fn state(&self) -> BreakerState {
        self.breaker.lock().await.state(Instant::now())
    }

    /// Embed with timeout and breaker. Errors mean the caller should fall
    /// back to the degraded candidate search.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.breaker.lock().await.try_acquire(Instant::now())?;

        let outcome = match tokio::time::timeout(self.timeout, self.inner.embed(text)).await {
            Ok(Ok(v)) if v.iter().all(|x| x.is_finite()) => Ok(v),
            Ok(Ok(_)) => Err(EmbeddingError::Backend("non-finite embedding".to_string())),
            Ok(Err(e)) => Err(EmbeddingError::Backend(format!("{:#}", e))),
            Err(_) => Err(EmbeddingError::Timeout(self.timeout.as_secs_f64())),
        };

        let mut breaker = self.breaker.lock().await;
        match &outcome {
            Ok(_) => breaker.record_success(),
            Err(e) => {
                tracing::warn!("Embedding failed: {}", e);
                breaker.record_failure(Instant::now());
            }
        }
        outcome
    }

    pub fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }
}

// ============================================================================
// Hash embedder
// ============================================================================

/// Feature-hashing bag of words. Same text, same vector, every run.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimensions];
        for token in tokenize(text) {
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let h = hasher.finish();
            let slot = (h % self.dimensions as u64) as usize;
            let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
            v[slot] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Lowercased alphanumeric runs.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyEmbedder {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("backend down")
            }
            Ok(vec![1.0, 0.0])
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    struct SlowEmbedder;

    #[async_trait]
    impl Embedder for SlowEmbedder {
        async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(vec![1.0])
        }

        fn dimensions(&self) -> usize {
            1
        }
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let mut b = CircuitBreaker::new(3, Duration::from_secs(30));
        let t0 = Instant::now();
        for _ in 0..2 {
            b.record_failure(t0);
        }
        assert_eq!(b.state(t0), BreakerState::Closed);
        b.record_failure(t0);
        assert_eq!(b.state(t0), BreakerState::Open);
        assert!(matches!(b.try_acquire(t0), Err(EmbeddingError::CircuitOpen(_))));
    }

    #[test]
    fn test_breaker_half_open_single_trial() {
        let mut b = CircuitBreaker::new(1, Duration::from_secs(30));
        let t0 = Instant::now();
        b.record_failure(t0);
        let later = t0 + Duration::from_secs(31);
        assert_eq!(b.state(later), BreakerState::HalfOpen);
        assert!(b.try_acquire(later).is_ok());
        assert!(b.try_acquire(later).is_err());
        b.record_success();
        assert_eq!(b.state(later), BreakerState::Closed);
    }

    #[test]
    fn test_failed_trial_reopens() {
        let mut b = CircuitBreaker::new(1, Duration::from_secs(30));
        let t0 = Instant::now();
        b.record_failure(t0);
        let later = t0 + Duration::from_secs(31);
        assert!(b.try_acquire(later).is_ok());
        b.record_failure(later);
        assert_eq!(b.state(later + Duration::from_secs(1)), BreakerState::Open);
    }

    #[tokio::test]
    async fn test_guarded_embedder_stops_calling_when_open() {
        let inner = Arc::new(FlakyEmbedder {
            calls: AtomicU32::new(0),
            fail: true,
        });
        let guarded = GuardedEmbedder::new(inner.clone(), &EmbeddingConfig::default());
        for _ in 0..3 {
            assert!(matches!(guarded.embed("x").await, Err(EmbeddingError::Backend(_))));
        }
        assert_eq!(guarded.state().await, BreakerState::Open);
        assert!(matches!(guarded.embed("x").await, Err(EmbeddingError::CircuitOpen(_))));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_embedder_times_out() {
        let guarded = GuardedEmbedder::new(Arc::new(SlowEmbedder), &EmbeddingConfig::default());
        let err = guarded.embed("x").await.unwrap_err();
        assert_eq!(err, EmbeddingError::Timeout(2.0));
    }

    #[tokio::test]
    async fn test_guarded_embedder_passes_through() {
        let inner = Arc::new(FlakyEmbedder {
            calls: AtomicU32::new(0),
            fail: false,
        });
        let guarded = GuardedEmbedder::new(inner, &EmbeddingConfig::default());
        assert_eq!(guarded.embed("x").await.unwrap(), vec![1.0, 0.0]);
        assert_eq!(guarded.dimensions(), 2);
    }

    #[test]
    fn test_hash_embedder_is_deterministic_and_normalized() {
        let e = HashEmbedder::new(32);
        let a = e.embed_sync("Energy flows through the graph");
        let b = e.embed_sync("energy flows through the graph");
        assert_eq!(a, b);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(e.embed_sync("").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_tokenize() {
        let t: Vec<String> = tokenize("Hello, graph-world! 42").collect();
        assert_eq!(t, vec!["hello", "graph", "world", "42"]);
    }
}
