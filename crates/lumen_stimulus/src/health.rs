//! Learned budget modulation from system health, f(ρ).
//!
//! Every frame contributes an observation (ρ proxy, flip yield, activation
//! entropy, overflow). Each raw score is rank-normalized within its own
//! rolling cohort, combined by geometric mean into a quality score, and a
//! non-increasing isotonic map ρ → quality is refit periodically.

use lumen_core::config::StimulusConfig;
use lumen_core::numeric::rank_fraction;
use serde::Serialize;
use std::collections::VecDeque;

use crate::isotonic::IsotonicFit;

/// Guards the yield denominator when nothing was spent.
const BUDGET_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FrameObservation {
    pub rho_proxy: f64,
    pub yield_score: f64,
    pub entropy_score: f64,
    pub overflow_score: f64,
    pub quality: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub observations: usize,
    pub trained: bool,
    pub trained_at: usize,
    pub rho_range: Option<(f64, f64)>,
}

#[derive(Debug, Clone)]
pub struct HealthModulator {
    history: usize,
    min_samples: usize,
    retrain_every: usize,
    observations: VecDeque<FrameObservation>,
    yields: VecDeque<f64>,
    entropies: VecDeque<f64>,
    overflows: VecDeque<f64>,
    model: Option<IsotonicFit>,
    since_train: usize,
    trained_at: usize,
}

impl HealthModulator {
    pub fn new(config: &StimulusConfig) -> Self {
        Self::with_limits(
            config.health_history,
            config.health_min_samples,
            config.health_retrain_every,
        )
    }

    pub fn with_limits(history: usize, min_samples: usize, retrain_every: usize) -> Self {
        let history = history.max(min_samples).max(2);
        Self {
            history,
            min_samples,
            retrain_every: retrain_every.max(1),
            observations: VecDeque::with_capacity(history),
            yields: VecDeque::with_capacity(history),
            entropies: VecDeque::with_capacity(history),
            overflows: VecDeque::with_capacity(history),
            model: None,
            since_train: 0,
            trained_at: 0,
        }
    }

    /// Cheap spectral-radius proxy: max out-degree × mean ease / active nodes.
    pub fn rho_proxy(max_degree: usize, avg_weight: f64, active: usize) -> f64 {
        if active == 0 {
            return 0.0;
        }
        max_degree as f64 * avg_weight / active as f64
    }

    /// Record one frame; returns its quality score.
    pub fn add_observation(
        &mut self,
        rho_proxy: f64,
        flips: usize,
        budget_spent: f64,
        activation_entropy: f64,
        overflow: bool,
    ) -> f64 {
        let flip_yield = flips as f64 / (budget_spent.max(0.0) + BUDGET_EPSILON);
        let overflow_raw = if overflow { 0.0 } else { 1.0 };
        let entropy_raw = if activation_entropy.is_finite() {
            activation_entropy
        } else {
            0.0
        };

        push(&mut self.yields, flip_yield, self.history);
        push(&mut self.entropies, entropy_raw, self.history);
        push(&mut self.overflows, overflow_raw, self.history);

        let yield_score = rank_fraction(flip_yield, &self.yields);
        let entropy_score = rank_fraction(entropy_raw, &self.entropies);
        let overflow_score = rank_fraction(overflow_raw, &self.overflows);
        let quality = (yield_score * entropy_score * overflow_score).cbrt();

        let obs = FrameObservation {
            rho_proxy: if rho_proxy.is_finite() { rho_proxy } else { 0.0 },
            yield_score,
            entropy_score,
            overflow_score,
            quality,
        };
        if self.observations.len() >= self.history {
            self.observations.pop_front();
        }
        self.observations.push_back(obs);
        self.since_train += 1;

        let due = self.model.is_none() || self.since_train >= self.retrain_every;
        if self.observations.len() >= self.min_samples && due {
            self.train();
        }
        quality
    }

    fn train(&mut self) {
        let points: Vec<(f64, f64)> = self
            .observations
            .iter()
            .map(|o| (o.rho_proxy, o.quality))
            .collect();
        self.model = IsotonicFit::fit_non_increasing(&points);
        self.since_train = 0;
        self.trained_at = self.observations.len();
        if let Some(model) = &self.model {
            let (lo, hi) = model.domain();
            tracing::info!(
                "Health model trained on {} samples (rho range [{:.3}, {:.3}])",
                self.observations.len(),
                lo,
                hi
            );
        }
    }

    /// f(ρ) ∈ [0.5, 1.5]; exactly 1.0 until trained.
    pub fn modulate(&self, rho_proxy: f64) -> f64 {
        if self.observations.len() < self.min_samples {
            return 1.0;
        }
        let Some(model) = &self.model else {
            return 1.0;
        };
        let q = model.predict(rho_proxy);
        if !q.is_finite() {
            return 1.0;
        }
        (0.5 + q).clamp(0.5, 1.5)
    }

    pub fn is_trained(&self) -> bool {
        self.model.is_some() && self.observations.len() >= self.min_samples
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn stats(&self) -> HealthStats {
        let rho_range = self.observations.iter().map(|o| o.rho_proxy).fold(None, |acc, r| {
            Some(match acc {
                None => (r, r),
                Some((lo, hi)) => (f64::min(lo, r), f64::max(hi, r)),
            })
        });
        HealthStats {
            observations: self.observations.len(),
            trained: self.is_trained(),
            trained_at: self.trained_at,
            rho_range,
        }
    }

    pub fn reset(&mut self) {
        self.observations.clear();
        self.yields.clear();
        self.entropies.clear();
        self.overflows.clear();
        self.model = None;
        self.since_train = 0;
        self.trained_at = 0;
    }
}

fn push(buf: &mut VecDeque<f64>, value: f64, cap: usize) {
    if buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(m: &mut HealthModulator, n: usize) {
        for i in 0..n {
            // Low ρ frames flip more than high ρ frames.
            let rho = (i % 10) as f64 * 0.2;
            let flips = 10 - (i % 10);
            m.add_observation(rho, flips, 1.0, 1.0 + (i % 3) as f64, i % 10 == 9);
        }
    }

    #[test]
    fn test_neutral_before_min_samples() {
        let mut m = HealthModulator::new(&StimulusConfig::default());
        feed(&mut m, 199);
        assert_eq!(m.modulate(0.0), 1.0);
        assert_eq!(m.modulate(5.0), 1.0);
        assert!(!m.is_trained());
    }

    #[test]
    fn test_trains_at_min_samples_and_is_monotone() {
        let mut m = HealthModulator::new(&StimulusConfig::default());
        feed(&mut m, 200);
        assert!(m.is_trained());
        let low = m.modulate(0.0);
        let high = m.modulate(1.8);
        assert!(low >= high);
        assert!((0.5..=1.5).contains(&low));
        assert!((0.5..=1.5).contains(&high));
    }

    #[test]
    fn test_history_is_bounded() {
        let mut m = HealthModulator::with_limits(50, 20, 5);
        feed(&mut m, 300);
        assert_eq!(m.len(), 50);
        assert_eq!(m.stats().observations, 50);
    }

    #[test]
    fn test_rho_proxy() {
        assert_eq!(HealthModulator::rho_proxy(4, 0.5, 0), 0.0);
        assert!((HealthModulator::rho_proxy(4, 0.5, 2) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_reset() {
        let mut m = HealthModulator::with_limits(50, 20, 5);
        feed(&mut m, 30);
        m.reset();
        assert!(m.is_empty());
        assert_eq!(m.modulate(0.0), 1.0);
    }
}
