//! Per-source budget gate, g(source).
//!
//! Sources whose stimuli historically flip more nodes per unit budget get a
//! larger share. Observations live in a rolling time window per `SourceKey`.

use chrono::{DateTime, Duration, Utc};
use lumen_core::numeric::rank_fraction;
use lumen_core::SourceKey;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

const BUDGET_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Copy)]
struct SourceObservation {
    at: DateTime<Utc>,
    flip_yield: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub observations: usize,
    pub avg_yield: f64,
    pub modulation: f64,
}

#[derive(Debug, Clone)]
pub struct SourceImpactGate {
    window: Duration,
    min_samples: usize,
    observations: HashMap<SourceKey, VecDeque<SourceObservation>>,
}

impl SourceImpactGate {
    pub fn new(window_secs: f64, min_samples: usize) -> Self {
        let window = Duration::milliseconds((window_secs.max(0.0) * 1000.0) as i64);
        Self {
            window,
            min_samples,
            observations: HashMap::new(),
        }
    }

    pub fn record(&mut self, source: &SourceKey, flips: usize, budget_spent: f64, at: DateTime<Utc>) {
        let flip_yield = flips as f64 / (budget_spent.max(0.0) + BUDGET_EPSILON);
        let obs = self.observations.entry(source.clone()).or_default();
        obs.push_back(SourceObservation { at, flip_yield });
        tracing::debug!("Source {} recorded yield {:.3}", source, flip_yield);
        self.prune(at);
    }

    /// Drop everything older than the window, across all sources.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        for obs in self.observations.values_mut() {
            while obs.front().is_some_and(|o| o.at < cutoff) {
                obs.pop_front();
            }
        }
        self.observations.retain(|_, obs| !obs.is_empty());
    }

    /// g(source) ∈ [0.5, 1.5]: 0.5 + rank of this source's mean yield within
    /// every yield still inside the window at `now`. 1.0 while the source is
    /// bootstrapping.
    pub fn modulate(&mut self, source: &SourceKey, now: DateTime<Utc>) -> f64 {
        self.prune(now);
        self.score(source)
    }

    fn score(&self, source: &SourceKey) -> f64 {
        let Some(own) = self.observations.get(source) else {
            return 1.0;
        };
        if own.len() < self.min_samples {
            return 1.0;
        }
        let avg = own.iter().map(|o| o.flip_yield).sum::<f64>() / own.len() as f64;
        let cohort: Vec<f64> = self
            .observations
            .values()
            .flatten()
            .map(|o| o.flip_yield)
            .collect();
        if cohort.len() < 2 {
            return 1.0;
        }
        (0.5 + rank_fraction(avg, &cohort)).clamp(0.5, 1.5)
    }

    pub fn samples(&self, source: &SourceKey) -> usize {
        self.observations.get(source).map_or(0, VecDeque::len)
    }

    pub fn stats(&self) -> Vec<SourceStats> {
        let mut stats: Vec<SourceStats> = self
            .observations
            .iter()
            .map(|(key, obs)| SourceStats {
                source: key.to_string(),
                observations: obs.len(),
                avg_yield: obs.iter().map(|o| o.flip_yield).sum::<f64>() / obs.len().max(1) as f64,
                modulation: self.score(key),
            })
            .collect();
        stats.sort_by(|a, b| a.source.cmp(&b.source));
        stats
    }

    pub fn reset(&mut self) {
        self.observations.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::SourceType;

    #[test]
    fn test_bootstrap_is_neutral() {
        let mut gate = SourceImpactGate::new(604_800.0, 50);
        let key = SourceKey::of(SourceType::UserMessage);
        let now = Utc::now();
        for _ in 0..49 {
            gate.record(&key, 5, 1.0, now);
        }
        assert_eq!(gate.modulate(&key, now), 1.0);
        assert_eq!(gate.modulate(&SourceKey::of(SourceType::Document), now), 1.0);
    }

    #[test]
    fn test_productive_source_ranks_higher() {
        let mut gate = SourceImpactGate::new(604_800.0, 10);
        let good = SourceKey::of(SourceType::UserMessage);
        let poor = SourceKey::of(SourceType::Observation);
        let now = Utc::now();
        for _ in 0..10 {
            gate.record(&good, 8, 1.0, now);
            gate.record(&poor, 1, 1.0, now);
        }
        let g_good = gate.modulate(&good, now);
        let g_poor = gate.modulate(&poor, now);
        assert!(g_good > g_poor);
        assert!((0.5..=1.5).contains(&g_good));
        assert!((0.5..=1.5).contains(&g_poor));
    }

    #[test]
    fn test_window_prunes_old_observations() {
        let mut gate = SourceImpactGate::new(60.0, 1);
        let key = SourceKey::new(SourceType::ToolResult, "search");
        let t0 = Utc::now();
        gate.record(&key, 1, 1.0, t0);
        gate.record(&key, 1, 1.0, t0 + Duration::seconds(30));
        assert_eq!(gate.samples(&key), 2);
        gate.record(&key, 1, 1.0, t0 + Duration::seconds(100));
        assert_eq!(gate.samples(&key), 1);
    }

    #[test]
    fn test_scopes_are_independent() {
        let mut gate = SourceImpactGate::new(604_800.0, 1);
        let a = SourceKey::new(SourceType::ToolResult, "search");
        let b = SourceKey::new(SourceType::ToolResult, "shell");
        gate.record(&a, 1, 1.0, Utc::now());
        assert_eq!(gate.samples(&a), 1);
        assert_eq!(gate.samples(&b), 0);
    }

    #[test]
    fn test_quiet_source_expires_before_scoring() {
        let mut gate = SourceImpactGate::new(60.0, 2);
        let good = SourceKey::of(SourceType::UserMessage);
        let poor = SourceKey::of(SourceType::Observation);
        let t0 = Utc::now();
        for _ in 0..3 {
            gate.record(&good, 8, 1.0, t0);
            gate.record(&poor, 1, 1.0, t0);
        }
        assert!(gate.modulate(&good, t0) > 1.0);

        // Nothing recorded since; both histories have aged out.
        let later = t0 + Duration::seconds(120);
        assert_eq!(gate.modulate(&good, later), 1.0);
        assert_eq!(gate.samples(&poor), 0);
        assert_eq!(gate.samples(&good), 0);
    }
}
