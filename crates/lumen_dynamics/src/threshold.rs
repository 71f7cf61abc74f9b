//! Per-node adaptive activation thresholds.
//!
//! θ = clamp(baseline(kind) + Δrecency + Δquality + Δaffinity, θmin, θmax) × f_safety,
//! re-clamped afterwards. When the energy scale and the θ scale drift apart
//! by more than the guard ratio every node falls back to the default θ.

use lumen_core::config::ThresholdConfig;
use lumen_core::{Graph, Node, NodeId};
use serde::Serialize;
use std::collections::HashMap;

use crate::criticality::SafetyState;

/// Maximum recency discount, reached when a node was active this tick.
const RECENCY_MAX: f64 = 5.0;
const QUALITY_GAIN: f64 = 4.0;
const AFFINITY_GAIN: f64 = 2.0;

/// Smooth activation in (0, 1): σ(κ·(E − θ)).
pub fn soft_activation(energy: f64, threshold: f64, kappa: f64) -> f64 {
    lumen_core::numeric::sigmoid(kappa * (energy - threshold))
}

// ============================================================================
// Noise floor
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct NoiseStats {
    mean: f64,
    var: f64,
}

/// EMA estimate of each node's quiet-time energy level.
#[derive(Debug, Clone)]
pub struct NoiseTracker {
    alpha: f64,
    stats: HashMap<NodeId, NoiseStats>,
}

impl NoiseTracker {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(1e-4, 1.0),
            stats: HashMap::new(),
        }
    }

    pub fn observe(&mut self, id: &NodeId, energy: f64) {
        if !energy.is_finite() {
            return;
        }
        let a = self.alpha;
        let s = self.stats.entry(id.clone()).or_insert(NoiseStats {
            mean: energy,
            var: 0.0,
        });
        let diff = energy - s.mean;
        s.mean += a * diff;
        s.var = (1.0 - a) * (s.var + a * diff * diff);
    }

    /// μ + z·σ, or `None` before the node has been observed.
    pub fn statistical_floor(&self, id: &NodeId, z: f64) -> Option<f64> {
        self.stats.get(id).map(|s| s.mean + z * s.var.max(0.0).sqrt())
    }

    pub fn forget(&mut self, id: &NodeId) {
        self.stats.remove(id);
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

// ============================================================================
// Oracle
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ThresholdReport {
    pub updated: usize,
    pub activated: usize,
    pub min_theta: f64,
    pub max_theta: f64,
    pub scale_guard_tripped: bool,
}

#[derive(Debug, Clone)]
pub struct ThresholdOracle {
    config: ThresholdConfig,
    noise: NoiseTracker,
}

impl ThresholdOracle {
    pub fn new(config: ThresholdConfig) -> Self {
        let noise = NoiseTracker::new(config.noise_ema_alpha);
        Self { config, noise }
    }

    pub fn config(&self) -> &ThresholdConfig {
        &self.config
    }

    pub fn noise(&self) -> &NoiseTracker {
        &self.noise
    }

    /// Threshold for a single node, without side effects.
    pub fn compute(&self, node: &Node, safety: SafetyState, tick: u64) -> f64 {
        let c = &self.config;
        let mut baseline = c.baselines.for_kind(node.kind);
        if c.noise_floor_enabled {
            if let Some(floor) = self.noise.statistical_floor(&node.id, c.noise_z) {
                baseline = baseline.max(floor);
            }
        }

        let recency = match node.last_active_tick {
            Some(t) => {
                let since = tick.saturating_sub(t) as f64;
                -RECENCY_MAX * (-since / c.recency_horizon_ticks).exp()
            }
            None => 0.0,
        };
        let quality = (QUALITY_GAIN * finite_or_zero(node.quality)).clamp(0.0, QUALITY_GAIN);
        let affinity =
            (AFFINITY_GAIN * finite_or_zero(node.affinity)).clamp(-AFFINITY_GAIN, AFFINITY_GAIN);

        let raw = (baseline + recency + quality + affinity).clamp(c.theta_min, c.theta_max);
        (raw * safety.threshold_multiplier()).clamp(c.theta_min, c.theta_max)
    }

    /// Recompute every node's θ, refresh the recency signal and the noise
    /// statistics. Forces `default_theta` everywhere when the scale guard trips.
    pub fn update(&mut self, graph: &mut Graph, safety: SafetyState, tick: u64) -> ThresholdReport {
        let mut report = ThresholdReport::default();
        if graph.is_empty() {
            return report;
        }

        let proposed: Vec<f64> = graph.nodes().map(|n| self.compute(n, safety, tick)).collect();
        let energy_scale = energy_p95(graph);
        let theta_scale = proposed.iter().sum::<f64>() / proposed.len() as f64;

        report.scale_guard_tripped = !self.scale_compatible(energy_scale, theta_scale, &proposed);
        if report.scale_guard_tripped {
            tracing::warn!(
                "Threshold scale guard tripped (energy scale {:.3e}, theta scale {:.3e}), using default theta {}",
                energy_scale,
                theta_scale,
                self.config.default_theta
            );
        }

        report.min_theta = f64::INFINITY;
        report.max_theta = f64::NEG_INFINITY;
        for (node, theta) in graph.nodes_mut().zip(proposed) {
            let theta = if report.scale_guard_tripped {
                self.config.default_theta
            } else {
                theta
            };
            node.threshold = theta;
            report.min_theta = report.min_theta.min(theta);
            report.max_theta = report.max_theta.max(theta);
            report.updated += 1;

            if node.is_active() {
                node.last_active_tick = Some(tick);
                report.activated += 1;
            } else if self.config.noise_floor_enabled {
                self.noise.observe(&node.id, node.energy);
            }
        }
        report
    }

    fn scale_compatible(&self, energy_scale: f64, theta_scale: f64, proposed: &[f64]) -> bool {
        if !energy_scale.is_finite() || !theta_scale.is_finite() {
            return false;
        }
        if proposed.iter().any(|t| !t.is_finite()) {
            return false;
        }
        if energy_scale <= 0.0 || theta_scale <= 0.0 {
            return true;
        }
        let ratio = (energy_scale / theta_scale).max(theta_scale / energy_scale);
        ratio <= self.config.scale_guard_ratio
    }
}

/// 95th percentile of the positive energies, 0.0 when nothing is charged.
fn energy_p95(graph: &Graph) -> f64 {
    let mut energies: Vec<f64> = graph.nodes().map(|n| n.energy).filter(|e| *e != 0.0).collect();
    if energies.is_empty() {
        return 0.0;
    }
    if energies.iter().any(|e| !e.is_finite()) {
        return f64::NAN;
    }
    energies.sort_by(|a, b| a.total_cmp(b));
    let idx = ((energies.len() - 1) as f64 * 0.95).round() as usize;
    energies[idx]
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}
