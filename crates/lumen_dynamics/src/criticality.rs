//! Spectral-radius estimation and feedback control of the decay/diffusion levers.
//!
//! The effective propagation operator is `T = (1−δ)[(1−α)I + αPᵀ]` with `P`
//! the row-normalized link-ease matrix. Its spectral radius ρ says whether
//! activity dies out (ρ < 1), persists (ρ ≈ 1) or runs away (ρ > 1). The
//! controller nudges δ (and optionally α) so that ρ tracks a target.

use lumen_core::config::CriticalityConfig;
use lumen_core::{Graph, NodeId};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// Norms below this are treated as a vanished vector.
const NORM_EPSILON: f64 = 1e-10;

// ============================================================================
// Safety classification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyState {
    Dying,
    Subcritical,
    Critical,
    Supercritical,
}

impl SafetyState {
    pub fn from_rho(rho: f64) -> Self {
        if rho < 0.5 {
            SafetyState::Dying
        } else if rho < 0.8 {
            SafetyState::Subcritical
        } else if rho < 1.2 {
            SafetyState::Critical
        } else {
            SafetyState::Supercritical
        }
    }

    /// Threshold scaling: lower thresholds when activity is dying out,
    /// raise them when it is running away.
    pub fn threshold_multiplier(self) -> f64 {
        match self {
            SafetyState::Dying => 0.85,
            SafetyState::Subcritical => 0.95,
            SafetyState::Critical => 1.0,
            SafetyState::Supercritical => 1.1,
        }
    }
}

impl fmt::Display for SafetyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SafetyState::Dying => "dying",
            SafetyState::Subcritical => "subcritical",
            SafetyState::Critical => "critical",
            SafetyState::Supercritical => "supercritical",
        };
        f.write_str(s)
    }
}

/// Coarse phase label combining ρ with an optional coherence score C ∈ [0, 1].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalityMode {
    Subcritical,
    Flow,
    GenerativeOverflow,
    ChaoticRacing,
    Mixed,
}

impl CriticalityMode {
    pub fn classify(rho: f64, coherence: Option<f64>) -> Self {
        if rho < 0.9 {
            return CriticalityMode::Subcritical;
        }
        let Some(c) = coherence else {
            return CriticalityMode::Mixed;
        };
        if rho <= 1.1 {
            if c >= 0.7 {
                CriticalityMode::Flow
            } else {
                CriticalityMode::Mixed
            }
        } else if c >= 0.7 {
            CriticalityMode::GenerativeOverflow
        } else if c < 0.4 {
            CriticalityMode::ChaoticRacing
        } else {
            CriticalityMode::Mixed
        }
    }
}

// ============================================================================
// Transition matrix and power iteration
// ============================================================================

/// Sparse row-stochastic matrix over the graph's nodes.
///
/// Row i holds the eases of i's out-links normalized to sum to 1; nodes
/// without out-links get a self-loop of weight 1.
#[derive(Debug, Clone, Default)]
pub struct TransitionMatrix {
    index: HashMap<NodeId, usize>,
    rows: Vec<Vec<(usize, f64)>>,
}

impl TransitionMatrix {
    pub fn from_graph(graph: &Graph) -> Self {
        let index: HashMap<NodeId, usize> = graph
            .nodes()
            .enumerate()
            .map(|(i, n)| (n.id.clone(), i))
            .collect();

        let rows = graph
            .nodes()
            .enumerate()
            .map(|(i, n)| {
                let entries: Vec<(usize, f64)> = graph
                    .outgoing(&n.id)
                    .filter_map(|l| {
                        let w = l.ease();
                        let j = *index.get(&l.target)?;
                        (w.is_finite() && w > 0.0).then_some((j, w))
                    })
                    .collect();
                let total: f64 = entries.iter().map(|(_, w)| w).sum();
                if entries.is_empty() || total <= 0.0 {
                    vec![(i, 1.0)]
                } else {
                    entries.into_iter().map(|(j, w)| (j, w / total)).collect()
                }
            })
            .collect();

        Self { index, rows }
    }

    pub fn dimension(&self) -> usize {
        self.rows.len()
    }

    /// No nodes: nothing to estimate.
    pub fn is_degenerate(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Pᵀ·v
    pub fn transpose_apply(&self, v: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; self.rows.len()];
        for (i, row) in self.rows.iter().enumerate() {
            let vi = v[i];
            if vi == 0.0 {
                continue;
            }
            for &(j, p) in row {
                out[j] += p * vi;
            }
        }
        out
    }

    /// T·v = (1−δ)[(1−α)v + αPᵀv]
    pub fn propagate(&self, v: &[f64], delta: f64, alpha: f64) -> Vec<f64> {
        let ptv = self.transpose_apply(v);
        v.iter()
            .zip(ptv)
            .map(|(vi, pi)| (1.0 - delta) * ((1.0 - alpha) * vi + alpha * pi))
            .collect()
    }
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Estimate |λ_max(T)| by power iteration from a random start vector.
/// Returns 0.0 for an empty matrix or when the iterate vanishes.
pub fn estimate_spectral_radius<R: Rng>(
    matrix: &TransitionMatrix,
    delta: f64,
    alpha: f64,
    max_iters: usize,
    tolerance: f64,
    rng: &mut R,
) -> f64 {
    let n = matrix.dimension();
    if n == 0 {
        return 0.0;
    }
    let mut v: Vec<f64> = (0..n).map(|_| rng.gen_range(0.01..1.0)).collect();
    let start = norm(&v);
    v.iter_mut().for_each(|x| *x /= start);

    let mut eigenvalue = 0.0;
    for _ in 0..max_iters.max(1) {
        let tv = matrix.propagate(&v, delta, alpha);
        eigenvalue = v.iter().zip(&tv).map(|(a, b)| a * b).sum::<f64>();
        let tv_norm = norm(&tv);
        if tv_norm < NORM_EPSILON {
            return 0.0;
        }
        let next: Vec<f64> = tv.into_iter().map(|x| x / tv_norm).collect();
        let change = norm(&next.iter().zip(&v).map(|(a, b)| a - b).collect::<Vec<_>>());
        v = next;
        if change < tolerance {
            break;
        }
    }
    eigenvalue.abs()
}

// ============================================================================
// Branching ratio
// ============================================================================

/// Local branching ratio σ = active(next) / active(prev), averaged over
/// a short window. A cheap proxy for ρ between power-iteration samples.
#[derive(Debug, Clone)]
pub struct BranchingTracker {
    window: VecDeque<f64>,
    capacity: usize,
}

impl Default for BranchingTracker {
    fn default() -> Self {
        Self::new(10)
    }
}

impl BranchingTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record one generation and return the windowed mean.
    pub fn measure(&mut self, prev_active: usize, next_active: usize) -> f64 {
        let sigma = if prev_active == 0 {
            0.0
        } else {
            next_active as f64 / prev_active as f64
        };
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(sigma);
        self.average()
    }

    pub fn average(&self) -> f64 {
        if self.window.is_empty() {
            0.0
        } else {
            self.window.iter().sum::<f64>() / self.window.len() as f64
        }
    }
}

// ============================================================================
// Controller
// ============================================================================

/// Outcome of comparing ρ against the tripwire band.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", content = "rho", rename_all = "snake_case")]
pub enum BoundsCheck {
    Within,
    Below(f64),
    Above(f64),
}

impl BoundsCheck {
    pub fn is_violation(&self) -> bool {
        !matches!(self, BoundsCheck::Within)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CriticalityMetrics {
    pub rho: f64,
    /// True when ρ came from a fresh power iteration this frame.
    pub sampled: bool,
    pub degenerate: bool,
    pub branching_ratio: f64,
    pub target: f64,
    pub error: f64,
    pub controller_output: f64,
    pub delta_before: f64,
    pub delta_after: f64,
    pub alpha_before: f64,
    pub alpha_after: f64,
    pub rho_variance: f64,
    pub oscillation_index: f64,
    pub safety_state: SafetyState,
    pub bounds: BoundsCheck,
}

#[derive(Debug, Clone)]
pub struct CriticalityController {
    config: CriticalityConfig,
    target: f64,
    frame: u64,
    last_rho: Option<f64>,
    last_degenerate: bool,
    integral: f64,
    last_error: f64,
    rho_history: VecDeque<f64>,
    error_history: VecDeque<f64>,
    rng: StdRng,
}

impl CriticalityController {
    pub fn new(config: CriticalityConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            target: config.rho_target,
            frame: 0,
            last_rho: None,
            last_degenerate: false,
            integral: 0.0,
            last_error: 0.0,
            rho_history: VecDeque::with_capacity(config.window),
            error_history: VecDeque::with_capacity(config.window),
            rng,
            config,
        }
    }

    pub fn config(&self) -> &CriticalityConfig {
        &self.config
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn set_target(&mut self, target: f64) {
        if target.is_finite() && target > 0.0 && (target - self.target).abs() > f64::EPSILON {
            tracing::info!("Criticality target {:.3} -> {:.3}", self.target, target);
            self.target = target;
            self.integral = 0.0;
        }
    }

    pub fn last_rho(&self) -> Option<f64> {
        self.last_rho
    }

    /// One control step. Samples ρ every `sample_every` frames (or when
    /// `force_sample` is set) and reuses the previous sample otherwise.
    /// Returns metrics including the adjusted (δ, α), always within bounds.
    pub fn update(
        &mut self,
        matrix: &TransitionMatrix,
        delta: f64,
        alpha: f64,
        branching_ratio: f64,
        force_sample: bool,
    ) -> CriticalityMetrics {
        let c = &self.config;
        let due = self.frame % c.sample_every.max(1) == 0;
        self.frame += 1;

        let mut sampled = false;
        let (rho, degenerate) = if due || force_sample || self.last_rho.is_none() {
            sampled = true;
            if matrix.is_degenerate() {
                (self.target, true)
            } else {
                let rho = estimate_spectral_radius(
                    matrix,
                    delta,
                    alpha,
                    c.power_max_iters,
                    c.power_tolerance,
                    &mut self.rng,
                );
                if rho.is_finite() {
                    (rho, false)
                } else {
                    tracing::warn!("Spectral radius estimate is not finite, holding levers");
                    (self.target, true)
                }
            }
        } else {
            (self.last_rho.unwrap_or(self.target), self.last_degenerate)
        };
        self.last_rho = Some(rho);
        self.last_degenerate = degenerate;

        let error = if degenerate { 0.0 } else { rho - self.target };
        let output = self.control_output(error);

        // ρ above target: decay harder (δ up) and spread less (α down).
        let c = &self.config;
        let delta_after = (delta + output).clamp(c.delta_min, c.delta_max);
        let alpha_after = if c.enable_dual_lever {
            (alpha - c.k_alpha * error).clamp(c.alpha_min, c.alpha_max)
        } else {
            alpha.clamp(c.alpha_min, c.alpha_max)
        };

        push_bounded(&mut self.rho_history, rho, c.window);
        push_bounded(&mut self.error_history, error, c.window);

        let bounds = if degenerate || (c.tripwire_lower..=c.tripwire_upper).contains(&rho) {
            BoundsCheck::Within
        } else if rho < c.tripwire_lower {
            BoundsCheck::Below(rho)
        } else {
            BoundsCheck::Above(rho)
        };

        CriticalityMetrics {
            rho,
            sampled,
            degenerate,
            branching_ratio,
            target: self.target,
            error,
            controller_output: output,
            delta_before: delta,
            delta_after,
            alpha_before: alpha,
            alpha_after,
            rho_variance: self.rho_variance(),
            oscillation_index: self.oscillation_index(),
            safety_state: SafetyState::from_rho(rho),
            bounds,
        }
    }

    fn control_output(&mut self, error: f64) -> f64 {
        let c = &self.config;
        if !c.enable_pid {
            return c.k_p * error;
        }
        self.integral = (self.integral + error).clamp(-c.integral_max, c.integral_max);
        let derivative = error - self.last_error;
        self.last_error = error;
        c.k_p * error + c.k_i * self.integral + c.k_d * derivative
    }

    /// Population variance of ρ over the window.
    pub fn rho_variance(&self) -> f64 {
        lumen_core::numeric::mean_std(&self.rho_history).1.powi(2)
    }

    /// Fraction of consecutive error pairs in the window that change sign.
    pub fn oscillation_index(&self) -> f64 {
        let signs: Vec<f64> = self
            .error_history
            .iter()
            .filter(|e| e.abs() > f64::EPSILON)
            .map(|e| e.signum())
            .collect();
        if signs.len() < 2 {
            return 0.0;
        }
        let flips = signs.windows(2).filter(|w| w[0] != w[1]).count();
        flips as f64 / (signs.len() - 1) as f64
    }

    pub fn reset(&mut self) {
        self.frame = 0;
        self.last_rho = None;
        self.last_degenerate = false;
        self.integral = 0.0;
        self.last_error = 0.0;
        self.rho_history.clear();
        self.error_history.clear();
    }
}

fn push_bounded(buf: &mut VecDeque<f64>, value: f64, cap: usize) {
    if buf.len() >= cap.max(1) {
        buf.pop_front();
    }
    buf.push_back(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::{Link, Node, NodeKind};

    fn seeded() -> CriticalityConfig {
        CriticalityConfig {
            seed: Some(7),
            power_max_iters: 100,
            power_tolerance: 1e-10,
            ..Default::default()
        }
    }

    fn ring(n: usize) -> Graph {
        let mut g = Graph::new();
        for i in 0..n {
            g.insert_node(Node::new(format!("n{}", i), NodeKind::Concept));
        }
        for i in 0..n {
            g.add_link(Link::with_ease(format!("n{}", i), format!("n{}", (i + 1) % n), 1.0))
                .unwrap();
        }
        g
    }

    #[test]
    fn test_isolated_node_rho_is_one_minus_delta() {
        let mut g = Graph::new();
        g.insert_node(Node::new("solo", NodeKind::Concept));
        let m = TransitionMatrix::from_graph(&g);
        let mut rng = StdRng::seed_from_u64(1);
        let rho = estimate_spectral_radius(&m, 0.03, 0.1, 10, 1e-6, &mut rng);
        assert!((rho - 0.97).abs() < 1e-9, "rho = {}", rho);
    }

    #[test]
    fn test_stochastic_ring_rho() {
        let g = ring(3);
        let m = TransitionMatrix::from_graph(&g);
        let mut rng = StdRng::seed_from_u64(3);
        let rho = estimate_spectral_radius(&m, 0.05, 0.2, 200, 1e-12, &mut rng);
        assert!((rho - 0.95).abs() < 1e-3, "rho = {}", rho);
    }

    #[test]
    fn test_rows_are_normalized() {
        let mut g = ring(3);
        g.add_link(Link::with_ease("n0", "n2", 3.0)).unwrap();
        let m = TransitionMatrix::from_graph(&g);
        let out = m.transpose_apply(&[1.0, 0.0, 0.0]);
        assert!((out.iter().sum::<f64>() - 1.0).abs() < 1e-12);
        assert!((out[2] - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_empty_graph_is_degenerate() {
        let m = TransitionMatrix::from_graph(&Graph::new());
        assert!(m.is_degenerate());
        let mut ctl = CriticalityController::new(seeded());
        let metrics = ctl.update(&m, 0.03, 0.1, 0.0, false);
        assert!(metrics.degenerate);
        assert_eq!(metrics.error, 0.0);
        assert_eq!(metrics.rho, ctl.target());
        assert!(!metrics.bounds.is_violation());
    }

    #[test]
    fn test_below_target_reduces_delta() {
        let mut g = Graph::new();
        g.insert_node(Node::new("solo", NodeKind::Concept));
        let m = TransitionMatrix::from_graph(&g);
        let mut cfg = seeded();
        cfg.enable_dual_lever = true;
        let mut ctl = CriticalityController::new(cfg);
        let metrics = ctl.update(&m, 0.1, 0.1, 0.0, false);
        assert!(metrics.error < 0.0);
        assert!(metrics.delta_after < 0.1);
        assert!(metrics.alpha_after > 0.1);
    }

    #[test]
    fn test_levers_stay_in_bounds() {
        let g = ring(4);
        let m = TransitionMatrix::from_graph(&g);
        let mut cfg = seeded();
        cfg.rho_target = 2.0;
        cfg.k_p = 1.0;
        let mut ctl = CriticalityController::new(cfg.clone());
        let (mut delta, mut alpha) = (0.03, 0.1);
        for _ in 0..50 {
            let metrics = ctl.update(&m, delta, alpha, 1.0, true);
            delta = metrics.delta_after;
            alpha = metrics.alpha_after;
            assert!((cfg.delta_min..=cfg.delta_max).contains(&delta));
            assert!((cfg.alpha_min..=cfg.alpha_max).contains(&alpha));
        }
    }

    #[test]
    fn test_sampling_cadence_reuses_rho() {
        let g = ring(3);
        let m = TransitionMatrix::from_graph(&g);
        let mut ctl = CriticalityController::new(seeded());
        let first = ctl.update(&m, 0.03, 0.1, 1.0, false);
        assert!(first.sampled);
        for _ in 1..5 {
            let m2 = ctl.update(&m, 0.5, 0.1, 1.0, false);
            assert!(!m2.sampled);
            assert_eq!(m2.rho, first.rho);
        }
        assert!(ctl.update(&m, 0.03, 0.1, 1.0, false).sampled);
    }

    #[test]
    fn test_tripwire_bounds() {
        let mut g = Graph::new();
        g.insert_node(Node::new("solo", NodeKind::Concept));
        let m = TransitionMatrix::from_graph(&g);
        let mut ctl = CriticalityController::new(seeded());
        // ρ = 1 − δ = 0.5
        let metrics = ctl.update(&m, 0.5, 0.1, 0.0, true);
        assert!(matches!(metrics.bounds, BoundsCheck::Below(_)));
    }

    #[test]
    fn test_oscillation_index() {
        let mut ctl = CriticalityController::new(seeded());
        for e in [0.1, -0.1, 0.1, -0.1] {
            push_bounded(&mut ctl.error_history, e, 20);
        }
        assert!((ctl.oscillation_index() - 1.0).abs() < 1e-12);
        ctl.reset();
        assert_eq!(ctl.oscillation_index(), 0.0);
    }

    #[test]
    fn test_branching_tracker() {
        let mut b = BranchingTracker::new(2);
        assert_eq!(b.measure(0, 5), 0.0);
        assert_eq!(b.measure(2, 4), 1.0);
        assert_eq!(b.measure(4, 4), 1.5);
    }

    #[test]
    fn test_safety_bands() {
        assert_eq!(SafetyState::from_rho(0.3), SafetyState::Dying);
        assert_eq!(SafetyState::from_rho(0.7), SafetyState::Subcritical);
        assert_eq!(SafetyState::from_rho(1.0), SafetyState::Critical);
        assert_eq!(SafetyState::from_rho(1.5), SafetyState::Supercritical);
    }

    #[test]
    fn test_mode_classification() {
        assert_eq!(CriticalityMode::classify(0.5, Some(0.9)), CriticalityMode::Subcritical);
        assert_eq!(CriticalityMode::classify(1.0, Some(0.8)), CriticalityMode::Flow);
        assert_eq!(CriticalityMode::classify(1.3, Some(0.8)), CriticalityMode::GenerativeOverflow);
        assert_eq!(CriticalityMode::classify(1.3, Some(0.2)), CriticalityMode::ChaoticRacing);
        assert_eq!(CriticalityMode::classify(1.3, Some(0.5)), CriticalityMode::Mixed);
        assert_eq!(CriticalityMode::classify(1.0, None), CriticalityMode::Mixed);
    }
}
