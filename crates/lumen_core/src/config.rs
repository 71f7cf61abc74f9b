use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::graph::NodeKind;

// ============================================================================
// Top-level config
// ============================================================================

/// One immutable configuration value threaded through every tick phase.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LumenConfig {
    pub diffusion: DiffusionConfig,
    pub decay: DecayConfig,
    pub threshold: ThresholdConfig,
    pub criticality: CriticalityConfig,
    pub safe_mode: SafeModeConfig,
    pub stimulus: StimulusConfig,
    pub scheduler: SchedulerConfig,
    pub persistence: PersistenceConfig,
    pub embedding: EmbeddingConfig,
}

impl LumenConfig {
    /// Load config from a TOML file, falling back to defaults for missing fields.
    /// After loading, env var overrides are applied and every field is clamped
    /// into its legal range.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let mut config: LumenConfig =
            toml::from_str(&content).with_context(|| "Failed to parse TOML config")?;
        config.apply_env_overrides();
        Ok(config.validated())
    }

    /// Try to load from path; if the file doesn't exist, return defaults with env overrides.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::info!("Config file not found or invalid ({}), using defaults", e);
                let mut cfg = Self::default();
                cfg.apply_env_overrides();
                cfg.validated()
            }
        }
    }

    /// Apply environment variable overrides on top of file-based config.
    fn apply_env_overrides(&mut self) {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }

        if let Some(v) = parsed("LUMEN_ALPHA") {
            self.diffusion.alpha = v;
        }
        if let Some(v) = parsed("LUMEN_DELTA") {
            self.decay.delta = v;
        }
        if let Some(v) = parsed("LUMEN_RHO_TARGET") {
            self.criticality.rho_target = v;
        }
        if let Some(v) = parsed("LUMEN_SAFE_MODE") {
            self.safe_mode.enabled = v;
        }
        if let Some(v) = parsed("LUMEN_MIN_INTERVAL_SECS") {
            self.scheduler.min_interval_secs = v;
        }
        if let Some(v) = parsed("LUMEN_MAX_INTERVAL_SECS") {
            self.scheduler.max_interval_secs = v;
        }
        if let Some(v) = parsed("LUMEN_DT_CAP_SECS") {
            self.scheduler.dt_cap_secs = v;
        }
        if let Ok(v) = std::env::var("LUMEN_GRAPH_NAME") {
            self.persistence.graph_name = v;
        }
    }

    /// Clamp every field into its legal range, logging each correction.
    /// Out-of-range configuration is never fatal.
    pub fn validated(mut self) -> Self {
        let c = &mut self.criticality;
        c.delta_min = clamp_field("criticality.delta_min", c.delta_min, 0.0, 1.0);
        c.delta_max = clamp_field("criticality.delta_max", c.delta_max, c.delta_min, 1.0);
        c.alpha_min = clamp_field("criticality.alpha_min", c.alpha_min, 0.0, 1.0);
        c.alpha_max = clamp_field("criticality.alpha_max", c.alpha_max, c.alpha_min, 1.0);
        c.rho_target = clamp_field("criticality.rho_target", c.rho_target, 0.1, 2.0);
        c.k_p = clamp_field("criticality.k_p", c.k_p, 0.0, 1.0);
        c.k_i = clamp_field("criticality.k_i", c.k_i, 0.0, 1.0);
        c.k_d = clamp_field("criticality.k_d", c.k_d, 0.0, 1.0);
        c.k_alpha = clamp_field("criticality.k_alpha", c.k_alpha, 0.0, 1.0);
        c.integral_max = clamp_field("criticality.integral_max", c.integral_max, 0.0, 100.0);
        c.power_tolerance = clamp_field("criticality.power_tolerance", c.power_tolerance, 1e-12, 1.0);
        c.tripwire_lower = clamp_field("criticality.tripwire_lower", c.tripwire_lower, 0.0, c.rho_target);
        c.tripwire_upper = clamp_field("criticality.tripwire_upper", c.tripwire_upper, c.rho_target, 10.0);
        c.sample_every = c.sample_every.max(1);
        c.power_max_iters = c.power_max_iters.max(1);
        c.window = c.window.max(2);
        let (dmin, dmax, amin, amax) = (c.delta_min, c.delta_max, c.alpha_min, c.alpha_max);

        self.diffusion.alpha = clamp_field("diffusion.alpha", self.diffusion.alpha, amin, amax);
        self.diffusion.conservation_epsilon = clamp_field(
            "diffusion.conservation_epsilon",
            self.diffusion.conservation_epsilon,
            1e-12,
            1.0,
        );

        let d = &mut self.decay;
        d.delta = clamp_field("decay.delta", d.delta, dmin, dmax);
        d.energy_floor = clamp_field("decay.energy_floor", d.energy_floor, 0.0, 1.0);
        d.weight_decay_rate = clamp_field("decay.weight_decay_rate", d.weight_decay_rate, 0.0, 1.0);
        d.weight_decay_cadence_secs =
            clamp_field("decay.weight_decay_cadence_secs", d.weight_decay_cadence_secs, 0.1, 86_400.0);
        d.weight_ceiling = clamp_field("decay.weight_ceiling", d.weight_ceiling, -10.0, 10.0);
        d.weight_floor = clamp_field("decay.weight_floor", d.weight_floor, -20.0, d.weight_ceiling);
        d.emotion_decay_rate = clamp_field("decay.emotion_decay_rate", d.emotion_decay_rate, 0.0, 1.0);

        let t = &mut self.threshold;
        t.theta_min = clamp_field("threshold.theta_min", t.theta_min, 1e-6, 1e6);
        t.theta_max = clamp_field("threshold.theta_max", t.theta_max, t.theta_min, 1e6);
        t.default_theta = clamp_field("threshold.default_theta", t.default_theta, t.theta_min, t.theta_max);
        t.recency_horizon_ticks =
            clamp_field("threshold.recency_horizon_ticks", t.recency_horizon_ticks, 1.0, 1e9);
        t.scale_guard_ratio = clamp_field("threshold.scale_guard_ratio", t.scale_guard_ratio, 2.0, 1e12);
        t.noise_ema_alpha = clamp_field("threshold.noise_ema_alpha", t.noise_ema_alpha, 1e-4, 1.0);

        let s = &mut self.safe_mode;
        s.alpha_multiplier = clamp_field("safe_mode.alpha_multiplier", s.alpha_multiplier, 0.0, 1.0);
        s.dt_cap_secs = clamp_field("safe_mode.dt_cap_secs", s.dt_cap_secs, 0.01, 3600.0);
        s.frontier_fraction = clamp_field("safe_mode.frontier_fraction", s.frontier_fraction, 0.0, 1.0);
        s.violation_window_secs =
            clamp_field("safe_mode.violation_window_secs", s.violation_window_secs, 1.0, 86_400.0);
        s.min_duration_secs = clamp_field("safe_mode.min_duration_secs", s.min_duration_secs, 0.0, 86_400.0);
        s.violation_threshold = s.violation_threshold.max(1);

        let st = &mut self.stimulus;
        st.budget_floor = clamp_field("stimulus.budget_floor", st.budget_floor, 0.0, 1e6);
        st.max_amplification = clamp_field("stimulus.max_amplification", st.max_amplification, 0.0, 100.0);
        st.lambda_min = clamp_field("stimulus.lambda_min", st.lambda_min, 0.0, 1.0);
        st.lambda_max = clamp_field("stimulus.lambda_max", st.lambda_max, st.lambda_min, 1.0);
        st.lambda_base = clamp_field("stimulus.lambda_base", st.lambda_base, st.lambda_min, st.lambda_max);
        st.amplifier_gamma = clamp_field("stimulus.amplifier_gamma", st.amplifier_gamma, 1.0 + 1e-6, 10.0);
        st.negligible_delta = clamp_field("stimulus.negligible_delta", st.negligible_delta, 0.0, 1.0);
        st.health_history = st.health_history.max(st.health_min_samples).max(2);
        st.health_retrain_every = st.health_retrain_every.max(1);
        st.peripheral_cohort = st.peripheral_cohort.max(st.peripheral_min_cohort).max(2);
        st.source_window_secs = clamp_field("stimulus.source_window_secs", st.source_window_secs, 1.0, 1e9);
        st.max_candidates = st.max_candidates.max(1);
        st.queue_capacity = st.queue_capacity.max(1);

        let sc = &mut self.scheduler;
        sc.min_interval_secs = clamp_field("scheduler.min_interval_secs", sc.min_interval_secs, 0.001, 3600.0);
        sc.max_interval_secs = clamp_field(
            "scheduler.max_interval_secs",
            sc.max_interval_secs,
            sc.min_interval_secs,
            86_400.0,
        );
        sc.dt_cap_secs = clamp_field("scheduler.dt_cap_secs", sc.dt_cap_secs, 0.001, 3600.0);
        sc.ema_beta = clamp_field("scheduler.ema_beta", sc.ema_beta, 0.0, 1.0);
        sc.energy_saturation = clamp_field("scheduler.energy_saturation", sc.energy_saturation, 1e-6, 1e9);
        sc.arousal_saturation = clamp_field("scheduler.arousal_saturation", sc.arousal_saturation, 1e-6, 1e9);

        let p = &mut self.persistence;
        p.flush_interval_secs = clamp_field("persistence.flush_interval_secs", p.flush_interval_secs, 0.01, 86_400.0);
        p.jitter_fraction = clamp_field("persistence.jitter_fraction", p.jitter_fraction, 0.0, 0.9);

        let e = &mut self.embedding;
        e.timeout_secs = clamp_field("embedding.timeout_secs", e.timeout_secs, 0.001, 600.0);
        e.cooldown_secs = clamp_field("embedding.cooldown_secs", e.cooldown_secs, 0.0, 86_400.0);
        e.failure_threshold = e.failure_threshold.max(1);
        e.dimensions = e.dimensions.max(1);

        self
    }
}

/// Clamp a single field, logging when the configured value was out of range.
fn clamp_field(name: &str, value: f64, lo: f64, hi: f64) -> f64 {
    let hi = hi.max(lo);
    if !value.is_finite() {
        tracing::warn!("config {} is not finite, using {}", name, lo);
        return lo;
    }
    let clamped = value.clamp(lo, hi);
    if clamped != value {
        tracing::warn!("config {}={} out of range [{}, {}], clamped to {}", name, value, lo, hi, clamped);
    }
    clamped
}

// ============================================================================
// Sub-configs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub enabled: bool,
    /// Initial diffusion share α; the controller moves it in dual-lever mode.
    pub alpha: f64,
    /// Tolerance for |Σ diffusion deltas| before the conservation tripwire fires.
    pub conservation_epsilon: f64,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            alpha: 0.1,
            conservation_epsilon: 0.001,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DecayConfig {
    pub enabled: bool,
    /// Initial energy decay rate δ (per second).
    pub delta: f64,
    /// Energies decaying below this snap to zero.
    pub energy_floor: f64,
    /// Log-weight decay per second, applied on the coarse cadence.
    pub weight_decay_rate: f64,
    pub weight_decay_cadence_secs: f64,
    pub weight_floor: f64,
    pub weight_ceiling: f64,
    pub emotion_decay_rate: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            delta: 0.03,
            energy_floor: 0.001,
            weight_decay_rate: 1e-6,
            weight_decay_cadence_secs: 60.0,
            weight_floor: -5.0,
            weight_ceiling: 2.0,
            emotion_decay_rate: 0.001,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KindBaselines {
    pub concept: f64,
    pub memory: f64,
    pub task: f64,
    pub person: f64,
    pub other: f64,
}

impl KindBaselines {
    pub fn for_kind(&self, kind: NodeKind) -> f64 {
        match kind {
            NodeKind::Concept => self.concept,
            NodeKind::Memory => self.memory,
            NodeKind::Task => self.task,
            NodeKind::Person => self.person,
            NodeKind::Other => self.other,
        }
    }
}

impl Default for KindBaselines {
    fn default() -> Self {
        Self {
            concept: 2.0,
            memory: 2.5,
            task: 1.5,
            person: 2.0,
            other: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub enabled: bool,
    pub theta_min: f64,
    pub theta_max: f64,
    /// Safe value forced by the scale guard.
    pub default_theta: f64,
    pub baselines: KindBaselines,
    /// Ticks over which the recency discount fades.
    pub recency_horizon_ticks: f64,
    /// Max tolerated ratio between the energy scale and the threshold scale.
    pub scale_guard_ratio: f64,
    pub soft_kappa: f64,
    /// Raise baselines to the per-node statistical noise floor.
    pub noise_floor_enabled: bool,
    pub noise_z: f64,
    pub noise_ema_alpha: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            theta_min: 0.1,
            theta_max: 10.0,
            default_theta: 1.0,
            baselines: KindBaselines::default(),
            recency_horizon_ticks: 50.0,
            scale_guard_ratio: 1000.0,
            soft_kappa: 10.0,
            noise_floor_enabled: false,
            noise_z: 1.28,
            noise_ema_alpha: 0.1,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CriticalityConfig {
    pub rho_target: f64,
    pub k_p: f64,
    pub enable_pid: bool,
    pub k_i: f64,
    pub k_d: f64,
    /// Anti-windup bound on the PID integral term.
    pub integral_max: f64,
    pub enable_dual_lever: bool,
    pub k_alpha: f64,
    pub delta_min: f64,
    pub delta_max: f64,
    pub alpha_min: f64,
    pub alpha_max: f64,
    /// Power iteration runs every N frames; ρ is reused in between.
    pub sample_every: u64,
    pub power_max_iters: usize,
    pub power_tolerance: f64,
    pub window: usize,
    pub tripwire_lower: f64,
    pub tripwire_upper: f64,
    pub adaptive_targets: bool,
    pub hysteresis_frames: u32,
    /// Fixed seed for the power-iteration start vector (random when unset).
    pub seed: Option<u64>,
}

impl Default for CriticalityConfig {
    fn default() -> Self {
        Self {
            rho_target: 1.0,
            k_p: 0.05,
            enable_pid: false,
            k_i: 0.01,
            k_d: 0.02,
            integral_max: 1.0,
            enable_dual_lever: false,
            k_alpha: 0.02,
            delta_min: 0.001,
            delta_max: 0.20,
            alpha_min: 0.05,
            alpha_max: 0.30,
            sample_every: 5,
            power_max_iters: 10,
            power_tolerance: 1e-4,
            window: 20,
            tripwire_lower: 0.7,
            tripwire_upper: 1.3,
            adaptive_targets: false,
            hysteresis_frames: 5,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SafeModeConfig {
    pub enabled: bool,
    /// Non-criticality violations within the window that trigger entry.
    pub violation_threshold: usize,
    pub violation_window_secs: f64,
    pub criticality_frames: u32,
    pub frontier_fraction: f64,
    pub frontier_frames: u32,
    pub observability_frames: u32,
    pub min_duration_secs: f64,
    pub alpha_multiplier: f64,
    pub dt_cap_secs: f64,
}

impl Default for SafeModeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            violation_threshold: 3,
            violation_window_secs: 60.0,
            criticality_frames: 10,
            frontier_fraction: 0.3,
            frontier_frames: 20,
            observability_frames: 5,
            min_duration_secs: 30.0,
            alpha_multiplier: 0.3,
            dt_cap_secs: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StimulusConfig {
    pub budget_floor: f64,
    pub health_enabled: bool,
    pub source_enabled: bool,
    pub peripheral_enabled: bool,
    pub health_history: usize,
    pub health_min_samples: usize,
    pub health_retrain_every: usize,
    pub source_window_secs: f64,
    pub source_min_samples: usize,
    pub peripheral_cohort: usize,
    pub peripheral_min_cohort: usize,
    pub max_amplification: f64,
    pub lambda_base: f64,
    pub lambda_min: f64,
    pub lambda_max: f64,
    /// How strongly a cold candidate pool pushes λ toward top-up.
    pub k_deficit: f64,
    /// How strongly similarity concentration pulls λ toward the amplifier.
    pub k_herfindahl: f64,
    pub topup_kappa: f64,
    /// Exponent γ > 1 of the amplifier weight s^γ.
    pub amplifier_gamma: f64,
    pub negligible_delta: f64,
    /// Candidates scored per stimulus before coverage selection.
    pub max_candidates: usize,
    pub queue_capacity: usize,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            budget_floor: 0.05,
            health_enabled: true,
            source_enabled: true,
            peripheral_enabled: true,
            health_history: 1000,
            health_min_samples: 200,
            health_retrain_every: 50,
            source_window_secs: 604_800.0,
            source_min_samples: 50,
            peripheral_cohort: 100,
            peripheral_min_cohort: 20,
            max_amplification: 3.0,
            lambda_base: 0.5,
            lambda_min: 0.1,
            lambda_max: 0.9,
            k_deficit: 0.4,
            k_herfindahl: 0.5,
            topup_kappa: 4.0,
            amplifier_gamma: 2.0,
            negligible_delta: 1e-6,
            max_candidates: 64,
            queue_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub min_interval_secs: f64,
    pub max_interval_secs: f64,
    pub dt_cap_secs: f64,
    pub ema_enabled: bool,
    pub ema_beta: f64,
    /// Active energy at which the energy factor reaches the minimum interval.
    pub energy_saturation: f64,
    /// Mean arousal at which the arousal factor reaches the minimum interval.
    pub arousal_saturation: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 0.1,
            max_interval_secs: 60.0,
            dt_cap_secs: 5.0,
            ema_enabled: true,
            ema_beta: 0.3,
            energy_saturation: 10.0,
            arousal_saturation: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub graph_name: String,
    pub flush_interval_secs: f64,
    pub min_batch: usize,
    /// Fraction of the flush interval used as random jitter.
    pub jitter_fraction: f64,
    pub max_attempts: u32,
    pub initial_backoff_secs: f64,
    pub max_backoff_secs: f64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            graph_name: "default".to_string(),
            flush_interval_secs: 5.0,
            min_batch: 16,
            jitter_fraction: 0.2,
            max_attempts: 3,
            initial_backoff_secs: 0.5,
            max_backoff_secs: 10.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub timeout_secs: f64,
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    pub cooldown_secs: f64,
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 2.0,
            failure_threshold: 3,
            cooldown_secs: 30.0,
            dimensions: 64,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
