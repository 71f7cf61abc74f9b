//! Adaptive tick interval.
//!
//! Three independent pressures each propose a wait, mapped log-linearly
//! between the configured min and max intervals. The shortest wins. The
//! physics step is capped separately so a long idle gap never
//! over-integrates diffusion and decay.

use lumen_core::config::SchedulerConfig;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Which pressure produced the chosen interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalFactor {
    /// Recent external input.
    Stimulus,
    /// Energy held by active nodes.
    Energy,
    /// Emotional arousal floor.
    Arousal,
}

impl fmt::Display for IntervalFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntervalFactor::Stimulus => "stimulus",
            IntervalFactor::Energy => "energy",
            IntervalFactor::Arousal => "arousal",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickReason {
    StimulusDetected,
    Autonomous,
}

/// Graph-derived inputs for one interval decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct IntervalInputs {
    /// Simulated seconds since the last stimulus; `None` if never stimulated.
    pub since_stimulus_secs: Option<f64>,
    pub active_energy: f64,
    pub mean_arousal: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct IntervalDecision {
    pub interval_secs: f64,
    /// Winning candidate before smoothing.
    pub raw_secs: f64,
    pub winning_factor: IntervalFactor,
    pub stimulus_secs: f64,
    pub energy_secs: f64,
    pub arousal_secs: f64,
}

impl IntervalDecision {
    pub fn as_duration(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }
}

#[derive(Debug, Clone)]
pub struct TickScheduler {
    config: SchedulerConfig,
    smoothed: Option<f64>,
}

impl TickScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            smoothed: None,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// interval = max^(1−t) · min^t, t clamped to [0, 1].
    pub fn log_linear(&self, t: f64) -> f64 {
        let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
        let lo = self.config.min_interval_secs;
        let hi = self.config.max_interval_secs;
        hi.powf(1.0 - t) * lo.powf(t)
    }

    fn stimulus_intensity(&self, since: Option<f64>) -> f64 {
        match since {
            None => 0.0,
            Some(dt) => {
                let span = (1.0 + self.config.max_interval_secs).ln();
                1.0 - (1.0 + dt.max(0.0)).ln() / span
            }
        }
    }

    fn energy_intensity(&self, active_energy: f64) -> f64 {
        let span = (1.0 + self.config.energy_saturation).ln();
        if span <= 0.0 {
            return 0.0;
        }
        (1.0 + active_energy.max(0.0)).ln() / span
    }

    fn arousal_intensity(&self, arousal: f64) -> f64 {
        if self.config.arousal_saturation <= 0.0 {
            return 0.0;
        }
        arousal / self.config.arousal_saturation
    }

    /// Pick the next wait. Ties favour stimulus, then energy, then arousal.
    pub fn next_interval(&mut self, inputs: IntervalInputs) -> IntervalDecision {
        let stimulus_secs = self.log_linear(self.stimulus_intensity(inputs.since_stimulus_secs));
        let energy_secs = self.log_linear(self.energy_intensity(inputs.active_energy));
        let arousal_secs = self.log_linear(self.arousal_intensity(inputs.mean_arousal));

        let mut winning_factor = IntervalFactor::Stimulus;
        let mut raw = stimulus_secs;
        if energy_secs < raw {
            raw = energy_secs;
            winning_factor = IntervalFactor::Energy;
        }
        if arousal_secs < raw {
            raw = arousal_secs;
            winning_factor = IntervalFactor::Arousal;
        }

        let interval = if self.config.ema_enabled {
            let beta = self.config.ema_beta.clamp(0.0, 1.0);
            let prev = self.smoothed.unwrap_or(self.config.min_interval_secs);
            let next = beta * raw + (1.0 - beta) * prev;
            self.smoothed = Some(next);
            next
        } else {
            raw
        };
        let interval = interval.clamp(self.config.min_interval_secs, self.config.max_interval_secs);

        tracing::trace!(
            "Next interval {:.3}s ({} won: stimulus={:.3}s energy={:.3}s arousal={:.3}s)",
            interval,
            winning_factor,
            stimulus_secs,
            energy_secs,
            arousal_secs
        );

        IntervalDecision {
            interval_secs: interval,
            raw_secs: raw,
            winning_factor,
            stimulus_secs,
            energy_secs,
            arousal_secs,
        }
    }

    /// dt_used = min(elapsed, cap); a tighter cap (safe mode) may override.
    /// Returns the step and whether it was capped.
    pub fn cap_dt(&self, elapsed_secs: f64, override_cap: Option<f64>) -> (f64, bool) {
        let cap = match override_cap {
            Some(c) => c.min(self.config.dt_cap_secs),
            None => self.config.dt_cap_secs,
        };
        if !elapsed_secs.is_finite() {
            return (cap, true);
        }
        let elapsed = elapsed_secs.max(0.0);
        if elapsed > cap {
            (cap, true)
        } else {
            (elapsed, false)
        }
    }

    pub fn reset(&mut self) {
        self.smoothed = None;
    }
}
