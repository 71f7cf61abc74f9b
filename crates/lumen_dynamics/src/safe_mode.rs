//! Tripwire escalation into a conservative operating mode.
//!
//! Each pipeline check reports either a violation or compliance for its
//! tripwire every tick. Safe mode is entered when a tripwire stays violated
//! long enough (or too many fault violations cluster in time), and
//! left only after a quiet period.
//!
//! All methods take the current `Instant` explicitly.

use lumen_core::config::SafeModeConfig;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Violations kept for status reporting and window counting.
const VIOLATION_HISTORY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripwireType {
    /// Diffusion created or destroyed energy.
    Conservation,
    /// ρ outside the tripwire band.
    Criticality,
    /// Frontier grew past its allowed share of the graph.
    Frontier,
    /// Telemetry was not delivered.
    Observability,
}

impl TripwireType {
    pub const ALL: [TripwireType; 4] = [
        TripwireType::Conservation,
        TripwireType::Criticality,
        TripwireType::Frontier,
        TripwireType::Observability,
    ];

    fn slot(self) -> usize {
        match self {
            TripwireType::Conservation => 0,
            TripwireType::Criticality => 1,
            TripwireType::Frontier => 2,
            TripwireType::Observability => 3,
        }
    }

    /// Fault wires count toward the clustered-violation window. State wires
    /// (criticality, frontier) escalate only through their own streaks.
    pub fn is_fault(self) -> bool {
        matches!(self, TripwireType::Conservation | TripwireType::Observability)
    }
}

impl fmt::Display for TripwireType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TripwireType::Conservation => "conservation",
            TripwireType::Criticality => "criticality",
            TripwireType::Frontier => "frontier",
            TripwireType::Observability => "observability",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: TripwireType,
    pub at: Instant,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum SafeModeTransition {
    Entered { reason: String },
    Exited { duration_secs: f64 },
}

/// Parameter overrides the engine applies while safe mode is active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SafeModeOverrides {
    pub alpha_multiplier: f64,
    pub dt_cap_secs: Option<f64>,
    pub learning_paused: bool,
    pub peripheral_disabled: bool,
}

impl SafeModeOverrides {
    pub fn none() -> Self {
        Self {
            alpha_multiplier: 1.0,
            dt_cap_secs: None,
            learning_paused: false,
            peripheral_disabled: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SafeModeStatus {
    pub active: bool,
    pub reason: Option<String>,
    pub duration_secs: Option<f64>,
    pub consecutive: Vec<(TripwireType, u32)>,
    pub recent_violations: usize,
}

#[derive(Debug, Clone)]
pub struct SafeMode {
    config: SafeModeConfig,
    active: bool,
    reason: Option<String>,
    entered_at: Option<Instant>,
    violations: VecDeque<Violation>,
    consecutive: [u32; 4],
}

impl SafeMode {
    pub fn new(config: SafeModeConfig) -> Self {
        Self {
            config,
            active: false,
            reason: None,
            entered_at: None,
            violations: VecDeque::with_capacity(VIOLATION_HISTORY),
            consecutive: [0; 4],
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn consecutive(&self, kind: TripwireType) -> u32 {
        self.consecutive[kind.slot()]
    }

    pub fn overrides(&self) -> SafeModeOverrides {
        if !self.active {
            return SafeModeOverrides::none();
        }
        SafeModeOverrides {
            alpha_multiplier: self.config.alpha_multiplier,
            dt_cap_secs: Some(self.config.dt_cap_secs),
            learning_paused: true,
            peripheral_disabled: true,
        }
    }

    pub fn record_violation(
        &mut self,
        kind: TripwireType,
        value: f64,
        threshold: f64,
        message: impl Into<String>,
        now: Instant,
    ) -> Option<SafeModeTransition> {
        let message = message.into();
        tracing::warn!(
            "Tripwire violation: {} (value={:.3}, threshold={:.3}) {}",
            kind,
            value,
            threshold,
            message
        );
        if self.violations.len() >= VIOLATION_HISTORY {
            self.violations.pop_front();
        }
        self.violations.push_back(Violation {
            kind,
            at: now,
            value,
            threshold,
            message: message.clone(),
        });
        let slot = kind.slot();
        self.consecutive[slot] = self.consecutive[slot].saturating_add(1);

        if self.active || !self.config.enabled || !self.should_enter(now) {
            return None;
        }
        let reason = format!("{}: {}", kind, message);
        tracing::error!("Entering safe mode ({})", reason);
        self.active = true;
        self.entered_at = Some(now);
        self.reason = Some(reason.clone());
        Some(SafeModeTransition::Entered { reason })
    }

    pub fn record_compliance(&mut self, kind: TripwireType, now: Instant) -> Option<SafeModeTransition> {
        self.consecutive[kind.slot()] = 0;
        if !self.active || !self.should_exit(now) {
            return None;
        }
        let duration = self
            .entered_at
            .map(|t| now.saturating_duration_since(t))
            .unwrap_or_default();
        tracing::info!("Leaving safe mode after {:.1}s", duration.as_secs_f64());
        self.active = false;
        self.reason = None;
        self.entered_at = None;
        Some(SafeModeTransition::Exited {
            duration_secs: duration.as_secs_f64(),
        })
    }

    fn should_enter(&self, now: Instant) -> bool {
        let c = &self.config;
        let windowed = self
            .recent(now, c.violation_window_secs)
            .filter(|v| v.kind.is_fault())
            .count();
        windowed >= c.violation_threshold
            || self.consecutive(TripwireType::Conservation) >= 1
            || self.consecutive(TripwireType::Criticality) >= c.criticality_frames
            || self.consecutive(TripwireType::Frontier) >= c.frontier_frames
            || self.consecutive(TripwireType::Observability) >= c.observability_frames
    }

    fn should_exit(&self, now: Instant) -> bool {
        let Some(entered) = self.entered_at else {
            return false;
        };
        let c = &self.config;
        if now.saturating_duration_since(entered) < secs(c.min_duration_secs) {
            return false;
        }
        if self.consecutive.iter().any(|n| *n > 0) {
            return false;
        }
        self.recent(now, c.violation_window_secs).next().is_none()
    }

    fn recent(&self, now: Instant, window_secs: f64) -> impl Iterator<Item = &Violation> {
        let window = secs(window_secs);
        self.violations
            .iter()
            .filter(move |v| now.saturating_duration_since(v.at) <= window)
    }

    pub fn status(&self, now: Instant) -> SafeModeStatus {
        SafeModeStatus {
            active: self.active,
            reason: self.reason.clone(),
            duration_secs: self
                .entered_at
                .map(|t| now.saturating_duration_since(t).as_secs_f64()),
            consecutive: TripwireType::ALL
                .iter()
                .map(|k| (*k, self.consecutive(*k)))
                .collect(),
            recent_violations: self.recent(now, self.config.violation_window_secs).count(),
        }
    }

    pub fn violations(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter()
    }

    pub fn reset(&mut self) {
        self.active = false;
        self.reason = None;
        self.entered_at = None;
        self.violations.clear();
        self.consecutive = [0; 4];
    }
}

fn secs(s: f64) -> Duration {
    Duration::from_secs_f64(s.max(0.0))
}
