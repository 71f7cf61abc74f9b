//! Task-adaptive criticality targets.
//!
//! Different workloads want different operating points: exploration runs
//! slightly supercritical, consolidation and rest settle below 1. The
//! selector only switches after several consecutive frames of agreement.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskContext {
    Explore,
    Implement,
    Consolidate,
    Rest,
    #[default]
    Unknown,
}

impl TaskContext {
    pub fn target_rho(self) -> f64 {
        match self {
            TaskContext::Explore => 1.05,
            TaskContext::Implement => 0.95,
            TaskContext::Consolidate => 0.85,
            TaskContext::Rest => 0.70,
            TaskContext::Unknown => 1.0,
        }
    }

    /// Acceptable ± deviation around the target.
    pub fn tolerance(self) -> f64 {
        match self {
            TaskContext::Explore => 0.15,
            TaskContext::Implement => 0.08,
            TaskContext::Consolidate => 0.10,
            TaskContext::Rest => 0.20,
            TaskContext::Unknown => 0.10,
        }
    }

    /// Classify one frame of signals. First match wins:
    /// rest, consolidate, explore, implement, unknown.
    pub fn classify(signals: &ContextSignals) -> Self {
        if signals.low_rho_frames >= 10 {
            TaskContext::Rest
        } else if signals.memory_formation_active || signals.stable_active_frames >= 5 {
            TaskContext::Consolidate
        } else if signals.exploration_goals > 0 || signals.kind_diversity > 0.6 {
            TaskContext::Explore
        } else if signals.implementation_tasks > 0 || signals.recent_flip_rate > 0.3 {
            TaskContext::Implement
        } else {
            TaskContext::Unknown
        }
    }
}

impl fmt::Display for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskContext::Explore => "explore",
            TaskContext::Implement => "implement",
            TaskContext::Consolidate => "consolidate",
            TaskContext::Rest => "rest",
            TaskContext::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Per-frame evidence for [`TaskContext::classify`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextSignals {
    #[serde(default)]
    pub exploration_goals: u32,
    #[serde(default)]
    pub implementation_tasks: u32,
    #[serde(default)]
    pub memory_formation_active: bool,
    /// Distinct node kinds among active nodes / number of kinds.
    #[serde(default)]
    pub kind_diversity: f64,
    /// Fraction of nodes that crossed into activation this frame.
    #[serde(default)]
    pub recent_flip_rate: f64,
    /// Consecutive frames with an unchanged active set.
    #[serde(default)]
    pub stable_active_frames: u32,
    /// Consecutive frames with ρ < 0.9.
    #[serde(default)]
    pub low_rho_frames: u32,
}

#[derive(Debug, Clone)]
pub struct TargetSelector {
    hysteresis_frames: u32,
    current: TaskContext,
    candidate: TaskContext,
    candidate_frames: u32,
}

impl TargetSelector {
    pub fn new(hysteresis_frames: u32) -> Self {
        Self {
            hysteresis_frames: hysteresis_frames.max(1),
            current: TaskContext::Unknown,
            candidate: TaskContext::Unknown,
            candidate_frames: 0,
        }
    }

    pub fn current(&self) -> TaskContext {
        self.current
    }

    pub fn target_rho(&self) -> f64 {
        self.current.target_rho()
    }

    /// Feed one frame's proposal; returns the (possibly unchanged) context.
    pub fn propose(&mut self, proposal: TaskContext) -> TaskContext {
        if proposal == self.candidate {
            self.candidate_frames = self.candidate_frames.saturating_add(1);
        } else {
            self.candidate = proposal;
            self.candidate_frames = 1;
        }
        if self.candidate_frames >= self.hysteresis_frames && self.current != proposal {
            tracing::info!(
                "Task context {} -> {} after {} frames",
                self.current,
                proposal,
                self.candidate_frames
            );
            self.current = proposal;
        }
        self.current
    }

    pub fn observe(&mut self, signals: &ContextSignals) -> TaskContext {
        self.propose(TaskContext::classify(signals))
    }

    pub fn reset(&mut self) {
        self.current = TaskContext::Unknown;
        self.candidate = TaskContext::Unknown;
        self.candidate_frames = 0;
    }
}
