//! The injection pipeline.
//!
//! select (entropy coverage) → budget (similarity mass × f(ρ) × g(source)
//! × (1 + amplification), floored) → distribute (top-up / amplifier).
//!
//! The injector owns the three learned services. Frame outcomes are fed back
//! through [`StimulusInjector::record_frame_result`].

use chrono::{DateTime, Utc};
use lumen_core::config::StimulusConfig;
use lumen_core::{Graph, SourceKey, Stimulus};
use serde::Serialize;
use uuid::Uuid;

use crate::coverage::{self, Candidate};
use crate::distribution::{distribute, DistributionParams, NodeDelta};
use crate::health::{HealthModulator, HealthStats};
use crate::peripheral::{PeripheralAmplifier, PeripheralStats};
use crate::source_gate::{SourceImpactGate, SourceStats};

/// Which learned modulators participate. Disabled ones contribute neutrally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InjectorToggles {
    pub health: bool,
    pub source: bool,
    pub peripheral: bool,
}

impl InjectorToggles {
    pub fn from_config(config: &StimulusConfig) -> Self {
        Self {
            health: config.health_enabled,
            source: config.source_enabled,
            peripheral: config.peripheral_enabled,
        }
    }
}

impl Default for InjectorToggles {
    fn default() -> Self {
        Self {
            health: true,
            source: true,
            peripheral: true,
        }
    }
}

/// Every factor that went into one injection's budget.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BudgetBreakdown {
    pub similarity_mass: f64,
    pub health_factor: f64,
    pub source_factor: f64,
    pub amplification: f64,
    pub floor_applied: bool,
    pub budget: f64,
    pub lambda: f64,
    pub entropy: f64,
    pub coverage_target: f64,
    pub candidates: usize,
    pub selected: usize,
    pub spent: f64,
    pub rho_proxy: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InjectionResult {
    pub stimulus_id: Uuid,
    pub source: SourceKey,
    pub deltas: Vec<NodeDelta>,
    pub breakdown: BudgetBreakdown,
}

impl InjectionResult {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

/// Outcome of writing an injection into the graph.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AppliedInjection {
    pub nodes: usize,
    pub energy_added: f64,
    /// Nodes that were below threshold before and at or above it after.
    pub flips: usize,
}

/// Add each delta to its node's energy. Deltas for nodes that have since
/// disappeared are skipped.
pub fn apply_injection(graph: &mut Graph, result: &InjectionResult) -> AppliedInjection {
    let mut applied = AppliedInjection::default();
    for d in &result.deltas {
        let Some(node) = graph.node_mut(&d.node) else {
            tracing::debug!("Injection target {} no longer exists", d.node);
            continue;
        };
        let was_active = node.is_active();
        node.energy += d.delta;
        applied.nodes += 1;
        applied.energy_added += d.delta;
        if !was_active && node.is_active() {
            applied.flips += 1;
        }
    }
    applied
}

#[derive(Debug, Clone, Serialize)]
pub struct InjectorStats {
    pub injections: u64,
    pub empty_selections: u64,
    pub frames_recorded: u64,
    pub total_budget: f64,
    pub toggles: InjectorToggles,
    pub health: HealthStats,
    pub sources: Vec<SourceStats>,
    pub peripheral: PeripheralStats,
}

#[derive(Debug, Clone)]
pub struct StimulusInjector {
    budget_floor: f64,
    params: DistributionParams,
    toggles: InjectorToggles,
    health: HealthModulator,
    source_gate: SourceImpactGate,
    peripheral: PeripheralAmplifier,
    injections: u64,
    empty_selections: u64,
    frames_recorded: u64,
    total_budget: f64,
}

impl StimulusInjector {
    pub fn new(config: &StimulusConfig) -> Self {
        Self {
            budget_floor: config.budget_floor,
            params: DistributionParams::from(config),
            toggles: InjectorToggles::from_config(config),
            health: HealthModulator::new(config),
            source_gate: SourceImpactGate::new(config.source_window_secs, config.source_min_samples),
            peripheral: PeripheralAmplifier::new(
                config.peripheral_cohort,
                config.peripheral_min_cohort,
                config.max_amplification,
            ),
            injections: 0,
            empty_selections: 0,
            frames_recorded: 0,
            total_budget: 0.0,
        }
    }

    pub fn toggles(&self) -> InjectorToggles {
        self.toggles
    }

    pub fn set_toggles(&mut self, toggles: InjectorToggles) {
        self.toggles = toggles;
    }

    pub fn health(&self) -> &HealthModulator {
        &self.health
    }

    pub fn source_gate(&self) -> &SourceImpactGate {
        &self.source_gate
    }

    /// Compute (not apply) the deltas for one stimulus. `allow_peripheral`
    /// lets the caller suppress amplification (safe mode).
    pub fn inject(
        &mut self,
        stimulus: &Stimulus,
        candidates: &[Candidate],
        rho_proxy: f64,
        allow_peripheral: bool,
    ) -> InjectionResult {
        let selection = coverage::select(candidates);
        let mut breakdown = BudgetBreakdown {
            health_factor: 1.0,
            source_factor: 1.0,
            entropy: selection.entropy,
            coverage_target: selection.coverage_target,
            candidates: candidates.len(),
            selected: selection.len(),
            similarity_mass: selection.similarity_mass,
            rho_proxy,
            ..Default::default()
        };
        self.injections += 1;

        if selection.is_empty() {
            self.empty_selections += 1;
            tracing::debug!("Stimulus {} matched no candidates", stimulus.id);
            return InjectionResult {
                stimulus_id: stimulus.id,
                source: stimulus.source.clone(),
                deltas: Vec::new(),
                breakdown,
            };
        }

        if self.toggles.health {
            breakdown.health_factor = self.health.modulate(rho_proxy);
        }
        if self.toggles.source {
            breakdown.source_factor = self.source_gate.modulate(&stimulus.source, Utc::now());
        }
        if self.toggles.peripheral && allow_peripheral {
            if let Some(embedding) = &stimulus.embedding {
                breakdown.amplification = self.peripheral.amplify(embedding, &stimulus.context);
            }
        }

        let raw = breakdown.similarity_mass
            * breakdown.health_factor
            * breakdown.source_factor
            * (1.0 + breakdown.amplification);
        let raw = lumen_core::numeric::sanitize(raw, 0.0, "injection budget");
        breakdown.floor_applied = raw < self.budget_floor;
        breakdown.budget = raw.max(self.budget_floor);

        let dist = distribute(&selection.selected, breakdown.budget, &self.params);
        breakdown.lambda = dist.lambda;
        breakdown.spent = dist.total();
        self.total_budget += breakdown.spent;

        tracing::debug!(
            "Stimulus {} from {}: {} of {} candidates, budget {:.4} (f={:.2}, g={:.2}, amp={:.2}), lambda {:.2}",
            stimulus.id,
            stimulus.source,
            breakdown.selected,
            breakdown.candidates,
            breakdown.budget,
            breakdown.health_factor,
            breakdown.source_factor,
            breakdown.amplification,
            breakdown.lambda
        );

        InjectionResult {
            stimulus_id: stimulus.id,
            source: stimulus.source.clone(),
            deltas: dist.deltas,
            breakdown,
        }
    }

    /// Feed one frame's outcome to the learners.
    #[allow(clippy::too_many_arguments)]
    pub fn record_frame_result(
        &mut self,
        source: Option<&SourceKey>,
        rho_proxy: f64,
        flips: usize,
        budget_spent: f64,
        activation_entropy: f64,
        overflow: bool,
        at: DateTime<Utc>,
    ) {
        self.frames_recorded += 1;
        if self.toggles.health {
            self.health
                .add_observation(rho_proxy, flips, budget_spent, activation_entropy, overflow);
        }
        if self.toggles.source {
            if let Some(source) = source {
                self.source_gate.record(source, flips, budget_spent, at);
            }
        }
    }

    pub fn stats(&self) -> InjectorStats {
        InjectorStats {
            injections: self.injections,
            empty_selections: self.empty_selections,
            frames_recorded: self.frames_recorded,
            total_budget: self.total_budget,
            toggles: self.toggles,
            health: self.health.stats(),
            sources: self.source_gate.stats(),
            peripheral: self.peripheral.stats(),
        }
    }

    pub fn reset(&mut self) {
        self.health.reset();
        self.source_gate.reset();
        self.peripheral.reset();
        self.injections = 0;
        self.empty_selections = 0;
        self.frames_recorded = 0;
        self.total_budget = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::{Node, NodeKind, SourceType};

    fn stimulus() -> Stimulus {
        Stimulus::new("hello", Some(vec![1.0, 0.0]), SourceKey::of(SourceType::UserMessage))
    }

    #[test]
    fn test_zero_similarity_gives_empty_result() {
        let mut inj = StimulusInjector::new(&StimulusConfig::default());
        let c = vec![Candidate::new("a", 0.0, 0.0, 1.0)];
        let r = inj.inject(&stimulus(), &c, 1.0, true);
        assert!(r.is_empty());
        assert_eq!(r.breakdown.budget, 0.0);
        assert_eq!(inj.stats().empty_selections, 1);
    }

    #[test]
    fn test_bootstrap_factors_are_neutral() {
        let mut inj = StimulusInjector::new(&StimulusConfig::default());
        let c = vec![
            Candidate::new("a", 0.9, 0.0, 1.0),
            Candidate::new("b", 0.2, 0.0, 1.0),
        ];
        let r = inj.inject(&stimulus(), &c, 1.0, true);
        assert_eq!(r.breakdown.health_factor, 1.0);
        assert_eq!(r.breakdown.source_factor, 1.0);
        assert_eq!(r.breakdown.amplification, 0.0);
        assert!((r.breakdown.budget - r.breakdown.similarity_mass).abs() < 1e-12);
        assert!(r.breakdown.spent <= r.breakdown.budget + 1e-9);
    }

    #[test]
    fn test_budget_floor_applied() {
        let mut inj = StimulusInjector::new(&StimulusConfig::default());
        let c = vec![Candidate::new("a", 0.001, 0.0, 1.0)];
        let r = inj.inject(&stimulus(), &c, 1.0, true);
        assert!(r.breakdown.floor_applied);
        assert!((r.breakdown.budget - 0.05).abs() < 1e-12);
    }

    #[test]
    fn test_apply_counts_flips() {
        let mut g = Graph::new();
        g.insert_node(Node::new("a", NodeKind::Concept).with_energy(0.9).with_threshold(1.0));
        g.insert_node(Node::new("b", NodeKind::Concept).with_energy(0.0).with_threshold(1.0));
        let result = InjectionResult {
            stimulus_id: Uuid::new_v4(),
            source: SourceKey::of(SourceType::Internal),
            deltas: vec![
                NodeDelta { node: "a".into(), delta: 0.2, topup: 0.1, amplifier: 0.1 },
                NodeDelta { node: "b".into(), delta: 0.2, topup: 0.2, amplifier: 0.0 },
                NodeDelta { node: "gone".into(), delta: 0.2, topup: 0.2, amplifier: 0.0 },
            ],
            breakdown: BudgetBreakdown::default(),
        };
        let applied = apply_injection(&mut g, &result);
        assert_eq!(applied.flips, 1);
        assert_eq!(applied.nodes, 2);
        assert!((applied.energy_added - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_toggles_disable_learners() {
        let mut inj = StimulusInjector::new(&StimulusConfig::default());
        inj.set_toggles(InjectorToggles {
            health: false,
            source: false,
            peripheral: false,
        });
        let key = SourceKey::of(SourceType::UserMessage);
        inj.record_frame_result(Some(&key), 1.0, 3, 1.0, 0.5, false, Utc::now());
        assert!(inj.health().is_empty());
        assert_eq!(inj.source_gate().samples(&key), 0);
        assert_eq!(inj.stats().frames_recorded, 1);
    }

    #[test]
    fn test_record_feeds_learners() {
        let mut inj = StimulusInjector::new(&StimulusConfig::default());
        let key = SourceKey::of(SourceType::UserMessage);
        inj.record_frame_result(Some(&key), 1.0, 3, 1.0, 0.5, false, Utc::now());
        inj.record_frame_result(None, 1.0, 0, 0.0, 0.0, false, Utc::now());
        assert_eq!(inj.health().len(), 2);
        assert_eq!(inj.source_gate().samples(&key), 1);
    }
}
