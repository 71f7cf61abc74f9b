//! The tick engine.
//!
//! One `tick` runs the phases in a fixed order over a graph it exclusively
//! owns:
//!
//! 1. drain queued graph mutations
//! 2. inject queued stimuli
//! 3. diffusion (staged, applied atomically)
//! 4. decay (energy every tick, weights on a coarse cadence, emotions)
//! 5. thresholds, using the previous tick's safety state
//! 6. frontier check
//! 7. criticality control, producing next tick's δ and α
//! 8. observability check
//! 9. learning feedback to the injector
//! 10. next interval
//!
//! Stimuli and mutations are only queued between ticks, never applied
//! mid-cycle.

use chrono::Utc;
use lumen_core::{
    Graph, GraphMutation, LumenConfig, LumenError, LumenResult, NodeId, NodeKind, SourceKey,
    Stimulus, TelemetryEvent, TelemetrySink,
};
use lumen_dynamics::{
    compute_frontier, decay_emotions, decay_energy, diffuse, BoundsCheck, BranchingTracker,
    ContextSignals, CriticalityController, CriticalityMetrics, DecayReport, DiffusionParams,
    DiffusionReport, SafeMode, SafeModeStatus, SafeModeTransition, SafetyState, TargetSelector,
    TaskContext, ThresholdOracle, ThresholdReport, TransitionMatrix, TripwireType, WeightDecay,
    WeightDecayReport,
};
use lumen_stimulus::{
    apply_injection, entropy, BudgetBreakdown, HealthModulator, InjectorStats, StimulusInjector,
};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::candidates::{self, SearchMode};
use crate::scheduler::{IntervalDecision, IntervalFactor, IntervalInputs, TickReason, TickScheduler};
use crate::telemetry::TracingSink;

/// Consecutive ticks below this ρ count toward the rest context.
const LOW_RHO: f64 = 0.9;

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct InjectionSummary {
    pub stimulus_id: Uuid,
    pub source: SourceKey,
    pub mode: SearchMode,
    pub nodes: usize,
    pub flips: usize,
    pub breakdown: BudgetBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub tick: u64,
    pub reason: TickReason,
    pub dt_used: f64,
    pub dt_capped: bool,
    pub mutations_applied: usize,
    pub mutations_rejected: usize,
    pub injections: Vec<InjectionSummary>,
    pub flips: usize,
    pub budget_spent: f64,
    pub diffusion: DiffusionReport,
    pub decay: DecayReport,
    pub weight_decay: Option<WeightDecayReport>,
    pub thresholds: ThresholdReport,
    pub frontier_fraction: f64,
    pub criticality: CriticalityMetrics,
    /// Nodes active now that were not active after the previous tick.
    pub newly_active: usize,
    pub active_nodes: usize,
    pub global_energy: f64,
    pub context: TaskContext,
    pub safe_mode: bool,
    pub transitions: Vec<SafeModeTransition>,
    pub next_interval: IntervalDecision,
    /// Nodes whose energy or threshold changed this tick.
    #[serde(skip)]
    pub changed_nodes: Vec<NodeId>,
}

/// Read-mostly view of the engine between ticks.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub tick_count: u64,
    pub node_count: usize,
    pub active_node_count: usize,
    pub global_energy: f64,
    pub spectral_radius: f64,
    pub safety_state: SafetyState,
    pub safe_mode: bool,
    pub delta: f64,
    pub alpha: f64,
    pub last_interval_secs: f64,
    pub winning_factor: IntervalFactor,
    pub context: TaskContext,
    pub pending_stimuli: usize,
}

// ============================================================================
// Engine
// ============================================================================

pub struct TickEngine {
    config: Arc<LumenConfig>,
    graph: Graph,
    delta: f64,
    alpha: f64,
    oracle: ThresholdOracle,
    controller: CriticalityController,
    targets: TargetSelector,
    safe_mode: SafeMode,
    injector: StimulusInjector,
    scheduler: TickScheduler,
    weight_decay: WeightDecay,
    branching: BranchingTracker,
    telemetry: Arc<dyn TelemetrySink>,
    pending_stimuli: VecDeque<Stimulus>,
    pending_mutations: VecDeque<GraphMutation>,
    tick_count: u64,
    safety: SafetyState,
    rho: f64,
    next: IntervalDecision,
    since_stimulus: Option<f64>,
    /// Simulated time drives the safe-mode clock, so a replay is reproducible.
    clock_origin: Instant,
    /// Wall seconds fed to the engine so far, uncapped.
    wall_secs: f64,
    telemetry_dropped: u64,
    prev_active: BTreeSet<NodeId>,
    stable_active_frames: u32,
    low_rho_frames: u32,
}

impl TickEngine {
    pub fn new(config: LumenConfig, graph: Graph) -> Self {
        let config = Arc::new(config);
        let c = &config;
        let prev_active = graph.active_nodes().map(|n| n.id.clone()).collect();
        let min = c.scheduler.min_interval_secs;
        tracing::info!(
            "Tick engine created: {} nodes, {} links, target rho {:.2}",
            graph.node_count(),
            graph.link_count(),
            c.criticality.rho_target
        );
        Self {
            graph,
            delta: c.decay.delta,
            alpha: c.diffusion.alpha,
            oracle: ThresholdOracle::new(c.threshold.clone()),
            controller: CriticalityController::new(c.criticality.clone()),
            targets: TargetSelector::new(c.criticality.hysteresis_frames),
            safe_mode: SafeMode::new(c.safe_mode.clone()),
            injector: StimulusInjector::new(&c.stimulus),
            scheduler: TickScheduler::new(c.scheduler.clone()),
            weight_decay: WeightDecay::new(&c.decay),
            branching: BranchingTracker::default(),
            telemetry: Arc::new(TracingSink),
            pending_stimuli: VecDeque::new(),
            pending_mutations: VecDeque::new(),
            tick_count: 0,
            safety: SafetyState::Critical,
            rho: c.criticality.rho_target,
            next: IntervalDecision {
                interval_secs: min,
                raw_secs: min,
                winning_factor: IntervalFactor::Stimulus,
                stimulus_secs: min,
                energy_secs: min,
                arousal_secs: min,
            },
            since_stimulus: None,
            clock_origin: Instant::now(),
            wall_secs: 0.0,
            telemetry_dropped: 0,
            prev_active,
            stable_active_frames: 0,
            low_rho_frames: 0,
            config,
        }
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry_dropped = sink.dropped();
        self.telemetry = sink;
        self
    }

    pub fn config(&self) -> &LumenConfig {
        &self.config
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn into_graph(self) -> Graph {
        self.graph
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn levers(&self) -> (f64, f64) {
        (self.delta, self.alpha)
    }

    pub fn safe_mode_status(&self) -> SafeModeStatus {
        self.safe_mode.status(self.now())
    }

    pub fn injector_stats(&self) -> InjectorStats {
        self.injector.stats()
    }

    pub fn pending_stimuli(&self) -> usize {
        self.pending_stimuli.len()
    }

    pub fn pending_mutations(&self) -> usize {
        self.pending_mutations.len()
    }

    /// Wait before the next tick.
    pub fn next_interval(&self) -> Duration {
        self.next.as_duration()
    }

    /// Queue a stimulus for the next tick. Returns its id.
    pub fn inject_stimulus(
        &mut self,
        text: impl Into<String>,
        embedding: Option<Vec<f32>>,
        source: SourceKey,
    ) -> Uuid {
        let stimulus = Stimulus::new(text, embedding, source);
        let id = stimulus.id;
        self.enqueue_stimulus(stimulus);
        id
    }

    pub fn enqueue_stimulus(&mut self, stimulus: Stimulus) {
        tracing::debug!("Queued stimulus {} from {}", stimulus.id, stimulus.source);
        self.pending_stimuli.push_back(stimulus);
    }

    /// Queue a structural edit; applied at the start of the next tick.
    pub fn submit_mutation(&mut self, mutation: GraphMutation) {
        self.pending_mutations.push_back(mutation);
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            tick_count: self.tick_count,
            node_count: self.graph.node_count(),
            active_node_count: self.graph.active_count(),
            global_energy: self.graph.total_energy(),
            spectral_radius: self.rho,
            safety_state: self.safety,
            safe_mode: self.safe_mode.is_active(),
            delta: self.delta,
            alpha: self.alpha,
            last_interval_secs: self.next.interval_secs,
            winning_factor: self.next.winning_factor,
            context: self.targets.current(),
            pending_stimuli: self.pending_stimuli.len(),
        }
    }

    fn now(&self) -> Instant {
        self.clock_origin + Duration::from_secs_f64(self.wall_secs)
    }

    /// One cycle using the previously scheduled interval as elapsed time.
    pub fn tick(&mut self) -> LumenResult<TickReport> {
        let elapsed = self.next.interval_secs;
        self.tick_with_elapsed(elapsed)
    }

    /// One cycle with an explicit elapsed wall time (capped before use).
    /// Fails only on structural corruption.
    pub fn tick_with_elapsed(&mut self, elapsed_secs: f64) -> LumenResult<TickReport> {
        let tick = self.tick_count + 1;
        let config = Arc::clone(&self.config);
        let overrides = self.safe_mode.overrides();
        let (dt, dt_capped) = self.scheduler.cap_dt(elapsed_secs, overrides.dt_cap_secs);
        // The cap bounds physics only; recency and safe-mode timing see real time.
        let wall = if elapsed_secs.is_finite() {
            elapsed_secs.max(0.0)
        } else {
            dt
        };
        self.wall_secs += wall;
        if let Some(since) = self.since_stimulus.as_mut() {
            *since += wall;
        }
        let now = self.now();
        let before = self.node_states();
        let mut transitions = Vec::new();

        // 1. Structural edits
        let (mutations_applied, mutations_rejected) = self.drain_mutations();
        verify_integrity(&self.graph)?;

        // 2. Stimuli
        let rho_proxy = HealthModulator::rho_proxy(
            self.graph.max_out_degree(),
            self.graph.mean_link_ease(),
            self.graph.active_count(),
        );
        let mut injections = Vec::new();
        let mut flips = 0usize;
        let mut budget_spent = 0.0;
        let mut last_source = None;
        while let Some(stimulus) = self.pending_stimuli.pop_front() {
            let (cands, mode) =
                candidates::search(&self.graph, &stimulus, config.stimulus.max_candidates);
            let result =
                self.injector
                    .inject(&stimulus, &cands, rho_proxy, !overrides.peripheral_disabled);
            let applied = apply_injection(&mut self.graph, &result);
            flips += applied.flips;
            budget_spent += applied.energy_added;
            last_source = Some(result.source.clone());
            injections.push(InjectionSummary {
                stimulus_id: result.stimulus_id,
                source: result.source,
                mode,
                nodes: applied.nodes,
                flips: applied.flips,
                breakdown: result.breakdown,
            });
        }
        let reason = if injections.is_empty() {
            TickReason::Autonomous
        } else {
            self.since_stimulus = Some(0.0);
            TickReason::StimulusDetected
        };

        // 3. Diffusion
        let diffusion = if config.diffusion.enabled {
            let params = DiffusionParams::new(self.alpha * overrides.alpha_multiplier, self.delta);
            diffuse(&mut self.graph, params, dt, config.diffusion.conservation_epsilon)
        } else {
            DiffusionReport::default()
        };
        let conservation = match &diffusion.violation {
            Some(v) => self.safe_mode.record_violation(
                TripwireType::Conservation,
                v.error.abs(),
                v.epsilon,
                format!("diffusion deltas sum to {:.3e}", v.error),
                now,
            ),
            None => self.safe_mode.record_compliance(TripwireType::Conservation, now),
        };
        transitions.extend(conservation);

        // 4. Decay
        let (decay, weight_decay) = if config.decay.enabled {
            let report = decay_energy(&mut self.graph, self.delta, dt, config.decay.energy_floor);
            let weights = self.weight_decay.advance(&mut self.graph, dt);
            decay_emotions(&mut self.graph, config.decay.emotion_decay_rate, dt);
            (report, weights)
        } else {
            (DecayReport::default(), None)
        };

        // 5. Thresholds
        let thresholds = if config.threshold.enabled {
            self.oracle.update(&mut self.graph, self.safety, tick)
        } else {
            ThresholdReport::default()
        };

        // 6. Frontier
        let frontier = compute_frontier(&self.graph);
        let frontier_fraction = frontier.fraction(self.graph.node_count());
        let overflow = frontier_fraction > config.safe_mode.frontier_fraction;
        let frontier_check = if overflow {
            self.safe_mode.record_violation(
                TripwireType::Frontier,
                frontier_fraction,
                config.safe_mode.frontier_fraction,
                format!("frontier covers {:.0}% of the graph", frontier_fraction * 100.0),
                now,
            )
        } else {
            self.safe_mode.record_compliance(TripwireType::Frontier, now)
        };
        transitions.extend(frontier_check);

        // 7. Criticality
        let active_now = frontier.active;
        let newly_active = active_now.difference(&self.prev_active).count();
        let branching = self.branching.measure(self.prev_active.len(), active_now.len());
        let matrix = TransitionMatrix::from_graph(&self.graph);
        let metrics = self.controller.update(&matrix, self.delta, self.alpha, branching, false);
        self.delta = metrics.delta_after;
        self.alpha = metrics.alpha_after;
        self.safety = metrics.safety_state;
        self.rho = metrics.rho;
        let bounds_check = match metrics.bounds {
            BoundsCheck::Within => self.safe_mode.record_compliance(TripwireType::Criticality, now),
            BoundsCheck::Below(rho) => self.safe_mode.record_violation(
                TripwireType::Criticality,
                rho,
                config.criticality.tripwire_lower,
                "spectral radius below band",
                now,
            ),
            BoundsCheck::Above(rho) => self.safe_mode.record_violation(
                TripwireType::Criticality,
                rho,
                config.criticality.tripwire_upper,
                "spectral radius above band",
                now,
            ),
        };
        transitions.extend(bounds_check);

        if active_now == self.prev_active && !active_now.is_empty() {
            self.stable_active_frames = self.stable_active_frames.saturating_add(1);
        } else {
            self.stable_active_frames = 0;
        }
        if metrics.rho < LOW_RHO {
            self.low_rho_frames = self.low_rho_frames.saturating_add(1);
        } else {
            self.low_rho_frames = 0;
        }
        let context = if config.criticality.adaptive_targets {
            let signals = self.context_signals(&active_now, newly_active);
            let context = self.targets.observe(&signals);
            self.controller.set_target(self.targets.target_rho());
            context
        } else {
            self.targets.current()
        };

        // 8. Observability
        let dropped = self.telemetry.dropped();
        let observability = if dropped > self.telemetry_dropped {
            self.safe_mode.record_violation(
                TripwireType::Observability,
                (dropped - self.telemetry_dropped) as f64,
                0.0,
                format!("{} telemetry events dropped", dropped - self.telemetry_dropped),
                now,
            )
        } else {
            self.safe_mode.record_compliance(TripwireType::Observability, now)
        };
        self.telemetry_dropped = dropped;
        transitions.extend(observability);

        // 9. Learning feedback
        if !injections.is_empty() && !overrides.learning_paused {
            let energies: Vec<f64> = self.graph.active_nodes().map(|n| n.energy).collect();
            self.injector.record_frame_result(
                last_source.as_ref(),
                rho_proxy,
                flips,
                budget_spent,
                entropy(&energies),
                overflow,
                Utc::now(),
            );
        }

        // 10. Next interval
        self.next = self.scheduler.next_interval(IntervalInputs {
            since_stimulus_secs: self.since_stimulus,
            active_energy: self.graph.active_energy(),
            mean_arousal: self.graph.mean_arousal(),
        });

        self.prev_active = active_now;
        self.tick_count = tick;

        let report = TickReport {
            tick,
            reason,
            dt_used: dt,
            dt_capped,
            mutations_applied,
            mutations_rejected,
            injections,
            flips,
            budget_spent,
            diffusion,
            decay,
            weight_decay,
            thresholds,
            frontier_fraction,
            criticality: metrics,
            newly_active,
            active_nodes: self.prev_active.len(),
            global_energy: self.graph.total_energy(),
            context,
            safe_mode: self.safe_mode.is_active(),
            transitions,
            next_interval: self.next,
            changed_nodes: self.changed_since(&before),
        };
        self.publish(&report);
        Ok(report)
    }

    fn drain_mutations(&mut self) -> (usize, usize) {
        let mut applied = 0;
        let mut rejected = 0;
        while let Some(m) = self.pending_mutations.pop_front() {
            match m.apply(&mut self.graph) {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!("Rejected graph mutation: {}", e);
                    rejected += 1;
                }
            }
        }
        if applied > 0 {
            tracing::debug!("Applied {} graph mutations", applied);
        }
        (applied, rejected)
    }

    fn context_signals(&self, active: &BTreeSet<NodeId>, newly_active: usize) -> ContextSignals {
        let active_nodes = active.iter().filter_map(|id| self.graph.node(id));
        let mut kinds = BTreeSet::new();
        let mut tasks = 0u32;
        let mut memory = false;
        for n in active_nodes {
            kinds.insert(kind_slot(n.kind));
            match n.kind {
                NodeKind::Task => tasks += 1,
                NodeKind::Memory => memory = true,
                _ => {}
            }
        }
        let node_count = self.graph.node_count().max(1);
        ContextSignals {
            exploration_goals: 0,
            implementation_tasks: tasks,
            memory_formation_active: memory,
            kind_diversity: kinds.len() as f64 / NODE_KINDS as f64,
            recent_flip_rate: newly_active as f64 / node_count as f64,
            stable_active_frames: self.stable_active_frames,
            low_rho_frames: self.low_rho_frames,
        }
    }

    fn node_states(&self) -> BTreeMap<NodeId, (f64, f64)> {
        self.graph
            .nodes()
            .map(|n| (n.id.clone(), (n.energy, n.threshold)))
            .collect()
    }

    fn changed_since(&self, before: &BTreeMap<NodeId, (f64, f64)>) -> Vec<NodeId> {
        self.graph
            .nodes()
            .filter(|n| before.get(&n.id) != Some(&(n.energy, n.threshold)))
            .map(|n| n.id.clone())
            .collect()
    }

    fn publish(&self, report: &TickReport) {
        for t in &report.transitions {
            let name = match t {
                SafeModeTransition::Entered { .. } => "safe_mode.entered",
                SafeModeTransition::Exited { .. } => "safe_mode.exited",
            };
            self.telemetry.emit(TelemetryEvent::new(
                name,
                report.tick,
                serde_json::to_value(t).unwrap_or_default(),
            ));
        }
        self.telemetry.emit(TelemetryEvent::new(
            "tick",
            report.tick,
            serde_json::to_value(report).unwrap_or_default(),
        ));
        if report.criticality.sampled {
            self.telemetry.emit(TelemetryEvent::new(
                "criticality",
                report.tick,
                json!({
                    "rho": report.criticality.rho,
                    "target": report.criticality.target,
                    "delta": report.criticality.delta_after,
                    "alpha": report.criticality.alpha_after,
                    "safety_state": report.criticality.safety_state,
                }),
            ));
        }
        tracing::trace!(
            "Tick {} ({:?}): dt={:.3}s active={} energy={:.3} rho={:.3}",
            report.tick,
            report.reason,
            report.dt_used,
            report.active_nodes,
            report.global_energy,
            report.criticality.rho
        );
    }
}

const NODE_KINDS: usize = 5;

fn kind_slot(kind: NodeKind) -> usize {
    match kind {
        NodeKind::Concept => 0,
        NodeKind::Memory => 1,
        NodeKind::Task => 2,
        NodeKind::Person => 3,
        NodeKind::Other => 4,
    }
}

/// Every link must connect two existing nodes.
fn verify_integrity(graph: &Graph) -> LumenResult<()> {
    if let Some(l) = graph
        .links()
        .iter()
        .find(|l| !graph.contains(&l.source) || !graph.contains(&l.target))
    {
        tracing::error!("Link {} -> {} references a missing node", l.source, l.target);
        return Err(LumenError::Corrupted(format!(
            "link {} -> {} references a missing node",
            l.source, l.target
        )));
    }
    Ok(())
}
