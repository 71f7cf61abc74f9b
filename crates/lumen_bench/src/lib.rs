//! lumen_bench: trajectory simulation tests for the tick engine.
//!
//! Validates emergent behavior over long simulated time spans:
//! - Criticality control (ρ settles on its target)
//! - Silent decay (an unstimulated graph goes quiet)
//! - Stimulus burst (energy spikes, then recovers without runaway)
//! - Adaptive cadence (ticks speed up on input, back off in silence)

use lumen_core::{Graph, Link, LumenConfig, Node, NodeKind, SourceKey, SourceType};
use lumen_runtime::{TickEngine, TickReport};

/// Fully connected graph with uniform link weights.
pub fn complete_graph(n: usize, energy: f64) -> Graph {
    let mut g = Graph::new();
    for i in 0..n {
        g.insert_node(Node::new(format!("n{}", i), NodeKind::Concept).with_energy(energy));
    }
    for i in 0..n {
        for j in 0..n {
            if i != j {
                let _ = g.add_link(Link::new(format!("n{}", i), format!("n{}", j), 0.0));
            }
        }
    }
    g
}

/// Linear chain n0 → n1 → … with all energy on the head.
pub fn chain_graph(n: usize, head_energy: f64) -> Graph {
    let mut g = Graph::new();
    for i in 0..n {
        let e = if i == 0 { head_energy } else { 0.0 };
        g.insert_node(Node::new(format!("n{}", i), NodeKind::Concept).with_energy(e));
    }
    for i in 1..n {
        let _ = g.add_link(Link::with_ease(format!("n{}", i - 1), format!("n{}", i), 0.5));
    }
    g
}

/// Run `ticks` fixed-step ticks, returning every report.
pub fn simulate(engine: &mut TickEngine, ticks: usize, step_secs: f64) -> Vec<TickReport> {
    (0..ticks)
        .filter_map(|_| engine.tick_with_elapsed(step_secs).ok())
        .collect()
}

pub fn seeded_config(seed: u64) -> LumenConfig {
    let mut c = LumenConfig::default();
    c.criticality.seed = Some(seed);
    c
}

pub fn stimulate(engine: &mut TickEngine, text: &str) {
    engine.inject_stimulus(text, None, SourceKey::of(SourceType::UserMessage));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean(xs: impl Iterator<Item = f64>) -> f64 {
        let v: Vec<f64> = xs.collect();
        v.iter().sum::<f64>() / v.len().max(1) as f64
    }

    /// The controller drives the sampled spectral radius onto its target.
    #[test]
    fn test_rho_settles_on_target() {
        let mut cfg = seeded_config(42);
        cfg.criticality.rho_target = 0.9;
        cfg.criticality.sample_every = 1;
        let mut engine = TickEngine::new(cfg, complete_graph(12, 2.0));

        let reports = simulate(&mut engine, 400, 1.0);
        assert_eq!(reports.len(), 400);

        let settled = mean(reports[300..].iter().map(|r| r.criticality.rho));
        assert!(
            (settled - 0.9).abs() < 0.05,
            "rho should settle near 0.9, got {}",
            settled
        );
        let (delta, _) = engine.levers();
        assert!(delta > 0.03, "decay should rise to pull rho down, got {}", delta);
    }

    /// Hours of silence: energy drains away and nothing stays active.
    #[test]
    fn test_silent_decay() {
        let mut engine = TickEngine::new(seeded_config(1), chain_graph(8, 50.0));
        let start = engine.graph().total_energy();

        let reports = simulate(&mut engine, 10_000, 5.0);
        let last = reports.last().unwrap();
        assert!(
            last.global_energy < start * 0.01,
            "energy should drain, got {} of {}",
            last.global_energy,
            start
        );
        assert_eq!(last.active_nodes, 0);
        assert!(reports.windows(2).all(|w| w[1].global_energy <= w[0].global_energy + 1e-9));
    }

    /// A burst of stimuli raises energy; silence afterwards brings it back
    /// down instead of letting it run away.
    #[test]
    fn test_stimulus_burst_and_recovery() {
        let mut engine = TickEngine::new(seeded_config(7), chain_graph(6, 0.0));
        let baseline = engine.graph().total_energy();

        for _ in 0..20 {
            stimulate(&mut engine, "n0 n1 n2");
            engine.tick_with_elapsed(1.0).unwrap();
        }
        let peak = engine.graph().total_energy();
        assert!(peak > baseline, "burst should add energy: {} -> {}", baseline, peak);

        let reports = simulate(&mut engine, 6000, 5.0);
        let end = reports.last().unwrap().global_energy;
        assert!(end < peak * 0.1, "energy should recover: peak {} end {}", peak, end);
        assert!(reports.iter().all(|r| r.global_energy.is_finite()));
    }

    /// Cadence follows input: fast right after a stimulus, near the
    /// maximum interval after a long quiet spell.
    #[test]
    fn test_cadence_follows_input() {
        let cfg = seeded_config(3);
        let max = cfg.scheduler.max_interval_secs;
        let mut engine = TickEngine::new(cfg, chain_graph(4, 0.0));

        stimulate(&mut engine, "n0");
        engine.tick().unwrap();
        let busy = engine.next_interval().as_secs_f64();

        for _ in 0..1000 {
            engine.tick().unwrap();
        }
        let idle = engine.next_interval().as_secs_f64();
        assert!(idle > busy, "idle {} should exceed busy {}", idle, busy);
        assert!(idle > max * 0.5, "idle interval {} should approach {}", idle, max);
    }
}
