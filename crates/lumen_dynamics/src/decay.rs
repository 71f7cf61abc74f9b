//! Multi-timescale forgetting.
//!
//! Energy decays every tick (fast), link/node log-weights on a slow cadence,
//! and emotion metadata on its own clock. None of these share a rate.

use lumen_core::config::DecayConfig;
use lumen_core::Graph;
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DecayReport {
    pub energy_lost: f64,
    pub nodes_touched: usize,
    /// Nodes that fell below the floor and were zeroed.
    pub floored: usize,
}

/// E ← E · exp(−δ·dt). A node that crosses below `floor` this step snaps to zero.
pub fn decay_energy(graph: &mut Graph, delta: f64, dt: f64, floor: f64) -> DecayReport {
    let mut report = DecayReport::default();
    if dt <= 0.0 {
        return report;
    }
    let factor = (-delta.max(0.0) * dt).exp();
    for node in graph.nodes_mut() {
        if node.energy <= 0.0 {
            continue;
        }
        let before = node.energy;
        let mut after = before * factor;
        if before >= floor && after < floor {
            after = 0.0;
            report.floored += 1;
        }
        node.energy = after;
        report.energy_lost += before - after;
        report.nodes_touched += 1;
    }
    report
}

pub fn decay_emotions(graph: &mut Graph, rate: f64, dt: f64) {
    if rate <= 0.0 || dt <= 0.0 {
        return;
    }
    for node in graph.nodes_mut() {
        if let Some(e) = node.emotion.as_mut() {
            e.decay(rate, dt);
        }
    }
    for link in graph.links_mut() {
        if let Some(e) = link.emotion.as_mut() {
            e.decay(rate, dt);
        }
    }
}

// ============================================================================
// Slow weight decay
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WeightDecayReport {
    /// Seconds covered by this application.
    pub elapsed: f64,
    pub nodes: usize,
    pub links: usize,
}

/// Accumulates tick time and applies log-weight decay once per cadence.
#[derive(Debug, Clone)]
pub struct WeightDecay {
    rate: f64,
    cadence_secs: f64,
    floor: f64,
    ceiling: f64,
    accumulated: f64,
}

impl WeightDecay {
    pub fn new(config: &DecayConfig) -> Self {
        Self {
            rate: config.weight_decay_rate,
            cadence_secs: config.weight_decay_cadence_secs,
            floor: config.weight_floor,
            ceiling: config.weight_ceiling,
            accumulated: 0.0,
        }
    }

    /// Seconds accumulated since the last application.
    pub fn pending(&self) -> f64 {
        self.accumulated
    }

    pub fn advance(&mut self, graph: &mut Graph, dt: f64) -> Option<WeightDecayReport> {
        if dt > 0.0 {
            self.accumulated += dt;
        }
        if self.accumulated < self.cadence_secs {
            return None;
        }
        let elapsed = std::mem::take(&mut self.accumulated);
        let step = self.rate * elapsed;

        let mut nodes = 0;
        for node in graph.nodes_mut() {
            node.log_weight = (node.log_weight - step).clamp(self.floor, self.ceiling);
            nodes += 1;
        }
        let mut links = 0;
        for link in graph.links_mut() {
            link.log_weight = (link.log_weight - step).clamp(self.floor, self.ceiling);
            links += 1;
        }
        tracing::debug!("Weight decay applied over {:.1}s ({} nodes, {} links)", elapsed, nodes, links);
        Some(WeightDecayReport { elapsed, nodes, links })
    }
}
