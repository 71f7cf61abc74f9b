//! Conservative energy redistribution along links.
//!
//! All transfers are staged into a [`DeltaBuffer`] computed from the pre-tick
//! energies, then applied in one pass, so no node ever observes a partially
//! updated neighbour and traversal order cannot change the outcome.

use lumen_core::{Graph, NodeId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// The two propagation levers the criticality controller adjusts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DiffusionParams {
    /// Share of a node's energy offered to its out-links per second.
    pub alpha: f64,
    /// Energy decay rate per second.
    pub delta: f64,
}

impl DiffusionParams {
    pub fn new(alpha: f64, delta: f64) -> Self {
        Self {
            alpha: lumen_core::numeric::sanitize(alpha, 0.0, "diffusion.alpha").clamp(0.0, 1.0),
            delta: lumen_core::numeric::sanitize(delta, 0.0, "decay.delta").clamp(0.0, 1.0),
        }
    }
}

/// Staged per-node energy deltas.
#[derive(Debug, Clone, Default)]
pub struct DeltaBuffer {
    deltas: BTreeMap<NodeId, f64>,
}

impl DeltaBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, id: &NodeId, delta: f64) {
        *self.deltas.entry(id.clone()).or_insert(0.0) += delta;
    }

    pub fn get(&self, id: &NodeId) -> f64 {
        self.deltas.get(id).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, f64)> {
        self.deltas.iter().map(|(k, v)| (k, *v))
    }

    /// Σ deltas. Zero (within rounding) for a conservative step.
    pub fn conservation_error(&self) -> f64 {
        self.deltas.values().sum()
    }

    /// Apply every staged delta. Returns the number of nodes touched.
    pub fn apply(&self, graph: &mut Graph) -> usize {
        let mut touched = 0;
        for (id, delta) in &self.deltas {
            if let Some(node) = graph.node_mut(id) {
                node.energy = (node.energy + delta).max(0.0);
                touched += 1;
            }
        }
        touched
    }
}

/// Diffusion moved (or would have moved) energy out of nowhere.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ConservationViolation {
    pub error: f64,
    pub epsilon: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiffusionReport {
    /// Total energy moved along links.
    pub transferred: f64,
    pub nodes_touched: usize,
    pub conservation_error: f64,
    /// False when the staged deltas were non-finite and were discarded.
    pub applied: bool,
    pub violation: Option<ConservationViolation>,
}

/// Stage one diffusion step: each link moves `source.E × ease × α × dt`,
/// with a node's outflows scaled down together when they would exceed its energy.
pub fn stage_diffusion(graph: &Graph, alpha: f64, dt: f64) -> (DeltaBuffer, f64) {
    let mut buffer = DeltaBuffer::new();
    let mut transferred = 0.0;
    if alpha <= 0.0 || dt <= 0.0 {
        return (buffer, transferred);
    }

    let mut proposals: Vec<(&NodeId, f64)> = Vec::new();
    for node in graph.nodes() {
        if node.energy <= 0.0 {
            continue;
        }
        proposals.clear();
        for link in graph.outgoing(&node.id) {
            if link.target == node.id {
                continue;
            }
            proposals.push((&link.target, node.energy * link.ease() * alpha * dt));
        }
        let outflow: f64 = proposals.iter().map(|(_, amount)| amount).sum();
        if outflow <= 0.0 {
            continue;
        }
        let scale = if outflow > node.energy {
            node.energy / outflow
        } else {
            1.0
        };
        for (target, amount) in &proposals {
            let moved = amount * scale;
            buffer.add(&node.id, -moved);
            buffer.add(target, moved);
            transferred += moved;
        }
    }
    (buffer, transferred)
}

/// Run one diffusion step and report conservation. A violation beyond
/// `epsilon` is reported, never corrected; non-finite deltas are not applied.
pub fn diffuse(graph: &mut Graph, params: DiffusionParams, dt: f64, epsilon: f64) -> DiffusionReport {
    let (buffer, transferred) = stage_diffusion(graph, params.alpha, dt);
    let conservation_error = buffer.conservation_error();

    let violation = if conservation_error.abs() <= epsilon {
        None
    } else {
        tracing::warn!(
            "Diffusion conservation error {:.6} exceeds epsilon {}",
            conservation_error,
            epsilon
        );
        Some(ConservationViolation {
            error: conservation_error,
            epsilon,
        })
    };

    let finite = conservation_error.is_finite() && transferred.is_finite();
    let nodes_touched = if finite { buffer.apply(graph) } else { 0 };

    DiffusionReport {
        transferred: if finite { transferred } else { 0.0 },
        nodes_touched,
        conservation_error,
        applied: finite,
        violation,
    }
}

// ============================================================================
// Frontier
// ============================================================================

/// Active nodes plus their one-hop, not-yet-active neighbours.
#[derive(Debug, Clone, Default)]
pub struct Frontier {
    pub active: BTreeSet<NodeId>,
    pub shadow: BTreeSet<NodeId>,
}

impl Frontier {
    pub fn len(&self) -> usize {
        self.active.len() + self.shadow.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.shadow.is_empty()
    }

    /// Share of the graph currently on the frontier.
    pub fn fraction(&self, node_count: usize) -> f64 {
        if node_count == 0 {
            0.0
        } else {
            self.len() as f64 / node_count as f64
        }
    }
}

pub fn compute_frontier(graph: &Graph) -> Frontier {
    let active: BTreeSet<NodeId> = graph.active_nodes().map(|n| n.id.clone()).collect();
    let shadow = active
        .iter()
        .flat_map(|id| graph.outgoing(id))
        .map(|l| &l.target)
        .filter(|t| !active.contains(*t))
        .cloned()
        .collect();
    Frontier { active, shadow }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::{Link, Node, NodeKind};

    fn chain(order: &[&str]) -> Graph {
        let mut g = Graph::new();
        for id in order {
            let energy = if *id == "a" { 10.0 } else { 0.0 };
            g.insert_node(Node::new(*id, NodeKind::Concept).with_energy(energy));
        }
        g.add_link(Link::with_ease("a", "b", 0.5)).unwrap();
        g.add_link(Link::with_ease("b", "c", 0.5)).unwrap();
        g
    }

    #[test]
    fn test_chain_scenario() {
        for order in [["a", "b", "c"], ["c", "b", "a"], ["b", "c", "a"]] {
            let mut g = chain(&order);
            let report = diffuse(&mut g, DiffusionParams::new(0.2, 0.0), 1.0, 0.001);
            assert!(report.violation.is_none());
            let e = |id: &str| g.node(&id.into()).unwrap().energy;
            assert!((e("a") - 9.0).abs() < 1e-12, "A should lose 1.0, got {}", e("a"));
            assert!((e("b") - 1.0).abs() < 1e-12, "B should gain 1.0, got {}", e("b"));
            assert_eq!(e("c"), 0.0);
        }
    }

    #[test]
    fn test_outflow_capped_at_energy() {
        let mut g = Graph::new();
        g.insert_node(Node::new("s", NodeKind::Concept).with_energy(1.0));
        for t in ["t1", "t2", "t3"] {
            g.insert_node(Node::new(t, NodeKind::Concept));
            g.add_link(Link::with_ease("s", t, 5.0)).unwrap();
        }
        let report = diffuse(&mut g, DiffusionParams::new(1.0, 0.0), 1.0, 0.001);
        assert!(report.violation.is_none());
        assert!(g.node(&"s".into()).unwrap().energy.abs() < 1e-12);
        for t in ["t1", "t2", "t3"] {
            let e = g.node(&t.into()).unwrap().energy;
            assert!((e - 1.0 / 3.0).abs() < 1e-12);
        }
        assert!((g.total_energy() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_alpha_is_noop() {
        let mut g = chain(&["a", "b", "c"]);
        let report = diffuse(&mut g, DiffusionParams::new(0.0, 0.0), 1.0, 0.001);
        assert_eq!(report.nodes_touched, 0);
        assert_eq!(g.node(&"a".into()).unwrap().energy, 10.0);
    }

    #[test]
    fn test_non_finite_energy_is_reported_not_applied() {
        let mut g = chain(&["a", "b", "c"]);
        g.node_mut(&"a".into()).unwrap().energy = f64::INFINITY;
        let report = diffuse(&mut g, DiffusionParams::new(0.2, 0.0), 1.0, 0.001);
        assert!(report.violation.is_some());
        assert!(!report.applied);
        assert_eq!(g.node(&"b".into()).unwrap().energy, 0.0);
    }

    #[test]
    fn test_frontier() {
        let mut g = chain(&["a", "b", "c"]);
        g.node_mut(&"a".into()).unwrap().threshold = 1.0;
        let f = compute_frontier(&g);
        assert_eq!(f.active.len(), 1);
        assert!(f.shadow.contains(&NodeId::from("b")));
        assert!((f.fraction(3) - 2.0 / 3.0).abs() < 1e-12);
    }
}
