//! In-memory directed graph of energy-carrying nodes.
//!
//! The engine only ever mutates the numeric fields of nodes and links
//! (energy, threshold, log-weight, emotion metadata). Structural changes
//! arrive as [`GraphMutation`]s that are drained at tick boundaries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::GraphError;

/// Hard cap on the L2 magnitude of any emotion vector.
pub const EMOTION_MAX_MAGNITUDE: f32 = 1.0;

/// Initial threshold used when a seed omits one.
pub const DEFAULT_THRESHOLD: f64 = 1.0;

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        NodeId(s)
    }
}

/// Closed set of node categories. Each kind has its own threshold baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    #[default]
    Concept,
    Memory,
    Task,
    Person,
    Other,
}

// ============================================================================
// Emotion metadata
// ============================================================================

/// Bounded affect coloring attached to nodes and links.
///
/// Pure metadata: nothing in the control loop reads it. It decays on its own
/// (slower) clock and its magnitude never exceeds [`EMOTION_MAX_MAGNITUDE`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<f32>", into = "Vec<f32>")]
pub struct EmotionVector(Vec<f32>);

impl From<Vec<f32>> for EmotionVector {
    fn from(components: Vec<f32>) -> Self {
        Self::new(components)
    }
}

impl From<EmotionVector> for Vec<f32> {
    fn from(v: EmotionVector) -> Self {
        v.0
    }
}

impl EmotionVector {
    pub fn new(components: Vec<f32>) -> Self {
        let mut v = Self(
            components
                .into_iter()
                .map(|c| if c.is_finite() { c } else { 0.0 })
                .collect(),
        );
        v.cap();
        v
    }

    pub fn components(&self) -> &[f32] {
        &self.0
    }

    pub fn magnitude(&self) -> f32 {
        self.0.iter().map(|c| c * c).sum::<f32>().sqrt()
    }

    /// Exponential shrink toward zero: v *= exp(-rate * dt).
    pub fn decay(&mut self, rate: f64, dt: f64) {
        let factor = (-rate.max(0.0) * dt.max(0.0)).exp() as f32;
        for c in &mut self.0 {
            *c *= factor;
        }
    }

    fn cap(&mut self) {
        let mag = self.magnitude();
        if mag > EMOTION_MAX_MAGNITUDE {
            let scale = EMOTION_MAX_MAGNITUDE / mag;
            for c in &mut self.0 {
                *c *= scale;
            }
        }
    }
}

// ============================================================================
// Node / Link
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub kind: NodeKind,
    /// Activation strength, E >= 0.
    #[serde(default)]
    pub energy: f64,
    /// Activation floor in the same units as energy; active iff E >= θ.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Additive learning signal; ease = exp(log_weight).
    #[serde(default)]
    pub log_weight: f64,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub emotion: Option<EmotionVector>,
    /// Tick at which the node was last observed active.
    #[serde(default)]
    pub last_active_tick: Option<u64>,
    /// Externally assessed quality in [0, 1].
    #[serde(default)]
    pub quality: f64,
    /// Goal/context affinity in [-1, 1].
    #[serde(default)]
    pub affinity: f64,
}

fn default_threshold() -> f64 {
    DEFAULT_THRESHOLD
}

impl Node {
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            energy: 0.0,
            threshold: DEFAULT_THRESHOLD,
            log_weight: 0.0,
            embedding: None,
            emotion: None,
            last_active_tick: None,
            quality: 0.0,
            affinity: 0.0,
        }
    }

    pub fn with_energy(mut self, energy: f64) -> Self {
        self.energy = energy.max(0.0);
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn is_active(&self) -> bool {
        self.energy >= self.threshold
    }

    /// Distance to the threshold, zero when already active.
    pub fn gap(&self) -> f64 {
        (self.threshold - self.energy).max(0.0)
    }

    pub fn ease(&self) -> f64 {
        self.log_weight.exp()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub source: NodeId,
    pub target: NodeId,
    #[serde(default)]
    pub log_weight: f64,
    #[serde(default)]
    pub emotion: Option<EmotionVector>,
}

impl Link {
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>, log_weight: f64) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            log_weight,
            emotion: None,
        }
    }

    /// Link with a given ease (multiplicative transmissibility).
    pub fn with_ease(source: impl Into<NodeId>, target: impl Into<NodeId>, ease: f64) -> Self {
        Self::new(source, target, ease.max(f64::MIN_POSITIVE).ln())
    }

    pub fn ease(&self) -> f64 {
        self.log_weight.exp()
    }
}

// ============================================================================
// Graph
// ============================================================================

/// Serializable graph contents, used for seeds and persistence round trips.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphSeed {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub links: Vec<Link>,
}

/// Owns every node and link. Iteration order is deterministic (by node id,
/// then link insertion order) so that a tick is reproducible.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: BTreeMap<NodeId, Node>,
    links: Vec<Link>,
    outgoing: BTreeMap<NodeId, Vec<usize>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: GraphSeed) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for node in seed.nodes {
            graph.insert_node(node);
        }
        for link in seed.links {
            graph.add_link(link)?;
        }
        Ok(graph)
    }

    pub fn to_seed(&self) -> GraphSeed {
        GraphSeed {
            nodes: self.nodes.values().cloned().collect(),
            links: self.links.clone(),
        }
    }

    /// Insert or replace a node. Returns the previous node with that id.
    pub fn insert_node(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.id.clone(), node)
    }

    /// Add a link, replacing the weight of an existing (source, target) pair.
    pub fn add_link(&mut self, link: Link) -> Result<(), GraphError> {
        if !self.nodes.contains_key(&link.source) || !self.nodes.contains_key(&link.target) {
            return Err(GraphError::MissingEndpoint {
                from: link.source,
                to: link.target,
            });
        }
        if let Some(idx) = self.find_link(&link.source, &link.target) {
            self.links[idx] = link;
            return Ok(());
        }
        let idx = self.links.len();
        self.outgoing
            .entry(link.source.clone())
            .or_default()
            .push(idx);
        self.links.push(link);
        Ok(())
    }

    /// Remove a node together with every incident link.
    pub fn remove_node(&mut self, id: &NodeId) -> Option<Node> {
        let removed = self.nodes.remove(id)?;
        self.links.retain(|l| &l.source != id && &l.target != id);
        self.rebuild_index();
        Some(removed)
    }

    pub fn remove_link(&mut self, source: &NodeId, target: &NodeId) -> Option<Link> {
        let idx = self.find_link(source, target)?;
        let link = self.links.remove(idx);
        self.rebuild_index();
        Some(link)
    }

    fn find_link(&self, source: &NodeId, target: &NodeId) -> Option<usize> {
        self.outgoing
            .get(source)?
            .iter()
            .copied()
            .find(|&i| &self.links[i].target == target)
    }

    fn rebuild_index(&mut self) {
        self.outgoing.clear();
        for (idx, link) in self.links.iter().enumerate() {
            self.outgoing
                .entry(link.source.clone())
                .or_default()
                .push(idx);
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: &NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn links_mut(&mut self) -> impl Iterator<Item = &mut Link> {
        self.links.iter_mut()
    }

    pub fn outgoing<'a>(&'a self, id: &NodeId) -> impl Iterator<Item = &'a Link> + 'a {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.links[i])
    }

    pub fn out_degree(&self, id: &NodeId) -> usize {
        self.outgoing.get(id).map_or(0, Vec::len)
    }

    pub fn max_out_degree(&self) -> usize {
        self.outgoing.values().map(Vec::len).max().unwrap_or(0)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn total_energy(&self) -> f64 {
        self.nodes.values().map(|n| n.energy).sum()
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().filter(|n| n.is_active())
    }

    pub fn active_count(&self) -> usize {
        self.active_nodes().count()
    }

    /// Energy held by currently active nodes.
    pub fn active_energy(&self) -> f64 {
        self.active_nodes().map(|n| n.energy).sum()
    }

    pub fn mean_link_ease(&self) -> f64 {
        if self.links.is_empty() {
            return 0.0;
        }
        self.links.iter().map(Link::ease).sum::<f64>() / self.links.len() as f64
    }

    /// Mean emotion magnitude over nodes that carry emotion metadata.
    pub fn mean_arousal(&self) -> f64 {
        let (sum, count) = self
            .nodes
            .values()
            .filter_map(|n| n.emotion.as_ref())
            .fold((0.0f64, 0usize), |(s, c), e| (s + e.magnitude() as f64, c + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}

// ============================================================================
// Queued structural edits
// ============================================================================

/// An external edit, queued and applied only between ticks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphMutation {
    UpsertNode(Node),
    RemoveNode { id: NodeId },
    UpsertLink(Link),
    RemoveLink { source: NodeId, target: NodeId },
    SetEnergy { id: NodeId, energy: f64 },
}

impl GraphMutation {
    pub fn apply(self, graph: &mut Graph) -> Result<(), GraphError> {
        match self {
            GraphMutation::UpsertNode(node) => {
                graph.insert_node(node);
            }
            GraphMutation::RemoveNode { id } => {
                graph.remove_node(&id).ok_or(GraphError::MissingNode(id))?;
            }
            GraphMutation::UpsertLink(link) => graph.add_link(link)?,
            GraphMutation::RemoveLink { source, target } => {
                graph
                    .remove_link(&source, &target)
                    .ok_or(GraphError::MissingLink {
                        from: source,
                        to: target,
                    })?;
            }
            GraphMutation::SetEnergy { id, energy } => {
                let node = graph
                    .node_mut(&id)
                    .ok_or_else(|| GraphError::MissingNode(id.clone()))?;
                node.energy = if energy.is_finite() { energy.max(0.0) } else { 0.0 };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> Graph {
        let mut g = Graph::new();
        for id in ["a", "b", "c"] {
            g.insert_node(Node::new(id, NodeKind::Concept));
        }
        g.add_link(Link::with_ease("a", "b", 0.5)).unwrap();
        g.add_link(Link::with_ease("b", "c", 0.5)).unwrap();
        g
    }

    #[test]
    fn test_link_requires_endpoints() {
        let mut g = chain();
        let err = g.add_link(Link::new("a", "zz", 0.0)).unwrap_err();
        assert!(matches!(err, GraphError::MissingEndpoint { .. }));
        assert_eq!(err.to_string(), "link a -> zz references a missing endpoint");
    }

    #[test]
    fn test_duplicate_link_replaces_weight() {
        let mut g = chain();
        g.add_link(Link::new("a", "b", 1.0)).unwrap();
        assert_eq!(g.link_count(), 2);
        let l = g.outgoing(&"a".into()).next().unwrap();
        assert!((l.log_weight - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_remove_node_drops_incident_links() {
        let mut g = chain();
        g.remove_node(&"b".into()).unwrap();
        assert_eq!(g.link_count(), 0);
        assert_eq!(g.outgoing(&"a".into()).count(), 0);
    }

    #[test]
    fn test_ease_roundtrip() {
        let l = Link::with_ease("a", "b", 0.5);
        assert!((l.ease() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_active_and_gap() {
        let n = Node::new("x", NodeKind::Task).with_energy(0.4).with_threshold(1.0);
        assert!(!n.is_active());
        assert!((n.gap() - 0.6).abs() < 1e-12);
        let n = n.with_energy(1.0);
        assert!(n.is_active());
        assert_eq!(n.gap(), 0.0);
    }

    #[test]
    fn test_emotion_capped_and_decays() {
        let mut e = EmotionVector::new(vec![3.0, 4.0]);
        assert!((e.magnitude() - EMOTION_MAX_MAGNITUDE).abs() < 1e-6);
        e.decay(0.5, 2.0);
        assert!(e.magnitude() < EMOTION_MAX_MAGNITUDE);
    }

    #[test]
    fn test_seed_roundtrip_keeps_structure() {
        let g = chain();
        let json = serde_json::to_string(&g.to_seed()).unwrap();
        let seed: GraphSeed = serde_json::from_str(&json).unwrap();
        let g2 = Graph::from_seed(seed).unwrap();
        assert_eq!(g2.node_count(), 3);
        assert_eq!(g2.link_count(), 2);
        assert_eq!(g2.out_degree(&"b".into()), 1);
    }

    #[test]
    fn test_mutations() {
        let mut g = chain();
        GraphMutation::SetEnergy { id: "a".into(), energy: -3.0 }
            .apply(&mut g)
            .unwrap();
        assert_eq!(g.node(&"a".into()).unwrap().energy, 0.0);

        let err = GraphMutation::RemoveNode { id: "nope".into() }.apply(&mut g);
        assert!(err.is_err());

        GraphMutation::RemoveLink { source: "a".into(), target: "b".into() }
            .apply(&mut g)
            .unwrap();
        assert_eq!(g.link_count(), 1);
    }
}
