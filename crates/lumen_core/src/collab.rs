//! Interfaces to the engine's external collaborators.
//!
//! The engine depends only on these traits; storage formats, embedding models
//! and event transports live behind them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{Graph, NodeId};

/// Minimal per-node state written back after ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStateRecord {
    pub id: NodeId,
    pub energy: f64,
    pub threshold: f64,
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn load_graph(&self, name: &str) -> anyhow::Result<Graph>;
    async fn upsert_node_states(&self, name: &str, records: &[NodeStateRecord]) -> anyhow::Result<()>;
}

/// Text to fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
    fn dimensions(&self) -> usize;
}

/// A named event with an arbitrary JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub name: String,
    pub tick: u64,
    pub at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl TelemetryEvent {
    pub fn new(name: impl Into<String>, tick: u64, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            tick,
            at: Utc::now(),
            payload,
        }
    }
}

/// Fire-and-forget event sink. Implementations must never block the caller.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);

    /// Events lost so far (full or closed transport). A rising count trips
    /// the observability wire.
    fn dropped(&self) -> u64 {
        0
    }
}
