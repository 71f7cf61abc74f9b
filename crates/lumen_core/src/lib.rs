//! # Lumen core
//!
//! Shared vocabulary of the tick engine: the energy graph, the single
//! configuration value threaded through every phase, the error taxonomy and
//! the traits that external collaborators (persistence, embedding,
//! telemetry) implement.

pub mod collab;
pub mod config;
pub mod error;
pub mod graph;
pub mod numeric;
pub mod stimulus;

pub use collab::{Embedder, GraphStore, NodeStateRecord, TelemetryEvent, TelemetrySink};
pub use config::LumenConfig;
pub use error::{EmbeddingError, GraphError, LumenError, LumenResult};
pub use graph::{
    EmotionVector, Graph, GraphMutation, GraphSeed, Link, Node, NodeId, NodeKind,
    EMOTION_MAX_MAGNITUDE,
};
pub use stimulus::{SourceKey, SourceType, Stimulus};
