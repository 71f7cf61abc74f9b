//! Error taxonomy.
//!
//! Numerical and configuration faults never surface as errors: they resolve to
//! neutral values or clamped parameters. What remains here are collaborator
//! failures (recovered locally by the runtime) and structural corruption.

use crate::graph::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("node {0} not found")]
    MissingNode(NodeId),
    #[error("link {from} -> {to} references a missing endpoint")]
    MissingEndpoint { from: NodeId, to: NodeId },
    #[error("link {from} -> {to} not found")]
    MissingLink { from: NodeId, to: NodeId },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EmbeddingError {
    #[error("embedding request timed out after {0:.1}s")]
    Timeout(f64),
    #[error("embedding circuit open, retry in {0:.1}s")]
    CircuitOpen(f64),
    #[error("embedding backend failed: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum LumenError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error(transparent)]
    Embedding(#[from] EmbeddingError),
    #[error("engine queue closed")]
    QueueClosed,
    /// Internal structure is inconsistent; the only fatal fault.
    #[error("graph corrupted: {0}")]
    Corrupted(String),
}

pub type LumenResult<T> = std::result::Result<T, LumenError>;
