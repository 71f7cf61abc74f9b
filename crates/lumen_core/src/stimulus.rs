//! External stimuli and the source taxonomy used to group them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Closed set of stimulus origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    UserMessage,
    ToolResult,
    Observation,
    Document,
    Internal,
}

impl SourceType {
    pub const ALL: [SourceType; 5] = [
        SourceType::UserMessage,
        SourceType::ToolResult,
        SourceType::Observation,
        SourceType::Document,
        SourceType::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::UserMessage => "user_message",
            SourceType::ToolResult => "tool_result",
            SourceType::Observation => "observation",
            SourceType::Document => "document",
            SourceType::Internal => "internal",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SourceType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown source type '{}'", s))
    }
}

/// Cohort key for source-impact learning: a source type scoped to a channel,
/// a tool name, a feed, and so on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceKey {
    pub kind: SourceType,
    pub scope: String,
}

impl SourceKey {
    pub const GLOBAL_SCOPE: &'static str = "global";

    pub fn new(kind: SourceType, scope: impl Into<String>) -> Self {
        Self {
            kind,
            scope: scope.into(),
        }
    }

    pub fn of(kind: SourceType) -> Self {
        Self::new(kind, Self::GLOBAL_SCOPE)
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.scope)
    }
}

/// A queued stimulus waiting for the next tick boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stimulus {
    pub id: Uuid,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    pub source: SourceKey,
    /// Embeddings of surrounding context, used for peripheral amplification.
    #[serde(default)]
    pub context: Vec<Vec<f32>>,
    pub received_at: DateTime<Utc>,
}

impl Stimulus {
    pub fn new(text: impl Into<String>, embedding: Option<Vec<f32>>, source: SourceKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            embedding,
            source,
            context: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn with_context(mut self, context: Vec<Vec<f32>>) -> Self {
        self.context = context;
        self
    }
}
