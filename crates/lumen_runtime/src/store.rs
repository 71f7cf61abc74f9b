//! In-memory [`GraphStore`] for tests and the CLI.

use anyhow::Context;
use async_trait::async_trait;
use lumen_core::{Graph, GraphStore, NodeStateRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryGraphStore {
    graphs: RwLock<HashMap<String, Graph>>,
    writes: AtomicU64,
    fail_next: AtomicU32,
}

impl InMemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_graph(name: impl Into<String>, graph: Graph) -> Self {
        let mut graphs = HashMap::new();
        graphs.insert(name.into(), graph);
        Self {
            graphs: RwLock::new(graphs),
            ..Default::default()
        }
    }

    pub async fn insert(&self, name: impl Into<String>, graph: Graph) {
        self.graphs.write().await.insert(name.into(), graph);
    }

    pub async fn get(&self, name: &str) -> Option<Graph> {
        self.graphs.read().await.get(name).cloned()
    }

    /// Successful `upsert_node_states` calls so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `n` writes fail.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl GraphStore for InMemoryGraphStore {
    async fn load_graph(&self, name: &str) -> anyhow::Result<Graph> {
        self.get(name)
            .await
            .with_context(|| format!("graph '{}' not found", name))
    }

    async fn upsert_node_states(&self, name: &str, records: &[NodeStateRecord]) -> anyhow::Result<()> {
        let injected_failure = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected_failure {
            anyhow::bail!("store unavailable");
        }

        let mut graphs = self.graphs.write().await;
        let graph = graphs.entry(name.to_string()).or_default();
        let mut missing = 0usize;
        for r in records {
            match graph.node_mut(&r.id) {
                Some(node) => {
                    node.energy = r.energy;
                    node.threshold = r.threshold;
                }
                None => missing += 1,
            }
        }
        if missing > 0 {
            tracing::debug!("{} records for unknown nodes in '{}' ignored", missing, name);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
