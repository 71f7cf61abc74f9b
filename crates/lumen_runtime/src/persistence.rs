//! Dirty-tracking write-back of node state.
//!
//! Changed node ids accumulate between ticks. A flush writes
//! `{id, energy, threshold}` for every dirty node still in the graph once the
//! (jittered) interval has elapsed and enough records are pending, or on
//! demand. A failed flush puts its ids back in the dirty set and backs off.
//!
//! [`PersistenceBatcher`] decides what to write; [`FlushWriter`] does the
//! writing on its own task so store latency never holds up a tick.

use lumen_core::config::PersistenceConfig;
use lumen_core::{Graph, GraphStore, NodeId, NodeStateRecord};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::retry::{with_jitter, with_retry, RetryConfig};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    /// Not due yet, or nothing to write.
    Skipped { pending: usize },
    Flushed { records: usize },
    /// Dirty set retained; next attempt after `retry_in_secs`.
    Failed { pending: usize, retry_in_secs: f64, error: String },
}

#[derive(Debug)]
pub struct PersistenceBatcher {
    graph_name: String,
    interval: Duration,
    min_batch: usize,
    jitter_fraction: f64,
    retry: RetryConfig,
    dirty: BTreeSet<NodeId>,
    next_due: Instant,
    consecutive_failures: u32,
    flushed_total: u64,
    /// A batch has been handed out and not yet completed.
    in_flight: bool,
}

impl PersistenceBatcher {
    pub fn new(config: &PersistenceConfig, now: Instant) -> Self {
        let interval = Duration::from_secs_f64(config.flush_interval_secs.max(0.0));
        let jitter_fraction = config.jitter_fraction.clamp(0.0, 1.0);
        Self {
            graph_name: config.graph_name.clone(),
            interval,
            min_batch: config.min_batch.max(1),
            jitter_fraction,
            retry: RetryConfig::from(config),
            dirty: BTreeSet::new(),
            next_due: now + with_jitter(interval, jitter_fraction),
            consecutive_failures: 0,
            flushed_total: 0,
            in_flight: false,
        }
    }

    pub fn mark_dirty<'a>(&mut self, ids: impl IntoIterator<Item = &'a NodeId>) {
        self.dirty.extend(ids.into_iter().cloned());
    }

    pub fn pending(&self) -> usize {
        self.dirty.len()
    }

    pub fn flushed_total(&self) -> u64 {
        self.flushed_total
    }

    pub fn next_due(&self) -> Instant {
        self.next_due
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_due && self.dirty.len() >= self.min_batch
    }

    fn collect(&self, graph: &Graph) -> Vec<NodeStateRecord> {
        self.dirty
            .iter()
            .filter_map(|id| graph.node(id))
            .map(|n| NodeStateRecord {
                id: n.id.clone(),
                energy: n.energy,
                threshold: n.threshold,
            })
            .collect()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    /// Take the pending records out of the dirty set if a flush is due (or
    /// `force`). At most one batch is outstanding; it must be handed back
    /// through [`complete`](Self::complete).
    pub fn take_batch(&mut self, graph: &Graph, now: Instant, force: bool) -> Option<Vec<NodeStateRecord>> {
        if self.in_flight || self.dirty.is_empty() || (!force && !self.is_due(now)) {
            return None;
        }
        let records = self.collect(graph);
        self.dirty.clear();
        if records.is_empty() {
            return None;
        }
        self.in_flight = true;
        Some(records)
    }

    /// Record the result of writing a batch from [`take_batch`](Self::take_batch).
    /// Failed records go back into the dirty set.
    pub fn complete(&mut self, records: &[NodeStateRecord], result: anyhow::Result<()>, now: Instant) -> FlushOutcome {
        self.in_flight = false;
        match result {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.flushed_total += records.len() as u64;
                self.next_due = now + with_jitter(self.interval, self.jitter_fraction);
                tracing::debug!("Flushed {} node states to '{}'", records.len(), self.graph_name);
                FlushOutcome::Flushed {
                    records: records.len(),
                }
            }
            Err(e) => {
                self.dirty.extend(records.iter().map(|r| r.id.clone()));
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let backoff = self.interval + self.retry.backoff_with_jitter(self.consecutive_failures);
                self.next_due = now + backoff;
                tracing::warn!(
                    "Node state flush failed ({} pending, retry in {:.1}s): {:#}",
                    self.dirty.len(),
                    backoff.as_secs_f64(),
                    e
                );
                FlushOutcome::Failed {
                    pending: self.dirty.len(),
                    retry_in_secs: backoff.as_secs_f64(),
                    error: format!("{:#}", e),
                }
            }
        }
    }

    /// Flush inline if due (or `force`). Store failures are reported in the
    /// outcome, never returned as errors.
    pub async fn flush(&mut self, store: &dyn GraphStore, graph: &Graph, now: Instant, force: bool) -> FlushOutcome {
        let Some(records) = self.take_batch(graph, now, force) else {
            return FlushOutcome::Skipped {
                pending: self.dirty.len(),
            };
        };
        let result = write_records(store, &self.graph_name, &self.retry, &records).await;
        self.complete(&records, result, now)
    }
}

async fn write_records(
    store: &dyn GraphStore,
    graph_name: &str,
    retry: &RetryConfig,
    records: &[NodeStateRecord],
) -> anyhow::Result<()> {
    with_retry(retry, "Node state flush", || store.upsert_node_states(graph_name, records)).await
}

// ============================================================================
// Background writer
// ============================================================================

/// A finished write, handed back to the batcher.
#[derive(Debug)]
pub struct WriteResult {
    pub records: Vec<NodeStateRecord>,
    pub result: anyhow::Result<()>,
}

/// Store writes (with their retries) on a dedicated task.
pub struct FlushWriter {
    jobs: mpsc::Sender<Vec<NodeStateRecord>>,
    done: mpsc::Receiver<WriteResult>,
    handle: JoinHandle<()>,
}

impl FlushWriter {
    pub fn spawn(store: Arc<dyn GraphStore>, config: &PersistenceConfig) -> Self {
        let (jobs, mut job_rx) = mpsc::channel::<Vec<NodeStateRecord>>(1);
        let (done_tx, done) = mpsc::channel(1);
        let graph_name = config.graph_name.clone();
        let retry = RetryConfig::from(config);
        let handle = tokio::spawn(async move {
            while let Some(records) = job_rx.recv().await {
                let result = write_records(store.as_ref(), &graph_name, &retry, &records).await;
                if done_tx.send(WriteResult { records, result }).await.is_err() {
                    break;
                }
            }
        });
        Self { jobs, done, handle }
    }

    /// Hand a batch to the writer. Gives the records back if the writer is
    /// busy or gone.
    pub fn submit(&self, records: Vec<NodeStateRecord>) -> Result<(), Vec<NodeStateRecord>> {
        self.jobs.try_send(records).map_err(|e| match e {
            mpsc::error::TrySendError::Full(r) | mpsc::error::TrySendError::Closed(r) => r,
        })
    }

    /// A completed write, if one is ready.
    pub fn try_result(&mut self) -> Option<WriteResult> {
        self.done.try_recv().ok()
    }

    /// Stop accepting batches and wait for the one in flight.
    pub async fn finish(self) -> Vec<WriteResult> {
        let Self { jobs, mut done, handle } = self;
        drop(jobs);
        let mut results = Vec::new();
        while let Some(r) = done.recv().await {
            results.push(r);
        }
        if let Err(e) = handle.await {
            tracing::error!("Persistence writer task failed: {}", e);
        }
        results
    }
}

/// Feed finished writes back and hand out the next due batch.
pub fn drive(batcher: &mut PersistenceBatcher, writer: &mut FlushWriter, graph: &Graph, now: Instant) {
    while let Some(done) = writer.try_result() {
        if let FlushOutcome::Failed { pending, .. } = batcher.complete(&done.records, done.result, now) {
            tracing::debug!("{} node states awaiting write-back", pending);
        }
    }
    if let Some(records) = batcher.take_batch(graph, now, false) {
        if let Err(records) = writer.submit(records) {
            batcher.complete(&records, Err(anyhow::anyhow!("persistence writer unavailable")), now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryGraphStore;
    use lumen_core::{Node, NodeKind};

    fn graph(n: usize) -> Graph {
        let mut g = Graph::new();
        for i in 0..n {
            g.insert_node(Node::new(format!("n{}", i), NodeKind::Concept).with_energy(i as f64));
        }
        g
    }

    fn ids(g: &Graph) -> Vec<NodeId> {
        g.nodes().map(|n| n.id.clone()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_respects_min_batch() {
        let g = graph(3);
        let store = InMemoryGraphStore::with_graph("default", g.clone());
        let now = Instant::now();
        let mut b = PersistenceBatcher::new(&PersistenceConfig::default(), now);
        b.mark_dirty(&ids(&g));

        let later = now + Duration::from_secs(60);
        assert!(!b.is_due(later));
        let out = b.flush(&store, &g, later, false).await;
        assert_eq!(out, FlushOutcome::Skipped { pending: 3 });
        assert_eq!(store.write_count(), 0);

        let out = b.flush(&store, &g, later, true).await;
        assert_eq!(out, FlushOutcome::Flushed { records: 3 });
        assert_eq!(b.pending(), 0);
        assert_eq!(store.write_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_interval() {
        let g = graph(20);
        let store = InMemoryGraphStore::with_graph("default", g.clone());
        let now = Instant::now();
        let mut b = PersistenceBatcher::new(&PersistenceConfig::default(), now);
        b.mark_dirty(&ids(&g));
        assert!(!b.is_due(now));
        // 5 s interval plus at most 20 % jitter.
        assert!(b.is_due(now + Duration::from_secs(7)));
        let out = b.flush(&store, &g, now + Duration::from_secs(7), false).await;
        assert_eq!(out, FlushOutcome::Flushed { records: 20 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_retains_dirty_set() {
        let g = graph(4);
        let store = InMemoryGraphStore::with_graph("default", g.clone());
        store.fail_next(3);
        let now = Instant::now();
        let mut b = PersistenceBatcher::new(&PersistenceConfig::default(), now);
        b.mark_dirty(&ids(&g));

        let out = b.flush(&store, &g, now, true).await;
        match out {
            FlushOutcome::Failed { pending, retry_in_secs, .. } => {
                assert_eq!(pending, 4);
                assert!(retry_in_secs >= 5.0);
            }
            other => panic!("expected failure, got {:?}", other),
        }
        assert!(b.next_due() > now);

        let out = b.flush(&store, &g, now, true).await;
        assert_eq!(out, FlushOutcome::Flushed { records: 4 });
        assert_eq!(b.flushed_total(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_removed_nodes_are_skipped() {
        let mut g = graph(2);
        let store = InMemoryGraphStore::with_graph("default", g.clone());
        let now = Instant::now();
        let mut b = PersistenceBatcher::new(&PersistenceConfig::default(), now);
        b.mark_dirty(&ids(&g));
        g.remove_node(&"n0".into());
        let out = b.flush(&store, &g, now, true).await;
        assert_eq!(out, FlushOutcome::Flushed { records: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_batch_in_flight() {
        let g = graph(3);
        let now = Instant::now();
        let mut b = PersistenceBatcher::new(&PersistenceConfig::default(), now);
        b.mark_dirty(&ids(&g));

        let batch = b.take_batch(&g, now, true).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(b.in_flight());
        b.mark_dirty(&ids(&g)[..1]);
        assert!(b.take_batch(&g, now, true).is_none());

        let out = b.complete(&batch, Ok(()), now);
        assert_eq!(out, FlushOutcome::Flushed { records: 3 });
        // Marked during the write, so still pending.
        assert_eq!(b.pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_requeued() {
        let g = graph(2);
        let now = Instant::now();
        let mut b = PersistenceBatcher::new(&PersistenceConfig::default(), now);
        b.mark_dirty(&ids(&g));
        let batch = b.take_batch(&g, now, true).unwrap();
        assert_eq!(b.pending(), 0);

        let out = b.complete(&batch, Err(anyhow::anyhow!("disk full")), now);
        assert!(matches!(out, FlushOutcome::Failed { pending: 2, .. }));
        assert!(!b.in_flight());
        assert_eq!(b.pending(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_retries_off_the_caller() {
        let g = graph(2);
        let store = Arc::new(InMemoryGraphStore::with_graph("default", g.clone()));
        store.fail_next(100);
        let config = PersistenceConfig {
            initial_backoff_secs: 5.0,
            ..Default::default()
        };
        let mut writer = FlushWriter::spawn(store.clone(), &config);
        let start = Instant::now();
        let records: Vec<NodeStateRecord> = g
            .nodes()
            .map(|n| NodeStateRecord {
                id: n.id.clone(),
                energy: n.energy,
                threshold: n.threshold,
            })
            .collect();

        assert!(writer.submit(records).is_ok());
        assert!(writer.try_result().is_none());
        assert_eq!(Instant::now(), start);

        let results = writer.finish().await;
        assert_eq!(results.len(), 1);
        assert!(results[0].result.is_err());
        assert_eq!(store.write_count(), 0);
    }
}
