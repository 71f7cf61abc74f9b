//! Background tick service.
//!
//! Owns a [`TickEngine`] on a tokio task. Producers talk to it through
//! bounded queues; readers get lock-free snapshots. The loop sleeps for the
//! scheduler's interval, or less when a stimulus arrives.

use arc_swap::ArcSwap;
use lumen_core::{GraphMutation, GraphStore, LumenError, LumenResult, SourceKey, Stimulus};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::embedding::GuardedEmbedder;
use crate::engine::{EngineSnapshot, TickEngine};
use crate::persistence::{self, FlushWriter, PersistenceBatcher};

/// Optional collaborators wired into the loop.
#[derive(Default, Clone)]
pub struct Collaborators {
    pub store: Option<Arc<dyn GraphStore>>,
    pub embedder: Option<Arc<GuardedEmbedder>>,
}

// ============================================================================
// EngineService
// ============================================================================

pub struct EngineService {
    stimulus_tx: mpsc::Sender<Stimulus>,
    mutation_tx: mpsc::Sender<GraphMutation>,
    snapshot: Arc<ArcSwap<EngineSnapshot>>,
    snapshot_rx: watch::Receiver<Arc<EngineSnapshot>>,
    shutdown_tx: watch::Sender<bool>,
    wake: Arc<Notify>,
    handle: JoinHandle<anyhow::Result<TickEngine>>,
}

impl EngineService {
    /// Move `engine` onto a background task and start ticking.
    pub fn spawn(engine: TickEngine, collaborators: Collaborators) -> Self {
        let capacity = engine.config().stimulus.queue_capacity.max(1);
        let (stimulus_tx, stimulus_rx) = mpsc::channel(capacity);
        let (mutation_tx, mutation_rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let initial = Arc::new(engine.snapshot());
        let snapshot = Arc::new(ArcSwap::new(Arc::clone(&initial)));
        let (snapshot_tx, snapshot_rx) = watch::channel(initial);
        let wake = Arc::new(Notify::new());

        let worker = Worker {
            engine,
            stimulus_rx,
            mutation_rx,
            shutdown_rx,
            wake: Arc::clone(&wake),
            snapshot: Arc::clone(&snapshot),
            snapshot_tx,
            collaborators,
        };
        let handle = tokio::spawn(worker.run());
        tracing::info!("Engine service started (queue capacity {})", capacity);

        Self {
            stimulus_tx,
            mutation_tx,
            snapshot,
            snapshot_rx,
            shutdown_tx,
            wake,
            handle,
        }
    }

    /// Queue a stimulus and wake the loop. Waits while the queue is full.
    pub async fn inject_stimulus(
        &self,
        text: impl Into<String>,
        embedding: Option<Vec<f32>>,
        source: SourceKey,
    ) -> LumenResult<Uuid> {
        let stimulus = Stimulus::new(text, embedding, source);
        let id = stimulus.id;
        self.enqueue(stimulus).await?;
        Ok(id)
    }

    pub async fn enqueue(&self, stimulus: Stimulus) -> LumenResult<()> {
        self.stimulus_tx
            .send(stimulus)
            .await
            .map_err(|_| LumenError::QueueClosed)?;
        self.wake.notify_one();
        Ok(())
    }

    /// Queue a structural edit for the next tick boundary.
    pub async fn submit_mutation(&self, mutation: GraphMutation) -> LumenResult<()> {
        self.mutation_tx
            .send(mutation)
            .await
            .map_err(|_| LumenError::QueueClosed)
    }

    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.snapshot.load_full()
    }

    /// Receiver that changes after every tick.
    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineSnapshot>> {
        self.snapshot_rx.clone()
    }

    /// Run the next tick now instead of waiting out the interval.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stop the loop, flush pending state and hand the engine back.
    pub async fn shutdown(self) -> anyhow::Result<TickEngine> {
        let _ = self.shutdown_tx.send(true);
        self.handle.await?
    }
}

// ============================================================================
// Worker loop
// ============================================================================

struct Worker {
    engine: TickEngine,
    stimulus_rx: mpsc::Receiver<Stimulus>,
    mutation_rx: mpsc::Receiver<GraphMutation>,
    shutdown_rx: watch::Receiver<bool>,
    wake: Arc<Notify>,
    snapshot: Arc<ArcSwap<EngineSnapshot>>,
    snapshot_tx: watch::Sender<Arc<EngineSnapshot>>,
    collaborators: Collaborators,
}

impl Worker {
    async fn run(mut self) -> anyhow::Result<TickEngine> {
        let mut write_back = self.collaborators.store.as_ref().map(|store| {
            let config = &self.engine.config().persistence;
            (
                PersistenceBatcher::new(config, Instant::now()),
                FlushWriter::spawn(Arc::clone(store), config),
            )
        });
        let mut last_tick = Instant::now();

        let halted = loop {
            let wait = self.engine.next_interval();
            tokio::select! {
                biased;
                _ = self.shutdown_rx.changed() => break None,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }

            while let Ok(m) = self.mutation_rx.try_recv() {
                self.engine.submit_mutation(m);
            }
            while let Ok(stimulus) = self.stimulus_rx.try_recv() {
                let stimulus = self.embed(stimulus).await;
                self.engine.enqueue_stimulus(stimulus);
            }

            let now = Instant::now();
            let elapsed = now.saturating_duration_since(last_tick).as_secs_f64();
            last_tick = now;
            let report = match self.engine.tick_with_elapsed(elapsed) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!("Tick engine halted: {}", e);
                    break Some(e);
                }
            };

            let snap = Arc::new(self.engine.snapshot());
            self.snapshot.store(Arc::clone(&snap));
            self.snapshot_tx.send_replace(snap);

            if let Some((batcher, writer)) = write_back.as_mut() {
                batcher.mark_dirty(&report.changed_nodes);
                persistence::drive(batcher, writer, self.engine.graph(), now);
            }
        };

        if let (Some(store), Some((mut batcher, writer))) = (self.collaborators.store.as_ref(), write_back) {
            if halted.is_some() {
                // Edits drained by the failed tick never made it into a report.
                batcher.mark_dirty(self.engine.graph().nodes().map(|n| &n.id));
            }
            for done in writer.finish().await {
                batcher.complete(&done.records, done.result, Instant::now());
            }
            let outcome = batcher
                .flush(store.as_ref(), self.engine.graph(), Instant::now(), true)
                .await;
            tracing::info!("Final flush: {:?}", outcome);
        }

        match halted {
            Some(e) => Err(e.into()),
            None => {
                tracing::info!("Engine service stopped after {} ticks", self.engine.tick_count());
                Ok(self.engine)
            }
        }
    }

    /// Fill in a missing embedding. Failures leave it empty so the engine
    /// falls back to token-overlap search.
    async fn embed(&self, mut stimulus: Stimulus) -> Stimulus {
        if stimulus.embedding.is_some() {
            return stimulus;
        }
        if let Some(embedder) = &self.collaborators.embedder {
            match embedder.embed(&stimulus.text).await {
                Ok(v) => stimulus.embedding = Some(v),
                Err(e) => tracing::debug!("Stimulus {} unembedded: {}", stimulus.id, e),
            }
        }
        stimulus
    }
}
