//! # Lumen runtime
//!
//! Drives the energy graph forward in time.
//!
//! - [`engine::TickEngine`]: the synchronous per-tick pipeline
//! - [`scheduler::TickScheduler`]: adaptive interval between ticks
//! - [`service::EngineService`]: background task with bounded stimulus and
//!   mutation queues, lock-free snapshots and write-back persistence
//!
//! Collaborator adapters (guarded embedding, in-memory store, telemetry
//! sinks) live alongside so the CLI and tests can wire a complete engine.

pub mod candidates;
pub mod embedding;
pub mod engine;
pub mod persistence;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod telemetry;

pub use candidates::SearchMode;
pub use embedding::{BreakerState, CircuitBreaker, GuardedEmbedder, HashEmbedder};
pub use engine::{EngineSnapshot, InjectionSummary, TickEngine, TickReport};
pub use persistence::{FlushOutcome, FlushWriter, PersistenceBatcher, WriteResult};
pub use retry::{with_retry, RetryConfig};
pub use scheduler::{IntervalDecision, IntervalFactor, IntervalInputs, TickReason, TickScheduler};
pub use service::{Collaborators, EngineService};
pub use store::InMemoryGraphStore;
pub use telemetry::{ChannelSink, NullSink, TracingSink};
