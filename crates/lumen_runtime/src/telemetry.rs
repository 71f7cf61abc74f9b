//! Telemetry sinks. All are synchronous and never block the tick.

use lumen_core::{TelemetryEvent, TelemetrySink};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Logs every event at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: TelemetryEvent) {
        tracing::debug!(
            event = %event.name,
            tick = event.tick,
            payload = %event.payload,
            "telemetry"
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: TelemetryEvent) {}
}

/// Forwards events over a bounded channel; drops (and counts) when full.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<TelemetryEvent>,
    dropped: AtomicU64,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
            },
            rx,
        )
    }
}

impl TelemetrySink for ChannelSink {
    fn emit(&self, event: TelemetryEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(e)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Telemetry channel full, dropping {}", e.name);
            }
            Err(mpsc::error::TrySendError::Closed(e)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::trace!("Telemetry receiver gone, dropping {}", e.name);
            }
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
