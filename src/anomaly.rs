//! Anomaly reporting
//!
//! Stale or rejected events are discarded locally and reported to an
//! observability sink, fire-and-forget. They never surface as errors to
//! callers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::types::{RecordVersion, ServerId};

/// A discarded event, with enough context to trace message reordering
#[derive(Debug, Clone, PartialEq)]
pub enum Anomaly {
    /// A disconnect timestamp preceded the recorded connect time
    StaleDisconnect {
        /// Server the event was for
        server: ServerId,
        /// Timestamp carried by the discarded event
        at: DateTime<Utc>,
        /// Connect time currently on record
        connected_at: DateTime<Utc>,
    },
    /// A connect timestamp preceded the announced process start
    ConnectBeforeStart {
        /// Server the event was for
        server: ServerId,
        /// Timestamp carried by the rejected event
        at: DateTime<Utc>,
        /// Announced process start time
        time_started: DateTime<Utc>,
    },
    /// An update carried a version at or below the stored one
    StaleUpsert {
        /// Server the update was for
        server: ServerId,
        /// Version carried by the rejected update
        incoming: RecordVersion,
        /// Version currently on record
        stored: RecordVersion,
    },
}

/// Destination for anomaly reports
pub trait AnomalySink: Send + Sync + std::fmt::Debug {
    /// Deliver one report; implementations must not block
    fn report(&self, anomaly: Anomaly);
}

/// Shared handle to an anomaly sink
pub type SharedSink = Arc<dyn AnomalySink>;

/// Sink that logs anomalies at warn level
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl AnomalySink for LogSink {
    fn report(&self, anomaly: Anomaly) {
        log::warn!("discarded event: {:?}", anomaly);
    }
}

/// Sink that forwards anomalies over a channel.
///
/// Used by tests to assert on rejected events; the send is lossy once
/// the receiver is gone.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Anomaly>,
}

impl ChannelSink {
    /// Create a sink and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Anomaly>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AnomalySink for ChannelSink {
    fn report(&self, anomaly: Anomaly) {
        let _ = self.tx.send(anomaly);
    }
}
