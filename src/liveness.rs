//! Liveness monitoring
//!
//! Consumes peer link observations and drives each server's connection
//! state machine. A server starts out unknown, becomes available on its
//! first connect, and oscillates between available and unavailable for
//! as long as the registry runs. Timestamps are explicit inputs, never
//! read from an ambient clock.

use chrono::{DateTime, Utc};

use crate::anomaly::{Anomaly, SharedSink};
use crate::directory::{MembershipDirectory, UpsertOutcome};
use crate::types::{ConnectionState, ServerAnnouncement, ServerId};
use std::sync::Arc;

/// What a connect observation did to the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// First record for this server
    Registered,
    /// An unavailable server came back within the same process instance
    Reconnected,
    /// A new process instance replaced the stored record wholesale
    Replaced,
    /// Same instance, already available; nothing changed
    AlreadyAvailable,
    /// The observation was rejected; the record is unchanged
    Rejected,
}

/// What a disconnect observation did to the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// The server was marked unavailable
    Marked,
    /// No record exists for the server; nothing to do
    UnknownServer,
    /// The server was already unavailable; nothing changed
    AlreadyUnavailable,
    /// The observation was out of order and discarded
    Discarded,
}

/// Drives available/unavailable transitions in the directory
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    directory: Arc<MembershipDirectory>,
    sink: SharedSink,
}

impl LivenessMonitor {
    /// Create a monitor writing through to `directory`
    pub fn new(directory: Arc<MembershipDirectory>, sink: SharedSink) -> Self {
        Self { directory, sink }
    }

    /// Apply a connect observed at `at` carrying the peer's announcement.
    ///
    /// A connect stamped before the announced process start is rejected
    /// and reported. A repeat connect from the same process instance is
    /// idempotent while the server is available; an announcement from a
    /// different process instance replaces the record wholesale so no
    /// stale fields leak across restarts.
    pub fn handle_connected(
        &self,
        announcement: ServerAnnouncement,
        at: DateTime<Utc>,
    ) -> ConnectOutcome {
        if at < announcement.process.time_started {
            self.sink.report(Anomaly::ConnectBeforeStart {
                server: announcement.id,
                at,
                time_started: announcement.process.time_started,
            });
            return ConnectOutcome::Rejected;
        }

        let Some(stored) = self.directory.get(announcement.id) else {
            self.directory.upsert(announcement.into_record(at));
            return ConnectOutcome::Registered;
        };

        if stored.is_new_instance(&announcement) {
            return match self.directory.upsert(announcement.into_record(at)) {
                UpsertOutcome::Applied => ConnectOutcome::Replaced,
                UpsertOutcome::Stale => ConnectOutcome::Rejected,
            };
        }

        if stored.connection.is_available() {
            return ConnectOutcome::AlreadyAvailable;
        }

        let mut record = stored;
        record.name = announcement.name;
        record.tags = announcement.tags;
        record.connection = ConnectionState::connected(at);
        record.version = record.version.next_patch();
        match self.directory.upsert(record) {
            UpsertOutcome::Applied => ConnectOutcome::Reconnected,
            UpsertOutcome::Stale => ConnectOutcome::Rejected,
        }
    }

    /// Apply a disconnect of `id` observed at `at`.
    ///
    /// Unknown servers are ignored. A disconnect stamped before the
    /// recorded connect time arrived out of order; it is discarded and
    /// reported rather than applied.
    pub fn handle_disconnected(&self, id: ServerId, at: DateTime<Utc>) -> DisconnectOutcome {
        let Some(stored) = self.directory.get(id) else {
            log::debug!("disconnect for unknown server {}", id);
            return DisconnectOutcome::UnknownServer;
        };

        let Some(connected_at) = stored.connection.time_connected else {
            return DisconnectOutcome::AlreadyUnavailable;
        };

        if at < connected_at {
            self.sink.report(Anomaly::StaleDisconnect {
                server: id,
                at,
                connected_at,
            });
            return DisconnectOutcome::Discarded;
        }

        let mut record = stored;
        record.connection = ConnectionState::disconnected(at);
        record.version = record.version.next_patch();
        match self.directory.upsert(record) {
            UpsertOutcome::Applied => DisconnectOutcome::Marked,
            UpsertOutcome::Stale => DisconnectOutcome::Discarded,
        }
    }
}
