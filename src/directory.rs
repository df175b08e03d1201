//! Membership directory
//!
//! The authoritative per-node table of all known servers. Mutation goes
//! through [`MembershipDirectory::upsert`] under per-id locking, so
//! writers for one server never block writers for another; readers take
//! whole-record snapshots and never observe a partially written record.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::anomaly::{Anomaly, SharedSink};
use crate::types::{ServerId, ServerRecord};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Outcome of an [`MembershipDirectory::upsert`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The record was inserted or strictly advanced the stored version
    Applied,
    /// The incoming version was at or below the stored one; the stored
    /// record is unchanged
    Stale,
}

impl UpsertOutcome {
    /// Whether the update mutated the directory
    pub fn is_applied(self) -> bool {
        self == UpsertOutcome::Applied
    }
}

/// Per-node table of server records
#[derive(Debug)]
pub struct MembershipDirectory {
    records: DashMap<ServerId, ServerRecord>,
    changes: broadcast::Sender<ServerRecord>,
    sink: SharedSink,
}

impl MembershipDirectory {
    /// Create an empty directory reporting rejected updates to `sink`
    pub fn new(sink: SharedSink) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            records: DashMap::new(),
            changes,
            sink,
        }
    }

    /// Create an empty directory behind a shared handle
    pub fn shared(sink: SharedSink) -> Arc<Self> {
        Arc::new(Self::new(sink))
    }

    /// Look up the latest known record for a server
    pub fn get(&self, id: ServerId) -> Option<ServerRecord> {
        self.records.get(&id).map(|record| record.value().clone())
    }

    /// Unordered snapshot of all known records
    pub fn list(&self) -> Vec<ServerRecord> {
        self.records
            .iter()
            .map(|record| record.value().clone())
            .collect()
    }

    /// Number of known servers
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no server is known yet
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Apply a record if it strictly advances the stored version.
    ///
    /// Insertion, in-place patch, and whole-record replacement all go
    /// through here; the per-id entry lock serializes writers for one
    /// server. An update at or below the stored version leaves the
    /// record untouched and is reported to the anomaly sink.
    pub fn upsert(&self, record: ServerRecord) -> UpsertOutcome {
        let applied = match self.records.entry(record.id) {
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                true
            }
            Entry::Occupied(mut slot) => {
                if record.version > slot.get().version {
                    slot.insert(record.clone());
                    true
                } else {
                    self.sink.report(Anomaly::StaleUpsert {
                        server: record.id,
                        incoming: record.version,
                        stored: slot.get().version,
                    });
                    false
                }
            }
        };

        if applied {
            // Nobody listening is fine; updates are re-derivable from
            // the map itself.
            let _ = self.changes.send(record);
            UpsertOutcome::Applied
        } else {
            UpsertOutcome::Stale
        }
    }

    /// Subscribe to applied record changes
    pub fn subscribe(&self) -> broadcast::Receiver<ServerRecord> {
        self.changes.subscribe()
    }
}
