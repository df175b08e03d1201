//! Status view
//!
//! A read-only materialization of the membership directory into the row
//! shape the query layer scans. The view is pure presentation: status
//! and timestamps are reported exactly as stored, with no timestamp
//! logic of its own.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::directory::MembershipDirectory;
use crate::error::{RosterError, RosterResult};
use crate::types::{ConnectionStatus, NetworkInfo, ProcessInfo, ServerId, ServerRecord};

/// Connection timestamps of a status row
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTimes {
    /// When the server connected; null while unavailable
    pub time_connected: Option<DateTime<Utc>>,
    /// When the server disconnected; null while available
    pub time_disconnected: Option<DateTime<Utc>>,
}

/// One queryable status row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatusRow {
    /// Unique server identifier
    pub id: ServerId,
    /// Display name
    pub name: String,
    /// Placement tags
    pub tags: Vec<String>,
    /// Connection status, `available` or `unavailable`
    pub status: ConnectionStatus,
    /// Process metadata
    pub process: ProcessInfo,
    /// Network configuration
    pub network: NetworkInfo,
    /// Connection timestamps
    pub connection: ConnectionTimes,
}

impl ServerStatusRow {
    /// Materialize a row from a directory record
    pub fn from_record(record: &ServerRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
            tags: record.tags.clone(),
            status: record.connection.status,
            process: record.process.clone(),
            network: record.network.clone(),
            connection: ConnectionTimes {
                time_connected: record.connection.time_connected,
                time_disconnected: record.connection.time_disconnected,
            },
        }
    }

    /// The row as a JSON document for the query layer
    pub fn to_json(&self) -> RosterResult<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| RosterError::Serialization(e.to_string()))
    }
}

/// Read-only projection of the directory
#[derive(Debug, Clone)]
pub struct StatusView {
    directory: Arc<MembershipDirectory>,
}

impl StatusView {
    /// Create a view over `directory`
    pub fn new(directory: Arc<MembershipDirectory>) -> Self {
        Self { directory }
    }

    /// Unordered snapshot of every known server
    pub fn snapshot(&self) -> Vec<ServerStatusRow> {
        self.directory
            .list()
            .iter()
            .map(ServerStatusRow::from_record)
            .collect()
    }

    /// Row for one server
    pub fn get(&self, id: ServerId) -> Option<ServerStatusRow> {
        self.directory
            .get(id)
            .map(|record| ServerStatusRow::from_record(&record))
    }

    /// Row looked up by display name
    pub fn get_by_name(&self, name: &str) -> Option<ServerStatusRow> {
        self.directory
            .list()
            .iter()
            .find(|record| record.name == name)
            .map(ServerStatusRow::from_record)
    }

    /// Number of known servers
    pub fn count(&self) -> usize {
        self.directory.len()
    }

    /// Subscribe to freshly materialized rows.
    ///
    /// A row is delivered for every directory mutation, so a consumer
    /// can track status changes without polling.
    pub fn subscribe(&self) -> StatusSubscription {
        StatusSubscription {
            inner: self.directory.subscribe(),
        }
    }
}

/// Stream of materialized rows, one per directory mutation
#[derive(Debug)]
pub struct StatusSubscription {
    inner: broadcast::Receiver<ServerRecord>,
}

impl StatusSubscription {
    /// Next changed row, or `None` once the directory is gone
    pub async fn changed(&mut self) -> Option<ServerStatusRow> {
        loop {
            match self.inner.recv().await {
                Ok(record) => return Some(ServerStatusRow::from_record(&record)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("status subscription skipped {} updates", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
