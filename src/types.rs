//! Core data model for the membership registry
//!
//! Defines the server record shape shared by the directory, the gossip
//! wire format, and the status view.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier for a server, assigned at server creation
/// and never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerId(pub Uuid);

impl ServerId {
    /// Generate a new random server ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ServerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Version of a server record.
///
/// `generation` distinguishes successive process instances of the same
/// server; `seq` counts in-place patches within one instance. Ordering
/// is lexicographic, so a record from a newer process instance always
/// supersedes any patch of an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordVersion {
    /// Process instance generation
    pub generation: u64,
    /// Patch counter within the instance
    pub seq: u64,
}

impl RecordVersion {
    /// First version of a process instance
    pub fn initial(generation: u64) -> Self {
        Self { generation, seq: 0 }
    }

    /// Next in-place patch version within the same instance
    pub fn next_patch(self) -> Self {
        Self {
            generation: self.generation,
            seq: self.seq + 1,
        }
    }
}

impl std::fmt::Display for RecordVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.generation, self.seq)
    }
}

/// Process metadata, set once when the server process starts and
/// immutable for the lifetime of that process instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Product version string reported by the server
    pub version: String,
    /// OS process ID
    pub pid: u32,
    /// Configured cache size in megabytes
    pub cache_size_mb: u64,
    /// Wall-clock time the process started
    pub time_started: DateTime<Utc>,
    /// Process instance generation; higher means a newer restart
    pub generation: u64,
}

/// An externally advertised host:port pair at which a server can be
/// reached by peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalAddress {
    /// Host name or address
    pub host: String,
    /// Port number
    pub port: u16,
}

/// Network configuration advertised by a server, immutable per process
/// instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Hostname of the machine the server runs on
    pub hostname: String,
    /// Client driver port
    pub reql_port: u16,
    /// Intra-cluster port used for gossip and heartbeat traffic
    pub cluster_port: u16,
    /// Administrative HTTP port
    pub http_admin_port: u16,
    /// Advertised addresses, most preferred first
    pub canonical_addresses: Vec<CanonicalAddress>,
}

/// Connection status of a server as seen by the local node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// The server is reachable
    Available,
    /// The server is not reachable
    Unavailable,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Available => write!(f, "available"),
            ConnectionStatus::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// Monitoring-derived connection state.
///
/// Exactly one of the two timestamps is set at any instant, determined
/// by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Current status
    pub status: ConnectionStatus,
    /// When the server connected; set only while available
    pub time_connected: Option<DateTime<Utc>>,
    /// When the server disconnected; set only while unavailable
    pub time_disconnected: Option<DateTime<Utc>>,
}

impl ConnectionState {
    /// State for a server that connected at `at`
    pub fn connected(at: DateTime<Utc>) -> Self {
        Self {
            status: ConnectionStatus::Available,
            time_connected: Some(at),
            time_disconnected: None,
        }
    }

    /// State for a server that disconnected at `at`
    pub fn disconnected(at: DateTime<Utc>) -> Self {
        Self {
            status: ConnectionStatus::Unavailable,
            time_connected: None,
            time_disconnected: Some(at),
        }
    }

    /// Check whether the server is currently available
    pub fn is_available(&self) -> bool {
        self.status == ConnectionStatus::Available
    }

    /// Check the status/timestamp pairing: available carries a connect
    /// time and no disconnect time, unavailable the reverse.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            ConnectionStatus::Available => {
                self.time_connected.is_some() && self.time_disconnected.is_none()
            }
            ConnectionStatus::Unavailable => {
                self.time_connected.is_none() && self.time_disconnected.is_some()
            }
        }
    }
}

/// Everything the cluster knows about a single server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Unique server identifier; the join key across replicated copies
    pub id: ServerId,
    /// Display name, unique within the cluster at any instant but
    /// mutable across renames
    pub name: String,
    /// Placement tags, opaque to the registry
    pub tags: Vec<String>,
    /// Process metadata for the current instance
    pub process: ProcessInfo,
    /// Network configuration for the current instance
    pub network: NetworkInfo,
    /// Live connection state
    pub connection: ConnectionState,
    /// Record version used for stale rejection and gossip advance
    pub version: RecordVersion,
}

impl ServerRecord {
    /// Check whether `announcement` describes a different process
    /// instance than the one recorded here.
    pub fn is_new_instance(&self, announcement: &ServerAnnouncement) -> bool {
        announcement.process.generation > self.process.generation
            || announcement.process.time_started != self.process.time_started
            || announcement.process.pid != self.process.pid
    }
}

/// Identity and metadata a server presents during a link handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerAnnouncement {
    /// Unique server identifier
    pub id: ServerId,
    /// Display name
    pub name: String,
    /// Placement tags
    pub tags: Vec<String>,
    /// Process metadata
    pub process: ProcessInfo,
    /// Network configuration
    pub network: NetworkInfo,
}

impl ServerAnnouncement {
    /// Build the directory record for a server that connected at `at`.
    ///
    /// The record starts a fresh process instance, so its version is the
    /// initial one for the announced generation.
    pub fn into_record(self, at: DateTime<Utc>) -> ServerRecord {
        let version = RecordVersion::initial(self.process.generation);
        ServerRecord {
            id: self.id,
            name: self.name,
            tags: self.tags,
            process: self.process,
            network: self.network,
            connection: ConnectionState::connected(at),
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_announcement() -> ServerAnnouncement {
        let started = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        ServerAnnouncement {
            id: ServerId::new(),
            name: "a".to_string(),
            tags: vec!["foo".to_string()],
            process: ProcessInfo {
                version: "roster 0.1.0".to_string(),
                pid: 4242,
                cache_size_mb: 512,
                time_started: started,
                generation: 7,
            },
            network: NetworkInfo {
                hostname: "node-1".to_string(),
                reql_port: 28015,
                cluster_port: 29015,
                http_admin_port: 8080,
                canonical_addresses: vec![CanonicalAddress {
                    host: "node-1".to_string(),
                    port: 29015,
                }],
            },
        }
    }

    #[test]
    fn test_version_ordering_is_lexicographic() {
        let old_instance = RecordVersion { generation: 1, seq: 9 };
        let new_instance = RecordVersion { generation: 2, seq: 0 };
        assert!(new_instance > old_instance);

        let patch = old_instance.next_patch();
        assert!(patch > old_instance);
        assert_eq!(patch.generation, old_instance.generation);
        assert!(new_instance > patch);
    }

    #[test]
    fn test_connection_state_constructors_are_consistent() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();

        let up = ConnectionState::connected(at);
        assert!(up.is_available());
        assert!(up.is_consistent());
        assert_eq!(up.time_connected, Some(at));
        assert_eq!(up.time_disconnected, None);

        let down = ConnectionState::disconnected(at);
        assert!(!down.is_available());
        assert!(down.is_consistent());
        assert_eq!(down.time_connected, None);
        assert_eq!(down.time_disconnected, Some(at));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let up = serde_json::to_value(ConnectionStatus::Available).unwrap();
        assert_eq!(up, serde_json::json!("available"));
        let down = serde_json::to_value(ConnectionStatus::Unavailable).unwrap();
        assert_eq!(down, serde_json::json!("unavailable"));
    }

    #[test]
    fn test_new_instance_detection() {
        let announcement = sample_announcement();
        let at = announcement.process.time_started + chrono::Duration::seconds(5);
        let record = announcement.clone().into_record(at);

        // Same instance announcing again is not a new instance.
        assert!(!record.is_new_instance(&announcement));

        let mut restarted = announcement.clone();
        restarted.process.generation += 1;
        restarted.process.pid = 4243;
        restarted.process.time_started = at + chrono::Duration::seconds(60);
        assert!(record.is_new_instance(&restarted));

        // A changed pid alone marks a new instance even when the
        // generation collides.
        let mut pid_only = announcement;
        pid_only.process.pid = 9999;
        assert!(record.is_new_instance(&pid_only));
    }

    #[test]
    fn test_announcement_into_record() {
        let announcement = sample_announcement();
        let at = announcement.process.time_started + chrono::Duration::seconds(3);
        let record = announcement.clone().into_record(at);

        assert_eq!(record.id, announcement.id);
        assert_eq!(record.version, RecordVersion::initial(7));
        assert_eq!(record.connection, ConnectionState::connected(at));
        assert_eq!(record.network, announcement.network);
    }
}
