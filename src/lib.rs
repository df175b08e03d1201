//! # roster: cluster membership and server status registry
//!
//! Maintains, for every server participating in a cluster, a
//! continuously updated record of its identity, process metadata,
//! network configuration, and live connection state. Peer links carry
//! heartbeats and feed connect and disconnect observations through a
//! liveness monitor into a per-node membership directory; gossip fans
//! applied updates out to peers, and a status view materializes the
//! directory into queryable rows.
//!
//! Each node serves its own best local knowledge. Views are eventually
//! consistent across the cluster, with per-server causal ordering
//! enforced by record versions; a network partition is not an error,
//! and both sides keep serving until gossip resumes.

#![warn(clippy::all)]

pub mod anomaly;
pub mod clock;
pub mod config;
pub mod directory;
pub mod error;
pub mod gossip;
pub mod link;
pub mod liveness;
pub mod node;
pub mod types;
pub mod view;

// Re-export main types
pub use anomaly::{Anomaly, AnomalySink, ChannelSink, LogSink, SharedSink};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{LinkConfig, NetworkOptions, RosterConfig};
pub use directory::{MembershipDirectory, UpsertOutcome};
pub use error::{LinkError, RosterError, RosterResult};
pub use gossip::GossipPropagator;
pub use link::{CloseReason, LinkEvent, LinkMessage, PeerLink};
pub use liveness::{ConnectOutcome, DisconnectOutcome, LivenessMonitor};
pub use node::RosterNode;
pub use types::{
    CanonicalAddress, ConnectionState, ConnectionStatus, NetworkInfo, ProcessInfo, RecordVersion,
    ServerAnnouncement, ServerId, ServerRecord,
};
pub use view::{ConnectionTimes, ServerStatusRow, StatusSubscription, StatusView};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
