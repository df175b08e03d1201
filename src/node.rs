//! Registry node
//!
//! [`RosterNode`] owns the cluster listener, the peer links, and the
//! event loop that feeds link observations through the liveness monitor
//! into the membership directory. Applied updates fan out to peers
//! through the gossip propagator, and the status view materializes the
//! directory for the query layer.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::anomaly::{LogSink, SharedSink};
use crate::clock::{SharedClock, SystemClock};
use crate::config::RosterConfig;
use crate::directory::MembershipDirectory;
use crate::error::{RosterError, RosterResult};
use crate::gossip::GossipPropagator;
use crate::link::{self, LinkEvent};
use crate::liveness::LivenessMonitor;
use crate::types::{CanonicalAddress, NetworkInfo, ProcessInfo, ServerAnnouncement, ServerId};
use crate::view::StatusView;

const EVENT_QUEUE_DEPTH: usize = 256;

/// A server participating in the membership registry
#[derive(Debug)]
pub struct RosterNode {
    config: RosterConfig,
    id: ServerId,
    clock: SharedClock,
    directory: Arc<MembershipDirectory>,
    propagator: Arc<GossipPropagator>,
    monitor: LivenessMonitor,
    announcement: Arc<parking_lot::RwLock<ServerAnnouncement>>,
    cluster_addr: Option<SocketAddr>,
    events_tx: mpsc::Sender<LinkEvent>,
    events_rx: Option<mpsc::Receiver<LinkEvent>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl RosterNode {
    /// Create a node from configuration, with the system clock and the
    /// logging anomaly sink.
    pub fn new(config: RosterConfig) -> RosterResult<Self> {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(LogSink))
    }

    /// Create a node with an explicit clock and anomaly sink
    pub fn with_parts(
        config: RosterConfig,
        clock: SharedClock,
        sink: SharedSink,
    ) -> RosterResult<Self> {
        config.validate()?;

        let id = ServerId::new();
        let started = clock.now();
        let generation = config
            .generation
            .unwrap_or_else(|| started.timestamp_millis().max(0) as u64);

        let process = ProcessInfo {
            version: format!("roster {}", crate::VERSION),
            pid: std::process::id(),
            cache_size_mb: config.cache_size_mb,
            time_started: started,
            generation,
        };
        let network = NetworkInfo {
            hostname: config.network.hostname.clone(),
            reql_port: config.network.reql_port,
            cluster_port: config.network.cluster_port,
            http_admin_port: config.network.http_admin_port,
            canonical_addresses: config.network.canonical_addresses.clone(),
        };
        let announcement = ServerAnnouncement {
            id,
            name: config.name.clone(),
            tags: config.tags.clone(),
            process,
            network,
        };

        let directory = MembershipDirectory::shared(sink.clone());
        let propagator = Arc::new(GossipPropagator::new(directory.clone()));
        let monitor = LivenessMonitor::new(directory.clone(), sink);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);

        Ok(Self {
            config,
            id,
            clock,
            directory,
            propagator,
            monitor,
            announcement: Arc::new(parking_lot::RwLock::new(announcement)),
            cluster_addr: None,
            events_tx,
            events_rx: Some(events_rx),
            shutdown_tx: None,
            tasks: Vec::new(),
        })
    }

    /// Unique identifier of this server
    pub fn id(&self) -> ServerId {
        self.id
    }

    /// Display name of this server
    pub fn name(&self) -> String {
        self.announcement.read().name.clone()
    }

    /// Address of the cluster listener once the node has started
    pub fn cluster_addr(&self) -> Option<SocketAddr> {
        self.cluster_addr
    }

    /// Read-only view of everything this node knows
    pub fn status_view(&self) -> StatusView {
        StatusView::new(self.directory.clone())
    }

    /// Bind the cluster listener, record this server as available, and
    /// spawn the accept, event, and gossip tasks.
    pub async fn start(&mut self) -> RosterResult<()> {
        let events_rx = self
            .events_rx
            .take()
            .ok_or_else(|| RosterError::Config("node already started".into()))?;

        let listener = TcpListener::bind((
            self.config.network.bind_host.as_str(),
            self.config.network.cluster_port,
        ))
        .await?;
        let local_addr = listener.local_addr()?;
        self.cluster_addr = Some(local_addr);

        // An ephemeral bind is only known now; advertise the real port.
        {
            let mut announcement = self.announcement.write();
            announcement.network.cluster_port = local_addr.port();
            if announcement.network.canonical_addresses.is_empty() {
                announcement.network.canonical_addresses = vec![CanonicalAddress {
                    host: announcement.network.hostname.clone(),
                    port: local_addr.port(),
                }];
            }
        }

        // This server lists itself, available as of startup completion.
        let startup_done = self.clock.now();
        let own_record = self.announcement.read().clone().into_record(startup_done);
        self.directory.upsert(own_record);

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        let events = self.events_tx.clone();
        let announcement = self.announcement.clone();
        let link_config = self.config.link.clone();
        let clock = self.clock.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    incoming = listener.accept() => match incoming {
                        Ok((stream, remote)) => {
                            let local = announcement.read().clone();
                            let events = events.clone();
                            let link_config = link_config.clone();
                            let clock = clock.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    link::accept(stream, local, link_config, clock, events).await
                                {
                                    log::warn!("incoming link from {} failed: {}", remote, e);
                                }
                            });
                        }
                        Err(e) => {
                            log::warn!("accept failed: {}", e);
                            break;
                        }
                    }
                }
            }
        });

        let event_task = tokio::spawn(event_loop(
            events_rx,
            self.monitor.clone(),
            self.propagator.clone(),
        ));

        let pump_task = tokio::spawn(self.propagator.clone().pump(self.directory.subscribe()));

        self.tasks = vec![accept_task, event_task, pump_task];
        log::info!(
            "server {} ({}) listening on {}",
            self.name(),
            self.id,
            local_addr
        );
        Ok(())
    }

    /// Establish a link to a peer's cluster address
    pub async fn connect_to_peer(&self, addr: SocketAddr) -> RosterResult<ServerId> {
        let local = self.announcement.read().clone();
        let link = link::connect(
            addr,
            local,
            self.config.link.clone(),
            self.clock.clone(),
            self.events_tx.clone(),
        )
        .await?;
        Ok(link.peer())
    }

    /// Rename this server or change its tags.
    ///
    /// The patched record propagates to peers through gossip.
    pub fn update_metadata(&self, name: Option<String>, tags: Option<Vec<String>>) {
        let updated = {
            let mut announcement = self.announcement.write();
            if let Some(name) = name {
                announcement.name = name;
            }
            if let Some(tags) = tags {
                announcement.tags = tags;
            }
            announcement.clone()
        };

        if let Some(stored) = self.directory.get(self.id) {
            let mut record = stored.clone();
            record.name = updated.name;
            record.tags = updated.tags;
            record.version = stored.version.next_patch();
            self.directory.upsert(record);
        }
    }

    /// Gracefully stop: announce shutdown on every link, then stop the
    /// listener and the event loop.
    ///
    /// Peers that receive the shutdown notice record the disconnect
    /// immediately instead of waiting out the heartbeat timeout.
    pub async fn shutdown(&mut self) -> RosterResult<()> {
        for link in self.propagator.drain_peers().await {
            if let Err(e) = link.close().await {
                log::debug!("shutdown notice to {} failed: {}", link.peer(), e);
            }
        }

        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(()).await;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }

        log::info!("server {} ({}) stopped", self.name(), self.id);
        Ok(())
    }
}

/// Feed link observations through the liveness monitor and keep the
/// gossip peer set in step with live links.
async fn event_loop(
    mut events: mpsc::Receiver<LinkEvent>,
    monitor: LivenessMonitor,
    propagator: Arc<GossipPropagator>,
) {
    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Established { link, peer, at } => {
                let peer_id = peer.id;
                let outcome = monitor.handle_connected(peer, at);
                log::debug!("link up to {}: {:?}", peer_id, outcome);
                propagator.add_peer(link).await;
                propagator.sync_peer(peer_id).await;
            }
            LinkEvent::Gossip { from, record } => {
                let outcome = propagator.handle_update(record);
                log::trace!("gossip from {}: {:?}", from, outcome);
            }
            LinkEvent::Closed { peer, at, reason } => {
                log::debug!("link down to {}: {:?}", peer, reason);
                propagator.remove_peer(peer).await;
                monitor.handle_disconnected(peer, at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConnectionStatus;

    fn config(name: &str) -> RosterConfig {
        let mut config = RosterConfig::named(name);
        config.network.hostname = "localhost".to_string();
        config
    }

    #[tokio::test]
    async fn test_started_node_lists_itself_available() {
        let mut node = RosterNode::new(config("a")).unwrap();
        node.start().await.unwrap();

        let view = node.status_view();
        assert_eq!(view.count(), 1);

        let row = view.get(node.id()).unwrap();
        assert_eq!(row.name, "a");
        assert_eq!(row.status, ConnectionStatus::Available);
        assert!(row.connection.time_connected.is_some());
        assert!(row.connection.time_disconnected.is_none());
        assert!(row.connection.time_connected.unwrap() >= row.process.time_started);

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_ephemeral_bind_is_advertised() {
        let mut node = RosterNode::new(config("a")).unwrap();
        node.start().await.unwrap();

        let bound = node.cluster_addr().unwrap();
        assert_ne!(bound.port(), 0);

        let row = node.status_view().get(node.id()).unwrap();
        assert_eq!(row.network.cluster_port, bound.port());
        assert_eq!(row.network.canonical_addresses[0].port, bound.port());
        assert_eq!(row.network.canonical_addresses[0].host, "localhost");
        assert_eq!(row.network.hostname, "localhost");

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let mut node = RosterNode::new(config("a")).unwrap();
        node.start().await.unwrap();
        assert!(node.start().await.is_err());
        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_metadata_patches_own_record() {
        let mut node = RosterNode::new(config("a")).unwrap();
        node.start().await.unwrap();

        let before = node.status_view().get(node.id()).unwrap();
        node.update_metadata(
            Some("a-renamed".to_string()),
            Some(vec!["foo".to_string()]),
        );

        let after = node.status_view().get(node.id()).unwrap();
        assert_eq!(after.name, "a-renamed");
        assert_eq!(after.tags, vec!["foo".to_string()]);
        assert_eq!(node.name(), "a-renamed");
        // The patch kept the connection state intact.
        assert_eq!(after.status, ConnectionStatus::Available);
        assert_eq!(
            after.connection.time_connected,
            before.connection.time_connected
        );

        node.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_generation_override_is_used() {
        let mut config = config("a");
        config.generation = Some(42);
        let node = RosterNode::new(config).unwrap();
        // The record is only inserted on start, but the announcement
        // carries the override from construction.
        assert_eq!(node.announcement.read().process.generation, 42);
    }
}
