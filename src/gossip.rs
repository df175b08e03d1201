//! Gossip propagation
//!
//! Every update applied to the local directory fans out to every
//! connected peer. A receiving peer re-applies the record through its
//! own directory and, because only strictly advancing updates are
//! applied and re-broadcast, each update crosses each link a bounded
//! number of times before the cluster converges. A partitioned subgraph
//! keeps gossiping among itself and catches up when links return.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, RwLock};

use crate::directory::{MembershipDirectory, UpsertOutcome};
use crate::link::PeerLink;
use crate::types::{ServerId, ServerRecord};

/// Fans membership updates out to connected peers
#[derive(Debug)]
pub struct GossipPropagator {
    directory: Arc<MembershipDirectory>,
    peers: RwLock<HashMap<ServerId, PeerLink>>,
}

impl GossipPropagator {
    /// Create a propagator over `directory`
    pub fn new(directory: Arc<MembershipDirectory>) -> Self {
        Self {
            directory,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a live link for fan-out
    pub async fn add_peer(&self, link: PeerLink) {
        self.peers.write().await.insert(link.peer(), link);
    }

    /// Drop a closed link
    pub async fn remove_peer(&self, peer: ServerId) {
        self.peers.write().await.remove(&peer);
    }

    /// Remove and return every registered link
    pub async fn drain_peers(&self) -> Vec<PeerLink> {
        self.peers.write().await.drain().map(|(_, link)| link).collect()
    }

    /// Servers currently registered for fan-out
    pub async fn peer_ids(&self) -> Vec<ServerId> {
        self.peers.read().await.keys().copied().collect()
    }

    /// Push every known record to one peer.
    ///
    /// Runs when a link comes up so the far side converges without
    /// waiting for organic updates.
    pub async fn sync_peer(&self, peer: ServerId) {
        let records = self.directory.list();
        let peers = self.peers.read().await;
        let Some(link) = peers.get(&peer) else {
            return;
        };
        for record in records {
            if let Err(e) = link.send_gossip(record).await {
                log::debug!("initial sync to {} stopped: {}", peer, e);
                break;
            }
        }
    }

    /// Apply a record received from a peer.
    ///
    /// A record that strictly advances local state is re-broadcast to
    /// the node's own peers by the fan-out pump; a stale one goes
    /// nowhere, which is what stops re-broadcast loops.
    pub fn handle_update(&self, record: ServerRecord) -> UpsertOutcome {
        self.directory.upsert(record)
    }

    /// Send one record to every registered peer
    pub async fn broadcast(&self, record: &ServerRecord) {
        let peers = self.peers.read().await;
        for (peer, link) in peers.iter() {
            if let Err(e) = link.send_gossip(record.clone()).await {
                log::debug!("gossip to {} failed: {}", peer, e);
            }
        }
    }

    /// Fan applied directory updates out to peers until the directory
    /// is dropped.
    ///
    /// Falling behind the change stream loses nothing permanently: the
    /// full state is pushed again to every peer, the same path a fresh
    /// link takes.
    pub async fn pump(self: Arc<Self>, mut changes: broadcast::Receiver<ServerRecord>) {
        loop {
            match changes.recv().await {
                Ok(record) => self.broadcast(&record).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("gossip fan-out lagged, resyncing after {} missed updates", skipped);
                    for peer in self.peer_ids().await {
                        self.sync_peer(peer).await;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::ChannelSink;
    use crate::link::LinkMessage;
    use crate::types::{
        CanonicalAddress, NetworkInfo, ProcessInfo, RecordVersion, ServerAnnouncement,
    };
    use chrono::Utc;
    use tokio::sync::mpsc;

    fn record(id: ServerId, generation: u64, seq: u64) -> ServerRecord {
        let announcement = ServerAnnouncement {
            id,
            name: "a".to_string(),
            tags: vec![],
            process: ProcessInfo {
                version: "roster 0.1.0".to_string(),
                pid: 100,
                cache_size_mb: 512,
                time_started: Utc::now(),
                generation,
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
        };
        let mut record = announcement.into_record(Utc::now());
        record.version = RecordVersion { generation, seq };
        record
    }

    fn propagator() -> (Arc<GossipPropagator>, Arc<MembershipDirectory>) {
        let (sink, _rx) = ChannelSink::new();
        let directory = MembershipDirectory::shared(Arc::new(sink));
        (Arc::new(GossipPropagator::new(directory.clone())), directory)
    }

    fn fake_link(peer: ServerId) -> (PeerLink, mpsc::Receiver<LinkMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (PeerLink::for_tests(peer, tx), rx)
    }

    #[tokio::test]
    async fn test_peer_registration() {
        let (propagator, _directory) = propagator();
        let peer = ServerId::new();
        let (link, _rx) = fake_link(peer);

        propagator.add_peer(link).await;
        assert_eq!(propagator.peer_ids().await, vec![peer]);

        propagator.remove_peer(peer).await;
        assert!(propagator.peer_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer() {
        let (propagator, _directory) = propagator();
        let (link_b, mut rx_b) = fake_link(ServerId::new());
        let (link_c, mut rx_c) = fake_link(ServerId::new());
        propagator.add_peer(link_b).await;
        propagator.add_peer(link_c).await;

        let update = record(ServerId::new(), 1, 0);
        propagator.broadcast(&update).await;

        for rx in [&mut rx_b, &mut rx_c] {
            match rx.recv().await.unwrap() {
                LinkMessage::Gossip { record: seen } => assert_eq!(seen, update),
                other => panic!("unexpected message {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_handle_update_applies_and_rejects() {
        let (propagator, directory) = propagator();
        let id = ServerId::new();

        assert!(propagator.handle_update(record(id, 1, 1)).is_applied());
        // The same version arriving again, as it does when a peer echoes
        // an update back to its origin, changes nothing.
        assert_eq!(
            propagator.handle_update(record(id, 1, 1)),
            UpsertOutcome::Stale
        );
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn test_pump_fans_out_applied_updates() {
        let (propagator, directory) = propagator();
        let (link, mut rx) = fake_link(ServerId::new());
        propagator.add_peer(link).await;

        let changes = directory.subscribe();
        let pump = tokio::spawn(propagator.clone().pump(changes));

        let update = record(ServerId::new(), 1, 0);
        directory.upsert(update.clone());

        match rx.recv().await.unwrap() {
            LinkMessage::Gossip { record: seen } => assert_eq!(seen, update),
            other => panic!("unexpected message {:?}", other),
        }

        drop(directory);
        drop(propagator);
        pump.abort();
    }

    #[tokio::test]
    async fn test_sync_peer_pushes_full_state() {
        let (propagator, directory) = propagator();
        let peer = ServerId::new();
        let (link, mut rx) = fake_link(peer);
        propagator.add_peer(link).await;

        directory.upsert(record(ServerId::new(), 1, 0));
        directory.upsert(record(ServerId::new(), 1, 0));

        propagator.sync_peer(peer).await;

        let mut seen = 0;
        while let Ok(message) = rx.try_recv() {
            assert!(matches!(message, LinkMessage::Gossip { .. }));
            seen += 1;
        }
        assert_eq!(seen, 2);
    }
}
