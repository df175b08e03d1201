//! Peer links
//!
//! A peer link is one bidirectional connection to another cluster
//! member, carrying heartbeats and membership gossip. Each link runs a
//! single worker task that multiplexes the outbound queue, incoming
//! frames, the heartbeat schedule, and the silence timer. The link
//! reports what it observes on an event channel and terminates on the
//! first failure; it never reconnects on its own. Re-establishing a
//! lost link means dialing again.

pub mod wire;

pub use wire::{Framing, LinkMessage, PROTOCOL_VERSION};

use std::net::SocketAddr;

use bytes::BytesMut;
use chrono::{DateTime, Utc};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::clock::SharedClock;
use crate::config::LinkConfig;
use crate::error::LinkError;
use crate::types::{ServerAnnouncement, ServerId, ServerRecord};

const OUTBOUND_QUEUE_DEPTH: usize = 64;
const READ_BUFFER_CAPACITY: usize = 8 * 1024;

/// Why a link closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer announced a clean shutdown
    Goodbye,
    /// No traffic arrived within the heartbeat timeout
    HeartbeatTimeout,
    /// Socket failure or end of stream
    Io(String),
    /// The local side shut the link down
    LocalShutdown,
}

/// Observations a link reports to its owner
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Handshake completed and the peer's identity is known
    Established {
        /// Handle for sending on the new link
        link: PeerLink,
        /// The peer's identity and metadata
        peer: ServerAnnouncement,
        /// Local observation time
        at: DateTime<Utc>,
    },
    /// A gossip frame arrived
    Gossip {
        /// Peer the frame arrived from
        from: ServerId,
        /// The disseminated record
        record: ServerRecord,
    },
    /// The link is gone
    Closed {
        /// Peer the link was to
        peer: ServerId,
        /// Local observation time
        at: DateTime<Utc>,
        /// What ended the link
        reason: CloseReason,
    },
}

/// Handle to a live link.
///
/// Cloneable and cheap; dropping every handle makes the worker announce
/// shutdown and close.
#[derive(Debug, Clone)]
pub struct PeerLink {
    peer: ServerId,
    peer_addr: SocketAddr,
    outbound: mpsc::Sender<LinkMessage>,
}

impl PeerLink {
    #[cfg(test)]
    pub(crate) fn for_tests(peer: ServerId, outbound: mpsc::Sender<LinkMessage>) -> Self {
        Self {
            peer,
            peer_addr: "127.0.0.1:0".parse().expect("literal address"),
            outbound,
        }
    }

    /// Server on the far end
    pub fn peer(&self) -> ServerId {
        self.peer
    }

    /// Remote socket address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Queue a message for the peer
    pub async fn send(&self, message: LinkMessage) -> Result<(), LinkError> {
        self.outbound
            .send(message)
            .await
            .map_err(|_| LinkError::Closed)
    }

    /// Queue a membership record for the peer
    pub async fn send_gossip(&self, record: ServerRecord) -> Result<(), LinkError> {
        self.send(LinkMessage::Gossip { record }).await
    }

    /// Announce shutdown to the peer and close the link
    pub async fn close(&self) -> Result<(), LinkError> {
        self.send(LinkMessage::Goodbye).await
    }
}

/// Dial a peer, perform the handshake, and start the link worker.
///
/// The `Established` event is queued before this returns, so the owner
/// observes the connect before any gossip from the same peer.
pub async fn connect(
    addr: SocketAddr,
    local: ServerAnnouncement,
    config: LinkConfig,
    clock: SharedClock,
    events: mpsc::Sender<LinkEvent>,
) -> Result<PeerLink, LinkError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|source| LinkError::ConnectFailed { addr, source })?;
    let framing = Framing::new(config.max_frame_bytes);

    let opening = LinkMessage::Handshake {
        protocol_version: PROTOCOL_VERSION,
        announcement: local,
    };
    framing.write(&mut stream, &opening).await?;

    let reply = framing.read(&mut stream).await?.ok_or(LinkError::Closed)?;
    let peer = match reply {
        LinkMessage::HandshakeAck {
            accepted: true,
            announcement: Some(peer),
        } => peer,
        LinkMessage::HandshakeAck { .. } => return Err(LinkError::HandshakeRejected),
        other => {
            return Err(LinkError::Decode(format!(
                "expected handshake ack, got {:?}",
                other
            )))
        }
    };

    establish(stream, peer, config, clock, events).await
}

/// Accept an incoming link: read the peer's handshake, acknowledge with
/// the local announcement, and start the link worker.
pub async fn accept(
    mut stream: TcpStream,
    local: ServerAnnouncement,
    config: LinkConfig,
    clock: SharedClock,
    events: mpsc::Sender<LinkEvent>,
) -> Result<PeerLink, LinkError> {
    let framing = Framing::new(config.max_frame_bytes);

    let opening = framing.read(&mut stream).await?.ok_or(LinkError::Closed)?;
    let peer = match opening {
        LinkMessage::Handshake {
            protocol_version,
            announcement,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                let refusal = LinkMessage::HandshakeAck {
                    accepted: false,
                    announcement: None,
                };
                let _ = framing.write(&mut stream, &refusal).await;
                return Err(LinkError::UnsupportedProtocol(protocol_version));
            }
            announcement
        }
        other => {
            return Err(LinkError::Decode(format!(
                "expected handshake, got {:?}",
                other
            )))
        }
    };

    let acknowledgment = LinkMessage::HandshakeAck {
        accepted: true,
        announcement: Some(local),
    };
    framing.write(&mut stream, &acknowledgment).await?;

    establish(stream, peer, config, clock, events).await
}

async fn establish(
    stream: TcpStream,
    peer: ServerAnnouncement,
    config: LinkConfig,
    clock: SharedClock,
    events: mpsc::Sender<LinkEvent>,
) -> Result<PeerLink, LinkError> {
    let peer_addr = stream.peer_addr().map_err(LinkError::Io)?;
    let peer_id = peer.id;
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    let link = PeerLink {
        peer: peer_id,
        peer_addr,
        outbound: outbound_tx,
    };

    let at = clock.now();
    events
        .send(LinkEvent::Established {
            link: link.clone(),
            peer,
            at,
        })
        .await
        .map_err(|_| LinkError::Closed)?;

    tokio::spawn(worker_loop(
        stream,
        peer_id,
        config,
        clock,
        events,
        outbound_rx,
    ));
    Ok(link)
}

async fn worker_loop(
    stream: TcpStream,
    peer: ServerId,
    config: LinkConfig,
    clock: SharedClock,
    events: mpsc::Sender<LinkEvent>,
    mut outbound: mpsc::Receiver<LinkMessage>,
) {
    let framing = Framing::new(config.max_frame_bytes);
    let (mut reader, mut writer) = stream.into_split();
    let mut inbound = BytesMut::with_capacity(READ_BUFFER_CAPACITY);

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let silence_limit = config.heartbeat_timeout();
    let mut last_traffic = Instant::now();

    let reason = 'link: loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(message) => {
                    let closing = matches!(message, LinkMessage::Goodbye);
                    if let Err(e) = framing.write(&mut writer, &message).await {
                        break 'link CloseReason::Io(e.to_string());
                    }
                    if closing {
                        break 'link CloseReason::LocalShutdown;
                    }
                }
                None => {
                    let _ = framing.write(&mut writer, &LinkMessage::Goodbye).await;
                    break 'link CloseReason::LocalShutdown;
                }
            },
            _ = heartbeat.tick() => {
                let probe = LinkMessage::Heartbeat { at: clock.now() };
                if let Err(e) = framing.write(&mut writer, &probe).await {
                    break 'link CloseReason::Io(e.to_string());
                }
            }
            _ = tokio::time::sleep_until(last_traffic + silence_limit) => {
                break 'link CloseReason::HeartbeatTimeout;
            }
            read = reader.read_buf(&mut inbound) => match read {
                Ok(0) => break 'link CloseReason::Io("connection closed".to_string()),
                Ok(_) => {
                    last_traffic = Instant::now();
                    loop {
                        match framing.try_decode(&mut inbound) {
                            Ok(Some(message)) => {
                                if let Some(reason) = handle_frame(peer, message, &events).await {
                                    break 'link reason;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => break 'link CloseReason::Io(e.to_string()),
                        }
                    }
                }
                Err(e) => break 'link CloseReason::Io(e.to_string()),
            }
        }
    };

    log::debug!("link to {} closed: {:?}", peer, reason);
    let at = clock.now();
    let _ = events.send(LinkEvent::Closed { peer, at, reason }).await;
}

async fn handle_frame(
    peer: ServerId,
    message: LinkMessage,
    events: &mpsc::Sender<LinkEvent>,
) -> Option<CloseReason> {
    match message {
        // Any frame already reset the silence timer; a heartbeat carries
        // nothing else.
        LinkMessage::Heartbeat { .. } => None,
        LinkMessage::Gossip { record } => {
            let event = LinkEvent::Gossip { from: peer, record };
            if events.send(event).await.is_err() {
                Some(CloseReason::LocalShutdown)
            } else {
                None
            }
        }
        LinkMessage::Goodbye => Some(CloseReason::Goodbye),
        LinkMessage::Handshake { .. } | LinkMessage::HandshakeAck { .. } => {
            Some(CloseReason::Io("unexpected handshake frame".to_string()))
        }
    }
}
