//! Error types for the registry

use thiserror::Error;

/// Result type for registry operations
pub type RosterResult<T> = Result<T, RosterError>;

/// Main error type for registry operations.
///
/// Discarded events are not errors: stale or out-of-order observations
/// are dropped locally and reported to the anomaly sink instead of being
/// surfaced to callers.
#[derive(Error, Debug)]
pub enum RosterError {
    /// Peer link errors
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from a peer link.
///
/// Any of these observed on an established link terminates the link; a
/// lost link is re-established by dialing again, never by the link
/// itself.
#[derive(Error, Debug)]
pub enum LinkError {
    /// Dialing the peer failed
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        /// Address that was dialed
        addr: std::net::SocketAddr,
        /// Underlying I/O failure
        source: std::io::Error,
    },

    /// The peer refused the handshake
    #[error("handshake rejected by peer")]
    HandshakeRejected,

    /// The peer spoke an unknown protocol version
    #[error("unsupported protocol version {0}")]
    UnsupportedProtocol(u32),

    /// A frame exceeded the configured size cap
    #[error("frame of {got} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Announced frame size
        got: usize,
        /// Configured limit
        limit: usize,
    },

    /// The connection closed before the exchange completed
    #[error("connection closed by peer")]
    Closed,

    /// Encoding a frame failed
    #[error("encode failed: {0}")]
    Encode(String),

    /// Decoding a frame failed
    #[error("decode failed: {0}")]
    Decode(String),

    /// Socket failure
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}
