//! Wire format for peer links
//!
//! Frames carry a 4-byte big-endian length prefix followed by a bincode
//! payload. Oversized frames are rejected before the payload is read.

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::error::LinkError;
use crate::types::{ServerAnnouncement, ServerRecord};

/// Protocol version spoken on cluster links
pub const PROTOCOL_VERSION: u32 = 1;

const LENGTH_PREFIX_BYTES: usize = 4;

/// Messages exchanged over a peer link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LinkMessage {
    /// Dialer's opening message
    Handshake {
        /// Version of this wire protocol
        protocol_version: u32,
        /// Dialer's identity and metadata
        announcement: ServerAnnouncement,
    },
    /// Acceptor's reply, carrying its own identity when accepted
    HandshakeAck {
        /// Whether the link was accepted
        accepted: bool,
        /// Acceptor's identity and metadata
        announcement: Option<ServerAnnouncement>,
    },
    /// Periodic liveness probe; any frame resets the silence timer
    Heartbeat {
        /// Sender's clock when the probe was sent
        at: DateTime<Utc>,
    },
    /// Membership update fanned out to peers
    Gossip {
        /// The record being disseminated
        record: ServerRecord,
    },
    /// Clean shutdown notice; the receiver records the disconnect
    /// without waiting for the heartbeat timeout
    Goodbye,
}

/// Length-prefixed bincode codec
#[derive(Debug, Clone, Copy)]
pub struct Framing {
    max_frame_bytes: usize,
}

impl Framing {
    /// Codec accepting payloads up to `max_frame_bytes`
    pub fn new(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }

    /// Encode a message into a single frame
    pub fn encode(&self, message: &LinkMessage) -> Result<Vec<u8>, LinkError> {
        let payload =
            bincode::serialize(message).map_err(|e| LinkError::Encode(e.to_string()))?;
        if payload.len() > self.max_frame_bytes {
            return Err(LinkError::FrameTooLarge {
                got: payload.len(),
                limit: self.max_frame_bytes,
            });
        }

        let mut frame = Vec::with_capacity(LENGTH_PREFIX_BYTES + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    /// Read one complete frame from `reader`.
    ///
    /// Returns `None` on a clean end of stream at a frame boundary. Only
    /// safe where this is the sole reader of the stream; concurrent
    /// readers must go through [`Framing::try_decode`] on a shared
    /// buffer instead.
    pub async fn read<R: AsyncReadExt + Unpin>(
        &self,
        reader: &mut R,
    ) -> Result<Option<LinkMessage>, LinkError> {
        let mut length_bytes = [0u8; LENGTH_PREFIX_BYTES];
        match reader.read_exact(&mut length_bytes).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(LinkError::Io(e)),
        }

        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > self.max_frame_bytes {
            return Err(LinkError::FrameTooLarge {
                got: length,
                limit: self.max_frame_bytes,
            });
        }

        let mut payload = BytesMut::zeroed(length);
        reader.read_exact(&mut payload).await.map_err(LinkError::Io)?;
        bincode::deserialize(&payload)
            .map(Some)
            .map_err(|e| LinkError::Decode(e.to_string()))
    }

    /// Write one frame to `writer`
    pub async fn write<W: AsyncWriteExt + Unpin>(
        &self,
        writer: &mut W,
        message: &LinkMessage,
    ) -> Result<(), LinkError> {
        let frame = self.encode(message)?;
        writer.write_all(&frame).await.map_err(LinkError::Io)?;
        writer.flush().await.map_err(LinkError::Io)?;
        Ok(())
    }

    /// Drain one complete frame from an accumulation buffer.
    ///
    /// Returns `None` until a whole frame is buffered. Incomplete frames
    /// are left in place, so the caller can keep appending socket reads
    /// to `buffer` from a `select!` loop without losing bytes.
    pub fn try_decode(&self, buffer: &mut BytesMut) -> Result<Option<LinkMessage>, LinkError> {
        if buffer.len() < LENGTH_PREFIX_BYTES {
            return Ok(None);
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX_BYTES];
        length_bytes.copy_from_slice(&buffer[..LENGTH_PREFIX_BYTES]);
        let length = u32::from_be_bytes(length_bytes) as usize;
        if length > self.max_frame_bytes {
            return Err(LinkError::FrameTooLarge {
                got: length,
                limit: self.max_frame_bytes,
            });
        }

        if buffer.len() < LENGTH_PREFIX_BYTES + length {
            return Ok(None);
        }

        buffer.advance(LENGTH_PREFIX_BYTES);
        let payload = buffer.split_to(length);
        bincode::deserialize(&payload)
            .map(Some)
            .map_err(|e| LinkError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> Framing {
        Framing::new(1024 * 1024)
    }

    #[tokio::test]
    async fn test_frame_round_trip() {
        let framing = codec();
        let message = LinkMessage::Heartbeat { at: Utc::now() };

        let frame = framing.encode(&message).unwrap();
        let mut reader = frame.as_slice();
        let decoded = framing.read(&mut reader).await.unwrap().unwrap();
        assert!(matches!(decoded, LinkMessage::Heartbeat { .. }));
    }

    #[tokio::test]
    async fn test_end_of_stream_at_frame_boundary() {
        let framing = codec();
        let mut reader: &[u8] = &[];
        assert!(framing.read(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let framing = Framing::new(16);
        let header = (1024u32).to_be_bytes();
        let mut reader = header.as_slice();
        let result = framing.read(&mut reader).await;
        assert!(matches!(result, Err(LinkError::FrameTooLarge { .. })));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let framing = codec();
        let mut buffer = Vec::new();
        framing.write(&mut buffer, &LinkMessage::Goodbye).await.unwrap();

        let mut reader = buffer.as_slice();
        let decoded = framing.read(&mut reader).await.unwrap().unwrap();
        assert!(matches!(decoded, LinkMessage::Goodbye));
    }

    #[test]
    fn test_try_decode_waits_for_complete_frames() {
        let framing = codec();
        let frame = framing.encode(&LinkMessage::Goodbye).unwrap();

        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&frame[..2]);
        assert!(framing.try_decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&frame[2..frame.len() - 1]);
        assert!(framing.try_decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(&frame[frame.len() - 1..]);
        let decoded = framing.try_decode(&mut buffer).unwrap().unwrap();
        assert!(matches!(decoded, LinkMessage::Goodbye));
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_try_decode_drains_back_to_back_frames() {
        let framing = codec();
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&framing.encode(&LinkMessage::Goodbye).unwrap());
        buffer.extend_from_slice(
            &framing
                .encode(&LinkMessage::Heartbeat { at: Utc::now() })
                .unwrap(),
        );

        assert!(matches!(
            framing.try_decode(&mut buffer).unwrap().unwrap(),
            LinkMessage::Goodbye
        ));
        assert!(matches!(
            framing.try_decode(&mut buffer).unwrap().unwrap(),
            LinkMessage::Heartbeat { .. }
        ));
        assert!(framing.try_decode(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_try_decode_rejects_oversized_header() {
        let framing = Framing::new(16);
        let mut buffer = BytesMut::new();
        buffer.extend_from_slice(&(1024u32).to_be_bytes());
        assert!(matches!(
            framing.try_decode(&mut buffer),
            Err(LinkError::FrameTooLarge { .. })
        ));
    }
}
