//! Message types exchanged between a transport and its handler.

use bytes::Bytes;
use std::fmt;

/// Opaque address of a peer: the sender of an inbound message or the
/// destination of a reply. On netlink this is the socket's port id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message delivered by the transport.
///
/// Handlers receive it by value and must not keep it past the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub sender: PeerId,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(sender: PeerId, payload: impl Into<Bytes>) -> Self {
        Self {
            sender,
            payload: payload.into(),
        }
    }
}

/// A message handed to the transport for point-to-point delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    dest: PeerId,
    payload: Bytes,
}

impl OutboundMessage {
    /// Build an outbound message, reserving its payload fallibly.
    ///
    /// Returns `AllocError` instead of aborting when the buffer cannot be
    /// reserved or exceeds `limit` bytes.
    pub fn allocate(dest: PeerId, payload: &[u8], limit: usize) -> Result<Self, AllocError> {
        if payload.len() > limit {
            return Err(AllocError {
                requested: payload.len(),
            });
        }

        let mut buf = Vec::new();
        buf.try_reserve_exact(payload.len())
            .map_err(|_| AllocError {
                requested: payload.len(),
            })?;
        buf.extend_from_slice(payload);

        Ok(Self {
            dest,
            payload: Bytes::from(buf),
        })
    }

    /// Wrap bytes a transport has already laid out for the wire.
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    pub(crate) fn from_frame(dest: PeerId, frame: Bytes) -> Self {
        Self {
            dest,
            payload: frame,
        }
    }

    /// Destination peer of this message.
    pub fn dest(&self) -> PeerId {
        self.dest
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_parts(self) -> (PeerId, Bytes) {
        (self.dest, self.payload)
    }
}

/// No buffer could be obtained for an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError {
    /// Payload bytes that were requested.
    pub requested: usize,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "failed to allocate outbound message of {} bytes",
            self.requested
        )
    }
}

impl std::error::Error for AllocError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_copies_payload() {
        let msg = OutboundMessage::allocate(PeerId(7), b"hello", 64).unwrap();
        assert_eq!(msg.dest(), PeerId(7));
        assert_eq!(&msg.payload()[..], b"hello");
    }

    #[test]
    fn test_allocate_over_limit() {
        let err = OutboundMessage::allocate(PeerId(7), &[0u8; 32], 16).unwrap_err();
        assert_eq!(err.requested, 32);
        assert_eq!(
            err.to_string(),
            "failed to allocate outbound message of 32 bytes"
        );
    }

    #[test]
    fn test_empty_inbound_payload() {
        let msg = InboundMessage::new(PeerId(1), Bytes::new());
        assert!(msg.payload.is_empty());
        assert_eq!(msg.sender.to_string(), "1");
    }
}
