//! Host transports.
//!
//! A transport owns the mechanics of the message channel: it creates
//! endpoints bound to a protocol id, delivers inbound messages to the
//! handler registered with the endpoint, and sends addressed replies.
//!
//! Implementations:
//! - `loopback`: in-memory transport, delivery on the caller's thread
//! - `netlink`: Linux `AF_NETLINK` socket with a dedicated receive thread

pub mod loopback;
mod message;
#[cfg(target_os = "linux")]
pub mod netlink;

pub use loopback::LoopbackTransport;
pub use message::{AllocError, InboundMessage, OutboundMessage, PeerId};
#[cfg(target_os = "linux")]
pub use netlink::NetlinkTransport;

use std::fmt;
use std::io;
use std::sync::Arc;

/// Largest outbound payload accepted by default.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Receiver of inbound messages for an endpoint.
///
/// The transport invokes `on_message` once per inbound message, possibly from
/// a thread of its own.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, msg: InboundMessage);
}

/// A host transport able to create endpoints and send addressed messages.
pub trait Transport: Send + Sync + 'static {
    /// Handle on an endpoint created by this transport.
    type Endpoint: Send + Sync + 'static;

    /// Create an endpoint for `protocol_id`, routing all of its inbound
    /// messages to `handler`.
    fn create_endpoint(
        &self,
        protocol_id: u32,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Self::Endpoint, TransportError>;

    /// Obtain an outbound message buffer addressed to `dest`.
    fn allocate(&self, dest: PeerId, payload: &[u8]) -> Result<OutboundMessage, AllocError> {
        OutboundMessage::allocate(dest, payload, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Send `msg` point-to-point to its destination.
    fn send(&self, endpoint: &Self::Endpoint, msg: OutboundMessage) -> Result<(), TransportError>;

    /// Give the endpoint back to the transport. No messages are delivered to
    /// its handler once this returns.
    fn release_endpoint(&self, endpoint: Self::Endpoint);
}

/// Transport-level failures.
#[derive(Debug)]
pub enum TransportError {
    /// Underlying socket operation failed.
    Io(io::Error),
    /// Another endpoint is already bound to the protocol id.
    AddressInUse(u32),
    /// The endpoint has been released.
    Closed,
    /// The destination peer could not be reached.
    Unreachable(PeerId),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Io(e) => write!(f, "I/O error: {e}"),
            TransportError::AddressInUse(protocol_id) => {
                write!(f, "protocol {protocol_id} already has an endpoint")
            }
            TransportError::Closed => write!(f, "endpoint is closed"),
            TransportError::Unreachable(peer) => write!(f, "peer {peer} is unreachable"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        TransportError::Io(e)
    }
}
