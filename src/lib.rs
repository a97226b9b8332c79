//! Netlink echo responder.
//!
//! An [`EchoResponder`] owns one endpoint on a [`Transport`] and answers
//! every inbound message with a fixed greeting sent back to the message's
//! sender. Transports:
//!
//! - [`transport::LoopbackTransport`]: in-memory, for tests and local demos
//! - `transport::NetlinkTransport`: Linux `AF_NETLINK` sockets

pub mod config;
pub mod responder;
pub mod transport;

pub use responder::{EchoResponder, InitError, ReplyError, State, Stats, REPLY_MESSAGE};
pub use transport::{InboundMessage, MessageHandler, OutboundMessage, PeerId, Transport};
