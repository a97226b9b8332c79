//! Echo responder.
//!
//! Owns a single transport endpoint and answers every inbound message with a
//! fixed greeting addressed to the message's sender. The payload of the
//! inbound message is never inspected.
//!
//! Lifecycle:
//!
//! ```text
//! Uninitialized --start ok--> Active --stop--> Released
//! ```
//!
//! A failed `start` leaves the responder `Uninitialized`. Messages are only
//! answered while `Active`; anything delivered before `start` or after `stop`
//! is dropped without a reply.

use crate::transport::{AllocError, InboundMessage, MessageHandler, Transport, TransportError};
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

/// Reply sent for every inbound message.
pub const REPLY_MESSAGE: &str = "Hello from kernel";

/// Protocol id the responder binds to unless configured otherwise.
pub const DEFAULT_PROTOCOL_ID: u32 = 31;

/// Lifecycle state of the responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Active,
    Released,
}

enum Lifecycle<E> {
    Uninitialized,
    Active(E),
    Released,
}

impl<E> Lifecycle<E> {
    fn state(&self) -> State {
        match self {
            Lifecycle::Uninitialized => State::Uninitialized,
            Lifecycle::Active(_) => State::Active,
            Lifecycle::Released => State::Released,
        }
    }
}

/// Counters snapshot returned by `EchoResponder::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub received: u64,
    pub replied: u64,
    pub send_failures: u64,
    pub alloc_failures: u64,
    pub dropped_inactive: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    replied: AtomicU64,
    send_failures: AtomicU64,
    alloc_failures: AtomicU64,
    dropped_inactive: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> Stats {
        Stats {
            received: self.received.load(Ordering::Relaxed),
            replied: self.replied.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            dropped_inactive: self.dropped_inactive.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the responder and the transport's delivery path.
struct Shared<T: Transport> {
    transport: T,
    protocol_id: u32,
    reply: Bytes,
    lifecycle: RwLock<Lifecycle<T::Endpoint>>,
    counters: Counters,
}

impl<T: Transport> Shared<T> {
    /// Build and send the reply for `msg`.
    fn reply(&self, msg: &InboundMessage) -> Result<(), ReplyError> {
        let lifecycle = self
            .lifecycle
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let endpoint = match &*lifecycle {
            Lifecycle::Active(endpoint) => endpoint,
            _ => return Err(ReplyError::Inactive(lifecycle.state())),
        };

        // Point-to-point back to the sender, never to a multicast group.
        let outbound = self
            .transport
            .allocate(msg.sender, &self.reply)
            .map_err(ReplyError::Allocation)?;
        self.transport
            .send(endpoint, outbound)
            .map_err(ReplyError::Send)
    }
}

impl<T: Transport> MessageHandler for Shared<T> {
    fn on_message(&self, msg: InboundMessage) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        debug!(sender = %msg.sender, len = msg.payload.len(), "Message received");

        match self.reply(&msg) {
            Ok(()) => {
                self.counters.replied.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                let counter = match e {
                    ReplyError::Inactive(_) => &self.counters.dropped_inactive,
                    ReplyError::Allocation(_) => &self.counters.alloc_failures,
                    ReplyError::Send(_) => &self.counters.send_failures,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                warn!(sender = %msg.sender, error = %e, "Reply dropped");
            }
        }
    }
}

/// Replies to every inbound message with a fixed greeting.
pub struct EchoResponder<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> EchoResponder<T> {
    /// Create a responder for `protocol_id` on `transport`.
    pub fn new(transport: T, protocol_id: u32) -> Self {
        Self::with_reply(transport, protocol_id, REPLY_MESSAGE)
    }

    /// Create a responder answering with `reply` instead of the default.
    pub fn with_reply(transport: T, protocol_id: u32, reply: impl Into<Bytes>) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                protocol_id,
                reply: reply.into(),
                lifecycle: RwLock::new(Lifecycle::Uninitialized),
                counters: Counters::default(),
            }),
        }
    }

    /// Acquire the endpoint and start answering messages.
    ///
    /// Only the first successful call takes effect; later calls are rejected
    /// with `AlreadyStarted` or `Released`.
    pub fn start(&self) -> Result<(), InitError> {
        let mut lifecycle = self
            .shared
            .lifecycle
            .write()
            .unwrap_or_else(PoisonError::into_inner);

        match *lifecycle {
            Lifecycle::Uninitialized => {}
            Lifecycle::Active(_) => return Err(InitError::AlreadyStarted),
            Lifecycle::Released => return Err(InitError::Released),
        }

        let handler: Arc<dyn MessageHandler> = self.shared.clone();
        let endpoint = self
            .shared
            .transport
            .create_endpoint(self.shared.protocol_id, handler)
            .map_err(InitError::EndpointCreationFailed)?;

        *lifecycle = Lifecycle::Active(endpoint);
        info!(protocol_id = self.shared.protocol_id, "Echo responder started");
        Ok(())
    }

    /// Release the endpoint. Does nothing unless the responder is active.
    pub fn stop(&self) {
        let endpoint = {
            let mut lifecycle = self
                .shared
                .lifecycle
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match std::mem::replace(&mut *lifecycle, Lifecycle::Released) {
                Lifecycle::Active(endpoint) => endpoint,
                previous => {
                    *lifecycle = previous;
                    debug!(state = ?lifecycle.state(), "Stop ignored, responder not active");
                    return;
                }
            }
        };

        // The lock is dropped so in-flight deliveries can finish while the
        // transport tears the endpoint down.
        self.shared.transport.release_endpoint(endpoint);

        let stats = self.stats();
        info!(
            protocol_id = self.shared.protocol_id,
            received = stats.received,
            replied = stats.replied,
            send_failures = stats.send_failures,
            alloc_failures = stats.alloc_failures,
            dropped_inactive = stats.dropped_inactive,
            "Echo responder stopped"
        );
    }

    pub fn state(&self) -> State {
        self.shared
            .lifecycle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .state()
    }

    pub fn protocol_id(&self) -> u32 {
        self.shared.protocol_id
    }

    pub fn stats(&self) -> Stats {
        self.shared.counters.snapshot()
    }
}

/// Never fails: a reply that cannot be built or sent is logged and dropped.
impl<T: Transport> MessageHandler for EchoResponder<T> {
    fn on_message(&self, msg: InboundMessage) {
        self.shared.on_message(msg);
    }
}

impl<T: Transport> Drop for EchoResponder<T> {
    fn drop(&mut self) {
        // Releasing the endpoint also drops the transport's handle on
        // `shared`.
        self.stop();
    }
}

/// Failure to bring the responder up.
#[derive(Debug)]
pub enum InitError {
    /// The transport could not allocate the endpoint.
    EndpointCreationFailed(TransportError),
    /// `start` was called while already active.
    AlreadyStarted,
    /// `start` was called after `stop`.
    Released,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InitError::EndpointCreationFailed(e) => write!(f, "failed to create endpoint: {e}"),
            InitError::AlreadyStarted => write!(f, "responder already started"),
            InitError::Released => write!(f, "responder has been stopped"),
        }
    }
}

impl std::error::Error for InitError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InitError::EndpointCreationFailed(e) => Some(e),
            _ => None,
        }
    }
}

/// Why a single reply was not sent. Never escapes `on_message`.
#[derive(Debug)]
pub enum ReplyError {
    /// The responder was not active when the message arrived.
    Inactive(State),
    /// No outbound buffer was available.
    Allocation(AllocError),
    /// The transport rejected the send.
    Send(TransportError),
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyError::Inactive(state) => write!(f, "responder is {state:?}"),
            ReplyError::Allocation(e) => write!(f, "{e}"),
            ReplyError::Send(e) => write!(f, "send failed: {e}"),
        }
    }
}

impl std::error::Error for ReplyError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LoopbackTransport, PeerId};
    use std::io;

    const PROTOCOL: u32 = DEFAULT_PROTOCOL_ID;

    fn started() -> (EchoResponder<LoopbackTransport>, LoopbackTransport) {
        let transport = LoopbackTransport::new();
        let responder = EchoResponder::new(transport.clone(), PROTOCOL);
        responder.start().unwrap();
        (responder, transport)
    }

    fn message(sender: u32, payload: &'static [u8]) -> InboundMessage {
        InboundMessage::new(PeerId(sender), payload)
    }

    #[test]
    fn test_reply_literal() {
        assert_eq!(REPLY_MESSAGE.len(), 17);
        assert!(!REPLY_MESSAGE.ends_with('\0'));
    }

    #[test]
    fn test_replies_to_sender_regardless_of_payload() {
        let (_responder, transport) = started();

        let payloads: [&'static [u8]; 4] = [b"", b"hello", b"\0\xff\x00binary", &[b'x'; 4096]];
        for (i, payload) in payloads.into_iter().enumerate() {
            let sender = 100 + i as u32;
            assert!(transport.deliver(PROTOCOL, message(sender, payload)));

            let sent = transport.take_sent();
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].dest, PeerId(sender));
            assert_eq!(&sent[0].payload[..], REPLY_MESSAGE.as_bytes());
        }
    }

    #[test]
    fn test_repeated_messages_get_independent_replies() {
        let (responder, transport) = started();

        for i in 0..10u8 {
            let payload: &'static [u8] = if i % 2 == 0 { b"even" } else { b"odd message" };
            transport.deliver(PROTOCOL, message(7, payload));
        }

        let sent = transport.sent();
        assert_eq!(sent.len(), 10);
        assert!(sent
            .iter()
            .all(|d| d.dest == PeerId(7) && d.payload == REPLY_MESSAGE.as_bytes()));
        assert_eq!(responder.stats().received, 10);
        assert_eq!(responder.stats().replied, 10);
    }

    #[test]
    fn test_second_start_rejected() {
        let (responder, transport) = started();

        assert!(matches!(responder.start(), Err(InitError::AlreadyStarted)));
        assert_eq!(responder.state(), State::Active);
        assert_eq!(transport.endpoint_count(), 1);

        responder.stop();
        assert!(matches!(responder.start(), Err(InitError::Released)));
        assert_eq!(responder.state(), State::Released);
        assert_eq!(transport.endpoint_count(), 0);
    }

    #[test]
    fn test_endpoint_creation_failure() {
        let transport = LoopbackTransport::new();
        transport.fail_endpoint_creation(io::ErrorKind::AddrInUse);
        let responder = EchoResponder::new(transport.clone(), PROTOCOL);

        let err = responder.start().unwrap_err();
        assert!(matches!(err, InitError::EndpointCreationFailed(_)));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(responder.state(), State::Uninitialized);

        // Failure is not sticky: the owner may try again.
        responder.start().unwrap();
        assert_eq!(responder.state(), State::Active);
    }

    #[test]
    fn test_protocol_taken_by_other_responder() {
        let (_first, transport) = started();
        let second = EchoResponder::new(transport.clone(), PROTOCOL);

        assert!(matches!(
            second.start(),
            Err(InitError::EndpointCreationFailed(TransportError::AddressInUse(
                PROTOCOL
            )))
        ));
    }

    #[test]
    fn test_send_failure_isolated() {
        let (responder, transport) = started();
        transport.fail_next_sends(1);

        transport.deliver(PROTOCOL, message(1, b"first"));
        transport.deliver(PROTOCOL, message(2, b"second"));

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dest, PeerId(2));

        let stats = responder.stats();
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.replied, 1);
        assert_eq!(responder.state(), State::Active);
    }

    #[test]
    fn test_unreachable_peer_does_not_affect_others() {
        let (_responder, transport) = started();
        transport.fail_sends_to(PeerId(13));

        transport.deliver(PROTOCOL, message(13, b"a"));
        transport.deliver(PROTOCOL, message(14, b"b"));
        transport.deliver(PROTOCOL, message(13, b"c"));

        let dests: Vec<_> = transport.sent().iter().map(|d| d.dest).collect();
        assert_eq!(dests, vec![PeerId(14)]);
    }

    #[test]
    fn test_allocation_failure_skips_one_reply() {
        let (responder, transport) = started();
        transport.fail_next_allocations(1);

        transport.deliver(PROTOCOL, message(5, b"x"));
        transport.deliver(PROTOCOL, message(5, b"y"));

        assert_eq!(transport.sent().len(), 1);
        assert_eq!(responder.stats().alloc_failures, 1);
    }

    #[test]
    fn test_reply_error_is_typed() {
        let (responder, transport) = started();
        transport.fail_next_sends(1);

        let result = responder.shared.reply(&message(3, b""));
        assert!(matches!(result, Err(ReplyError::Send(TransportError::Io(_)))));
        assert!(responder.shared.reply(&message(3, b"")).is_ok());
    }

    #[test]
    fn test_no_reply_after_stop() {
        let (responder, transport) = started();
        responder.stop();

        assert!(!transport.deliver(PROTOCOL, message(1, b"late")));
        responder.on_message(message(1, b"direct"));

        assert!(transport.sent().is_empty());
        assert_eq!(responder.stats().dropped_inactive, 1);
        assert!(matches!(
            responder.shared.reply(&message(1, b"")),
            Err(ReplyError::Inactive(State::Released))
        ));
    }

    #[test]
    fn test_no_reply_before_start() {
        let transport = LoopbackTransport::new();
        let responder = EchoResponder::new(transport.clone(), PROTOCOL);

        responder.on_message(message(1, b"early"));
        assert!(transport.sent().is_empty());
        assert_eq!(responder.stats().dropped_inactive, 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (responder, transport) = started();
        responder.stop();
        responder.stop();
        assert_eq!(responder.state(), State::Released);
        assert_eq!(transport.endpoint_count(), 0);

        let never_started = EchoResponder::new(LoopbackTransport::new(), PROTOCOL);
        never_started.stop();
        assert_eq!(never_started.state(), State::Uninitialized);
    }

    #[test]
    fn test_drop_releases_endpoint() {
        let transport = LoopbackTransport::new();
        {
            let responder = EchoResponder::new(transport.clone(), PROTOCOL);
            responder.start().unwrap();
            assert_eq!(transport.endpoint_count(), 1);
        }
        assert_eq!(transport.endpoint_count(), 0);
    }

    #[test]
    fn test_custom_reply() {
        let transport = LoopbackTransport::new();
        let responder = EchoResponder::with_reply(transport.clone(), 2, "pong");
        responder.start().unwrap();

        transport.deliver(2, message(9, b"ping"));
        assert_eq!(&transport.sent()[0].payload[..], b"pong");
        assert_eq!(responder.protocol_id(), 2);
    }

    #[test]
    fn test_concurrent_delivery() {
        let (responder, transport) = started();

        std::thread::scope(|scope| {
            for sender in 0..4u32 {
                let transport = transport.clone();
                scope.spawn(move || {
                    for _ in 0..25 {
                        transport.deliver(PROTOCOL, message(sender, b"m"));
                    }
                });
            }
        });

        let sent = transport.sent();
        assert_eq!(sent.len(), 100);
        for sender in 0..4u32 {
            assert_eq!(sent.iter().filter(|d| d.dest == PeerId(sender)).count(), 25);
        }
        assert_eq!(responder.stats().replied, 100);
    }
}
