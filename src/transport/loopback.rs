//! In-memory host transport.
//!
//! Endpoints live in a slab keyed by endpoint id. Inbound messages are
//! injected with `deliver` and handed to the bound handler on the caller's
//! thread; outbound messages are recorded instead of leaving the process.
//! Failures can be injected to exercise the error paths of handlers.

use super::{
    AllocError, InboundMessage, MessageHandler, OutboundMessage, PeerId, Transport,
    TransportError, DEFAULT_MAX_MESSAGE_SIZE,
};
use bytes::Bytes;
use slab::Slab;
use std::collections::HashSet;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// A message accepted by `send`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    /// Slab key of the sending endpoint.
    pub endpoint: usize,
    pub protocol_id: u32,
    pub dest: PeerId,
    pub payload: Bytes,
}

/// Endpoint handle issued by `LoopbackTransport`.
#[derive(Debug)]
pub struct LoopbackEndpoint {
    key: usize,
    generation: u64,
    protocol_id: u32,
}

impl LoopbackEndpoint {
    pub fn id(&self) -> usize {
        self.key
    }

    pub fn protocol_id(&self) -> u32 {
        self.protocol_id
    }
}

struct Binding {
    protocol_id: u32,
    generation: u64,
    handler: Arc<dyn MessageHandler>,
}

#[derive(Default)]
struct Faults {
    /// Fail the next endpoint creation with this error kind.
    create: Option<io::ErrorKind>,
    /// Number of upcoming sends that fail.
    sends: usize,
    /// Peers every send to which fails.
    unreachable: HashSet<PeerId>,
    /// Number of upcoming allocations that fail.
    allocations: usize,
}

#[derive(Default)]
struct Inner {
    endpoints: Slab<Binding>,
    next_generation: u64,
    sent: Vec<Delivered>,
    faults: Faults,
}

/// Shared handle on an in-memory transport. Clones observe the same state.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<Mutex<Inner>>,
    max_message_size: usize,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a transport that refuses outbound payloads above `limit` bytes.
    pub fn with_max_message_size(limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            max_message_size: limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand `msg` to the handler bound to `protocol_id`.
    ///
    /// Returns `false` when no endpoint is bound to the protocol.
    pub fn deliver(&self, protocol_id: u32, msg: InboundMessage) -> bool {
        let handler = {
            let inner = self.lock();
            inner
                .endpoints
                .iter()
                .find(|(_, binding)| binding.protocol_id == protocol_id)
                .map(|(_, binding)| Arc::clone(&binding.handler))
        };

        match handler {
            Some(handler) => {
                trace!(protocol_id, sender = %msg.sender, len = msg.payload.len(), "Delivering");
                handler.on_message(msg);
                true
            }
            None => {
                debug!(protocol_id, "No endpoint bound, message dropped");
                false
            }
        }
    }

    /// Messages sent so far.
    pub fn sent(&self) -> Vec<Delivered> {
        self.lock().sent.clone()
    }

    /// Drain the messages sent so far.
    pub fn take_sent(&self) -> Vec<Delivered> {
        std::mem::take(&mut self.lock().sent)
    }

    /// Number of endpoints currently bound.
    pub fn endpoint_count(&self) -> usize {
        self.lock().endpoints.len()
    }

    /// Make the next `create_endpoint` fail with `kind`.
    pub fn fail_endpoint_creation(&self, kind: io::ErrorKind) {
        self.lock().faults.create = Some(kind);
    }

    /// Make the next `count` sends fail.
    pub fn fail_next_sends(&self, count: usize) {
        self.lock().faults.sends = count;
    }

    /// Make every send to `peer` fail.
    pub fn fail_sends_to(&self, peer: PeerId) {
        self.lock().faults.unreachable.insert(peer);
    }

    /// Make the next `count` allocations fail.
    pub fn fail_next_allocations(&self, count: usize) {
        self.lock().faults.allocations = count;
    }
}

impl Transport for LoopbackTransport {
    type Endpoint = LoopbackEndpoint;

    fn create_endpoint(
        &self,
        protocol_id: u32,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<LoopbackEndpoint, TransportError> {
        let mut inner = self.lock();

        if let Some(kind) = inner.faults.create.take() {
            return Err(TransportError::Io(io::Error::new(
                kind,
                "injected endpoint creation failure",
            )));
        }

        if inner
            .endpoints
            .iter()
            .any(|(_, binding)| binding.protocol_id == protocol_id)
        {
            return Err(TransportError::AddressInUse(protocol_id));
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        let key = inner.endpoints.insert(Binding {
            protocol_id,
            generation,
            handler,
        });

        debug!(endpoint = key, protocol_id, "Loopback endpoint created");

        Ok(LoopbackEndpoint {
            key,
            generation,
            protocol_id,
        })
    }

    fn allocate(&self, dest: PeerId, payload: &[u8]) -> Result<OutboundMessage, AllocError> {
        {
            let mut inner = self.lock();
            if inner.faults.allocations > 0 {
                inner.faults.allocations -= 1;
                return Err(AllocError {
                    requested: payload.len(),
                });
            }
        }
        OutboundMessage::allocate(dest, payload, self.max_message_size)
    }

    fn send(&self, endpoint: &LoopbackEndpoint, msg: OutboundMessage) -> Result<(), TransportError> {
        let mut inner = self.lock();

        match inner.endpoints.get(endpoint.key) {
            Some(binding) if binding.generation == endpoint.generation => {}
            _ => return Err(TransportError::Closed),
        }

        if inner.faults.sends > 0 {
            inner.faults.sends -= 1;
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::WouldBlock,
                "injected send failure",
            )));
        }

        let (dest, payload) = msg.into_parts();
        if inner.faults.unreachable.contains(&dest) {
            return Err(TransportError::Unreachable(dest));
        }

        inner.sent.push(Delivered {
            endpoint: endpoint.key,
            protocol_id: endpoint.protocol_id,
            dest,
            payload,
        });
        Ok(())
    }

    fn release_endpoint(&self, endpoint: LoopbackEndpoint) {
        let mut inner = self.lock();
        let owned = matches!(
            inner.endpoints.get(endpoint.key),
            Some(binding) if binding.generation == endpoint.generation
        );
        if owned {
            inner.endpoints.remove(endpoint.key);
            debug!(endpoint = endpoint.key, "Loopback endpoint released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter(AtomicUsize);

    impl MessageHandler for Counter {
        fn on_message(&self, _msg: InboundMessage) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_deliver_routes_by_protocol() {
        let transport = LoopbackTransport::new();
        let counter = Arc::new(Counter::default());
        let _endpoint = transport.create_endpoint(31, counter.clone()).unwrap();

        assert!(transport.deliver(31, InboundMessage::new(PeerId(1), "hi")));
        assert!(!transport.deliver(17, InboundMessage::new(PeerId(1), "hi")));
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_protocol_already_bound() {
        let transport = LoopbackTransport::new();
        let _first = transport
            .create_endpoint(31, Arc::new(Counter::default()))
            .unwrap();

        let second = transport.create_endpoint(31, Arc::new(Counter::default()));
        assert!(matches!(second, Err(TransportError::AddressInUse(31))));
        assert_eq!(transport.endpoint_count(), 1);
    }

    #[test]
    fn test_send_records_message() {
        let transport = LoopbackTransport::new();
        let endpoint = transport
            .create_endpoint(31, Arc::new(Counter::default()))
            .unwrap();

        let msg = transport.allocate(PeerId(9), b"pong").unwrap();
        transport.send(&endpoint, msg).unwrap();

        let sent = transport.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].dest, PeerId(9));
        assert_eq!(sent[0].protocol_id, 31);
        assert_eq!(&sent[0].payload[..], b"pong");
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_stale_endpoint_is_closed() {
        let transport = LoopbackTransport::new();
        let old = transport
            .create_endpoint(31, Arc::new(Counter::default()))
            .unwrap();
        let stale = LoopbackEndpoint {
            key: old.key,
            generation: old.generation,
            protocol_id: old.protocol_id,
        };
        transport.release_endpoint(old);

        // The slab slot is reused by the new endpoint.
        let fresh = transport
            .create_endpoint(31, Arc::new(Counter::default()))
            .unwrap();
        assert_eq!(fresh.id(), stale.id());

        let msg = transport.allocate(PeerId(1), b"x").unwrap();
        assert!(matches!(
            transport.send(&stale, msg),
            Err(TransportError::Closed)
        ));

        transport.release_endpoint(stale);
        assert_eq!(transport.endpoint_count(), 1);
    }

    #[test]
    fn test_injected_faults() {
        let transport = LoopbackTransport::with_max_message_size(8);
        transport.fail_endpoint_creation(io::ErrorKind::OutOfMemory);
        assert!(matches!(
            transport.create_endpoint(31, Arc::new(Counter::default())),
            Err(TransportError::Io(_))
        ));

        let endpoint = transport
            .create_endpoint(31, Arc::new(Counter::default()))
            .unwrap();

        transport.fail_next_allocations(1);
        assert!(transport.allocate(PeerId(1), b"a").is_err());
        assert!(transport.allocate(PeerId(1), b"a").is_ok());
        assert!(transport.allocate(PeerId(1), &[0u8; 9]).is_err());

        transport.fail_next_sends(1);
        let msg = transport.allocate(PeerId(1), b"a").unwrap();
        assert!(transport.send(&endpoint, msg).is_err());

        transport.fail_sends_to(PeerId(2));
        let msg = transport.allocate(PeerId(2), b"a").unwrap();
        assert!(matches!(
            transport.send(&endpoint, msg),
            Err(TransportError::Unreachable(PeerId(2)))
        ));

        let msg = transport.allocate(PeerId(1), b"a").unwrap();
        assert!(transport.send(&endpoint, msg).is_ok());
        assert_eq!(transport.sent().len(), 1);
    }
}
