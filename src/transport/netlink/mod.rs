//! Netlink transport (Linux only).
//!
//! Each endpoint owns one raw netlink socket and one receive thread.
//! The thread runs a mio poll loop: when the socket is readable it drains
//! every pending datagram and hands each one to the endpoint's handler as a
//! single inbound message. Releasing the endpoint raises a stop flag and
//! fires a waker that ends the loop, then joins the thread before the socket
//! is closed.
//!
//! Datagrams are read whole: the pending size is peeked first and the
//! receive buffer grows to fit it. Like a kernel `input` callback, the
//! handler sees the first message of the datagram; its header's port id is
//! the sender and its body is the payload. The message type is not looked
//! at.
//!
//! Replies are framed with a single `NLMSG_DONE` header when allocated and
//! sent unicast to the destination port id. The socket is non-blocking, so a
//! full receive queue on the peer side surfaces as a send error rather than
//! a stall.

pub mod codec;
mod socket;

use crate::transport::{
    AllocError, InboundMessage, MessageHandler, OutboundMessage, PeerId, Transport,
    TransportError,
};
use bytes::Bytes;
use codec::{Header, Messages, NLMSG_DONE};
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::Socket;
use std::io::{self, Read};
use std::mem::MaybeUninit;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const SOCKET_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Upper bound on how long the receive loop goes without checking the stop
/// flag.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Default initial size of the datagram receive buffer.
pub const DEFAULT_RECV_BUFFER_SIZE: usize = 8192;

/// Transport backed by Linux netlink sockets.
///
/// Outbound messages obtained from `allocate` carry the complete netlink
/// frame; `send` only accepts such messages.
#[derive(Debug, Clone)]
pub struct NetlinkTransport {
    /// Port id to bind endpoints to (0 = kernel assigned).
    port_id: u32,
    recv_buffer_size: usize,
    max_message_size: usize,
}

impl Default for NetlinkTransport {
    fn default() -> Self {
        Self::new(0, DEFAULT_RECV_BUFFER_SIZE, crate::transport::DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl NetlinkTransport {
    pub fn new(port_id: u32, recv_buffer_size: usize, max_message_size: usize) -> Self {
        Self {
            port_id,
            recv_buffer_size,
            max_message_size,
        }
    }
}

/// Endpoint handle: the socket plus its receive thread.
pub struct NetlinkEndpoint {
    socket: Arc<Socket>,
    waker: Waker,
    stop: Arc<AtomicBool>,
    receiver: Option<JoinHandle<()>>,
    protocol_id: u32,
    port_id: u32,
}

impl NetlinkEndpoint {
    /// Port id peers address this endpoint with.
    pub fn port_id(&self) -> u32 {
        self.port_id
    }

    pub fn protocol_id(&self) -> u32 {
        self.protocol_id
    }

    fn shutdown(&mut self) {
        let Some(receiver) = self.receiver.take() else {
            return;
        };

        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            // The loop still sees the flag on its next poll timeout.
            warn!(protocol_id = self.protocol_id, error = %e, "Failed to wake receive loop");
        }
        if receiver.join().is_err() {
            error!(protocol_id = self.protocol_id, "Receive loop panicked");
        }
    }
}

impl Drop for NetlinkEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for NetlinkTransport {
    type Endpoint = NetlinkEndpoint;

    fn create_endpoint(
        &self,
        protocol_id: u32,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<NetlinkEndpoint, TransportError> {
        let socket = Arc::new(socket::open(protocol_id, self.port_id)?);
        let port_id = socket::local_port_id(&socket)?;

        let poll = Poll::new()?;
        let fd = socket.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), SOCKET_TOKEN, Interest::READABLE)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let stop = Arc::new(AtomicBool::new(false));

        let rx_socket = Arc::clone(&socket);
        let rx_stop = Arc::clone(&stop);
        let buffer_size = self.recv_buffer_size;
        let receiver = thread::Builder::new()
            .name(format!("netlink-rx-{protocol_id}"))
            .spawn(move || {
                if let Err(e) =
                    receive_loop(poll, &rx_socket, buffer_size, handler.as_ref(), &rx_stop)
                {
                    error!(protocol_id, error = %e, "Receive loop failed");
                }
            })?;

        info!(protocol_id, port_id, "Netlink endpoint created");

        Ok(NetlinkEndpoint {
            socket,
            waker,
            stop,
            receiver: Some(receiver),
            protocol_id,
            port_id,
        })
    }

    fn allocate(&self, dest: PeerId, payload: &[u8]) -> Result<OutboundMessage, AllocError> {
        if payload.len() > self.max_message_size {
            return Err(AllocError {
                requested: payload.len(),
            });
        }

        let header = Header::for_payload(NLMSG_DONE, 0, 0, 0, payload.len());
        let mut frame = Vec::new();
        codec::encode(&header, payload, &mut frame)?;
        Ok(OutboundMessage::from_frame(dest, Bytes::from(frame)))
    }

    fn send(&self, endpoint: &NetlinkEndpoint, msg: OutboundMessage) -> Result<(), TransportError> {
        if endpoint.receiver.is_none() {
            return Err(TransportError::Closed);
        }

        let (dest, frame) = msg.into_parts();
        match Messages::new(&frame).next() {
            Some(Ok((header, _))) if codec::align(header.len as usize) == frame.len() => {}
            _ => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "outbound message was not allocated by the netlink transport",
                )))
            }
        }

        let n = endpoint
            .socket
            .send_to(&frame, &socket::netlink_addr(dest.0, 0))?;
        if n < frame.len() {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short netlink send: {n} of {} bytes", frame.len()),
            )));
        }

        trace!(dest = %dest, len = frame.len(), "Sent netlink message");
        Ok(())
    }

    fn release_endpoint(&self, mut endpoint: NetlinkEndpoint) {
        endpoint.shutdown();
        info!(
            protocol_id = endpoint.protocol_id,
            port_id = endpoint.port_id,
            "Netlink endpoint released"
        );
    }
}

fn receive_loop(
    mut poll: Poll,
    socket: &Socket,
    buffer_size: usize,
    handler: &dyn MessageHandler,
    stop: &AtomicBool,
) -> io::Result<()> {
    let mut events = Events::with_capacity(8);
    let mut buf = vec![0u8; buffer_size];

    loop {
        if stop.load(Ordering::Acquire) {
            debug!("Receive loop stopping");
            return Ok(());
        }

        if let Err(e) = poll.poll(&mut events, Some(POLL_INTERVAL)) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(e);
        }

        for event in events.iter() {
            if event.token() == SOCKET_TOKEN {
                drain_socket(socket, &mut buf, handler)?;
            }
        }
    }
}

/// Dispatch datagrams until the socket would block.
fn drain_socket(socket: &Socket, buf: &mut Vec<u8>, handler: &dyn MessageHandler) -> io::Result<()> {
    while let Some(n) = recv_datagram(socket, buf)? {
        dispatch_datagram(&buf[..n], handler);
    }
    Ok(())
}

/// Receive the next datagram whole, growing `buf` to its size.
///
/// Returns `None` once the socket would block.
fn recv_datagram(socket: &Socket, buf: &mut Vec<u8>) -> io::Result<Option<usize>> {
    loop {
        let result = pending_len(socket).and_then(|len| {
            if len > buf.len() {
                buf.resize(len, 0);
            }
            (&*socket).read(buf)
        });

        match result {
            Ok(n) => return Ok(Some(n)),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            // The kernel dropped datagrams because the queue overflowed.
            Err(e) if e.raw_os_error() == Some(libc::ENOBUFS) => {
                warn!(error = %e, "Netlink receive queue overrun");
            }
            Err(e) => return Err(e),
        }
    }
}

/// Full length of the next queued datagram, without consuming it.
fn pending_len(socket: &Socket) -> io::Result<usize> {
    let mut peek = [MaybeUninit::<u8>::uninit(); codec::HEADER_LEN];
    socket.recv_with_flags(&mut peek, libc::MSG_PEEK | libc::MSG_TRUNC)
}

/// Hand the first message of a datagram to `handler`.
fn dispatch_datagram(datagram: &[u8], handler: &dyn MessageHandler) {
    match Messages::new(datagram).next() {
        Some(Ok((header, payload))) => {
            debug!(
                sender = header.port_id,
                kind = header.kind,
                len = payload.len(),
                "Netlink message received"
            );
            handler.on_message(InboundMessage {
                sender: PeerId(header.port_id),
                payload: Bytes::copy_from_slice(payload),
            });
        }
        Some(Err(e)) => {
            warn!(error = %e, len = datagram.len(), "Dropping malformed datagram");
        }
        None => {
            debug!("Empty datagram ignored");
        }
    }
}
