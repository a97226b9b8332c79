//! Netlink message framing.
//!
//! Every message starts with a 16-byte header in host byte order:
//!
//! ```text
//! 0       4       6       8               12              16
//! +-------+-------+-------+---------------+---------------+
//! |  len  | type  | flags |      seq      |    port id    |
//! +-------+-------+-------+---------------+---------------+
//! ```
//!
//! `len` covers header and payload but not the padding that aligns the next
//! message to 4 bytes. A datagram may carry several messages back to back.

use crate::transport::AllocError;
use std::fmt;

/// Size of the netlink message header.
pub const HEADER_LEN: usize = 16;

/// Alignment of messages inside a datagram.
pub const ALIGN_TO: usize = 4;

/// No-op message.
pub const NLMSG_NOOP: u16 = 1;
/// Error or acknowledgement.
pub const NLMSG_ERROR: u16 = 2;
/// End of a multipart message; also used for single replies.
pub const NLMSG_DONE: u16 = 3;

/// Round `len` up to the message alignment.
pub const fn align(len: usize) -> usize {
    (len + ALIGN_TO - 1) & !(ALIGN_TO - 1)
}

/// Header `len` of a message carrying `payload_len` bytes, or `None` when
/// the padded frame does not fit the 32-bit length field.
pub fn frame_len(payload_len: usize) -> Option<u32> {
    let len = HEADER_LEN.checked_add(payload_len)?;
    let padded = len.checked_add(ALIGN_TO - 1)? & !(ALIGN_TO - 1);
    u32::try_from(padded).ok()?;
    u32::try_from(len).ok()
}

/// Decoded netlink message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub port_id: u32,
}

impl Header {
    /// Header for a message carrying `payload_len` bytes.
    ///
    /// The length saturates for payloads `frame_len` rejects; `encode`
    /// refuses such headers.
    pub fn for_payload(kind: u16, flags: u16, seq: u32, port_id: u32, payload_len: usize) -> Self {
        Self {
            len: frame_len(payload_len).unwrap_or(u32::MAX),
            kind,
            flags,
            seq,
            port_id,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.len.to_ne_bytes());
        out.extend_from_slice(&self.kind.to_ne_bytes());
        out.extend_from_slice(&self.flags.to_ne_bytes());
        out.extend_from_slice(&self.seq.to_ne_bytes());
        out.extend_from_slice(&self.port_id.to_ne_bytes());
    }

    fn read(buf: &[u8]) -> Self {
        Self {
            len: u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            kind: u16::from_ne_bytes([buf[4], buf[5]]),
            flags: u16::from_ne_bytes([buf[6], buf[7]]),
            seq: u32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]),
            port_id: u32::from_ne_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

/// Append one framed message (header, payload, padding) to `out`.
///
/// Space is reserved fallibly; on failure `out` is left unchanged.
pub fn encode(header: &Header, payload: &[u8], out: &mut Vec<u8>) -> Result<(), AllocError> {
    let too_large = AllocError {
        requested: payload.len(),
    };
    if frame_len(payload.len()) != Some(header.len) {
        return Err(too_large);
    }

    let framed = align(HEADER_LEN + payload.len());
    out.try_reserve(framed).map_err(|_| too_large)?;

    let start = out.len();
    header.write(out);
    out.extend_from_slice(payload);
    out.resize(start + framed, 0);
    Ok(())
}

/// Malformed datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Fewer bytes remain than a header needs.
    Truncated { offset: usize },
    /// Header length is smaller than a header or runs past the datagram.
    BadLength { offset: usize, len: u32 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { offset } => {
                write!(f, "truncated netlink header at offset {offset}")
            }
            DecodeError::BadLength { offset, len } => {
                write!(f, "invalid netlink message length {len} at offset {offset}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Iterator over the messages of one datagram.
///
/// Stops after the first error.
pub struct Messages<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> Messages<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for Messages<'a> {
    type Item = Result<(Header, &'a [u8]), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.buf.len() {
            return None;
        }

        let offset = self.offset;
        let rest = &self.buf[offset..];
        if rest.len() < HEADER_LEN {
            self.failed = true;
            return Some(Err(DecodeError::Truncated { offset }));
        }

        let header = Header::read(rest);
        let len = header.len as usize;
        if len < HEADER_LEN || len > rest.len() {
            self.failed = true;
            return Some(Err(DecodeError::BadLength {
                offset,
                len: header.len,
            }));
        }

        // The last message of a datagram may omit its padding.
        self.offset = (offset + align(len)).min(self.buf.len());
        Some(Ok((header, &rest[HEADER_LEN..len])))
    }
}
