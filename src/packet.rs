use std::fmt::{Debug, Formatter};
use bytes::Bytes;

/// The maximum number of file bytes carried by a single data packet
pub const MAX_PAYLOAD_SIZE: usize = 1024;

/// The unit of transmission: an immutable, capped-size byte buffer that the transport moves
///  as a whole. The transport may drop, duplicate or reorder packets, but it never splits or
///  merges them.
///
/// The buffer holds the complete wire representation, i.e. a one-byte tag followed by the
///  chunk (see [crate::frame::Frame]).
#[derive(Clone, PartialEq, Eq)]
pub struct Packet {
    buf: Bytes,
}
impl Packet {
    pub const MAX_LEN: usize = 1 + MAX_PAYLOAD_SIZE;

    /// NB: Exceeding [Packet::MAX_LEN] is a bug in the calling code, so this panics rather than
    ///  returning an error
    pub fn new(buf: impl Into<Bytes>) -> Packet {
        let buf = buf.into();
        assert!(buf.len() <= Self::MAX_LEN, "this is a bug: packet of {} bytes exceeds the maximum of {} bytes", buf.len(), Self::MAX_LEN);
        Packet { buf }
    }

    /// For datagrams received from the network, where an oversized buffer is an external
    ///  condition rather than a bug
    pub fn try_from_received(buf: &[u8]) -> Option<Packet> {
        if buf.len() > Self::MAX_LEN {
            return None;
        }
        Some(Packet { buf: Bytes::copy_from_slice(buf) })
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.buf
    }
}
impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.buf
    }
}
impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.buf.first() {
            Some(tag) => write!(f, "Packet{{tag:{:#04x}, len:{}}}", tag, self.buf.len()),
            None => write!(f, "Packet{{empty}}"),
        }
    }
}

/// Result of handing a packet to the transport. `Delivered` only means that the transport
///  accepted the packet - it may still be lost on the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionResult {
    Delivered,
    Rejected,
}
