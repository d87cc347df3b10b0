use std::fmt::{Display, Formatter};
use anyhow::{anyhow, bail};
use bytes::{BufMut, Bytes, BytesMut};
use num_enum::TryFromPrimitive;
use crate::packet::{Packet, MAX_PAYLOAD_SIZE};

/// The alternating bit: toggled exactly once per acknowledged data packet. Sender and receiver
///  each track their own copy, and this type is the canonical protocol state - the wire tag
///  is derived from it (see [Frame::tag]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SequenceBit(bool);
impl SequenceBit {
    pub const ZERO: SequenceBit = SequenceBit(false);
    pub const ONE: SequenceBit = SequenceBit(true);

    /// both sides start with this value, so the first data packet carries [SequenceBit::ONE]
    pub const INITIAL: SequenceBit = Self::ZERO;

    #[must_use]
    pub fn flipped(self) -> SequenceBit {
        SequenceBit(!self.0)
    }

    pub fn flip(&mut self) {
        *self = self.flipped();
    }

    fn wire_value(self) -> u8 {
        if self.0 { 1 } else { 0 }
    }
}
impl Display for SequenceBit {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.wire_value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum FrameKind {
    Data = 0,
    Ack = 1,
}

/// The protocol-level interpretation of a [Packet]:
///
/// ```ascii
/// 0: tag (u8)
///    * bit 0: sequence bit
///    * bit 1-2: kind - 00 DATA, 01 ACK
///    * bit 3-7: unused, must be 0
/// 1: chunk (DATA only): 0 to 1024 bytes, an empty chunk being the end-of-stream marker
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data { bit: SequenceBit, chunk: Bytes },
    Ack { bit: SequenceBit },
}
impl Frame {
    const BIT_MASK: u8 = 0b0000_0001;
    const KIND_MASK: u8 = 0b0000_0110;
    const KIND_SHIFT: u32 = 1;
    const RESERVED_MASK: u8 = 0b1111_1000;

    pub fn end_of_stream(bit: SequenceBit) -> Frame {
        Frame::Data { bit, chunk: Bytes::new() }
    }

    pub fn bit(&self) -> SequenceBit {
        match self {
            Frame::Data { bit, .. } => *bit,
            Frame::Ack { bit } => *bit,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Data { .. } => FrameKind::Data,
            Frame::Ack { .. } => FrameKind::Ack,
        }
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Frame::Data { chunk, .. } if chunk.is_empty())
    }

    pub fn tag(&self) -> u8 {
        ((self.kind() as u8) << Self::KIND_SHIFT) | self.bit().wire_value()
    }

    pub fn to_packet(&self) -> Packet {
        match self {
            Frame::Data { chunk, .. } => {
                assert!(chunk.len() <= MAX_PAYLOAD_SIZE, "this is a bug: chunk of {} bytes exceeds the maximum payload size", chunk.len());
                let mut buf = BytesMut::with_capacity(1 + chunk.len());
                buf.put_u8(self.tag());
                buf.put_slice(chunk);
                Packet::new(buf.freeze())
            }
            Frame::Ack { .. } => Packet::new(vec![self.tag()]),
        }
    }

    pub fn try_parse(packet: &Packet) -> anyhow::Result<Frame> {
        let tag = match packet.as_ref().first() {
            Some(&tag) => tag,
            None => bail!("empty packet without a tag byte"),
        };

        if tag & Self::RESERVED_MASK != 0 {
            bail!("tag {:#04x} has reserved bits set", tag);
        }

        let bit = SequenceBit(tag & Self::BIT_MASK != 0);
        let kind = FrameKind::try_from((tag & Self::KIND_MASK) >> Self::KIND_SHIFT)
            .map_err(|e| anyhow!("invalid frame kind in tag {:#04x}: {}", tag, e))?;

        match kind {
            FrameKind::Data => Ok(Frame::Data {
                bit,
                chunk: packet.as_bytes().slice(1..),
            }),
            FrameKind::Ack => {
                if packet.len() != 1 {
                    bail!("ACK packet with {} trailing bytes", packet.len() - 1);
                }
                Ok(Frame::Ack { bit })
            }
        }
    }
}
