pub mod udp;

#[cfg(test)] use mockall::automock;
use crate::packet::{Packet, TransmissionResult};

/// The unreliable packet transport underneath the protocol: best effort, packets may be lost,
///  duplicated or reordered, but the bytes of a delivered packet are intact.
///
/// Both operations are non-blocking. Absence of a packet is a regular condition and is
///  represented as `None` rather than by waiting.
#[cfg_attr(test, automock)]
pub trait Transport: Send {
    /// NB: `Delivered` means the packet was accepted, not that it will arrive
    fn transmit(&mut self, packet: Packet) -> TransmissionResult;

    /// returns at most one buffered packet per call
    fn receive(&mut self) -> Option<Packet>;
}
