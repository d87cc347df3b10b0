//! Reliable byte stream transfer over an unreliable datagram transport, using the
//!  alternating-bit (stop-and-wait) protocol.
//!
//! The sender reads its byte source in chunks and sends each chunk in a data packet, tagged
//!  with a one-bit sequence number. It does not send the next chunk before the receiver has
//!  acknowledged the current one, re-sending it after a timeout. Since there is never more
//!  than one packet in flight, a single bit is enough to tell a new packet from a duplicate.
//!
//! Packet format (all packets start with a one-byte tag):
//!
//! ```ascii
//! 0: tag
//!    * bit 0: sequence bit
//!    * bits 1-2: kind - 00 = DATA, 01 = ACK
//!    * bits 3-7: reserved, must be 0
//! 1: DATA: payload chunk (up to 1024 bytes), empty for the end-of-stream marker
//!    ACK: nothing
//! ```
//!
//! The protocol engines ([sender::SenderEngine], [receiver::ReceiverEngine]) are synchronous
//!  state machines that never block: they are ticked by an async driver ([driver]), which is
//!  the only part that waits. After the transfer, both sides can prove to a third party that
//!  they have the same content ([verification]).

pub mod config;
pub mod driver;
pub mod engine;
pub mod frame;
pub mod packet;
pub mod receiver;
pub mod sender;
pub mod test_util;
pub mod timer;
pub mod transport;
pub mod verification;
