//! Out-of-band verification of a completed transfer.
//!
//! After the transfer, both peers connect to a verification server over TCP. The server pairs
//!  them by the group they name in their HELLO and sends the same random challenge to both.
//!  Each peer computes a CRC-32 over the challenge and its copy of the file, and the server
//!  compares the two checksums:
//!
//! ```ascii
//! peer                          server
//!  | --- HELLO <group> <role> -->  |   on connect
//!  | --- FINISHED -------------->  |   transfer is complete
//!  | <-- CHALLENGE <u32> --------  |   once both peers are finished
//!  | --- CHECKSUM <u32> -------->  |
//!  | <-- RESULT <SUCCESS|FAILURE>  |   then the server closes the connection
//! ```
//!
//! Every message is a single line of ASCII text.

pub mod client;
pub mod messages;
pub mod server;

use std::io::{ErrorKind, Read};
use crc::{Crc, CRC_32_ISO_HDLC};
#[cfg(test)] use mockall::automock;

const CHECKSUM_ALGORITHM: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// The peer's view of the verification service. All operations are non-blocking: the driver
///  polls for the challenge and for the result.
#[cfg_attr(test, automock)]
pub trait VerificationService: Send {
    /// signals that the transfer is complete on this side
    fn finish(&mut self) -> anyhow::Result<()>;

    /// `None` until the server sent its challenge
    fn checksum_challenge(&self) -> Option<u32>;

    fn upload_checksum(&mut self, checksum: u32) -> anyhow::Result<()>;

    /// `true` once the server closed the connection, i.e. no result will follow
    fn is_closed(&self) -> bool;

    /// only meaningful after the connection is closed
    fn was_successful(&self) -> bool;
}

/// CRC-32 (ISO-HDLC, the one used by zip and ethernet) over the challenge's four little-endian
///  bytes followed by the content.
pub fn challenge_checksum(challenge: u32, mut content: impl Read) -> anyhow::Result<u32> {
    let mut digest = CHECKSUM_ALGORITHM.digest();
    digest.update(&challenge.to_le_bytes());

    let mut buf = vec![0u8; 8192];
    loop {
        match content.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => digest.update(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(digest.finalize())
}
