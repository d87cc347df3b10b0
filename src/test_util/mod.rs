//! This module contains utilities for testing the protocol engines without sockets or wall
//!  clock time: a timer that is advanced by hand, a lossy in-memory network and a byte sink
//!  that can be inspected while the receiver owns it.
//!
//! They are used by the crate's own unit tests and by the integration tests in `tests/`, which
//!  can only see the crate's regular (non-#[cfg(test)]) code. That is why they are part of it.

pub mod network;
pub mod sink;
pub mod timer;
