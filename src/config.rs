use std::time::Duration;
use anyhow::bail;
use crate::packet::MAX_PAYLOAD_SIZE;

/// How the sender gets the end-of-stream marker across.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfStreamPolicy {
    /// The marker is sent a fixed number of times in a row without waiting for an
    ///  acknowledgement, and the sender is done right away.
    ///
    /// NB: If all copies get lost, the receiver never terminates. This is the behavior peers
    ///      without acknowledged end-of-stream expect.
    Redundant { repetitions: u32 },
    /// The marker is treated like a data packet: it is retransmitted on timeout until the
    ///  receiver acknowledges it. Since the receiver stops ticking once it has the marker, it
    ///  sends its acknowledgement `repetitions` times.
    ///
    /// NB: Both peers must be configured with the same policy.
    Acknowledged { repetitions: u32 },
}
impl EndOfStreamPolicy {
    pub fn repetitions(&self) -> u32 {
        match *self {
            EndOfStreamPolicy::Redundant { repetitions } => repetitions,
            EndOfStreamPolicy::Acknowledged { repetitions } => repetitions,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Number of file bytes per data packet. Smaller values are allowed (e.g. for tests), but
    ///  never more than [MAX_PAYLOAD_SIZE].
    pub max_payload_size: usize,

    /// Time the sender waits for an acknowledgement before it re-sends the pending packet
    pub retransmit_timeout: Duration,
    /// Upper bound for re-sending the same packet. The transfer fails once this is exceeded;
    ///  `None` retries forever.
    pub max_retransmissions: Option<u32>,

    pub end_of_stream: EndOfStreamPolicy,

    /// Cadence of the driver's tick loop
    pub tick_interval: Duration,
    /// Maximum wait for each step of the checksum handshake after the transfer
    pub handshake_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            max_payload_size: MAX_PAYLOAD_SIZE,
            retransmit_timeout: Duration::from_millis(1000),
            max_retransmissions: Some(100),
            end_of_stream: EndOfStreamPolicy::Redundant { repetitions: 5 },
            tick_interval: Duration::from_millis(1),
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_payload_size == 0 {
            bail!("max payload size must be positive");
        }
        if self.max_payload_size > MAX_PAYLOAD_SIZE {
            bail!("max payload size {} exceeds the packet capacity of {} bytes", self.max_payload_size, MAX_PAYLOAD_SIZE);
        }
        if self.retransmit_timeout.is_zero() {
            bail!("retransmit timeout must be positive");
        }
        if self.tick_interval.is_zero() {
            bail!("tick interval must be positive");
        }
        if self.end_of_stream.repetitions() == 0 {
            bail!("end-of-stream repetitions must be at least 1");
        }
        Ok(())
    }
}
