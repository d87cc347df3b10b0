use std::fmt::{Display, Formatter};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use anyhow::{anyhow, bail, Context};
use tracing::info;
use crate::config::TransferConfig;
use crate::receiver::ReceiverEngine;
use crate::sender::SenderEngine;
use crate::timer::Timer;
use crate::transport::Transport;

/// The interface between a protocol state machine and the loop driving it.
pub trait ProtocolEngine {
    /// Does whatever work is possible right now without blocking, returning `true` once the
    ///  transfer is complete (successfully or not). After that, every call returns `true`
    ///  without side effects.
    fn tick(&mut self) -> bool;

    /// `None` while the transfer is in progress
    fn completion(&self) -> Option<&Completion>;

    fn stats(&self) -> &TransferStats;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Delivered,
    Failed(String),
}
impl Completion {
    pub fn is_success(&self) -> bool {
        matches!(self, Completion::Delivered)
    }

    pub fn to_result(&self) -> anyhow::Result<()> {
        match self {
            Completion::Delivered => Ok(()),
            Completion::Failed(reason) => Err(anyhow!("transfer failed: {}", reason)),
        }
    }
}

/// Counters for diagnostics, they have no influence on protocol behavior
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStats {
    /// payload bytes read from the source (sender) or written to the sink (receiver)
    pub bytes_transferred: u64,
    pub data_packets_sent: u64,
    pub retransmissions: u64,
    pub acks_sent: u64,
    pub duplicates_received: u64,
    pub transmit_rejections: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}
impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sender" | "send" => Ok(Role::Sender),
            "receiver" | "receive" => Ok(Role::Receiver),
            _ => bail!("unknown role {:?} - expected 'sender' or 'receiver'", s),
        }
    }
}
impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Sender => write!(f, "sender"),
            Role::Receiver => write!(f, "receiver"),
        }
    }
}

/// The local end of the byte stream: a source for the sender, a sink for the receiver
pub enum ByteEndpoint {
    Source(Box<dyn Read + Send>),
    Sink(Box<dyn Write + Send>),
}
impl ByteEndpoint {
    /// opens the file for reading (sender) or creates / truncates it for writing (receiver)
    pub fn open_file(role: Role, path: &Path) -> anyhow::Result<ByteEndpoint> {
        match role {
            Role::Sender => {
                let file = File::open(path)
                    .with_context(|| format!("could not open {:?} for sending", path))?;
                Ok(ByteEndpoint::Source(Box::new(file)))
            }
            Role::Receiver => {
                let file = File::create(path)
                    .with_context(|| format!("could not create {:?} for receiving", path))?;
                Ok(ByteEndpoint::Sink(Box::new(file)))
            }
        }
    }

    fn role(&self) -> Role {
        match self {
            ByteEndpoint::Source(_) => Role::Sender,
            ByteEndpoint::Sink(_) => Role::Receiver,
        }
    }
}

/// A transfer session for either role, bound to its byte source or sink.
pub enum TransferSession<T: Transport, M: Timer> {
    Sender(SenderEngine<Box<dyn Read + Send>, T, M>),
    Receiver(ReceiverEngine<Box<dyn Write + Send>, T>),
}
impl<T: Transport, M: Timer> TransferSession<T, M> {
    /// NB: Only the sender retransmits, so the timer is dropped for the receiver role
    pub fn initialize(
        role: Role,
        endpoint: ByteEndpoint,
        transport: T,
        timer: M,
        config: Arc<TransferConfig>,
    ) -> anyhow::Result<TransferSession<T, M>> {
        info!("initializing transfer session as {}", role);
        match (role, endpoint) {
            (Role::Sender, ByteEndpoint::Source(source)) => {
                Ok(TransferSession::Sender(SenderEngine::new(config, source, transport, timer)?))
            }
            (Role::Receiver, ByteEndpoint::Sink(sink)) => {
                Ok(TransferSession::Receiver(ReceiverEngine::new(config, sink, transport)?))
            }
            (role, endpoint) => {
                bail!("role {} requires a byte {}", role, if endpoint.role() == Role::Sender { "sink" } else { "source" })
            }
        }
    }

    /// Only the sender reports progress in percent, so this is ignored for the receiver
    pub fn with_total_len(self, total_len: u64) -> Self {
        match self {
            TransferSession::Sender(sender) => TransferSession::Sender(sender.with_total_len(total_len)),
            receiver => receiver,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            TransferSession::Sender(_) => Role::Sender,
            TransferSession::Receiver(_) => Role::Receiver,
        }
    }
}

impl<T: Transport, M: Timer> ProtocolEngine for TransferSession<T, M> {
    fn tick(&mut self) -> bool {
        match self {
            TransferSession::Sender(sender) => sender.tick(),
            TransferSession::Receiver(receiver) => receiver.tick(),
        }
    }

    fn completion(&self) -> Option<&Completion> {
        match self {
            TransferSession::Sender(sender) => sender.completion(),
            TransferSession::Receiver(receiver) => receiver.completion(),
        }
    }

    fn stats(&self) -> &TransferStats {
        match self {
            TransferSession::Sender(sender) => sender.stats(),
            TransferSession::Receiver(receiver) => receiver.stats(),
        }
    }
}
