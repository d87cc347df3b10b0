use std::io::Write;
use std::sync::Arc;
use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};
use crate::config::{EndOfStreamPolicy, TransferConfig};
use crate::engine::{Completion, ProtocolEngine, TransferStats};
use crate::frame::{Frame, SequenceBit};
use crate::packet::{Packet, TransmissionResult};
use crate::transport::Transport;

/// The receiving side of the alternating-bit protocol.
///
/// A data packet is new if its bit differs from the bit of the most recently delivered chunk.
///  New chunks are written to the sink and flushed before they are acknowledged, so an
///  acknowledged chunk is never lost on the receiving side. Anything else is a duplicate of
///  the chunk that was delivered last: it is acknowledged again (the previous ack may have been
///  lost) but never written twice.
///
/// The receiver has no timer: it only ever reacts to incoming packets.
pub struct ReceiverEngine<W: Write, T: Transport> {
    config: Arc<TransferConfig>,
    sink: Option<W>,
    transport: T,
    /// bit of the most recently delivered chunk - the receiver expects the other bit next
    delivered_bit: SequenceBit,
    completion: Option<Completion>,
    stats: TransferStats,
}

impl<W: Write, T: Transport> ReceiverEngine<W, T> {
    pub fn new(config: Arc<TransferConfig>, sink: W, transport: T) -> anyhow::Result<ReceiverEngine<W, T>> {
        config.validate()?;

        Ok(ReceiverEngine {
            config,
            sink: Some(sink),
            transport,
            delivered_bit: SequenceBit::INITIAL,
            completion: None,
            stats: TransferStats::default(),
        })
    }

    /// the bit the receiver acknowledges for duplicates, i.e. the bit of the last delivered chunk
    pub fn delivered_bit(&self) -> SequenceBit {
        self.delivered_bit
    }

    pub fn expected_bit(&self) -> SequenceBit {
        self.delivered_bit.flipped()
    }

    pub fn is_sink_closed(&self) -> bool {
        self.sink.is_none()
    }

    fn on_received(&mut self, packet: Packet) {
        match Frame::try_parse(&packet) {
            Ok(Frame::Data { bit, chunk }) => {
                if bit == self.delivered_bit {
                    debug!("received duplicate with bit {} - re-sending ack", bit);
                    self.stats.duplicates_received += 1;
                    self.send_ack(bit);
                }
                else if chunk.is_empty() {
                    self.on_end_of_stream(bit);
                }
                else {
                    self.deliver(bit, chunk);
                }
            }
            Ok(Frame::Ack { bit }) => {
                debug!("receiver got an ack for bit {} - ignoring", bit);
            }
            Err(e) => {
                warn!("received malformed packet {:?}: {} - ignoring", packet, e);
            }
        }
    }

    fn deliver(&mut self, bit: SequenceBit, chunk: Bytes) {
        let write_result = match self.sink.as_mut() {
            Some(sink) => sink.write_all(&chunk).and_then(|_| sink.flush()),
            None => {
                error!("byte sink is closed while the transfer is in progress - this is a bug");
                return;
            }
        };

        if let Err(e) = write_result {
            self.finish(Completion::Failed(format!("error writing to byte sink: {}", e)));
            return;
        }

        trace!("delivered chunk of {} bytes with bit {}", chunk.len(), bit);
        self.stats.bytes_transferred += chunk.len() as u64;
        self.delivered_bit = bit;
        self.send_ack(bit);
    }

    fn on_end_of_stream(&mut self, bit: SequenceBit) {
        self.delivered_bit = bit;

        // the receiver stops ticking after this, so an acknowledged end of stream gets redundant
        //  acks instead of re-acks on demand
        let num_acks = match self.config.end_of_stream {
            EndOfStreamPolicy::Redundant { .. } => 1,
            EndOfStreamPolicy::Acknowledged { repetitions } => repetitions,
        };
        debug!("received end of stream with bit {} - acknowledging {} time(s)", bit, num_acks);
        for _ in 0..num_acks {
            self.send_ack(bit);
        }

        let flush_result = match self.sink.as_mut() {
            Some(sink) => sink.flush(),
            None => Ok(()),
        };
        match flush_result {
            Ok(()) => self.finish(Completion::Delivered),
            Err(e) => self.finish(Completion::Failed(format!("error flushing byte sink: {}", e))),
        }
    }

    fn send_ack(&mut self, bit: SequenceBit) {
        self.stats.acks_sent += 1;
        match self.transport.transmit(Frame::Ack { bit }.to_packet()) {
            TransmissionResult::Delivered => {}
            TransmissionResult::Rejected => {
                // the sender's retransmission will trigger another ack
                warn!("transport rejected ack for bit {}", bit);
                self.stats.transmit_rejections += 1;
            }
        }
    }

    fn finish(&mut self, completion: Completion) {
        self.sink = None;

        match &completion {
            Completion::Delivered => info!("receiving complete: {:?}", self.stats),
            Completion::Failed(reason) => error!("receiving failed: {}", reason),
        }
        self.completion = Some(completion);
    }
}

impl<W: Write, T: Transport> ProtocolEngine for ReceiverEngine<W, T> {
    fn tick(&mut self) -> bool {
        while self.completion.is_none() {
            match self.transport.receive() {
                Some(packet) => self.on_received(packet),
                None => break,
            }
        }
        self.completion.is_some()
    }

    fn completion(&self) -> Option<&Completion> {
        self.completion.as_ref()
    }

    fn stats(&self) -> &TransferStats {
        &self.stats
    }
}
