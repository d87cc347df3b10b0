use std::io::{ErrorKind, Read};
use std::sync::Arc;
use bytes::Bytes;
use tracing::{debug, error, info, trace, warn};
use crate::config::{EndOfStreamPolicy, TransferConfig};
use crate::engine::{Completion, ProtocolEngine, TransferStats};
use crate::frame::{Frame, SequenceBit};
use crate::packet::{Packet, TransmissionResult};
use crate::timer::{TimeoutReason, Timer};
use crate::transport::Transport;

/// The packet that was sent last and is not acknowledged yet. There is never more than one.
#[derive(Debug)]
struct PendingPacket {
    bit: SequenceBit,
    packet: Packet,
    retransmissions: u32,
    is_end_of_stream: bool,
}

#[derive(Debug)]
enum SenderState {
    ReadingNextChunk,
    AwaitingAck(PendingPacket),
    Done,
}

/// The sending side of the alternating-bit protocol.
///
/// The sender reads a chunk from its source, sends it with the flipped sequence bit and then
///  waits for an acknowledgement carrying the same bit, re-sending the chunk each time the
///  retransmission timer expires. Only then is the next chunk read, so there is at most one
///  unacknowledged packet at any time.
///
/// The source is dropped (and thereby closed) exactly once, when it is exhausted or when the
///  transfer fails.
pub struct SenderEngine<R: Read, T: Transport, M: Timer> {
    config: Arc<TransferConfig>,
    source: Option<R>,
    transport: T,
    timer: M,
    current_bit: SequenceBit,
    state: SenderState,
    completion: Option<Completion>,
    stats: TransferStats,
    total_len: Option<u64>,
    last_reported_percent: u64,
    read_buf: Vec<u8>,
}

impl<R: Read, T: Transport, M: Timer> SenderEngine<R, T, M> {
    pub fn new(config: Arc<TransferConfig>, source: R, transport: T, timer: M) -> anyhow::Result<SenderEngine<R, T, M>> {
        config.validate()?;

        let read_buf = vec![0u8; config.max_payload_size];
        Ok(SenderEngine {
            config,
            source: Some(source),
            transport,
            timer,
            current_bit: SequenceBit::INITIAL,
            state: SenderState::ReadingNextChunk,
            completion: None,
            stats: TransferStats::default(),
            total_len: None,
            last_reported_percent: 0,
            read_buf,
        })
    }

    /// Makes the sender log its progress in percent of the given length
    pub fn with_total_len(mut self, total_len: u64) -> Self {
        self.total_len = Some(total_len);
        self
    }

    /// the bit of the most recent packet, or the initial bit if nothing was sent yet
    pub fn current_bit(&self) -> SequenceBit {
        self.current_bit
    }

    pub fn pending_packet(&self) -> Option<&Packet> {
        match &self.state {
            SenderState::AwaitingAck(pending) => Some(&pending.packet),
            _ => None,
        }
    }

    pub fn is_awaiting_ack(&self) -> bool {
        matches!(self.state, SenderState::AwaitingAck(_))
    }

    pub fn is_source_closed(&self) -> bool {
        self.source.is_none()
    }

    fn on_received(&mut self, packet: Packet) {
        let frame = match Frame::try_parse(&packet) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("received malformed packet {:?}: {} - ignoring", packet, e);
                return;
            }
        };

        let ack_bit = match frame {
            Frame::Ack { bit } => bit,
            Frame::Data { .. } => {
                debug!("sender received a data packet - ignoring");
                return;
            }
        };

        let acknowledged_end_of_stream = match &self.state {
            SenderState::AwaitingAck(pending) if pending.bit == ack_bit => pending.is_end_of_stream,
            _ => {
                debug!("received stale or duplicate ack for bit {} - ignoring", ack_bit);
                return;
            }
        };

        trace!("received ack for bit {}", ack_bit);
        self.timer.disarm();
        if acknowledged_end_of_stream {
            info!("end of stream was acknowledged");
            self.finish(Completion::Delivered);
        }
        else {
            self.state = SenderState::ReadingNextChunk;
        }
    }

    fn on_timeout(&mut self, reason: TimeoutReason) {
        match reason {
            TimeoutReason::AckWait => self.on_ack_timeout(),
        }
    }

    fn on_ack_timeout(&mut self) {
        let max_retransmissions = self.config.max_retransmissions;
        let packet = match &mut self.state {
            SenderState::AwaitingAck(pending) => {
                if max_retransmissions.map(|max| pending.retransmissions >= max).unwrap_or(false) {
                    None
                }
                else {
                    pending.retransmissions += 1;
                    debug!("no ack for bit {} - retransmitting (#{})", pending.bit, pending.retransmissions);
                    Some(pending.packet.clone())
                }
            }
            _ => {
                trace!("ack timeout without a pending packet - ignoring");
                return;
            }
        };

        match packet {
            Some(packet) => {
                self.stats.retransmissions += 1;
                self.transmit(packet);
                self.timer.arm(self.config.retransmit_timeout, TimeoutReason::AckWait);
            }
            None => {
                self.finish(Completion::Failed(format!(
                    "packet with bit {} was not acknowledged after {} retransmissions",
                    self.current_bit,
                    max_retransmissions.unwrap_or_default(),
                )));
            }
        }
    }

    fn read_next_chunk(&mut self) {
        let max_payload_size = self.config.max_payload_size;
        let read_result = match self.source.as_mut() {
            Some(source) => source.read(&mut self.read_buf[..max_payload_size]),
            None => {
                error!("byte source is closed while there is data to read - this is a bug");
                return;
            }
        };

        match read_result {
            Ok(0) => self.on_source_exhausted(),
            Ok(n) => {
                self.current_bit.flip();
                let chunk = Bytes::copy_from_slice(&self.read_buf[..n]);
                let packet = Frame::Data { bit: self.current_bit, chunk }.to_packet();

                self.stats.bytes_transferred += n as u64;
                trace!("sending chunk of {} bytes with bit {}", n, self.current_bit);
                self.send_pending(packet, false);
                self.report_progress();
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                debug!("reading from byte source was interrupted - retrying in the next tick");
            }
            Err(e) => {
                self.finish(Completion::Failed(format!("error reading from byte source: {}", e)));
            }
        }
    }

    fn on_source_exhausted(&mut self) {
        self.current_bit.flip();
        let packet = Frame::end_of_stream(self.current_bit).to_packet();

        match self.config.end_of_stream {
            EndOfStreamPolicy::Redundant { repetitions } => {
                debug!("sending end of stream with bit {} ({} times)", self.current_bit, repetitions);
                for _ in 0..repetitions {
                    self.stats.data_packets_sent += 1;
                    self.transmit(packet.clone());
                }
                info!("end of stream was sent");
                self.finish(Completion::Delivered);
            }
            EndOfStreamPolicy::Acknowledged { .. } => {
                debug!("sending end of stream with bit {}, awaiting ack", self.current_bit);
                self.source = None;
                self.send_pending(packet, true);
            }
        }
    }

    fn send_pending(&mut self, packet: Packet, is_end_of_stream: bool) {
        self.stats.data_packets_sent += 1;
        self.transmit(packet.clone());

        self.state = SenderState::AwaitingAck(PendingPacket {
            bit: self.current_bit,
            packet,
            retransmissions: 0,
            is_end_of_stream,
        });
        self.timer.arm(self.config.retransmit_timeout, TimeoutReason::AckWait);
    }

    /// A rejected packet is not retried right away: it counts as lost, and the retransmission
    ///  timer takes care of it
    fn transmit(&mut self, packet: Packet) {
        match self.transport.transmit(packet) {
            TransmissionResult::Delivered => {}
            TransmissionResult::Rejected => {
                warn!("transport rejected packet with bit {} - leaving it to the retransmission timer", self.current_bit);
                self.stats.transmit_rejections += 1;
            }
        }
    }

    fn report_progress(&mut self) {
        let Some(total_len) = self.total_len else {
            return;
        };
        if let Some(percent) = progress_to_report(self.stats.bytes_transferred, total_len, self.last_reported_percent) {
            info!("sent {}% ({} of {} bytes)", percent, self.stats.bytes_transferred, total_len);
            self.last_reported_percent = percent;
        }
    }

    fn finish(&mut self, completion: Completion) {
        self.timer.disarm();
        self.source = None;
        self.state = SenderState::Done;

        match &completion {
            Completion::Delivered => info!("sending complete: {:?}", self.stats),
            Completion::Failed(reason) => error!("sending failed: {}", reason),
        }
        self.completion = Some(completion);
    }
}

/// Progress is reported whenever it reaches the next multiple of 10%. A total length of 0 has no
///  meaningful percentage, so nothing is reported then.
fn progress_to_report(bytes_transferred: u64, total_len: u64, last_reported_percent: u64) -> Option<u64> {
    if total_len == 0 {
        return None;
    }
    let percent = bytes_transferred * 100 / total_len;
    (percent / 10 > last_reported_percent / 10).then_some(percent)
}

impl<R: Read, T: Transport, M: Timer> ProtocolEngine for SenderEngine<R, T, M> {
    fn tick(&mut self) -> bool {
        if self.completion.is_some() {
            return true;
        }

        while let Some(packet) = self.transport.receive() {
            self.on_received(packet);
            if self.completion.is_some() {
                return true;
            }
        }

        while let Some(reason) = self.timer.poll_expired() {
            self.on_timeout(reason);
            if self.completion.is_some() {
                return true;
            }
        }

        if matches!(self.state, SenderState::ReadingNextChunk) {
            self.read_next_chunk();
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

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io::Cursor;
    use std::sync::Mutex;
    use std::time::Duration;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use rstest::rstest;
    use crate::packet::MAX_PAYLOAD_SIZE;
    use crate::transport::MockTransport;
    use crate::test_util::timer::ManualTimer;
    use super::*;

    type Inbox = Arc<Mutex<VecDeque<Packet>>>;

    /// a mock transport that receives whatever the test puts into the inbox
    fn mock_transport(inbox: &Inbox) -> MockTransport {
        let inbox = inbox.clone();
        let mut transport = MockTransport::new();
        transport.expect_receive()
            .returning(move || inbox.lock().unwrap().pop_front());
        transport
    }

    fn data(bit: SequenceBit, chunk: &'static [u8]) -> Packet {
        Frame::Data { bit, chunk: Bytes::from_static(chunk) }.to_packet()
    }

    fn ack(bit: SequenceBit) -> Packet {
        Frame::Ack { bit }.to_packet()
    }

    fn config(modify: impl FnOnce(&mut TransferConfig)) -> Arc<TransferConfig> {
        let mut config = TransferConfig::default();
        modify(&mut config);
        Arc::new(config)
    }

    struct FailingSource {
        kind: ErrorKind,
        remaining_failures: usize,
    }
    impl Read for FailingSource {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.remaining_failures > 0 {
                self.remaining_failures -= 1;
                return Err(std::io::Error::new(self.kind, "simulated"));
            }
            buf[0] = 7;
            Ok(1)
        }
    }

    #[test]
    fn test_first_chunk_uses_flipped_bit() {
        let inbox = Inbox::default();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .with(eq(data(SequenceBit::ONE, b"abc")))
            .once()
            .return_const(TransmissionResult::Delivered);

        let timer = ManualTimer::new();
        let mut sender = SenderEngine::new(config(|_| {}), Cursor::new(b"abc".to_vec()), transport, timer.clone()).unwrap();
        assert_eq!(sender.current_bit(), SequenceBit::INITIAL);

        assert!(!sender.tick());
        assert_eq!(sender.current_bit(), SequenceBit::ONE);
        assert!(sender.is_awaiting_ack());
        assert_eq!(sender.pending_packet(), Some(&data(SequenceBit::ONE, b"abc")));
        assert!(timer.is_armed());
        assert_eq!(timer.remaining(), Some(Duration::from_millis(1000)));

        // no ack yet: nothing new is sent
        assert!(!sender.tick());
        assert!(!sender.tick());
    }

    #[test]
    fn test_chunks_respect_max_payload_size() {
        let inbox = Inbox::default();
        let mut seq = Sequence::new();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .with(eq(data(SequenceBit::ONE, b"ab")))
            .once()
            .in_sequence(&mut seq)
            .return_const(TransmissionResult::Delivered);
        transport.expect_transmit()
            .with(eq(data(SequenceBit::ZERO, b"c")))
            .once()
            .in_sequence(&mut seq)
            .return_const(TransmissionResult::Delivered);

        let mut sender = SenderEngine::new(config(|c| c.max_payload_size = 2), Cursor::new(b"abc".to_vec()), transport, ManualTimer::new()).unwrap();

        sender.tick();
        inbox.lock().unwrap().push_back(ack(SequenceBit::ONE));
        sender.tick();

        assert_eq!(sender.current_bit(), SequenceBit::ZERO);
        assert_eq!(sender.stats().bytes_transferred, 3);
        assert_eq!(sender.stats().data_packets_sent, 2);
    }

    #[test]
    fn test_retransmits_on_timeout() {
        let inbox = Inbox::default();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .with(eq(data(SequenceBit::ONE, b"x")))
            .times(3)
            .return_const(TransmissionResult::Delivered);

        let timer = ManualTimer::new();
        let mut sender = SenderEngine::new(config(|_| {}), Cursor::new(b"x".to_vec()), transport, timer.clone()).unwrap();

        sender.tick();
        timer.advance(Duration::from_millis(999));
        sender.tick();
        assert_eq!(sender.stats().retransmissions, 0);

        timer.advance(Duration::from_millis(1));
        sender.tick();
        timer.advance(Duration::from_millis(1000));
        sender.tick();

        assert_eq!(sender.stats().retransmissions, 2);
        assert_eq!(sender.stats().data_packets_sent, 1);
        assert!(timer.is_armed());
        assert_eq!(timer.num_armed(), 3);
    }

    #[rstest]
    #[case::stale_bit(SequenceBit::ZERO, true)]
    #[case::matching_bit(SequenceBit::ONE, false)]
    fn test_ack_bit_must_match(#[case] ack_bit: SequenceBit, #[case] expected_awaiting_first: bool) {
        let inbox = Inbox::default();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .with(eq(data(SequenceBit::ONE, b"a")))
            .once()
            .return_const(TransmissionResult::Delivered);
        transport.expect_transmit()
            .with(eq(data(SequenceBit::ZERO, b"b")))
            .times(if expected_awaiting_first { 0 } else { 1 })
            .return_const(TransmissionResult::Delivered);

        let mut sender = SenderEngine::new(config(|c| c.max_payload_size = 1), Cursor::new(b"ab".to_vec()), transport, ManualTimer::new()).unwrap();
        sender.tick();

        inbox.lock().unwrap().push_back(ack(ack_bit));
        sender.tick();

        let expected_bit = if expected_awaiting_first { SequenceBit::ONE } else { SequenceBit::ZERO };
        assert_eq!(sender.current_bit(), expected_bit);
        assert!(sender.is_awaiting_ack());
    }

    #[test]
    fn test_duplicate_ack_is_ignored() {
        let inbox = Inbox::default();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .with(eq(data(SequenceBit::ONE, b"a")))
            .once()
            .return_const(TransmissionResult::Delivered);
        transport.expect_transmit()
            .with(eq(data(SequenceBit::ZERO, b"b")))
            .once()
            .return_const(TransmissionResult::Delivered);

        let timer = ManualTimer::new();
        let mut sender = SenderEngine::new(config(|c| c.max_payload_size = 1), Cursor::new(b"ab".to_vec()), transport, timer.clone()).unwrap();
        sender.tick();

        inbox.lock().unwrap().extend([ack(SequenceBit::ONE), ack(SequenceBit::ONE)]);
        sender.tick();
        inbox.lock().unwrap().push_back(ack(SequenceBit::ONE));
        sender.tick();

        assert_eq!(sender.pending_packet(), Some(&data(SequenceBit::ZERO, b"b")));
        assert!(timer.is_armed());
    }

    #[test]
    fn test_ignores_data_and_malformed_packets() {
        let inbox = Inbox::default();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .once()
            .return_const(TransmissionResult::Delivered);

        let mut sender = SenderEngine::new(config(|_| {}), Cursor::new(b"x".to_vec()), transport, ManualTimer::new()).unwrap();
        sender.tick();

        inbox.lock().unwrap().extend([
            data(SequenceBit::ONE, b"unexpected"),
            Packet::new(vec![0xf0u8]),
            Packet::new(Vec::new()),
        ]);
        assert!(!sender.tick());
        assert!(sender.is_awaiting_ack());
        assert!(sender.completion().is_none());
    }

    #[test]
    fn test_empty_source_sends_redundant_end_of_stream() {
        let inbox = Inbox::default();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .with(eq(Frame::end_of_stream(SequenceBit::ONE).to_packet()))
            .times(5)
            .return_const(TransmissionResult::Delivered);

        let timer = ManualTimer::new();
        let mut sender = SenderEngine::new(config(|_| {}), Cursor::new(Vec::new()), transport, timer.clone()).unwrap();

        assert!(sender.tick());
        assert_eq!(sender.completion(), Some(&Completion::Delivered));
        assert!(sender.is_source_closed());
        assert!(!timer.is_armed());

        // further ticks have no effect, even with packets arriving
        inbox.lock().unwrap().push_back(ack(SequenceBit::ONE));
        assert!(sender.tick());
        assert!(sender.tick());
        assert_eq!(inbox.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_acknowledged_end_of_stream_is_retransmitted() {
        let inbox = Inbox::default();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .with(eq(Frame::end_of_stream(SequenceBit::ONE).to_packet()))
            .times(2)
            .return_const(TransmissionResult::Delivered);

        let timer = ManualTimer::new();
        let mut sender = SenderEngine::new(
            config(|c| c.end_of_stream = EndOfStreamPolicy::Acknowledged { repetitions: 3 }),
            Cursor::new(Vec::new()),
            transport,
            timer.clone(),
        ).unwrap();

        assert!(!sender.tick());
        assert!(sender.is_source_closed());
        assert!(sender.is_awaiting_ack());

        timer.advance(Duration::from_millis(1000));
        assert!(!sender.tick());

        inbox.lock().unwrap().push_back(ack(SequenceBit::ONE));
        assert!(sender.tick());
        assert_eq!(sender.completion(), Some(&Completion::Delivered));
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_fails_after_max_retransmissions() {
        let inbox = Inbox::default();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .times(3)
            .return_const(TransmissionResult::Delivered);

        let timer = ManualTimer::new();
        let mut sender = SenderEngine::new(config(|c| c.max_retransmissions = Some(2)), Cursor::new(b"x".to_vec()), transport, timer.clone()).unwrap();

        sender.tick();
        for _ in 0..2 {
            timer.advance(Duration::from_millis(1000));
            assert!(!sender.tick());
        }
        timer.advance(Duration::from_millis(1000));
        assert!(sender.tick());

        assert!(matches!(sender.completion(), Some(Completion::Failed(_))));
        assert!(sender.is_source_closed());
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_rejected_transmission_is_left_to_the_timer() {
        let inbox = Inbox::default();
        let mut seq = Sequence::new();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .once()
            .in_sequence(&mut seq)
            .return_const(TransmissionResult::Rejected);
        transport.expect_transmit()
            .once()
            .in_sequence(&mut seq)
            .return_const(TransmissionResult::Delivered);

        let timer = ManualTimer::new();
        let mut sender = SenderEngine::new(config(|_| {}), Cursor::new(b"x".to_vec()), transport, timer.clone()).unwrap();

        sender.tick();
        sender.tick();
        assert_eq!(sender.stats().transmit_rejections, 1);
        assert!(sender.is_awaiting_ack());

        timer.advance(Duration::from_millis(1000));
        sender.tick();
        assert_eq!(sender.stats().retransmissions, 1);
    }

    #[rstest]
    #[case::interrupted(ErrorKind::Interrupted, true)]
    #[case::other(ErrorKind::Other, false)]
    fn test_read_error(#[case] kind: ErrorKind, #[case] expected_retry: bool) {
        let inbox = Inbox::default();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .times(if expected_retry { 1 } else { 0 })
            .return_const(TransmissionResult::Delivered);

        let source = FailingSource { kind, remaining_failures: 1 };
        let mut sender = SenderEngine::new(config(|_| {}), source, transport, ManualTimer::new()).unwrap();

        assert_eq!(sender.tick(), !expected_retry);
        if expected_retry {
            assert!(!sender.tick());
            assert!(sender.is_awaiting_ack());
        }
        else {
            assert!(matches!(sender.completion(), Some(Completion::Failed(_))));
            assert!(sender.is_source_closed());
        }
    }

    #[rstest]
    #[case::below_first_step(99, 1000, 0, None)]
    #[case::first_step(100, 1000, 0, Some(10))]
    #[case::within_step(150, 1000, 10, None)]
    #[case::next_step(200, 1000, 10, Some(20))]
    #[case::skipping_steps(550, 1000, 20, Some(55))]
    #[case::same_step_after_skip(590, 1000, 55, None)]
    #[case::complete(1000, 1000, 90, Some(100))]
    #[case::already_complete(1000, 1000, 100, None)]
    #[case::zero_total_len(5, 0, 0, None)]
    fn test_progress_to_report(#[case] bytes_transferred: u64, #[case] total_len: u64, #[case] last_reported_percent: u64, #[case] expected: Option<u64>) {
        assert_eq!(progress_to_report(bytes_transferred, total_len, last_reported_percent), expected);
    }

    #[rstest]
    #[case::steps_of_25_percent(120, 30, vec![25, 50, 75, 100])]
    #[case::steps_of_5_percent(100, 5, vec![0, 10, 10, 20])]
    #[case::zero_total_len(0, 30, vec![0, 0, 0, 0])]
    fn test_reports_progress_while_sending(#[case] total_len: u64, #[case] chunk_len: usize, #[case] expected_reported: Vec<u64>) {
        let inbox = Inbox::default();
        let mut transport = mock_transport(&inbox);
        transport.expect_transmit()
            .return_const(TransmissionResult::Delivered);

        // the source may be longer than announced, which must not break progress reporting
        let mut sender = SenderEngine::new(config(|c| c.max_payload_size = chunk_len), Cursor::new(vec![1u8; 1000]), transport, ManualTimer::new())
            .unwrap()
            .with_total_len(total_len);

        let mut reported = Vec::new();
        for _ in 0..expected_reported.len() {
            sender.tick();
            reported.push(sender.last_reported_percent);
            inbox.lock().unwrap().push_back(ack(sender.current_bit()));
        }
        assert_eq!(reported, expected_reported);
    }

    #[rstest]
    #[case::oversized_payload(|c: &mut TransferConfig| c.max_payload_size = MAX_PAYLOAD_SIZE + 1)]
    #[case::zero_payload(|c: &mut TransferConfig| c.max_payload_size = 0)]
    #[case::zero_timeout(|c: &mut TransferConfig| c.retransmit_timeout = Duration::ZERO)]
    fn test_new_rejects_invalid_config(#[case] modify: fn(&mut TransferConfig)) {
        let transport = MockTransport::new();
        let result = SenderEngine::new(config(modify), Cursor::new(vec![1u8; 5000]), transport, ManualTimer::new());
        assert!(result.is_err());
    }
}
