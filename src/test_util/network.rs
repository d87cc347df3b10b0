use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::trace;
use crate::frame::Frame;
use crate::packet::{Packet, TransmissionResult};
use crate::transport::Transport;

/// The two ends of a [SimulatedNetwork]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    A,
    B,
}
impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }

    fn idx(self) -> usize {
        match self {
            Side::A => 0,
            Side::B => 1,
        }
    }
}

/// Probabilities for random faults, applied to every transmitted packet independently
#[derive(Debug, Clone, Default)]
pub struct FaultModel {
    pub loss_rate: f64,
    pub duplicate_rate: f64,
    /// a reordered packet is inserted at a random position among the packets in flight
    pub reorder_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFault {
    Drop,
    Duplicate,
    Reject,
}

struct ScriptedRule {
    from: Side,
    fault: ScriptedFault,
    matches: Box<dyn Fn(&Frame) -> bool + Send>,
}

/// A deterministic in-memory network between two [SimulatedTransport] endpoints.
///
/// Random faults are drawn from a seeded RNG so that a failing test can be reproduced. On top
///  of that, tests can script one-off faults for the next packet matching a predicate, and
///  every transmitted packet is recorded for assertions.
#[derive(Clone)]
pub struct SimulatedNetwork {
    inner: Arc<Mutex<NetworkInner>>,
}

struct NetworkInner {
    rng: StdRng,
    faults: FaultModel,
    scripted: Vec<ScriptedRule>,
    /// packets in flight towards the side with the same index
    in_flight: [VecDeque<Packet>; 2],
    /// everything each side transmitted, including packets that were dropped afterwards
    transmitted: [Vec<Packet>; 2],
}

impl SimulatedNetwork {
    /// a network without random faults
    pub fn new(seed: u64) -> SimulatedNetwork {
        SimulatedNetwork::with_faults(FaultModel::default(), seed)
    }

    pub fn with_faults(faults: FaultModel, seed: u64) -> SimulatedNetwork {
        SimulatedNetwork {
            inner: Arc::new(Mutex::new(NetworkInner {
                rng: StdRng::seed_from_u64(seed),
                faults,
                scripted: Vec::new(),
                in_flight: Default::default(),
                transmitted: Default::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<NetworkInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn endpoint(&self, side: Side) -> SimulatedTransport {
        SimulatedTransport {
            network: self.clone(),
            side,
        }
    }

    /// Applies `fault` to the next packet sent from `from` whose frame satisfies `matches`
    pub fn script(&self, from: Side, fault: ScriptedFault, matches: impl Fn(&Frame) -> bool + Send + 'static) {
        self.lock().scripted.push(ScriptedRule {
            from,
            fault,
            matches: Box::new(matches),
        });
    }

    pub fn set_faults(&self, faults: FaultModel) {
        self.lock().faults = faults;
    }

    /// Puts a packet directly into the queue towards `to`, bypassing faults and the record
    pub fn inject(&self, to: Side, packet: Packet) {
        self.lock().in_flight[to.idx()].push_back(packet);
    }

    pub fn transmitted(&self, from: Side) -> Vec<Packet> {
        self.lock().transmitted[from.idx()].clone()
    }

    pub fn transmitted_frames(&self, from: Side) -> Vec<Frame> {
        self.transmitted(from).iter()
            .filter_map(|p| Frame::try_parse(p).ok())
            .collect()
    }

    pub fn num_in_flight(&self, to: Side) -> usize {
        self.lock().in_flight[to.idx()].len()
    }

    fn transmit(&self, from: Side, packet: Packet) -> TransmissionResult {
        let mut inner = self.lock();
        let inner = &mut *inner;

        let scripted_fault = Frame::try_parse(&packet).ok()
            .and_then(|frame| {
                let idx = inner.scripted.iter()
                    .position(|rule| rule.from == from && (rule.matches)(&frame))?;
                Some(inner.scripted.remove(idx).fault)
            });

        if scripted_fault == Some(ScriptedFault::Reject) {
            trace!("simulated network: rejecting {:?} from {:?}", packet, from);
            return TransmissionResult::Rejected;
        }
        inner.transmitted[from.idx()].push(packet.clone());

        if scripted_fault == Some(ScriptedFault::Drop) || inner.rng.gen_bool(inner.faults.loss_rate) {
            trace!("simulated network: dropping {:?} from {:?}", packet, from);
            return TransmissionResult::Delivered;
        }

        let num_copies = if scripted_fault == Some(ScriptedFault::Duplicate) || inner.rng.gen_bool(inner.faults.duplicate_rate) {
            2
        }
        else {
            1
        };

        let queue = &mut inner.in_flight[from.peer().idx()];
        for _ in 0..num_copies {
            if !queue.is_empty() && inner.rng.gen_bool(inner.faults.reorder_rate) {
                let pos = inner.rng.gen_range(0..queue.len());
                trace!("simulated network: reordering {:?} to position {}", packet, pos);
                queue.insert(pos, packet.clone());
            }
            else {
                queue.push_back(packet.clone());
            }
        }
        TransmissionResult::Delivered
    }

    fn receive(&self, side: Side) -> Option<Packet> {
        self.lock().in_flight[side.idx()].pop_front()
    }
}

/// One end of a [SimulatedNetwork]
pub struct SimulatedTransport {
    network: SimulatedNetwork,
    side: Side,
}
impl SimulatedTransport {
    pub fn side(&self) -> Side {
        self.side
    }
}

impl Transport for SimulatedTransport {
    fn transmit(&mut self, packet: Packet) -> TransmissionResult {
        self.network.transmit(self.side, packet)
    }

    fn receive(&mut self) -> Option<Packet> {
        self.network.receive(self.side)
    }
}
