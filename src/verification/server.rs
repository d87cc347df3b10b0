use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::sync::{oneshot, Mutex};
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};
use crate::engine::Role;
use crate::verification::messages::{ClientMessage, ServerMessage};

/// Accepts peers and verifies the transfer of each pair of peers that introduce themselves with
///  the same group. Every connection is handled in a separate task, and runs until accepting
///  fails.
///
/// `peer_timeout` bounds each wait for a message from a peer, and the wait for a peer's partner.
///  Transfers can take a while, so this should be generous.
pub async fn run_verification_server(listener: TcpListener, peer_timeout: Duration) -> anyhow::Result<()> {
    info!("verification server listening on {:?}", listener.local_addr()?);

    let lobby = Arc::new(Lobby::default());
    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("verification peer connected from {:?}", addr);

        let lobby = lobby.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_peer(&lobby, PeerConnection::new(stream, addr), peer_timeout).await {
                warn!("verification with peer {:?} failed: {}", addr, e);
            }
        });
    }
}

struct PeerConnection {
    addr: SocketAddr,
    role: Option<Role>,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    /// a message that arrived while the peer was waiting for its partner
    held_back: Option<ClientMessage>,
}

impl PeerConnection {
    fn new(stream: TcpStream, addr: SocketAddr) -> PeerConnection {
        let (read_half, writer) = stream.into_split();
        PeerConnection {
            addr,
            role: None,
            lines: BufReader::new(read_half).lines(),
            writer,
            held_back: None,
        }
    }

    async fn receive(&mut self, peer_timeout: Duration) -> anyhow::Result<ClientMessage> {
        if let Some(message) = self.held_back.take() {
            return Ok(message);
        }

        let line = timeout(peer_timeout, self.lines.next_line()).await
            .map_err(|_| anyhow!("timeout waiting for peer {:?}", self.addr))??;
        match line {
            Some(line) => line.parse(),
            None => bail!("peer {:?} closed the connection", self.addr),
        }
    }

    async fn send(&mut self, message: ServerMessage) -> anyhow::Result<()> {
        debug!("sending {:?} to {:?}", message, self.addr);
        self.writer.write_all(format!("{}\n", message).as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// returns the peer's group
    async fn expect_hello(&mut self, peer_timeout: Duration) -> anyhow::Result<u32> {
        match self.receive(peer_timeout).await? {
            ClientMessage::Hello { group, role } => {
                debug!("peer {:?} is the {} of group {}", self.addr, role, group);
                self.role = Some(role);
                Ok(group)
            }
            other => bail!("expected HELLO from {:?}, got {:?}", self.addr, other),
        }
    }

    async fn expect_finished(&mut self, peer_timeout: Duration) -> anyhow::Result<()> {
        match self.receive(peer_timeout).await? {
            ClientMessage::Finished => Ok(()),
            other => bail!("expected FINISHED from {:?}, got {:?}", self.addr, other),
        }
    }

    async fn expect_checksum(&mut self, peer_timeout: Duration) -> anyhow::Result<u32> {
        match self.receive(peer_timeout).await? {
            ClientMessage::Checksum(checksum) => Ok(checksum),
            other => bail!("expected CHECKSUM from {:?}, got {:?}", self.addr, other),
        }
    }

    /// A peer with a short transfer may finish before its partner connects
    fn hold_back(&mut self, message: ClientMessage) -> anyhow::Result<()> {
        if self.held_back.is_some() || message != ClientMessage::Finished {
            bail!("unexpected {:?} from {:?} while waiting for its partner", message, self.addr);
        }
        self.held_back = Some(message);
        Ok(())
    }
}

struct WaitingPeer {
    id: u64,
    partner_send: oneshot::Sender<PeerConnection>,
}

enum Admission {
    /// the connection was handed to the peer that was waiting for it
    HandedOver,
    Waiting {
        id: u64,
        partner_recv: oneshot::Receiver<PeerConnection>,
        peer: PeerConnection,
    },
}

/// Peers that said HELLO and wait for their partner, at most one per group
#[derive(Default)]
struct Lobby {
    waiting: Mutex<FxHashMap<u32, WaitingPeer>>,
    next_id: AtomicU64,
}

impl Lobby {
    async fn join(&self, group: u32, peer: PeerConnection) -> Admission {
        let mut waiting = self.waiting.lock().await;

        // the hand-over happens under the lock, see `leave`
        let peer = match waiting.remove(&group) {
            Some(partner) => match partner.partner_send.send(peer) {
                Ok(()) => return Admission::HandedOver,
                Err(peer) => peer,
            },
            None => peer,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (partner_send, partner_recv) = oneshot::channel();
        waiting.insert(group, WaitingPeer { id, partner_send });
        Admission::Waiting { id, partner_recv, peer }
    }

    /// Withdraws a waiting peer. If a partner was handed over in the meantime, it is returned.
    async fn leave(&self, group: u32, id: u64, partner_recv: &mut oneshot::Receiver<PeerConnection>) -> Option<PeerConnection> {
        let mut waiting = self.waiting.lock().await;
        if waiting.get(&group).map(|w| w.id == id).unwrap_or(false) {
            waiting.remove(&group);
            return None;
        }
        drop(waiting);
        partner_recv.try_recv().ok()
    }
}

/// Waits until a partner is handed over. A peer that closes its connection, misbehaves or has
///  no partner within `peer_timeout` gives up its place.
async fn wait_for_partner(
    peer: &mut PeerConnection,
    partner_recv: &mut oneshot::Receiver<PeerConnection>,
    peer_timeout: Duration,
) -> anyhow::Result<PeerConnection> {
    let deadline = Instant::now() + peer_timeout;
    loop {
        select! {
            biased;
            line = peer.lines.next_line() => {
                match line? {
                    Some(line) => peer.hold_back(line.parse()?)?,
                    None => bail!("peer {:?} closed the connection while waiting for its partner", peer.addr),
                }
            }
            partner = &mut *partner_recv => {
                return partner.map_err(|_| anyhow!("partner of {:?} was lost", peer.addr));
            }
            _ = sleep_until(deadline) => {
                bail!("no partner for peer {:?} within {:?}", peer.addr, peer_timeout);
            }
        }
    }
}

async fn serve_peer(lobby: &Lobby, mut peer: PeerConnection, peer_timeout: Duration) -> anyhow::Result<()> {
    let group = peer.expect_hello(peer_timeout).await?;

    loop {
        let (id, mut partner_recv, mut peer_a) = match lobby.join(group, peer).await {
            Admission::HandedOver => return Ok(()),
            Admission::Waiting { id, partner_recv, peer } => (id, partner_recv, peer),
        };

        match wait_for_partner(&mut peer_a, &mut partner_recv, peer_timeout).await {
            Ok(peer_b) => {
                let addrs = (peer_a.addr, peer_b.addr);
                if verify_pair(peer_a, peer_b, peer_timeout).await? {
                    info!("transfer of group {} between {:?} and {:?} verified successfully", group, addrs.0, addrs.1);
                }
                else {
                    warn!("transfer of group {} between {:?} and {:?} is corrupt", group, addrs.0, addrs.1);
                }
                return Ok(());
            }
            Err(e) => match lobby.leave(group, id, &mut partner_recv).await {
                None => return Err(e),
                Some(partner) => {
                    // the partner arrived just as this peer gave up: it waits for another one
                    warn!("{} - peer {:?} keeps waiting", e, partner.addr);
                    peer = partner;
                }
            },
        }
    }
}

/// Returns whether both peers computed the same checksum. The connections are closed when
///  this returns.
async fn verify_pair(mut a: PeerConnection, mut b: PeerConnection, peer_timeout: Duration) -> anyhow::Result<bool> {
    if a.role == b.role {
        let failure = ServerMessage::Result { success: false };
        let (result_a, result_b) = tokio::join!(a.send(failure), b.send(failure));
        for (addr, result) in [(a.addr, result_a), (b.addr, result_b)] {
            if let Err(e) = result {
                debug!("error sending failure to {:?}: {}", addr, e);
            }
        }
        bail!("{:?} and {:?} have the same role", a.addr, b.addr);
    }

    tokio::try_join!(a.expect_finished(peer_timeout), b.expect_finished(peer_timeout))?;

    let challenge: u32 = rand::random();
    debug!("both peers are finished, challenge is {}", challenge);
    tokio::try_join!(a.send(ServerMessage::Challenge(challenge)), b.send(ServerMessage::Challenge(challenge)))?;

    let (checksum_a, checksum_b) = tokio::try_join!(a.expect_checksum(peer_timeout), b.expect_checksum(peer_timeout))?;
    let success = checksum_a == checksum_b;

    let result = ServerMessage::Result { success };
    tokio::try_join!(a.send(result), b.send(result))?;
    Ok(success)
}
