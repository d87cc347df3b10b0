use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};
use crate::packet::{Packet, TransmissionResult};
use crate::transport::Transport;

/// [Transport] on top of a UDP socket that is connected to a single peer, so datagrams from
///  other senders are filtered by the OS.
///
/// NB: The socket is registered with the tokio runtime, so this must be created and used
///      inside a runtime (the driver loop). The runtime does the actual I/O polling between
///      ticks, while `transmit` and `receive` only ever attempt non-blocking operations.
pub struct UdpTransport {
    socket: UdpSocket,
    peer_addr: SocketAddr,
    receive_buf: Vec<u8>,
}
impl UdpTransport {
    pub async fn bind(self_addr: SocketAddr, peer_addr: SocketAddr) -> anyhow::Result<UdpTransport> {
        let socket = UdpSocket::bind(self_addr).await?;
        socket.connect(peer_addr).await?;
        info!("bound UDP transport to {:?}, peer is {:?}", socket.local_addr()?, peer_addr);

        Ok(UdpTransport {
            socket,
            peer_addr,
            // one extra byte to detect oversized datagrams
            receive_buf: vec![0u8; Packet::MAX_LEN + 1],
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl Transport for UdpTransport {
    fn transmit(&mut self, packet: Packet) -> TransmissionResult {
        match self.socket.try_send(packet.as_ref()) {
            Ok(_) => {
                trace!("UDP transport: sent {:?} to {:?}", packet, self.peer_addr);
                TransmissionResult::Delivered
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("UDP socket not ready for sending - rejecting {:?}", packet);
                TransmissionResult::Rejected
            }
            Err(e) => {
                warn!("error sending UDP packet to {:?}: {}", self.peer_addr, e);
                TransmissionResult::Rejected
            }
        }
    }

    fn receive(&mut self) -> Option<Packet> {
        loop {
            match self.socket.try_recv(&mut self.receive_buf) {
                Ok(len) => {
                    match Packet::try_from_received(&self.receive_buf[..len]) {
                        Some(packet) => {
                            trace!("UDP transport: received {:?}", packet);
                            return Some(packet);
                        }
                        None => {
                            warn!("received datagram exceeding the maximum packet size of {} bytes - skipping", Packet::MAX_LEN);
                        }
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return None,
                Err(e) => {
                    // e.g. 'connection refused' from an ICMP message while the peer is not up yet
                    debug!("error receiving from UDP socket: {}", e);
                    return None;
                }
            }
        }
    }
}
