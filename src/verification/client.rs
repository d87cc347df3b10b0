use std::net::SocketAddr;
use anyhow::anyhow;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use crate::engine::Role;
use crate::verification::messages::{ClientMessage, ServerMessage};
use crate::verification::VerificationService;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct VerificationState {
    challenge: Option<u32>,
    result: Option<bool>,
    closed: bool,
}

/// [VerificationService] talking to a verification server over TCP.
///
/// The connection is handled by a background task. Outgoing messages are passed to it through
///  a channel, and it publishes what the server sent through a `watch` channel, so the
///  trait's non-blocking accessors only ever read the latest state.
pub struct TcpVerificationClient {
    outgoing: mpsc::UnboundedSender<ClientMessage>,
    state: watch::Receiver<VerificationState>,
    connection_task: JoinHandle<()>,
}

impl TcpVerificationClient {
    /// Connects to the server and introduces this peer with its role. Both peers of a transfer
    ///  must use the same `group`, which the server uses to pair them up.
    pub async fn connect(server_addr: SocketAddr, group: u32, role: Role) -> anyhow::Result<TcpVerificationClient> {
        let stream = TcpStream::connect(server_addr).await?;
        info!("connected to verification server at {:?} for group {}", server_addr, group);

        let (read_half, mut write_half) = stream.into_split();
        send_message(&mut write_half, ClientMessage::Hello { group, role }).await?;

        let (outgoing_send, outgoing_recv) = mpsc::unbounded_channel();
        let (state_send, state_recv) = watch::channel(VerificationState::default());

        let connection_task = tokio::spawn(run_connection(
            BufReader::new(read_half).lines(),
            write_half,
            outgoing_recv,
            state_send,
        ));

        Ok(TcpVerificationClient {
            outgoing: outgoing_send,
            state: state_recv,
            connection_task,
        })
    }

    fn send(&self, message: ClientMessage) -> anyhow::Result<()> {
        self.outgoing.send(message)
            .map_err(|_| anyhow!("connection to the verification server is closed"))
    }
}

impl Drop for TcpVerificationClient {
    fn drop(&mut self) {
        self.connection_task.abort();
    }
}

impl VerificationService for TcpVerificationClient {
    fn finish(&mut self) -> anyhow::Result<()> {
        self.send(ClientMessage::Finished)
    }

    fn checksum_challenge(&self) -> Option<u32> {
        self.state.borrow().challenge
    }

    fn upload_checksum(&mut self, checksum: u32) -> anyhow::Result<()> {
        self.send(ClientMessage::Checksum(checksum))
    }

    fn is_closed(&self) -> bool {
        self.state.borrow().closed
    }

    fn was_successful(&self) -> bool {
        self.state.borrow().result == Some(true)
    }
}

async fn send_message(writer: &mut OwnedWriteHalf, message: ClientMessage) -> anyhow::Result<()> {
    debug!("sending {:?} to verification server", message);
    writer.write_all(format!("{}\n", message).as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

async fn run_connection(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut writer: OwnedWriteHalf,
    mut outgoing: mpsc::UnboundedReceiver<ClientMessage>,
    state: watch::Sender<VerificationState>,
) {
    loop {
        select! {
            message = outgoing.recv() => {
                match message {
                    Some(message) => {
                        if let Err(e) = send_message(&mut writer, message).await {
                            warn!("error sending to verification server: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => match line.parse::<ServerMessage>() {
                        Ok(ServerMessage::Challenge(challenge)) => {
                            debug!("received checksum challenge {}", challenge);
                            state.send_modify(|s| s.challenge = Some(challenge));
                        }
                        Ok(ServerMessage::Result { success }) => {
                            info!("verification result: {}", if success { "success" } else { "failure" });
                            state.send_modify(|s| s.result = Some(success));
                        }
                        Err(e) => warn!("unexpected message from verification server: {}", e),
                    },
                    Ok(None) => {
                        debug!("verification server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("error reading from verification server: {}", e);
                        break;
                    }
                }
            }
        }
    }
    state.send_modify(|s| s.closed = true);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use tokio::net::TcpListener;
    use super::*;

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_conversation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            assert_eq!(lines.next_line().await.unwrap().unwrap(), "HELLO 7 receiver");
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "FINISHED");
            write_half.write_all(b"CHALLENGE 77\n").await.unwrap();
            assert_eq!(lines.next_line().await.unwrap().unwrap(), "CHECKSUM 12345");
            write_half.write_all(b"RESULT SUCCESS\n").await.unwrap();
        });

        let mut client = TcpVerificationClient::connect(addr, 7, Role::Receiver).await.unwrap();
        assert_eq!(client.checksum_challenge(), None);
        assert!(!client.is_closed());

        client.finish().unwrap();
        wait_until(|| client.checksum_challenge().is_some()).await;
        assert_eq!(client.checksum_challenge(), Some(77));

        client.upload_checksum(12345).unwrap();
        wait_until(|| client.is_closed()).await;
        assert!(client.was_successful());

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_without_result_is_not_successful() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let client = TcpVerificationClient::connect(addr, 7, Role::Sender).await.unwrap();
        server.await.unwrap();

        wait_until(|| client.is_closed()).await;
        assert!(!client.was_successful());
    }
}
