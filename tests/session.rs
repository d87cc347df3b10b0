use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use rdt::config::TransferConfig;
use rdt::driver::run_session;
use rdt::engine::Role;
use rdt::transport::udp::UdpTransport;
use rdt::verification::client::TcpVerificationClient;
use rdt::verification::server::run_verification_server;

fn free_udp_addr() -> SocketAddr {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap()
}

fn temp_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("rdt-session-{}-{}", std::process::id(), name))
}

async fn start_verification_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run_verification_server(listener, Duration::from_secs(30)));
    addr
}

#[tokio::test]
async fn test_file_transfer_over_udp_is_verified() {
    let content = (0..50_000u32).map(|i| (i % 241) as u8).collect::<Vec<_>>();
    let source_path = temp_path("source");
    let target_path = temp_path("target");
    std::fs::write(&source_path, &content).unwrap();

    let server_addr = start_verification_server().await;
    let sender_addr = free_udp_addr();
    let receiver_addr = free_udp_addr();

    let config = Arc::new(TransferConfig {
        retransmit_timeout: Duration::from_millis(200),
        ..TransferConfig::default()
    });

    let sender_transport = UdpTransport::bind(sender_addr, receiver_addr).await.unwrap();
    let receiver_transport = UdpTransport::bind(receiver_addr, sender_addr).await.unwrap();

    let mut sender_verification = TcpVerificationClient::connect(server_addr, 31415927, Role::Sender).await.unwrap();
    let mut receiver_verification = TcpVerificationClient::connect(server_addr, 31415927, Role::Receiver).await.unwrap();

    let (sender_report, receiver_report) = tokio::join!(
        run_session(Role::Sender, &source_path, sender_transport, &mut sender_verification, config.clone()),
        run_session(Role::Receiver, &target_path, receiver_transport, &mut receiver_verification, config.clone()),
    );
    let sender_report = sender_report.unwrap();
    let receiver_report = receiver_report.unwrap();

    assert!(sender_report.verified);
    assert!(receiver_report.verified);
    assert_eq!(sender_report.stats.bytes_transferred, 50_000);
    assert_eq!(receiver_report.stats.bytes_transferred, 50_000);
    assert_eq!(std::fs::read(&target_path).unwrap(), content);

    std::fs::remove_file(&source_path).unwrap();
    std::fs::remove_file(&target_path).unwrap();
}

#[tokio::test]
async fn test_missing_source_file_fails_before_transfer() {
    let server_addr = start_verification_server().await;
    let transport = UdpTransport::bind(free_udp_addr(), free_udp_addr()).await.unwrap();
    let mut verification = TcpVerificationClient::connect(server_addr, 1, Role::Sender).await.unwrap();

    let result = run_session(
        Role::Sender,
        &temp_path("does-not-exist"),
        transport,
        &mut verification,
        Arc::new(TransferConfig::default()),
    ).await;
    assert!(result.is_err());
}
