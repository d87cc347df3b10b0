use std::net::SocketAddr;
use std::time::Duration;
use clap::Parser;
use clap_derive::Parser;
use rdt::verification::server::run_verification_server;
use tokio::net::TcpListener;
use tracing::Level;

/// Pairs up the two peers of each transfer and tells them whether their files match
#[derive(Parser)]
struct Args {
    address: String,

    /// maximum wait for each message from a peer, including the transfer itself
    #[clap(long, default_value_t = 600)]
    peer_timeout_secs: u64,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let addr: SocketAddr = args.address.parse()?;
    let listener = TcpListener::bind(addr).await?;
    run_verification_server(listener, Duration::from_secs(args.peer_timeout_secs)).await
}
