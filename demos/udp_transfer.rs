use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use clap::Parser;
use clap_derive::Parser;
use rdt::config::{EndOfStreamPolicy, TransferConfig};
use rdt::driver::{run_session, run_transfer};
use rdt::engine::{ByteEndpoint, Role, TransferSession};
use rdt::timer::TokioTimer;
use rdt::transport::udp::UdpTransport;
use rdt::verification::client::TcpVerificationClient;
use tracing::{info, Level};

/// Sends or receives a file over UDP, optionally proving the result to a verification server
#[derive(Parser)]
struct Args {
    /// 'sender' or 'receiver'
    role: String,
    /// the file to send, or the file to write the received data to
    file: PathBuf,

    #[clap(long)]
    local_address: String,
    #[clap(long)]
    peer_address: String,
    #[clap(long)]
    verification_server: Option<String>,
    /// identifies the transfer at the verification server, both peers must use the same value
    #[clap(long, default_value_t = 0)]
    group: u32,

    #[clap(long, default_value_t = 1000)]
    retransmit_timeout_millis: u64,
    #[clap(long, default_value_t = 100)]
    max_retransmissions: u32,
    /// never give up on a packet, overriding --max-retransmissions
    #[clap(long, default_value_t = false)]
    unbounded_retransmissions: bool,
    /// wait for the receiver to acknowledge the end of the stream (both peers must agree)
    #[clap(long, default_value_t = false)]
    acknowledged_end_of_stream: bool,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

fn transfer_config(args: &Args) -> TransferConfig {
    TransferConfig {
        retransmit_timeout: Duration::from_millis(args.retransmit_timeout_millis),
        max_retransmissions: if args.unbounded_retransmissions { None } else { Some(args.max_retransmissions) },
        end_of_stream: if args.acknowledged_end_of_stream {
            EndOfStreamPolicy::Acknowledged { repetitions: 5 }
        }
        else {
            EndOfStreamPolicy::Redundant { repetitions: 5 }
        },
        ..TransferConfig::default()
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let role: Role = args.role.parse()?;
    let local_addr: SocketAddr = args.local_address.parse()?;
    let peer_addr: SocketAddr = args.peer_address.parse()?;

    let config = Arc::new(transfer_config(&args));
    config.validate()?;

    let transport = UdpTransport::bind(local_addr, peer_addr).await?;

    match args.verification_server {
        Some(server_addr) => {
            let mut verification = TcpVerificationClient::connect(server_addr.parse()?, args.group, role).await?;
            let report = run_session(role, &args.file, transport, &mut verification, config).await?;
            info!("{:?}", report.stats);
            if !report.verified {
                anyhow::bail!("verification failed");
            }
        }
        None => {
            let endpoint = ByteEndpoint::open_file(role, &args.file)?;
            let mut session = TransferSession::initialize(role, endpoint, transport, TokioTimer::new(), config.clone())?;
            let stats = run_transfer(&mut session, config.tick_interval).await?;
            info!("{:?}", stats);
        }
    }
    Ok(())
}
