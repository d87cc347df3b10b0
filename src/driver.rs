use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use anyhow::bail;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use crate::config::TransferConfig;
use crate::engine::{ByteEndpoint, Completion, ProtocolEngine, Role, TransferSession, TransferStats};
use crate::timer::TokioTimer;
use crate::transport::Transport;
use crate::verification::{challenge_checksum, VerificationService};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub stats: TransferStats,
    /// the verification server's verdict on the transferred file
    pub verified: bool,
}

/// Ticks the engine at a fixed cadence until it reports completion.
///
/// The engine does all its work inside `tick`, so the tick interval is the only place where
///  this task yields to the runtime (and thereby lets it do socket I/O and fire timers).
pub async fn run_transfer<E: ProtocolEngine>(engine: &mut E, tick_interval: Duration) -> anyhow::Result<TransferStats> {
    let mut ticks = interval(tick_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        if engine.tick() {
            break;
        }
    }

    match engine.completion() {
        Some(Completion::Delivered) => {
            info!("transfer complete");
            Ok(engine.stats().clone())
        }
        Some(completion) => completion.to_result().map(|_| engine.stats().clone()),
        None => bail!("engine reported completion without a result - this is a bug"),
    }
}

/// Proves the transfer to the verification server: signals completion, waits for the
///  challenge, uploads the checksum over the challenge and `content`, and waits for the server
///  to close the connection. Returns the server's verdict.
pub async fn run_checksum_handshake<V: VerificationService>(verification: &mut V, content: impl Read, config: &TransferConfig) -> anyhow::Result<bool> {
    verification.finish()?;

    let challenge = poll_until(config, "the checksum challenge", || verification.checksum_challenge()).await?;
    debug!("computing checksum for challenge {}", challenge);
    let checksum = challenge_checksum(challenge, content)?;
    verification.upload_checksum(checksum)?;

    poll_until(config, "the verification result", || verification.is_closed().then_some(())).await?;

    let successful = verification.was_successful();
    if successful {
        info!("transfer verified successfully");
    }
    else {
        warn!("verification failed: the file is corrupt");
    }
    Ok(successful)
}

async fn poll_until<T>(config: &TransferConfig, what: &str, mut poll: impl FnMut() -> Option<T>) -> anyhow::Result<T> {
    let deadline = Instant::now() + config.handshake_timeout;
    let mut ticks = interval(config.tick_interval);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticks.tick().await;
        if let Some(result) = poll() {
            return Ok(result);
        }
        if Instant::now() >= deadline {
            bail!("timeout after {:?} waiting for {}", config.handshake_timeout, what);
        }
    }
}

/// Runs a complete session for a file: the transfer in the given role, followed by the
///  checksum handshake over the file as it is on disk afterwards.
///
/// The handshake runs even if the transfer failed, so the peer gets a verdict instead of
///  running into a timeout. The transfer's failure takes precedence in the returned result.
pub async fn run_session<T: Transport, V: VerificationService>(
    role: Role,
    file: &Path,
    transport: T,
    verification: &mut V,
    config: Arc<TransferConfig>,
) -> anyhow::Result<SessionReport> {
    let endpoint = ByteEndpoint::open_file(role, file)?;
    let total_len = match role {
        Role::Sender => Some(std::fs::metadata(file)?.len()),
        Role::Receiver => None,
    };

    let mut session = TransferSession::initialize(role, endpoint, transport, TokioTimer::new(), config.clone())?;
    if let Some(total_len) = total_len {
        session = session.with_total_len(total_len);
    }

    let transfer_result = run_transfer(&mut session, config.tick_interval).await;
    // closes the file and stops the timer before the file is read again
    drop(session);

    if let Err(e) = &transfer_result {
        error!("{} - proceeding with verification", e);
    }

    let verified = run_checksum_handshake(verification, File::open(file)?, &config).await?;
    Ok(SessionReport {
        stats: transfer_result?,
        verified,
    })
}
