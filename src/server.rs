//! TCP server for the P2W contest.
//!
//! Accepts connections under a connection limit, reads exactly one request
//! from each, answers it and closes. Background tasks sweep sessions, prune
//! the rate limiter, flush the ledger, take snapshots and report stats.

use crate::config::Config;
use crate::ledger::Winner;
use crate::protocol::{Command, Parser, Response};
use crate::state::{ContestState, PingOutcome};
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Largest request read from a connection
const MAX_REQUEST_SIZE: usize = 1024;

/// Online usernames listed in the periodic report
const REPORT_ONLINE_SAMPLE: usize = 5;

/// Server instance
pub struct Server {
    config: Config,
    state: Arc<ContestState>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, state: Arc<ContestState>) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            state,
            connection_limit,
        }
    }

    /// Bind the configured address and serve until `shutdown` resolves.
    pub async fn run(
        &self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %listener.local_addr()?, "Server listening");
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then write
    /// a final ledger flush and snapshot.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let background = self.spawn_background_tasks();
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.connection_limit.clone().acquire_owned() => permit?,
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    let count = self.state.connection_accepted();
                    debug!(peer = %addr, total = count, "New connection");

                    let state = Arc::clone(&self.state);
                    let read_timeout = self.config.read_timeout;

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, addr.ip(), state, read_timeout).await
                        {
                            debug!(peer = %addr, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("Server shutting down");
        for handle in background {
            handle.abort();
        }
        final_persist(Arc::clone(&self.state)).await;
        Ok(())
    }

    fn spawn_background_tasks(&self) -> Vec<JoinHandle<()>> {
        let config = &self.config;
        vec![
            tokio::spawn(session_sweep_task(
                Arc::clone(&self.state),
                config.session_sweep_interval,
            )),
            tokio::spawn(rate_limit_prune_task(
                Arc::clone(&self.state),
                config.rate_limit_prune_interval,
            )),
            tokio::spawn(flush_task(Arc::clone(&self.state), config.flush_interval)),
            tokio::spawn(snapshot_task(
                Arc::clone(&self.state),
                config.backup_interval,
            )),
            tokio::spawn(stats_report_task(
                Arc::clone(&self.state),
                config.stats_interval,
            )),
        ]
    }
}

/// Background task to evict sessions that stopped sending heartbeats
async fn session_sweep_task(state: Arc<ContestState>, period: Duration) {
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        let evicted = state.sweep_sessions(Instant::now());
        if !evicted.is_empty() {
            debug!(count = evicted.len(), users = ?evicted, "Evicted idle sessions");
        }
    }
}

/// Background task to bound the rate limiter's memory
async fn rate_limit_prune_task(state: Arc<ContestState>, period: Duration) {
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        let count = state.prune_rate_limits(Instant::now());
        if count > 0 {
            debug!(count, "Pruned rate-limit entries");
        }
    }
}

/// Background task writing the ledger at most once per tick
async fn flush_task(state: Arc<ContestState>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        let state = Arc::clone(&state);
        match tokio::task::spawn_blocking(move || state.flush_ledger()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(error = %e, "Ledger flush failed, will retry"),
            Err(e) => error!(error = %e, "Ledger flush task panicked"),
        }
    }
}

/// Background task copying the ledger file to timestamped backups
async fn snapshot_task(state: Arc<ContestState>, period: Duration) {
    let start = tokio::time::Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);

    loop {
        interval.tick().await;
        let state = Arc::clone(&state);
        match tokio::task::spawn_blocking(move || state.snapshot_ledger(chrono::Local::now())).await
        {
            Ok(Ok(Some(path))) => info!(path = %path.display(), "Ledger snapshot taken"),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => warn!(error = %e, "Ledger snapshot failed"),
            Err(e) => error!(error = %e, "Ledger snapshot task panicked"),
        }
    }
}

/// Background task logging the server counters
async fn stats_report_task(state: Arc<ContestState>, period: Duration) {
    let mut interval = tokio::time::interval(period);

    loop {
        interval.tick().await;
        let stats = state.stats(Instant::now());
        let online = state.online_sample(REPORT_ONLINE_SAMPLE);
        info!(
            winners = stats.total_winners,
            online = stats.online_players,
            pings = stats.total_pings,
            connections = stats.total_connections,
            tracked_addresses = stats.rate_limited_addresses,
            uptime = %stats.uptime_display(),
            sample = ?online,
            "Server stats"
        );
    }
}

/// Flush and snapshot once more before exiting. Failures are only logged.
async fn final_persist(state: Arc<ContestState>) {
    let result = tokio::task::spawn_blocking(move || {
        state.flush_ledger_now()?;
        state.snapshot_ledger(chrono::Local::now())
    })
    .await;

    match result {
        Ok(Ok(Some(path))) => info!(path = %path.display(), "Final snapshot written"),
        Ok(Ok(None)) => {}
        Ok(Err(e)) => error!(error = %e, "Final ledger write failed"),
        Err(e) => error!(error = %e, "Final ledger write panicked"),
    }
}

/// Handle a single client connection: one request, one response.
pub async fn handle_connection<S>(
    mut stream: S,
    peer: IpAddr,
    state: Arc<ContestState>,
    read_timeout: Duration,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(MAX_REQUEST_SIZE);

    let n = match tokio::time::timeout(read_timeout, stream.read_buf(&mut buffer)).await {
        Ok(read) => read.map_err(ConnectionError::Io)?,
        Err(_) => return Err(ConnectionError::ReadTimeout(read_timeout)),
    };
    if n == 0 {
        trace!(peer = %peer, "Connection closed by client");
        return Ok(());
    }

    let response = if state.is_blacklisted(&peer) {
        warn!(
            peer = %peer,
            verb = %String::from_utf8_lossy(Parser::verb(&buffer)),
            "Rejected blacklisted source"
        );
        Bytes::from_static(Response::blacklisted())
    } else {
        match Parser::parse(&buffer) {
            Ok(command) => {
                trace!(?command, "Processing command");
                execute_command(&command, peer, &state)
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Invalid request");
                Bytes::from_static(Response::invalid_request())
            }
        }
    };

    stream
        .write_all(&response)
        .await
        .map_err(ConnectionError::Io)?;
    stream.shutdown().await.map_err(ConnectionError::Io)?;
    Ok(())
}

#[derive(Serialize)]
struct LeaderboardBody {
    winners: Vec<Winner>,
}

/// Execute a parsed command against the contest state
fn execute_command(command: &Command, peer: IpAddr, state: &ContestState) -> Bytes {
    match command {
        Command::Connect { username } => match state.connect(username, Instant::now()) {
            Ok(()) => {
                info!(username = %username, peer = %peer, "Player connected");
                Bytes::from_static(Response::connected())
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Rejected username on connect");
                Bytes::from_static(Response::invalid_username())
            }
        },

        Command::Disconnect { username } => {
            if state.disconnect(username) {
                info!(username = %username, "Player disconnected");
            }
            Bytes::from_static(Response::disconnected())
        }

        Command::Heartbeat { username } => {
            if !state.heartbeat(username, Instant::now()) {
                trace!(username = %username, "Heartbeat for unknown session");
            }
            Bytes::from_static(Response::ok())
        }

        Command::Ping {
            username,
            latency_ms,
        } => match state.ping(
            username,
            peer,
            *latency_ms,
            Instant::now(),
            chrono::Local::now(),
        ) {
            PingOutcome::Won { rank } => {
                info!(
                    rank,
                    username = %username,
                    peer = %peer,
                    latency_ms = *latency_ms,
                    "New winner"
                );
                Response::win(rank)
            }
            PingOutcome::AlreadyWon => Bytes::from_static(Response::already_won()),
            PingOutcome::InvalidUsername(e) => {
                debug!(peer = %peer, error = %e, "Rejected username on ping");
                Bytes::from_static(Response::invalid_username())
            }
            PingOutcome::RateLimited { remaining } => {
                warn!(
                    peer = %peer,
                    remaining_secs = remaining.as_secs_f64(),
                    "Rate limited ping"
                );
                Response::rate_limited(remaining)
            }
        },

        Command::Stats => json_response(&state.stats(Instant::now())),

        Command::Leaderboard => json_response(&LeaderboardBody {
            winners: state.leaderboard(),
        }),
    }
}

fn json_response<T: Serialize>(body: &T) -> Bytes {
    match Response::json(body) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            Bytes::from_static(Response::server_error())
        }
    }
}

/// Per-connection failures; never affect other connections
#[derive(Debug)]
pub enum ConnectionError {
    ReadTimeout(Duration),
    Io(std::io::Error),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::ReadTimeout(after) => {
                write!(f, "No request within {} ms", after.as_millis())
            }
            ConnectionError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ConnectionError {}
