//! Shared contest state.
//!
//! Everything the connection tasks and background loops mutate lives behind
//! `ContestState`. Each method is atomic on its own; the only multi-step
//! guarantee is the ledger's check-and-append.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::blacklist::Blacklist;
use crate::config::Config;
use crate::ledger::{LedgerFile, RecordOutcome, Winner, WinnerLedger};
use crate::persistence::{self, PersistError, PersistenceWriter};
use crate::rate_limiter::{RateDecision, RateLimiter};
use crate::sessions::SessionRegistry;
use crate::stats::{Counters, StatsSnapshot};
use crate::validation::{validate_username, UsernameError};

/// Most entries a leaderboard request returns
pub const LEADERBOARD_LIMIT: usize = 100;

/// Rate-limit entries are kept for this many windows before pruning
const PRUNE_HORIZON_WINDOWS: u32 = 10;

/// Floor on the pruning horizon for very short windows
const MIN_PRUNE_HORIZON: Duration = Duration::from_secs(60);

/// Result of a scored attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PingOutcome {
    Won { rank: u64 },
    AlreadyWon,
    InvalidUsername(UsernameError),
    RateLimited { remaining: Duration },
}

pub struct ContestState {
    sessions: SessionRegistry,
    rate_limiter: RateLimiter,
    ledger: WinnerLedger,
    writer: PersistenceWriter,
    blacklist: Blacklist,
    counters: Counters,
    max_username_length: usize,
    session_timeout: Duration,
    snapshot_dir: PathBuf,
    max_snapshots: usize,
}

impl ContestState {
    pub fn new(config: &Config, ledger_file: LedgerFile, blacklist: Blacklist) -> Arc<Self> {
        let ledger = WinnerLedger::from_file(ledger_file);
        info!(
            winners = ledger.len(),
            banned = blacklist.len(),
            rate_limit_window_secs = config.rate_limit_window.as_secs_f64(),
            "Initializing contest state"
        );

        Arc::new(Self {
            sessions: SessionRegistry::new(config.max_username_length),
            rate_limiter: RateLimiter::new(config.rate_limit_window),
            ledger,
            writer: PersistenceWriter::new(&config.ledger_path),
            blacklist,
            counters: Counters::new(Instant::now()),
            max_username_length: config.max_username_length,
            session_timeout: config.session_timeout,
            snapshot_dir: config.snapshot_dir.clone(),
            max_snapshots: config.max_snapshots,
        })
    }

    pub fn is_blacklisted(&self, addr: &IpAddr) -> bool {
        self.blacklist.contains(addr)
    }

    pub fn reload_blacklist(&self) -> std::io::Result<usize> {
        self.blacklist.reload()
    }

    pub fn connection_accepted(&self) -> u64 {
        self.counters.connection_accepted()
    }

    pub fn connect(&self, username: &str, now: Instant) -> Result<(), UsernameError> {
        self.sessions.register(username, now)
    }

    pub fn disconnect(&self, username: &str) -> bool {
        self.sessions.remove(username)
    }

    pub fn heartbeat(&self, username: &str, now: Instant) -> bool {
        self.sessions.heartbeat(username, now)
    }

    /// Handle a scored attempt from `addr`.
    ///
    /// Order matters: the username is validated before anything is touched,
    /// the rate limiter records only attempts it lets through, and the ledger
    /// decides the rank.
    pub fn ping(
        &self,
        username: &str,
        addr: IpAddr,
        latency_ms: f64,
        now: Instant,
        wall_clock: chrono::DateTime<chrono::Local>,
    ) -> PingOutcome {
        if let Err(e) = validate_username(username, self.max_username_length) {
            return PingOutcome::InvalidUsername(e);
        }

        if let RateDecision::Deny { remaining } = self.rate_limiter.check_and_record(addr, now) {
            return PingOutcome::RateLimited { remaining };
        }

        self.ledger.count_attempt();
        let outcome = self.ledger.record(username, addr, latency_ms, wall_clock);
        // The attempt counter is persisted too, so every counted attempt
        // dirties the ledger
        self.writer.mark_dirty();

        match outcome {
            RecordOutcome::Won { rank } => PingOutcome::Won { rank },
            RecordOutcome::AlreadyWon => PingOutcome::AlreadyWon,
        }
    }

    pub fn leaderboard(&self) -> Vec<Winner> {
        self.ledger.top(LEADERBOARD_LIMIT)
    }

    pub fn stats(&self, now: Instant) -> StatsSnapshot {
        StatsSnapshot {
            online_players: self.sessions.online_count(),
            total_winners: self.ledger.len(),
            total_pings: self.ledger.total_pings(),
            uptime: self.counters.uptime(now).as_secs(),
            total_connections: self.counters.total_connections(),
            rate_limited_addresses: self.rate_limiter.len(),
        }
    }

    pub fn online_sample(&self, limit: usize) -> Vec<String> {
        self.sessions.online_sample(limit)
    }

    /// Evict sessions that missed their heartbeat.
    pub fn sweep_sessions(&self, now: Instant) -> Vec<String> {
        self.sessions.sweep(self.session_timeout, now)
    }

    /// Forget addresses whose last attempt is far outside the window.
    pub fn prune_rate_limits(&self, now: Instant) -> usize {
        let horizon = (self.rate_limiter.window() * PRUNE_HORIZON_WINDOWS).max(MIN_PRUNE_HORIZON);
        self.rate_limiter.prune(horizon, now)
    }

    /// Write the ledger if anything changed since the last write.
    pub fn flush_ledger(&self) -> Result<bool, PersistError> {
        self.writer.flush_if_dirty(&self.ledger)
    }

    /// Write the ledger unconditionally.
    pub fn flush_ledger_now(&self) -> Result<(), PersistError> {
        self.writer.flush(&self.ledger)
    }

    /// Copy the ledger file into the snapshot directory.
    pub fn snapshot_ledger(
        &self,
        now: chrono::DateTime<chrono::Local>,
    ) -> Result<Option<PathBuf>, PersistError> {
        let taken =
            persistence::take_snapshot(self.writer.path(), &self.snapshot_dir, now, self.max_snapshots)?;
        if taken.is_none() {
            debug!(path = %self.writer.path().display(), "No ledger file to snapshot yet");
        }
        Ok(taken)
    }
}
