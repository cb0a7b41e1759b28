//! Winner ledger: the ordered record of who won and in which place.
//!
//! Ranks are handed out by the order in which attempts enter the ledger's
//! lock. Checking whether a username already won and appending the new entry
//! happen under that one lock, so a username can never win twice and ranks
//! stay gapless.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Human-readable timestamp format stored with every win
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single recorded win. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Winner {
    pub username: String,
    pub timestamp: String,
    #[serde(rename = "ip")]
    pub source_address: String,
    pub rank: u64,
    /// Stored as text such as `"12.50ms"`, which existing ledger files and
    /// clients expect
    #[serde(rename = "latency", alias = "latency_ms", default, with = "latency_text")]
    pub latency_ms: f64,
}

/// Result of a scored attempt reaching the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Won { rank: u64 },
    AlreadyWon,
}

/// On-disk form of the ledger
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerFile {
    #[serde(default)]
    pub winners: Vec<Winner>,
    /// Every scored attempt that got past the rate limiter, across restarts
    #[serde(default)]
    pub total_pings: u64,
}

struct Entries {
    winners: Vec<Winner>,
    usernames: HashSet<String>,
}

pub struct WinnerLedger {
    entries: Mutex<Entries>,
    total_pings: AtomicU64,
}

impl WinnerLedger {
    pub fn new() -> Self {
        Self::from_file(LedgerFile::default())
    }

    /// Rebuild a ledger from its persisted form.
    ///
    /// Entries are re-ranked by position and duplicate usernames dropped, so
    /// a hand-edited file cannot break rank contiguity.
    pub fn from_file(file: LedgerFile) -> Self {
        let mut winners = Vec::with_capacity(file.winners.len());
        let mut usernames = HashSet::with_capacity(file.winners.len());

        for mut winner in file.winners {
            if usernames.insert(winner.username.clone()) {
                winner.rank = winners.len() as u64 + 1;
                winners.push(winner);
            }
        }

        Self {
            entries: Mutex::new(Entries { winners, usernames }),
            total_pings: AtomicU64::new(file.total_pings),
        }
    }

    /// Record a win for `username` unless it already has one.
    pub fn record(
        &self,
        username: &str,
        address: IpAddr,
        latency_ms: f64,
        now: chrono::DateTime<chrono::Local>,
    ) -> RecordOutcome {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if entries.usernames.contains(username) {
            return RecordOutcome::AlreadyWon;
        }

        let rank = entries.winners.len() as u64 + 1;
        entries.usernames.insert(username.to_string());
        entries.winners.push(Winner {
            username: username.to_string(),
            timestamp: now.format(TIMESTAMP_FORMAT).to_string(),
            source_address: address.to_string(),
            rank,
            latency_ms,
        });

        RecordOutcome::Won { rank }
    }

    /// The first `n` winners in rank order.
    pub fn top(&self, n: usize) -> Vec<Winner> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.winners.iter().take(n).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .winners
            .len()
    }

    /// Count a scored attempt that passed the rate limiter.
    pub fn count_attempt(&self) -> u64 {
        self.total_pings.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn total_pings(&self) -> u64 {
        self.total_pings.load(Ordering::SeqCst)
    }

    /// Consistent copy of the whole ledger for persistence.
    pub fn snapshot(&self) -> LedgerFile {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        LedgerFile {
            winners: entries.winners.clone(),
            total_pings: self.total_pings.load(Ordering::SeqCst),
        }
    }
}

impl Default for WinnerLedger {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency as `"<ms with two decimals>ms"` on the way out. On the way in,
/// plain numbers are accepted too, and unreadable text counts as zero rather
/// than failing the whole ledger.
mod latency_text {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(latency_ms: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:.2}ms", latency_ms))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Number(n) => n,
            Raw::Text(text) => parse(&text).unwrap_or(0.0),
        })
    }

    pub(super) fn parse(text: &str) -> Option<f64> {
        let text = text.trim();
        let number = text.strip_suffix("ms").unwrap_or(text).trim();
        number.parse::<f64>().ok().filter(|n| n.is_finite())
    }
}
