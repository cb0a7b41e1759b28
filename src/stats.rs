//! Server counters, as served by `GET_STATS` and the periodic report.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time view of the server counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub online_players: usize,
    pub total_winners: usize,
    pub total_pings: u64,
    /// Seconds since the server started
    pub uptime: u64,
    pub total_connections: u64,
    #[serde(skip)]
    pub rate_limited_addresses: usize,
}

impl StatsSnapshot {
    /// Uptime as `Xh Ym Zs`.
    pub fn uptime_display(&self) -> String {
        format!(
            "{}h {}m {}s",
            self.uptime / 3600,
            (self.uptime % 3600) / 60,
            self.uptime % 60
        )
    }
}

/// Process-wide counters that are not owned by another component
pub struct Counters {
    started_at: Instant,
    total_connections: AtomicU64,
}

impl Counters {
    pub fn new(started_at: Instant) -> Self {
        Self {
            started_at,
            total_connections: AtomicU64::new(0),
        }
    }

    pub fn connection_accepted(&self) -> u64 {
        self.total_connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    pub fn uptime(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uptime_display() {
        let snapshot = StatsSnapshot {
            online_players: 0,
            total_winners: 0,
            total_pings: 0,
            uptime: 3 * 3600 + 25 * 60 + 7,
            total_connections: 0,
            rate_limited_addresses: 0,
        };
        assert_eq!(snapshot.uptime_display(), "3h 25m 7s");
    }

    #[test]
    fn test_json_keys() {
        let snapshot = StatsSnapshot {
            online_players: 2,
            total_winners: 1,
            total_pings: 5,
            uptime: 60,
            total_connections: 12,
            rate_limited_addresses: 3,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["online_players"], 2);
        assert_eq!(json["total_winners"], 1);
        assert_eq!(json["total_pings"], 5);
        assert_eq!(json["uptime"], 60);
        assert_eq!(json["total_connections"], 12);
        assert!(json.get("rate_limited_addresses").is_none());
    }

    #[test]
    fn test_counters() {
        let start = Instant::now();
        let counters = Counters::new(start);
        counters.connection_accepted();
        assert_eq!(counters.connection_accepted(), 2);
        assert_eq!(counters.total_connections(), 2);
        assert_eq!(
            counters.uptime(start + Duration::from_secs(90)),
            Duration::from_secs(90)
        );
    }
}
