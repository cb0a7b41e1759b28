//! Per-address spacing of scored attempts.
//!
//! Each source address may make one scored attempt per window. Only attempts
//! that are let through are recorded; a denied attempt leaves the table as it
//! was.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateDecision {
    Allow,
    /// Too soon; the address must wait `remaining` before trying again
    Deny { remaining: Duration },
}

pub struct RateLimiter {
    window: Duration,
    last_attempt: Mutex<HashMap<IpAddr, Instant>>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_attempt: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check `addr` and, if allowed, record `now` as its latest attempt.
    ///
    /// Both steps happen under one lock so two simultaneous attempts from the
    /// same address cannot both pass.
    pub fn check_and_record(&self, addr: IpAddr, now: Instant) -> RateDecision {
        let mut table = self.last_attempt.lock().unwrap_or_else(|e| e.into_inner());
        let decision = self.decide(table.get(&addr).copied(), now);
        if decision == RateDecision::Allow {
            table.insert(addr, now);
        }
        decision
    }

    fn decide(&self, prior: Option<Instant>, now: Instant) -> RateDecision {
        match prior {
            Some(prior) => {
                let elapsed = now.saturating_duration_since(prior);
                if elapsed < self.window {
                    RateDecision::Deny {
                        remaining: self.window - elapsed,
                    }
                } else {
                    RateDecision::Allow
                }
            }
            None => RateDecision::Allow,
        }
    }

    /// Drop entries whose last attempt is older than `horizon`.
    pub fn prune(&self, horizon: Duration, now: Instant) -> usize {
        let mut table = self.last_attempt.lock().unwrap_or_else(|e| e.into_inner());
        let before = table.len();
        table.retain(|_, last| now.saturating_duration_since(*last) < horizon);
        before - table.len()
    }

    /// Number of tracked addresses
    pub fn len(&self) -> usize {
        self.last_attempt
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
