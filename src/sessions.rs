//! Session registry: which usernames are currently online.
//!
//! A session is created by CONNECT, refreshed by HEARTBEAT and dropped either
//! by DISCONNECT or by the sweeper once it has been silent for longer than the
//! session timeout. Evicted clients are not told.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::trace;

use crate::validation::{validate_username, UsernameError};

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Instant>>,
    max_username_length: usize,
}

impl SessionRegistry {
    pub fn new(max_username_length: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_username_length,
        }
    }

    /// Create or refresh the session for `username`.
    pub fn register(&self, username: &str, now: Instant) -> Result<(), UsernameError> {
        validate_username(username, self.max_username_length)?;

        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(username.to_string(), now);
        trace!(username, "Session registered");
        Ok(())
    }

    /// Refresh an existing session. Returns `false` if there is none; a
    /// heartbeat never creates a session.
    pub fn heartbeat(&self, username: &str, now: Instant) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(username) {
            Some(last_activity) => {
                *last_activity = now;
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, username: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(username)
            .is_some()
    }

    /// Evict every session idle for longer than `timeout`. Returns the
    /// evicted usernames.
    pub fn sweep(&self, timeout: Duration, now: Instant) -> Vec<String> {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        let mut evicted = Vec::new();

        sessions.retain(|username, last_activity| {
            let keep = now.saturating_duration_since(*last_activity) <= timeout;
            if !keep {
                evicted.push(username.clone());
            }
            keep
        });

        evicted
    }

    pub fn online_count(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[cfg(test)]
    pub fn is_online(&self, username: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(username)
    }

    /// Up to `limit` online usernames, sorted.
    pub fn online_sample(&self, limit: usize) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = sessions.keys().cloned().collect();
        names.sort();
        names.truncate(limit);
        names
    }
}
