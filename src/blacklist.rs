//! Banned source addresses.
//!
//! The list lives in a plain-text file, one IP per line. Blank lines and
//! `#` comments are ignored. The server only reads it; operators edit the
//! file and ask for a reload.

use std::collections::HashSet;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

pub struct Blacklist {
    path: Option<PathBuf>,
    banned: RwLock<HashSet<IpAddr>>,
}

impl Blacklist {
    /// A blacklist that bans nobody and has no backing file.
    #[cfg(test)]
    pub fn empty() -> Self {
        Self {
            path: None,
            banned: RwLock::new(HashSet::new()),
        }
    }

    /// Load the blacklist from `path`. A missing file is an empty list.
    pub fn load(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let banned = read_file(&path)?;
        info!(path = %path.display(), count = banned.len(), "Loaded blacklist");

        Ok(Self {
            path: Some(path),
            banned: RwLock::new(banned),
        })
    }

    /// Re-read the backing file, replacing the current set.
    ///
    /// On error the previous set stays in place.
    pub fn reload(&self) -> io::Result<usize> {
        let Some(path) = self.path.as_deref() else {
            return Ok(self.len());
        };

        let banned = read_file(path)?;
        let count = banned.len();
        *self.banned.write().unwrap_or_else(|e| e.into_inner()) = banned;
        info!(path = %path.display(), count, "Reloaded blacklist");
        Ok(count)
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.banned
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(ip)
    }

    pub fn len(&self) -> usize {
        self.banned.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl FromIterator<IpAddr> for Blacklist {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        Self {
            path: None,
            banned: RwLock::new(iter.into_iter().collect()),
        }
    }
}

fn read_file(path: &Path) -> io::Result<HashSet<IpAddr>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(parse(&contents)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashSet::new()),
        Err(e) => Err(e),
    }
}

fn parse(contents: &str) -> HashSet<IpAddr> {
    let mut banned = HashSet::new();

    for (lineno, line) in contents.lines().enumerate() {
        let line = match line.split_once('#') {
            Some((before, _)) => before.trim(),
            None => line.trim(),
        };
        if line.is_empty() {
            continue;
        }

        match line.parse::<IpAddr>() {
            Ok(ip) => {
                banned.insert(ip);
            }
            Err(_) => warn!(line = lineno + 1, entry = line, "Skipping malformed blacklist entry"),
        }
    }

    banned
}
