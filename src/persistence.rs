//! Durable storage for the winner ledger.
//!
//! Wins only mark the ledger dirty. A fixed-tick flusher turns any number of
//! marks into one write of the full ledger: temp file, fsync, rename over the
//! target. Readers of the target path therefore only ever see a complete file.
//!
//! Periodic snapshots copy the ledger file into a backup directory under a
//! timestamped name, keeping the newest `max_snapshots`.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::ledger::{LedgerFile, WinnerLedger};

/// Timestamp embedded in snapshot and corrupt-backup names. Sorts
/// chronologically as plain text.
const BACKUP_STAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%3f";

/// Debounced ledger writer
pub struct PersistenceWriter {
    path: PathBuf,
    dirty: AtomicBool,
    /// Serializes writers; they share one temp file
    write_lock: Mutex<()>,
}

impl PersistenceWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dirty: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Note that the ledger changed. Never blocks.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    #[cfg(test)]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Write the ledger if it changed since the last flush.
    ///
    /// Returns `Ok(true)` when a write happened. A failed write re-marks the
    /// ledger dirty so the next tick tries again.
    pub fn flush_if_dirty(&self, ledger: &WinnerLedger) -> Result<bool, PersistError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }

        match self.flush(ledger) {
            Ok(()) => Ok(true),
            Err(e) => {
                self.mark_dirty();
                Err(e)
            }
        }
    }

    /// Write the full ledger now, regardless of the dirty flag.
    pub fn flush(&self, ledger: &WinnerLedger) -> Result<(), PersistError> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = ledger.snapshot();
        let json = serde_json::to_vec_pretty(&snapshot).map_err(PersistError::Json)?;
        write_atomic(&self.path, &json).map_err(|e| PersistError::Io(self.path.clone(), e))?;
        debug!(
            path = %self.path.display(),
            winners = snapshot.winners.len(),
            "Ledger flushed"
        );
        Ok(())
    }
}

/// Load the ledger file at `path`.
///
/// A missing file yields an empty ledger. A file that cannot be parsed is
/// renamed aside with a `.corrupted` suffix and an empty ledger is returned.
/// Only a file that exists but cannot be read is an error.
pub fn load_ledger(path: &Path) -> Result<LedgerFile, PersistError> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "No ledger file, starting empty");
            return Ok(LedgerFile::default());
        }
        Err(e) => return Err(PersistError::Io(path.to_path_buf(), e)),
    };

    match serde_json::from_slice::<LedgerFile>(&contents) {
        Ok(file) => {
            info!(
                path = %path.display(),
                winners = file.winners.len(),
                total_pings = file.total_pings,
                "Loaded ledger"
            );
            Ok(file)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Ledger file is corrupt, starting empty");
            quarantine(path, &corrupted_path(path, chrono::Local::now()));
            Ok(LedgerFile::default())
        }
    }
}

/// Move a corrupt ledger file to `backup`. Failing to do so is logged and
/// otherwise ignored; the next flush then replaces the corrupt file.
fn quarantine(path: &Path, backup: &Path) -> Option<PathBuf> {
    match std::fs::rename(path, backup) {
        Ok(()) => {
            warn!(backup = %backup.display(), "Corrupt ledger file moved aside");
            Some(backup.to_path_buf())
        }
        Err(e) => {
            error!(
                path = %path.display(),
                backup = %backup.display(),
                error = %e,
                "Could not move corrupt ledger file aside"
            );
            None
        }
    }
}

/// Copy the ledger file into `snapshot_dir` under a timestamped name, then
/// delete the oldest snapshots beyond `keep` (0 keeps everything).
///
/// Returns `Ok(None)` if there is no ledger file yet.
pub fn take_snapshot(
    ledger_path: &Path,
    snapshot_dir: &Path,
    now: chrono::DateTime<chrono::Local>,
    keep: usize,
) -> Result<Option<PathBuf>, PersistError> {
    if !ledger_path.exists() {
        return Ok(None);
    }

    std::fs::create_dir_all(snapshot_dir)
        .map_err(|e| PersistError::Io(snapshot_dir.to_path_buf(), e))?;

    let (stem, ext) = snapshot_name_parts(ledger_path);
    let target = snapshot_dir.join(format!(
        "{}_{}{}",
        stem,
        now.format(BACKUP_STAMP_FORMAT),
        ext
    ));

    std::fs::copy(ledger_path, &target).map_err(|e| PersistError::Io(target.clone(), e))?;

    if keep > 0 {
        let removed = rotate_snapshots(snapshot_dir, &stem, &ext, keep)
            .map_err(|e| PersistError::Io(snapshot_dir.to_path_buf(), e))?;
        if removed > 0 {
            debug!(removed, "Rotated old snapshots");
        }
    }

    Ok(Some(target))
}

/// Write `contents` to a sibling temp file, sync it, and rename it over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let temp_path = temp_path(path);

    let mut file = std::fs::File::create(&temp_path)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, path)
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn corrupted_path(path: &Path, now: chrono::DateTime<chrono::Local>) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(format!(".{}.corrupted", now.format(BACKUP_STAMP_FORMAT)));
    path.with_file_name(name)
}

/// Split `winners.json` into (`winners`, `.json`).
fn snapshot_name_parts(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger".to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

fn rotate_snapshots(dir: &Path, stem: &str, ext: &str, keep: usize) -> io::Result<usize> {
    let prefix = format!("{}_", stem);
    let mut snapshots: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&prefix) && n.ends_with(ext))
                .unwrap_or(false)
        })
        .collect();

    if snapshots.len() <= keep {
        return Ok(0);
    }

    snapshots.sort();
    let excess = snapshots.len() - keep;
    for old in &snapshots[..excess] {
        std::fs::remove_file(old)?;
    }
    Ok(excess)
}

/// Persistence errors
#[derive(Debug)]
pub enum PersistError {
    Io(PathBuf, io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::Io(path, e) => write!(f, "I/O error on '{}': {}", path.display(), e),
            PersistError::Json(e) => write!(f, "Failed to encode ledger: {}", e),
        }
    }
}

impl std::error::Error for PersistError {}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::thread;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn test_flush_only_when_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winners.json");
        let writer = PersistenceWriter::new(&path);
        let ledger = WinnerLedger::new();

        assert!(!writer.flush_if_dirty(&ledger).unwrap());
        assert!(!path.exists());

        ledger.record("alice", localhost(), 1.0, chrono::Local::now());
        writer.mark_dirty();
        writer.mark_dirty();
        assert!(writer.flush_if_dirty(&ledger).unwrap());
        assert!(!writer.is_dirty());
        assert!(!writer.flush_if_dirty(&ledger).unwrap());

        assert!(path.exists());
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_reload_reproduces_ledger_after_concurrent_wins() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winners.json");
        let writer = Arc::new(PersistenceWriter::new(&path));
        let ledger = Arc::new(WinnerLedger::new());

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let ledger = Arc::clone(&ledger);
                let writer = Arc::clone(&writer);
                thread::spawn(move || {
                    ledger.count_attempt();
                    ledger.record(&format!("p{i}"), localhost(), i as f64, chrono::Local::now());
                    writer.mark_dirty();
                    // Concurrent flushers are allowed; each write is whole
                    let _ = writer.flush_if_dirty(&ledger);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        writer.flush(&ledger).unwrap();

        let reloaded = WinnerLedger::from_file(load_ledger(&path).unwrap());
        assert_eq!(reloaded.snapshot(), ledger.snapshot());
        assert_eq!(reloaded.len(), 32);
        assert_eq!(reloaded.total_pings(), 32);
    }

    #[test]
    fn test_failed_flush_stays_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("winners.json");
        let writer = PersistenceWriter::new(&path);
        let ledger = WinnerLedger::new();

        writer.mark_dirty();
        assert!(writer.flush_if_dirty(&ledger).is_err());
        assert!(writer.is_dirty());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = load_ledger(&dir.path().join("winners.json")).unwrap();
        assert_eq!(file, LedgerFile::default());
    }

    #[test]
    fn test_load_corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winners.json");
        std::fs::write(&path, b"{\"winners\": [ truncated").unwrap();

        let file = load_ledger(&path).unwrap();
        assert!(file.winners.is_empty());
        assert!(!path.exists());

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".corrupted"))
            .collect();
        assert_eq!(backups.len(), 1);
        assert_eq!(
            std::fs::read(backups[0].path()).unwrap(),
            b"{\"winners\": [ truncated"
        );
    }

    #[test]
    fn test_failed_quarantine_still_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winners.json");
        std::fs::write(&path, b"not json").unwrap();

        // A non-empty directory cannot be replaced by a rename
        let blocked = dir.path().join("blocked");
        std::fs::create_dir(&blocked).unwrap();
        std::fs::write(blocked.join("keep"), b"x").unwrap();

        assert_eq!(quarantine(&path, &blocked), None);
        assert!(path.exists());
        assert_eq!(quarantine(&path, &dir.path().join("moved")), Some(dir.path().join("moved")));
        assert!(!path.exists());
    }

    #[test]
    fn test_load_existing_ledger_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("winners_5555.json");
        std::fs::write(
            &path,
            br#"{
  "winners": [
    {
      "username": "alice",
      "timestamp": "2024-05-01 12:00:00",
      "ip": "127.0.0.1",
      "rank": 1,
      "latency": "12.50ms"
    }
  ],
  "total_pings": 7
}"#,
        )
        .unwrap();

        let ledger = WinnerLedger::from_file(load_ledger(&path).unwrap());
        assert!(path.exists());
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.total_pings(), 7);
        assert_eq!(ledger.top(1)[0].latency_ms, 12.5);
        assert_eq!(
            ledger.record("alice", localhost(), 1.0, chrono::Local::now()),
            crate::ledger::RecordOutcome::AlreadyWon
        );

        // Written back in the same shape
        PersistenceWriter::new(&path).flush(&ledger).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(json["winners"][0]["latency"], "12.50ms");
        assert_eq!(json["total_pings"], 7);
    }

    #[test]
    fn test_snapshot_and_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let ledger_path = dir.path().join("winners_5555.json");
        let snapshot_dir = dir.path().join("backups");

        // Nothing to copy yet
        let now = chrono::Local::now();
        assert!(take_snapshot(&ledger_path, &snapshot_dir, now, 2)
            .unwrap()
            .is_none());

        std::fs::write(&ledger_path, b"{}").unwrap();
        let base = chrono::Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let mut taken = Vec::new();
        for i in 0..4 {
            let at = base + chrono::Duration::seconds(i);
            taken.push(
                take_snapshot(&ledger_path, &snapshot_dir, at, 2)
                    .unwrap()
                    .unwrap(),
            );
        }

        let mut remaining: Vec<PathBuf> = std::fs::read_dir(&snapshot_dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        remaining.sort();
        assert_eq!(remaining, taken[2..].to_vec());
        assert!(remaining[0]
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("winners_5555_20240501-120002"));
    }

    #[test]
    fn test_write_atomic_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.json");

        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second");
    }
}
