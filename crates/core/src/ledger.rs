//! Persistent per-file timestamp ledger.
//!
//! The ledger remembers, for every backup-relative path, the modification
//! and creation time last seen when the file was in sync. Sync mode uses it
//! to tell "created on one side" from "deleted on the other", and to decide
//! whether both sides changed since the last run.
//!
//! On disk it is a single JSON document:
//!
//! ```json
//! {
//!     "timestamp": 1700000000.0,
//!     "files": {
//!         "docs/report.txt": { "mtime": 1699999000.0, "ctime": 1699990000.0, "colresmode": 0 }
//!     }
//! }
//! ```
//!
//! Mutations are buffered and written out by [`TimestampLedger::flush`]
//! through a temp file that replaces the ledger in one rename. A sidecar
//! `.lock` file is held under an exclusive advisory lock while the ledger
//! is open.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_TOLERANCE_SECS;
use crate::errors::LedgerError;
use crate::scanner::file_times;

/// Buffered mutations above this count trigger an autosave.
pub const AUTOSAVE_THRESHOLD: usize = 10;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Per-path collision handling remembered across runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolutionMode {
    /// Ask every time.
    #[default]
    Manual,
    /// Keep whichever side was modified last.
    AutoLatest,
}

impl ResolutionMode {
    fn code(self) -> u8 {
        match self {
            Self::Manual => 0,
            Self::AutoLatest => 1,
        }
    }
}

impl std::fmt::Display for ResolutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manual"),
            Self::AutoLatest => write!(f, "auto_latest"),
        }
    }
}

impl Serialize for ResolutionMode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

// Older ledgers store the mode as a float.
impl<'de> Deserialize<'de> for ResolutionMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = f64::deserialize(deserializer)?;
        Ok(if raw >= 0.5 {
            Self::AutoLatest
        } else {
            Self::Manual
        })
    }
}

/// Last known times for one backup-relative path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimestampRecord {
    #[serde(default)]
    pub mtime: f64,
    #[serde(default)]
    pub ctime: f64,
    #[serde(default)]
    pub colresmode: ResolutionMode,
}

impl TimestampRecord {
    pub fn new(mtime: f64, ctime: f64) -> Self {
        Self {
            mtime,
            ctime,
            colresmode: ResolutionMode::Manual,
        }
    }

    /// Stat `path`; a missing path yields zero times.
    pub fn from_disk(path: &Path) -> Self {
        match fs::metadata(path) {
            Ok(meta) => {
                let (mtime, ctime) = file_times(&meta);
                Self::new(mtime, ctime)
            }
            Err(_) => Self::default(),
        }
    }

    /// The later of the two recorded times.
    pub fn latest_change(&self) -> f64 {
        self.mtime.max(self.ctime)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerDocument {
    #[serde(default)]
    timestamp: f64,
    #[serde(default)]
    files: BTreeMap<String, TimestampRecord>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The timestamp ledger of one backup root.
///
/// Not internally synchronized; concurrent writers share it behind a mutex.
#[derive(Debug)]
pub struct TimestampLedger {
    path: Option<PathBuf>,
    tolerance: f64,
    autosave: bool,
    data: LedgerDocument,
    changes: BTreeMap<String, TimestampRecord>,
    unsaved: usize,
    _lock: Option<File>,
}

impl TimestampLedger {
    /// Open (or create) the ledger at `path` and take its lock.
    pub fn open(path: impl Into<PathBuf>, tolerance: f64) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_path = lock_path_for(&path);
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)?;
        if lock.try_lock_exclusive().is_err() {
            warn!(path = %path.display(), "ledger is locked by another process");
            return Err(LedgerError::Locked(path));
        }

        let mut ledger = Self {
            path: Some(path.clone()),
            tolerance,
            autosave: false,
            data: LedgerDocument::default(),
            changes: BTreeMap::new(),
            unsaved: 0,
            _lock: Some(lock),
        };

        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            ledger.data = serde_json::from_str(&raw).map_err(|e| LedgerError::Corrupt {
                path: path.clone(),
                detail: e.to_string(),
            })?;
            info!(
                path = %path.display(),
                files = ledger.data.files.len(),
                "loaded timestamp ledger"
            );
        } else {
            ledger.write_document()?;
            info!(path = %path.display(), "created empty timestamp ledger");
        }
        Ok(ledger)
    }

    /// A ledger that is never written to disk.
    pub fn in_memory(tolerance: f64) -> Self {
        Self {
            path: None,
            tolerance,
            autosave: false,
            data: LedgerDocument::default(),
            changes: BTreeMap::new(),
            unsaved: 0,
            _lock: None,
        }
    }

    /// Persist automatically once more than [`AUTOSAVE_THRESHOLD`] mutations
    /// are buffered. Autosaves never advance the sync time.
    pub fn with_autosave(mut self, autosave: bool) -> Self {
        self.autosave = autosave;
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Epoch seconds of the last flush, `0.0` if never flushed.
    pub fn last_sync(&self) -> f64 {
        self.data.timestamp
    }

    /// Number of tracked paths, counting buffered additions.
    pub fn len(&self) -> usize {
        self.data.files.len()
            + self
                .changes
                .keys()
                .filter(|k| !self.data.files.contains_key(*k))
                .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutations not yet flushed.
    pub fn unsaved_changes(&self) -> usize {
        self.unsaved
    }

    /// The stored record for `key`, buffered changes first.
    pub fn record(&self, key: &str) -> Option<TimestampRecord> {
        self.changes
            .get(key)
            .or_else(|| self.data.files.get(key))
            .copied()
    }

    /// The record for `key`. A missing record is seeded from the current
    /// stat of `on_disk` (forced), and the seeded record is returned.
    pub fn get_timestamp(
        &mut self,
        key: &str,
        on_disk: &Path,
    ) -> Result<TimestampRecord, LedgerError> {
        if let Some(record) = self.record(key) {
            return Ok(record);
        }
        let seeded = TimestampRecord::from_disk(on_disk);
        self.save_timestamp(key, seeded, true)?;
        debug!(key, mtime = seeded.mtime, "seeded ledger record from disk");
        Ok(seeded)
    }

    /// Like [`get_timestamp`](Self::get_timestamp), but a path the ledger did
    /// not know yields `None` even though it gets seeded.
    pub fn lookup_or_seed(
        &mut self,
        key: &str,
        on_disk: &Path,
    ) -> Result<Option<TimestampRecord>, LedgerError> {
        if let Some(record) = self.record(key) {
            return Ok(Some(record));
        }
        self.save_timestamp(key, TimestampRecord::from_disk(on_disk), true)?;
        Ok(None)
    }

    /// Record new times for `key`.
    ///
    /// Zero times are ignored. Otherwise the record is only replaced when
    /// the modification time moved by more than the tolerance, or when
    /// `force` is set. The stored resolution mode is kept.
    pub fn save_timestamp(
        &mut self,
        key: &str,
        record: TimestampRecord,
        force: bool,
    ) -> Result<(), LedgerError> {
        if record.mtime <= 0.0 {
            return Ok(());
        }
        let existing = self.record(key).unwrap_or_default();
        if (existing.mtime - record.mtime).abs() <= self.tolerance && !force {
            return Ok(());
        }
        self.changes.insert(
            key.to_string(),
            TimestampRecord {
                colresmode: existing.colresmode,
                ..record
            },
        );
        self.mark_dirty()
    }

    /// Record the current times of `on_disk` under `key`.
    pub fn save_from_disk(
        &mut self,
        key: &str,
        on_disk: &Path,
        force: bool,
    ) -> Result<(), LedgerError> {
        self.save_timestamp(key, TimestampRecord::from_disk(on_disk), force)
    }

    pub fn resolution_mode(&self, key: &str) -> ResolutionMode {
        self.record(key).map(|r| r.colresmode).unwrap_or_default()
    }

    pub fn set_resolution_mode(
        &mut self,
        key: &str,
        mode: ResolutionMode,
    ) -> Result<(), LedgerError> {
        let existing = self.record(key).unwrap_or_default();
        if existing.colresmode == mode {
            return Ok(());
        }
        info!(key, mode = %mode, "collision resolution mode changed");
        self.changes.insert(
            key.to_string(),
            TimestampRecord {
                colresmode: mode,
                ..existing
            },
        );
        self.mark_dirty()
    }

    /// Forget `key`. Returns whether a record existed.
    pub fn remove_timestamp(&mut self, key: &str) -> Result<bool, LedgerError> {
        let buffered = self.changes.remove(key).is_some();
        let stored = self.data.files.remove(key).is_some();
        if buffered || stored {
            debug!(key, "removed ledger record");
            self.mark_dirty()?;
        }
        Ok(buffered || stored)
    }

    /// Every tracked record, buffered changes applied.
    pub fn entries(&self) -> BTreeMap<String, TimestampRecord> {
        let mut all = self.data.files.clone();
        all.extend(self.changes.iter().map(|(k, v)| (k.clone(), *v)));
        all
    }

    /// Stamp the sync time, merge buffered changes and write atomically.
    pub fn flush(&mut self) -> Result<(), LedgerError> {
        self.data.timestamp = Utc::now().timestamp_millis() as f64 / 1000.0;
        self.persist()
    }

    /// Merge buffered changes and write them without touching the sync
    /// time. Used for edits made outside a run.
    pub fn persist(&mut self) -> Result<(), LedgerError> {
        let merged = std::mem::take(&mut self.changes);
        let count = merged.len();
        self.data.files.extend(merged);
        self.write_document()?;
        self.unsaved = 0;
        info!(
            merged = count,
            files = self.data.files.len(),
            "flushed timestamp ledger"
        );
        Ok(())
    }

    fn mark_dirty(&mut self) -> Result<(), LedgerError> {
        self.unsaved += 1;
        if self.autosave && self.unsaved > AUTOSAVE_THRESHOLD {
            debug!(unsaved = self.unsaved, "ledger autosave");
            // Only a completed run may advance the sync time.
            self.persist()?;
        }
        Ok(())
    }

    fn write_document(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.data.serialize(&mut ser)?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(&buf)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| LedgerError::PersistFailed {
            path: path.clone(),
            detail: e.error.to_string(),
        })?;
        Ok(())
    }
}

impl Default for TimestampLedger {
    fn default() -> Self {
        Self::in_memory(DEFAULT_TOLERANCE_SECS)
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".lock");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db/timestamps.json");
        let ledger = TimestampLedger::open(&path, 5.0).unwrap();
        assert!(ledger.is_empty());
        assert_eq!(ledger.last_sync(), 0.0);

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"files\""));
        assert!(raw.contains("\n    \"timestamp\""));
    }

    #[test]
    fn test_save_respects_tolerance() {
        let mut ledger = TimestampLedger::in_memory(5.0);
        ledger
            .save_timestamp("a.txt", TimestampRecord::new(1000.0, 900.0), false)
            .unwrap();
        ledger
            .save_timestamp("a.txt", TimestampRecord::new(1003.0, 900.0), false)
            .unwrap();
        assert_eq!(ledger.record("a.txt").unwrap().mtime, 1000.0);

        ledger
            .save_timestamp("a.txt", TimestampRecord::new(1003.0, 900.0), true)
            .unwrap();
        assert_eq!(ledger.record("a.txt").unwrap().mtime, 1003.0);

        ledger
            .save_timestamp("a.txt", TimestampRecord::new(1010.0, 900.0), false)
            .unwrap();
        assert_eq!(ledger.record("a.txt").unwrap().mtime, 1010.0);
        assert_eq!(ledger.unsaved_changes(), 3);
    }

    #[test]
    fn test_zero_mtime_is_ignored() {
        let mut ledger = TimestampLedger::in_memory(5.0);
        ledger
            .save_timestamp("gone", TimestampRecord::default(), true)
            .unwrap();
        assert!(ledger.record("gone").is_none());
        assert_eq!(ledger.unsaved_changes(), 0);
    }

    #[test]
    fn test_get_timestamp_seeds_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f.txt");
        fs::write(&file, "x").unwrap();
        filetime::set_file_mtime(&file, filetime::FileTime::from_unix_time(1_600_000_000, 0))
            .unwrap();

        let mut ledger = TimestampLedger::in_memory(5.0);
        let record = ledger.get_timestamp("f.txt", &file).unwrap();
        assert_eq!(record.mtime, 1_600_000_000.0);
        assert_eq!(ledger.record("f.txt"), Some(record));

        let mut other = TimestampLedger::in_memory(5.0);
        assert!(other.lookup_or_seed("f.txt", &file).unwrap().is_none());
        assert!(other.record("f.txt").is_some());
    }

    #[test]
    fn test_resolution_mode_survives_timestamp_update() {
        let mut ledger = TimestampLedger::in_memory(5.0);
        ledger
            .save_timestamp("k", TimestampRecord::new(100.0, 100.0), false)
            .unwrap();
        ledger
            .set_resolution_mode("k", ResolutionMode::AutoLatest)
            .unwrap();
        ledger
            .save_timestamp("k", TimestampRecord::new(500.0, 100.0), false)
            .unwrap();
        assert_eq!(ledger.resolution_mode("k"), ResolutionMode::AutoLatest);
        assert_eq!(ledger.resolution_mode("unknown"), ResolutionMode::Manual);
    }

    #[test]
    fn test_flush_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timestamps.json");
        {
            let mut ledger = TimestampLedger::open(&path, 5.0).unwrap();
            ledger
                .save_timestamp("docs/a.txt", TimestampRecord::new(1234.5, 1000.0), false)
                .unwrap();
            ledger
                .set_resolution_mode("docs/a.txt", ResolutionMode::AutoLatest)
                .unwrap();
            ledger.flush().unwrap();
            assert_eq!(ledger.unsaved_changes(), 0);
        }
        let ledger = TimestampLedger::open(&path, 5.0).unwrap();
        let record = ledger.record("docs/a.txt").unwrap();
        assert_eq!(record.mtime, 1234.5);
        assert_eq!(record.colresmode, ResolutionMode::AutoLatest);
        assert!(ledger.last_sync() > 0.0);
    }

    #[test]
    fn test_remove_timestamp() {
        let mut ledger = TimestampLedger::in_memory(5.0);
        ledger
            .save_timestamp("x", TimestampRecord::new(10.0, 10.0), false)
            .unwrap();
        ledger.flush().unwrap();
        assert!(ledger.remove_timestamp("x").unwrap());
        assert!(!ledger.remove_timestamp("x").unwrap());
        assert!(ledger.record("x").is_none());
    }

    #[test]
    fn test_autosave_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timestamps.json");
        let mut ledger = TimestampLedger::open(&path, 5.0)
            .unwrap()
            .with_autosave(true);
        for i in 0..=AUTOSAVE_THRESHOLD {
            ledger
                .save_timestamp(&format!("f{i}"), TimestampRecord::new(100.0, 100.0), false)
                .unwrap();
        }
        assert_eq!(ledger.unsaved_changes(), 0);
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"f10\""));
        assert_eq!(ledger.last_sync(), 0.0);
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timestamps.json");
        let _first = TimestampLedger::open(&path, 5.0).unwrap();
        let second = TimestampLedger::open(&path, 5.0);
        assert!(matches!(second, Err(LedgerError::Locked(_))));
    }

    #[test]
    fn test_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timestamps.json");
        fs::write(&path, "{ not json").unwrap();
        let err = TimestampLedger::open(&path, 5.0).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { .. }));
    }

    #[test]
    fn test_float_resolution_mode_is_accepted() {
        let doc: LedgerDocument = serde_json::from_str(
            r#"{"timestamp": 5, "files": {"a": {"mtime": 1.0, "ctime": 1.0, "colresmode": 1.0}}}"#,
        )
        .unwrap();
        assert_eq!(doc.files["a"].colresmode, ResolutionMode::AutoLatest);
    }

    #[test]
    fn test_persist_keeps_sync_time() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("timestamps.json");
        let mut ledger = TimestampLedger::open(&path, 5.0).unwrap();
        ledger
            .save_timestamp("a", TimestampRecord::new(10.0, 10.0), true)
            .unwrap();
        ledger.persist().unwrap();
        assert_eq!(ledger.last_sync(), 0.0);
        assert_eq!(ledger.unsaved_changes(), 0);
        assert_eq!(ledger.entries().len(), 1);
    }
}
