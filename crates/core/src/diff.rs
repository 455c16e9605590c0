//! The three-mode diff.
//!
//! For every rule the engine scans the source tree and the rule's mirror in
//! the backup tree and emits the [`ChangeInstruction`]s that bring them into
//! the relationship the rule's [`Mode`] asks for:
//!
//! | Mode | Forward pass | Reverse pass |
//! |------|--------------|--------------|
//! | Default | create missing, update newer | none |
//! | Snapshot | create missing, update newer | remove backup entries without a source |
//! | Sync | per-path [`FileState`] on both sides, resolved against the ledger | |
//!
//! Rules are scanned in parallel. Nothing here touches the filesystem
//! beyond reading it; ledger records that are missing get seeded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::config::{BackupRule, Mode};
use crate::conflict::{Collision, CollisionDetector, Comparison};
use crate::errors::{InstructionError, SessionError};
use crate::ignore::IgnoreRules;
use crate::instruction::{ChangeInstruction, ChangeType};
use crate::ledger::TimestampLedger;
use crate::path_map::{relative_to, PathMapper};
use crate::scanner::{FileHandle, ScanNode, ScanOutcome, Scanner};
use crate::sinks::{ErrorEvent, ProgressSink};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Both sides of one sync-mode path.
#[derive(Debug, Clone, PartialEq)]
pub struct FileState {
    /// Backup-relative ledger key.
    pub key: String,
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
    pub source_exists: bool,
    pub backup_exists: bool,
    pub source_mtime: f64,
    pub source_ctime: f64,
    pub backup_mtime: f64,
    pub backup_ctime: f64,
}

impl FileState {
    pub fn new(key: impl Into<String>, source_path: PathBuf, backup_path: PathBuf) -> Self {
        Self {
            key: key.into(),
            source_path,
            backup_path,
            source_exists: false,
            backup_exists: false,
            source_mtime: 0.0,
            source_ctime: 0.0,
            backup_mtime: 0.0,
            backup_ctime: 0.0,
        }
    }

    fn set_source(&mut self, handle: &FileHandle) {
        self.source_exists = true;
        self.source_mtime = handle.modified;
        self.source_ctime = handle.created;
    }

    fn set_backup(&mut self, handle: &FileHandle) {
        self.backup_exists = true;
        self.backup_mtime = handle.modified;
        self.backup_ctime = handle.created;
    }

    /// Latest modification or creation time seen on either side.
    pub fn latest_change(&self) -> f64 {
        self.source_mtime
            .max(self.source_ctime)
            .max(self.backup_mtime)
            .max(self.backup_ctime)
    }

    pub fn collision(&self, last_sync: f64) -> Collision {
        Collision {
            key: self.key.clone(),
            source_path: self.source_path.clone(),
            backup_path: self.backup_path.clone(),
            source_mtime: self.source_mtime,
            backup_mtime: self.backup_mtime,
            last_sync,
        }
    }
}

/// Everything one rule produced.
#[derive(Debug, Default)]
pub struct RuleDiff {
    pub instructions: Vec<ChangeInstruction>,
    /// Sync-mode collisions awaiting resolution.
    pub collisions: Vec<Collision>,
    /// Recoverable scan problems and unavailable sources.
    pub errors: Vec<ErrorEvent>,
}

impl RuleDiff {
    fn push(
        &mut self,
        change_type: ChangeType,
        from: &Path,
        to: Option<&Path>,
        forced: bool,
        key: &str,
    ) -> Result<(), InstructionError> {
        let instruction =
            ChangeInstruction::new(change_type, from, to.map(Path::to_path_buf), forced)?
                .with_ledger_key(key);
        debug!(instruction = %instruction, "queued");
        self.instructions.push(instruction);
        Ok(())
    }

    fn absorb<T>(&mut self, outcome: ScanOutcome<T>) -> T {
        self.errors.extend(
            outcome
                .errors
                .iter()
                .map(|e| ErrorEvent::new(e.path(), e.to_string())),
        );
        outcome.result
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Produces instructions for a set of rules.
pub struct DiffEngine<'a> {
    mapper: &'a PathMapper,
    ledger: &'a Mutex<TimestampLedger>,
    detector: CollisionDetector,
    tolerance: f64,
    scanner: Scanner<'a>,
}

/// Source and backup locations of one rule.
struct RuleRoots {
    source: PathBuf,
    backup: PathBuf,
    source_ignore: IgnoreRules,
    backup_ignore: IgnoreRules,
}

impl<'a> DiffEngine<'a> {
    pub fn new(
        mapper: &'a PathMapper,
        ledger: &'a Mutex<TimestampLedger>,
        progress: &'a dyn ProgressSink,
    ) -> Self {
        let (tolerance, last_sync) = {
            let ledger = ledger.lock();
            (ledger.tolerance(), ledger.last_sync())
        };
        Self {
            mapper,
            ledger,
            detector: CollisionDetector::new(tolerance, last_sync),
            tolerance,
            scanner: Scanner::new(progress),
        }
    }

    pub fn detector(&self) -> CollisionDetector {
        self.detector
    }

    /// Files seen by every scan so far.
    pub fn files_scanned(&self) -> usize {
        self.scanner.files_found()
    }

    /// Diff every rule in parallel. Results keep the order of `rules`.
    pub fn diff_all(&self, rules: &[BackupRule]) -> Result<Vec<RuleDiff>, SessionError> {
        rules.par_iter().map(|rule| self.diff_rule(rule)).collect()
    }

    /// Diff a single rule.
    pub fn diff_rule(&self, rule: &BackupRule) -> Result<RuleDiff, SessionError> {
        info!(rule = %rule.path, mode = %rule.mode, "scanning rule");
        let roots = RuleRoots {
            source: PathBuf::from(&rule.path),
            backup: PathBuf::from(self.mapper.rule_backup_root(rule)),
            source_ignore: IgnoreRules::new(&rule.path, &rule.ignored_paths),
            backup_ignore: IgnoreRules::new(self.mapper.rule_backup_root(rule), &rule.ignored_paths),
        };
        let source_present = roots.source.exists();
        let mut diff = RuleDiff::default();

        match rule.mode {
            Mode::Default | Mode::Snapshot => {
                if source_present {
                    self.forward_pass(rule, &roots, &mut diff)?;
                } else if rule.mode == Mode::Default {
                    warn!(rule = %rule.path, "backup source is unavailable");
                    diff.errors.push(ErrorEvent::new(
                        &roots.source,
                        "backup source is unavailable",
                    ));
                }
                if rule.mode == Mode::Snapshot {
                    self.reverse_pass(rule, &roots, source_present, &mut diff)?;
                }
            }
            Mode::Sync => {
                if source_present {
                    self.sync_pass(rule, &roots, &mut diff)?;
                } else {
                    warn!(rule = %rule.path, "sync source is unavailable, rule skipped");
                    diff.errors.push(ErrorEvent::new(
                        &roots.source,
                        "sync source is unavailable",
                    ));
                }
            }
        }

        info!(
            rule = %rule.path,
            instructions = diff.instructions.len(),
            collisions = diff.collisions.len(),
            errors = diff.errors.len(),
            "rule scanned"
        );
        Ok(diff)
    }

    // -----------------------------------------------------------------------
    // Default / Snapshot
    // -----------------------------------------------------------------------

    /// Create what the backup lacks, update what the source changed.
    fn forward_pass(
        &self,
        rule: &BackupRule,
        roots: &RuleRoots,
        diff: &mut RuleDiff,
    ) -> Result<(), SessionError> {
        let sources =
            diff.absorb(self.scanner.list_files_recursive(&roots.source, &roots.source_ignore));
        let backup_tree = diff.absorb(self.scanner.scan_tree(&roots.backup, &roots.backup_ignore));

        for file in sources {
            let backup = self.mapper.to_backup_path(&file.path.to_string_lossy(), rule);
            let key = self.mapper.backup_key(&backup);
            let rel = self.mapper.rule_relative(&backup, rule).unwrap_or_default();
            let backup_path = PathBuf::from(&backup);

            if find_file(backup_tree.as_ref(), &rel).is_some() {
                let record = self.ledger.lock().get_timestamp(&key, &backup_path)?;
                if file.modified > record.mtime + self.tolerance || rule.force_backup {
                    diff.push(
                        ChangeType::UpdateForward,
                        &file.path,
                        Some(backup_path.as_path()),
                        rule.force_backup,
                        &key,
                    )?;
                }
            } else {
                diff.push(ChangeType::Create, &file.path, Some(backup_path.as_path()), false, &key)?;
            }
        }
        Ok(())
    }

    /// Remove backup entries that have no source counterpart.
    fn reverse_pass(
        &self,
        rule: &BackupRule,
        roots: &RuleRoots,
        source_present: bool,
        diff: &mut RuleDiff,
    ) -> Result<(), SessionError> {
        let backup_meta = match std::fs::metadata(&roots.backup) {
            Ok(meta) => meta,
            Err(_) => return Ok(()),
        };
        let source_tree = if source_present {
            diff.absorb(self.scanner.scan_tree(&roots.source, &roots.source_ignore))
        } else {
            info!(rule = %rule.path, "source missing, removing its whole mirror");
            None
        };

        let entries =
            diff.absorb(self.scanner.list_entries_recursive(&roots.backup, &roots.backup_ignore));
        for entry in entries {
            let backup = entry.path.to_string_lossy();
            let source = self.mapper.to_source_path(&backup, rule);
            let rel = relative_to(&source, &rule.path).unwrap_or_default();
            if !has_counterpart(source_tree.as_ref(), &rel, entry.is_dir) {
                let change_type = if entry.is_dir {
                    ChangeType::RemoveFolder
                } else {
                    ChangeType::Remove
                };
                let key = self.mapper.backup_key(&backup);
                diff.push(change_type, &entry.path, None, false, &key)?;
            }
        }

        if !source_present {
            let change_type = if backup_meta.is_dir() {
                ChangeType::RemoveFolder
            } else {
                ChangeType::Remove
            };
            let key = self.mapper.backup_key(&roots.backup.to_string_lossy());
            diff.push(change_type, &roots.backup, None, false, &key)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Sync
    // -----------------------------------------------------------------------

    fn sync_pass(
        &self,
        rule: &BackupRule,
        roots: &RuleRoots,
        diff: &mut RuleDiff,
    ) -> Result<(), SessionError> {
        let mut states: BTreeMap<String, FileState> = BTreeMap::new();

        let sources =
            diff.absorb(self.scanner.list_files_recursive(&roots.source, &roots.source_ignore));
        let backup_tree = diff.absorb(self.scanner.scan_tree(&roots.backup, &roots.backup_ignore));
        for file in &sources {
            let backup = self.mapper.to_backup_path(&file.path.to_string_lossy(), rule);
            let key = self.mapper.backup_key(&backup);
            let rel = self.mapper.rule_relative(&backup, rule).unwrap_or_default();
            let state = states.entry(key.clone()).or_insert_with(|| {
                FileState::new(key, file.path.clone(), PathBuf::from(&backup))
            });
            state.set_source(file);
            if let Some(handle) = find_file(backup_tree.as_ref(), &rel) {
                state.set_backup(handle);
            }
        }

        if roots.backup.exists() {
            let backups =
                diff.absorb(self.scanner.list_files_recursive(&roots.backup, &roots.backup_ignore));
            let source_tree =
                diff.absorb(self.scanner.scan_tree(&roots.source, &roots.source_ignore));
            for file in &backups {
                let backup = file.path.to_string_lossy();
                let key = self.mapper.backup_key(&backup);
                let source = self.mapper.to_source_path(&backup, rule);
                let rel = relative_to(&source, &rule.path).unwrap_or_default();
                let state = states.entry(key.clone()).or_insert_with(|| {
                    FileState::new(key, PathBuf::from(&source), file.path.clone())
                });
                state.set_backup(file);
                if let Some(handle) = find_file(source_tree.as_ref(), &rel) {
                    state.set_source(handle);
                }
            }
        }

        debug!(rule = %rule.path, paths = states.len(), "sync states built");
        for state in states.values() {
            self.decide(state, diff)?;
        }
        Ok(())
    }

    /// Turn one [`FileState`] into an instruction, a collision, or nothing.
    fn decide(&self, state: &FileState, diff: &mut RuleDiff) -> Result<(), SessionError> {
        if state.source_exists != state.backup_exists {
            // Not seeded: a record taken now would read as "deleted" later.
            let record = self.ledger.lock().record(&state.key);
            let snapshot = record.map(|r| r.latest_change()).unwrap_or(0.0);
            let appeared = snapshot == 0.0 || snapshot < state.latest_change();
            debug!(
                key = %state.key,
                snapshot,
                latest = state.latest_change(),
                appeared,
                "one-sided path"
            );
            match (appeared, state.source_exists) {
                (true, true) => diff.push(
                    ChangeType::Create,
                    &state.source_path,
                    Some(state.backup_path.as_path()),
                    false,
                    &state.key,
                )?,
                (true, false) => diff.push(
                    ChangeType::CreateBackward,
                    &state.backup_path,
                    Some(state.source_path.as_path()),
                    false,
                    &state.key,
                )?,
                (false, true) => {
                    diff.push(ChangeType::Remove, &state.source_path, None, false, &state.key)?
                }
                (false, false) => {
                    diff.push(ChangeType::Remove, &state.backup_path, None, false, &state.key)?
                }
            }
            return Ok(());
        }

        if !state.source_exists {
            return Ok(());
        }
        self.ledger
            .lock()
            .lookup_or_seed(&state.key, &state.backup_path)?;
        match self.detector.compare(state.source_mtime, state.backup_mtime) {
            Comparison::InSync => {}
            Comparison::SourceNewer => diff.push(
                ChangeType::UpdateForward,
                &state.source_path,
                Some(state.backup_path.as_path()),
                false,
                &state.key,
            )?,
            Comparison::BackupNewer => diff.push(
                ChangeType::UpdateBackward,
                &state.backup_path,
                Some(state.source_path.as_path()),
                false,
                &state.key,
            )?,
            Comparison::Collision => {
                info!(key = %state.key, "collision detected");
                diff.collisions
                    .push(state.collision(self.detector.last_sync()));
            }
        }
        Ok(())
    }
}

/// The file at `rel` inside a scan result.
fn find_file<'t>(tree: Option<&'t ScanNode>, rel: &str) -> Option<&'t FileHandle> {
    match tree? {
        ScanNode::File(handle) if rel.is_empty() => Some(handle),
        ScanNode::File(_) => None,
        ScanNode::Dir(tree) => match tree.lookup(rel)? {
            ScanNode::File(handle) => Some(handle),
            ScanNode::Dir(_) => None,
        },
    }
}

/// Whether a node of the same kind exists at `rel`.
fn has_counterpart(tree: Option<&ScanNode>, rel: &str, is_dir: bool) -> bool {
    let Some(root) = tree else {
        return false;
    };
    let node = if rel.is_empty() {
        Some(root)
    } else {
        match root {
            ScanNode::Dir(tree) => tree.lookup(rel),
            ScanNode::File(_) => None,
        }
    };
    matches!(
        (node, is_dir),
        (Some(ScanNode::Dir(_)), true) | (Some(ScanNode::File(_)), false)
    )
}
