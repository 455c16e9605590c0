//! Applies an [`InstructionSet`] to disk.
//!
//! Work runs on a bounded rayon pool in three phases: copies, then file
//! removals, then folder removals (deepest first, one at a time) so a folder
//! emptied earlier in the run can be removed. A failing instruction is
//! logged and counted and never stops the batch. The cancellation flag is
//! checked before each instruction; whatever is in flight finishes.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use filetime::FileTime;
use parking_lot::Mutex;
use rayon::prelude::*;
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use crate::errors::{ExecuteError, InstructionError, SessionError};
use crate::instruction::{ChangeInstruction, ChangeType, InstructionSet};
use crate::ledger::TimestampLedger;
use crate::models::RunSummary;
use crate::sinks::{ChangeEvent, ChangeLogSink, ErrorEvent, ProgressSink};

const COPY_BUF_SIZE: usize = 1024 * 1024;

/// Side effects of one successfully applied instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Applied {
    pub bytes: u64,
    pub folder_created: bool,
    pub renamed: bool,
}

/// Result of executing a whole set.
#[derive(Debug, Clone, Default)]
pub struct Execution {
    pub summary: RunSummary,
    pub cancelled: bool,
}

pub struct Executor<'a> {
    ledger: &'a Mutex<TimestampLedger>,
    progress: &'a dyn ProgressSink,
    log: &'a dyn ChangeLogSink,
    cancel: &'a AtomicBool,
    workers: usize,
}

impl<'a> Executor<'a> {
    pub fn new(
        ledger: &'a Mutex<TimestampLedger>,
        progress: &'a dyn ProgressSink,
        log: &'a dyn ChangeLogSink,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            ledger,
            progress,
            log,
            cancel,
            workers: 4,
        }
    }

    /// Size of the worker pool; 0 uses one thread per CPU.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Execute every instruction in `set`.
    pub fn execute(&self, set: InstructionSet) -> Result<Execution, SessionError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("dirmirror-worker-{i}"))
            .build()
            .map_err(|e| SessionError::WorkerPool(e.to_string()))?;

        let tally = Mutex::new(RunSummary {
            total: set.len(),
            ..Default::default()
        });
        let (copies, removals): (Vec<_>, Vec<_>) = set
            .into_vec()
            .into_iter()
            .partition(|i| i.change_type().is_copy());
        let (mut folders, files): (Vec<_>, Vec<_>) = removals
            .into_iter()
            .partition(|i| i.change_type() == ChangeType::RemoveFolder);
        folders.sort_by_key(|i| std::cmp::Reverse(i.source().components().count()));

        info!(
            copies = copies.len(),
            removals = files.len(),
            folder_removals = folders.len(),
            workers = self.workers,
            "executing instructions"
        );

        pool.install(|| {
            copies.par_iter().for_each(|i| self.run_one(i, &tally));
            files.par_iter().for_each(|i| self.run_one(i, &tally));
        });
        for instruction in &folders {
            self.run_one(instruction, &tally);
        }

        let cancelled = self.cancel.load(Ordering::SeqCst);
        let summary = tally.into_inner();
        if cancelled {
            warn!(done = summary.done(), total = summary.total, "execution cancelled");
        } else {
            info!(
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                "execution finished"
            );
        }
        Ok(Execution { summary, cancelled })
    }

    fn run_one(&self, instruction: &ChangeInstruction, tally: &Mutex<RunSummary>) {
        if self.cancel.load(Ordering::SeqCst) {
            return;
        }
        self.progress.file_started(instruction);

        let ok = match self.apply(instruction) {
            Ok(applied) => {
                {
                    let mut t = tally.lock();
                    t.succeeded += 1;
                    t.bytes_done += applied.bytes;
                    t.folders_created += usize::from(applied.folder_created);
                    t.renamed += usize::from(applied.renamed);
                }
                self.log.change(&ChangeEvent::applied(instruction));
                true
            }
            Err(ExecuteError::NotFound(path)) => {
                warn!(path = %path.display(), instruction = %instruction, "path vanished, skipped");
                tally.lock().skipped += 1;
                true
            }
            Err(e) => {
                if e.is_logic_error() {
                    error!(instruction = %instruction, error = %e, "instruction is inconsistent");
                } else {
                    warn!(instruction = %instruction, error = %e, "instruction failed");
                }
                let event = ErrorEvent::new(
                    instruction.source(),
                    format!("failed to {}: {}", instruction.change_type(), e),
                );
                self.log.error(&event);
                let mut t = tally.lock();
                t.failed += 1;
                t.errors.push(event.to_string());
                false
            }
        };
        self.progress.file_finished(instruction, ok);
    }

    /// Apply a single instruction.
    pub fn apply(&self, instruction: &ChangeInstruction) -> Result<Applied, ExecuteError> {
        instruction.validate()?;
        match instruction.change_type() {
            ChangeType::UpdateForward
            | ChangeType::UpdateBackward
            | ChangeType::Create
            | ChangeType::CreateBackward => self.copy(instruction),
            ChangeType::Remove | ChangeType::RemoveFolder => self.remove(instruction),
            ChangeType::Folder | ChangeType::Rename => Err(InstructionError::NotExecutable(
                instruction.change_type().label().to_string(),
            )
            .into()),
        }
    }

    // -----------------------------------------------------------------------
    // Copies
    // -----------------------------------------------------------------------

    fn copy(&self, instruction: &ChangeInstruction) -> Result<Applied, ExecuteError> {
        let source = instruction.source();
        let target = instruction
            .target()
            .ok_or_else(|| InstructionError::MissingTarget {
                change_type: instruction.change_type().label().to_string(),
                source_path: source.to_path_buf(),
            })?;
        let mut applied = Applied {
            bytes: instruction.diff_size(),
            ..Default::default()
        };

        if let Some(parent) = target.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| ExecuteError::io(parent, e))?;
                info!(dir = %parent.display(), "created folder");
                self.log.change(&ChangeEvent::folder_created(parent));
                applied.folder_created = true;
            }
        }

        if is_same_file(source, target) {
            return Err(ExecuteError::SameFile(target.to_path_buf()));
        }

        let copied = copy_with_progress(source, target, |done, total| {
            self.progress.copy_progress(target, done, total)
        })?;
        debug!(
            source = %source.display(),
            target = %target.display(),
            bytes = copied,
            "copied"
        );

        if instruction.change_type().is_copy() {
            applied.renamed = self.match_case(source, target)?;
        }

        if let Some(key) = instruction.ledger_key() {
            let backup_side = if instruction.change_type().is_backward() {
                source
            } else {
                target
            };
            self.ledger.lock().save_from_disk(key, backup_side, false)?;
        }
        Ok(applied)
    }

    /// Rename `target` when its on-disk name differs from the source name
    /// only by case.
    fn match_case(&self, source: &Path, target: &Path) -> Result<bool, ExecuteError> {
        let (Some(wanted), Some(parent)) = (source.file_name(), target.parent()) else {
            return Ok(false);
        };
        let Some(actual) = on_disk_name(target) else {
            return Ok(false);
        };
        if actual == wanted
            || actual.to_string_lossy().to_lowercase() != wanted.to_string_lossy().to_lowercase()
        {
            return Ok(false);
        }

        let from = parent.join(&actual);
        let to = parent.join(wanted);
        fs::rename(&from, &to).map_err(|e| ExecuteError::io(&from, e))?;
        info!(from = %from.display(), to = %to.display(), "renamed to match source case");
        self.log.change(&ChangeEvent::renamed(&from, &to));
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Removals
    // -----------------------------------------------------------------------

    fn remove(&self, instruction: &ChangeInstruction) -> Result<Applied, ExecuteError> {
        let path = instruction.source();
        let result = fs::symlink_metadata(path).and_then(|meta| {
            if meta.is_dir() {
                fs::remove_dir(path)
            } else {
                fs::remove_file(path)
            }
        });

        let vanished = matches!(&result, Err(e) if e.kind() == ErrorKind::NotFound);
        if result.is_ok() || vanished {
            if let Some(key) = instruction.ledger_key() {
                self.ledger.lock().remove_timestamp(key)?;
            }
        }
        result.map_err(|e| ExecuteError::io(path, e))?;

        info!(path = %path.display(), kind = %instruction.change_type(), "removed");
        Ok(Applied {
            bytes: instruction.diff_size(),
            ..Default::default()
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Copy content, permissions and times from `source` to `target`,
/// reporting bytes written so far.
pub fn copy_with_progress(
    source: &Path,
    target: &Path,
    mut progress: impl FnMut(u64, u64),
) -> Result<u64, ExecuteError> {
    let meta = fs::metadata(source).map_err(|e| ExecuteError::io(source, e))?;
    let total = meta.len();
    let mut reader = File::open(source).map_err(|e| ExecuteError::io(source, e))?;

    // Written next to the target and renamed over it once complete, so a
    // failed copy leaves the existing target untouched.
    let dir = match target.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(dir).map_err(|e| ExecuteError::io(dir, e))?;

    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut copied: u64 = 0;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(ExecuteError::io(source, e)),
        };
        staged
            .write_all(&buf[..n])
            .map_err(|e| ExecuteError::io(target, e))?;
        copied += n as u64;
        progress(copied, total);
    }
    staged.flush().map_err(|e| ExecuteError::io(target, e))?;

    fs::set_permissions(staged.path(), meta.permissions())
        .map_err(|e| ExecuteError::io(target, e))?;
    filetime::set_file_times(
        staged.path(),
        FileTime::from_last_access_time(&meta),
        FileTime::from_last_modification_time(&meta),
    )
    .map_err(|e| ExecuteError::io(target, e))?;

    make_writable(target);
    staged
        .persist(target)
        .map_err(|e| ExecuteError::io(target, e.error))?;
    Ok(copied)
}

/// Clear the read-only bit on an existing target so it can be replaced.
fn make_writable(path: &Path) {
    if let Ok(meta) = fs::metadata(path) {
        let mut perms = meta.permissions();
        if perms.readonly() {
            #[allow(clippy::permissions_set_readonly_false)]
            perms.set_readonly(false);
            let _ = fs::set_permissions(path, perms);
        }
    }
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// The name `path` has in its directory listing. An exact match wins; a
/// case-insensitive match is returned otherwise.
fn on_disk_name(path: &Path) -> Option<OsString> {
    let parent = path.parent()?;
    let name = path.file_name()?;
    let wanted = name.to_string_lossy().to_lowercase();
    let mut candidate = None;
    for entry in fs::read_dir(parent).ok()?.flatten() {
        let entry_name = entry.file_name();
        if entry_name == name {
            return Some(entry_name);
        }
        if entry_name.to_string_lossy().to_lowercase() == wanted {
            candidate = Some(entry_name);
        }
    }
    candidate
}

/// Free and total bytes of the volume holding `path`, or of its nearest
/// existing ancestor.
pub fn volume_space(path: &Path) -> Result<(u64, u64), SessionError> {
    let mut probe: PathBuf = path.to_path_buf();
    while !probe.exists() {
        match probe.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => probe = parent.to_path_buf(),
            _ => {
                probe = PathBuf::from(".");
                break;
            }
        }
    }
    let free = fs2::available_space(&probe).map_err(|source| SessionError::FreeSpace {
        path: probe.clone(),
        source,
    })?;
    let total = fs2::total_space(&probe).map_err(|source| SessionError::FreeSpace {
        path: probe.clone(),
        source,
    })?;
    Ok((free, total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sinks::{NullChangeLog, NullProgress};
    use filetime::set_file_mtime;

    fn write(path: &Path, body: &str, mtime: i64) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
        set_file_mtime(path, FileTime::from_unix_time(mtime, 0)).unwrap();
    }

    fn run(set: InstructionSet, ledger: &Mutex<TimestampLedger>) -> Execution {
        let cancel = AtomicBool::new(false);
        Executor::new(ledger, &NullProgress, &NullChangeLog, &cancel)
            .with_workers(2)
            .execute(set)
            .unwrap()
    }

    #[test]
    fn test_copy_preserves_mtime_and_creates_folders() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src/a.txt");
        let dst = dir.path().join("bkp/deep/er/a.txt");
        write(&src, "hello", 1_600_000_000);

        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        let mut set = InstructionSet::new();
        set.insert(
            ChangeInstruction::new(ChangeType::Create, &src, Some(dst.clone()), false)
                .unwrap()
                .with_ledger_key("deep/er/a.txt"),
        );
        let exec = run(set, &ledger);

        assert_eq!(exec.summary.succeeded, 1);
        assert_eq!(exec.summary.folders_created, 1);
        assert_eq!(exec.summary.bytes_done, 5);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "hello");
        let mtime = FileTime::from_last_modification_time(&fs::metadata(&dst).unwrap());
        assert_eq!(mtime.unix_seconds(), 1_600_000_000);
        assert_eq!(
            ledger.lock().record("deep/er/a.txt").unwrap().mtime,
            1_600_000_000.0
        );
    }

    #[test]
    fn test_failure_does_not_stop_batch() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.txt");
        write(&good, "g", 1_600_000_000);
        // A directory cannot be opened as a file to copy from.
        let bad = dir.path().join("bad");
        fs::create_dir_all(&bad).unwrap();

        let mut set = InstructionSet::new();
        set.add(
            ChangeType::Create,
            &good,
            Some(dir.path().join("out/good.txt")),
            false,
        )
        .unwrap();
        set.add(
            ChangeType::Create,
            &bad,
            Some(dir.path().join("out/bad.txt")),
            false,
        )
        .unwrap();

        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        let exec = run(set, &ledger);
        assert_eq!(exec.summary.total, 2);
        assert_eq!(exec.summary.succeeded, 1);
        assert_eq!(exec.summary.failed, 1);
        assert_eq!(exec.summary.errors.len(), 1);
        assert!(dir.path().join("out/good.txt").exists());
    }

    #[test]
    fn test_missing_source_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut set = InstructionSet::new();
        set.add(
            ChangeType::Create,
            dir.path().join("gone.txt"),
            Some(dir.path().join("out.txt")),
            false,
        )
        .unwrap();
        set.add(ChangeType::Remove, dir.path().join("also_gone"), None, false)
            .unwrap();

        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        let exec = run(set, &ledger);
        assert_eq!(exec.summary.skipped, 2);
        assert_eq!(exec.summary.failed, 0);
    }

    #[test]
    fn test_folder_removal_after_children() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("old");
        write(&root.join("sub/f.txt"), "f", 1_600_000_000);
        write(&root.join("g.txt"), "g", 1_600_000_000);

        let mut set = InstructionSet::new();
        // Deliberately parents first.
        set.add(ChangeType::RemoveFolder, &root, None, false).unwrap();
        set.add(ChangeType::RemoveFolder, root.join("sub"), None, false)
            .unwrap();
        set.add(ChangeType::Remove, root.join("sub/f.txt"), None, false)
            .unwrap();
        set.add(ChangeType::Remove, root.join("g.txt"), None, false)
            .unwrap();

        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        let exec = run(set, &ledger);
        assert_eq!(exec.summary.succeeded, 4);
        assert!(!root.exists());
    }

    #[test]
    fn test_remove_drops_ledger_record() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("x.txt");
        write(&file, "x", 1_600_000_000);

        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        ledger.lock().save_from_disk("x.txt", &file, true).unwrap();

        let mut set = InstructionSet::new();
        set.insert(
            ChangeInstruction::new(ChangeType::Remove, &file, None, false)
                .unwrap()
                .with_ledger_key("x.txt"),
        );
        run(set, &ledger);
        assert!(!file.exists());
        assert!(ledger.lock().record("x.txt").is_none());
    }

    #[test]
    fn test_cancel_stops_new_instructions() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a.txt");
        write(&src, "a", 1_600_000_000);
        let mut set = InstructionSet::new();
        set.add(ChangeType::Create, &src, Some(dir.path().join("b.txt")), false)
            .unwrap();

        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        let cancel = AtomicBool::new(true);
        let exec = Executor::new(&ledger, &NullProgress, &NullChangeLog, &cancel)
            .execute(set)
            .unwrap();
        assert!(exec.cancelled);
        assert_eq!(exec.summary.done(), 0);
        assert!(!dir.path().join("b.txt").exists());
    }

    #[test]
    fn test_same_file_is_logic_error() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("same.txt");
        write(&file, "s", 1_600_000_000);
        let inst =
            ChangeInstruction::new(ChangeType::UpdateForward, &file, Some(file.clone()), false)
                .unwrap();

        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        let cancel = AtomicBool::new(false);
        let exec = Executor::new(&ledger, &NullProgress, &NullChangeLog, &cancel);
        let err = exec.apply(&inst).unwrap_err();
        assert!(err.is_logic_error());
        assert_eq!(fs::read_to_string(&file).unwrap(), "s");
    }

    #[test]
    fn test_malformed_instruction_is_logic_error() {
        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        let cancel = AtomicBool::new(false);
        let exec = Executor::new(&ledger, &NullProgress, &NullChangeLog, &cancel);

        let folder = ChangeInstruction::unchecked(ChangeType::Folder, "/bkp/dir", None);
        let err = exec.apply(&folder).unwrap_err();
        assert!(err.is_logic_error());
        assert!(matches!(
            err,
            ExecuteError::Instruction(InstructionError::NotExecutable(_))
        ));

        let no_target = ChangeInstruction::unchecked(ChangeType::Create, "/src/a.txt", None);
        let err = exec.apply(&no_target).unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::Instruction(InstructionError::MissingTarget { .. })
        ));

        let mut set = InstructionSet::new();
        set.insert(folder);
        let summary = run(set, &ledger).summary;
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 0);
    }

    #[test]
    fn test_failed_copy_keeps_existing_target() {
        let dir = tempfile::tempdir().unwrap();
        // Reading a directory fails after the copy has started.
        let unreadable = dir.path().join("src/unreadable");
        fs::create_dir_all(&unreadable).unwrap();
        let target = dir.path().join("bkp/precious.txt");
        write(&target, "precious", 1_600_000_000);

        let result = copy_with_progress(&unreadable, &target, |_, _| {});
        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&target).unwrap(), "precious");
        let leftovers = fs::read_dir(dir.path().join("bkp")).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_on_disk_name_prefers_exact_match() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("Report.txt");
        write(&file, "r", 1_600_000_000);
        assert_eq!(on_disk_name(&file), Some(OsString::from("Report.txt")));
        assert_eq!(on_disk_name(&dir.path().join("missing.txt")), None);
    }

    #[test]
    fn test_volume_space_walks_up_to_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (free, total) = volume_space(&dir.path().join("not/yet/created")).unwrap();
        assert!(total >= free);
        assert!(total > 0);
    }
}
