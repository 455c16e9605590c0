//! One mirroring session: scan, resolve, pre-flight, execute.
//!
//! A [`SyncSession`] owns everything a run mutates (the ledger, the
//! cancellation flag and the running flag) so nothing is shared between
//! sessions. A run goes through these steps:
//!
//! 1. Diff every rule and merge the instructions in rule order.
//! 2. Resolve sync-mode collisions, one prompt at a time.
//! 3. Build the pre-run summary and check free space on the backup volume.
//! 4. Ask for confirmation, if requested.
//! 5. Execute, then flush the ledger.
//!
//! A run guard prevents two runs on the same session at once.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::config::MirrorConfig;
use crate::conflict::{CollisionResolver, DecisionSink};
use crate::diff::DiffEngine;
use crate::errors::{CoreError, SessionError};
use crate::executor::{volume_space, Executor};
use crate::instruction::InstructionSet;
use crate::ledger::TimestampLedger;
use crate::models::{PreRunSummary, RunOutcome, RunSummary};
use crate::path_map::PathMapper;
use crate::sinks::{ChangeLogSink, ErrorEvent, ProgressSink};

type VolumeProbe = dyn Fn(&Path) -> Result<(u64, u64), SessionError> + Send + Sync;

/// Toggles a front end passes to [`SyncSession::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOptions {
    /// Resolve every collision by latest modification without asking.
    pub auto_resolve: bool,
    /// Ask the decision sink to confirm before executing.
    pub confirm: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            auto_resolve: false,
            confirm: true,
        }
    }
}

/// Instructions planned for a run, before execution.
#[derive(Debug, Default)]
pub struct Plan {
    pub instructions: InstructionSet,
    pub errors: Vec<ErrorEvent>,
    pub files_scanned: usize,
}

/// Per-run context: configuration, ledger and cancellation state.
pub struct SyncSession {
    config: MirrorConfig,
    mapper: PathMapper,
    ledger: Mutex<TimestampLedger>,
    cancel: Arc<AtomicBool>,
    /// Atomic flag preventing concurrent runs.
    running: AtomicBool,
    volume: Box<VolumeProbe>,
}

impl SyncSession {
    /// Validate `config` and open its ledger (taking the ledger lock).
    pub fn open(config: MirrorConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let ledger = TimestampLedger::open(
            &config.general.ledger_path,
            config.general.tolerance_secs,
        )?
        .with_autosave(true);
        Ok(Self::with_ledger(config, ledger))
    }

    /// A session over an already opened ledger.
    pub fn with_ledger(config: MirrorConfig, ledger: TimestampLedger) -> Self {
        info!(
            backup_root = %config.general.backup_root.display(),
            rules = config.rules.len(),
            "initializing sync session"
        );
        let mapper = PathMapper::new(&config.general.backup_root, config.general.path_reduction);
        Self {
            config,
            mapper,
            ledger: Mutex::new(ledger),
            cancel: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
            volume: Box::new(volume_space),
        }
    }

    /// Replace the free-space query for the backup volume.
    pub fn with_volume_probe(
        mut self,
        probe: impl Fn(&Path) -> Result<(u64, u64), SessionError> + Send + Sync + 'static,
    ) -> Self {
        self.volume = Box::new(probe);
        self
    }

    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    pub fn ledger(&self) -> &Mutex<TimestampLedger> {
        &self.ledger
    }

    /// Shared flag that stops a run from issuing new instructions.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Planning
    // -----------------------------------------------------------------------

    /// Scan every rule and resolve collisions. Touches nothing on disk
    /// apart from seeding ledger records in memory.
    pub fn plan(
        &self,
        options: &RunOptions,
        progress: &dyn ProgressSink,
        decisions: &dyn DecisionSink,
    ) -> Result<Plan, SessionError> {
        let engine = DiffEngine::new(&self.mapper, &self.ledger, progress);
        let diffs = engine.diff_all(&self.config.rules)?;

        let mut plan = Plan::default();
        let mut collisions = Vec::new();
        for diff in diffs {
            plan.instructions.extend(diff.instructions);
            plan.errors.extend(diff.errors);
            collisions.extend(diff.collisions);
        }

        if !collisions.is_empty() {
            info!(count = collisions.len(), "resolving collisions");
            let resolver = CollisionResolver::new(engine.detector(), options.auto_resolve, decisions);
            for collision in &collisions {
                if let Some(change_type) = resolver.resolve(collision, &self.ledger)? {
                    plan.instructions.insert(collision.instruction(change_type)?);
                }
            }
        }

        plan.files_scanned = engine.files_scanned();
        info!(
            instructions = plan.instructions.len(),
            errors = plan.errors.len(),
            files = plan.files_scanned,
            "planning complete"
        );
        Ok(plan)
    }

    /// Pre-run summary for `set`, with the backup volume's free space.
    pub fn preflight(&self, set: &InstructionSet) -> Result<PreRunSummary, SessionError> {
        let (free, total) = (self.volume)(&self.config.general.backup_root)?;
        Ok(PreRunSummary::from_set(set).with_volume(free, total))
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one full run.
    ///
    /// Per-file problems never fail the run; they end up in the summary's
    /// error list. `Err` is returned only for conditions that stop the run
    /// as a whole.
    pub fn run(
        &self,
        options: &RunOptions,
        progress: &dyn ProgressSink,
        decisions: &dyn DecisionSink,
        log: &dyn ChangeLogSink,
    ) -> Result<RunOutcome, SessionError> {
        let _guard = RunGuard::acquire(&self.running)?;
        self.cancel.store(false, Ordering::SeqCst);

        let plan = self.plan(options, progress, decisions)?;
        for error in &plan.errors {
            log.error(error);
        }
        let scan_errors: Vec<String> = plan.errors.iter().map(ToString::to_string).collect();

        if self.cancel.load(Ordering::SeqCst) {
            warn!("run cancelled before execution");
            return Ok(RunOutcome::Cancelled(RunSummary {
                total: plan.instructions.len(),
                errors: scan_errors,
                ..Default::default()
            }));
        }

        let summary = self.preflight(&plan.instructions)?;
        progress.pre_run(&summary);
        info!(
            changes = summary.total,
            space_requirement = summary.space_requirement,
            free = ?summary.free_bytes,
            "pre-run summary"
        );

        if !summary.fits() {
            let required = summary.space_requirement.max(0) as u64;
            let available = summary.free_bytes.unwrap_or(0);
            warn!(required, available, "insufficient space on backup volume");
            return Ok(RunOutcome::InsufficientSpace {
                required,
                available,
            });
        }

        if options.confirm
            && !plan.instructions.is_empty()
            && !decisions.confirm_run(&summary, &plan.instructions)
        {
            info!("run declined before execution");
            return Ok(RunOutcome::Cancelled(RunSummary {
                total: plan.instructions.len(),
                errors: scan_errors,
                ..Default::default()
            }));
        }

        let execution = Executor::new(&self.ledger, progress, log, &self.cancel)
            .with_workers(self.config.general.workers)
            .execute(plan.instructions)?;
        self.ledger.lock().flush()?;

        let mut run_summary = execution.summary;
        let mut errors = scan_errors;
        errors.append(&mut run_summary.errors);
        run_summary.errors = errors;
        progress.run_finished(&run_summary);
        info!(summary = %run_summary, "run finished");

        Ok(if execution.cancelled {
            RunOutcome::Cancelled(run_summary)
        } else {
            RunOutcome::Success(run_summary)
        })
    }
}

/// Clears the running flag when dropped, including on panic.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, SessionError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| SessionError::AlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackupRule, GeneralConfig, Mode};
    use crate::conflict::SkipAll;
    use crate::sinks::{NullChangeLog, NullProgress};

    fn session(root: &Path) -> SyncSession {
        let mut general = GeneralConfig::new(root.join("bkp"));
        general.workers = 1;
        let rule = BackupRule::new(root.join("src").to_string_lossy(), Mode::Default);
        SyncSession::with_ledger(
            MirrorConfig::new(general, vec![rule]),
            TimestampLedger::in_memory(5.0),
        )
    }

    #[test]
    fn test_run_guard_rejects_second_run() {
        let flag = AtomicBool::new(false);
        let first = RunGuard::acquire(&flag).unwrap();
        assert!(matches!(
            RunGuard::acquire(&flag),
            Err(SessionError::AlreadyRunning)
        ));
        drop(first);
        assert!(RunGuard::acquire(&flag).is_ok());
    }

    #[test]
    fn test_empty_source_runs_clean() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        let session = session(dir.path());
        let outcome = session
            .run(&RunOptions::default(), &NullProgress, &SkipAll, &NullChangeLog)
            .unwrap();
        let summary = outcome.summary().unwrap();
        assert_eq!(summary.total, 0);
        assert!(summary.errors.is_empty());
        assert!(!session.is_running());
    }

    #[test]
    fn test_cancel_flag_is_shared() {
        let dir = tempfile::tempdir().unwrap();
        let session = session(dir.path());
        let flag = session.cancel_flag();
        session.cancel();
        assert!(flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_volume_probe_failure_aborts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.txt"), "a").unwrap();
        let session = session(dir.path()).with_volume_probe(|path| {
            Err(SessionError::FreeSpace {
                path: path.to_path_buf(),
                source: std::io::Error::other("no statfs"),
            })
        });
        let err = session
            .run(&RunOptions::default(), &NullProgress, &SkipAll, &NullChangeLog)
            .unwrap_err();
        assert!(matches!(err, SessionError::FreeSpace { .. }));
        assert!(!dir.path().join("bkp").exists());
    }
}
