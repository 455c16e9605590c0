//! Collision resolution.
//!
//! A collision is resolved automatically (latest modification wins) when
//! auto-resolve is on globally or the path's ledger record says
//! [`ResolutionMode::AutoLatest`]. Otherwise a [`DecisionSink`] is asked,
//! one collision at a time.

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::conflict::detector::{Collision, CollisionDetector, Comparison};
use crate::errors::LedgerError;
use crate::instruction::{ChangeType, InstructionSet};
use crate::ledger::{ResolutionMode, TimestampLedger};
use crate::models::PreRunSummary;

/// The four answers a user can give to a collision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Copy source over backup.
    KeepSource,
    /// Copy backup over source.
    KeepBackup,
    /// Leave both sides alone this run.
    Skip,
    /// Resolve by latest modification now and on every later run.
    KeepSourceAndRemember,
}

impl Decision {
    pub const ALL: [Decision; 4] = [
        Self::KeepSource,
        Self::KeepBackup,
        Self::Skip,
        Self::KeepSourceAndRemember,
    ];

    /// Menu text for this choice.
    pub fn label(self) -> &'static str {
        match self {
            Self::KeepSource => "Keep source",
            Self::KeepBackup => "Keep backup",
            Self::Skip => "Skip",
            Self::KeepSourceAndRemember => "Always update this file to the latest version",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Answers collisions that are not resolved automatically.
///
/// Calls are serialized; an implementation never sees two at once.
pub trait DecisionSink: Send + Sync {
    fn decide(&self, collision: &Collision) -> Decision;

    /// Whether to go ahead with the planned changes. Asked once per run,
    /// after the pre-run summary and before anything is touched.
    fn confirm_run(&self, _summary: &PreRunSummary, _instructions: &InstructionSet) -> bool {
        true
    }
}

/// Skips every collision. Used when nobody can be asked.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkipAll;

impl DecisionSink for SkipAll {
    fn decide(&self, _collision: &Collision) -> Decision {
        Decision::Skip
    }
}

/// Turns collisions into change types.
pub struct CollisionResolver<'a> {
    detector: CollisionDetector,
    auto_resolve: bool,
    sink: &'a dyn DecisionSink,
    prompt: Mutex<()>,
}

impl<'a> CollisionResolver<'a> {
    pub fn new(detector: CollisionDetector, auto_resolve: bool, sink: &'a dyn DecisionSink) -> Self {
        Self {
            detector,
            auto_resolve,
            sink,
            prompt: Mutex::new(()),
        }
    }

    /// Resolve one collision. `None` means no instruction.
    ///
    /// The ledger lock is not held while the decision sink is waiting.
    pub fn resolve(
        &self,
        collision: &Collision,
        ledger: &Mutex<TimestampLedger>,
    ) -> Result<Option<ChangeType>, LedgerError> {
        let mode = ledger.lock().resolution_mode(&collision.key);
        if self.auto_resolve || mode == ResolutionMode::AutoLatest {
            let resolved = self.latest(collision);
            info!(
                key = %collision.key,
                mode = %mode,
                resolved = ?resolved,
                "collision auto-resolved by latest modification"
            );
            return Ok(resolved);
        }

        let decision = {
            let _prompt = self.prompt.lock();
            self.sink.decide(collision)
        };
        debug!(key = %collision.key, decision = ?decision, "collision decision received");

        let resolved = match decision {
            Decision::KeepSource => Some(ChangeType::UpdateForward),
            Decision::KeepBackup => Some(ChangeType::UpdateBackward),
            Decision::Skip => None,
            Decision::KeepSourceAndRemember => {
                ledger
                    .lock()
                    .set_resolution_mode(&collision.key, ResolutionMode::AutoLatest)?;
                Some(ChangeType::UpdateForward)
            }
        };
        info!(key = %collision.key, decision = %decision, "collision resolved");
        Ok(resolved)
    }

    fn latest(&self, collision: &Collision) -> Option<ChangeType> {
        match self
            .detector
            .latest_wins(collision.source_mtime, collision.backup_mtime)
        {
            Comparison::SourceNewer => Some(ChangeType::UpdateForward),
            Comparison::BackupNewer => Some(ChangeType::UpdateBackward),
            Comparison::InSync | Comparison::Collision => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        answer: Decision,
        asked: AtomicUsize,
    }

    impl Scripted {
        fn new(answer: Decision) -> Self {
            Self {
                answer,
                asked: AtomicUsize::new(0),
            }
        }
    }

    impl DecisionSink for Scripted {
        fn decide(&self, _collision: &Collision) -> Decision {
            self.asked.fetch_add(1, Ordering::SeqCst);
            self.answer
        }
    }

    fn collision(source_mtime: f64, backup_mtime: f64) -> Collision {
        Collision {
            key: "a.txt".into(),
            source_path: PathBuf::from("/src/a.txt"),
            backup_path: PathBuf::from("/bkp/a.txt"),
            source_mtime,
            backup_mtime,
            last_sync: 100.0,
        }
    }

    fn detector() -> CollisionDetector {
        CollisionDetector::new(5.0, 100.0)
    }

    #[test]
    fn test_manual_decisions() {
        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        let cases = [
            (Decision::KeepSource, Some(ChangeType::UpdateForward)),
            (Decision::KeepBackup, Some(ChangeType::UpdateBackward)),
            (Decision::Skip, None),
        ];
        for (answer, expected) in cases {
            let sink = Scripted::new(answer);
            let resolver = CollisionResolver::new(detector(), false, &sink);
            let resolved = resolver.resolve(&collision(200.0, 300.0), &ledger).unwrap();
            assert_eq!(resolved, expected, "answer {answer:?}");
            assert_eq!(sink.asked.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_auto_resolve_never_asks() {
        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        let sink = Scripted::new(Decision::Skip);
        let resolver = CollisionResolver::new(detector(), true, &sink);
        assert_eq!(
            resolver.resolve(&collision(200.0, 300.0), &ledger).unwrap(),
            Some(ChangeType::UpdateBackward)
        );
        assert_eq!(sink.asked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remember_sets_auto_latest() {
        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        let sink = Scripted::new(Decision::KeepSourceAndRemember);
        let resolver = CollisionResolver::new(detector(), false, &sink);

        let resolved = resolver.resolve(&collision(400.0, 300.0), &ledger).unwrap();
        assert_eq!(resolved, Some(ChangeType::UpdateForward));
        assert_eq!(
            ledger.lock().resolution_mode("a.txt"),
            ResolutionMode::AutoLatest
        );

        // The stored mode now short-circuits the prompt.
        let resolved = resolver.resolve(&collision(200.0, 300.0), &ledger).unwrap();
        assert_eq!(resolved, Some(ChangeType::UpdateBackward));
        assert_eq!(sink.asked.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remember_keeps_source_when_backup_is_newer() {
        let ledger = Mutex::new(TimestampLedger::in_memory(5.0));
        let sink = Scripted::new(Decision::KeepSourceAndRemember);
        let resolver = CollisionResolver::new(detector(), false, &sink);

        let resolved = resolver.resolve(&collision(200.0, 300.0), &ledger).unwrap();
        assert_eq!(resolved, Some(ChangeType::UpdateForward));
        assert_eq!(
            ledger.lock().resolution_mode("a.txt"),
            ResolutionMode::AutoLatest
        );
    }

    #[test]
    fn test_skip_all_sink() {
        assert_eq!(SkipAll.decide(&collision(1.0, 2.0)), Decision::Skip);
        assert_eq!(Decision::ALL.len(), 4);
    }
}
