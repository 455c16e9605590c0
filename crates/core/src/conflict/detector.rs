//! Classification of files present on both sides of a sync rule.
//!
//! Two copies whose modification times agree within the tolerance are in
//! sync. Otherwise the newer side wins, unless both sides were modified
//! after the last successful sync. That case is a collision and needs a
//! decision.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::InstructionError;
use crate::instruction::{ChangeInstruction, ChangeType};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Which way a two-sided file should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// Times agree within the tolerance.
    InSync,
    /// Copy source over backup.
    SourceNewer,
    /// Copy backup over source.
    BackupNewer,
    /// Both sides changed since the last sync.
    Collision,
}

impl std::fmt::Display for Comparison {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InSync => write!(f, "in_sync"),
            Self::SourceNewer => write!(f, "source_newer"),
            Self::BackupNewer => write!(f, "backup_newer"),
            Self::Collision => write!(f, "collision"),
        }
    }
}

/// A file modified independently on both sides since the last sync.
#[derive(Debug, Clone, PartialEq)]
pub struct Collision {
    /// Backup-relative ledger key.
    pub key: String,
    pub source_path: PathBuf,
    pub backup_path: PathBuf,
    pub source_mtime: f64,
    pub backup_mtime: f64,
    /// Ledger sync time both sides were compared against.
    pub last_sync: f64,
}

impl Collision {
    /// The instruction that applies `change_type` to this file.
    ///
    /// Only the two update directions are meaningful here.
    pub fn instruction(&self, change_type: ChangeType) -> Result<ChangeInstruction, InstructionError> {
        let (from, to) = match change_type {
            ChangeType::UpdateBackward | ChangeType::CreateBackward => {
                (&self.backup_path, &self.source_path)
            }
            _ => (&self.source_path, &self.backup_path),
        };
        Ok(ChangeInstruction::new(change_type, from.clone(), Some(to.clone()), false)?
            .with_ledger_key(&self.key))
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Compares the two modification times of a file against the ledger.
#[derive(Debug, Clone, Copy)]
pub struct CollisionDetector {
    tolerance: f64,
    last_sync: f64,
}

impl CollisionDetector {
    pub fn new(tolerance: f64, last_sync: f64) -> Self {
        Self {
            tolerance,
            last_sync,
        }
    }

    pub fn last_sync(&self) -> f64 {
        self.last_sync
    }

    /// Classify a file that exists on both sides.
    pub fn compare(&self, source_mtime: f64, backup_mtime: f64) -> Comparison {
        if (source_mtime - backup_mtime).abs() <= self.tolerance {
            return Comparison::InSync;
        }
        if source_mtime > self.last_sync && backup_mtime > self.last_sync {
            debug!(
                source_mtime,
                backup_mtime,
                last_sync = self.last_sync,
                "both sides changed since last sync"
            );
            return Comparison::Collision;
        }
        latest(source_mtime, backup_mtime)
    }

    /// Resolve purely by modification time, ignoring the ledger.
    pub fn latest_wins(&self, source_mtime: f64, backup_mtime: f64) -> Comparison {
        if (source_mtime - backup_mtime).abs() <= self.tolerance {
            Comparison::InSync
        } else {
            latest(source_mtime, backup_mtime)
        }
    }
}

fn latest(source_mtime: f64, backup_mtime: f64) -> Comparison {
    if source_mtime > backup_mtime {
        Comparison::SourceNewer
    } else if source_mtime < backup_mtime {
        Comparison::BackupNewer
    } else {
        Comparison::InSync
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LAST_SYNC: f64 = 1_000_000.0;

    fn detector() -> CollisionDetector {
        CollisionDetector::new(5.0, LAST_SYNC)
    }

    #[test]
    fn test_within_tolerance_is_in_sync() {
        let d = detector();
        assert_eq!(d.compare(LAST_SYNC + 50.0, LAST_SYNC + 53.0), Comparison::InSync);
        assert_eq!(d.compare(100.0, 105.0), Comparison::InSync);
    }

    #[test]
    fn test_one_side_changed() {
        let d = detector();
        assert_eq!(
            d.compare(LAST_SYNC + 100.0, LAST_SYNC - 100.0),
            Comparison::SourceNewer
        );
        assert_eq!(
            d.compare(LAST_SYNC - 500.0, LAST_SYNC + 10.0),
            Comparison::BackupNewer
        );
    }

    #[test]
    fn test_both_changed_is_collision() {
        let d = detector();
        assert_eq!(
            d.compare(LAST_SYNC + 100.0, LAST_SYNC + 20.0),
            Comparison::Collision
        );
        assert_eq!(
            d.latest_wins(LAST_SYNC + 100.0, LAST_SYNC + 20.0),
            Comparison::SourceNewer
        );
    }

    #[test]
    fn test_collision_instruction_direction() {
        let collision = Collision {
            key: "docs/a.txt".into(),
            source_path: PathBuf::from("/src/docs/a.txt"),
            backup_path: PathBuf::from("/bkp/docs/a.txt"),
            source_mtime: 2.0,
            backup_mtime: 1.0,
            last_sync: 0.0,
        };
        let back = collision.instruction(ChangeType::UpdateBackward).unwrap();
        assert_eq!(back.source(), PathBuf::from("/bkp/docs/a.txt"));
        assert_eq!(back.target(), Some(PathBuf::from("/src/docs/a.txt").as_path()));
        assert_eq!(back.ledger_key(), Some("docs/a.txt"));

        let fwd = collision.instruction(ChangeType::UpdateForward).unwrap();
        assert_eq!(fwd.source(), PathBuf::from("/src/docs/a.txt"));
    }
}
