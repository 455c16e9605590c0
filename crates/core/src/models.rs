//! Run-level summary types shared by the engine and its front ends.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::instruction::{ChangeType, InstructionSet};

// ---------------------------------------------------------------------------
// Pre-run summary
// ---------------------------------------------------------------------------

/// What a run is about to do, shown before any instruction executes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreRunSummary {
    pub counts: BTreeMap<ChangeType, usize>,
    pub total: usize,
    /// Forward and backward updates.
    pub updates: usize,
    /// Forward and backward creations.
    pub creations: usize,
    /// File and folder removals.
    pub removals: usize,
    pub bytes_to_modify: u64,
    /// Signed: negative when the run frees space.
    pub space_requirement: i64,
    pub free_bytes: Option<u64>,
    pub total_bytes: Option<u64>,
}

impl PreRunSummary {
    /// Count the members of `set`. Volume figures are left unset.
    pub fn from_set(set: &InstructionSet) -> Self {
        let counts = set.counts_by_type();
        let sum = |types: &[ChangeType]| -> usize {
            types.iter().map(|t| counts.get(t).copied().unwrap_or(0)).sum()
        };
        Self {
            total: set.len(),
            updates: sum(&[ChangeType::UpdateForward, ChangeType::UpdateBackward]),
            creations: sum(&[ChangeType::Create, ChangeType::CreateBackward]),
            removals: sum(&[ChangeType::Remove, ChangeType::RemoveFolder]),
            bytes_to_modify: set.bytes_to_modify(),
            space_requirement: set.space_requirement(),
            free_bytes: None,
            total_bytes: None,
            counts,
        }
    }

    /// Attach free and total bytes of the backup volume.
    pub fn with_volume(mut self, free: u64, total: u64) -> Self {
        self.free_bytes = Some(free);
        self.total_bytes = Some(total);
        self
    }

    /// `false` when the run needs more space than the volume has free.
    pub fn fits(&self) -> bool {
        match self.free_bytes {
            Some(free) if self.space_requirement > 0 => self.space_requirement as u64 <= free,
            _ => true,
        }
    }

    /// One line describing the space the run needs or frees.
    pub fn space_line(&self) -> String {
        let verb = if self.space_requirement >= 0 {
            "require"
        } else {
            "free up"
        };
        match (self.free_bytes, self.total_bytes) {
            (Some(free), Some(total)) => format!(
                "This will {verb} approximately {} of space. {} available from {}",
                format_bytes(self.space_requirement.unsigned_abs() as i128),
                format_bytes(free as i128),
                format_bytes(total as i128)
            ),
            _ => format!(
                "This will {verb} approximately {} of space.",
                format_bytes(self.space_requirement.unsigned_abs() as i128)
            ),
        }
    }
}

impl std::fmt::Display for PreRunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Changes Required. {} Updates, {} Creations, {} Removals. {} I/O Action Size",
            self.total,
            self.updates,
            self.creations,
            self.removals,
            format_bytes(self.bytes_to_modify as i128)
        )
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Totals for an executed run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Instructions whose path was already gone.
    pub skipped: usize,
    pub renamed: usize,
    pub folders_created: usize,
    pub bytes_done: u64,
    /// Scan and execution errors, in the order they were met.
    pub errors: Vec<String>,
}

impl RunSummary {
    /// Instructions that were processed without failing.
    pub fn done(&self) -> usize {
        self.succeeded + self.skipped
    }

    /// Percentage of instructions that did not fail, two decimals.
    pub fn percent_done(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        let pct = self.done() as f64 * 100.0 / self.total as f64;
        (pct * 100.0).round() / 100.0
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} / {} ({}%) done.",
            self.done(),
            self.total,
            self.percent_done()
        )?;
        if self.failed > 0 {
            write!(f, " {} errors", self.failed)?;
        }
        Ok(())
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every instruction was attempted. Individual failures are in the
    /// summary.
    Success(RunSummary),
    /// The space pre-flight failed; nothing was touched.
    InsufficientSpace { required: u64, available: u64 },
    /// The user declined the preview or interrupted execution.
    Cancelled(RunSummary),
}

impl RunOutcome {
    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            Self::Success(s) | Self::Cancelled(s) => Some(s),
            Self::InsufficientSpace { .. } => None,
        }
    }
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success(s) => write!(f, "{s}"),
            Self::InsufficientSpace {
                required,
                available,
            } => write!(
                f,
                "insufficient space: {} required, {} available",
                format_bytes(*required as i128),
                format_bytes(*available as i128)
            ),
            Self::Cancelled(s) => write!(f, "cancelled after {s}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Formatting
// ---------------------------------------------------------------------------

const UNITS: [&str; 9] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB", "ZiB", "YiB"];

/// Render a byte count in binary units with two decimals, e.g. `1.50KiB`.
pub fn format_bytes(bytes: i128) -> String {
    let sign = if bytes < 0 { "-" } else { "" };
    let mut value = bytes.unsigned_abs() as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{sign}{value:.2}{}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00B");
        assert_eq!(format_bytes(1023), "1023.00B");
        assert_eq!(format_bytes(1536), "1.50KiB");
        assert_eq!(format_bytes(-2 * 1024 * 1024), "-2.00MiB");
        assert_eq!(format_bytes(5 * 1024_i128.pow(3)), "5.00GiB");
    }

    #[test]
    fn test_run_summary_display() {
        let summary = RunSummary {
            total: 4,
            succeeded: 3,
            failed: 1,
            ..Default::default()
        };
        assert_eq!(summary.to_string(), "3 / 4 (75%) done. 1 errors");

        let clean = RunSummary {
            total: 3,
            succeeded: 3,
            ..Default::default()
        };
        assert_eq!(clean.to_string(), "3 / 3 (100%) done.");
        assert_eq!(RunSummary::default().percent_done(), 100.0);
    }

    #[test]
    fn test_fits() {
        let summary = PreRunSummary {
            space_requirement: 100,
            ..Default::default()
        };
        assert!(summary.fits());
        assert!(summary.clone().with_volume(100, 1000).fits());
        assert!(!summary.with_volume(99, 1000).fits());

        let freeing = PreRunSummary {
            space_requirement: -500,
            ..Default::default()
        }
        .with_volume(0, 1000);
        assert!(freeing.fits());
        assert!(freeing.space_line().starts_with("This will free up approximately 500.00B"));
    }

    #[test]
    fn test_outcome_summary() {
        let outcome = RunOutcome::InsufficientSpace {
            required: 2048,
            available: 1024,
        };
        assert!(outcome.summary().is_none());
        assert_eq!(
            outcome.to_string(),
            "insufficient space: 2.00KiB required, 1.00KiB available"
        );
    }
}
