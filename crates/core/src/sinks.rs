//! Callback seams between the engine and whatever presents or records a run.
//!
//! The engine never renders anything itself. It reports scan and copy
//! progress to a [`ProgressSink`] and one event per applied change or error
//! to a [`ChangeLogSink`]. Every method has a no-op default so a sink only
//! implements what it displays.

use std::path::{Path, PathBuf};

use crate::instruction::{ChangeInstruction, ChangeType};
use crate::models::{PreRunSummary, RunSummary};

/// Log category used for error events.
pub const ERROR_CATEGORY: &str = "errors";

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

/// Receives progress updates. Calls may arrive from several worker threads
/// at once and must not block for long.
pub trait ProgressSink: Send + Sync {
    /// Another file was found while scanning.
    fn scan_progress(&self, _files_found: usize, _current: &Path) {}

    /// The diff is complete and execution is about to start.
    fn pre_run(&self, _summary: &PreRunSummary) {}

    /// A worker picked up an instruction.
    fn file_started(&self, _instruction: &ChangeInstruction) {}

    /// Bytes copied so far for the file at `target`.
    fn copy_progress(&self, _target: &Path, _bytes_copied: u64, _total: u64) {}

    /// A worker finished an instruction, successfully or not.
    fn file_finished(&self, _instruction: &ChangeInstruction, _ok: bool) {}

    /// Every instruction has been processed (or the run was cancelled).
    fn run_finished(&self, _summary: &RunSummary) {}
}

/// Discards all progress.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressSink for NullProgress {}

// ---------------------------------------------------------------------------
// Change log
// ---------------------------------------------------------------------------

/// One applied change, as recorded in the per-category logs.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub change_type: ChangeType,
    pub source: PathBuf,
    pub target: Option<PathBuf>,
    pub message: String,
}

impl ChangeEvent {
    /// Event for an executed instruction.
    pub fn applied(instruction: &ChangeInstruction) -> Self {
        let message = match instruction.target() {
            Some(target) => format!(
                "{} {} -> {}",
                instruction.change_type().display_name(),
                instruction.source().display(),
                target.display()
            ),
            None => format!(
                "{} {}",
                instruction.change_type().display_name(),
                instruction.source().display()
            ),
        };
        Self {
            change_type: instruction.change_type(),
            source: instruction.source().to_path_buf(),
            target: instruction.target().map(Path::to_path_buf),
            message,
        }
    }

    /// A target directory was created ahead of a copy.
    pub fn folder_created(dir: &Path) -> Self {
        Self {
            change_type: ChangeType::Folder,
            source: dir.to_path_buf(),
            target: None,
            message: format!("Created folder {}", dir.display()),
        }
    }

    /// A copied file was renamed to match the case of its source.
    pub fn renamed(from: &Path, to: &Path) -> Self {
        Self {
            change_type: ChangeType::Rename,
            source: from.to_path_buf(),
            target: Some(to.to_path_buf()),
            message: format!("Renamed {} -> {}", from.display(), to.display()),
        }
    }

    /// The log category this event belongs to.
    pub fn category(&self) -> &'static str {
        self.change_type.category()
    }
}

/// One non-fatal failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub path: PathBuf,
    pub message: String,
}

impl ErrorEvent {
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

/// Receives structured change and error events for persistence.
pub trait ChangeLogSink: Send + Sync {
    fn change(&self, _event: &ChangeEvent) {}

    fn error(&self, _event: &ErrorEvent) {}
}

/// Discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullChangeLog;

impl ChangeLogSink for NullChangeLog {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_applied_event_message() {
        let inst = ChangeInstruction::new(
            ChangeType::Create,
            "/src/a.txt",
            Some(PathBuf::from("/bkp/a.txt")),
            false,
        )
        .unwrap();
        let event = ChangeEvent::applied(&inst);
        assert_eq!(event.message, "Create S => B /src/a.txt -> /bkp/a.txt");
        assert_eq!(event.category(), "additions");
    }

    #[test]
    fn test_folder_and_rename_events() {
        let event = ChangeEvent::folder_created(Path::new("/bkp/new"));
        assert_eq!(event.change_type, ChangeType::Folder);
        assert_eq!(event.category(), "folders");
        assert_eq!(event.message, "Created folder /bkp/new");

        let event = ChangeEvent::renamed(Path::new("/bkp/a.TXT"), Path::new("/bkp/a.txt"));
        assert_eq!(event.category(), "renames");
    }

    #[test]
    fn test_error_event_display() {
        let event = ErrorEvent::new("/bkp/x", "permission denied");
        assert_eq!(event.to_string(), "/bkp/x: permission denied");
    }
}
