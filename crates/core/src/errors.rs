//! Error types for the dirmirror core library.
//!
//! Each subsystem has its own error type derived with `thiserror`, and a
//! top-level [`CoreError`] enum unifies them all for callers that want a
//! single error type.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Scan(#[from] ScanError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Instruction(#[from] InstructionError),

    #[error(transparent)]
    Execute(#[from] ExecuteError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors related to configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Scan errors
// ---------------------------------------------------------------------------

/// Recoverable problems met while walking a tree.
///
/// These never abort a scan; they are collected next to the scan result.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    /// The scan root does not exist.
    #[error("scan root not found: {}", .0.display())]
    RootMissing(PathBuf),

    /// An entry vanished between listing and stat.
    #[error("entry vanished during scan: {}", .0.display())]
    Vanished(PathBuf),

    /// A symbolic link whose target cannot be reached.
    #[error("unreachable link: {}", .0.display())]
    BrokenLink(PathBuf),

    /// Any other I/O failure on a single entry.
    #[error("cannot read '{}': {detail}", path.display())]
    Unreadable { path: PathBuf, detail: String },
}

impl ScanError {
    /// The path the error refers to.
    pub fn path(&self) -> &std::path::Path {
        match self {
            Self::RootMissing(p) | Self::Vanished(p) | Self::BrokenLink(p) => p,
            Self::Unreadable { path, .. } => path,
        }
    }
}

// ---------------------------------------------------------------------------
// Ledger errors
// ---------------------------------------------------------------------------

/// Errors from the timestamp ledger store.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger file exists but is not valid ledger JSON.
    #[error("ledger at '{}' is corrupt: {detail}", path.display())]
    Corrupt { path: PathBuf, detail: String },

    /// Another process holds the ledger lock.
    #[error("ledger at '{}' is locked by another process", .0.display())]
    Locked(PathBuf),

    /// Serialising the ledger failed.
    #[error("ledger serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The temp file could not be moved over the ledger.
    #[error("failed to persist ledger to '{}': {detail}", path.display())]
    PersistFailed { path: PathBuf, detail: String },

    /// Generic I/O wrapper.
    #[error("ledger I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Instruction errors
// ---------------------------------------------------------------------------

/// Programmer errors raised while building instructions.
///
/// These signal a logic defect and are never folded into the per-item
/// error log.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum InstructionError {
    /// A change-type label did not name a known change type.
    #[error("invalid change type '{0}'")]
    InvalidChangeType(String),

    /// A non-removal instruction was built without a target.
    #[error("{change_type} instruction for '{}' requires a target path", source_path.display())]
    MissingTarget {
        change_type: String,
        source_path: PathBuf,
    },

    /// `Folder` and `Rename` are events, never queued instructions.
    #[error("{0} cannot be queued as an instruction")]
    NotExecutable(String),
}

// ---------------------------------------------------------------------------
// Execution errors
// ---------------------------------------------------------------------------

/// Outcome of a single failed instruction.
#[derive(Debug, Error)]
pub enum ExecuteError {
    /// The path to copy or remove no longer exists.
    #[error("not found: {}", .0.display())]
    NotFound(PathBuf),

    /// Source and target resolve to the same file.
    #[error("source and target are the same file: {}", .0.display())]
    SameFile(PathBuf),

    /// A copy, rename or delete failed.
    #[error("I/O failure on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Ledger write failed while recording the applied change.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// The instruction itself is malformed.
    #[error(transparent)]
    Instruction(#[from] InstructionError),
}

impl ExecuteError {
    /// Wrap an I/O error, classifying `NotFound` separately.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            Self::NotFound(path)
        } else {
            Self::Io { path, source }
        }
    }

    /// `true` for conditions that indicate a defect rather than the
    /// environment.
    pub fn is_logic_error(&self) -> bool {
        matches!(self, Self::SameFile(_) | Self::Instruction(_))
    }
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

/// Fatal errors that stop a run before or outside execution.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A run is already in progress on this session.
    #[error("a run is already in progress")]
    AlreadyRunning,

    /// Free space on the backup volume could not be determined.
    #[error("cannot query free space for '{}': {source}", path.display())]
    FreeSpace {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The executor worker pool could not be built.
    #[error("failed to start worker pool: {0}")]
    WorkerPool(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Instruction(#[from] InstructionError),

    /// Generic I/O wrapper.
    #[error("session I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = ScanError::Vanished(PathBuf::from("/tmp/a.txt"));
        assert_eq!(err.to_string(), "entry vanished during scan: /tmp/a.txt");

        let err = InstructionError::MissingTarget {
            change_type: "update".into(),
            source_path: PathBuf::from("/src/a"),
        };
        assert_eq!(
            err.to_string(),
            "update instruction for '/src/a' requires a target path"
        );

        let err = ConfigError::InvalidValue {
            field: "general.backup_root".into(),
            detail: "must not be empty".into(),
        };
        assert!(err.to_string().contains("general.backup_root"));

        let err = LedgerError::Locked(PathBuf::from("/db/timestamps.json"));
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn test_execute_error_classifies_not_found() {
        let err = ExecuteError::io(
            "/missing",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, ExecuteError::NotFound(_)));

        let err = ExecuteError::io(
            "/denied",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no"),
        );
        assert!(matches!(err, ExecuteError::Io { .. }));
        assert!(!err.is_logic_error());
        assert!(ExecuteError::SameFile(PathBuf::from("/x")).is_logic_error());
    }

    #[test]
    fn test_core_error_from_subsystem() {
        let err = InstructionError::InvalidChangeType("bogus".into());
        let core_err: CoreError = err.into();
        assert!(matches!(core_err, CoreError::Instruction(_)));

        let core_err: CoreError = SessionError::AlreadyRunning.into();
        assert!(matches!(core_err, CoreError::Session(_)));
    }
}
