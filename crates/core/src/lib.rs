//! dirmirror core library.
//!
//! This crate mirrors source directory trees into a backup root and keeps
//! the two sides consistent in one of three modes: additive backup,
//! snapshot (backup mirrors source exactly) and two-way sync. It provides
//! configuration, path mapping, tree scanning, the timestamp ledger,
//! diffing, collision resolution, execution, and the per-run session.

pub mod config;
pub mod conflict;
pub mod diff;
pub mod errors;
pub mod executor;
pub mod ignore;
pub mod instruction;
pub mod ledger;
pub mod models;
pub mod path_map;
pub mod scanner;
pub mod session;
pub mod sinks;

// Re-exports for convenience.
pub use config::{BackupRule, GeneralConfig, MirrorConfig, Mode};
pub use conflict::{Collision, Decision, DecisionSink};
pub use errors::CoreError;
pub use instruction::{ChangeInstruction, ChangeType, InstructionSet};
pub use ledger::{ResolutionMode, TimestampLedger};
pub use models::{PreRunSummary, RunOutcome, RunSummary};
pub use path_map::PathMapper;
pub use session::{RunOptions, SyncSession};
pub use sinks::{ChangeEvent, ChangeLogSink, ErrorEvent, ProgressSink};
