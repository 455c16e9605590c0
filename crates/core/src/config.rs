//! TOML-based configuration for dirmirror.
//!
//! A configuration is a `[general]` table naming the backup root and global
//! defaults, plus one `[[rules]]` entry per backed-up directory. The engine
//! never reads files itself; callers build a [`MirrorConfig`] (usually via
//! [`MirrorConfig::load_and_resolve`]) and hand it to the session.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

/// Default timestamp tolerance in seconds.
pub const DEFAULT_TOLERANCE_SECS: f64 = 5.0;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Backup root and global defaults.
    pub general: GeneralConfig,

    /// One entry per top-level backed-up directory.
    #[serde(default)]
    pub rules: Vec<BackupRule>,
}

// ---------------------------------------------------------------------------
// General
// ---------------------------------------------------------------------------

/// Settings shared by every rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Directory under which every rule's mirror lives.
    pub backup_root: PathBuf,

    /// Leading path segments dropped when mapping into the backup tree.
    /// `None` or 0 keeps the full path.
    #[serde(default)]
    pub path_reduction: Option<usize>,

    /// Modification times closer than this many seconds are equal.
    #[serde(default = "default_tolerance")]
    pub tolerance_secs: f64,

    /// Location of the timestamp ledger JSON file.
    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,

    /// Directory for per-category change logs.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// Executor worker threads (0 = one per CPU).
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE_SECS
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("dirmirror"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_ledger_path() -> PathBuf {
    data_dir().join("db").join("timestamps.json")
}

fn default_log_dir() -> PathBuf {
    data_dir().join("logs")
}

fn default_workers() -> usize {
    4
}

impl GeneralConfig {
    /// General settings with every optional field at its default.
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            path_reduction: None,
            tolerance_secs: default_tolerance(),
            ledger_path: default_ledger_path(),
            log_dir: default_log_dir(),
            workers: default_workers(),
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// How a rule relates its backup tree to its source tree.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One-way mirror that never deletes.
    #[default]
    Default,
    /// One-way mirror that also removes backup entries missing from the source.
    Snapshot,
    /// Bidirectional reconciliation with collision detection.
    Sync,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Snapshot => write!(f, "snapshot"),
            Self::Sync => write!(f, "sync"),
        }
    }
}

/// One configured source directory and how it is mirrored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRule {
    /// Absolute source path.
    pub path: String,

    /// Optional prefix inside the backup root.
    #[serde(default)]
    pub subpath: Option<String>,

    /// Always treat files as changed.
    #[serde(default)]
    pub force_backup: bool,

    #[serde(default)]
    pub mode: Mode,

    /// Path prefixes, relative to `path`, that are never scanned.
    #[serde(default)]
    pub ignored_paths: Vec<String>,

    /// Overrides the global path reduction for this rule.
    #[serde(default)]
    pub path_reduction: Option<usize>,
}

impl BackupRule {
    /// A rule for `path` in the given mode with no other options set.
    pub fn new(path: impl Into<String>, mode: Mode) -> Self {
        Self {
            path: path.into(),
            subpath: None,
            force_backup: false,
            mode,
            ignored_paths: Vec::new(),
            path_reduction: None,
        }
    }

    /// Resolve the effective reduction: rule override, else global default.
    /// Zero collapses to `None`.
    pub fn effective_reduction(&self, global: Option<usize>) -> Option<usize> {
        self.path_reduction.or(global).filter(|n| *n > 0)
    }

    /// The `subpath` with surrounding separators trimmed, or `""`.
    pub fn subpath_str(&self) -> &str {
        self.subpath
            .as_deref()
            .map(|s| s.trim_matches(|c| c == '/' || c == '\\'))
            .unwrap_or("")
    }
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl MirrorConfig {
    /// Build a config in code (tests, embedding).
    pub fn new(general: GeneralConfig, rules: Vec<BackupRule>) -> Self {
        Self { general, rules }
    }

    /// Load a [`MirrorConfig`] from a TOML file at the given path.
    ///
    /// This does **not** expand `~` -- call
    /// [`resolve_paths`](Self::resolve_paths) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: MirrorConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!(rules = config.rules.len(), "configuration parsed successfully");
        Ok(config)
    }

    /// Expand a leading `~/` in every path-valued field.
    pub fn resolve_paths(&mut self) {
        self.general.backup_root = expand_tilde_path(&self.general.backup_root);
        self.general.ledger_path = expand_tilde_path(&self.general.ledger_path);
        self.general.log_dir = expand_tilde_path(&self.general.log_dir);
        for rule in &mut self.rules {
            rule.path = expand_tilde(&rule.path);
        }
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.backup_root.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "general.backup_root".into(),
                detail: "backup root must not be empty".into(),
            });
        }
        if !self.general.tolerance_secs.is_finite() || self.general.tolerance_secs < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "general.tolerance_secs".into(),
                detail: "tolerance must be a finite, non-negative number".into(),
            });
        }
        if self.rules.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "rules".into(),
                detail: "at least one rule is required".into(),
            });
        }

        let root = normalize(&self.general.backup_root.to_string_lossy());
        for (i, rule) in self.rules.iter().enumerate() {
            if rule.path.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("rules[{i}].path"),
                    detail: "rule path must not be empty".into(),
                });
            }
            let source = normalize(&rule.path);
            if root == source || root.starts_with(&format!("{source}/")) {
                return Err(ConfigError::InvalidValue {
                    field: format!("rules[{i}].path"),
                    detail: format!("backup root '{root}' lies inside source '{source}'"),
                });
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_paths();
        config.validate()?;
        Ok(config)
    }

    /// A commented starter file written by `dirmirror init`.
    pub fn default_toml() -> String {
        format!(
            r#"# dirmirror configuration

[general]
# Every rule is mirrored somewhere below this directory.
backup_root = "~/bkp"
# Leading path segments dropped when mapping into the backup tree (0 = none).
path_reduction = 0
# Modification times within this many seconds are treated as equal.
tolerance_secs = {tolerance:.1}
# ledger_path = "~/.local/share/dirmirror/db/timestamps.json"
# log_dir = "~/.local/share/dirmirror/logs"
workers = {workers}

[[rules]]
path = "~/Documents"
# subpath = "docs"
# default | snapshot | sync
mode = "default"
force_backup = false
ignored_paths = []
# path_reduction = 2
"#,
            tolerance = DEFAULT_TOLERANCE_SECS,
            workers = default_workers(),
        )
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{}", home.display(), rest);
        }
    }
    path.to_string()
}

/// Expand a leading `~/` in a filesystem path.
pub fn expand_tilde_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_tilde(&path.to_string_lossy()))
}

fn normalize(path: &str) -> String {
    path.replace('\\', "/").trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[general]
backup_root = "/mnt/bkp"
path_reduction = 2
tolerance_secs = 3.0
ledger_path = "/var/lib/dirmirror/timestamps.json"
log_dir = "/var/log/dirmirror"
workers = 8

[[rules]]
path = "/home/alice/Documents"
subpath = "docs"
mode = "snapshot"
force_backup = true
ignored_paths = ["cache", "tmp/build"]

[[rules]]
path = "/home/alice/Music"
mode = "sync"
path_reduction = 0
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: MirrorConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.general.backup_root, PathBuf::from("/mnt/bkp"));
        assert_eq!(config.general.path_reduction, Some(2));
        assert_eq!(config.general.workers, 8);
        assert_eq!(config.rules.len(), 2);
        assert_eq!(config.rules[0].mode, Mode::Snapshot);
        assert!(config.rules[0].force_backup);
        assert_eq!(config.rules[0].ignored_paths, vec!["cache", "tmp/build"]);
        assert_eq!(config.rules[1].mode, Mode::Sync);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = MirrorConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.general.tolerance_secs, 3.0);
    }

    #[test]
    fn test_file_not_found() {
        let result = MirrorConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_effective_reduction() {
        let config: MirrorConfig = toml::from_str(sample_toml()).unwrap();
        let global = config.general.path_reduction;
        // Inherits the global value.
        assert_eq!(config.rules[0].effective_reduction(global), Some(2));
        // An explicit 0 override disables reduction.
        assert_eq!(config.rules[1].effective_reduction(global), None);
        // No global, no override.
        assert_eq!(BackupRule::new("/a", Mode::Default).effective_reduction(None), None);
    }

    #[test]
    fn test_validate_rejects_empty_rules() {
        let mut config: MirrorConfig = toml::from_str(sample_toml()).unwrap();
        config.rules.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "rules"
        ));
    }

    #[test]
    fn test_validate_rejects_backup_root_inside_source() {
        let mut config: MirrorConfig = toml::from_str(sample_toml()).unwrap();
        config.general.backup_root = PathBuf::from("/home/alice/Documents/bkp");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "rules[0].path"
        ));
    }

    #[test]
    fn test_validate_rejects_negative_tolerance() {
        let mut config: MirrorConfig = toml::from_str(sample_toml()).unwrap();
        config.general.tolerance_secs = -1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[general]
backup_root = "/mnt/bkp"

[[rules]]
path = "/data"
"#;
        let config: MirrorConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.general.tolerance_secs, DEFAULT_TOLERANCE_SECS);
        assert_eq!(config.general.path_reduction, None);
        assert_eq!(config.general.workers, 4);
        assert!(config.general.ledger_path.ends_with("timestamps.json"));
        assert_eq!(config.rules[0].mode, Mode::Default);
        assert!(!config.rules[0].force_backup);
        assert_eq!(config.rules[0].subpath_str(), "");
        config.validate().unwrap();
    }

    #[test]
    fn test_default_toml_parses() {
        let config: MirrorConfig = toml::from_str(&MirrorConfig::default_toml()).unwrap();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.general.path_reduction, Some(0));
    }
}
