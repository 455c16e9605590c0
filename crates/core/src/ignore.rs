//! Ignore-rule evaluation for tree scans.
//!
//! A rule's `ignored_paths` are relative to its source directory. They are
//! joined onto a scan root (the source root, or the mirrored backup root for
//! reverse scans) and then matched as plain string prefixes against
//! forward-slash-normalized absolute paths.
//!
//! | Condition | Decision |
//! |-----------|----------|
//! | Path starts with an ignored prefix | `Ignored` |
//! | Otherwise | `Allow` |

use std::path::Path;

use tracing::debug;

use crate::path_map::normalize;

/// The outcome of evaluating a path against the ignore rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreDecision {
    /// Path is scanned normally.
    Allow,
    /// Path (and everything below it) is pruned.
    Ignored { prefix: String },
}

impl IgnoreDecision {
    pub fn is_ignored(&self) -> bool {
        matches!(self, Self::Ignored { .. })
    }

    /// Short label for logging.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Ignored { .. } => "ignored",
        }
    }
}

/// A set of absolute ignored prefixes.
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    prefixes: Vec<String>,
}

impl IgnoreRules {
    /// No ignored paths.
    pub fn none() -> Self {
        Self::default()
    }

    /// Join each relative entry onto `root`.
    pub fn new<S: AsRef<str>>(root: impl AsRef<Path>, relative: &[S]) -> Self {
        let root = normalize(&root.as_ref().to_string_lossy());
        let root = root.trim_end_matches('/');
        let prefixes = relative
            .iter()
            .map(|r| normalize(r.as_ref()))
            .map(|r| r.trim_start_matches('/').to_string())
            .filter(|r| !r.is_empty())
            .map(|r| format!("{root}/{r}"))
            .collect();
        Self { prefixes }
    }

    pub fn is_empty(&self) -> bool {
        self.prefixes.is_empty()
    }

    pub fn prefixes(&self) -> &[String] {
        &self.prefixes
    }

    /// Evaluate a single absolute path.
    pub fn evaluate(&self, path: impl AsRef<Path>) -> IgnoreDecision {
        let path = normalize(&path.as_ref().to_string_lossy());
        for prefix in &self.prefixes {
            if path.starts_with(prefix.as_str()) {
                debug!(path = %path, prefix = %prefix, "path matches ignored prefix");
                return IgnoreDecision::Ignored {
                    prefix: prefix.clone(),
                };
            }
        }
        IgnoreDecision::Allow
    }

    pub fn is_ignored(&self, path: impl AsRef<Path>) -> bool {
        self.evaluate(path).is_ignored()
    }
}
