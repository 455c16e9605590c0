//! Translation between source paths and their mirrored backup paths.
//!
//! Paths are handled as forward-slash strings internally. Platform
//! separators are normalized on the way in, so `C:\Users\bob` and
//! `C:/Users/bob` map to the same backup location.
//!
//! Path reduction drops the first N segments of a source path (after the
//! drive or root) before it is placed under `backup_root/subpath`. Since the
//! dropped segments cannot be read back from the backup path, the reverse
//! mapping recovers them from the rule's own source path.

use std::path::Path;

use crate::config::BackupRule;

/// Stateless mapper bound to one backup root and global reduction.
#[derive(Debug, Clone)]
pub struct PathMapper {
    backup_root: String,
    global_reduction: Option<usize>,
}

impl PathMapper {
    pub fn new(backup_root: impl AsRef<Path>, global_reduction: Option<usize>) -> Self {
        Self {
            backup_root: normalize(&backup_root.as_ref().to_string_lossy())
                .trim_end_matches('/')
                .to_string(),
            global_reduction,
        }
    }

    /// The normalized backup root.
    pub fn backup_root(&self) -> &str {
        &self.backup_root
    }

    /// Effective reduction for `rule`.
    pub fn reduction(&self, rule: &BackupRule) -> Option<usize> {
        rule.effective_reduction(self.global_reduction)
    }

    /// Map a source path to its backup counterpart. Never fails.
    ///
    /// A reduction larger than the rule path's segment count is capped at
    /// that count.
    pub fn to_backup_path(&self, source: &str, rule: &BackupRule) -> String {
        let normalized = normalize(source);
        let (_, rest) = split_drive(&normalized);
        let parts = segments(rest);
        // Never reduce past the rule's own depth, or distinct files collide.
        let rule_path = normalize(&rule.path);
        let rule_depth = segments(split_drive(&rule_path).1).len();
        let skip = self
            .reduction(rule)
            .unwrap_or(0)
            .min(rule_depth)
            .min(parts.len());

        let mut out = self.rule_prefix(rule);
        for part in &parts[skip..] {
            out.push('/');
            out.push_str(part);
        }
        out
    }

    /// Map a backup path back to the source path it mirrors.
    ///
    /// With a reduction of N, the first N segments of `rule.path` are put
    /// back in front of the backup-relative remainder. A reduction larger
    /// than the rule path's segment count degrades to using the whole rule
    /// path as the prefix.
    pub fn to_source_path(&self, backup: &str, rule: &BackupRule) -> String {
        let normalized = normalize(backup);
        let prefix = self.rule_prefix(rule);
        let remainder = strip_dir_prefix(&normalized, &prefix).unwrap_or(&normalized);

        let rule_path = normalize(&rule.path);
        let (drive, rest) = split_drive(&rule_path);

        let mut out = String::from(drive);
        if let Some(n) = self.reduction(rule) {
            let rule_parts = segments(rest);
            let keep = n.min(rule_parts.len());
            for part in &rule_parts[..keep] {
                out.push('/');
                out.push_str(part);
            }
        }
        if !remainder.is_empty() {
            out.push('/');
            out.push_str(remainder);
        }
        if out.len() == drive.len() {
            out.push('/');
        }
        out
    }

    /// Path of `backup` relative to the rule's backup root, `""` for the
    /// root itself.
    pub fn rule_relative(&self, backup: &str, rule: &BackupRule) -> Option<String> {
        let normalized = normalize(backup);
        strip_dir_prefix(&normalized, &self.rule_backup_root(rule)).map(String::from)
    }

    /// The backup directory mirroring `rule.path` itself.
    pub fn rule_backup_root(&self, rule: &BackupRule) -> String {
        self.to_backup_path(&rule.path, rule)
    }

    /// Express a backup path relative to the backup root. This is the key
    /// used by the timestamp ledger.
    pub fn backup_key(&self, backup: &str) -> String {
        let normalized = normalize(backup);
        strip_dir_prefix(&normalized, &self.backup_root)
            .map(String::from)
            .unwrap_or_else(|| normalized.clone())
    }

    /// Rebuild an absolute backup path from a ledger key.
    pub fn from_backup_key(&self, key: &str) -> String {
        format!("{}/{}", self.backup_root, key.trim_start_matches('/'))
    }

    fn rule_prefix(&self, rule: &BackupRule) -> String {
        let subpath = normalize(rule.subpath_str());
        if subpath.is_empty() {
            self.backup_root.clone()
        } else {
            format!("{}/{}", self.backup_root, subpath)
        }
    }
}

/// Replace platform separators with `/`.
pub fn normalize(path: &str) -> String {
    path.replace('\\', "/")
}

/// Split a leading Windows drive (`C:`) off a normalized path.
fn split_drive(path: &str) -> (&str, &str) {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        path.split_at(2)
    } else {
        ("", path)
    }
}

/// `path` relative to `root`, both normalized first. `None` when `path` is
/// not below `root`.
pub fn relative_to(path: &str, root: &str) -> Option<String> {
    let path = normalize(path);
    let root = normalize(root);
    strip_dir_prefix(&path, root.trim_end_matches('/')).map(String::from)
}

/// Strip `prefix` only at a segment boundary, returning the relative rest.
fn strip_dir_prefix<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = path.strip_prefix(prefix)?;
    if rest.is_empty() {
        Some(rest)
    } else if rest.starts_with('/') || prefix.ends_with('/') {
        Some(rest.trim_start_matches('/'))
    } else {
        None
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
