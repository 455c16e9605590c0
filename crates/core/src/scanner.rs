//! Directory tree scanning.
//!
//! Walks are built on `walkdir` and follow symbolic links, except directory
//! links pointing back into the tree being walked. Ignored prefixes prune
//! whole subtrees. Entries that vanish mid-walk or resolve to an
//! unreachable link are reported as [`ScanError`]s next to the result and
//! never abort the walk.

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::ScanError;
use crate::ignore::IgnoreRules;
use crate::sinks::{NullProgress, ProgressSink};

// ---------------------------------------------------------------------------
// File handles
// ---------------------------------------------------------------------------

/// Metadata snapshot of one scanned entry, taken when the entry was seen.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHandle {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
    pub size: u64,
    /// Modification time, epoch seconds.
    pub modified: f64,
    /// Birth time when the platform reports one, else the modification time.
    pub created: f64,
}

impl FileHandle {
    /// Stat `path` (following links) into a handle.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let meta = std::fs::metadata(path).map_err(|e| classify(path, &e))?;
        Ok(Self::from_metadata(path, &meta))
    }

    pub fn from_metadata(path: &Path, meta: &Metadata) -> Self {
        let (modified, created) = file_times(meta);
        Self {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified,
            created,
        }
    }

    /// Re-stat the entry, replacing the snapshot.
    pub fn refresh(&mut self) -> Result<(), ScanError> {
        *self = Self::from_path(&self.path)?;
        Ok(())
    }

    /// The later of the modification and creation times.
    pub fn latest_change(&self) -> f64 {
        self.modified.max(self.created)
    }
}

/// Modification and creation times of `meta` as epoch seconds.
///
/// Creation time falls back to the modification time where the platform
/// has no birth time; inode change time is never used.
pub fn file_times(meta: &Metadata) -> (f64, f64) {
    let modified = meta.modified().map(epoch_secs).unwrap_or(0.0);
    let created = meta.created().map(epoch_secs).unwrap_or(modified);
    (modified, created)
}

/// Convert a [`SystemTime`] to floating epoch seconds.
pub fn epoch_secs(t: SystemTime) -> f64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

// ---------------------------------------------------------------------------
// Scan tree
// ---------------------------------------------------------------------------

/// One node of a [`ScanTree`].
#[derive(Debug, Clone, PartialEq)]
pub enum ScanNode {
    Dir(ScanTree),
    File(FileHandle),
}

/// Recursive name -> node mapping for one directory.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanTree {
    pub entries: BTreeMap<String, ScanNode>,
}

impl ScanTree {
    /// Follow a `/`-separated relative path.
    pub fn lookup(&self, rel: &str) -> Option<&ScanNode> {
        let mut parts = rel.split('/').filter(|p| !p.is_empty());
        let first = parts.next()?;
        let mut node = self.entries.get(first)?;
        for part in parts {
            match node {
                ScanNode::Dir(tree) => node = tree.entries.get(part)?,
                ScanNode::File(_) => return None,
            }
        }
        Some(node)
    }

    pub fn contains(&self, rel: &str) -> bool {
        self.lookup(rel).is_some()
    }

    /// Number of files below this tree.
    pub fn file_count(&self) -> usize {
        self.entries
            .values()
            .map(|n| match n {
                ScanNode::Dir(t) => t.file_count(),
                ScanNode::File(_) => 1,
            })
            .sum()
    }

    fn insert(&mut self, parts: &[String], node: ScanNode) {
        let Some((last, dirs)) = parts.split_last() else {
            return;
        };
        let mut tree = self;
        for dir in dirs {
            let entry = tree
                .entries
                .entry(dir.clone())
                .or_insert_with(|| ScanNode::Dir(ScanTree::default()));
            if !matches!(entry, ScanNode::Dir(_)) {
                *entry = ScanNode::Dir(ScanTree::default());
            }
            let ScanNode::Dir(t) = entry else {
                return;
            };
            tree = t;
        }
        match node {
            ScanNode::Dir(_) => {
                tree.entries
                    .entry(last.clone())
                    .or_insert_with(|| ScanNode::Dir(ScanTree::default()));
            }
            file => {
                tree.entries.insert(last.clone(), file);
            }
        }
    }
}

/// A scan result plus the recoverable errors met along the way.
#[derive(Debug, Clone)]
pub struct ScanOutcome<T> {
    pub result: T,
    pub errors: Vec<ScanError>,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

/// Walks trees and reports a running file count to a progress sink.
///
/// A scanner is `Sync` and can be shared across parallel rule scans.
pub struct Scanner<'a> {
    progress: &'a dyn ProgressSink,
    found: AtomicUsize,
}

impl<'a> Scanner<'a> {
    pub fn new(progress: &'a dyn ProgressSink) -> Self {
        Self {
            progress,
            found: AtomicUsize::new(0),
        }
    }

    /// Files seen so far across every walk made by this scanner.
    pub fn files_found(&self) -> usize {
        self.found.load(Ordering::Relaxed)
    }

    /// Build a [`ScanTree`] for `root`.
    ///
    /// Returns `None` when `root` does not exist, and a single
    /// [`ScanNode::File`] when it is a file.
    pub fn scan_tree(&self, root: &Path, ignore: &IgnoreRules) -> ScanOutcome<Option<ScanNode>> {
        let mut errors = Vec::new();
        let root_meta = match std::fs::metadata(root) {
            Ok(meta) => meta,
            Err(_) => {
                return ScanOutcome {
                    result: None,
                    errors,
                }
            }
        };
        if !root_meta.is_dir() {
            self.bump(root);
            return ScanOutcome {
                result: Some(ScanNode::File(FileHandle::from_metadata(root, &root_meta))),
                errors,
            };
        }

        let mut tree = ScanTree::default();
        self.walk(root, ignore, |item| match item {
            Ok((parts, handle)) => {
                let node = if handle.is_dir {
                    ScanNode::Dir(ScanTree::default())
                } else {
                    ScanNode::File(handle)
                };
                tree.insert(&parts, node);
            }
            Err(e) => errors.push(e),
        });
        debug!(root = %root.display(), files = tree.file_count(), "scanned tree");
        ScanOutcome {
            result: Some(ScanNode::Dir(tree)),
            errors,
        }
    }

    /// Every file below `root` (or `root` itself when it is a file).
    pub fn list_files_recursive(
        &self,
        root: &Path,
        ignore: &IgnoreRules,
    ) -> ScanOutcome<Vec<FileHandle>> {
        let mut outcome = self.list_entries_recursive(root, ignore);
        outcome.result.retain(|h| !h.is_dir);
        outcome
    }

    /// Like [`list_files_recursive`](Self::list_files_recursive), but also
    /// yields directories (never the root itself).
    pub fn list_entries_recursive(
        &self,
        root: &Path,
        ignore: &IgnoreRules,
    ) -> ScanOutcome<Vec<FileHandle>> {
        let mut errors = Vec::new();
        let root_meta = match std::fs::metadata(root) {
            Ok(meta) => meta,
            Err(_) => {
                warn!(root = %root.display(), "scan root not found");
                errors.push(ScanError::RootMissing(root.to_path_buf()));
                return ScanOutcome {
                    result: Vec::new(),
                    errors,
                };
            }
        };
        if !root_meta.is_dir() {
            if ignore.is_ignored(root) {
                return ScanOutcome {
                    result: Vec::new(),
                    errors,
                };
            }
            self.bump(root);
            return ScanOutcome {
                result: vec![FileHandle::from_metadata(root, &root_meta)],
                errors,
            };
        }

        let mut result = Vec::new();
        self.walk(root, ignore, |item| match item {
            Ok((_, handle)) => result.push(handle),
            Err(e) => errors.push(e),
        });
        ScanOutcome { result, errors }
    }

    /// Walk below `root`, handing relative path components and handles to
    /// `visit`.
    fn walk(
        &self,
        root: &Path,
        ignore: &IgnoreRules,
        mut visit: impl FnMut(Result<(Vec<String>, FileHandle), ScanError>),
    ) {
        let canonical_root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let walker = WalkDir::new(root)
            .follow_links(true)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| {
                !ignore.is_ignored(e.path()) && !links_back_inside(e, &canonical_root)
            });

        for item in walker {
            let entry = match item {
                Ok(entry) => entry,
                Err(e) => {
                    visit(Err(walk_error(&e)));
                    continue;
                }
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    visit(Err(walk_error(&e)));
                    continue;
                }
            };
            let parts: Vec<String> = entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let handle = FileHandle::from_metadata(entry.path(), &meta);
            if !handle.is_dir {
                self.bump(entry.path());
            }
            visit(Ok((parts, handle)));
        }
    }

    fn bump(&self, current: &Path) {
        let n = self.found.fetch_add(1, Ordering::Relaxed) + 1;
        self.progress.scan_progress(n, current);
    }
}

/// A directory symlink whose target already lies under the scan root. Its
/// files are reached through their real path.
fn links_back_inside(entry: &walkdir::DirEntry, canonical_root: &Path) -> bool {
    if !entry.path_is_symlink() || !entry.file_type().is_dir() {
        return false;
    }
    match std::fs::canonicalize(entry.path()) {
        Ok(target) if target.starts_with(canonical_root) => {
            debug!(link = %entry.path().display(), target = %target.display(), "skipping link into scanned tree");
            true
        }
        _ => false,
    }
}

/// Build a [`ScanTree`] without progress reporting.
pub fn scan_tree(root: &Path, ignore: &IgnoreRules) -> ScanOutcome<Option<ScanNode>> {
    Scanner::new(&NullProgress).scan_tree(root, ignore)
}

/// List files below `root` without progress reporting.
pub fn list_files_recursive(root: &Path, ignore: &IgnoreRules) -> ScanOutcome<Vec<FileHandle>> {
    Scanner::new(&NullProgress).list_files_recursive(root, ignore)
}

fn walk_error(e: &walkdir::Error) -> ScanError {
    let path = e.path().map(Path::to_path_buf).unwrap_or_default();
    let err = match e.io_error() {
        Some(io) => classify(&path, io),
        None => ScanError::Unreadable {
            path,
            detail: e.to_string(),
        },
    };
    warn!(error = %err, "skipping entry");
    err
}

/// Classify an I/O error on `path` into a scan error.
fn classify(path: &Path, err: &std::io::Error) -> ScanError {
    if err.kind() == std::io::ErrorKind::NotFound {
        if path.symlink_metadata().is_ok() {
            ScanError::BrokenLink(path.to_path_buf())
        } else {
            ScanError::Vanished(path.to_path_buf())
        }
    } else {
        ScanError::Unreadable {
            path: path.to_path_buf(),
            detail: err.to_string(),
        }
    }
}
