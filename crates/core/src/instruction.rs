//! Change instructions and the deduplicating set that collects them.

use std::collections::{BTreeMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::errors::InstructionError;
use crate::scanner::file_times;

// ---------------------------------------------------------------------------
// Change types
// ---------------------------------------------------------------------------

/// Every kind of change the engine knows about.
///
/// `Folder` and `Rename` are reported as events by the executor and are
/// never queued as instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// Copy source over an existing backup file.
    #[serde(rename = "update")]
    UpdateForward,
    /// Copy backup over an existing source file.
    UpdateBackward,
    /// Copy a source file that has no backup yet.
    Create,
    /// Copy a backup file that has no source yet.
    CreateBackward,
    Remove,
    RemoveFolder,
    Folder,
    Rename,
}

impl ChangeType {
    pub const ALL: [ChangeType; 8] = [
        Self::UpdateForward,
        Self::UpdateBackward,
        Self::Create,
        Self::CreateBackward,
        Self::Remove,
        Self::RemoveFolder,
        Self::Folder,
        Self::Rename,
    ];

    /// Stable identifier, accepted back by [`FromStr`].
    pub fn label(self) -> &'static str {
        match self {
            Self::UpdateForward => "update",
            Self::UpdateBackward => "update_backward",
            Self::Create => "create",
            Self::CreateBackward => "create_backward",
            Self::Remove => "remove",
            Self::RemoveFolder => "remove_folder",
            Self::Folder => "folder",
            Self::Rename => "rename",
        }
    }

    /// Human-readable name, with the copy direction for copies.
    pub fn display_name(self) -> &'static str {
        match self {
            Self::UpdateForward => "Update S => B",
            Self::UpdateBackward => "Update S <= B",
            Self::Create => "Create S => B",
            Self::CreateBackward => "Create S <= B",
            Self::Remove => "Remove",
            Self::RemoveFolder => "RemoveFolder",
            Self::Folder => "CreateFolder",
            Self::Rename => "Rename",
        }
    }

    /// Name of the change log this type is written to.
    pub fn category(self) -> &'static str {
        match self {
            Self::UpdateForward | Self::UpdateBackward => "updates",
            Self::Create | Self::CreateBackward => "additions",
            Self::Remove => "removals",
            Self::RemoveFolder => "folderremovals",
            Self::Folder => "folders",
            Self::Rename => "renames",
        }
    }

    pub fn is_copy(self) -> bool {
        matches!(
            self,
            Self::UpdateForward | Self::UpdateBackward | Self::Create | Self::CreateBackward
        )
    }

    /// Copies that write into the source tree.
    pub fn is_backward(self) -> bool {
        matches!(self, Self::UpdateBackward | Self::CreateBackward)
    }

    pub fn is_removal(self) -> bool {
        matches!(self, Self::Remove | Self::RemoveFolder)
    }

    /// Whether the executor can apply this type.
    pub fn is_executable(self) -> bool {
        !matches!(self, Self::Folder | Self::Rename)
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for ChangeType {
    type Err = InstructionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.label() == s)
            .ok_or_else(|| InstructionError::InvalidChangeType(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

/// One operation to apply.
///
/// For copies `source` is read and `target` is written. For removals
/// `source` is the path to delete and `target` is `None`. Sizes and times
/// are snapshots taken at construction; call [`refresh`](Self::refresh) to
/// re-stat.
#[derive(Debug, Clone)]
pub struct ChangeInstruction {
    change_type: ChangeType,
    source: PathBuf,
    target: Option<PathBuf>,
    forced: bool,
    ledger_key: Option<String>,
    source_size: u64,
    target_size: u64,
    source_mtime: f64,
    target_mtime: f64,
}

fn check(
    change_type: ChangeType,
    source: &Path,
    target: Option<&Path>,
) -> Result<(), InstructionError> {
    if !change_type.is_executable() {
        return Err(InstructionError::NotExecutable(
            change_type.label().to_string(),
        ));
    }
    if change_type.is_copy() && target.is_none() {
        return Err(InstructionError::MissingTarget {
            change_type: change_type.label().to_string(),
            source_path: source.to_path_buf(),
        });
    }
    Ok(())
}

impl ChangeInstruction {
    /// Build and validate an instruction.
    pub fn new(
        change_type: ChangeType,
        source: impl Into<PathBuf>,
        target: Option<PathBuf>,
        forced: bool,
    ) -> Result<Self, InstructionError> {
        let source = source.into();
        check(change_type, &source, target.as_deref())?;
        let mut instruction = Self {
            change_type,
            source,
            target,
            forced,
            ledger_key: None,
            source_size: 0,
            target_size: 0,
            source_mtime: 0.0,
            target_mtime: 0.0,
        };
        instruction.refresh();
        Ok(instruction)
    }

    /// Re-check the construction invariants.
    pub fn validate(&self) -> Result<(), InstructionError> {
        check(self.change_type, &self.source, self.target.as_deref())
    }

    /// An instruction that skips validation, for exercising the executor's
    /// own checks.
    #[cfg(test)]
    pub(crate) fn unchecked(
        change_type: ChangeType,
        source: impl Into<PathBuf>,
        target: Option<PathBuf>,
    ) -> Self {
        Self {
            change_type,
            source: source.into(),
            target,
            forced: false,
            ledger_key: None,
            source_size: 0,
            target_size: 0,
            source_mtime: 0.0,
            target_mtime: 0.0,
        }
    }

    /// Attach the backup-relative ledger key this instruction affects.
    pub fn with_ledger_key(mut self, key: impl Into<String>) -> Self {
        self.ledger_key = Some(key.into());
        self
    }

    pub fn change_type(&self) -> ChangeType {
        self.change_type
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn target(&self) -> Option<&Path> {
        self.target.as_deref()
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn ledger_key(&self) -> Option<&str> {
        self.ledger_key.as_deref()
    }

    pub fn source_size(&self) -> u64 {
        self.source_size
    }

    pub fn target_size(&self) -> u64 {
        self.target_size
    }

    pub fn source_mtime(&self) -> f64 {
        self.source_mtime
    }

    pub fn target_mtime(&self) -> f64 {
        self.target_mtime
    }

    /// Signed change in used space. Removals free the removed size.
    pub fn diff_space(&self) -> i64 {
        if self.change_type.is_removal() {
            -(self.source_size as i64)
        } else {
            self.source_size as i64 - self.target_size as i64
        }
    }

    /// Bytes moved or freed, regardless of direction.
    pub fn diff_size(&self) -> u64 {
        self.diff_space().unsigned_abs()
    }

    /// Re-stat source and target.
    pub fn refresh(&mut self) {
        (self.source_size, self.source_mtime) = stat_snapshot(Some(&self.source));
        (self.target_size, self.target_mtime) = stat_snapshot(self.target.as_deref());
    }

    fn identity(&self) -> (ChangeType, &Path, Option<&Path>) {
        (self.change_type, &self.source, self.target.as_deref())
    }
}

impl PartialEq for ChangeInstruction {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for ChangeInstruction {}

impl Hash for ChangeInstruction {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

impl std::fmt::Display for ChangeInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}{}]:{}",
            self.change_type,
            if self.forced { "<F>" } else { "" },
            self.source.display()
        )?;
        if let Some(target) = &self.target {
            write!(f, " -> {}", target.display())?;
        }
        Ok(())
    }
}

/// Size and mtime of a file, zero when missing or a directory.
fn stat_snapshot(path: Option<&Path>) -> (u64, f64) {
    let Some(path) = path else {
        return (0, 0.0);
    };
    match std::fs::metadata(path) {
        Ok(meta) => {
            let size = if meta.is_dir() { 0 } else { meta.len() };
            (size, file_times(&meta).0)
        }
        Err(_) => (0, 0.0),
    }
}

// ---------------------------------------------------------------------------
// Instruction set
// ---------------------------------------------------------------------------

/// Deduplicated instructions in insertion order, with cached aggregates.
#[derive(Debug, Default)]
pub struct InstructionSet {
    items: Vec<ChangeInstruction>,
    seen: HashSet<(ChangeType, PathBuf, Option<PathBuf>)>,
    space_requirement: OnceLock<i64>,
    bytes_to_modify: OnceLock<u64>,
}

impl InstructionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `instruction` unless an identical one is present. Returns
    /// whether it was added.
    pub fn insert(&mut self, instruction: ChangeInstruction) -> bool {
        let key = (
            instruction.change_type,
            instruction.source.clone(),
            instruction.target.clone(),
        );
        if !self.seen.insert(key) {
            return false;
        }
        self.items.push(instruction);
        self.invalidate();
        true
    }

    /// Build an instruction and add it.
    pub fn add(
        &mut self,
        change_type: ChangeType,
        source: impl Into<PathBuf>,
        target: Option<PathBuf>,
        forced: bool,
    ) -> Result<bool, InstructionError> {
        Ok(self.insert(ChangeInstruction::new(change_type, source, target, forced)?))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ChangeInstruction> {
        self.items.iter()
    }

    pub fn contains(&self, instruction: &ChangeInstruction) -> bool {
        self.items.contains(instruction)
    }

    /// Sum of every member's signed space delta.
    pub fn space_requirement(&self) -> i64 {
        *self
            .space_requirement
            .get_or_init(|| self.items.iter().map(ChangeInstruction::diff_space).sum())
    }

    /// Sum of every member's absolute size delta.
    pub fn bytes_to_modify(&self) -> u64 {
        *self
            .bytes_to_modify
            .get_or_init(|| self.items.iter().map(ChangeInstruction::diff_size).sum())
    }

    pub fn counts_by_type(&self) -> BTreeMap<ChangeType, usize> {
        let mut counts = BTreeMap::new();
        for item in &self.items {
            *counts.entry(item.change_type).or_insert(0) += 1;
        }
        counts
    }

    /// Members ordered by change type, then source path.
    pub fn sorted(&self) -> Vec<&ChangeInstruction> {
        let mut sorted: Vec<_> = self.items.iter().collect();
        sorted.sort_by(|a, b| {
            a.change_type
                .cmp(&b.change_type)
                .then_with(|| a.source.cmp(&b.source))
        });
        sorted
    }

    /// Re-stat every member and drop the cached aggregates.
    pub fn refresh(&mut self) {
        for item in &mut self.items {
            item.refresh();
        }
        self.invalidate();
    }

    pub fn into_vec(self) -> Vec<ChangeInstruction> {
        self.items
    }

    fn invalidate(&mut self) {
        self.space_requirement = OnceLock::new();
        self.bytes_to_modify = OnceLock::new();
    }
}

impl Extend<ChangeInstruction> for InstructionSet {
    fn extend<I: IntoIterator<Item = ChangeInstruction>>(&mut self, iter: I) {
        for instruction in iter {
            self.insert(instruction);
        }
    }
}

impl<'a> IntoIterator for &'a InstructionSet {
    type Item = &'a ChangeInstruction;
    type IntoIter = std::slice::Iter<'a, ChangeInstruction>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_label_round_trip() {
        for t in ChangeType::ALL {
            assert_eq!(t.label().parse::<ChangeType>().unwrap(), t);
        }
        assert_eq!(
            "bogus".parse::<ChangeType>(),
            Err(InstructionError::InvalidChangeType("bogus".into()))
        );
        assert_eq!(ChangeType::UpdateBackward.display_name(), "Update S <= B");
        assert_eq!(ChangeType::RemoveFolder.category(), "folderremovals");
    }

    #[test]
    fn test_serde_uses_labels() {
        let json = serde_json::to_string(&ChangeType::UpdateForward).unwrap();
        assert_eq!(json, "\"update\"");
        let parsed: ChangeType = serde_json::from_str("\"create_backward\"").unwrap();
        assert_eq!(parsed, ChangeType::CreateBackward);
    }

    #[test]
    fn test_construction_is_validated() {
        let err = ChangeInstruction::new(ChangeType::Create, "/src/a", None, false).unwrap_err();
        assert!(matches!(err, InstructionError::MissingTarget { .. }));

        let err = ChangeInstruction::new(ChangeType::Folder, "/bkp/d", None, false).unwrap_err();
        assert_eq!(err, InstructionError::NotExecutable("folder".into()));

        assert!(ChangeInstruction::new(ChangeType::Remove, "/bkp/a", None, false).is_ok());
    }

    #[test]
    fn test_dedup_and_aggregates() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        let old = dir.path().join("old.bin");
        fs::write(&src, vec![0u8; 100]).unwrap();
        fs::write(&dst, vec![0u8; 40]).unwrap();
        fs::write(&old, vec![0u8; 25]).unwrap();

        let mut set = InstructionSet::new();
        assert!(set
            .add(ChangeType::UpdateForward, &src, Some(dst.clone()), false)
            .unwrap());
        assert_eq!(set.space_requirement(), 60);
        assert_eq!(set.bytes_to_modify(), 60);

        // Same identity, different forced flag: still a duplicate.
        assert!(!set
            .add(ChangeType::UpdateForward, &src, Some(dst.clone()), true)
            .unwrap());
        assert_eq!(set.len(), 1);

        assert!(set.add(ChangeType::Remove, &old, None, false).unwrap());
        assert_eq!(set.space_requirement(), 35);
        assert_eq!(set.bytes_to_modify(), 85);

        let total: i64 = set.iter().map(ChangeInstruction::diff_space).sum();
        assert_eq!(set.space_requirement(), total);
        assert_eq!(set.counts_by_type()[&ChangeType::Remove], 1);
    }

    #[test]
    fn test_refresh_picks_up_new_sizes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        fs::write(&src, "1234").unwrap();
        let mut set = InstructionSet::new();
        set.add(ChangeType::Create, &src, Some(dir.path().join("b")), false)
            .unwrap();
        assert_eq!(set.space_requirement(), 4);

        fs::write(&src, "12345678").unwrap();
        assert_eq!(set.space_requirement(), 4);
        set.refresh();
        assert_eq!(set.space_requirement(), 8);
    }

    #[test]
    fn test_display_marks_forced() {
        let inst = ChangeInstruction::new(
            ChangeType::UpdateForward,
            "/src/a",
            Some(PathBuf::from("/bkp/a")),
            true,
        )
        .unwrap();
        assert_eq!(inst.to_string(), "[update<F>]:/src/a -> /bkp/a");
    }

    #[test]
    fn test_sorted_orders_by_type() {
        let mut set = InstructionSet::new();
        set.add(ChangeType::Remove, "/bkp/z", None, false).unwrap();
        set.add(ChangeType::Create, "/src/b", Some(PathBuf::from("/bkp/b")), false)
            .unwrap();
        set.add(ChangeType::Create, "/src/a", Some(PathBuf::from("/bkp/a")), false)
            .unwrap();
        let order: Vec<_> = set.sorted().iter().map(|i| i.source().to_path_buf()).collect();
        assert_eq!(
            order,
            vec![
                PathBuf::from("/src/a"),
                PathBuf::from("/src/b"),
                PathBuf::from("/bkp/z")
            ]
        );
    }
}
