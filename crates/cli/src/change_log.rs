//! Per-category change logs.
//!
//! Every applied change is appended to `<log_dir>/<category>.log` (for
//! example `additions.log` or `removals.log`) and every error to
//! `errors.log`, one timestamped line each. Files are opened lazily and
//! kept open for the rest of the run.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;
use tracing::warn;

use dirmirror_core::sinks::{ChangeEvent, ChangeLogSink, ErrorEvent, ERROR_CATEGORY};

pub struct FileChangeLog {
    dir: PathBuf,
    files: Mutex<HashMap<&'static str, File>>,
}

impl FileChangeLog {
    pub fn new(dir: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Path of the log file for `category`.
    pub fn path_for(&self, category: &str) -> PathBuf {
        self.dir.join(format!("{category}.log"))
    }

    fn append(&self, category: &'static str, line: &str) {
        let Ok(mut files) = self.files.lock() else {
            return;
        };
        let file = match files.entry(category) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = self.path_for(category);
                match OpenOptions::new().create(true).append(true).open(&path) {
                    Ok(file) => entry.insert(file),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "cannot open change log");
                        return;
                    }
                }
            }
        };
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Err(e) = writeln!(file, "[{stamp}] {line}") {
            warn!(category, error = %e, "cannot write change log");
        }
    }
}

impl ChangeLogSink for FileChangeLog {
    fn change(&self, event: &ChangeEvent) {
        self.append(event.category(), &event.message);
    }

    fn error(&self, event: &ErrorEvent) {
        self.append(ERROR_CATEGORY, &event.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirmirror_core::instruction::{ChangeInstruction, ChangeType};

    #[test]
    fn test_events_land_in_category_files() {
        let dir = tempfile::tempdir().unwrap();
        let log = FileChangeLog::new(&dir.path().join("logs")).unwrap();

        let create = ChangeInstruction::new(
            ChangeType::Create,
            "/src/a.txt",
            Some("/bkp/a.txt".into()),
            false,
        )
        .unwrap();
        log.change(&ChangeEvent::applied(&create));
        log.change(&ChangeEvent::folder_created(Path::new("/bkp/new")));
        log.error(&ErrorEvent::new("/src/b.txt", "permission denied"));
        log.error(&ErrorEvent::new("/src/c.txt", "disk full"));

        let additions = std::fs::read_to_string(log.path_for("additions")).unwrap();
        assert!(additions.contains("/src/a.txt"));
        assert_eq!(additions.lines().count(), 1);

        let folders = std::fs::read_to_string(log.path_for("folders")).unwrap();
        assert!(folders.contains("Created folder"));

        let errors = std::fs::read_to_string(log.path_for(ERROR_CATEGORY)).unwrap();
        assert_eq!(errors.lines().count(), 2);
        assert!(errors.contains("permission denied"));
        assert!(errors.starts_with('['));
    }
}
