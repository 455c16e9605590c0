//! Interactive terminal front end: progress bars, the change preview and
//! collision prompts.
//!
//! [`Terminal`] is both the progress sink and the decision sink of a run, so
//! it can hide its progress bars while a prompt is on screen.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{Local, TimeZone};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use dialoguer::{Confirm, Select};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use dirmirror_core::conflict::{Collision, Decision, DecisionSink};
use dirmirror_core::instruction::{ChangeInstruction, InstructionSet};
use dirmirror_core::models::{format_bytes, PreRunSummary, RunSummary};
use dirmirror_core::sinks::ProgressSink;

use crate::style;

/// Files larger than this get a per-file percentage in the progress line.
const LARGE_FILE: u64 = 16 * 1024 * 1024;

pub struct Terminal {
    preview: bool,
    scan: ProgressBar,
    run: Mutex<Option<ProgressBar>>,
}

impl Terminal {
    /// `preview` shows the table of planned changes before confirmation.
    pub fn new(preview: bool) -> Self {
        let scan = ProgressBar::new_spinner();
        scan.set_style(
            ProgressStyle::with_template("{spinner:.blue} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        scan.set_message("Scanning...");
        scan.enable_steady_tick(Duration::from_millis(100));
        Self {
            preview,
            scan,
            run: Mutex::new(None),
        }
    }

    fn with_run_bar(&self, f: impl FnOnce(&ProgressBar)) {
        if let Ok(bar) = self.run.lock() {
            if let Some(bar) = bar.as_ref() {
                f(bar);
            }
        }
    }
}

impl ProgressSink for Terminal {
    fn scan_progress(&self, files_found: usize, current: &Path) {
        self.scan.set_message(format!(
            "Scanning... {files_found} files {}",
            style::dim(&current.display().to_string())
        ));
    }

    fn pre_run(&self, summary: &PreRunSummary) {
        self.scan.finish_and_clear();
        println!();
        println!("{}", style::header(&summary.to_string()));
        println!("  {}", summary.space_line());
        println!();

        if summary.total == 0 {
            return;
        }
        let bar = ProgressBar::new(summary.total as u64);
        bar.set_style(
            ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {wide_msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        if let Ok(mut slot) = self.run.lock() {
            *slot = Some(bar);
        }
    }

    fn file_started(&self, instruction: &ChangeInstruction) {
        self.with_run_bar(|bar| bar.set_message(instruction.source().display().to_string()));
    }

    fn copy_progress(&self, target: &Path, bytes_copied: u64, total: u64) {
        if total < LARGE_FILE {
            return;
        }
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let percent = bytes_copied.saturating_mul(100) / total;
        self.with_run_bar(|bar| bar.set_message(format!("{name} {percent}%")));
    }

    fn file_finished(&self, _instruction: &ChangeInstruction, _ok: bool) {
        self.with_run_bar(|bar| bar.inc(1));
    }

    fn run_finished(&self, _summary: &RunSummary) {
        self.scan.finish_and_clear();
        if let Ok(mut slot) = self.run.lock() {
            if let Some(bar) = slot.take() {
                bar.finish_and_clear();
            }
        }
    }
}

impl DecisionSink for Terminal {
    fn decide(&self, collision: &Collision) -> Decision {
        self.scan.suspend(|| {
            println!();
            println!(
                "{}",
                style::warn(&format!("Collision: {} changed on both sides", collision.key))
            );
            println!(
                "  Source : {}  {}",
                collision.source_path.display(),
                style::dim(&local_time(collision.source_mtime))
            );
            println!(
                "  Backup : {}  {}",
                collision.backup_path.display(),
                style::dim(&local_time(collision.backup_mtime))
            );
            println!(
                "  Last sync: {}",
                style::dim(&local_time(collision.last_sync))
            );

            let labels: Vec<&str> = Decision::ALL.iter().map(|d| d.label()).collect();
            match Select::new()
                .with_prompt("Which version should be kept?")
                .items(&labels)
                .default(2)
                .interact()
            {
                Ok(index) => Decision::ALL.get(index).copied().unwrap_or(Decision::Skip),
                Err(e) => {
                    warn!(key = %collision.key, error = %e, "prompt failed, skipping collision");
                    Decision::Skip
                }
            }
        })
    }

    fn confirm_run(&self, summary: &PreRunSummary, instructions: &InstructionSet) -> bool {
        if self.preview {
            println!("{}", preview_table(instructions));
            println!();
        }
        let confirmed = self.scan.suspend(|| {
            Confirm::new()
                .with_prompt(format!("Apply {} changes?", summary.total))
                .default(true)
                .interact()
        });
        match confirmed {
            Ok(answer) => answer,
            Err(e) => {
                warn!(error = %e, "confirmation prompt failed");
                false
            }
        }
    }
}

/// Table of planned changes, sorted by change type.
pub fn preview_table(instructions: &InstructionSet) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        "Change", "Forced", "Source", "Size", "Modified", "Target", "Size", "Modified",
    ]);

    for instruction in instructions.sorted() {
        let target = instruction.target();
        table.add_row(vec![
            Cell::new(style::change_label(instruction.change_type())),
            Cell::new(if instruction.is_forced() { "yes" } else { "" }),
            Cell::new(instruction.source().display()),
            Cell::new(format_bytes(instruction.source_size().into())),
            Cell::new(local_time(instruction.source_mtime())),
            Cell::new(target.map(|t| t.display().to_string()).unwrap_or_default()),
            Cell::new(if target.is_some() {
                format_bytes(instruction.target_size().into())
            } else {
                String::new()
            }),
            Cell::new(if target.is_some() {
                local_time(instruction.target_mtime())
            } else {
                String::new()
            }),
        ]);
    }
    table
}

/// Render epoch seconds in local time, `-` when unknown.
pub fn local_time(epoch: f64) -> String {
    if epoch <= 0.0 {
        return "-".into();
    }
    Local
        .timestamp_opt(epoch.trunc() as i64, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".into())
}
