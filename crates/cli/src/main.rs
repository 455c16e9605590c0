//! dirmirror command-line tool.
//!
//! Runs the configured mirroring rules (the default command), writes a
//! starter configuration, validates a configuration file, and inspects or
//! edits the timestamp ledger.

mod change_log;
mod signals;
mod style;
mod terminal;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use dirmirror_core::config::{expand_tilde_path, MirrorConfig, Mode};
use dirmirror_core::conflict::{DecisionSink, SkipAll};
use dirmirror_core::ledger::{ResolutionMode, TimestampLedger};
use dirmirror_core::models::{format_bytes, RunOutcome};
use dirmirror_core::path_map::PathMapper;
use dirmirror_core::session::{RunOptions, SyncSession};
use dirmirror_core::sinks::{ChangeLogSink, NullChangeLog, NullProgress, ProgressSink};

use crate::change_log::FileChangeLog;
use crate::terminal::Terminal;

const EXIT_INSUFFICIENT_SPACE: u8 = 2;
const EXIT_CANCELLED: u8 = 130;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Mirror directory trees into a backup root.
#[derive(Parser, Debug)]
#[command(
    name = "dirmirror",
    version,
    about = "Mirror, snapshot or two-way sync directory trees into a backup root"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "~/.config/dirmirror/config.toml"
    )]
    config: PathBuf,

    #[command(flatten)]
    flags: RunFlags,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Clone, Copy, Default)]
struct RunFlags {
    /// No progress bars or prompts. Collisions are skipped unless
    /// --auto-resolve is given.
    #[arg(long, global = true)]
    no_ui: bool,

    /// Do not ask for confirmation before applying changes.
    #[arg(long, global = true)]
    no_pause: bool,

    /// Resolve every collision in favour of the latest modification.
    #[arg(long, global = true)]
    auto_resolve: bool,

    /// Write neither the change logs nor the full log file.
    #[arg(long, global = true)]
    no_log: bool,

    /// Do not show the table of planned changes.
    #[arg(long, global = true)]
    skip_preview: bool,

    /// Print every error and log at debug level.
    #[arg(long, global = true)]
    verbose_errors: bool,

    /// Accepted for compatibility; dirmirror never checks for updates.
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every configured rule (the default).
    Run,

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file. Defaults to --config.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate a configuration file.
    Validate,

    /// Inspect or edit the timestamp ledger.
    Ledger {
        #[command(subcommand)]
        action: LedgerAction,
    },
}

#[derive(Subcommand, Debug)]
enum LedgerAction {
    /// Show the last sync time and the number of tracked paths.
    Status,
    /// Ask again on the next collision for a path that was set to
    /// "always take the latest".
    Forget {
        /// Path relative to the backup root, or an absolute backup path.
        path: String,
    },
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config_path = expand_tilde_path(&cli.config);
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Init { output } => {
            let output = output.map_or_else(|| config_path.clone(), |p| expand_tilde_path(&p));
            cmd_init(&output)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => {
            cmd_validate(&config_path)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ledger { action } => {
            let config = load_config(&config_path)?;
            let _guard = init_logging(&cli.flags, None)?;
            cmd_ledger(&config, action)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run => cmd_run(&config_path, cli.flags).await,
    }
}

// ---------------------------------------------------------------------------
// Setup helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<MirrorConfig> {
    MirrorConfig::load_and_resolve(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

/// Console logging filtered by `RUST_LOG` (fallback `warn`, or `debug` with
/// --verbose-errors), plus a full log file in `log_dir` unless --no-log.
fn init_logging(flags: &RunFlags, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let fallback = if flags.verbose_errors { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let console = fmt::layer()
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let (file, guard) = match log_dir {
        Some(dir) if !flags.no_log => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::never(dir, "full.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(LevelFilter::DEBUG);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("failed to initialize logging")?;
    Ok(guard)
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_run(config_path: &Path, flags: RunFlags) -> Result<ExitCode> {
    let config = load_config(config_path)?;
    let _guard = init_logging(&flags, Some(&config.general.log_dir))?;
    debug!(offline = flags.offline, "update checks are never performed");

    let log_dir = config.general.log_dir.clone();
    let session = Arc::new(SyncSession::open(config).context("failed to open sync session")?);
    let signal_task = tokio::spawn(signals::cancel_on_interrupt(session.cancel_flag()));

    let options = RunOptions {
        auto_resolve: flags.auto_resolve,
        confirm: !flags.no_pause && !flags.no_ui,
    };
    let worker = Arc::clone(&session);
    let outcome = tokio::task::spawn_blocking(move || -> Result<RunOutcome> {
        let terminal = (!flags.no_ui).then(|| Terminal::new(!flags.skip_preview));
        let progress: &dyn ProgressSink = match &terminal {
            Some(terminal) => terminal,
            None => &NullProgress,
        };
        let decisions: &dyn DecisionSink = match &terminal {
            Some(terminal) => terminal,
            None => &SkipAll,
        };
        let file_log = if flags.no_log {
            None
        } else {
            Some(FileChangeLog::new(&log_dir).context("failed to open change logs")?)
        };
        let log: &dyn ChangeLogSink = match &file_log {
            Some(log) => log,
            None => &NullChangeLog,
        };
        worker
            .run(&options, progress, decisions, log)
            .context("run failed")
    })
    .await
    .context("run task panicked")??;
    signal_task.abort();

    report(&outcome, &flags);
    Ok(exit_code(&outcome))
}

fn report(outcome: &RunOutcome, flags: &RunFlags) {
    println!();
    match outcome {
        RunOutcome::Success(summary) => {
            let line = summary.to_string();
            if summary.failed == 0 && summary.errors.is_empty() {
                println!("{}", style::success(&line));
            } else {
                println!("{}", style::warn(&line));
            }
        }
        RunOutcome::InsufficientSpace {
            required,
            available,
        } => {
            println!(
                "{}",
                style::error(&format!(
                    "Not enough free space on the backup volume: {} required, {} available.",
                    format_bytes((*required).into()),
                    format_bytes((*available).into())
                ))
            );
            return;
        }
        RunOutcome::Cancelled(summary) => {
            println!("{}", style::warn(&format!("Cancelled. {summary}")));
        }
    }

    let Some(summary) = outcome.summary() else {
        return;
    };
    if summary.errors.is_empty() {
        return;
    }
    if flags.verbose_errors {
        for error in &summary.errors {
            println!("  {}", style::error(error));
        }
    } else if !flags.no_log {
        println!(
            "  {}",
            style::dim("Details are in errors.log; use --verbose-errors to print them.")
        );
    }
}

fn exit_code(outcome: &RunOutcome) -> ExitCode {
    match outcome {
        RunOutcome::Success(_) => ExitCode::SUCCESS,
        RunOutcome::InsufficientSpace { .. } => ExitCode::from(EXIT_INSUFFICIENT_SPACE),
        RunOutcome::Cancelled(_) => ExitCode::from(EXIT_CANCELLED),
    }
}

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }
    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("failed to create config directory")?;
        }
    }
    std::fs::write(output, MirrorConfig::default_toml()).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Set backup_root and add one [[rules]] entry per directory");
    println!(
        "  2. Validate with: dirmirror validate --config {}",
        output.display()
    );
    println!("  3. Run with: dirmirror --config {}", output.display());

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        MirrorConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    config.resolve_paths();
    println!("  [OK] Home directory references expanded");

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    let mapper = PathMapper::new(&config.general.backup_root, config.general.path_reduction);
    println!();
    println!("Configuration summary:");
    println!("  Backup root   : {}", config.general.backup_root.display());
    println!("  Tolerance     : {}s", config.general.tolerance_secs);
    println!("  Workers       : {}", config.general.workers);
    println!("  Ledger        : {}", config.general.ledger_path.display());
    println!("  Log directory : {}", config.general.log_dir.display());
    println!("  Rules         : {}", config.rules.len());
    for rule in &config.rules {
        let marker = match rule.mode {
            Mode::Default => "default ",
            Mode::Snapshot => "snapshot",
            Mode::Sync => "sync    ",
        };
        println!(
            "    {} {} -> {}{}",
            marker,
            rule.path,
            mapper.rule_backup_root(rule),
            if Path::new(&rule.path).exists() {
                String::new()
            } else {
                format!("  {}", style::warn("source not found"))
            }
        );
    }
    println!();
    println!("Configuration is valid.");

    Ok(())
}

fn cmd_ledger(config: &MirrorConfig, action: LedgerAction) -> Result<()> {
    let path = &config.general.ledger_path;
    let mut ledger = TimestampLedger::open(path, config.general.tolerance_secs)
        .with_context(|| format!("failed to open ledger {}", path.display()))?;

    match action {
        LedgerAction::Status => {
            let entries = ledger.entries();
            let remembered = entries
                .values()
                .filter(|r| r.colresmode == ResolutionMode::AutoLatest)
                .count();
            println!("{}", style::header("Timestamp ledger"));
            println!();
            println!("  File          : {}", path.display());
            println!("  Last sync     : {}", terminal::local_time(ledger.last_sync()));
            println!("  Tracked paths : {}", entries.len());
            println!("  Auto-latest   : {}", remembered);
            Ok(())
        }
        LedgerAction::Forget { path: target } => {
            let mapper =
                PathMapper::new(&config.general.backup_root, config.general.path_reduction);
            let key = mapper.backup_key(&target);
            if ledger.record(&key).is_none() {
                anyhow::bail!("no ledger record for '{}'", key);
            }
            ledger
                .set_resolution_mode(&key, ResolutionMode::Manual)
                .context("failed to update ledger")?;
            ledger.persist().context("failed to write ledger")?;
            println!(
                "{}",
                style::success(&format!("Collisions on '{key}' will be asked about again"))
            );
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::parse_from(["dirmirror", "--no-pause", "--auto-resolve"]);
        assert!(cli.command.is_none());
        assert!(cli.flags.no_pause);
        assert!(cli.flags.auto_resolve);
        assert!(!cli.flags.no_ui);
    }

    #[test]
    fn test_ledger_forget_parses_path() {
        let cli = Cli::parse_from(["dirmirror", "ledger", "forget", "m/docs/a.txt"]);
        match cli.command {
            Some(Commands::Ledger {
                action: LedgerAction::Forget { path },
            }) => assert_eq!(path, "m/docs/a.txt"),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_exit_codes() {
        let space = RunOutcome::InsufficientSpace {
            required: 10,
            available: 1,
        };
        let code = |outcome: &RunOutcome| format!("{:?}", exit_code(outcome));
        assert_eq!(
            code(&space),
            format!("{:?}", ExitCode::from(EXIT_INSUFFICIENT_SPACE))
        );
        assert_eq!(
            code(&RunOutcome::Cancelled(Default::default())),
            format!("{:?}", ExitCode::from(EXIT_CANCELLED))
        );
        assert_eq!(
            code(&RunOutcome::Success(Default::default())),
            format!("{:?}", ExitCode::SUCCESS)
        );
    }

    #[test]
    fn test_init_writes_parseable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        cmd_init(&path).unwrap();
        assert!(MirrorConfig::load_from_file(&path).is_ok());
        assert!(cmd_init(&path).is_err());
    }
}
