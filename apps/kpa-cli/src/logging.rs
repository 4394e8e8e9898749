//! Logging initialization and log file management.
//!
//! Everything goes to stderr (warnings by default, debug with `--verbose`).
//! Commands that work on a project also write JSON logs to
//! `.kpa/logs/<command>/<timestamp>.log`, kept for three days.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use chrono::Local;
use kpa_core::STATE_DIR;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Maximum age of log files before cleanup, in days.
const LOG_RETENTION_DAYS: u64 = 3;

/// Default filter of the JSON file layer when `RUST_LOG` is unset.
const FILE_FILTER: &str = "info,kpa_core=debug,kpa_cli=debug";

/// Initialize tracing.
///
/// With `command` set, a JSON file layer is added under `work_dir`. The
/// returned guard must live until exit so buffered lines are flushed.
///
/// # Errors
///
/// Returns an error if the log directory or file cannot be created.
pub fn init_tracing(
    work_dir: &Path,
    command: Option<&str>,
    verbose: bool,
) -> Result<Option<WorkerGuard>> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(stderr_filter(verbose));

    let Some(command) = command else {
        tracing_subscriber::registry().with(stderr_layer).init();
        return Ok(None);
    };

    let (writer, guard) = open_log_writer(work_dir, command)?;
    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(writer)
                .with_filter(file_filter()),
        )
        .init();
    Ok(Some(guard))
}

fn stderr_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "warn" })
    })
}

fn file_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(FILE_FILTER))
}

/// Create the log directory and file and wrap the file in a non-blocking writer.
fn open_log_writer(work_dir: &Path, command: &str) -> Result<(NonBlocking, WorkerGuard)> {
    let log_path = build_log_path(work_dir, command);
    let log_dir = log_path.parent().context(format!(
        "failed to resolve parent directory for log path: {}",
        log_path.display(),
    ))?;

    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;

    let log_file = fs::File::create(&log_path)
        .with_context(|| format!("failed to create log file: {}", log_path.display()))?;

    Ok(tracing_appender::non_blocking(log_file))
}

fn logs_dir(work_dir: &Path) -> PathBuf {
    work_dir.join(STATE_DIR).join("logs")
}

/// `.kpa/logs/<command>/<YYYYMMDD_HHMMSS>.log`, local time.
fn build_log_path(work_dir: &Path, command: &str) -> PathBuf {
    let timestamp = Local::now().format("%Y%m%d_%H%M%S");
    logs_dir(work_dir)
        .join(command)
        .join(format!("{timestamp}.log"))
}

/// Remove `.log` files older than three days, then empty directories.
///
/// Best effort: runs before tracing exists, so problems go to stderr.
pub fn cleanup_old_logs(work_dir: &Path) {
    let dir = logs_dir(work_dir);
    if !dir.is_dir() {
        return;
    }

    let cutoff = SystemTime::now() - Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);
    remove_old_log_files(&dir, cutoff);
    remove_empty_dirs(&dir);
}

fn remove_old_log_files(dir: &Path, cutoff: SystemTime) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("warning: failed to read log directory {}: {e}", dir.display());
            return;
        }
    };

    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            remove_old_log_files(&path, cutoff);
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }

        let Ok(modified) = fs::metadata(&path).and_then(|m| m.modified()) else {
            continue;
        };
        if modified < cutoff
            && let Err(e) = fs::remove_file(&path)
        {
            eprintln!("warning: failed to remove old log file {}: {e}", path.display());
        }
    }
}

/// Remove empty subdirectories under `dir`, keeping `dir` itself.
fn remove_empty_dirs(dir: &Path) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if path.is_dir() {
            remove_empty_dirs(&path);
            // Fails while the directory still has files.
            let _ = fs::remove_dir(&path);
        }
    }
}
