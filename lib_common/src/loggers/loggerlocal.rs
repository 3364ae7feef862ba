//! # Local Logger
//!
//! Installs the process-wide `log` backend: coloured lines on stdout and
//! plain lines in a timestamped file under the log directory. Only the newest
//! log file of an application is kept; older ones are removed at startup.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use colored::{ColoredString, Colorize};
use glob::glob;
use log::{Level, LevelFilter};
use thiserror::Error;

/// Failures while installing the logger.
#[derive(Debug, Error)]
pub enum LoggerError {
    /// The log directory or file could not be created.
    #[error("log file setup failed: {0}")]
    Io(#[from] std::io::Error),
    /// A global logger was already installed.
    #[error("a logger is already installed: {0}")]
    AlreadyInstalled(#[from] log::SetLoggerError),
}

/// Parses a level name (`trace`, `debug`, `info`, `warn`, `error`, `off`).
/// Unknown names fall back to `info`.
pub fn parse_level(level: &str) -> LevelFilter {
    match level.trim().to_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

/// The file name for a log started now: `<app>-YYYYmmdd_HHMMSS.log`.
pub fn log_file_name(app_name: &str) -> String {
    format!("{}-{}.log", app_name, Local::now().format("%Y%m%d_%H%M%S"))
}

/// # Setup Logging
///
/// Creates `log_dir` if needed, rotates the application's previous log
/// files and installs the global logger. Returns the path of the new file.
pub fn setup_logging(log_dir: &Path, app_name: &str, level: &str) -> Result<PathBuf, LoggerError> {
    fs::create_dir_all(log_dir)?;
    rotate_logs(app_name, log_dir, 0);

    let log_path = log_dir.join(log_file_name(app_name));
    let level = parse_level(level);

    let console = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                colorize(record.level()),
                record.target(),
                message
            ))
        })
        .chain(std::io::stdout());

    let file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.target(),
                message
            ))
        })
        .chain(fern::log_file(&log_path)?);

    fern::Dispatch::new()
        .level(level)
        // Connection pool chatter drowns out the engine's own events.
        .level_for("hyper_util", LevelFilter::Warn)
        .level_for("rustls", LevelFilter::Warn)
        .chain(console)
        .chain(file)
        .apply()?;

    log::info!("Logging to {} at level {}", log_path.display(), level);
    Ok(log_path)
}

/// Deletes all but the `keep` newest `<app>-*.log` files in `log_dir`.
///
/// File names embed a sortable timestamp, so name order is age order.
pub fn rotate_logs(app_name: &str, log_dir: &Path, keep: usize) -> usize {
    let pattern = format!("{}/{}-*.log", log_dir.display(), app_name);
    let mut log_files: Vec<PathBuf> = match glob(&pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(e) => {
            eprintln!("Invalid log rotation pattern {}: {}", pattern, e);
            return 0;
        }
    };

    // Newest first.
    log_files.sort_by(|a, b| b.file_name().cmp(&a.file_name()));

    let mut removed = 0;
    for old_file in log_files.iter().skip(keep) {
        match fs::remove_file(old_file) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Error deleting old log file {}: {}", old_file.display(), e),
        }
    }
    removed
}

fn colorize(level: Level) -> ColoredString {
    let label = format!("{:<5}", level);
    match level {
        Level::Error => label.red().bold(),
        Level::Warn => label.yellow(),
        Level::Info => label.green(),
        Level::Debug => label.blue(),
        Level::Trace => label.dimmed(),
    }
}
