//! Logging setup and build metadata.
//!
//! Provides:
//! - **Subscriber init**: `EnvFilter` (from `RUST_LOG`), a console layer on
//!   stderr (plain or JSON) and a daily rolling log file.
//! - **Log rotation**: keeps the newest [`MAX_LOG_FILES`] files.
//! - **About info**: version, build timestamp, git SHA, platform.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde_json::{json, Value};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// Prefix of the rolling log files (`delivery-tracker.YYYY-MM-DD`).
const LOG_FILE_PREFIX: &str = "delivery-tracker";

/// Filter used when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info,delivery_tracker=debug";

#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    /// Directory for the rolling file; `None` uses [`default_log_dir`].
    pub dir: Option<PathBuf>,
    /// JSON lines on the console instead of human-readable text.
    pub json: bool,
    /// Console only, no file.
    pub console_only: bool,
}

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// Install the global subscriber. Keep the returned guard alive until exit;
/// dropping it flushes the file writer.
pub fn init(options: &LogOptions) -> Result<Option<WorkerGuard>, String> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (file_writer, guard) = if options.console_only {
        (None, None)
    } else {
        let log_dir = options.dir.clone().unwrap_or_else(default_log_dir);
        fs::create_dir_all(&log_dir)
            .map_err(|e| format!("Cannot create log directory {}: {e}", log_dir.display()))?;
        prune_old_logs(&log_dir, MAX_LOG_FILES);

        let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        (Some(non_blocking), Some(guard))
    };

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_target(true)
    });
    let (json_console, plain_console) = if options.json {
        let layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_target(true);
        (Some(layer), None)
    } else {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
        (None, Some(layer))
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_console)
        .with(plain_console)
        .with(file_layer)
        .try_init()
        .map_err(|e| format!("Logging already initialised: {e}"))?;

    Ok(guard)
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Per-user data directory for log files.
pub fn default_log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("delivery-tracker").join("logs")
}

/// Delete all but the `keep` most recently modified log files in `log_dir`.
/// Returns how many were removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
        })
        .filter(|entry| entry.path().is_file())
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to prune log file"),
        }
    }
    removed
}

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

/// Version, build timestamp, git SHA, and platform info.
pub fn about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
        "rustVersion": env!("CARGO_PKG_RUST_VERSION"),
    })
}

/// Version string for `--version`.
pub const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (git ",
    env!("BUILD_GIT_SHA"),
    ", built ",
    env!("BUILD_TIMESTAMP"),
    ")"
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_about_info_has_required_fields() {
        let info = about_info();
        assert!(info.get("version").is_some());
        assert!(info.get("buildTimestamp").is_some());
        assert!(info.get("gitSha").is_some());
        assert!(info.get("platform").is_some());
        assert!(info.get("arch").is_some());
        assert!(LONG_VERSION.starts_with(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_log_dir_is_stable() {
        let d1 = default_log_dir();
        let d2 = default_log_dir();
        assert_eq!(d1, d2);
        assert!(d1.ends_with("delivery-tracker/logs"));
    }

    #[test]
    fn test_prune_keeps_newest_log_files() {
        let dir = std::env::temp_dir().join(format!("delivery-tracker-logs-{}", uuid::Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();

        let start = SystemTime::now() - Duration::from_secs(3600);
        for day in 1..=12u64 {
            let path = dir.join(format!("{LOG_FILE_PREFIX}.2026-10-{day:02}"));
            let file = fs::File::create(&path).unwrap();
            file.set_modified(start + Duration::from_secs(day * 60)).unwrap();
        }
        fs::write(dir.join("notes.txt"), "keep me").unwrap();

        assert_eq!(prune_old_logs(&dir, MAX_LOG_FILES), 2);
        assert!(!dir.join(format!("{LOG_FILE_PREFIX}.2026-10-01")).exists());
        assert!(!dir.join(format!("{LOG_FILE_PREFIX}.2026-10-02")).exists());
        assert!(dir.join(format!("{LOG_FILE_PREFIX}.2026-10-12")).exists());
        assert!(dir.join("notes.txt").exists());

        assert_eq!(prune_old_logs(&dir.join("missing"), 1), 0);
        fs::remove_dir_all(&dir).unwrap();
    }
}
