// Copyright 2025 Neuraville Inc.
// SPDX-License-Identifier: Apache-2.0

//! Logging initialization
//!
//! Console output is always installed. With the `file-logging` feature and
//! `LogSettings::file_logging` set, every run also writes a daily rolling
//! file into a timestamped folder:
//! ```text
//! ./logs/
//!   └── run_20250101_120000/
//!       └── devbus.log
//! ```

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::cli::CrateDebugFlags;
use crate::config::LogSettings;

/// Keeps background log writers alive; drop it last
pub struct LoggingGuard {
    #[cfg(feature = "file-logging")]
    _file_guards: Vec<tracing_appender::non_blocking::WorkerGuard>,
    log_dir: Option<PathBuf>,
}

impl LoggingGuard {
    /// Run folder receiving log files, if file logging is active
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

/// Install the global subscriber
///
/// # Arguments
/// * `debug_flags` - Per-crate debug flags for filtering
/// * `settings` - Default level and file output options
///
/// # Errors
///
/// Fails if a global subscriber is already installed or the log folder
/// cannot be created.
pub fn init_logging(debug_flags: &CrateDebugFlags, settings: &LogSettings) -> Result<LoggingGuard> {
    let filter = debug_flags.to_filter_string(&settings.level);
    let env_filter =
        EnvFilter::try_new(&filter).map_err(|e| anyhow!("invalid log filter '{}': {}", filter, e))?;

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_names(true)
            .with_filter(env_filter)
            .boxed(),
    );

    #[cfg(feature = "file-logging")]
    let (file_guards, log_dir) = if settings.file_logging {
        let (layer, guard, run_folder) = file_layer(&filter, settings)?;
        layers.push(layer);
        (vec![guard], Some(run_folder))
    } else {
        (Vec::new(), None)
    };

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {}", e))?;

    #[cfg(not(feature = "file-logging"))]
    let log_dir = {
        if settings.file_logging {
            tracing::warn!("File logging requested but the `file-logging` feature is disabled");
        }
        None
    };

    Ok(LoggingGuard {
        #[cfg(feature = "file-logging")]
        _file_guards: file_guards,
        log_dir,
    })
}

/// Install console logging at `level` with no debug flags
pub fn init_logging_default(level: &str) -> Result<LoggingGuard> {
    init_logging(
        &CrateDebugFlags::default(),
        &LogSettings::default().with_level(level),
    )
}

#[cfg(feature = "file-logging")]
type FileLayer = (
    Box<dyn Layer<Registry> + Send + Sync>,
    tracing_appender::non_blocking::WorkerGuard,
    PathBuf,
);

#[cfg(feature = "file-logging")]
fn file_layer(filter: &str, settings: &LogSettings) -> Result<FileLayer> {
    use anyhow::Context;

    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let run_folder = settings.log_dir.join(format!("run_{}", timestamp));
    std::fs::create_dir_all(&run_folder)
        .with_context(|| format!("Failed to create log directory: {}", run_folder.display()))?;

    cleanup_old_logs(
        &settings.log_dir,
        settings.retention_days,
        settings.retention_runs,
    )?;

    let appender = tracing_appender::rolling::daily(&run_folder, "devbus.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true)
        .with_filter(EnvFilter::try_new(filter)?)
        .boxed();

    Ok((layer, guard, run_folder))
}

/// Remove run folders beyond the retention policy
///
/// Folders older than `retention_days` go first; then the oldest remaining
/// folders are removed until at most `retention_runs` are left.
#[cfg(feature = "file-logging")]
pub fn cleanup_old_logs(base_log_dir: &Path, retention_days: u64, retention_runs: usize) -> Result<()> {
    use chrono::{NaiveDateTime, Utc};

    if !base_log_dir.exists() {
        return Ok(());
    }

    let cutoff = Utc::now().naive_utc() - chrono::Duration::days(retention_days as i64);

    let mut runs: Vec<(PathBuf, NaiveDateTime)> = Vec::new();
    for entry in std::fs::read_dir(base_log_dir)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let stamp = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("run_"))
            .and_then(|s| NaiveDateTime::parse_from_str(s, "%Y%m%d_%H%M%S").ok());
        if let Some(stamp) = stamp {
            runs.push((path, stamp));
        }
    }
    runs.sort_by_key(|(_, stamp)| *stamp);

    let (expired, kept): (Vec<_>, Vec<_>) = runs.into_iter().partition(|(_, s)| *s < cutoff);
    let excess = kept.len().saturating_sub(retention_runs);

    for (path, _) in expired.iter().chain(kept.iter().take(excess)) {
        if let Err(e) = std::fs::remove_dir_all(path) {
            eprintln!(
                "Warning: Failed to remove old log directory {}: {}",
                path.display(),
                e
            );
        }
    }

    Ok(())
}

#[cfg(all(test, feature = "file-logging"))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_cleanup_keeps_most_recent_runs() {
        let dir = tempdir().unwrap();
        let now = chrono::Utc::now();
        for minutes in 1..=4 {
            let stamp = (now - chrono::Duration::minutes(minutes)).format("%Y%m%d_%H%M%S");
            std::fs::create_dir_all(dir.path().join(format!("run_{}", stamp))).unwrap();
        }
        std::fs::create_dir_all(dir.path().join("run_20000101_000000")).unwrap();
        std::fs::create_dir_all(dir.path().join("unrelated")).unwrap();

        cleanup_old_logs(dir.path(), 30, 2).unwrap();

        let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        remaining.sort();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.contains(&"unrelated".to_string()));
        assert!(!remaining.contains(&"run_20000101_000000".to_string()));
    }
}
