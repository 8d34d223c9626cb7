//! Tracing setup for the bridge binary.
//!
//! Console output goes to stderr (plain or JSON). An optional log file is
//! rotated daily. `RUST_LOG` takes precedence over the configured level.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingSection;

/// Keeps the file writer alive; pending lines are flushed on drop.
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    pub level: String,
    pub json: bool,
    pub file: Option<PathBuf>,
}

impl LoggingOptions {
    pub fn from_section(section: &LoggingSection, file: Option<PathBuf>) -> Self {
        Self {
            level: section.level.clone(),
            json: section.json,
            file,
        }
    }
}

/// Build the filter, preferring `RUST_LOG` when it is set and valid.
pub fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

pub fn init(options: &LoggingOptions) -> Result<LoggingGuard> {
    let console = if options.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_current_span(false)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed()
    };

    let (file_layer, file_guard) = match &options.file {
        Some(path) => {
            let (dir, name) = split_log_path(path)?;
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            let appender = RollingFileAppender::new(Rotation::DAILY, &dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .with(env_filter(&options.level))
        .try_init()
        .context("Failed to initialize logging")?;

    tracing::debug!(
        level = %options.level,
        json = options.json,
        file = ?options.file,
        "Logging initialized"
    );

    Ok(LoggingGuard { _file: file_guard })
}

/// Initialize logging for tests; safe to call repeatedly.
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn split_log_path(path: &Path) -> Result<(PathBuf, String)> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("Log file path has no file name: {}", path.display()))?
        .to_string();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_log_path() {
        let (dir, name) = split_log_path(Path::new("/var/log/ralph/bridge.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log/ralph"));
        assert_eq!(name, "bridge.log");

        let (dir, name) = split_log_path(Path::new("bridge.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, "bridge.log");
    }

    #[test]
    fn test_split_log_path_rejects_directory_root() {
        assert!(split_log_path(Path::new("/")).is_err());
    }

    #[test]
    fn test_options_from_section() {
        let section = LoggingSection {
            level: "debug".to_string(),
            json: true,
            file: None,
        };
        let options = LoggingOptions::from_section(&section, Some(PathBuf::from("x.log")));
        assert_eq!(options.level, "debug");
        assert!(options.json);
        assert_eq!(options.file, Some(PathBuf::from("x.log")));
    }

    #[test]
    fn test_init_test_is_idempotent() {
        init_test();
        init_test();
    }
}
