//! Tracing setup: stdout plus an optional plain-text log file.

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::ConfigError;

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub default_filter: String,
    /// Log file path (`None` = stdout only).
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            default_filter: "info".to_string(),
            file: Some(PathBuf::from("server.log")),
        }
    }
}

impl LogConfig {
    /// Build config from environment variables.
    /// `RESERVATION_LOG_FILE` set to an empty value disables the file sink.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("RESERVATION_LOG_FILE") {
            config.file = if path.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        config
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop; hold it for the
/// lifetime of the process.
pub fn init(config: &LogConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let (file_layer, guard) = match &config.file {
        Some(path) => {
            let (dir, name) = split_path(path)?;
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()
        .map_err(|e| ConfigError::Logging(e.to_string()))?;

    Ok(guard)
}

fn split_path(path: &Path) -> Result<(PathBuf, PathBuf), ConfigError> {
    let name = path.file_name().ok_or_else(|| ConfigError::InvalidValue {
        key: "RESERVATION_LOG_FILE".into(),
        message: format!("{} has no file name", path.display()),
    })?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((dir, PathBuf::from(name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_bare_file_name_uses_cwd() {
        let (dir, name) = split_path(Path::new("server.log")).unwrap();
        assert_eq!(dir, PathBuf::from("."));
        assert_eq!(name, PathBuf::from("server.log"));
    }

    #[test]
    fn split_nested_path() {
        let (dir, name) = split_path(Path::new("/var/log/worker/out.log")).unwrap();
        assert_eq!(dir, PathBuf::from("/var/log/worker"));
        assert_eq!(name, PathBuf::from("out.log"));
    }

    #[test]
    fn split_rejects_root() {
        assert!(split_path(Path::new("/")).is_err());
    }
}
