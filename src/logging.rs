//! Log sinks: an always-on plain-text file plus an optional console layer
//!
//! Without `--log-file` the file lives in a daily-rotated set under the log
//! directory, keeping the newest [`MAX_LOG_FILES`]. File writes go through a
//! background worker so request handlers never block on disk I/O.

use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

const LOG_FILE_PREFIX: &str = "inference_server";
const LOG_FILE_SUFFIX: &str = "log";

/// Rotated files kept in the log directory
pub const MAX_LOG_FILES: usize = 5;

/// `~/.cache/deterministic-inference/logs` on Linux
pub fn default_log_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("deterministic-inference")
        .join("logs")
}

/// Where the file layer writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDestination {
    pub dir: PathBuf,
    /// File name for an exact file, name prefix for a rotated set
    pub name: String,
    pub rotate: bool,
}

impl LogDestination {
    pub fn resolve(config: &LogConfig) -> Self {
        if let Some(path) = &config.file {
            let dir = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
                _ => PathBuf::from("."),
            };
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("{LOG_FILE_PREFIX}.{LOG_FILE_SUFFIX}"));
            return LogDestination {
                dir,
                name,
                rotate: false,
            };
        }

        LogDestination {
            dir: config.dir.clone().unwrap_or_else(default_log_dir),
            name: LOG_FILE_PREFIX.to_string(),
            rotate: true,
        }
    }

    /// Blocking appender for this destination; creates the directory
    pub fn appender(&self) -> Result<RollingFileAppender> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create log directory: {:?}", self.dir))?;

        let builder = RollingFileAppender::builder().filename_prefix(self.name.as_str());
        let builder = if self.rotate {
            builder
                .rotation(Rotation::DAILY)
                .filename_suffix(LOG_FILE_SUFFIX)
                .max_log_files(MAX_LOG_FILES)
        } else {
            builder.rotation(Rotation::NEVER)
        };

        builder
            .build(&self.dir)
            .with_context(|| format!("Failed to open log file in {:?}", self.dir))
    }

    fn describe(&self) -> String {
        let path = self.dir.join(&self.name);
        if self.rotate {
            format!("{}.<date>.{}", path.display(), LOG_FILE_SUFFIX)
        } else {
            path.display().to_string()
        }
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
/// Keep the returned guard alive until exit so buffered lines are flushed.
pub fn init(config: &LogConfig) -> Result<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?;

    let destination = LogDestination::resolve(config);
    let (file_writer, guard) = tracing_appender::non_blocking(destination.appender()?);

    let console_layer = config.to_console.then(tracing_subscriber::fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .try_init()
        .context("Failed to initialize logging")?;

    info!(
        file = %destination.describe(),
        rotate = destination.rotate,
        console = config.to_console,
        "Logging initialized"
    );
    Ok(guard)
}
