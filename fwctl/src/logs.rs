//! Logging configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder, RollingFileAppender, Rotation};
use tracing_subscriber::{
    filter::{Directive, LevelFilter, Targets},
    fmt,
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::errors::UpgradeError;
use crate::upgrade::diagnostics::DIAGNOSTICS_TARGET;

/// Name of the append-only diagnostic log inside the log directory
pub const DIAGNOSTICS_FILE: &str = "diagnostics.log";

/// Rotated logs are named `diagnostics.<date>.log`
const DIAGNOSTICS_PREFIX: &str = "diagnostics";

/// Console verbosity, as written in `settings.json`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    #[serde(alias = "warning")]
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Where log records go
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub log_level: LogLevel,

    /// Human-readable or JSON records on stdout
    pub stdout: bool,

    /// Directory of the diagnostic log; `None` disables it
    pub log_dir: Option<PathBuf>,

    /// Rotate the diagnostic log daily and keep this many files
    pub retention_days: Option<usize>,

    pub json_format: bool,
}

fn console_filter(level: LogLevel) -> Result<EnvFilter, UpgradeError> {
    let quiet_diagnostics = format!("{}=off", DIAGNOSTICS_TARGET)
        .parse::<Directive>()
        .map_err(|e| UpgradeError::ConfigError(format!("invalid log directive: {}", e)))?;
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from(level).into())
        .from_env_lossy();
    Ok(filter.add_directive(quiet_diagnostics))
}

/// Appender for the diagnostic log.
///
/// Without retention everything goes to one `diagnostics.log`. With retention the log rotates
/// daily and the oldest files beyond `retention_days` are deleted.
pub fn diagnostics_appender(
    dir: &Path,
    retention_days: Option<usize>,
) -> Result<RollingFileAppender, UpgradeError> {
    let builder = match retention_days.filter(|days| *days > 0) {
        Some(days) => Builder::new()
            .rotation(Rotation::DAILY)
            .filename_prefix(DIAGNOSTICS_PREFIX)
            .filename_suffix("log")
            .max_log_files(days),
        None => Builder::new()
            .rotation(Rotation::NEVER)
            .filename_prefix(DIAGNOSTICS_FILE),
    };
    builder.build(dir).map_err(|e| {
        UpgradeError::ConfigError(format!("cannot open log in {}: {}", dir.display(), e))
    })
}

/// Initialize logging.
///
/// Process transitions logged under the diagnostics target go to `diagnostics.log` in
/// `log_dir`, appended across runs (see [`diagnostics_appender`]). Keep the returned guard alive until exit so buffered
/// records are flushed.
pub fn init_logging(options: LogOptions) -> Result<Option<WorkerGuard>, UpgradeError> {
    let (diagnostics_layer, guard) = match &options.log_dir {
        Some(dir) => {
            let appender = diagnostics_appender(dir, options.retention_days)?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(Targets::new().with_target(DIAGNOSTICS_TARGET, Level::TRACE));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let plain_layer = match options.stdout && !options.json_format {
        true => Some(fmt::layer().with_filter(console_filter(options.log_level)?)),
        false => None,
    };
    let json_layer = match options.stdout && options.json_format {
        true => Some(fmt::layer().json().with_filter(console_filter(options.log_level)?)),
        false => None,
    };

    tracing_subscriber::registry()
        .with(diagnostics_layer)
        .with(plain_layer)
        .with(json_layer)
        .try_init()
        .map_err(|e| UpgradeError::ConfigError(e.to_string()))?;

    Ok(guard)
}
