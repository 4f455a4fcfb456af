use crate::config::{load_config, resolve_config_path, ConfigError, TimeZoneSpec};
use crate::pipeline::{Coordinator, RunError, RunOutcome};
use crate::sink::{build_sink, SinkError, TokioClock};
use crate::storage::RunLock;
use chrono::{DateTime, NaiveDate, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config not found (searched ~/.config/dv2cw/config.yml, /etc/dv2cw/config.yml); use --config <path> or --print-config to generate one")]
    ConfigNotFound,

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("lock {0} is held by another run")]
    LockHeld(PathBuf),

    #[error("cannot open lock file {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot resolve log path {path}: {source}")]
    LogPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Run(#[from] RunError),
}

impl CliError {
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::LockHeld(_) => 1,
            CliError::Run(e) => e.exit_code(),
            _ => 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub log_file: PathBuf,
    pub config: Option<PathBuf>,
    pub lock_file: Option<PathBuf>,
    /// Overrides the log date for time-only timestamps and the stream name
    pub date: Option<NaiveDate>,
    /// Reprocess the file from the top, skipping this many events
    pub skip: u64,
}

/// One invocation: lock, load config, run a single pass over the log file
pub async fn run(args: RunArgs) -> Result<RunOutcome, CliError> {
    // Held until this function returns
    let _lock = match &args.lock_file {
        Some(path) => Some(acquire_lock(path)?),
        None => None,
    };

    let config_path = resolve_config_path(args.config.as_deref()).ok_or(CliError::ConfigNotFound)?;
    info!(config_path = %config_path.display(), "Loading configuration");
    let config = load_config(&config_path)?;

    let log_path = absolute(&args.log_file)?;
    let log_date = args
        .date
        .unwrap_or_else(|| default_log_date(&log_path, config.source.timestamp.timezone));

    let sink = build_sink(&config.destination)?;
    let mut coordinator =
        Coordinator::from_config(config, sink, Arc::new(TokioClock)).skip_events(args.skip);

    Ok(coordinator.run(&log_path, log_date).await?)
}

fn acquire_lock(path: &Path) -> Result<RunLock, CliError> {
    match RunLock::try_acquire(path) {
        Ok(Some(lock)) => {
            debug!(lock = %lock.path().display(), "Lock acquired");
            Ok(lock)
        }
        Ok(None) => Err(CliError::LockHeld(path.to_path_buf())),
        Err(source) => Err(CliError::Lock {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Today, or the day the log was last written if that is earlier: a file
/// that has not rotated since then only holds that day's entries
fn default_log_date(log_path: &Path, timezone: TimeZoneSpec) -> NaiveDate {
    let today = timezone.today();
    std::fs::metadata(log_path)
        .and_then(|metadata| metadata.modified())
        .ok()
        .map(|modified| timezone.date_of(DateTime::<Utc>::from(modified)))
        .filter(|written| *written < today)
        .unwrap_or(today)
}

/// Cursors are keyed by absolute path
fn absolute(path: &Path) -> Result<PathBuf, CliError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .map_err(|source| CliError::LogPath {
            path: path.to_path_buf(),
            source,
        })
}
