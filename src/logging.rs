//! Tracing setup for the CLI: a daily log file, plus stderr when verbose.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Environment variable holding the log filter, e.g. `shelfsync=debug`.
pub const LOG_ENV: &str = "SHELFSYNC_LOG";

const LOG_FILE_PREFIX: &str = "shelfsync.log";

/// Default log directory: `<data dir>/shelfsync/logs`.
pub fn default_log_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir().ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(data_dir.join("shelfsync").join("logs"))
}

/// Install the global subscriber. Keep the returned guard alive until exit,
/// or buffered lines are lost.
pub fn init(dir: &Path, verbose: bool) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let file_layer = fmt::layer()
    .with_writer(writer)
    .with_ansi(false)
    .with_target(true);

  let stderr_layer = verbose.then(|| {
    fmt::layer()
      .compact()
      .with_writer(std::io::stderr)
      .boxed()
  });

  tracing_subscriber::registry()
    .with(env_filter())
    .with(file_layer)
    .with(stderr_layer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}

fn env_filter() -> EnvFilter {
  EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}
