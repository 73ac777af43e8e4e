//! Log setup: a daily rolling file in the data directory, warnings on stderr.

use std::path::PathBuf;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Checked before `RUST_LOG`.
pub const LOG_ENV: &str = "RESCACHE_LOG";
const DEFAULT_FILTER: &str = "rescache=info";

/// Directory holding the log files.
pub fn log_dir() -> Result<PathBuf> {
  let base = dirs::data_local_dir()
    .or_else(dirs::cache_dir)
    .ok_or_else(|| eyre!("Could not determine data directory"))?;
  Ok(base.join("rescache").join("logs"))
}

fn filter() -> EnvFilter {
  std::env::var(LOG_ENV)
    .or_else(|_| std::env::var(EnvFilter::DEFAULT_ENV))
    .ok()
    .and_then(|directives| EnvFilter::try_new(directives).ok())
    .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber.
///
/// Keep the returned guard alive for as long as logs should be flushed. If another
/// subscriber is already installed it is left in place.
pub fn init() -> Result<WorkerGuard> {
  let dir = log_dir()?;
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (file_writer, guard) =
    tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "rescache.log"));

  let subscriber = tracing_subscriber::registry()
    .with(
      fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_thread_names(true)
        .with_filter(filter()),
    )
    .with(
      fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new("warn")),
    );

  if subscriber.try_init().is_err() {
    tracing::debug!("global subscriber already installed");
  }

  tracing::debug!(dir = %dir.display(), "logging initialized");
  Ok(guard)
}
