//! Optional subscriber setup for hosts that have none.
//!
//! The engine only emits `tracing` events; nothing is printed until a
//! subscriber is installed, either by the host or through these helpers.
//! `RUST_LOG` takes precedence over the filter passed in.

use std::path::Path;

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

fn env_filter(default: &str) -> EnvFilter {
  EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Log to stderr, e.g. `init_stderr("query_sync=debug")`.
pub fn init_stderr(filter: &str) -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(env_filter(filter))
    .with_target(false)
    .with_writer(std::io::stderr)
    .compact()
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))
}

/// Log to a daily rolling file under `dir`. Keep the returned guard alive
/// for as long as logs should be flushed.
pub fn init_file(dir: &Path, filter: &str) -> Result<WorkerGuard> {
  std::fs::create_dir_all(dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let appender = tracing_appender::rolling::daily(dir, "query-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter(filter))
    .with_ansi(false)
    .with_writer(writer)
    .try_init()
    .map_err(|e| eyre!("Failed to install log subscriber: {}", e))?;

  Ok(guard)
}
