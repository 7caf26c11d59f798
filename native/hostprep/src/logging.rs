use std::{fs, io, path::Path};

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs the global subscriber: a daily rolling file in `logs_dir` plus stderr.
///
/// `RUST_LOG` overrides the default `debug` level. Keep the returned guard alive for as
/// long as logs should be flushed to the file.
pub fn setup_logging(logs_dir: &Path) -> Result<WorkerGuard> {
    fs::create_dir_all(logs_dir).context("Failed to create logs directory")?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(10)
        .filename_prefix("hostprep")
        .filename_suffix("log")
        .build(logs_dir)
        .context("Failed to initialize file appender")?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter =
        EnvFilter::builder().with_default_directive(LevelFilter::DEBUG.into()).from_env_lossy();
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_ansi(false).pretty().with_writer(non_blocking))
        .with(fmt::layer().with_writer(io::stderr))
        .try_init()
        .context("Failed to set global subscriber")?;
    Ok(guard)
}
