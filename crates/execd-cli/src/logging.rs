//! provides logging helpers

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use execd::process::DIAGNOSTICS_TARGET;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

/// initiate the global tracing subscriber
///
/// Child stderr goes to the console unless `diagnostics_log` is set, in which
/// case it is written to a daily rotated file next to that path. The returned
/// guard flushes the file on drop.
pub(crate) fn init(diagnostics_log: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let env_filter = filter::EnvFilter::builder()
        .with_default_directive(filter::LevelFilter::INFO.into())
        .from_env_lossy();

    let fmt_layer = layer().with_writer(std::io::stderr).with_target(true);

    let Some(diagnostics_log) = diagnostics_log else {
        registry().with(fmt_layer.with_filter(env_filter)).init();
        return Ok(None);
    };

    let dir = diagnostics_log
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file = diagnostics_log
        .file_name()
        .and_then(|name| name.to_str())
        .context("diagnostics log path has no file name")?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(file)
        .max_log_files(3)
        .build(dir)
        .context("failed to create rolling file appender")?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let console_layer = fmt_layer.with_filter(env_filter.and(filter::filter_fn(|metadata| {
        metadata.target() != DIAGNOSTICS_TARGET
    })));
    let diagnostics_layer = layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target() == DIAGNOSTICS_TARGET
        }));

    registry().with(console_layer).with(diagnostics_layer).init();
    Ok(Some(file_guard))
}
