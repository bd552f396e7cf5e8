mod app;
mod config;
mod logging;

use std::fmt;

use anyhow::Result;
use clap::Parser;

use crate::config::Cli;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

/// Flattens an error report, with its full context chain, into an anyhow error.
pub(crate) fn report(report: impl fmt::Debug) -> anyhow::Error {
    anyhow::anyhow!("{report:?}")
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = logging::init(cli.diagnostics_log.as_deref())?;

    let minmax_period = cli.minmax_period();
    let config = cli.run.into_config()?;
    tracing::info!(
        "Starting execd {} for {:?}",
        env!("CARGO_PKG_VERSION"),
        config.command
    );

    app::run(
        config,
        minmax_period,
        tokio::io::stdin(),
        tokio::io::stdout(),
        ctrl_c(),
    )
    .await?;

    Ok(())
}
