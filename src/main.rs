mod app;
mod config;
mod gateway;
mod observer;
mod orchestrator;
mod resilience;
mod structured_logger;
#[cfg(test)]
mod testing;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use app::Cli;
use worker::stub::StubWorker;

/// Env var read for the tracing filter, e.g. `SUPERVISOR_LOG=supervisor=debug`.
const LOG_ENV_VAR: &str = "SUPERVISOR_LOG";

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Stub workers own stdout for the protocol; keep them free of logging setup.
    if let Some(name) = cli.stub_worker.as_deref() {
        return StubWorker::new(name, cli.stub_plan.clone()).run_stdio();
    }

    init_tracing();
    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        git_sha = env!("SUPERVISOR_AGENT_GIT_SHA"),
        "starting supervisor"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    runtime.block_on(app::run_headless(cli))
}

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter),
        )
        .init();
}
