mod cli;
mod demo;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use dispatch_core::{load_dotenv, SchedulerConfig};

use crate::cli::CliArgs;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    load_dotenv();
    let args = CliArgs::parse();

    let mut config = match args.config.as_deref() {
        Some(path) => SchedulerConfig::from_file(path)
            .with_context(|| format!("failed to load config from '{}'", path))?,
        None => SchedulerConfig::from_env(),
    };
    if let Some(workers) = args.workers {
        config.worker_threads = workers;
    }
    if let Some(overlap) = args.overlap {
        config.periodic_overlap = overlap;
    }
    config.log_summary();

    let report = demo::run(config, &args).context("demo run failed")?;
    info!(events = report.events, kinds = ?report.by_kind, "demo finished");

    let metrics = serde_json::to_string_pretty(&report.metrics).context("failed to encode metrics")?;
    println!("{}", metrics);
    Ok(())
}
