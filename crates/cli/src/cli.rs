use std::time::Duration;

use clap::Parser;

use dispatch_core::{parse_interval, OverlapPolicy};

/// Drive the dispatcher through a short mixed workload.
///
/// Schedules periodic sync and async ticks, a debounced burst that coalesces
/// down to one execution, and a task that always fails, then prints the
/// final metrics as JSON.
#[derive(Parser, Debug)]
#[command(name = "dispatch-demo", about = "Exercise the dispatch scheduler")]
pub struct CliArgs {
    /// Path to a TOML config file (default: read DISPATCH_* environment)
    #[arg(long, env = "DISPATCH_CONFIG")]
    pub config: Option<String>,

    /// Sync worker threads (0 = available parallelism)
    #[arg(long, env = "DISPATCH_DEMO_WORKERS")]
    pub workers: Option<usize>,

    /// How long to pump events, e.g. "3s" or "1500ms"
    #[arg(long, default_value = "3s", value_parser = interval_arg)]
    pub duration: Duration,

    /// Interval of the periodic ticks
    #[arg(long, default_value = "500ms", value_parser = interval_arg)]
    pub period: Duration,

    /// Debounce delay applied to the burst
    #[arg(long, default_value = "200ms", value_parser = interval_arg)]
    pub debounce: Duration,

    /// Periodic overlap policy: allow or skip
    #[arg(long)]
    pub overlap: Option<OverlapPolicy>,
}

fn interval_arg(raw: &str) -> Result<Duration, String> {
    parse_interval(raw).ok_or_else(|| format!("invalid interval '{}' (try 250ms, 2s, 1m30s)", raw))
}
