use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use deepscan::config::parse_ports_csv;
use deepscan::engine::{Engine, EngineConfig};

/// deepscan — continuous, internet-scale TCP service indexer.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "deepscan",
    version,
    about = "Continuous, internet-scale TCP service indexer with protocol-aware probes and fingerprinting.",
    long_about = None
)]
struct Cli {
    /// CIDR range to seed into the scheduler (e.g., 10.0.0.0/16). Optional: omit to drain an existing queue.
    #[arg(long)]
    target: Option<String>,

    /// Priority assigned to the seeded target.
    #[arg(long, default_value_t = 1)]
    priority: i64,

    /// Comma-separated list of ports to probe per host.
    #[arg(long, default_value = "80,443,22,21,8080,5900,554,3389")]
    ports: String,

    /// Concurrent worker count.
    #[arg(long, default_value_t = 300)]
    rate: usize,

    /// Keep running after the queue drains, polling for new work.
    #[arg(long = "loop", default_value_t = false)]
    run_loop: bool,

    /// Thermal governor pause threshold (1-minute load average).
    #[arg(long = "max-load", default_value_t = 6.0)]
    max_load: f64,

    /// Thermal governor resume threshold.
    #[arg(long = "cool-down", default_value_t = 3.0)]
    cool_down: f64,

    /// Path to the SQLite store.
    #[arg(long = "db-path", default_value = "results.db")]
    db_path: String,

    /// Log level passed to the tracing env-filter (e.g. info, debug, trace).
    #[arg(long = "log-level", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ports = parse_ports_csv(&cli.ports).context("invalid --ports value")?;
    let rate = cli.rate.clamp(100, 1000);

    let config = EngineConfig {
        target: cli.target,
        priority: cli.priority,
        ports,
        rate,
        run_loop: cli.run_loop,
        max_load: cli.max_load,
        cool_down: cli.cool_down,
    };

    let engine = Engine::bootstrap(&cli.db_path, config).await?;
    engine.run().await?;

    Ok(())
}
