//! # scan-tally CLI (`tally`)
//!
//! The `tally` binary runs the scan ingest loop, the dashboard server, or
//! both, for one production line.
//!
//! ## Usage
//!
//! ```bash
//! tally --config ./config/tally.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tally ingest` | Read scans from the configured device into today's partition |
//! | `tally serve` | Serve progress metrics over HTTP/SSE |
//! | `tally run` | Ingest and serve in one process |
//! | `tally metrics` | Print today's progress as JSON and exit |
//!
//! Device and storage failures end the process with a non-zero status so
//! an external supervisor can restart it.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use scan_tally::clock::{Clock, SystemClock};
use scan_tally::config::ConfigStore;
use scan_tally::ingest::{run_ingest, IngestPipeline};
use scan_tally::metrics::{FeedKind, MetricsService};
use scan_tally::{logging, server, source};

/// scan-tally — line-side scan ingestion and live production progress.
#[derive(Parser)]
#[command(
    name = "tally",
    about = "scan-tally — line-side scan ingestion and live production progress",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tally.toml")]
    config: PathBuf,

    /// Log at debug level unless `RUST_LOG` says otherwise.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Read scans from the configured device until shutdown.
    ///
    /// Each new barcode is appended to today's partition; repeats within
    /// the same day are discarded.
    Ingest,

    /// Serve progress metrics for the configured line.
    Serve,

    /// Ingest and serve in one process.
    Run,

    /// Print today's progress as JSON.
    Metrics {
        /// Print the per-segment feed instead of the overall one.
        #[arg(long)]
        segments: bool,
    },
}

/// How long shutdown waits for in-flight blocking work (a stdin read that
/// will never complete, for one) before the process exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(run(cli));
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let configs = Arc::new(ConfigStore::open(&cli.config)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match cli.command {
        Commands::Ingest => {
            ingest(configs, clock).await?;
        }
        Commands::Serve => {
            server::run_server(configs, clock).await?;
        }
        Commands::Run => {
            let mut server = tokio::spawn(server::run_server(configs.clone(), clock.clone()));
            tokio::select! {
                served = &mut server => {
                    let served = served.context("dashboard server task failed")?;
                    served.context("dashboard server failed")?;
                    bail!("dashboard server stopped unexpectedly");
                }
                ingested = ingest(configs, clock) => {
                    server.abort();
                    ingested?;
                }
            }
        }
        Commands::Metrics { segments } => {
            let service = MetricsService::new(configs, clock);
            let feeds = service.compute()?;
            let kind = if segments {
                FeedKind::Segmented
            } else {
                FeedKind::Overall
            };
            println!("{}", serde_json::to_string_pretty(&feeds.to_value(kind))?);
        }
    }

    Ok(())
}

async fn ingest(configs: Arc<ConfigStore>, clock: Arc<dyn Clock>) -> anyhow::Result<()> {
    let device = configs.snapshot().device.clone();
    let mut pipeline = IngestPipeline::open(configs, clock)?;
    let mut source = source::open_source(&device).await?;

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    run_ingest(
        &mut pipeline,
        source.as_mut(),
        Duration::from_millis(device.idle_timeout_ms),
        shutdown,
    )
    .await?;
    Ok(())
}
