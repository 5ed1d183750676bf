//! Tracing subscriber setup for the `tally` binary.

use anyhow::Result;
use std::io::IsTerminal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "scan_tally=info,tally=info";
const VERBOSE_LOG_FILTER: &str = "scan_tally=debug,tally=debug";

/// Installs a stderr `fmt` layer filtered by `RUST_LOG`, falling back to
/// the crate defaults. Logs go to stderr so stdout stays parseable.
pub fn init_logging(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            VERBOSE_LOG_FILTER
        } else {
            DEFAULT_LOG_FILTER
        })
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(std::io::stderr().is_terminal())
                .with_target(false)
                .with_filter(filter),
        )
        .try_init()?;

    Ok(())
}
