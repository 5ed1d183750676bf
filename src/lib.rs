//! # scan-tally
//!
//! Line-side scan ingestion with day-partitioned logs and live
//! production-progress streaming.
//!
//! A barcode scanner on a production line emits one carriage-return
//! terminated frame per scan. scan-tally decodes those frames, drops
//! repeats within the same day, appends the rest to a per-day CSV log, and
//! serves count-versus-target progress (overall and per time-of-day
//! segment) to any number of dashboards over Server-Sent Events.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ EventSource  │──▶│   Ingest     │──▶│  Partition   │
//! │ tty / stdin  │   │ decode+dedup │   │  day CSV     │
//! └──────────────┘   └──────────────┘   └──────┬───────┘
//!                                              │ version poll
//!                    ┌──────────────┐   ┌──────▼───────┐
//!                    │  StreamHub   │◀──│ChangeWatcher │
//!                    │  SSE fan-out │   │  + Metrics   │
//!                    └──────────────┘   └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tally ingest                  # listen on the configured scanner
//! tally serve                   # dashboard API on [server].bind
//! tally run                     # both in one process
//! tally metrics --segments      # print today's progress once
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and the reloadable config store |
//! | [`models`] | Core data types |
//! | [`source`] | Scanner byte sources |
//! | [`decoder`] | Frame decoding |
//! | [`dedup`] | Per-partition duplicate index |
//! | [`partition`] | Day-partitioned CSV storage |
//! | [`ingest`] | Ingest pipeline and loop |
//! | [`metrics`] | Progress computation |
//! | [`watcher`] | Partition change detection |
//! | [`hub`] | Subscriber fan-out |
//! | [`server`] | Dashboard HTTP API |

pub mod clock;
pub mod config;
pub mod decoder;
pub mod dedup;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod partition;
pub mod server;
pub mod source;
pub mod watcher;
