//! snowdrift: a standalone tool that mirrors time-partitioned object-store
//! files into a relational warehouse.
//!
//! Discovery is idempotent (an import ledger in the warehouse records every
//! applied file), partitioning is emulated with time-bucket tables behind
//! union views, and DDL changes replicate across every bucket table of a
//! partitioned type.

mod catalog;
mod config;
mod error;
mod ledger;
mod load;
mod metrics;
mod notify;
mod partition;
mod scheduler;
mod schema;
mod signal;
mod storage;
mod time;
mod warehouse;

use clap::{Parser, Subcommand, ValueEnum};
use snafu::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use config::Config;
use error::{AddressParseSnafu, ConfigSnafu, MetricsSnafu, SyncError, WarehouseSnafu};
use load::LoadOrchestrator;
use notify::LogNotifier;
use scheduler::SyncScheduler;
use storage::StorageProvider;
use time::{Chunking, parse_hour_arg};
use warehouse::PostgresWarehouse;

/// Object-store to warehouse mirroring tool.
#[derive(Parser, Debug)]
#[command(name = "snowdrift")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the import and DDL ledger tables in the warehouse.
    Init,

    /// Run the sync loop over a sliding lookback window.
    Sync {
        /// Seconds between iterations; zero or negative runs a single pass.
        interval_secs: i64,
        /// Lookback in chunking units.
        lookback_units: u32,
        /// Replace each type with its latest snapshot instead of loading
        /// incrementally.
        #[arg(long)]
        replace_all_with_latest: bool,
        /// Chunk granularity for transactional load units.
        #[arg(long, value_enum, default_value_t = ChunkingArg::Hourly)]
        chunking: ChunkingArg,
    },

    /// Load a fixed time range once.
    Load {
        /// Range start, inclusive, as yyyy-MM-dd:HH.
        from: String,
        /// Range end, inclusive, as yyyy-MM-dd:HH.
        to: String,
        /// Delete each chunk's existing rows and ledger entries first.
        #[arg(long)]
        replace: bool,
        /// Replace each type with its latest snapshot in the range.
        #[arg(long)]
        replace_all_with_latest: bool,
        /// Chunk granularity for transactional load units.
        #[arg(long, value_enum, default_value_t = ChunkingArg::Hourly)]
        chunking: ChunkingArg,
    },

    /// Delete rows and ledger entries in a time range.
    Delete {
        /// Range start, inclusive, as yyyy-MM-dd:HH.
        from: String,
        /// Range end, inclusive, as yyyy-MM-dd:HH.
        to: String,
    },

    /// Rebuild the union view of every partitioned type.
    Recreateviews,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
enum ChunkingArg {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Disable,
}

impl From<ChunkingArg> for Chunking {
    fn from(arg: ChunkingArg) -> Self {
        match arg {
            ChunkingArg::Hourly => Chunking::Hourly,
            ChunkingArg::Daily => Chunking::Daily,
            ChunkingArg::Weekly => Chunking::Weekly,
            ChunkingArg::Monthly => Chunking::Monthly,
            ChunkingArg::Disable => Chunking::Disable,
        }
    }
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), SyncError> {
    let args = Args::parse();

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("snowdrift starting");

    let config = Arc::new(Config::from_file(&args.config).context(ConfigSnafu)?);

    // Initialize metrics if enabled
    if config.metrics.enabled {
        let addr = config.metrics.address.parse().context(AddressParseSnafu)?;
        metrics::init(addr).context(MetricsSnafu)?;
        debug!(
            "Metrics endpoint listening on http://{}/metrics",
            config.metrics.address
        );
    }

    let storage = Arc::new(
        StorageProvider::for_url_with_options(
            &config.storage.url,
            config.storage.options.clone(),
        )
        .context(error::SyncStorageSnafu)?,
    );
    let warehouse = Arc::new(
        PostgresWarehouse::connect(&config.warehouse.connection, config.warehouse.dialect)
            .await
            .context(WarehouseSnafu)?,
    );
    let orchestrator = Arc::new(LoadOrchestrator::new(
        config,
        storage,
        warehouse,
        Arc::new(LogNotifier),
    ));

    match args.command {
        Command::Init => {
            orchestrator.init().await?;
            info!("Init complete");
        }

        Command::Sync {
            interval_secs,
            lookback_units,
            replace_all_with_latest,
            chunking,
        } => {
            let shutdown = CancellationToken::new();
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    signal::shutdown_signal().await;
                    shutdown.cancel();
                }
            });

            SyncScheduler::new(orchestrator)
                .run(
                    interval_secs,
                    lookback_units,
                    chunking.into(),
                    replace_all_with_latest,
                    shutdown,
                )
                .await?;
        }

        Command::Load {
            from,
            to,
            replace,
            replace_all_with_latest,
            chunking,
        } => {
            let from = parse_hour_arg(&from).context(ConfigSnafu)?;
            let to = parse_hour_arg(&to).context(ConfigSnafu)?;

            let stats = if replace_all_with_latest {
                orchestrator.replace_all_with_latest(from, to).await?
            } else {
                orchestrator.load(from, to, chunking.into(), replace).await?
            };
            info!(
                "Done: {} files loaded in {} units",
                stats.files_loaded, stats.units_committed
            );
        }

        Command::Delete { from, to } => {
            let from = parse_hour_arg(&from).context(ConfigSnafu)?;
            let to = parse_hour_arg(&to).context(ConfigSnafu)?;
            orchestrator.delete(from, to).await?;
            info!("Delete complete");
        }

        Command::Recreateviews => {
            orchestrator.recreate_views().await?;
            info!("Views rebuilt");
        }
    }

    Ok(())
}
