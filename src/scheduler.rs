//! Fixed-interval sync scheduling.
//!
//! Drives the load orchestrator over a sliding lookback window: each
//! iteration loads `[chunk_start(now - lookback), chunk_end(now)]`, then
//! sleeps until `iteration start + interval` (clock-aligned, so time spent
//! processing counts against the interval). Strictly sequential; there are
//! never concurrent iterations. A fatal error terminates the loop and the
//! process; an external supervisor owns process-level restart.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::SyncError;
use crate::load::LoadOrchestrator;
use crate::time::Chunking;

/// The `[from, to]` window one iteration covers, from `now`, a lookback in
/// chunk units, and the chunking granularity.
fn window(now: DateTime<Utc>, lookback_units: u32, chunking: Chunking) -> (DateTime<Utc>, DateTime<Utc>) {
    let to = chunking.chunk_end(now);
    let from = chunking.chunk_start(chunking.subtract(now, lookback_units));
    (from, to)
}

/// Drives [`LoadOrchestrator`] on a fixed interval.
pub struct SyncScheduler {
    orchestrator: Arc<LoadOrchestrator>,
}

impl SyncScheduler {
    pub fn new(orchestrator: Arc<LoadOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Run the sync loop until shutdown or a fatal error.
    ///
    /// An `interval_secs` of zero or less runs a single pass and returns
    /// (used for test and once-off runs). `replace_all_with_latest` switches
    /// dimension-style snapshot replacement in place of incremental loads.
    pub async fn run(
        &self,
        interval_secs: i64,
        lookback_units: u32,
        chunking: Chunking,
        replace_all_with_latest: bool,
        shutdown: CancellationToken,
    ) -> Result<(), SyncError> {
        loop {
            let started = Utc::now();
            let (from, to) = window(started, lookback_units, chunking);
            info!("Sync iteration over [{from}, {to}]");

            if replace_all_with_latest {
                self.orchestrator.replace_all_with_latest(from, to).await?;
            } else {
                self.orchestrator.load(from, to, chunking, false).await?;
            }

            if interval_secs <= 0 {
                info!("Single pass complete");
                return Ok(());
            }

            // Sleep to the next aligned tick, not for the full interval.
            let next = started + Duration::seconds(interval_secs);
            let wait = (next - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping sync loop");
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}
