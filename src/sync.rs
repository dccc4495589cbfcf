//! Top-level download run

use crate::cancel::CancellationController;
use crate::config::Config;
use crate::error::Result;
use crate::layout::{LocalLayout, list_data_files};
use crate::log_aggregator::{LogAggregator, LogHandle, TracingSink};
use crate::scheduler::Scheduler;
use crate::store::{HttpBucketStore, ObjectStore};
use crate::types::{DateRange, EnqueueReport, StationId, SyncSummary};
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a download run produced
#[derive(Clone, Debug)]
pub struct SyncOutcome {
    /// Worker totals
    pub summary: SyncSummary,
    /// What enumeration placed on the queues
    pub enqueue: EnqueueReport,
    /// Data files present under the synced station directories after the run
    pub files: Vec<PathBuf>,
}

/// Download every station's objects inside `range` through `store`
///
/// Per-file failures never make this return `Err`; they are counted in the
/// summary. Only an invalid configuration does.
pub async fn sync_stations(
    config: &Config,
    store: Arc<dyn ObjectStore>,
    controller: &CancellationController,
    range: &DateRange,
    stations: &[StationId],
    log: &LogHandle,
) -> Result<SyncOutcome> {
    config.validate()?;
    let log = log.with_source("sync");
    let layout = LocalLayout::from_config(&config.download);

    log.info(format!(
        "NEXRAD level 2 sync from bucket '{}'\n   Sync start date  : {}\n   Sync end date    : {}\n   Output directory : {}",
        config.store.bucket,
        range.start(),
        range.end(),
        layout.root().display()
    ));

    let mut scheduler = Scheduler::new(config, store, controller.clone(), &log);
    let enqueue = scheduler.enqueue(range, stations).await;
    let summary = scheduler.wait().await;

    log.info(format!(
        "Sync complete\n   Downloaded       : {:10} files\n   Failed           : {:10} files\n   Data transferred : {:10.1} MB\n   Transfer Rate    : {:10.1} MB/s\n   Elapsed time     : {:10.1} s",
        summary.succeeded,
        summary.failed,
        summary.bytes_transferred as f64 / 1.0e6,
        summary.transfer_rate_mbps(),
        summary.elapsed.as_secs_f64()
    ));
    if summary.failed == 0 {
        log.info("No failed file syncs.");
    } else {
        log.warn("Some files failed to sync!");
    }

    let mut files = Vec::new();
    for day in range.days() {
        for station in stations {
            files.extend(list_data_files(&layout.station_dir(day, station)));
        }
    }

    Ok(SyncOutcome {
        summary,
        enqueue,
        files,
    })
}

/// [`sync_stations`] against the configured HTTP bucket, logging through `tracing`
pub async fn sync_from_bucket(
    config: &Config,
    controller: &CancellationController,
    range: &DateRange,
    stations: &[StationId],
) -> Result<SyncOutcome> {
    let store: Arc<dyn ObjectStore> = Arc::new(HttpBucketStore::new(&config.store)?);
    let (log, aggregator) = LogAggregator::spawn(TracingSink);
    let outcome = sync_stations(config, store, controller, range, stations, &log).await;
    aggregator.finish().await?;
    outcome
}
