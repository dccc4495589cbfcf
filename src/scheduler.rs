//! Task enumeration and the wait/aggregate phase
//!
//! The scheduler owns one bounded queue per worker. For every day of the
//! requested window it lists each station's prefix, filters the objects, and
//! routes the station's tasks to queue `station_index % workers`, followed by a
//! sentinel on the same queue. Sends use a short timeout in a loop so a kill
//! is noticed even when a queue is full.

use crate::cancel::CancellationController;
use crate::config::{Config, SentinelMode};
use crate::layout::{LocalLayout, is_excluded, parse_scan_time, station_prefix};
use crate::log_aggregator::LogHandle;
use crate::store::ObjectStore;
use crate::types::{
    DateRange, DownloadTask, EnqueueReport, ObjectRef, QueueItem, StationId, SyncSummary,
    WorkerResult,
};
use crate::worker::DownloadWorker;
use chrono::NaiveDate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;

/// How long a blocked send waits before kill is checked again
const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(250);

/// Queue index a station is routed to
pub fn queue_for(station_index: usize, workers: usize) -> usize {
    station_index % workers.max(1)
}

/// What happened to one queued item
#[derive(Debug, PartialEq, Eq)]
enum Delivery {
    Sent,
    Killed,
    /// The worker behind the queue is gone
    Closed,
}

/// Producer side of the download pool
pub struct Scheduler {
    store: Arc<dyn ObjectStore>,
    controller: CancellationController,
    layout: LocalLayout,
    exclude_suffixes: Vec<String>,
    sentinel_mode: SentinelMode,
    queues: Vec<mpsc::Sender<QueueItem>>,
    workers: Vec<JoinHandle<WorkerResult>>,
    enqueued_per_queue: Vec<u64>,
    log: LogHandle,
    started: Instant,
}

impl Scheduler {
    /// Create the queues and start one worker per queue
    ///
    /// The worker count is `config.worker_count()`, at most
    /// [`MAX_WORKERS`](crate::config::MAX_WORKERS). The scheduler follows
    /// `controller`'s kill but keeps a stop signal of its own, so one
    /// controller can serve any number of runs.
    pub fn new(
        config: &Config,
        store: Arc<dyn ObjectStore>,
        controller: CancellationController,
        log: &LogHandle,
    ) -> Self {
        let controller = controller.for_run();
        let worker_count = config.worker_count();
        let mut queues = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);

        for index in 0..worker_count {
            let (tx, rx) = mpsc::channel(config.download.queue_capacity.max(1));
            let worker =
                DownloadWorker::new(index, rx, store.clone(), controller.clone(), config, log);
            queues.push(tx);
            workers.push(tokio::spawn(worker.run()));
        }

        tracing::debug!(workers = worker_count, "Download workers started");

        Self {
            store,
            controller,
            layout: LocalLayout::from_config(&config.download),
            exclude_suffixes: config.download.exclude_suffixes.clone(),
            sentinel_mode: config.download.sentinel_mode,
            queues,
            workers,
            enqueued_per_queue: vec![0; worker_count],
            log: log.with_source("scheduler"),
            started: Instant::now(),
        }
    }

    /// Number of workers (and queues)
    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    /// Local layout the tasks are written into
    pub fn layout(&self) -> &LocalLayout {
        &self.layout
    }

    /// Enumerate `range` × `stations` and place the tasks on the queues
    ///
    /// Stops early, without error, when kill is observed; tasks already queued
    /// are accounted by [`wait`](Self::wait).
    pub async fn enqueue(&mut self, range: &DateRange, stations: &[StationId]) -> EnqueueReport {
        let worker_count = self.worker_count();
        let mut report = EnqueueReport {
            tasks_per_queue: vec![0; worker_count],
            ..Default::default()
        };

        'days: for day in range.days() {
            for (index, station) in stations.iter().enumerate() {
                if self.controller.is_killed() {
                    report.cancelled = true;
                    break 'days;
                }

                let queue = queue_for(index, worker_count);
                let prefix = station_prefix(day, station);
                let listing = tokio::select! {
                    biased;
                    _ = self.controller.killed() => None,
                    listing = self.store.list(&prefix) => Some(listing),
                };
                let Some(listing) = listing else {
                    report.cancelled = true;
                    break 'days;
                };

                match listing {
                    Ok(objects) => {
                        for task in self.select_tasks(range, day, station, objects) {
                            match self.send(queue, QueueItem::Task(task)).await {
                                Delivery::Sent => {
                                    report.tasks += 1;
                                    report.tasks_per_queue[queue] += 1;
                                    self.enqueued_per_queue[queue] += 1;
                                }
                                Delivery::Closed => report.undeliverable += 1,
                                Delivery::Killed => {
                                    report.cancelled = true;
                                    break 'days;
                                }
                            }
                        }
                    }
                    Err(e) => {
                        report.skipped_segments += 1;
                        self.log
                            .warn(format!("Failed to list {prefix}, skipping: {e}"));
                    }
                }

                if self.sentinel_mode == SentinelMode::PerStationDay {
                    match self.send(queue, QueueItem::Sentinel(station.clone())).await {
                        Delivery::Sent => report.sentinels += 1,
                        Delivery::Closed => {}
                        Delivery::Killed => {
                            report.cancelled = true;
                            break 'days;
                        }
                    }
                }
            }
        }

        if self.sentinel_mode == SentinelMode::PerStation && !report.cancelled {
            for (index, station) in stations.iter().enumerate() {
                let queue = queue_for(index, worker_count);
                match self.send(queue, QueueItem::Sentinel(station.clone())).await {
                    Delivery::Sent => report.sentinels += 1,
                    Delivery::Closed => {}
                    Delivery::Killed => {
                        report.cancelled = true;
                        break;
                    }
                }
            }
        }

        if report.undeliverable > 0 {
            self.log.error(format!(
                "{} files not queued: their download worker is no longer running",
                report.undeliverable
            ));
        }
        if report.cancelled {
            self.log.warn(format!(
                "Enumeration stopped by kill after {} files",
                report.tasks
            ));
        } else {
            self.log.debug(format!(
                "Enumerated {} files for {} stations",
                report.tasks,
                stations.len()
            ));
        }
        report
    }

    /// Objects of one listing that belong in the run, in listing order
    fn select_tasks(
        &self,
        range: &DateRange,
        day: NaiveDate,
        station: &StationId,
        objects: Vec<ObjectRef>,
    ) -> Vec<DownloadTask> {
        let station_dir = self.layout.station_dir(day, station);
        objects
            .into_iter()
            .filter_map(|object| {
                let name = object.file_name().to_string();
                if is_excluded(&name, &self.exclude_suffixes) {
                    return None;
                }
                let Some(scan_time) = parse_scan_time(&name) else {
                    self.log
                        .warn(format!("No scan time in '{}', skipping", object.key));
                    return None;
                };
                if !range.contains(scan_time) {
                    return None;
                }
                Some(DownloadTask {
                    station: station.clone(),
                    local_path: station_dir.join(&name),
                    remote_key: object.key,
                    expected_size_bytes: object.size,
                })
            })
            .collect()
    }

    /// Place `item` on `queue`, retrying full-queue timeouts until kill
    async fn send(&self, queue: usize, mut item: QueueItem) -> Delivery {
        loop {
            if self.controller.is_killed() {
                return Delivery::Killed;
            }
            match self.queues[queue].send_timeout(item, ENQUEUE_TIMEOUT).await {
                Ok(()) => return Delivery::Sent,
                Err(SendTimeoutError::Timeout(returned)) => item = returned,
                Err(SendTimeoutError::Closed(_)) => {
                    tracing::warn!(worker = queue, "Queue closed, worker is gone");
                    return Delivery::Closed;
                }
            }
        }
    }

    /// Set stop, join every worker and fold their results
    ///
    /// Consumes the scheduler, so it can only be called once.
    pub async fn wait(self) -> SyncSummary {
        self.controller.stop();
        drop(self.queues);

        let results = futures::future::join_all(self.workers).await;
        let mut worker_results = Vec::with_capacity(results.len());
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(result) => worker_results.push(result),
                Err(e) => {
                    // Keep the totals consistent: everything routed to a lost
                    // worker counts as failed
                    tracing::error!(worker = index, error = %e, "Download worker task failed");
                    worker_results.push(WorkerResult {
                        worker: index,
                        failed: self.enqueued_per_queue[index],
                        ..Default::default()
                    });
                }
            }
        }

        let enqueued = self.enqueued_per_queue.iter().sum();
        SyncSummary::from_workers(
            worker_results,
            enqueued,
            self.started.elapsed(),
            self.controller.is_killed(),
        )
    }
}
