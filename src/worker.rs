//! Download worker
//!
//! One worker owns one bounded queue. It keeps running until kill is set, or
//! until stop is set and its queue is empty. Dequeues are time-boxed so the
//! exit condition is re-checked while idle.
//!
//! Sentinels close out a station: the worker logs the station's transfer rate
//! and appends a [`StationSyncReport`]. Tasks are fetched with bounded retry;
//! a task is a success only if the local file ends up with exactly the size the
//! listing advertised.
//!
//! On kill the worker closes its queue and counts every item still in it as
//! failed without touching the network, so `succeeded + failed` always equals
//! the number of tasks that reached this queue.

use crate::cancel::CancellationController;
use crate::config::{Config, RetryConfig};
use crate::error::{Error, Result};
use crate::log_aggregator::LogHandle;
use crate::retry::{RetryFailure, download_with_retry};
use crate::store::{ObjectStore, partial_path};
use crate::types::{DownloadTask, QueueItem, StationId, StationSyncReport, WorkerResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How long a dequeue waits before the exit condition is checked again
pub const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(500);

/// Per-station counters accumulated between sentinels
#[derive(Debug, Default)]
struct StationTally {
    files: u64,
    failed: u64,
    bytes: u64,
    transfer_time: Duration,
}

enum TaskOutcome {
    AlreadyPresent,
    Fetched { elapsed: Duration },
    Failed,
}

/// A long-lived consumer of one work queue
pub struct DownloadWorker {
    index: usize,
    queue: mpsc::Receiver<QueueItem>,
    store: Arc<dyn ObjectStore>,
    controller: CancellationController,
    retry: RetryConfig,
    overwrite: bool,
    attempt_timeout: Option<Duration>,
    dequeue_timeout: Duration,
    log: LogHandle,
}

impl DownloadWorker {
    /// Create worker `index` draining `queue`
    pub fn new(
        index: usize,
        queue: mpsc::Receiver<QueueItem>,
        store: Arc<dyn ObjectStore>,
        controller: CancellationController,
        config: &Config,
        log: &LogHandle,
    ) -> Self {
        Self {
            index,
            queue,
            store,
            controller,
            retry: config.retry.clone(),
            overwrite: config.download.overwrite,
            attempt_timeout: config.download.attempt_timeout,
            dequeue_timeout: DEQUEUE_TIMEOUT,
            log: log.with_source(format!("worker-{index}")),
        }
    }

    /// Override the idle dequeue timeout
    pub fn with_dequeue_timeout(mut self, timeout: Duration) -> Self {
        self.dequeue_timeout = timeout;
        self
    }

    /// Process the queue until the exit condition holds
    pub async fn run(mut self) -> WorkerResult {
        let mut result = WorkerResult {
            worker: self.index,
            ..Default::default()
        };
        let mut tallies: HashMap<StationId, StationTally> = HashMap::new();

        loop {
            if self.controller.is_killed() {
                self.drain_as_failed(&mut result);
                break;
            }

            let next = tokio::select! {
                biased;
                _ = self.controller.killed() => None,
                next = tokio::time::timeout(self.dequeue_timeout, self.queue.recv()) => Some(next),
            };

            let item = match next {
                // Kill observed while idle; the top of the loop drains
                None => continue,
                Some(Ok(Some(item))) => item,
                // Every sender is gone and the queue is empty
                Some(Ok(None)) => break,
                Some(Err(_)) => {
                    if self.controller.is_stopped() && self.queue.is_empty() {
                        break;
                    }
                    continue;
                }
            };

            match item {
                QueueItem::Sentinel(station) => {
                    let tally = tallies.remove(&station).unwrap_or_default();
                    let report = self.close_station(station, tally);
                    result.stations.push(report);
                }
                QueueItem::Task(task) => {
                    let outcome = self.process(&task).await;
                    let tally = tallies.entry(task.station.clone()).or_default();
                    match outcome {
                        TaskOutcome::AlreadyPresent => {
                            result.succeeded += 1;
                            result.bytes_transferred += task.expected_size_bytes;
                            tally.files += 1;
                            tally.bytes += task.expected_size_bytes;
                        }
                        TaskOutcome::Fetched { elapsed } => {
                            result.succeeded += 1;
                            result.bytes_transferred += task.expected_size_bytes;
                            tally.files += 1;
                            tally.bytes += task.expected_size_bytes;
                            tally.transfer_time += elapsed;
                        }
                        TaskOutcome::Failed => {
                            result.failed += 1;
                            tally.failed += 1;
                        }
                    }
                }
            }
        }

        tracing::debug!(
            worker = self.index,
            succeeded = result.succeeded,
            failed = result.failed,
            bytes = result.bytes_transferred,
            "Download worker exiting"
        );
        result
    }

    fn close_station(&self, station: StationId, tally: StationTally) -> StationSyncReport {
        let report = StationSyncReport {
            station,
            worker: self.index,
            files: tally.files,
            failed: tally.failed,
            bytes: tally.bytes,
            transfer_time: tally.transfer_time,
        };
        self.log.info(format!(
            "{} sync complete at {}. Files: {}, failed: {}, {:.1} MB. Rate: {:5.1} MB/s",
            report.station,
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
            report.files,
            report.failed,
            report.bytes as f64 / 1.0e6,
            report.rate_mbps()
        ));
        report
    }

    async fn process(&self, task: &DownloadTask) -> TaskOutcome {
        if !self.overwrite {
            match tokio::fs::metadata(&task.local_path).await {
                Ok(meta) if meta.len() == task.expected_size_bytes => {
                    self.log
                        .debug(format!("File already downloaded : {}", task.remote_key));
                    return TaskOutcome::AlreadyPresent;
                }
                Ok(meta) => {
                    self.log.warn(format!(
                        "Local copy of {} has {} bytes, expected {}; fetching again",
                        task.remote_key,
                        meta.len(),
                        task.expected_size_bytes
                    ));
                }
                Err(_) => {}
            }
        }

        let kill = self.controller.kill_token();
        let outcome = download_with_retry(&self.retry, &kill, |attempt| async move {
            self.fetch_once(task, attempt).await
        })
        .await;

        match outcome {
            Ok(elapsed) => TaskOutcome::Fetched { elapsed },
            Err(failure) => {
                remove_leftovers(&task.local_path).await;
                match &failure {
                    RetryFailure::Cancelled { .. } => self.log.warn(format!(
                        "Abandoned after kill : {} ({})",
                        task.remote_key, failure
                    )),
                    _ => self.log.error(format!(
                        "Failed to download : {} ({})",
                        task.remote_key, failure
                    )),
                }
                TaskOutcome::Failed
            }
        }
    }

    /// One independent transfer attempt, including the size check
    async fn fetch_once(&self, task: &DownloadTask, attempt: u32) -> Result<Duration> {
        self.log.debug(format!(
            "Download attempt {:2} of {:2} : {}",
            attempt, self.retry.max_attempts, task.remote_key
        ));

        let started = Instant::now();
        let fetch = self.store.fetch(&task.remote_key, &task.local_path);
        match self.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, fetch).await {
                Ok(written) => written?,
                Err(_) => {
                    remove_leftovers(&task.local_path).await;
                    return Err(Error::TransferTimeout {
                        key: task.remote_key.clone(),
                        timeout: limit,
                    });
                }
            },
            None => fetch.await?,
        };
        let elapsed = started.elapsed();

        let actual = tokio::fs::metadata(&task.local_path).await?.len();
        if actual != task.expected_size_bytes {
            return Err(Error::SizeMismatch {
                key: task.remote_key.clone(),
                expected: task.expected_size_bytes,
                actual,
            });
        }
        Ok(elapsed)
    }

    fn drain_as_failed(&mut self, result: &mut WorkerResult) {
        self.queue.close();
        let mut drained = 0u64;
        while let Ok(item) = self.queue.try_recv() {
            if let QueueItem::Task(task) = item {
                tracing::trace!(worker = self.index, key = %task.remote_key, "Dropping queued task");
                drained += 1;
            }
        }
        if drained > 0 {
            result.failed += drained;
            self.log.warn(format!(
                "Kill received, {drained} queued files counted as failed"
            ));
        }
    }
}

async fn remove_leftovers(local_path: &std::path::Path) {
    let _ = tokio::fs::remove_file(local_path).await;
    let _ = tokio::fs::remove_file(partial_path(local_path)).await;
}
