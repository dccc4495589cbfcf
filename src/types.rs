//! Core types for nexrad-sync

use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Radar station identifier (e.g., "KTLX")
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(String);

impl StationId {
    /// Create a new StationId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The station code as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for StationId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for StationId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for StationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Half-open time window `[start, end)`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    start: NaiveDateTime,
    end: NaiveDateTime,
}

impl DateRange {
    /// Create a window; `start` must be strictly before `end`
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self> {
        if start >= end {
            return Err(Error::Other(format!(
                "empty date range: {start} is not before {end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// The whole calendar day `date`
    pub fn day(date: NaiveDate) -> Self {
        let start = date.and_time(chrono::NaiveTime::MIN);
        Self {
            start,
            end: start + ChronoDuration::days(1),
        }
    }

    /// Window start (inclusive)
    pub fn start(&self) -> NaiveDateTime {
        self.start
    }

    /// Window end (exclusive)
    pub fn end(&self) -> NaiveDateTime {
        self.end
    }

    /// Whether `t` falls inside the window
    pub fn contains(&self, t: NaiveDateTime) -> bool {
        t >= self.start && t < self.end
    }

    /// Calendar days whose midnight-to-midnight span overlaps the window
    pub fn days(&self) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut day = self.start.date();
        while day.and_time(chrono::NaiveTime::MIN) < self.end {
            days.push(day);
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        days
    }
}

/// A remote object reference returned by a bucket listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRef {
    /// Full object key
    pub key: String,
    /// Size in bytes as reported by the store
    pub size: u64,
}

impl ObjectRef {
    /// The last path segment of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// A unit of download work; identity is the remote key
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadTask {
    /// Station the object belongs to
    pub station: StationId,
    /// Remote object key
    pub remote_key: String,
    /// Size advertised by the listing
    pub expected_size_bytes: u64,
    /// Destination on the local filesystem
    pub local_path: PathBuf,
}

/// An item on a worker queue
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueItem {
    /// Object to fetch
    Task(DownloadTask),
    /// No more tasks for this station on this queue (for the current day or range)
    Sentinel(StationId),
}

impl QueueItem {
    /// Station this item belongs to
    pub fn station(&self) -> &StationId {
        match self {
            QueueItem::Task(task) => &task.station,
            QueueItem::Sentinel(station) => station,
        }
    }
}

/// Per-station transfer totals reported when a worker sees a sentinel
#[derive(Clone, Debug, PartialEq)]
pub struct StationSyncReport {
    /// Station the totals belong to
    pub station: StationId,
    /// Worker that processed the station
    pub worker: usize,
    /// Tasks that succeeded since the previous sentinel
    pub files: u64,
    /// Tasks that failed since the previous sentinel
    pub failed: u64,
    /// Bytes accounted since the previous sentinel
    pub bytes: u64,
    /// Wall time spent inside successful transfers
    pub transfer_time: Duration,
}

impl StationSyncReport {
    /// Transfer rate in MB/s (0 when nothing was transferred)
    pub fn rate_mbps(&self) -> f64 {
        let secs = self.transfer_time.as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / 1.0e6 / secs
        } else {
            0.0
        }
    }
}

/// Outcome counters produced by one worker when it shuts down
#[derive(Clone, Debug, Default, PartialEq)]
pub struct WorkerResult {
    /// Worker index (equal to its queue index)
    pub worker: usize,
    /// Tasks completed (fetched or already present)
    pub succeeded: u64,
    /// Tasks that exhausted their attempts or were drained by a kill
    pub failed: u64,
    /// Bytes accounted for succeeded tasks
    pub bytes_transferred: u64,
    /// Station summaries emitted at each sentinel
    pub stations: Vec<StationSyncReport>,
}

/// What the scheduler placed on the queues
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnqueueReport {
    /// Tasks enqueued in total
    pub tasks: u64,
    /// Sentinels enqueued in total
    pub sentinels: u64,
    /// Tasks enqueued per queue index
    pub tasks_per_queue: Vec<u64>,
    /// Station/day segments whose listing failed
    pub skipped_segments: u64,
    /// Tasks dropped because their worker was no longer running
    pub undeliverable: u64,
    /// Enumeration stopped early because of the kill signal
    pub cancelled: bool,
}

/// Totals for a whole download run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SyncSummary {
    /// Tasks that succeeded
    pub succeeded: u64,
    /// Tasks that failed (including drained tasks after a kill)
    pub failed: u64,
    /// Bytes accounted for succeeded tasks
    pub bytes_transferred: u64,
    /// Tasks enqueued across all queues
    pub enqueued: u64,
    /// Time between scheduler creation and the end of `wait()`
    pub elapsed: Duration,
    /// Whether the kill signal was observed during the run
    pub killed: bool,
    /// Station summaries from every worker
    pub stations: Vec<StationSyncReport>,
}

impl SyncSummary {
    /// Fold worker results into one summary
    pub fn from_workers(
        results: Vec<WorkerResult>,
        enqueued: u64,
        elapsed: Duration,
        killed: bool,
    ) -> Self {
        let mut summary = SyncSummary {
            enqueued,
            elapsed,
            killed,
            ..Default::default()
        };
        for result in results {
            summary.succeeded += result.succeeded;
            summary.failed += result.failed;
            summary.bytes_transferred += result.bytes_transferred;
            summary.stations.extend(result.stations);
        }
        summary
    }

    /// Average rate over the whole run in MB/s
    pub fn transfer_rate_mbps(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_transferred as f64 / 1.0e6 / secs
        } else {
            0.0
        }
    }

    /// Every enqueued task was accounted and none failed
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && self.succeeded == self.enqueued
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn date_range_rejects_empty_window() {
        assert!(DateRange::new(at(2024, 5, 1, 0), at(2024, 5, 1, 0)).is_err());
        assert!(DateRange::new(at(2024, 5, 2, 0), at(2024, 5, 1, 0)).is_err());
    }

    #[test]
    fn days_covers_partial_days_but_not_the_end_midnight() {
        let range = DateRange::new(at(2024, 5, 1, 18), at(2024, 5, 3, 0)).unwrap();
        let days: Vec<String> = range.days().iter().map(|d| d.to_string()).collect();
        assert_eq!(days, vec!["2024-05-01", "2024-05-02"]);

        let range = DateRange::new(at(2024, 5, 1, 18), at(2024, 5, 3, 1)).unwrap();
        assert_eq!(range.days().len(), 3);
    }

    #[test]
    fn month_boundary_days() {
        let range = DateRange::new(at(2024, 2, 28, 0), at(2024, 3, 1, 12)).unwrap();
        let days: Vec<String> = range.days().iter().map(|d| d.to_string()).collect();
        assert_eq!(days, vec!["2024-02-28", "2024-02-29", "2024-03-01"]);
    }

    #[test]
    fn contains_is_half_open() {
        let range = DateRange::day(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap());
        assert!(range.contains(at(2024, 5, 1, 0)));
        assert!(range.contains(at(2024, 5, 1, 23)));
        assert!(!range.contains(at(2024, 5, 2, 0)));
    }

    #[test]
    fn object_ref_file_name() {
        let obj = ObjectRef {
            key: "2024/05/01/KTLX/KTLX20240501_000312_V06".to_string(),
            size: 10,
        };
        assert_eq!(obj.file_name(), "KTLX20240501_000312_V06");
    }

    #[test]
    fn summary_folds_worker_results() {
        let results = vec![
            WorkerResult {
                worker: 0,
                succeeded: 2,
                failed: 1,
                bytes_transferred: 300,
                stations: vec![],
            },
            WorkerResult {
                worker: 1,
                succeeded: 1,
                failed: 0,
                bytes_transferred: 100,
                stations: vec![],
            },
        ];
        let summary = SyncSummary::from_workers(results, 4, Duration::from_secs(2), false);

        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.bytes_transferred, 400);
        assert!(!summary.is_complete());
        assert!((summary.transfer_rate_mbps() - 0.0002).abs() < 1e-9);
    }

    #[test]
    fn station_rate_is_zero_without_transfer_time() {
        let report = StationSyncReport {
            station: StationId::from("KTLX"),
            worker: 0,
            files: 3,
            failed: 0,
            bytes: 3_000_000,
            transfer_time: Duration::ZERO,
        };
        assert_eq!(report.rate_mbps(), 0.0);

        let report = StationSyncReport {
            transfer_time: Duration::from_secs(2),
            ..report
        };
        assert!((report.rate_mbps() - 1.5).abs() < 1e-9);
    }
}
