//! Conversion completion monitor
//!
//! The converter gives no completion callback. What it does do is write one
//! cache artifact per input file into a cache directory tree, named after the
//! URL-encoded input path. The monitor polls that tree, waits until an
//! artifact's size is stable across two consecutive polls, attributes it to a
//! station from the encoded path, and counts it. A station is DONE when its
//! converted count reaches the number of files it was given.
//!
//! All progress state is owned by the monitor task. Callers observe it through
//! a `watch` channel of snapshots and an `mpsc` channel of completions, and get
//! the final split into done and pending stations from [`ConversionMonitor::run`].

use crate::layout::is_hidden;
use crate::log_aggregator::LogHandle;
use crate::report::{SummaryTable, station_row};
use crate::types::StationId;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Separator the converter uses for `/` in cache artifact names
const ENCODED_SEPARATOR: &str = "%2F";

/// Per-station conversion counters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StationProgress {
    /// Total size of the station's input files
    pub compressed_size_bytes: u64,
    /// Total size of the station's finalized cache artifacts
    pub converted_size_bytes: u64,
    /// Number of input files handed to the converter
    pub num_to_convert: u64,
    /// Number of finalized artifacts attributed so far
    pub num_converted: u64,
}

impl StationProgress {
    /// Counters for a station that has not converted anything yet
    pub fn new(compressed_size_bytes: u64, num_to_convert: u64) -> Self {
        Self {
            compressed_size_bytes,
            num_to_convert,
            ..Default::default()
        }
    }

    /// Where the station is in `PENDING → IN_PROGRESS → DONE`
    pub fn state(&self) -> StationState {
        if self.num_converted >= self.num_to_convert {
            StationState::Done
        } else if self.num_converted > 0 {
            StationState::InProgress
        } else {
            StationState::Pending
        }
    }
}

/// Conversion state of one station
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StationState {
    /// No artifact finalized yet
    Pending,
    /// Some artifacts finalized
    InProgress,
    /// Every input file accounted for
    Done,
}

/// Last thing the monitor saw for one cache artifact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheFileObservation {
    /// Artifact path
    pub path: PathBuf,
    /// Size at the last poll
    pub last_observed_size: u64,
    /// When that size was read
    pub last_observed_at: Instant,
}

/// Emitted when a station reaches DONE
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StationCompletion {
    /// The finished station
    pub station: StationId,
    /// Its final counters
    pub progress: StationProgress,
}

/// Result of feeding one size reading to the tracker
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// No tracked, unfinished station owns this path
    Foreign,
    /// Already counted; waiting for deletion
    AlreadyCounted,
    /// Size not yet confirmed stable
    Settling,
    /// Size confirmed; counted towards `station`
    Finalized {
        /// Owning station
        station: StationId,
        /// Stable size that was counted
        size: u64,
        /// Set when this artifact completed the station
        completion: Option<StationCompletion>,
    },
}

/// Final state handed back when the monitor exits
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MonitorReport {
    /// Stations that reached DONE
    pub done: BTreeMap<StationId, StationProgress>,
    /// Stations still short of their count, in their partial state
    pub pending: BTreeMap<StationId, StationProgress>,
    /// Converted bytes summed over finished stations
    pub total_converted_bytes: u64,
    /// The monitor exited because of the stop signal rather than completion
    pub stopped: bool,
}

impl MonitorReport {
    /// Every station reached DONE
    pub fn is_complete(&self) -> bool {
        self.pending.is_empty()
    }

    /// Done and pending records together
    pub fn all(&self) -> impl Iterator<Item = (&StationId, &StationProgress)> {
        self.done.iter().chain(self.pending.iter())
    }
}

/// The station segment of a cache artifact path
///
/// Artifacts are named after the URL-encoded input path, so
/// `.../file%3A%2Fdata%2F...%2FKTLX%2FKTLX20240501_000312_V06` belongs to
/// `KTLX`: the second-to-last `%2F` segment.
pub fn station_from_cache_path(path: &Path) -> Option<String> {
    let text = path.to_string_lossy();
    let mut segments = text.rsplit(ENCODED_SEPARATOR);
    segments.next()?;
    segments
        .next()
        .filter(|s| !s.is_empty() && !s.contains('/'))
        .map(str::to_string)
}

/// Attribution and counting state, independent of any I/O
///
/// Holds the in-flight and done collections; a station lives in exactly one of
/// them.
#[derive(Debug)]
pub struct CacheTracker {
    in_flight: BTreeMap<StationId, StationProgress>,
    done: BTreeMap<StationId, StationProgress>,
    observations: HashMap<PathBuf, CacheFileObservation>,
    counted: HashSet<PathBuf>,
    total_converted_bytes: u64,
}

impl CacheTracker {
    /// Track `stations`; those with nothing to convert start DONE
    pub fn new(stations: BTreeMap<StationId, StationProgress>) -> Self {
        let (done, in_flight): (BTreeMap<_, _>, BTreeMap<_, _>) = stations
            .into_iter()
            .partition(|(_, p)| p.state() == StationState::Done);
        let total_converted_bytes = done.values().map(|p| p.converted_size_bytes).sum();
        Self {
            in_flight,
            done,
            observations: HashMap::new(),
            counted: HashSet::new(),
            total_converted_bytes,
        }
    }

    /// Whether any station is still short of its count
    pub fn has_pending(&self) -> bool {
        !self.in_flight.is_empty()
    }

    /// Stations not yet DONE
    pub fn in_flight(&self) -> &BTreeMap<StationId, StationProgress> {
        &self.in_flight
    }

    /// Stations that reached DONE
    pub fn done(&self) -> &BTreeMap<StationId, StationProgress> {
        &self.done
    }

    /// Converted bytes of finished stations
    pub fn total_converted_bytes(&self) -> u64 {
        self.total_converted_bytes
    }

    /// Owning in-flight station of `path`, if any
    fn attribute(&self, path: &Path) -> Option<StationId> {
        if let Some(segment) = station_from_cache_path(path) {
            let station = StationId::from(segment);
            if self.in_flight.contains_key(&station) {
                return Some(station);
            }
        }
        // Artifacts not named after an encoded path may still carry the
        // station as a plain directory component
        path.components().rev().find_map(|c| {
            let name = c.as_os_str().to_str()?;
            let station = StationId::from(name);
            self.in_flight.contains_key(&station).then_some(station)
        })
    }

    /// Feed one size reading for `path` taken at `at`
    pub fn observe(&mut self, path: &Path, size: u64, at: Instant) -> Observation {
        if self.counted.contains(path) {
            return Observation::AlreadyCounted;
        }
        let Some(station) = self.attribute(path) else {
            return Observation::Foreign;
        };

        let stable = self
            .observations
            .get(path)
            .is_some_and(|prev| prev.last_observed_size == size && size > 0);

        if !stable {
            self.observations.insert(
                path.to_path_buf(),
                CacheFileObservation {
                    path: path.to_path_buf(),
                    last_observed_size: size,
                    last_observed_at: at,
                },
            );
            return Observation::Settling;
        }

        self.observations.remove(path);
        self.counted.insert(path.to_path_buf());

        let completion = match self.in_flight.get_mut(&station) {
            Some(progress) => {
                progress.num_converted += 1;
                progress.converted_size_bytes += size;
                progress.num_converted >= progress.num_to_convert
            }
            None => false,
        };

        let completion = if completion {
            self.in_flight.remove(&station).map(|progress| {
                self.total_converted_bytes += progress.converted_size_bytes;
                self.done.insert(station.clone(), progress.clone());
                StationCompletion {
                    station: station.clone(),
                    progress,
                }
            })
        } else {
            None
        };

        Observation::Finalized {
            station,
            size,
            completion,
        }
    }

    /// Drop observations of artifacts that were not seen in the latest poll
    pub fn forget_missing(&mut self, seen: &HashSet<PathBuf>) {
        self.observations.retain(|path, _| seen.contains(path));
    }

    /// An artifact counted earlier has been removed from disk
    pub fn release(&mut self, path: &Path) {
        self.counted.remove(path);
    }

    /// Split into the final report
    pub fn into_report(self, stopped: bool) -> MonitorReport {
        MonitorReport {
            done: self.done,
            pending: self.in_flight,
            total_converted_bytes: self.total_converted_bytes,
            stopped,
        }
    }
}

/// Snapshot of the in-flight map published after every poll that changed it
pub type ProgressSnapshot = BTreeMap<StationId, StationProgress>;

/// Polls a cache directory and tracks per-station completion
pub struct ConversionMonitor {
    cache_dir: PathBuf,
    poll_interval: Duration,
    tracker: CacheTracker,
    snapshots: watch::Sender<ProgressSnapshot>,
    completions: Option<mpsc::UnboundedSender<StationCompletion>>,
    table: Option<SummaryTable>,
    log: LogHandle,
}

impl ConversionMonitor {
    /// Monitor `cache_dir` for `stations`
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        stations: BTreeMap<StationId, StationProgress>,
        poll_interval: Duration,
        log: &LogHandle,
    ) -> Self {
        let tracker = CacheTracker::new(stations);
        let (snapshots, _) = watch::channel(tracker.in_flight().clone());
        Self {
            cache_dir: cache_dir.into(),
            poll_interval,
            tracker,
            snapshots,
            completions: None,
            table: None,
            log: log.with_source("monitor"),
        }
    }

    /// Also append a row to `table` for every completed station
    pub fn with_summary_table(mut self, table: SummaryTable) -> Self {
        self.table = Some(table);
        self
    }

    /// Read-only view of the in-flight map
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.snapshots.subscribe()
    }

    /// Receive every station completion as it happens
    pub fn completions(&mut self) -> mpsc::UnboundedReceiver<StationCompletion> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.completions = Some(tx);
        rx
    }

    /// Directory being polled
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Poll until every station is DONE or `stop` fires
    pub async fn run(mut self, stop: CancellationToken) -> MonitorReport {
        let mut stopped = false;

        while self.tracker.has_pending() {
            if stop.is_cancelled() {
                stopped = true;
                break;
            }

            let (changed, to_delete) = self.sweep();
            if changed {
                self.snapshots.send_replace(self.tracker.in_flight().clone());
            }
            self.delete_batch(to_delete).await;

            if !self.tracker.has_pending() {
                break;
            }
            tokio::select! {
                _ = stop.cancelled() => {
                    stopped = true;
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        let report = self.tracker.into_report(stopped);
        if !report.pending.is_empty() {
            self.log.warn(format!(
                "Monitor exiting with {} stations incomplete: {}",
                report.pending.len(),
                report
                    .pending
                    .keys()
                    .map(StationId::as_str)
                    .collect::<Vec<_>>()
                    .join(",")
            ));
        }
        report
    }

    /// One pass over the cache tree; returns whether counters changed and the
    /// artifacts to delete
    fn sweep(&mut self) -> (bool, Vec<PathBuf>) {
        let now = Instant::now();
        let mut seen = HashSet::new();
        let mut to_delete = Vec::new();
        let mut changed = false;

        for entry in WalkDir::new(&self.cache_dir)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| !is_hidden(entry.file_name()))
        {
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let path = entry.into_path();
            seen.insert(path.clone());

            match self.tracker.observe(&path, metadata.len(), now) {
                Observation::Finalized { completion, .. } => {
                    changed = true;
                    to_delete.push(path);
                    if let Some(completion) = completion {
                        self.complete(completion);
                    }
                }
                Observation::Foreign | Observation::AlreadyCounted | Observation::Settling => {}
            }
        }

        self.tracker.forget_missing(&seen);
        (changed, to_delete)
    }

    fn complete(&self, completion: StationCompletion) {
        self.log
            .info(station_row(&completion.station, &completion.progress));
        if let Some(table) = &self.table
            && let Err(e) = table.append_station(&completion.station, &completion.progress)
        {
            self.log.warn(format!(
                "Failed to write summary row to {}: {e}",
                table.path().display()
            ));
        }
        if let Some(tx) = &self.completions {
            tx.send(completion).ok();
        }
    }

    async fn delete_batch(&mut self, paths: Vec<PathBuf>) {
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => self.tracker.release(&path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.tracker.release(&path)
                }
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Failed to delete cache artifact");
                }
            }
        }
    }
}
