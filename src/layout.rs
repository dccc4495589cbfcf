//! Local archive layout and bucket naming conventions
//!
//! Local files live at
//! `<root>/<dataset>/<YYYY>/<YYYYMM>/<YYYYMMDD>/<STATION>/<file>`; bucket keys
//! are `YYYY/MM/DD/<STATION>/<file>`.

use chrono::{NaiveDate, NaiveDateTime};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::DownloadConfig;
use crate::types::StationId;

/// Scan time format embedded in Level 2 file names
const SCAN_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Byte range of the scan time inside a file name (`KTLX20240501_000312_V06`)
const SCAN_TIME_RANGE: std::ops::Range<usize> = 4..19;

/// Resolves local directories for a dataset root
#[derive(Clone, Debug)]
pub struct LocalLayout {
    root: PathBuf,
}

impl LocalLayout {
    /// Layout rooted at `<data_root>/<dataset>`
    pub fn new(data_root: &Path, dataset: &Path) -> Self {
        Self {
            root: data_root.join(dataset),
        }
    }

    /// Layout described by a download configuration
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self::new(&config.data_root, &config.dataset)
    }

    /// Dataset root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<YYYY>/<YYYYMM>/<YYYYMMDD>`
    pub fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join(date.format("%Y").to_string())
            .join(date.format("%Y%m").to_string())
            .join(date.format("%Y%m%d").to_string())
    }

    /// `<root>/<YYYY>/<YYYYMM>/<YYYYMMDD>/<STATION>`
    pub fn station_dir(&self, date: NaiveDate, station: &StationId) -> PathBuf {
        self.day_dir(date).join(station.as_str())
    }
}

/// Bucket prefix for one day: `YYYY/MM/DD/`
pub fn day_prefix(date: NaiveDate) -> String {
    date.format("%Y/%m/%d/").to_string()
}

/// Bucket prefix for one station and day: `YYYY/MM/DD/STATION`
pub fn station_prefix(date: NaiveDate, station: &StationId) -> String {
    format!("{}{}", day_prefix(date), station)
}

/// Volume scan time encoded in a Level 2 file name
pub fn parse_scan_time(file_name: &str) -> Option<NaiveDateTime> {
    let stamp = file_name.get(SCAN_TIME_RANGE)?;
    NaiveDateTime::parse_from_str(stamp, SCAN_TIME_FORMAT).ok()
}

/// Whether a file name ends with one of the excluded suffixes
pub fn is_excluded(file_name: &str, suffixes: &[String]) -> bool {
    suffixes
        .iter()
        .any(|suffix| !suffix.is_empty() && file_name.ends_with(suffix.as_str()))
}

/// Regular, non-hidden files below `dir`, sorted by path
pub fn list_data_files(dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| !is_hidden(entry.file_name()))
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

pub(crate) fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.'))
}
