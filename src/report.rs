//! Fixed-width conversion summary table
//!
//! One row per completed station, then a totals row and a rule:
//!
//! ```text
//!      KTLX          25431.12         210           1890.55
//! Totals              25.43 M         210            1.89 G
//! ===============================================================================
//! ```

use crate::error::Result;
use crate::monitor::StationProgress;
use crate::types::StationId;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Width of the closing rule line
pub const RULE_WIDTH: usize = 79;

/// `station  KB-in  files  MB-out`
pub fn station_row(station: &StationId, progress: &StationProgress) -> String {
    format!(
        "{:>9}{:18.2}{:12}{:18.2}",
        station.as_str(),
        progress.compressed_size_bytes as f64 / 1.0e3,
        progress.num_converted,
        progress.converted_size_bytes as f64 / 1.0e6
    )
}

/// `Totals  MB-in M  files  GB-out G`
pub fn totals_row(compressed_bytes: u64, files: u64, converted_bytes: u64) -> String {
    format!(
        "{:10}{:15.2} M{:12}{:16.2} G",
        "Totals",
        compressed_bytes as f64 / 1.0e6,
        files,
        converted_bytes as f64 / 1.0e9
    )
}

/// `=` repeated [`RULE_WIDTH`] times
pub fn rule() -> String {
    "=".repeat(RULE_WIDTH)
}

/// Append-only table file
#[derive(Clone, Debug)]
pub struct SummaryTable {
    path: PathBuf,
}

impl SummaryTable {
    /// Table backed by `path`; the file is created on first write
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backing file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one completed station
    pub fn append_station(&self, station: &StationId, progress: &StationProgress) -> Result<()> {
        self.append_lines(&[station_row(station, progress)])
    }

    /// Append the totals row and the closing rule
    pub fn append_totals(&self, compressed_bytes: u64, files: u64, converted_bytes: u64) -> Result<()> {
        self.append_lines(&[totals_row(compressed_bytes, files, converted_bytes), rule()])
    }

    fn append_lines(&self, lines: &[String]) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        for line in lines {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }
}
