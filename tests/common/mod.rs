//! Common test utilities for nexrad-sync integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use nexrad_sync::{Config, DateRange, Error, ObjectRef, ObjectStore, Result};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// In-memory bucket whose objects are zero-filled files of a given size
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, u64>>,
    missing: Mutex<HashSet<String>>,
    fetch_starts: Mutex<Vec<(String, Instant)>>,
    fetch_delay: Duration,
    list_delay: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch sleeps `delay` before writing
    pub fn with_fetch_delay(delay: Duration) -> Self {
        Self {
            fetch_delay: delay,
            ..Self::default()
        }
    }

    /// Every listing sleeps `delay` before answering
    pub fn with_list_delay(delay: Duration) -> Self {
        Self {
            list_delay: delay,
            ..Self::default()
        }
    }

    pub fn insert(&self, key: &str, size: u64) {
        self.objects.lock().unwrap().insert(key.to_string(), size);
    }

    /// Listed, but every GET answers 404
    pub fn insert_missing(&self, key: &str, size: u64) {
        self.insert(key, size);
        self.missing.lock().unwrap().insert(key.to_string());
    }

    pub fn fetches(&self) -> usize {
        self.fetch_starts.lock().unwrap().len()
    }

    pub fn fetches_started_after(&self, at: Instant) -> usize {
        self.fetch_starts
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, started)| *started > at)
            .count()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectRef>> {
        if !self.list_delay.is_zero() {
            tokio::time::sleep(self.list_delay).await;
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, size)| ObjectRef {
                key: key.clone(),
                size: *size,
            })
            .collect())
    }

    async fn fetch(&self, key: &str, local_path: &Path) -> Result<u64> {
        self.fetch_starts
            .lock()
            .unwrap()
            .push((key.to_string(), Instant::now()));
        if !self.fetch_delay.is_zero() {
            tokio::time::sleep(self.fetch_delay).await;
        }
        if self.missing.lock().unwrap().contains(key) {
            return Err(Error::Store {
                status: 404,
                key: key.to_string(),
            });
        }
        let size = self.objects.lock().unwrap().get(key).copied().ok_or_else(|| {
            Error::Store {
                status: 404,
                key: key.to_string(),
            }
        })?;
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local_path, vec![0u8; size as usize]).await?;
        Ok(size)
    }
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
    date(y, m, d).and_hms_opt(h, 0, 0).unwrap()
}

/// `[first 00:00, last + 1 day 00:00)`
pub fn days(first: NaiveDate, last: NaiveDate) -> DateRange {
    let end = last.succ_opt().unwrap().and_hms_opt(0, 0, 0).unwrap();
    DateRange::new(first.and_hms_opt(0, 0, 0).unwrap(), end).unwrap()
}

/// Bucket key of a scan: `YYYY/MM/DD/STATION/STATIONYYYYMMDD_HHMMSS_V06`
pub fn scan_key(station: &str, day: NaiveDate, hhmmss: &str) -> String {
    format!(
        "{}/{station}/{station}{}_{hhmmss}_V06",
        day.format("%Y/%m/%d"),
        day.format("%Y%m%d")
    )
}

/// Config writing into `root` with fast retries and conversion polling
pub fn config_in(root: &Path, workers: usize) -> Config {
    let mut config = Config::default();
    config.download.data_root = root.join("data");
    config.download.concurrency = workers;
    config.retry.max_delay = Duration::from_millis(10);
    config.conversion.scratch_root = root.join("scratch");
    config.conversion.poll_interval = Duration::from_millis(20);
    config.conversion.monitor_grace = Duration::from_secs(5);
    config
}
