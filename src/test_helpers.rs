//! Shared test helpers: a scripted in-memory object store and task builders.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use crate::error::{Error, Result};
use crate::store::ObjectStore;
use crate::types::{DownloadTask, ObjectRef, StationId};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Debug, Default)]
struct Script {
    /// Write this many bytes, then fail, on every attempt
    fail_with_partial: Option<u64>,
    /// Write a short file on the first N attempts
    truncate: Option<(u32, u64)>,
    /// Sleep before writing anything
    delay: Option<Duration>,
}

#[derive(Debug, Default)]
struct State {
    objects: BTreeMap<String, u64>,
    scripts: HashMap<String, Script>,
    failing_prefixes: HashSet<String>,
    fetches: HashMap<String, u32>,
    listed: Vec<String>,
}

/// In-memory bucket whose objects are zero-filled files of a given size
#[derive(Debug, Default)]
pub(crate) struct ScriptedStore {
    state: Mutex<State>,
}

impl ScriptedStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&self, key: &str, size: u64) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(key.to_string(), size);
    }

    pub(crate) fn fail_always_with_partial(&self, key: &str, partial: u64) {
        self.with_script(key, |s| s.fail_with_partial = Some(partial));
    }

    pub(crate) fn truncate_first(&self, key: &str, attempts: u32, size: u64) {
        self.with_script(key, |s| s.truncate = Some((attempts, size)));
    }

    pub(crate) fn set_delay(&self, key: &str, delay: Duration) {
        self.with_script(key, |s| s.delay = Some(delay));
    }

    pub(crate) fn fail_listing(&self, prefix: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_prefixes
            .insert(prefix.to_string());
    }

    pub(crate) fn fetch_count(&self, key: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .fetches
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn total_fetches(&self) -> u32 {
        self.state.lock().unwrap().fetches.values().sum()
    }

    pub(crate) fn listed_prefixes(&self) -> Vec<String> {
        self.state.lock().unwrap().listed.clone()
    }

    fn with_script(&self, key: &str, edit: impl FnOnce(&mut Script)) {
        let mut state = self.state.lock().unwrap();
        edit(state.scripts.entry(key.to_string()).or_default());
    }
}

#[async_trait]
impl ObjectStore for ScriptedStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectRef>> {
        let mut state = self.state.lock().unwrap();
        state.listed.push(prefix.to_string());
        if state.failing_prefixes.contains(prefix) {
            return Err(Error::Store {
                status: 500,
                key: prefix.to_string(),
            });
        }
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, size)| ObjectRef {
                key: key.clone(),
                size: *size,
            })
            .collect())
    }

    async fn fetch(&self, key: &str, local_path: &Path) -> Result<u64> {
        let (size, script, attempt) = {
            let mut state = self.state.lock().unwrap();
            let count = state.fetches.entry(key.to_string()).or_insert(0);
            *count += 1;
            let attempt = *count;
            let size = state.objects.get(key).copied();
            let script = state.scripts.get(key).cloned().unwrap_or_default();
            (size, script, attempt)
        };

        if let Some(delay) = script.delay {
            tokio::time::sleep(delay).await;
        }

        let Some(size) = size else {
            return Err(Error::Store {
                status: 404,
                key: key.to_string(),
            });
        };

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if let Some(partial) = script.fail_with_partial {
            tokio::fs::write(local_path, vec![0u8; partial as usize]).await?;
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "connection reset mid-transfer",
            )));
        }

        let written = match script.truncate {
            Some((attempts, short)) if attempt <= attempts => short,
            _ => size,
        };
        tokio::fs::write(local_path, vec![0u8; written as usize]).await?;
        Ok(written)
    }
}

/// Task for `<root>/<station>/<file>` with a key under 2024/05/01
pub(crate) fn task_for(root: &Path, station: &str, file: &str, size: u64) -> DownloadTask {
    DownloadTask {
        station: StationId::from(station),
        remote_key: format!("2024/05/01/{station}/{file}"),
        expected_size_bytes: size,
        local_path: root.join(station).join(file),
    }
}
