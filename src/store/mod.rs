//! Remote object store abstraction
//!
//! The scheduler only needs to enumerate keys under a prefix and the workers
//! only need to copy one object to a local path. Both go through
//! [`ObjectStore`] so tests can substitute a scripted in-memory store.

mod http;

pub use http::HttpBucketStore;

use crate::error::Result;
use crate::types::ObjectRef;
use async_trait::async_trait;
use std::path::Path;

/// Read access to a bucket of dated objects
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Every object whose key starts with `prefix`, in key order
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectRef>>;

    /// Copy `key` to `local_path`, returning the number of bytes written
    ///
    /// A failed fetch must not leave a file at `local_path`.
    async fn fetch(&self, key: &str, local_path: &Path) -> Result<u64>;
}

/// Sibling path used while a transfer is in progress (`<local_path>.part`)
pub fn partial_path(local_path: &Path) -> std::path::PathBuf {
    let mut name = local_path.as_os_str().to_owned();
    name.push(".part");
    std::path::PathBuf::from(name)
}
