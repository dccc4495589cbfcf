//! Tests against the public NOAA Level 2 bucket
//!
//! Compiled only with the `live-tests` feature and marked `#[ignore]`.
//!
//! ```bash
//! cargo test --features live-tests --test live_bucket -- --ignored --nocapture
//! ```

#![cfg(feature = "live-tests")]

use nexrad_sync::{HttpBucketStore, ObjectStore, StoreConfig};

#[tokio::test]
#[ignore]
async fn list_and_fetch_one_scan() {
    let store = HttpBucketStore::new(&StoreConfig::default()).unwrap();

    let objects = store.list("2013/05/20/KTLX").await.unwrap();
    assert!(!objects.is_empty(), "KTLX should have scans on 2013-05-20");
    println!("Listed {} objects", objects.len());

    let smallest = objects.iter().min_by_key(|o| o.size).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join(smallest.file_name());

    let written = store.fetch(&smallest.key, &local).await.unwrap();
    assert_eq!(written, smallest.size);
    assert_eq!(std::fs::metadata(&local).unwrap().len(), smallest.size);
}
