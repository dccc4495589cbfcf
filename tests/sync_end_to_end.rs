//! End-to-end download runs against an in-memory bucket
//!
//! These tests drive `sync_stations` through the scheduler, the worker pool
//! and the log aggregator exactly as a caller would, with the bucket replaced
//! by `common::MemoryStore`.

mod common;

use common::{MemoryStore, config_in, date, days, scan_key};
use nexrad_sync::{
    CancellationController, LogAggregator, MemorySink, SentinelMode, StationId, sync_stations,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn two_station_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert(&scan_key("KTLX", date(2024, 5, 1), "000312"), 1_000);
    store.insert(&scan_key("KTLX", date(2024, 5, 2), "010203"), 2_000);
    store.insert(&scan_key("KINX", date(2024, 5, 1), "120000"), 3_000);
    store.insert_missing(&scan_key("KINX", date(2024, 5, 2), "120000"), 4_000);
    store
}

fn stations() -> Vec<StationId> {
    vec![StationId::from("KTLX"), StationId::from("KINX")]
}

#[tokio::test]
async fn two_stations_two_days_with_one_missing_object() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 2);
    let store = two_station_store();

    let (log, aggregator) = LogAggregator::spawn(MemorySink::new());
    let outcome = sync_stations(
        &config,
        store.clone(),
        &CancellationController::new(),
        &days(date(2024, 5, 1), date(2024, 5, 2)),
        &stations(),
        &log,
    )
    .await
    .unwrap();

    let summary = &outcome.summary;
    assert_eq!(summary.enqueued, 4);
    assert_eq!(summary.succeeded, 3);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.bytes_transferred, 6_000);
    assert!(!summary.killed);

    // a 404 is terminal: exactly one attempt per object
    assert_eq!(store.fetches(), 4);

    // one station summary per station and day
    assert_eq!(outcome.enqueue.sentinels, 4);
    assert_eq!(summary.stations.len(), 4);
    let kinx_failed: u64 = summary
        .stations
        .iter()
        .filter(|r| r.station.as_str() == "KINX")
        .map(|r| r.failed)
        .sum();
    assert_eq!(kinx_failed, 1);

    assert_eq!(outcome.files.len(), 3);
    for file in &outcome.files {
        assert!(file.starts_with(dir.path().join("data/NEXRAD/level2/2024/202405")));
    }
    assert!(
        !dir.path()
            .join("data/NEXRAD/level2/2024/202405/20240502/KINX/KINX20240502_120000_V06")
            .exists()
    );

    let sink = aggregator.finish().await.unwrap();
    assert_eq!(sink.matching("Failed to download").len(), 1);
    assert_eq!(sink.matching("sync complete at").len(), 4);
}

#[tokio::test]
async fn per_station_sentinels_total_the_whole_range() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(dir.path(), 2);
    config.download.sentinel_mode = SentinelMode::PerStation;
    let store = two_station_store();

    let (log, _aggregator) = LogAggregator::spawn(MemorySink::new());
    let outcome = sync_stations(
        &config,
        store,
        &CancellationController::new(),
        &days(date(2024, 5, 1), date(2024, 5, 2)),
        &stations(),
        &log,
    )
    .await
    .unwrap();

    assert_eq!(outcome.enqueue.sentinels, 2);
    assert_eq!(outcome.summary.stations.len(), 2);

    let ktlx = outcome
        .summary
        .stations
        .iter()
        .find(|r| r.station.as_str() == "KTLX")
        .unwrap();
    assert_eq!(ktlx.files, 2);
    assert_eq!(ktlx.bytes, 3_000);

    let kinx = outcome
        .summary
        .stations
        .iter()
        .find(|r| r.station.as_str() == "KINX")
        .unwrap();
    assert_eq!(kinx.files, 1);
    assert_eq!(kinx.failed, 1);
    assert_eq!(kinx.bytes, 3_000);
}

#[tokio::test]
async fn second_run_finds_everything_already_present() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 2);
    let store = Arc::new(MemoryStore::new());
    store.insert(&scan_key("KTLX", date(2024, 5, 1), "000312"), 1_000);
    store.insert(&scan_key("KTLX", date(2024, 5, 1), "000812"), 1_000);
    let range = days(date(2024, 5, 1), date(2024, 5, 1));

    let (log, _aggregator) = LogAggregator::spawn(MemorySink::new());
    let stations = [StationId::from("KTLX")];
    let controller = CancellationController::new();

    let first = sync_stations(&config, store.clone(), &controller, &range, &stations, &log)
        .await
        .unwrap();
    assert_eq!(first.summary.succeeded, 2);
    assert_eq!(store.fetches(), 2);

    let second = sync_stations(&config, store.clone(), &controller, &range, &stations, &log)
        .await
        .unwrap();
    assert_eq!(second.summary.succeeded, 2);
    assert_eq!(second.summary.bytes_transferred, 2_000);
    assert_eq!(store.fetches(), 2);
}

#[tokio::test]
async fn one_controller_serves_consecutive_runs_with_slow_listings() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 2);
    // listings outlast a worker's idle dequeue wait
    let store = Arc::new(MemoryStore::with_list_delay(Duration::from_millis(800)));
    store.insert(&scan_key("KTLX", date(2024, 5, 1), "000312"), 1_000);
    store.insert(&scan_key("KTLX", date(2024, 5, 2), "000312"), 1_000);
    let stations = [StationId::from("KTLX")];

    let (log, aggregator) = LogAggregator::spawn(MemorySink::new());
    let controller = CancellationController::new();

    for (run, day) in [date(2024, 5, 1), date(2024, 5, 2)].into_iter().enumerate() {
        let outcome = sync_stations(
            &config,
            store.clone(),
            &controller,
            &days(day, day),
            &stations,
            &log,
        )
        .await
        .unwrap();

        assert!(!outcome.enqueue.cancelled, "run {run} stopped early");
        assert_eq!(outcome.summary.enqueued, 1, "run {run}");
        assert_eq!(outcome.summary.succeeded, 1, "run {run}");
        assert_eq!(outcome.summary.failed, 0, "run {run}");
        assert!(!outcome.summary.killed);
    }
    assert!(!controller.is_stopped());
    assert!(!controller.is_killed());

    let sink = aggregator.finish().await.unwrap();
    assert!(sink.matching("stopped by kill").is_empty());
}

#[tokio::test]
async fn stations_keep_their_queue_across_days() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 2);
    let store = Arc::new(MemoryStore::new());
    let stations: Vec<StationId> = ["KTLX", "KINX", "KFDR", "KVNX", "KDDC"]
        .into_iter()
        .map(StationId::from)
        .collect();
    for station in &stations {
        for day in [date(2024, 5, 1), date(2024, 5, 2)] {
            store.insert(&scan_key(station.as_str(), day, "060000"), 100);
        }
    }

    let (log, _aggregator) = LogAggregator::spawn(MemorySink::new());
    let outcome = sync_stations(
        &config,
        store,
        &CancellationController::new(),
        &days(date(2024, 5, 1), date(2024, 5, 2)),
        &stations,
        &log,
    )
    .await
    .unwrap();

    assert_eq!(outcome.enqueue.tasks_per_queue, vec![6, 4]);
    assert_eq!(outcome.summary.stations.len(), 10);
    for report in &outcome.summary.stations {
        let index = stations.iter().position(|s| *s == report.station).unwrap();
        assert_eq!(report.worker, index % 2, "{} on wrong worker", report.station);
    }
}

#[tokio::test]
async fn kill_counts_unfinished_work_as_failed_and_starts_nothing_new() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path(), 1);
    let store = Arc::new(MemoryStore::with_fetch_delay(Duration::from_millis(200)));
    for minute in 0..10 {
        store.insert(
            &scan_key("KTLX", date(2024, 5, 1), &format!("00{minute:02}00")),
            10,
        );
    }

    let controller = CancellationController::new();
    let killer = {
        let controller = controller.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            controller.kill();
            Instant::now()
        })
    };

    let (log, aggregator) = LogAggregator::spawn(MemorySink::new());
    let outcome = sync_stations(
        &config,
        store.clone(),
        &controller,
        &days(date(2024, 5, 1), date(2024, 5, 1)),
        &[StationId::from("KTLX")],
        &log,
    )
    .await
    .unwrap();
    let killed_at = killer.await.unwrap();

    let summary = &outcome.summary;
    assert!(summary.killed);
    assert_eq!(summary.enqueued, 10);
    assert!(summary.succeeded < summary.enqueued);
    assert_eq!(summary.failed, summary.enqueued - summary.succeeded);
    assert_eq!(store.fetches_started_after(killed_at), 0);

    let sink = aggregator.finish().await.unwrap();
    assert!(sink.matching("Some files failed to sync!").len() == 1);
}
