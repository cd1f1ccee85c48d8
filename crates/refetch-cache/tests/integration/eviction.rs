use std::time::Duration;

use refetch_cache::{CacheError, Entry, Status};

use crate::{Counter, Recorder, delayed, setup_cache};

#[tokio::test(start_paused = true)]
async fn test_unused_entry_is_evicted() {
    let cache = setup_cache::<u32>(|config| {
        config.gc_time = Duration::from_secs(10);
    });
    let calls = Counter::new();

    cache
        .request("user:1", delayed(&calls, Duration::from_millis(10), 1))
        .unwrap();

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(cache.get_snapshot("user:1").unwrap().is_some());

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(cache.get_snapshot("user:1").unwrap().is_none());
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_subscribed_entry_is_kept() {
    let cache = setup_cache::<u32>(|config| {
        config.gc_time = Duration::from_secs(10);
    });
    let calls = Counter::new();

    let recorder = Recorder::<Entry<u32>>::new();
    let subscription = cache.subscribe("user:1", recorder.callback()).unwrap();
    cache
        .request("user:1", delayed(&calls, Duration::from_millis(10), 1))
        .unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        cache.get_snapshot("user:1").unwrap().map(|e| e.status()),
        Some(Status::Success)
    );
    assert_eq!(
        cache.evict("user:1").unwrap_err(),
        CacheError::EntryInUse { subscribers: 1 }
    );

    // the grace period starts once the last subscriber is gone
    drop(subscription);
    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(cache.get_snapshot("user:1").unwrap().is_some());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(cache.get_snapshot("user:1").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_resubscribing_cancels_eviction() {
    let cache = setup_cache::<u32>(|config| {
        config.gc_time = Duration::from_secs(10);
        config.defaults.stale_time = Duration::from_secs(3600);
    });
    let calls = Counter::new();

    cache
        .request("user:1", delayed(&calls, Duration::from_millis(10), 1))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let recorder = Recorder::<Entry<u32>>::new();
    let subscription = cache.subscribe("user:1", recorder.callback()).unwrap();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(cache.get_snapshot("user:1").unwrap().is_some());

    // the value survived, nothing was refetched
    drop(subscription);
    let entry = cache.get_snapshot("user:1").unwrap().unwrap();
    assert_eq!(entry.value().map(|value| **value), Some(1));
    assert_eq!(calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_entry_is_not_evicted() {
    let cache = setup_cache::<u32>(|config| {
        config.gc_time = Duration::from_secs(1);
    });
    let calls = Counter::new();

    cache
        .request("user:1", delayed(&calls, Duration::from_secs(5), 1))
        .unwrap();

    // the fetch outlives the grace period
    tokio::time::sleep(Duration::from_secs(3)).await;
    let entry = cache.get_snapshot("user:1").unwrap().unwrap();
    assert_eq!(entry.status(), Status::Loading);

    // once settled, the entry gets another grace period
    tokio::time::sleep(Duration::from_millis(2500)).await;
    let entry = cache.get_snapshot("user:1").unwrap().unwrap();
    assert_eq!(entry.status(), Status::Success);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(cache.get_snapshot("user:1").unwrap().is_none());
}
