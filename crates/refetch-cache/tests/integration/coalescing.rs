use std::time::Duration;

use refetch_cache::{Entry, FetchError, RequestOptions, Status};
use serde::Serialize;
use serde_json::json;

use crate::{Counter, Recorder, delayed, failing, setup_cache, summary};

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_are_coalesced() {
    let cache = setup_cache::<u32>(|_| {});
    let calls = Counter::new();

    let mut recorder = Recorder::<Entry<u32>>::new();
    let _subscription = cache.subscribe("user:1", recorder.callback()).unwrap();

    for _ in 0..5 {
        cache
            .request("user:1", delayed(&calls, Duration::from_millis(100), 42))
            .unwrap();
    }

    let loading = recorder.next().await;
    assert_eq!(summary(&loading), (Status::Loading, None));

    let success = recorder.next().await;
    assert_eq!(summary(&success), (Status::Success, Some(42)));
    assert_eq!(success.generation(), loading.generation());

    assert_eq!(calls.get(), 1);
    assert!(recorder.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_fresh_entry_is_served_from_cache() {
    let cache = setup_cache::<u32>(|config| {
        config.defaults.stale_time = Duration::from_secs(60);
    });
    let calls = Counter::new();

    cache
        .request("user:1", delayed(&calls, Duration::from_millis(10), 1))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    cache
        .request("user:1", delayed(&calls, Duration::from_millis(10), 2))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let entry = cache.get_snapshot("user:1").unwrap().unwrap();
    assert_eq!(summary(&entry), (Status::Success, Some(1)));
    assert_eq!(calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_keys_are_independent() {
    let cache = setup_cache::<u32>(|_| {});
    let calls = Counter::new();
    let options = RequestOptions {
        retry: 0,
        ..Default::default()
    };

    let mut failed = Recorder::<Entry<u32>>::new();
    let _failed_subscription = cache.subscribe("user:1", failed.callback()).unwrap();
    let mut succeeded = Recorder::<Entry<u32>>::new();
    let _succeeded_subscription = cache.subscribe("user:2", succeeded.callback()).unwrap();

    cache
        .request_with("user:1", failing(&calls, FetchError::NotFound), options)
        .unwrap();
    cache
        .request_with(
            "user:2",
            delayed(&calls, Duration::from_millis(50), 2),
            options,
        )
        .unwrap();

    assert_eq!(failed.next().await.status(), Status::Loading);
    let error = failed.next().await;
    assert_eq!(error.status(), Status::Error);
    assert_eq!(error.error(), Some(&FetchError::NotFound));

    assert_eq!(succeeded.next().await.status(), Status::Loading);
    let success = succeeded.next().await;
    assert_eq!(summary(&success), (Status::Success, Some(2)));
    assert_eq!(success.error(), None);

    // both keys fetched concurrently, each exactly once
    assert_eq!(calls.get(), 2);
    assert!(failed.drain().is_empty());
    assert!(succeeded.drain().is_empty());
}

#[derive(Serialize)]
struct UserQuery {
    id: u32,
    kind: &'static str,
    fields: Vec<&'static str>,
}

#[tokio::test(start_paused = true)]
async fn test_equivalent_descriptors_share_an_entry() {
    let cache = setup_cache::<u32>(|_| {});
    let calls = Counter::new();

    let query = UserQuery {
        id: 1,
        kind: "user",
        fields: vec!["name", "email"],
    };
    let reordered = json!({
        "fields": ["name", "email"],
        "kind": "user",
        "id": 1,
    });

    cache
        .request(&query, delayed(&calls, Duration::from_millis(100), 1))
        .unwrap();
    cache
        .request(&reordered, delayed(&calls, Duration::from_millis(100), 2))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(calls.get(), 1);
    assert_eq!(cache.len(), 1);

    let entry = cache.get_snapshot(&reordered).unwrap().unwrap();
    assert_eq!(summary(&entry), (Status::Success, Some(1)));

    // array order is significant
    let other = json!({
        "fields": ["email", "name"],
        "kind": "user",
        "id": 1,
    });
    assert!(cache.get_snapshot(&other).unwrap().is_none());
}
