use std::sync::Mutex;
use std::time::Duration;

use refetch_cache::{CacheError, Entry, FetchError, RequestOptions, Status};

use crate::{Counter, Recorder, delayed, failing, numbered, setup_cache, summary};

#[tokio::test(start_paused = true)]
async fn test_every_subscriber_sees_every_transition() {
    let cache = setup_cache::<u32>(|_| {});
    let calls = Counter::new();

    let mut first = Recorder::<Entry<u32>>::new();
    let _first = cache.subscribe("user:1", first.callback()).unwrap();
    let mut second = Recorder::<Entry<u32>>::new();
    let _second = cache.subscribe("user:1", second.callback()).unwrap();

    cache
        .request("user:1", delayed(&calls, Duration::from_millis(10), 5))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let first: Vec<_> = first.drain().iter().map(summary).collect();
    let second: Vec<_> = second.drain().iter().map(summary).collect();
    assert_eq!(
        first,
        vec![(Status::Loading, None), (Status::Success, Some(5))]
    );
    // the entry created by the first subscriber is delivered to the second one right away
    assert_eq!(
        second,
        vec![
            (Status::Idle, None),
            (Status::Loading, None),
            (Status::Success, Some(5))
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_to_existing_entry() {
    let cache = setup_cache::<u32>(|config| {
        config.defaults.stale_time = Duration::from_secs(60);
    });
    let calls = Counter::new();

    cache
        .request("user:1", delayed(&calls, Duration::from_millis(10), 5))
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut recorder = Recorder::<Entry<u32>>::new();
    let subscription = cache.subscribe("user:1", recorder.callback()).unwrap();
    assert_eq!(subscription.key().metadata(), "\"user:1\"");

    // the current state is delivered right away
    let initial = recorder.next().await;
    assert_eq!(summary(&initial), (Status::Success, Some(5)));
    assert_eq!(initial.subscriber_count(), 1);

    // a fresh entry is not revalidated
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(recorder.drain().is_empty());
    assert_eq!(calls.get(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_subscribe_revalidates_stale_entry() {
    let cache = setup_cache::<usize>(|_| {});
    let calls = Counter::new();

    cache.request("user:1", numbered(&calls)).unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;

    let mut recorder = Recorder::<Entry<usize>>::new();
    let _subscription = cache.subscribe("user:1", recorder.callback()).unwrap();

    // the stale value is served while it is being refetched
    assert_eq!(summary(&recorder.next().await), (Status::Success, Some(0)));
    assert_eq!(summary(&recorder.next().await), (Status::Loading, Some(0)));
    assert_eq!(summary(&recorder.next().await), (Status::Success, Some(1)));
    assert_eq!(calls.get(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_invalidate_refetches_observed_entry() {
    let cache = setup_cache::<usize>(|config| {
        config.defaults.stale_time = Duration::from_secs(3600);
    });
    let calls = Counter::new();

    let mut recorder = Recorder::<Entry<usize>>::new();
    let _subscription = cache.subscribe("user:1", recorder.callback()).unwrap();

    cache.request("user:1", numbered(&calls)).unwrap();
    assert_eq!(summary(&recorder.next().await), (Status::Loading, None));
    assert_eq!(summary(&recorder.next().await), (Status::Success, Some(0)));

    cache.invalidate("user:1").unwrap();
    assert_eq!(summary(&recorder.next().await), (Status::Loading, Some(0)));
    let refetched = recorder.next().await;
    assert_eq!(summary(&refetched), (Status::Success, Some(1)));
    assert!(!refetched.is_invalidated());

    // invalidating unknown keys does nothing
    cache.invalidate("user:2").unwrap();
    assert!(cache.get_snapshot("user:2").unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_unsubscribe_stops_notifications() {
    let cache = setup_cache::<u32>(|_| {});
    let calls = Counter::new();

    let mut kept = Recorder::<Entry<u32>>::new();
    let _kept = cache.subscribe("user:1", kept.callback()).unwrap();
    let mut dropped = Recorder::<Entry<u32>>::new();
    let subscription = cache.subscribe("user:1", dropped.callback()).unwrap();

    let initial = dropped.next().await;
    assert_eq!(summary(&initial), (Status::Idle, None));
    assert_eq!(initial.subscriber_count(), 2);

    cache
        .request("user:1", delayed(&calls, Duration::from_millis(10), 5))
        .unwrap();
    assert_eq!(summary(&dropped.next().await), (Status::Loading, None));
    subscription.unsubscribe();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(dropped.drain().is_empty());

    let kept: Vec<_> = kept.drain().iter().map(summary).collect();
    assert_eq!(
        kept,
        vec![(Status::Loading, None), (Status::Success, Some(5))]
    );

    let entry = cache.get_snapshot("user:1").unwrap().unwrap();
    assert_eq!(entry.subscriber_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_callbacks_may_reenter_cache() {
    let cache = setup_cache::<u32>(|_| {});
    let calls = Counter::new();
    let mut recorder = Recorder::<Entry<u32>>::new();

    let reentrant = {
        let cache = cache.clone();
        let record = recorder.callback();
        move |entry: &Entry<u32>| {
            let snapshot = cache.get_snapshot(entry.key().descriptor()).unwrap();
            if let Some(snapshot) = snapshot {
                record(&snapshot);
            }
        }
    };
    let _subscription = cache.subscribe("user:1", reentrant).unwrap();

    cache
        .request("user:1", delayed(&calls, Duration::from_millis(10), 5))
        .unwrap();
    assert_eq!(summary(&recorder.next().await), (Status::Loading, None));
    assert_eq!(summary(&recorder.next().await), (Status::Success, Some(5)));
}

#[tokio::test(start_paused = true)]
async fn test_callbacks_may_own_subscriptions() {
    let cache = setup_cache::<u32>(|_| {});
    let recorder = Recorder::<Entry<u32>>::new();

    let inner = cache.subscribe("user:2", recorder.callback()).unwrap();
    let outer = {
        let inner = Mutex::new(inner);
        cache
            .subscribe("user:1", move |_: &Entry<u32>| {
                let _inner = inner.lock().unwrap();
            })
            .unwrap()
    };
    let entry = cache.get_snapshot("user:2").unwrap().unwrap();
    assert_eq!(entry.subscriber_count(), 1);

    // dropping the outer callback detaches the subscription it owns
    drop(outer);
    let entry = cache.get_snapshot("user:2").unwrap().unwrap();
    assert_eq!(entry.subscriber_count(), 0);
    let entry = cache.get_snapshot("user:1").unwrap().unwrap();
    assert_eq!(entry.subscriber_count(), 0);

    // same when the callbacks are released by disposing the cache
    let inner = cache.subscribe("user:4", recorder.callback()).unwrap();
    let _outer = {
        let inner = Mutex::new(inner);
        cache
            .subscribe("user:3", move |_: &Entry<u32>| {
                let _inner = inner.lock().unwrap();
            })
            .unwrap()
    };
    cache.dispose();
    assert_eq!(
        cache.get_snapshot("user:3").unwrap_err(),
        CacheError::Disposed
    );
}

#[tokio::test(start_paused = true)]
async fn test_panicking_callback_does_not_stall_fetch() {
    let cache = setup_cache::<u32>(|config| {
        config.gc_time = Duration::from_secs(10);
    });
    let calls = Counter::new();
    let error = FetchError::Failed("connection reset".into());

    let panicking = cache
        .subscribe("user:1", |_: &Entry<u32>| panic!("broken subscriber"))
        .unwrap();
    let mut recorder = Recorder::<Entry<u32>>::new();
    let subscription = cache.subscribe("user:1", recorder.callback()).unwrap();
    assert_eq!(summary(&recorder.next().await), (Status::Idle, None));

    let options = RequestOptions {
        retry: 1,
        retry_delay: Duration::from_secs(1),
        ..Default::default()
    };
    cache
        .request_with("user:1", failing(&calls, error), options)
        .unwrap();

    // later subscribers and retries are not affected by the panic
    let mut transitions = Vec::new();
    for _ in 0..4 {
        let entry = recorder.next().await;
        transitions.push((entry.status(), entry.failure_count()));
    }
    assert_eq!(
        transitions,
        vec![
            (Status::Loading, 0),
            (Status::Error, 1),
            (Status::Loading, 1),
            (Status::Error, 2),
        ]
    );
    assert_eq!(calls.get(), 2);

    // the fetch settled, so the entry is evicted once unobserved
    drop(subscription);
    drop(panicking);
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(cache.get_snapshot("user:1").unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transitions_are_delivered_in_order_across_threads() {
    let cache = setup_cache::<usize>(|_| {});
    let calls = Counter::new();

    let mut recorders = Vec::new();
    let mut subscriptions = Vec::new();
    for id in 0..64 {
        let recorder = Recorder::<Entry<usize>>::new();
        subscriptions.push(cache.subscribe(&("user", id), recorder.callback()).unwrap());
        recorders.push(recorder);
    }

    let requests: Vec<_> = (0..64)
        .map(|id| {
            let cache = cache.clone();
            let fetcher = numbered(&calls);
            tokio::spawn(async move { cache.request(&("user", id), fetcher).unwrap() })
        })
        .collect();
    for request in requests {
        request.await.unwrap();
    }

    for (id, recorder) in recorders.iter_mut().enumerate() {
        let statuses = [recorder.next().await.status(), recorder.next().await.status()];
        assert_eq!(statuses, [Status::Loading, Status::Success], "user {id}");

        let entry = cache.get_snapshot(&("user", id)).unwrap().unwrap();
        assert_eq!(entry.status(), Status::Success);
    }
    assert_eq!(calls.get(), 64);
}
