use futures::FutureExt;
use rating_engine::{
    db::InMemoryStore,
    engine::RatingEngine,
    errors::AppError,
    feed::SubscriptionHandle,
    models::AggregateRecord,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use uuid::Uuid;

fn engine_with(store: Arc<InMemoryStore>) -> RatingEngine {
    RatingEngine::new(store)
}

fn new_engine() -> (RatingEngine, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new(16));
    (engine_with(store.clone()), store)
}

async fn submit(
    engine: &RatingEngine,
    rater: Uuid,
    target: Uuid,
    stars: i64,
) -> Result<AggregateRecord, AppError> {
    engine.submit(&Some(rater), target, stars, None).await
}

type Seen = Arc<Mutex<Vec<AggregateRecord>>>;

fn collector() -> (Seen, impl Fn(&AggregateRecord) + Send + Sync + 'static) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |record: &AggregateRecord| {
        sink.lock().unwrap().push(record.clone())
    })
}

/// Change delivery runs after `submit` returns, so wait for it.
async fn wait_until(seen: &Seen, done: impl Fn(&[AggregateRecord]) -> bool) -> Vec<AggregateRecord> {
    for _ in 0..400 {
        {
            let records = seen.lock().unwrap();
            if done(&records) {
                return records.clone();
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("subscriber never caught up: {:?}", seen.lock().unwrap());
}

#[tokio::test]
async fn test_replacement_scenario() {
    let (engine, _) = new_engine();
    let target = Uuid::new_v4();
    let rater_a = Uuid::new_v4();
    let rater_b = Uuid::new_v4();

    let empty = engine.get_aggregate(target).await.unwrap();
    assert_eq!(empty.average_rating, 0.0);
    assert_eq!(empty.rating_count, 0);

    let after_a = submit(&engine, rater_a, target, 4).await.unwrap();
    assert_eq!(after_a.average_rating, 4.0);
    assert_eq!(after_a.rating_count, 1);

    let after_b = submit(&engine, rater_b, target, 2).await.unwrap();
    assert_eq!(after_b.average_rating, 3.0);
    assert_eq!(after_b.rating_count, 2);

    let resubmitted = submit(&engine, rater_a, target, 5).await.unwrap();
    assert_eq!(resubmitted.average_rating, 3.5);
    assert_eq!(resubmitted.rating_count, 2);

    assert_eq!(engine.get_aggregate(target).await.unwrap(), resubmitted);
}

#[tokio::test]
async fn test_same_submission_twice_keeps_aggregate() {
    let (engine, _) = new_engine();
    let target = Uuid::new_v4();
    let rater = Uuid::new_v4();
    submit(&engine, Uuid::new_v4(), target, 1).await.unwrap();

    let first = submit(&engine, rater, target, 4).await.unwrap();
    let second = submit(&engine, rater, target, 4).await.unwrap();

    assert_eq!(first.rating_count, second.rating_count);
    assert_eq!(first.average_rating, second.average_rating);
    assert_eq!(second.version, first.version + 1);
}

#[tokio::test]
async fn test_self_rating_is_rejected_without_writes() {
    let (engine, _) = new_engine();
    let user = Uuid::new_v4();

    let err = submit(&engine, user, user, 5).await.unwrap_err();
    assert!(matches!(err, AppError::SelfRatingForbidden));

    assert_eq!(
        engine.get_aggregate(user).await.unwrap(),
        AggregateRecord::default()
    );
    assert!(engine.get_rating(user, user).await.unwrap().is_none());
    assert!(engine.list_ratings(user).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_star_boundaries() {
    let (engine, _) = new_engine();
    let target = Uuid::new_v4();

    for stars in [0, 6, -1, 100] {
        let err = submit(&engine, Uuid::new_v4(), target, stars)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidRating(s) if s == stars.to_string()));
    }
    assert_eq!(engine.get_aggregate(target).await.unwrap().rating_count, 0);

    submit(&engine, Uuid::new_v4(), target, 1).await.unwrap();
    let aggregate = submit(&engine, Uuid::new_v4(), target, 5).await.unwrap();
    assert_eq!(aggregate.rating_count, 2);
    assert_eq!(aggregate.average_rating, 3.0);
}

#[tokio::test]
async fn test_missing_identity_is_unauthenticated() {
    let (engine, _) = new_engine();
    let target = Uuid::new_v4();

    let err = engine.submit(&None::<Uuid>, target, 3, None).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthenticated(_)));

    // Identity is checked before the star value.
    let err = engine.submit(&None::<Uuid>, target, 0, None).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthenticated(_)));
}

#[tokio::test]
async fn test_record_fields_on_create_and_update() {
    let (engine, _) = new_engine();
    let target = Uuid::new_v4();
    let rater = Uuid::new_v4();

    engine
        .submit(&Some(rater), target, 3, Some("  solid work \n".into()))
        .await
        .unwrap();
    let created = engine.get_rating(target, rater).await.unwrap().unwrap();
    assert_eq!(created.rater_id, rater);
    assert_eq!(created.target_id, target);
    assert_eq!(created.stars, 3);
    assert_eq!(created.review, "solid work");
    assert_eq!(created.created_at, created.updated_at);

    tokio::time::sleep(Duration::from_millis(5)).await;
    engine.submit(&Some(rater), target, 5, None).await.unwrap();
    let updated = engine.get_rating(target, rater).await.unwrap().unwrap();
    assert_eq!(updated.stars, 5);
    assert_eq!(updated.review, "");
    assert_eq!(updated.created_at, created.created_at);
    assert!(updated.updated_at > created.updated_at);
}

#[tokio::test]
async fn test_latest_stars_per_rater_drive_the_aggregate() {
    let (engine, _) = new_engine();
    let target = Uuid::new_v4();
    let raters: Vec<Uuid> = (0..6).map(|_| Uuid::new_v4()).collect();
    let mut latest: HashMap<Uuid, i64> = HashMap::new();

    // Deterministic pseudo-random walk over raters and star values.
    let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
    for _ in 0..60 {
        seed = seed
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        let rater = raters[(seed >> 33) as usize % raters.len()];
        let stars = ((seed >> 17) % 5) as i64 + 1;

        let aggregate = submit(&engine, rater, target, stars).await.unwrap();
        latest.insert(rater, stars);

        let expected = latest.values().sum::<i64>() as f64 / latest.len() as f64;
        assert_eq!(aggregate.rating_count, latest.len() as u64);
        assert!((aggregate.average_rating - expected).abs() <= 0.001);
    }

    let listed = engine.list_ratings(target).await.unwrap();
    assert_eq!(listed.len(), latest.len());
    for record in listed {
        assert_eq!(i64::from(record.stars), latest[&record.rater_id]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_raters_lose_no_updates() {
    let store = Arc::new(InMemoryStore::new(64));
    let engine = Arc::new(engine_with(store));
    let target = Uuid::new_v4();

    let stars: Vec<i64> = (0..16).map(|i| i % 5 + 1).collect();
    let mut tasks = Vec::new();
    for value in stars.clone() {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .submit(&Some(Uuid::new_v4()), target, value, None)
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let aggregate = engine.get_aggregate(target).await.unwrap();
    let expected = stars.iter().sum::<i64>() as f64 / stars.len() as f64;
    assert_eq!(aggregate.rating_count, 16);
    assert_eq!(aggregate.rating_sum, stars.iter().sum::<i64>() as u64);
    assert!((aggregate.average_rating - expected).abs() <= 0.001);
    assert_eq!(aggregate.version, 16);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resubmissions_count_rater_once() {
    let store = Arc::new(InMemoryStore::new(64));
    let engine = Arc::new(engine_with(store));
    let target = Uuid::new_v4();
    let rater = Uuid::new_v4();

    let mut tasks = Vec::new();
    for value in 1..=5 {
        let engine = engine.clone();
        tasks.push(tokio::spawn(async move {
            engine.submit(&Some(rater), target, value, None).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let aggregate = engine.get_aggregate(target).await.unwrap();
    let record = engine.get_rating(target, rater).await.unwrap().unwrap();
    assert_eq!(aggregate.rating_count, 1);
    assert_eq!(aggregate.average_rating, f64::from(record.stars));
}

#[tokio::test]
async fn test_conflict_retries_do_not_double_count() {
    let (engine, store) = new_engine();
    let target = Uuid::new_v4();
    let rater = Uuid::new_v4();

    store.force_conflicts(5);
    let aggregate = submit(&engine, rater, target, 4).await.unwrap();
    assert_eq!(aggregate.rating_count, 1);
    assert_eq!(aggregate.average_rating, 4.0);

    store.force_conflicts(3);
    let aggregate = submit(&engine, rater, target, 2).await.unwrap();
    assert_eq!(aggregate.rating_count, 1);
    assert_eq!(aggregate.average_rating, 2.0);
}

#[tokio::test]
async fn test_exhausted_retries_abort_without_writes() {
    let store = Arc::new(InMemoryStore::new(3));
    let engine = engine_with(store.clone());
    let target = Uuid::new_v4();
    let rater = Uuid::new_v4();

    store.force_conflicts(3);
    let err = submit(&engine, rater, target, 4).await.unwrap_err();
    assert!(matches!(err, AppError::TransactionAborted { attempts: 3 }));

    assert_eq!(
        engine.get_aggregate(target).await.unwrap(),
        AggregateRecord::default()
    );
    assert!(engine.get_rating(target, rater).await.unwrap().is_none());
}

#[tokio::test]
async fn test_unavailable_store_surfaces_and_leaves_state() {
    let (engine, store) = new_engine();
    let target = Uuid::new_v4();
    let before = submit(&engine, Uuid::new_v4(), target, 3).await.unwrap();

    store.set_unavailable(true);
    let err = submit(&engine, Uuid::new_v4(), target, 5).await.unwrap_err();
    assert!(matches!(err, AppError::StoreUnavailable(_)));
    assert!(matches!(
        engine.get_aggregate(target).await,
        Err(AppError::StoreUnavailable(_))
    ));

    store.set_unavailable(false);
    assert_eq!(engine.get_aggregate(target).await.unwrap(), before);
}

#[tokio::test]
async fn test_abandoned_submission_commits_fully() {
    let (engine, _) = new_engine();
    let target = Uuid::new_v4();
    let rater = Uuid::new_v4();

    // Poll once, then drop the caller's future.
    let _ = engine
        .submit(&Some(rater), target, 4, None)
        .now_or_never();

    let mut settled = None;
    for _ in 0..100 {
        let aggregate = engine.get_aggregate(target).await.unwrap();
        if aggregate.rating_count == 1 {
            settled = Some(aggregate);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let aggregate = settled.expect("abandoned submission never committed");
    let record = engine.get_rating(target, rater).await.unwrap().unwrap();
    assert_eq!(aggregate.average_rating, 4.0);
    assert_eq!(record.stars, 4);
}

#[tokio::test]
async fn test_subscribers_see_current_then_each_change() {
    let (engine, _) = new_engine();
    let target = Uuid::new_v4();

    submit(&engine, Uuid::new_v4(), target, 4).await.unwrap();

    let (seen, on_change) = collector();
    let handle = engine.subscribe(target, on_change).await.unwrap();
    assert_eq!(seen.lock().unwrap().len(), 1);

    submit(&engine, Uuid::new_v4(), target, 2).await.unwrap();
    let records = wait_until(&seen, |records| records.len() == 2).await;
    let summary: Vec<(f64, u64)> = records
        .iter()
        .map(|record| (record.average_rating, record.rating_count))
        .collect();
    assert_eq!(summary, vec![(4.0, 1), (3.0, 2)]);

    assert!(engine.unsubscribe(&handle));
    submit(&engine, Uuid::new_v4(), target, 5).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(seen.lock().unwrap().len(), 2);
    assert_eq!(engine.feed().subscriber_count(target), 0);
}

#[tokio::test]
async fn test_subscriber_follows_commits_from_another_engine() {
    let store = Arc::new(InMemoryStore::new(16));
    let local = engine_with(store.clone());
    let remote = engine_with(store.clone());
    let target = Uuid::new_v4();

    let (seen, on_change) = collector();
    local.subscribe(target, on_change).await.unwrap();

    // This commit never reaches the local feed.
    submit(&remote, Uuid::new_v4(), target, 1).await.unwrap();
    for _ in 0..5 {
        submit(&local, Uuid::new_v4(), target, 5).await.unwrap();
    }

    let records = wait_until(&seen, |records| {
        records.last().is_some_and(|record| record.rating_count == 6)
    })
    .await;

    assert_eq!(records.first(), Some(&AggregateRecord::default()));
    assert!(records.windows(2).all(|pair| pair[0].version < pair[1].version));
    assert_eq!(records.last(), Some(&local.get_aggregate(target).await.unwrap()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_subscriber_does_not_hold_up_other_targets() {
    let (engine, _) = new_engine();
    let busy = Uuid::new_v4();
    let quiet = Uuid::new_v4();

    engine
        .subscribe(busy, |record| {
            if record.rating_count > 0 {
                std::thread::sleep(Duration::from_millis(600));
            }
        })
        .await
        .unwrap();

    let started = Instant::now();
    submit(&engine, Uuid::new_v4(), busy, 3).await.unwrap();
    submit(&engine, Uuid::new_v4(), quiet, 4).await.unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(300),
        "submits waited on a subscriber for {elapsed:?}"
    );
}

#[tokio::test]
async fn test_callback_may_unsubscribe_through_engine() {
    let (engine, _) = new_engine();
    let engine = Arc::new(engine);
    let target = Uuid::new_v4();
    let slot: Arc<Mutex<Option<SubscriptionHandle>>> = Arc::new(Mutex::new(None));
    let calls = Arc::new(Mutex::new(0u32));

    let handle = {
        let engine_ref = Arc::downgrade(&engine);
        let slot = slot.clone();
        let calls = calls.clone();
        engine
            .subscribe(target, move |record| {
                *calls.lock().unwrap() += 1;
                if record.rating_count == 0 {
                    return;
                }
                let handle = slot.lock().unwrap().take();
                if let (Some(engine), Some(handle)) = (engine_ref.upgrade(), handle) {
                    engine.unsubscribe(&handle);
                }
            })
            .await
            .unwrap()
    };
    *slot.lock().unwrap() = Some(handle);

    submit(&engine, Uuid::new_v4(), target, 4).await.unwrap();
    for _ in 0..400 {
        if engine.feed().subscriber_count(target) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(engine.feed().subscriber_count(target), 0);

    submit(&engine, Uuid::new_v4(), target, 2).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(*calls.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_subscribing_to_unrated_target_yields_zero_aggregate() {
    let (engine, _) = new_engine();
    let target = Uuid::new_v4();
    let seen: Arc<Mutex<Vec<AggregateRecord>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    engine
        .subscribe(target, move |record| sink.lock().unwrap().push(record.clone()))
        .await
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![AggregateRecord::default()]);
}

#[tokio::test]
async fn test_subscribe_fails_when_store_is_down() {
    let (engine, store) = new_engine();
    let target = Uuid::new_v4();
    store.set_unavailable(true);

    let result = engine.subscribe(target, |_| {}).await;
    assert!(matches!(result, Err(AppError::StoreUnavailable(_))));
    assert_eq!(engine.feed().subscriber_count(target), 0);
}

#[tokio::test]
async fn test_targets_are_independent() {
    let (engine, _) = new_engine();
    let rater = Uuid::new_v4();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    submit(&engine, rater, first, 5).await.unwrap();
    submit(&engine, rater, second, 1).await.unwrap();

    assert_eq!(engine.get_aggregate(first).await.unwrap().average_rating, 5.0);
    assert_eq!(engine.get_aggregate(second).await.unwrap().average_rating, 1.0);
    assert_eq!(engine.list_ratings(first).await.unwrap().len(), 1);
}
