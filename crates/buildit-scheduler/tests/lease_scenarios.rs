//! Lease discipline end to end, on the memory store with a manual clock.

mod common;

use buildit_core::{
    Error, JobQueue, JobResult, JobStatus, JobStore, ManualClock, Target, TargetRegistry,
    WorkerId,
};
use buildit_scheduler::{Dispatcher, LeaseMonitor};
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const LEASE: Duration = Duration::from_secs(90);
const SCAN: Duration = Duration::from_secs(15);

fn w(name: &str) -> WorkerId {
    WorkerId::from(name)
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
    let clock = Arc::new(ManualClock::default());
    let store = common::store(clock, 3);
    let id = store.create(&Target::from("x"), json!({})).await.unwrap();

    let mut tasks = Vec::new();
    for n in 0..16 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.claim(id, &WorkerId::new(format!("w{}", n)), LEASE).await
        }));
    }

    let mut winners = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => winners += 1,
            Err(Error::Conflict(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn test_silent_worker_is_requeued_until_lost() {
    let clock = Arc::new(ManualClock::default());
    let store = common::store(clock.clone(), 3);
    let queue = Arc::new(common::queue());
    let dispatcher = Dispatcher::new(store.clone(), queue.clone(), TargetRegistry::new(["x"]));
    let monitor = LeaseMonitor::new(store.clone(), queue.clone(), SCAN);

    let id = dispatcher.submit("x", json!({"packages": ["a"]})).await.unwrap();

    for attempt in 1..=3u32 {
        let worker = WorkerId::new(format!("worker-{}", attempt));
        store.claim(id, &worker, LEASE).await.unwrap();
        store.heartbeat(id, &worker).await.unwrap();
        clock.advance(Duration::from_secs(30));
        store.heartbeat(id, &worker).await.unwrap();

        // Heartbeats stop.
        clock.advance(LEASE);
        monitor.scan_once().await.unwrap();

        let job = store.get(id).await.unwrap();
        assert_eq!(job.attempt_count, attempt);
        if attempt < 3 {
            assert_eq!(job.status, JobStatus::Queued);
            assert!(job.owner.is_none());
        } else {
            assert_eq!(job.status, JobStatus::Lost);
        }
    }

    // Lost is never requeued.
    clock.advance(LEASE * 10);
    let report = monitor.scan_once().await.unwrap();
    assert_eq!(report.requeued + report.republished, 0);
    assert_eq!(store.get(id).await.unwrap().status, JobStatus::Lost);
    assert!(store.claim(id, &w("late"), LEASE).await.is_err());
    assert!(matches!(
        dispatcher.cancel(id).await,
        Err(Error::AlreadyTerminal(_))
    ));

    let events = store.pending_events(10).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, JobStatus::Lost);
}

#[tokio::test]
async fn test_requeue_within_lease_plus_scan_interval() {
    let clock = Arc::new(ManualClock::default());
    let store = common::store(clock.clone(), 3);
    let queue = Arc::new(common::queue());
    let monitor = LeaseMonitor::new(store.clone(), queue.clone(), SCAN);

    let id = store.create(&Target::from("x"), json!({})).await.unwrap();
    store.claim(id, &w("a"), LEASE).await.unwrap();
    store.heartbeat(id, &w("a")).await.unwrap();

    // Scans run every SCAN; the job must be back by LEASE + SCAN.
    let mut elapsed = Duration::ZERO;
    while store.get(id).await.unwrap().status != JobStatus::Queued {
        assert!(elapsed <= LEASE + SCAN, "not requeued after {:?}", elapsed);
        clock.advance(SCAN);
        elapsed += SCAN;
        monitor.scan_once().await.unwrap();
    }
    assert!(elapsed <= LEASE + SCAN);

    let mut notifications = queue.subscribe(&Target::from("x")).await.unwrap();
    assert_eq!(notifications.next().await.unwrap().unwrap(), id);
}

#[tokio::test]
async fn test_duplicate_notification_only_one_claim() {
    let clock = Arc::new(ManualClock::default());
    let store = common::store(clock, 3);
    let queue = common::queue();
    let x = Target::from("x");

    let id = store.create(&x, json!({})).await.unwrap();
    queue.publish(&x, id).await.unwrap();
    let mut first = queue.subscribe(&x).await.unwrap();
    let delivered = first.next().await.unwrap().unwrap();
    queue.publish(&x, id).await.unwrap();
    let mut second = queue.subscribe(&x).await.unwrap();
    let redelivered = second.next().await.unwrap().unwrap();
    assert_eq!(delivered, redelivered);

    let a = store.claim(delivered, &w("a"), LEASE).await;
    let b = store.claim(redelivered, &w("b"), LEASE).await;
    assert_eq!(a.unwrap().status, JobStatus::Claimed);
    assert!(matches!(b, Err(Error::Conflict(_))));
}

#[tokio::test]
async fn test_late_completion_from_former_owner_is_rejected() {
    let clock = Arc::new(ManualClock::default());
    let store = common::store(clock.clone(), 3);
    let id = store.create(&Target::from("x"), json!({})).await.unwrap();

    store.claim(id, &w("a"), LEASE).await.unwrap();
    store.heartbeat(id, &w("a")).await.unwrap();
    clock.advance(LEASE + Duration::from_secs(1));

    // "b" takes over the expired lease before "a" reports.
    store.claim(id, &w("b"), LEASE).await.unwrap();
    store.heartbeat(id, &w("b")).await.unwrap();
    let before = store.get(id).await.unwrap();

    let late = store
        .complete(id, &w("a"), JobResult::succeeded(Some(0)))
        .await;
    assert!(matches!(late, Err(Error::Rejected(_))));
    assert!(matches!(
        store.heartbeat(id, &w("a")).await,
        Err(Error::Rejected(_))
    ));

    let after = store.get(id).await.unwrap();
    assert_eq!(after, before);
    assert_eq!(after.owner, Some(w("b")));
    assert_eq!(after.status, JobStatus::Running);
    assert_eq!(after.attempt_count, 1);
}

#[tokio::test]
async fn test_complete_twice_keeps_first_result() {
    let clock = Arc::new(ManualClock::default());
    let store = common::store(clock.clone(), 3);
    let id = store.create(&Target::from("x"), json!({})).await.unwrap();

    store.claim(id, &w("a"), LEASE).await.unwrap();
    store.heartbeat(id, &w("a")).await.unwrap();
    let result = JobResult::succeeded(Some(0));
    store.complete(id, &w("a"), result.clone()).await.unwrap();
    let first = store.get(id).await.unwrap();

    clock.advance(LEASE * 2);
    store.complete(id, &w("a"), result).await.unwrap();
    assert_eq!(store.get(id).await.unwrap(), first);
    assert_eq!(store.pending_events(10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_cancel_is_seen_on_next_heartbeat() {
    let clock = Arc::new(ManualClock::default());
    let store = common::store(clock, 3);
    let queue = Arc::new(common::queue());
    let dispatcher = Dispatcher::new(store.clone(), queue, TargetRegistry::new(["x"]));

    let id = dispatcher.submit("x", json!({})).await.unwrap();
    store.claim(id, &w("a"), LEASE).await.unwrap();
    store.heartbeat(id, &w("a")).await.unwrap();

    dispatcher.cancel(id).await.unwrap();
    assert!(matches!(
        store.heartbeat(id, &w("a")).await,
        Err(Error::Rejected(_))
    ));
    assert!(matches!(
        store
            .complete(id, &w("a"), JobResult::succeeded(Some(0)))
            .await,
        Err(Error::Rejected(_))
    ));
    assert_eq!(store.get(id).await.unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_republish_reaches_jobs_behind_a_large_backlog() {
    let clock = Arc::new(ManualClock::default());
    let store = common::store(clock.clone(), 3);
    let queue = Arc::new(common::queue());
    let dispatcher = Dispatcher::new(
        store.clone(),
        queue.clone(),
        TargetRegistry::new(["x", "amd64"]),
    );
    let monitor = LeaseMonitor::new(store.clone(), queue.clone(), SCAN).with_batch_size(100);
    let x = Target::from("x");

    // A full batch of amd64 jobs nobody is serving.
    for _ in 0..100 {
        dispatcher.submit("amd64", json!({})).await.unwrap();
    }
    clock.advance(Duration::from_secs(1));
    // Created, but its notification never made it to the queue.
    let id = store.create(&x, json!({})).await.unwrap();

    let mut scans = 0;
    while queue.is_empty(&x) {
        assert!(scans < 3, "queued job for x never republished");
        clock.advance(SCAN);
        monitor.scan_once().await.unwrap();
        scans += 1;
    }

    let mut notifications = queue.subscribe(&x).await.unwrap();
    assert_eq!(notifications.next().await.unwrap().unwrap(), id);
}
