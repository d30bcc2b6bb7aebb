//! In-process store and queue.
//!
//! All jobs live behind one mutex, so every operation is trivially
//! linearizable. Used by tests and single-node development setups.

use async_trait::async_trait;
use buildit_core::job::{ExpiryOutcome, Job, JobEvent, JobResult, TargetSummary, WorkerInfo};
use buildit_core::{
    Clock, Error, JobId, JobQueue, JobStatus, JobStore, Result, Target, WorkerId,
};
use chrono::{DateTime, Duration as TimeDelta, Utc};
use futures::stream::{self, BoxStream};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::StoreSettings;

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<JobId, Job>,
    events: BTreeMap<i64, (JobEvent, bool)>,
    next_event: i64,
    workers: HashMap<WorkerId, WorkerInfo>,
    /// Last republish of a queued job by the lease monitor.
    published: HashMap<JobId, DateTime<Utc>>,
}

impl MemoryState {
    fn push_event(&mut self, job: &Job, now: DateTime<Utc>) {
        self.next_event += 1;
        let event = JobEvent {
            id: self.next_event,
            job_id: job.id,
            target: job.target.clone(),
            status: job.status,
            result: job.result.clone(),
            created_at: now,
        };
        self.events.insert(event.id, (event, false));
    }
}

/// Job store kept in memory.
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    settings: StoreSettings,
}

impl MemoryJobStore {
    pub fn new(settings: StoreSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
            settings,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` to one job atomically, recording a notification if it
    /// reached a terminal status.
    fn mutate<T>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut Job, DateTime<Utc>) -> Result<T>,
    ) -> Result<T> {
        let now = self.clock.now();
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))?;

        let before = job.status;
        let result = f(job, now);
        let after = job.clone();

        if after.status != before && after.status.is_terminal() {
            state.push_event(&after, now);
        }
        result
    }
}

fn since(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now - TimeDelta::milliseconds(window.as_millis() as i64)
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, target: &Target, payload: serde_json::Value) -> Result<JobId> {
        if !self.settings.targets.contains(target) {
            return Err(Error::InvalidTarget(target.to_string()));
        }
        let job = Job::new(target.clone(), payload, self.clock.now());
        let id = job.id;
        self.lock().jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, id: JobId) -> Result<Job> {
        self.lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("job {}", id)))
    }

    async fn claim(&self, id: JobId, worker: &WorkerId, lease: Duration) -> Result<Job> {
        let max_attempts = self.settings.max_attempts;
        self.mutate(id, |job, now| {
            job.claim(worker, lease, max_attempts, now)?;
            Ok(job.clone())
        })
    }

    async fn heartbeat(&self, id: JobId, worker: &WorkerId) -> Result<DateTime<Utc>> {
        self.mutate(id, |job, now| job.heartbeat(worker, now))
    }

    async fn complete(&self, id: JobId, worker: &WorkerId, result: JobResult) -> Result<()> {
        self.mutate(id, |job, now| job.complete(worker, result, now).map(|_| ()))
    }

    async fn cancel(&self, id: JobId) -> Result<()> {
        self.mutate(id, |job, now| job.cancel(now))
    }

    async fn expired_leases(&self, limit: i64) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let state = self.lock();
        let mut expired: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.lease_expired(now))
            .cloned()
            .collect();
        expired.sort_by_key(|job| job.lease_expiry);
        expired.truncate(limit.max(0) as usize);
        Ok(expired)
    }

    async fn expire_lease(&self, id: JobId) -> Result<Option<ExpiryOutcome>> {
        let max_attempts = self.settings.max_attempts;
        self.mutate(id, |job, now| Ok(job.expire(max_attempts, now)))
    }

    async fn stale_queued(&self, older_than: Duration, limit: i64) -> Result<Vec<Job>> {
        let now = self.clock.now();
        let cutoff = since(now, older_than);
        let mut state = self.lock();
        let state = &mut *state;

        // Creation and requeue count as a publish.
        let published_at = |job: &Job| {
            state
                .published
                .get(&job.id)
                .map_or(job.updated_at, |at| (*at).max(job.updated_at))
        };
        let mut stale: Vec<(DateTime<Utc>, Job)> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Queued)
            .map(|job| (published_at(job), job.clone()))
            .filter(|(at, _)| *at <= cutoff)
            .collect();
        stale.sort_by_key(|(at, job)| (*at, job.id));
        stale.truncate(limit.max(0) as usize);

        let jobs = &state.jobs;
        state
            .published
            .retain(|id, _| jobs.get(id).is_some_and(|job| job.status == JobStatus::Queued));
        for (_, job) in &stale {
            state.published.insert(job.id, now);
        }
        Ok(stale.into_iter().map(|(_, job)| job).collect())
    }

    async fn pending_events(&self, limit: i64) -> Result<Vec<JobEvent>> {
        Ok(self
            .lock()
            .events
            .values()
            .filter(|(_, delivered)| !delivered)
            .take(limit.max(0) as usize)
            .map(|(event, _)| event.clone())
            .collect())
    }

    async fn ack_event(&self, event_id: i64) -> Result<()> {
        match self.lock().events.get_mut(&event_id) {
            Some((_, delivered)) => {
                *delivered = true;
                Ok(())
            }
            None => Err(Error::NotFound(format!("event {}", event_id))),
        }
    }

    async fn record_worker(&self, info: &WorkerInfo) -> Result<()> {
        let mut info = info.clone();
        info.last_seen = self.clock.now();
        self.lock().workers.insert(info.id.clone(), info);
        Ok(())
    }

    async fn workers(&self, within: Duration) -> Result<Vec<WorkerInfo>> {
        let cutoff = since(self.clock.now(), within);
        let mut workers: Vec<WorkerInfo> = self
            .lock()
            .workers
            .values()
            .filter(|w| w.last_seen >= cutoff)
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(workers)
    }

    async fn summary(&self) -> Result<Vec<TargetSummary>> {
        let mut counts: BTreeMap<Target, (i64, i64)> = BTreeMap::new();
        for job in self.lock().jobs.values() {
            match job.status {
                JobStatus::Queued => counts.entry(job.target.clone()).or_default().0 += 1,
                JobStatus::Claimed | JobStatus::Running => {
                    counts.entry(job.target.clone()).or_default().1 += 1
                }
                _ => {}
            }
        }
        Ok(counts
            .into_iter()
            .map(|(target, (queued, running))| TargetSummary {
                target,
                queued,
                running,
            })
            .collect())
    }
}

#[derive(Default)]
struct TargetQueue {
    pending: VecDeque<JobId>,
    queued: HashSet<JobId>,
    notify: Arc<Notify>,
}

/// Per-target FIFO of job notifications.
///
/// A job id already waiting in a target's queue is not enqueued twice.
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    targets: Arc<Mutex<HashMap<Target, TargetQueue>>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of undelivered notifications for a target.
    pub fn len(&self, target: &Target) -> usize {
        self.targets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(target)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, target: &Target) -> bool {
        self.len(target) == 0
    }

    /// Take the next notification, or the handle to wait on when there is none.
    fn pop(&self, target: &Target) -> std::result::Result<JobId, Arc<Notify>> {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        let queue = targets.entry(target.clone()).or_default();
        match queue.pending.pop_front() {
            Some(id) => {
                queue.queued.remove(&id);
                Ok(id)
            }
            None => Err(queue.notify.clone()),
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn publish(&self, target: &Target, job_id: JobId) -> Result<()> {
        let mut targets = self.targets.lock().unwrap_or_else(|e| e.into_inner());
        let queue = targets.entry(target.clone()).or_default();
        if queue.queued.insert(job_id) {
            queue.pending.push_back(job_id);
            queue.notify.notify_one();
        }
        Ok(())
    }

    async fn subscribe(&self, target: &Target) -> Result<BoxStream<'static, Result<JobId>>> {
        let queue = self.clone();
        let target = target.clone();
        let stream = stream::unfold((queue, target), |(queue, target)| async move {
            loop {
                match queue.pop(&target) {
                    Ok(id) => return Some((Ok(id), (queue, target))),
                    Err(notify) => notify.notified().await,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildit_core::{FailureCause, ManualClock, TargetRegistry};
    use futures::StreamExt;
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(90);

    fn store() -> (MemoryJobStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let settings = StoreSettings::new(TargetRegistry::new(["amd64", "arm64"]), 3);
        (MemoryJobStore::new(settings, clock.clone()), clock)
    }

    fn amd64() -> Target {
        Target::from("amd64")
    }

    #[tokio::test]
    async fn test_create_unknown_target() {
        let (store, _) = store();
        let err = store
            .create(&Target::from("sparc"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTarget(_)));
    }

    #[tokio::test]
    async fn test_get_missing_job() {
        let (store, _) = store();
        assert!(matches!(
            store.get(JobId::new()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_full_lifecycle_emits_one_event() {
        let (store, clock) = store();
        let worker = WorkerId::from("a");
        let id = store.create(&amd64(), json!({"packages": ["bash"]})).await.unwrap();

        store.claim(id, &worker, LEASE).await.unwrap();
        store.heartbeat(id, &worker).await.unwrap();
        clock.advance(Duration::from_secs(10));
        let result = JobResult::succeeded(Some(0));
        store.complete(id, &worker, result.clone()).await.unwrap();
        store.complete(id, &worker, result.clone()).await.unwrap();

        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.result, Some(result));

        let events = store.pending_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].dedup_key(), (id, JobStatus::Succeeded));

        store.ack_event(events[0].id).await.unwrap();
        assert!(store.pending_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lost_claim_is_persisted() {
        let (store, clock) = store();
        let id = store.create(&amd64(), json!({})).await.unwrap();
        for n in 0..3 {
            store
                .claim(id, &WorkerId::new(format!("w{}", n)), LEASE)
                .await
                .unwrap();
            clock.advance(LEASE);
        }
        let err = store
            .claim(id, &WorkerId::from("w9"), LEASE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Lost(_)));
        assert_eq!(store.get(id).await.unwrap().status, JobStatus::Lost);
        assert_eq!(store.pending_events(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_leases_and_expire() {
        let (store, clock) = store();
        let worker = WorkerId::from("a");
        let id = store.create(&amd64(), json!({})).await.unwrap();
        store.claim(id, &worker, LEASE).await.unwrap();

        assert!(store.expired_leases(10).await.unwrap().is_empty());
        clock.advance(LEASE + Duration::from_secs(1));
        let expired = store.expired_leases(10).await.unwrap();
        assert_eq!(expired.len(), 1);

        assert_eq!(
            store.expire_lease(id).await.unwrap(),
            Some(ExpiryOutcome::Requeued)
        );
        assert_eq!(store.expire_lease(id).await.unwrap(), None);
        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_stale_queued() {
        let (store, clock) = store();
        let id = store.create(&amd64(), json!({})).await.unwrap();
        assert!(
            store
                .stale_queued(Duration::from_secs(15), 10)
                .await
                .unwrap()
                .is_empty()
        );
        clock.advance(Duration::from_secs(15));
        let stale = store.stale_queued(Duration::from_secs(15), 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, id);

        // Just republished; not stale again until another interval passed.
        assert!(
            store
                .stale_queued(Duration::from_secs(15), 10)
                .await
                .unwrap()
                .is_empty()
        );
        clock.advance(Duration::from_secs(15));
        assert_eq!(
            store
                .stale_queued(Duration::from_secs(15), 10)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stale_queued_rotates_through_backlog() {
        let (store, clock) = store();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(store.create(&amd64(), json!({})).await.unwrap());
            clock.advance(Duration::from_secs(1));
        }
        clock.advance(Duration::from_secs(15));

        let mut seen = Vec::new();
        for _ in 0..3 {
            let batch = store.stale_queued(Duration::from_secs(15), 2).await.unwrap();
            seen.extend(batch.into_iter().map(|job| job.id));
        }
        assert_eq!(seen, ids);
    }

    #[tokio::test]
    async fn test_cancel_emits_event_and_rejects_heartbeat() {
        let (store, _) = store();
        let worker = WorkerId::from("a");
        let id = store.create(&amd64(), json!({})).await.unwrap();
        store.claim(id, &worker, LEASE).await.unwrap();
        store.cancel(id).await.unwrap();

        assert!(matches!(
            store.heartbeat(id, &worker).await,
            Err(Error::Rejected(_))
        ));
        assert!(matches!(
            store.cancel(id).await,
            Err(Error::AlreadyTerminal(_))
        ));
        let events = store.pending_events(10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_failed_completion_keeps_cause() {
        let (store, _) = store();
        let worker = WorkerId::from("a");
        let id = store.create(&amd64(), json!({})).await.unwrap();
        store.claim(id, &worker, LEASE).await.unwrap();
        store.heartbeat(id, &worker).await.unwrap();
        store
            .complete(id, &worker, JobResult::failed(FailureCause::Timeout))
            .await
            .unwrap();
        let job = store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.result.and_then(|r| r.cause),
            Some(FailureCause::Timeout)
        );
    }

    #[tokio::test]
    async fn test_workers_and_summary() {
        let (store, clock) = store();
        let info = WorkerInfo {
            id: WorkerId::from("bb1/amd64/1"),
            hostname: "bb1".to_string(),
            target: amd64(),
            pid: 1,
            last_seen: clock.now(),
        };
        store.record_worker(&info).await.unwrap();
        store.create(&amd64(), json!({})).await.unwrap();
        let running = store.create(&amd64(), json!({})).await.unwrap();
        store
            .claim(running, &info.id, LEASE)
            .await
            .unwrap();

        assert_eq!(store.workers(Duration::from_secs(600)).await.unwrap().len(), 1);
        clock.advance(Duration::from_secs(601));
        assert!(store.workers(Duration::from_secs(600)).await.unwrap().is_empty());

        let summary = store.summary().await.unwrap();
        assert_eq!(
            summary,
            vec![TargetSummary {
                target: amd64(),
                queued: 1,
                running: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_queue_delivers_per_target() {
        let queue = MemoryJobQueue::new();
        let a = JobId::new();
        let b = JobId::new();
        queue.publish(&amd64(), a).await.unwrap();
        queue.publish(&amd64(), a).await.unwrap();
        queue.publish(&Target::from("arm64"), b).await.unwrap();
        assert_eq!(queue.len(&amd64()), 1);

        let mut stream = queue.subscribe(&amd64()).await.unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), a);

        let mut other = queue.subscribe(&Target::from("arm64")).await.unwrap();
        assert_eq!(other.next().await.unwrap().unwrap(), b);
    }

    #[tokio::test]
    async fn test_queue_wakes_waiting_subscriber() {
        let queue = MemoryJobQueue::new();
        let mut stream = queue.subscribe(&amd64()).await.unwrap();
        let id = JobId::new();

        let publisher = queue.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            publisher.publish(&amd64(), id).await.unwrap();
        });

        let received = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap();
        assert_eq!(received.unwrap().unwrap(), id);
    }
}
