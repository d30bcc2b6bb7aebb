//! The job store: durable source of truth for every job.
//!
//! Every mutating operation is an atomic check-and-set on a single job and
//! must be linearizable per job id across all processes using the store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::job::{ExpiryOutcome, Job, JobEvent, JobResult, TargetSummary, WorkerInfo};
use crate::{JobId, Result, Target, WorkerId};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `Queued` job. Fails with `InvalidTarget` for unknown targets.
    async fn create(&self, target: &Target, payload: serde_json::Value) -> Result<JobId>;

    /// Read-only snapshot.
    async fn get(&self, id: JobId) -> Result<Job>;

    /// Take a lease. Fails with `Conflict` if another live lease exists.
    async fn claim(&self, id: JobId, worker: &WorkerId, lease: Duration) -> Result<Job>;

    /// Extend the owner's lease. `Rejected` means the caller must abort its build.
    async fn heartbeat(&self, id: JobId, worker: &WorkerId) -> Result<DateTime<Utc>>;

    /// Record the terminal outcome. A repeated report from the same owner is a no-op.
    async fn complete(&self, id: JobId, worker: &WorkerId, result: JobResult) -> Result<()>;

    /// Fails with `AlreadyTerminal` if the job already finished.
    async fn cancel(&self, id: JobId) -> Result<()>;

    /// Leased jobs whose lease expiry has passed.
    async fn expired_leases(&self, limit: i64) -> Result<Vec<Job>>;

    /// Requeue or lose one expired job. `None` if its lease is no longer expired.
    async fn expire_lease(&self, id: JobId) -> Result<Option<ExpiryOutcome>>;

    /// `Queued` jobs not published for at least `older_than`, least recently
    /// published first. The returned jobs are marked published now, so
    /// successive calls rotate through the whole backlog.
    async fn stale_queued(&self, older_than: Duration, limit: i64) -> Result<Vec<Job>>;

    /// Undelivered terminal-transition notifications, oldest first.
    async fn pending_events(&self, limit: i64) -> Result<Vec<JobEvent>>;

    /// Mark a notification delivered.
    async fn ack_event(&self, event_id: i64) -> Result<()>;

    /// Record that a worker agent is alive. `last_seen` is set by the store.
    async fn record_worker(&self, info: &WorkerInfo) -> Result<()>;

    /// Workers seen within `within`.
    async fn workers(&self, within: Duration) -> Result<Vec<WorkerInfo>>;

    /// Queued and running counts for every target with live jobs.
    async fn summary(&self) -> Result<Vec<TargetSummary>>;
}
