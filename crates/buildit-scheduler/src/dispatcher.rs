//! Submission entry point: validate, persist, publish.

use buildit_core::job::{TargetSummary, WorkerInfo};
use buildit_core::payload::{AnyPayload, PayloadSchema};
use buildit_core::{Job, JobId, JobQueue, JobStore, Result, Target, TargetRegistry};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const DEFAULT_WORKER_OFFLINE_AFTER: Duration = Duration::from_secs(600);

/// A job created by a (possibly multi-target) submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submitted {
    pub target: Target,
    pub job_id: JobId,
}

/// Snapshot of the fleet for status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetStatus {
    pub targets: Vec<TargetSummary>,
    pub workers: Vec<WorkerInfo>,
}

/// Accepts build submissions from front-ends.
pub struct Dispatcher {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    targets: TargetRegistry,
    schema: Arc<dyn PayloadSchema>,
    worker_offline_after: Duration,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, targets: TargetRegistry) -> Self {
        Self {
            store,
            queue,
            targets,
            schema: Arc::new(AnyPayload),
            worker_offline_after: DEFAULT_WORKER_OFFLINE_AFTER,
        }
    }

    pub fn with_schema(mut self, schema: Arc<dyn PayloadSchema>) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_worker_offline_after(mut self, after: Duration) -> Self {
        self.worker_offline_after = after;
        self
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.targets
    }

    /// Submit one job for a single target.
    pub async fn submit(&self, target: &str, payload: serde_json::Value) -> Result<JobId> {
        let target = self.targets.resolve(target)?;
        self.schema.validate(&payload)?;
        self.enqueue(&target, payload).await
    }

    /// Submit one job per target after expanding groups.
    ///
    /// The payload is validated once, before any job is created.
    pub async fn submit_all<S: AsRef<str>>(
        &self,
        names: &[S],
        payload: serde_json::Value,
    ) -> Result<Vec<Submitted>> {
        let targets = self.targets.expand(names)?;
        self.schema.validate(&payload)?;

        let mut submitted = Vec::with_capacity(targets.len());
        for target in targets {
            let job_id = self.enqueue(&target, payload.clone()).await?;
            submitted.push(Submitted { target, job_id });
        }
        Ok(submitted)
    }

    async fn enqueue(&self, target: &Target, payload: serde_json::Value) -> Result<JobId> {
        let job_id = self.store.create(target, payload).await?;
        info!(job_id = %job_id, target = %target, "Job created");

        // The lease monitor republishes queued jobs that were never delivered.
        if let Err(e) = self.queue.publish(target, job_id).await {
            warn!(job_id = %job_id, target = %target, error = %e, "Failed to publish job");
        }
        Ok(job_id)
    }

    pub async fn cancel(&self, id: JobId) -> Result<()> {
        self.store.cancel(id).await?;
        info!(job_id = %id, "Job cancelled");
        Ok(())
    }

    pub async fn query(&self, id: JobId) -> Result<Job> {
        self.store.get(id).await
    }

    /// Per-target queue depth and the workers seen recently.
    pub async fn status(&self) -> Result<FleetStatus> {
        Ok(FleetStatus {
            targets: self.store.summary().await?,
            workers: self.store.workers(self.worker_offline_after).await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use buildit_core::payload::BuildRequestSchema;
    use buildit_core::{Error, JobStatus, ManualClock};
    use buildit_db::{MemoryJobQueue, MemoryJobStore, StoreSettings};
    use futures::stream::BoxStream;
    use serde_json::json;

    fn registry() -> TargetRegistry {
        let mut targets = TargetRegistry::new(["amd64", "arm64", "riscv64"]);
        targets
            .add_group("mainline", ["amd64", "arm64", "riscv64"])
            .unwrap();
        targets
    }

    fn setup() -> (Dispatcher, Arc<MemoryJobStore>, MemoryJobQueue) {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryJobStore::new(
            StoreSettings::new(registry(), 3),
            clock,
        ));
        let queue = MemoryJobQueue::new();
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(queue.clone()), registry())
            .with_schema(Arc::new(BuildRequestSchema));
        (dispatcher, store, queue)
    }

    fn request() -> serde_json::Value {
        json!({"packages": ["bash"], "git_ref": "stable"})
    }

    #[tokio::test]
    async fn test_submit_creates_and_publishes() {
        let (dispatcher, _, queue) = setup();
        let id = dispatcher.submit("amd64", request()).await.unwrap();

        let job = dispatcher.query(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempt_count, 0);
        assert_eq!(queue.len(&Target::from("amd64")), 1);
    }

    #[tokio::test]
    async fn test_submit_unknown_target() {
        let (dispatcher, _, _) = setup();
        assert!(matches!(
            dispatcher.submit("sparc", request()).await,
            Err(Error::InvalidTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_malformed_payload() {
        let (dispatcher, store, _) = setup();
        let err = dispatcher
            .submit("amd64", json!({"packages": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPayload(_)));
        assert!(store.summary().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_all_expands_group() {
        let (dispatcher, _, queue) = setup();
        let submitted = dispatcher
            .submit_all(&["arm64", "mainline"], request())
            .await
            .unwrap();
        let targets: Vec<&str> = submitted.iter().map(|s| s.target.as_str()).collect();
        assert_eq!(targets, vec!["amd64", "arm64", "riscv64"]);
        assert_eq!(queue.len(&Target::from("arm64")), 1);
    }

    struct DownQueue;

    #[async_trait]
    impl JobQueue for DownQueue {
        async fn publish(&self, _target: &Target, _job_id: JobId) -> Result<()> {
            Err(Error::Unavailable("broker down".into()))
        }

        async fn subscribe(&self, _target: &Target) -> Result<BoxStream<'static, Result<JobId>>> {
            Err(Error::Unavailable("broker down".into()))
        }
    }

    #[tokio::test]
    async fn test_publish_failure_still_returns_job() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryJobStore::new(
            StoreSettings::new(registry(), 3),
            clock,
        ));
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(DownQueue), registry());

        let id = dispatcher.submit("amd64", json!("opaque")).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn test_cancel_and_cancel_again() {
        let (dispatcher, _, _) = setup();
        let id = dispatcher.submit("amd64", request()).await.unwrap();
        dispatcher.cancel(id).await.unwrap();
        assert_eq!(
            dispatcher.query(id).await.unwrap().status,
            JobStatus::Cancelled
        );
        assert!(matches!(
            dispatcher.cancel(id).await,
            Err(Error::AlreadyTerminal(_))
        ));
    }

    #[tokio::test]
    async fn test_status_counts_queued_jobs() {
        let (dispatcher, _, _) = setup();
        dispatcher.submit("amd64", request()).await.unwrap();
        dispatcher.submit("amd64", request()).await.unwrap();
        let status = dispatcher.status().await.unwrap();
        assert_eq!(status.targets.len(), 1);
        assert_eq!(status.targets[0].queued, 2);
        assert!(status.workers.is_empty());
    }
}
