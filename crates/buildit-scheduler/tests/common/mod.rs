//! Shared fixtures for scheduler integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use buildit_core::executor::*;
use buildit_core::{Clock, Error, Job, JobId, JobStatus, JobStore, Result, TargetRegistry};
use buildit_db::{MemoryJobQueue, MemoryJobStore, StoreSettings};
use futures::stream::{self, BoxStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn store(clock: Arc<dyn Clock>, max_attempts: u32) -> Arc<MemoryJobStore> {
    Arc::new(MemoryJobStore::new(
        StoreSettings::new(TargetRegistry::new(["x", "amd64"]), max_attempts),
        clock,
    ))
}

pub fn queue() -> MemoryJobQueue {
    MemoryJobQueue::new()
}

/// Build environment whose builds sleep, then exit with a fixed code.
pub struct FakeEnvironment {
    exit_code: Option<i32>,
    run_for: Duration,
    pub spawned: AtomicUsize,
    pub killed: Mutex<Vec<JobId>>,
}

impl FakeEnvironment {
    pub fn new(exit_code: Option<i32>, run_for: Duration) -> Self {
        Self {
            exit_code,
            run_for,
            spawned: AtomicUsize::new(0),
            killed: Mutex::new(Vec::new()),
        }
    }

    pub fn was_killed(&self, id: JobId) -> bool {
        self.killed.lock().unwrap().contains(&id)
    }
}

#[async_trait]
impl BuildEnvironment for FakeEnvironment {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn spawn(&self, spec: BuildSpec) -> Result<BuildHandle> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(BuildHandle {
            job_id: spec.job_id,
            executor_id: "fake".to_string(),
            executor_name: "fake".to_string(),
        })
    }

    async fn logs(&self, _handle: &BuildHandle) -> Result<BoxStream<'static, LogLine>> {
        Ok(Box::pin(stream::empty()))
    }

    async fn wait(&self, _handle: &BuildHandle) -> Result<BuildOutput> {
        tokio::time::sleep(self.run_for).await;
        Ok(BuildOutput {
            exit_code: self.exit_code,
            log_ref: Some("fake://log".to_string()),
            artifact_ref: None,
        })
    }

    async fn cancel(&self, handle: &BuildHandle) -> Result<()> {
        self.killed.lock().unwrap().push(handle.job_id);
        Ok(())
    }
}

/// Build environment that cannot start anything.
pub struct BrokenEnvironment;

#[async_trait]
impl BuildEnvironment for BrokenEnvironment {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn spawn(&self, _spec: BuildSpec) -> Result<BuildHandle> {
        Err(Error::ExecutionFailed("no chroot available".to_string()))
    }

    async fn logs(&self, handle: &BuildHandle) -> Result<BoxStream<'static, LogLine>> {
        Err(Error::NotFound(handle.job_id.to_string()))
    }

    async fn wait(&self, handle: &BuildHandle) -> Result<BuildOutput> {
        Err(Error::NotFound(handle.job_id.to_string()))
    }

    async fn cancel(&self, _handle: &BuildHandle) -> Result<()> {
        Ok(())
    }
}

/// Poll the store until `pred` holds for the job or `within` elapses.
pub async fn wait_for(
    store: &dyn JobStore,
    id: JobId,
    within: Duration,
    pred: impl Fn(&Job) -> bool,
) -> Job {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        let job = store.get(id).await.unwrap();
        if pred(&job) {
            return job;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {} stuck in {}",
            id,
            job.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn is(status: JobStatus) -> impl Fn(&Job) -> bool {
    move |job| job.status == status
}
