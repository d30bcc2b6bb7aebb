//! Job record and the job state machine.
//!
//! The transition methods on [`Job`] are the single definition of what each
//! store operation is allowed to do. Store implementations either call them
//! under a per-job lock or encode the same predicates in an atomic
//! compare-and-set statement.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::{Error, JobId, Result, Target, WorkerId};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[display("queued")]
    Queued,
    #[display("claimed")]
    Claimed,
    #[display("running")]
    Running,
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
    #[display("cancelled")]
    Cancelled,
    #[display("lost")]
    Lost,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Claimed => "claimed",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Lost => "lost",
        }
    }

    /// No further transition occurs from a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Lost
        )
    }

    /// Statuses in which a worker holds a lease.
    pub fn is_leased(&self) -> bool {
        matches!(self, JobStatus::Claimed | JobStatus::Running)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Queued, Claimed)
                | (Claimed, Running)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Queued | Claimed | Running, Cancelled)
                | (Claimed | Running, Queued)
                | (Claimed | Running, Lost)
                // expired lease taken over directly by another worker
                | (Claimed | Running, Claimed)
        )
    }
}

impl std::str::FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "claimed" => Ok(JobStatus::Claimed),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "lost" => Ok(JobStatus::Lost),
            other => Err(Error::Internal(format!("unknown job status: {}", other))),
        }
    }
}

/// Why a build failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureCause {
    /// The build exited with a non-zero status.
    Exit,
    /// The build exceeded the configured time bound.
    Timeout,
    /// The build environment itself failed.
    Environment(String),
}

/// Structured outcome recorded on the terminal transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Where the build log can be read.
    pub log_ref: Option<String>,
    /// Where the produced artifacts were uploaded.
    pub artifact_ref: Option<String>,
    pub cause: Option<FailureCause>,
    pub elapsed_ms: u64,
    pub worker: Option<WorkerId>,
}

impl JobResult {
    pub fn succeeded(exit_code: Option<i32>) -> Self {
        Self {
            success: true,
            exit_code,
            log_ref: None,
            artifact_ref: None,
            cause: None,
            elapsed_ms: 0,
            worker: None,
        }
    }

    pub fn failed(cause: FailureCause) -> Self {
        Self {
            success: false,
            exit_code: None,
            log_ref: None,
            artifact_ref: None,
            cause: Some(cause),
            elapsed_ms: 0,
            worker: None,
        }
    }

    /// The terminal status this result produces.
    pub fn status(&self) -> JobStatus {
        if self.success {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        }
    }
}

/// What the lease monitor did to an expired job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpiryOutcome {
    Requeued,
    Lost,
}

/// What a `complete` call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Applied,
    /// The same owner already completed the job; nothing changed.
    Duplicate,
}

/// The unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target: Target,
    /// Opaque build description. Never interpreted by the core.
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub owner: Option<WorkerId>,
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Lease length granted at claim time; heartbeats extend by this much.
    pub lease_ms: i64,
    pub attempt_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<JobResult>,
}

impl Job {
    pub fn new(target: Target, payload: serde_json::Value, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            target,
            payload,
            status: JobStatus::Queued,
            owner: None,
            lease_expiry: None,
            lease_ms: 0,
            attempt_count: 0,
            created_at: now,
            updated_at: now,
            result: None,
        }
    }

    /// A lease is live while the job is leased and its expiry lies in the future.
    pub fn lease_live(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leased() && self.lease_expiry.is_some_and(|expiry| expiry > now)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leased() && !self.lease_live(now)
    }

    fn owned_by(&self, worker: &WorkerId) -> bool {
        self.owner.as_ref() == Some(worker)
    }

    fn set_status(&mut self, next: JobStatus, now: DateTime<Utc>) {
        debug_assert!(
            self.status.can_transition_to(next),
            "illegal transition {} -> {}",
            self.status,
            next
        );
        self.status = next;
        self.updated_at = now;
    }

    /// Take a lease on the job.
    ///
    /// An expired lease held by another worker counts as a lost attempt. When
    /// that loss exhausts `max_attempts` the job becomes `Lost` and the claim
    /// fails with [`Error::Lost`].
    pub fn claim(
        &mut self,
        worker: &WorkerId,
        lease: Duration,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self.status {
            JobStatus::Queued => {}
            JobStatus::Claimed | JobStatus::Running if self.lease_expired(now) => {
                self.attempt_count += 1;
                if self.attempt_count >= max_attempts {
                    self.owner = None;
                    self.lease_expiry = None;
                    self.set_status(JobStatus::Lost, now);
                    return Err(Error::Lost(format!(
                        "job {} exhausted {} attempts",
                        self.id, max_attempts
                    )));
                }
            }
            JobStatus::Claimed | JobStatus::Running => {
                return Err(Error::Conflict(format!(
                    "job {} is leased by {}",
                    self.id,
                    self.owner.as_ref().map(|w| w.as_str()).unwrap_or("unknown")
                )));
            }
            status => {
                return Err(Error::Conflict(format!("job {} is {}", self.id, status)));
            }
        }

        let lease_ms = lease_millis(lease);
        self.owner = Some(worker.clone());
        self.lease_ms = lease_ms;
        self.lease_expiry = Some(now + TimeDelta::milliseconds(lease_ms));
        self.set_status(JobStatus::Claimed, now);
        Ok(())
    }

    /// Extend the lease of its owner. The first heartbeat moves `Claimed` to `Running`.
    pub fn heartbeat(&mut self, worker: &WorkerId, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        if !self.owned_by(worker) {
            return Err(Error::Rejected(format!(
                "job {} is not owned by {}",
                self.id, worker
            )));
        }
        if !self.lease_live(now) {
            return Err(Error::Rejected(format!(
                "job {} has no live lease ({})",
                self.id, self.status
            )));
        }

        let expiry = now + TimeDelta::milliseconds(self.lease_ms);
        self.lease_expiry = Some(expiry);
        if self.status == JobStatus::Claimed {
            self.set_status(JobStatus::Running, now);
        } else {
            self.updated_at = now;
        }
        Ok(expiry)
    }

    /// Record the terminal outcome reported by the owner.
    pub fn complete(
        &mut self,
        worker: &WorkerId,
        result: JobResult,
        now: DateTime<Utc>,
    ) -> Result<Completion> {
        if matches!(self.status, JobStatus::Succeeded | JobStatus::Failed) && self.owned_by(worker)
        {
            return Ok(Completion::Duplicate);
        }
        if self.status != JobStatus::Running || !self.owned_by(worker) || !self.lease_live(now) {
            return Err(Error::Rejected(format!(
                "job {} cannot be completed by {} ({})",
                self.id, worker, self.status
            )));
        }

        self.lease_expiry = None;
        self.set_status(result.status(), now);
        self.result = Some(result);
        Ok(Completion::Applied)
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::AlreadyTerminal(format!(
                "job {} is {}",
                self.id, self.status
            )));
        }
        self.lease_expiry = None;
        self.set_status(JobStatus::Cancelled, now);
        Ok(())
    }

    /// Return an expired lease to the queue, or give up on the job.
    /// Returns `None` when the lease is not (or no longer) expired.
    pub fn expire(&mut self, max_attempts: u32, now: DateTime<Utc>) -> Option<ExpiryOutcome> {
        if !self.lease_expired(now) {
            return None;
        }
        self.attempt_count += 1;
        self.owner = None;
        self.lease_expiry = None;
        if self.attempt_count < max_attempts {
            self.set_status(JobStatus::Queued, now);
            Some(ExpiryOutcome::Requeued)
        } else {
            self.set_status(JobStatus::Lost, now);
            Some(ExpiryOutcome::Lost)
        }
    }
}

fn lease_millis(lease: Duration) -> i64 {
    i64::try_from(lease.as_millis()).unwrap_or(i64::MAX / 2)
}

/// Notification emitted on every terminal transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Outbox sequence number, used to acknowledge delivery.
    pub id: i64,
    pub job_id: JobId,
    pub target: Target,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    pub created_at: DateTime<Utc>,
}

impl JobEvent {
    /// Key consumers deduplicate on.
    pub fn dedup_key(&self) -> (JobId, JobStatus) {
        (self.job_id, self.status)
    }
}

/// Liveness record of a worker agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub hostname: String,
    pub target: Target,
    pub pid: u32,
    pub last_seen: DateTime<Utc>,
}

/// Per-target queue depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSummary {
    pub target: Target,
    pub queued: i64,
    pub running: i64,
}
