//! Worker agent: claims jobs for one target and runs them.

use buildit_core::executor::{BuildEnvironment, BuildHandle, BuildOutput, BuildSpec};
use buildit_core::retry::Backoff;
use buildit_core::{
    Error, FailureCause, JobId, JobQueue, JobResult, JobStatus, JobStore, Result, Target,
    WorkerId, WorkerInfo,
};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lease timings and limits of one agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub lease: Duration,
    /// Must be shorter than `lease`.
    pub heartbeat: Duration,
    pub build_timeout: Duration,
    /// Extra environment variables passed to every build.
    pub env: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(90),
            heartbeat: Duration::from_secs(30),
            build_timeout: Duration::from_secs(24 * 60 * 60),
            env: HashMap::new(),
        }
    }
}

/// How the agent left a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The agent reported a terminal status.
    Completed(JobStatus),
    /// Another agent holds the job, or it is no longer claimable.
    Skipped,
    /// The lease was lost or the job cancelled; local work was discarded.
    Aborted,
    /// Shutdown interrupted the build; the lease is left to expire.
    Abandoned,
}

enum BuildEnd {
    Finished(Result<BuildOutput>),
    TimedOut,
    Rejected,
    Shutdown,
}

/// A long-lived agent serving one target.
pub struct WorkerAgent {
    info: WorkerInfo,
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    env: Arc<dyn BuildEnvironment>,
    config: AgentConfig,
}

impl WorkerAgent {
    pub fn new(
        hostname: impl Into<String>,
        target: Target,
        store: Arc<dyn JobStore>,
        queue: Arc<dyn JobQueue>,
        env: Arc<dyn BuildEnvironment>,
        config: AgentConfig,
    ) -> Self {
        let hostname = hostname.into();
        let pid = std::process::id();
        let info = WorkerInfo {
            id: WorkerId::for_host(&hostname, target.as_str(), pid),
            hostname,
            target,
            pid,
            last_seen: Utc::now(),
        };
        Self {
            info,
            store,
            queue,
            env,
            config,
        }
    }

    pub fn id(&self) -> &WorkerId {
        &self.info.id
    }

    pub fn target(&self) -> &Target {
        &self.info.target
    }

    async fn touch(&self) {
        if let Err(e) = self.store.record_worker(&self.info).await {
            debug!(worker_id = %self.info.id, error = %e, "Failed to record liveness");
        }
    }

    /// Sleep for `delay`; false if shutdown came first.
    async fn pause(delay: Duration, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Serve the target until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker_id = %self.info.id, target = %self.info.target, "Starting worker agent");
        self.touch().await;
        let mut backoff = Backoff::default();

        'subscribe: while !shutdown.is_cancelled() {
            let mut notifications = match self.queue.subscribe(&self.info.target).await {
                Ok(stream) => stream,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "Failed to subscribe");
                    if !Self::pause(delay, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            let mut idle = tokio::time::interval(self.config.heartbeat);
            idle.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'subscribe,
                    _ = idle.tick() => self.touch().await,
                    next = notifications.next() => match next {
                        Some(Ok(job_id)) => {
                            backoff.reset();
                            match self.process(job_id, &shutdown).await {
                                Ok(outcome) => debug!(job_id = %job_id, ?outcome, "Job handled"),
                                // The lease monitor recovers whatever was left behind.
                                Err(e) => warn!(job_id = %job_id, error = %e, "Failed to handle job"),
                            }
                        }
                        Some(Err(e)) => {
                            let delay = backoff.next_delay();
                            warn!(error = %e, retry_in = ?delay, "Queue error");
                            if !Self::pause(delay, &shutdown).await {
                                break 'subscribe;
                            }
                        }
                        None => {
                            warn!("Queue subscription ended, resubscribing");
                            if !Self::pause(backoff.next_delay(), &shutdown).await {
                                break 'subscribe;
                            }
                            continue 'subscribe;
                        }
                    },
                }
            }
        }
        info!(worker_id = %self.info.id, "Worker agent stopped");
    }

    /// Claim and run one notified job.
    pub async fn process(&self, job_id: JobId, shutdown: &CancellationToken) -> Result<JobOutcome> {
        let worker = &self.info.id;
        let job = match self.store.claim(job_id, worker, self.config.lease).await {
            Ok(job) => job,
            Err(Error::Conflict(reason)) => {
                debug!(job_id = %job_id, reason = %reason, "Job not claimable");
                return Ok(JobOutcome::Skipped);
            }
            Err(Error::Lost(reason)) => {
                error!(job_id = %job_id, reason = %reason, "Job is lost");
                return Ok(JobOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };
        info!(job_id = %job_id, target = %job.target, attempt = job.attempt_count, "Claimed job");

        // The first heartbeat moves the job to Running.
        match self.store.heartbeat(job_id, worker).await {
            Ok(_) => {}
            Err(Error::Rejected(reason)) => {
                warn!(job_id = %job_id, reason = %reason, "Lease lost before start");
                return Ok(JobOutcome::Aborted);
            }
            Err(e) => return Err(e),
        }

        let started = Instant::now();
        let spec = BuildSpec {
            job_id,
            target: job.target.clone(),
            payload: job.payload,
            env: self.config.env.clone(),
            timeout: Some(self.config.build_timeout),
        };
        let handle = match self.env.spawn(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Failed to start build");
                let result = JobResult::failed(FailureCause::Environment(e.to_string()));
                return self.report(job_id, result, started, shutdown).await;
            }
        };
        self.forward_logs(&handle).await;

        let result = match self.supervise(&handle, shutdown).await {
            BuildEnd::Finished(Ok(output)) => {
                let mut result = if output.success() {
                    JobResult::succeeded(output.exit_code)
                } else {
                    let mut failed = JobResult::failed(FailureCause::Exit);
                    failed.exit_code = output.exit_code;
                    failed
                };
                result.log_ref = output.log_ref;
                result.artifact_ref = output.artifact_ref;
                result
            }
            BuildEnd::Finished(Err(e)) => {
                JobResult::failed(FailureCause::Environment(e.to_string()))
            }
            BuildEnd::TimedOut => {
                warn!(job_id = %job_id, timeout = ?self.config.build_timeout, "Build timed out");
                self.kill(&handle).await;
                JobResult::failed(FailureCause::Timeout)
            }
            BuildEnd::Rejected => {
                self.kill(&handle).await;
                return Ok(JobOutcome::Aborted);
            }
            BuildEnd::Shutdown => {
                self.kill(&handle).await;
                return Ok(JobOutcome::Abandoned);
            }
        };

        self.report(job_id, result, started, shutdown).await
    }

    /// Wait for the build while keeping the lease alive.
    async fn supervise(&self, handle: &BuildHandle, shutdown: &CancellationToken) -> BuildEnd {
        let job_id = handle.job_id;
        let wait = self.env.wait(handle);
        tokio::pin!(wait);
        let deadline = tokio::time::sleep(self.config.build_timeout);
        tokio::pin!(deadline);

        let start = tokio::time::Instant::now() + self.config.heartbeat;
        let mut ticker = tokio::time::interval_at(start, self.config.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return BuildEnd::Shutdown,
                output = &mut wait => return BuildEnd::Finished(output),
                _ = &mut deadline => return BuildEnd::TimedOut,
                _ = ticker.tick() => {
                    match self.store.heartbeat(job_id, &self.info.id).await {
                        Ok(expiry) => {
                            debug!(job_id = %job_id, %expiry, "Lease extended");
                            self.touch().await;
                        }
                        Err(Error::Rejected(reason)) => {
                            warn!(job_id = %job_id, reason = %reason, "Heartbeat rejected, aborting build");
                            return BuildEnd::Rejected;
                        }
                        // Keep building; a later heartbeat either recovers or is rejected.
                        Err(e) => warn!(job_id = %job_id, error = %e, "Heartbeat failed"),
                    }
                }
            }
        }
    }

    async fn forward_logs(&self, handle: &BuildHandle) {
        let mut lines = match self.env.logs(handle).await {
            Ok(lines) => lines,
            Err(e) => {
                debug!(job_id = %handle.job_id, error = %e, "No build logs");
                return;
            }
        };
        let job_id = handle.job_id;
        tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                info!(job_id = %job_id, stream = ?line.stream, "{}", line.content);
            }
        });
    }

    async fn kill(&self, handle: &BuildHandle) {
        if let Err(e) = self.env.cancel(handle).await {
            error!(job_id = %handle.job_id, error = %e, "Failed to terminate build");
        }
    }

    /// Report the outcome, retrying while the store is unreachable.
    async fn report(
        &self,
        job_id: JobId,
        mut result: JobResult,
        started: Instant,
        shutdown: &CancellationToken,
    ) -> Result<JobOutcome> {
        result.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        result.worker = Some(self.info.id.clone());
        let status = result.status();
        let mut backoff = Backoff::default();

        loop {
            match self
                .store
                .complete(job_id, &self.info.id, result.clone())
                .await
            {
                Ok(()) => {
                    info!(
                        job_id = %job_id,
                        status = %status,
                        elapsed_ms = result.elapsed_ms,
                        "Job finished"
                    );
                    return Ok(JobOutcome::Completed(status));
                }
                Err(Error::Rejected(reason)) => {
                    warn!(job_id = %job_id, reason = %reason, "Completion rejected, discarding result");
                    return Ok(JobOutcome::Aborted);
                }
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    warn!(job_id = %job_id, error = %e, retry_in = ?delay, "Failed to report result");
                    if !Self::pause(delay, shutdown).await {
                        return Ok(JobOutcome::Abandoned);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}
