//! Periodic recovery of abandoned jobs.
//!
//! Each scan expires stale leases (requeue or `Lost`) and republishes
//! queued jobs that have not been published for one scan interval, oldest
//! first, so a large backlog is worked through across scans. Nothing else
//! in the system detects dead workers.

use buildit_core::retry::Backoff;
use buildit_core::{ExpiryOutcome, JobId, JobQueue, JobStore, Result, Target};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const DEFAULT_BATCH_SIZE: i64 = 100;

/// What one scan did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub requeued: usize,
    pub lost: usize,
    pub republished: usize,
}

pub struct LeaseMonitor {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn JobQueue>,
    scan_interval: Duration,
    batch_size: i64,
}

impl LeaseMonitor {
    pub fn new(store: Arc<dyn JobStore>, queue: Arc<dyn JobQueue>, scan_interval: Duration) -> Self {
        Self {
            store,
            queue,
            scan_interval,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Run one scan. Transient store errors abort the scan; anything else
    /// is logged per job and the scan carries on.
    pub async fn scan_once(&self) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        for job in self.store.expired_leases(self.batch_size).await? {
            match self.store.expire_lease(job.id).await {
                Ok(Some(ExpiryOutcome::Requeued)) => {
                    info!(
                        job_id = %job.id,
                        target = %job.target,
                        attempt = job.attempt_count + 1,
                        "Lease expired, job requeued"
                    );
                    self.publish(&job.target, job.id).await;
                    report.requeued += 1;
                }
                Ok(Some(ExpiryOutcome::Lost)) => {
                    error!(
                        job_id = %job.id,
                        target = %job.target,
                        "Job exhausted its attempts and is lost"
                    );
                    report.lost += 1;
                }
                // Heartbeat or completion won the race.
                Ok(None) => debug!(job_id = %job.id, "Lease no longer expired"),
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => warn!(job_id = %job.id, error = %e, "Failed to expire lease"),
            }
        }

        for job in self
            .store
            .stale_queued(self.scan_interval, self.batch_size)
            .await?
        {
            debug!(job_id = %job.id, target = %job.target, "Republishing queued job");
            self.publish(&job.target, job.id).await;
            report.republished += 1;
        }

        Ok(report)
    }

    async fn publish(&self, target: &Target, job_id: JobId) {
        if let Err(e) = self.queue.publish(target, job_id).await {
            warn!(job_id = %job_id, target = %target, error = %e, "Failed to publish job");
        }
    }

    /// Scan every `scan_interval` until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval = ?self.scan_interval, "Starting lease monitor");
        let mut backoff = Backoff::default();
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            delay = match self.scan_once().await {
                Ok(report) => {
                    backoff.reset();
                    if report != ScanReport::default() {
                        info!(
                            requeued = report.requeued,
                            lost = report.lost,
                            republished = report.republished,
                            "Lease scan finished"
                        );
                    }
                    self.scan_interval
                }
                Err(e) if e.is_transient() => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "Lease scan failed");
                    delay
                }
                Err(e) => {
                    error!(error = %e, "Lease scan failed");
                    self.scan_interval
                }
            };
        }
        info!("Lease monitor stopped");
    }
}
