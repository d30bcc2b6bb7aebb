//! Job notification queue backed by PostgreSQL.
//!
//! One row per pending notification. Subscribers poll their target's rows
//! with `FOR UPDATE SKIP LOCKED` and delete what they receive, so each
//! notification goes to a single agent. Notifications lost after delivery
//! are covered by the lease monitor's republish of stale queued jobs.

use async_trait::async_trait;
use buildit_core::{JobId, JobQueue, Result, Target};
use futures::stream::{self, BoxStream};
use sqlx::PgPool;
use std::time::Duration;
use tracing::warn;

use crate::DbError;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// PostgreSQL implementation of [`JobQueue`].
#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    poll_interval: Duration,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Take the oldest notification for a target, if any.
    async fn take(&self, target: &Target) -> std::result::Result<Option<JobId>, DbError> {
        let id: Option<uuid::Uuid> = sqlx::query_scalar(
            r#"
            DELETE FROM job_queue
            WHERE id = (
                SELECT id FROM job_queue
                WHERE target = $1
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING job_id
            "#,
        )
        .bind(target.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id.map(JobId::from_uuid))
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn publish(&self, target: &Target, job_id: JobId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_queue (target, job_id, enqueued_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(target.as_str())
        .bind(job_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn subscribe(&self, target: &Target) -> Result<BoxStream<'static, Result<JobId>>> {
        let queue = self.clone();
        let target = target.clone();
        let stream = stream::unfold((queue, target), |(queue, target)| async move {
            loop {
                match queue.take(&target).await {
                    Ok(Some(id)) => return Some((Ok(id), (queue, target))),
                    Ok(None) => tokio::time::sleep(queue.poll_interval).await,
                    Err(e) => {
                        warn!(target = %target, error = %e, "Failed to poll job queue");
                        return Some((Err(e.into()), (queue, target)));
                    }
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
