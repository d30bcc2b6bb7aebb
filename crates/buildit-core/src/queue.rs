//! Job-available notifications, fanned out per target.
//!
//! Delivery is at-least-once and only best-effort ordered. The queue carries
//! job ids, never payloads; exclusivity comes from the store's lease.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::{JobId, Result, Target};

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a notification that `job_id` is claimable by `target` workers.
    async fn publish(&self, target: &Target, job_id: JobId) -> Result<()>;

    /// A lazy stream of notifications for one target. Calling again restarts it.
    async fn subscribe(&self, target: &Target) -> Result<BoxStream<'static, Result<JobId>>>;
}
