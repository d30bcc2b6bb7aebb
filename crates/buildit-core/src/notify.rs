//! Consumers of terminal job transitions (chat bots, commit statuses).

use async_trait::async_trait;

use crate::Result;
use crate::job::JobEvent;

/// Delivery is at-least-once; implementations deduplicate on
/// [`JobEvent::dedup_key`] if duplicates matter to them.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, event: &JobEvent) -> Result<()>;
}
