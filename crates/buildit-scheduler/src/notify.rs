//! Delivery of terminal job events to front-ends.
//!
//! Events sit in the store's outbox until every notifier accepted them, so
//! delivery is at-least-once. Consumers deduplicate on `(job_id, status)`.

use async_trait::async_trait;
use buildit_core::retry::Backoff;
use buildit_core::{Error, JobEvent, JobStore, Notifier, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_BATCH_SIZE: i64 = 50;
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the HMAC-SHA256 of the request body.
pub const SIGNATURE_HEADER: &str = "X-Buildit-Signature";

/// Writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, event: &JobEvent) -> Result<()> {
        let result = event.result.as_ref();
        info!(
            job_id = %event.job_id,
            target = %event.target,
            status = %event.status,
            exit_code = ?result.and_then(|r| r.exit_code),
            elapsed_ms = result.map(|r| r.elapsed_ms),
            worker = ?result.and_then(|r| r.worker.as_ref()),
            "Job finished"
        );
        Ok(())
    }
}

/// POSTs each event as JSON to a front-end.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: url::Url,
    secret: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: url::Url, secret: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self {
            client,
            url,
            secret,
        })
    }
}

/// `sha256=<hex>` signature of `body` under `secret`.
pub fn sign(secret: &str, body: &[u8]) -> Result<String> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .map_err(|e| Error::Internal(e.to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, event: &JobEvent) -> Result<()> {
        let body = serde_json::to_vec(event).map_err(|e| Error::Internal(e.to_string()))?;
        let mut request = self
            .client
            .post(self.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(secret) = &self.secret {
            request = request.header(SIGNATURE_HEADER, sign(secret, &body)?);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Unavailable(format!("{}: {}", self.url, e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Unavailable(format!(
                "{} answered {}",
                self.url, status
            )));
        }
        Ok(())
    }
}

/// Moves events from the store's outbox to the notifiers.
pub struct NotificationRelay {
    store: Arc<dyn JobStore>,
    notifiers: Vec<Arc<dyn Notifier>>,
    poll_interval: Duration,
    batch_size: i64,
}

impl NotificationRelay {
    pub fn new(store: Arc<dyn JobStore>, notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            store,
            notifiers,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Deliver one batch of pending events, oldest first.
    ///
    /// Stops at the first event a notifier refuses; that event and the
    /// ones after it stay pending.
    pub async fn deliver_once(&self) -> Result<usize> {
        let events = self.store.pending_events(self.batch_size).await?;
        let mut delivered = 0;
        for event in &events {
            for notifier in &self.notifiers {
                if let Err(e) = notifier.notify(event).await {
                    warn!(
                        job_id = %event.job_id,
                        notifier = notifier.name(),
                        error = %e,
                        "Notification failed"
                    );
                    return Err(e);
                }
            }
            self.store.ack_event(event.id).await?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Deliver until shutdown, backing off while notifiers fail.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(notifiers = self.notifiers.len(), "Starting notification relay");
        let mut backoff = Backoff::default();
        let mut delay = Duration::ZERO;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            delay = match self.deliver_once().await {
                Ok(_) => {
                    backoff.reset();
                    self.poll_interval
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, retry_in = ?delay, "Notification delivery failed");
                    delay
                }
            };
        }
        info!("Notification relay stopped");
    }
}
