//! Delivery queue used by the payload finalizer.
//!
//! A finalized payload is either sent right away (one attempt, failures are
//! logged and dropped) or durably stored for the
//! [`PayloadBatcher`](crate::batcher::PayloadBatcher) to deliver later.
//! [`EventHandler`] is the production implementation; it is built at startup
//! and passed to the finalizer explicitly.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::sender::Sender;
use crate::store::{PayloadStore, StoreError};
use crate::types::KeystrokePayload;

/// Destination for finalized payloads.
#[async_trait]
pub trait DeliveryQueue: Send + Sync {
    /// Submits a batch for immediate delivery without waiting for the result.
    ///
    /// Best effort: a failed send is not retried and not reported.
    fn send_batch_payload(&self, path: &str, batch: Vec<KeystrokePayload>);

    /// Durably stores a payload for later batched delivery.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` if the payload could not be durably recorded.
    async fn store_payload(&self, payload: KeystrokePayload) -> Result<(), StoreError>;
}

/// [`DeliveryQueue`] backed by an HTTP [`Sender`] and a [`PayloadStore`].
pub struct EventHandler {
    sender: Sender,
    store: Arc<PayloadStore>,
    in_flight: Mutex<Vec<JoinHandle<()>>>,
}

impl EventHandler {
    #[must_use]
    pub fn new(sender: Sender, store: Arc<PayloadStore>) -> Self {
        Self {
            sender,
            store,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    /// The store receiving buffered payloads.
    #[must_use]
    pub fn store(&self) -> &Arc<PayloadStore> {
        &self.store
    }

    /// Number of immediate sends that have not finished yet.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let mut tasks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.len()
    }

    /// Waits up to `timeout` for in-flight immediate sends.
    ///
    /// Returns the number of sends still running when the timeout expired; they
    /// are aborted.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.in_flight.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if tasks.is_empty() {
            return 0;
        }

        info!(in_flight = tasks.len(), "Waiting for immediate sends");

        let deadline = tokio::time::Instant::now() + timeout;
        let mut unfinished = 0;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
                unfinished += 1;
            }
        }

        if unfinished > 0 {
            warn!(unfinished, "Immediate sends aborted at shutdown");
        }
        unfinished
    }
}

#[async_trait]
impl DeliveryQueue for EventHandler {
    fn send_batch_payload(&self, path: &str, mut batch: Vec<KeystrokePayload>) {
        for payload in &mut batch {
            payload.payload_id.get_or_insert_with(Uuid::new_v4);
        }
        let sender = self.sender.clone();
        let path = path.to_string();

        let task = tokio::spawn(async move {
            if let Err(e) = sender.send_once(&path, &batch).await {
                warn!(error = %e, payloads = batch.len(), "Immediate send failed");
            }
        });

        let mut tasks = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|t| !t.is_finished());
        tasks.push(task);
        debug!(in_flight = tasks.len(), "Immediate send issued");
    }

    async fn store_payload(&self, payload: KeystrokePayload) -> Result<(), StoreError> {
        self.store.append(payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystrokes::KeystrokeStats;
    use crate::sender::{RetryPolicy, SenderConfig};
    use crate::types::{EnvironmentTags, Project};
    use tempfile::TempDir;

    async fn handler(dir: &TempDir) -> EventHandler {
        let store = PayloadStore::open(dir.path().join("pending.jsonl"))
            .await
            .unwrap();
        let config = SenderConfig::new("http://127.0.0.1:9".to_string(), None)
            .with_retry_policy(RetryPolicy::fast_for_tests());
        EventHandler::new(Sender::new(config), Arc::new(store))
    }

    fn payload() -> KeystrokePayload {
        KeystrokeStats::new(
            Some(Project::new("/src/app", "app")),
            EnvironmentTags::current(2),
        )
        .to_payload()
    }

    #[tokio::test]
    async fn store_payload_appends_to_store() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir).await;

        handler.store_payload(payload()).await.unwrap();
        handler.store_payload(payload()).await.unwrap();

        assert_eq!(handler.store().len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn store_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir).await;
        // A directory where the store file should be makes the append fail.
        std::fs::create_dir_all(handler.store().path()).unwrap();

        let result = handler.store_payload(payload()).await;
        assert!(matches!(result, Err(StoreError::Io(_))));
    }

    #[tokio::test]
    async fn failed_immediate_send_is_not_stored() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir).await;

        handler.send_batch_payload("/data/batch", vec![payload()]);
        assert_eq!(handler.shutdown(Duration::from_secs(5)).await, 0);

        assert_eq!(handler.in_flight(), 0);
        assert!(handler.store().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_without_sends_returns_zero() {
        let dir = TempDir::new().unwrap();
        let handler = handler(&dir).await;
        assert_eq!(handler.shutdown(Duration::from_millis(10)).await, 0);
    }
}
