//! Drains the pending store to the batch ingestion endpoint.
//!
//! # Design
//!
//! - **At-least-once**: a chunk is removed from the store only after the server
//!   acknowledged it with a 2xx. A crash between the send and the acknowledge
//!   resends the chunk on the next flush. Every sent payload carries its store
//!   id as `payloadId`, so a resent payload has the same identity and the server
//!   can drop the repeat.
//!
//! - **Batching**: stored payloads are sent in chunks of at most
//!   [`MAX_BATCH_SIZE`].
//!
//! - **Retry behavior**: each chunk goes through
//!   [`Sender::send_batch`](crate::sender::Sender::send_batch). When a chunk
//!   still fails, the flush stops and the remaining payloads stay stored for the
//!   next flush.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use keystats_monitor::batcher::{BatchError, PayloadBatcher};
//! use keystats_monitor::sender::{Sender, SenderConfig};
//! use keystats_monitor::store::PayloadStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), BatchError> {
//!     let store = Arc::new(PayloadStore::open("/tmp/keystats/pending.jsonl").await?);
//!     let sender = Sender::new(SenderConfig::new("https://api.example.com".to_string(), None));
//!     let mut batcher = PayloadBatcher::new(store, sender);
//!
//!     let sent = batcher.flush().await?;
//!     println!("Sent {} payloads", sent);
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::sender::{Sender, SenderError};
use crate::store::{PayloadStore, StoreError};
use crate::types::KeystrokePayload;

/// Maximum number of payloads per batch request.
pub const MAX_BATCH_SIZE: usize = 1000;

/// Endpoint receiving payload batches.
pub const BATCH_ENDPOINT: &str = "/data/batch";

/// Errors that can occur while draining the store.
#[derive(Error, Debug)]
pub enum BatchError {
    /// Reading or rewriting the store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A chunk could not be delivered.
    #[error("send error: {0}")]
    Send(#[from] SenderError),
}

/// Sends stored payloads in batches and removes them once acknowledged.
///
/// # Thread Safety
///
/// A batcher is meant to be owned by a single drain task. The store it drains
/// may be shared with writers.
pub struct PayloadBatcher {
    store: Arc<PayloadStore>,
    sender: Sender,
    max_batch_size: usize,
    consecutive_failures: u32,
}

impl PayloadBatcher {
    /// Creates a batcher draining `store` through `sender`.
    #[must_use]
    pub fn new(store: Arc<PayloadStore>, sender: Sender) -> Self {
        Self {
            store,
            sender,
            max_batch_size: MAX_BATCH_SIZE,
            consecutive_failures: 0,
        }
    }

    /// Limits the number of payloads per request.
    #[must_use]
    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Number of flushes in a row that ended with an error.
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Sends all pending payloads, returning how many were acknowledged.
    ///
    /// # Errors
    ///
    /// Returns `BatchError` when the store cannot be read or rewritten, or when
    /// a chunk fails after its retries. Chunks acknowledged before the failure
    /// stay removed.
    pub async fn flush(&mut self) -> Result<usize, BatchError> {
        match self.drain().await {
            Ok(sent) => {
                self.consecutive_failures = 0;
                Ok(sent)
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                warn!(
                    error = %e,
                    consecutive_failures = self.consecutive_failures,
                    "Flush of stored payloads failed"
                );
                Err(e)
            }
        }
    }

    async fn drain(&mut self) -> Result<usize, BatchError> {
        let pending = self.store.pending().await?;
        if pending.is_empty() {
            debug!("No stored payloads to send");
            return Ok(0);
        }

        info!(pending = pending.len(), "Sending stored payloads");

        let mut sent = 0;
        for chunk in pending.chunks(self.max_batch_size) {
            let ids: Vec<Uuid> = chunk.iter().map(|r| r.id).collect();
            let payloads: Vec<KeystrokePayload> = chunk
                .iter()
                .map(|r| KeystrokePayload {
                    payload_id: Some(r.id),
                    ..r.payload.clone()
                })
                .collect();

            self.sender.send_batch(BATCH_ENDPOINT, &payloads).await?;
            self.store.acknowledge(&ids).await?;
            sent += chunk.len();
        }

        info!(sent, "Stored payloads delivered");
        Ok(sent)
    }

    /// Flushes every `interval` until `shutdown` resolves, then flushes once
    /// more.
    ///
    /// Flush errors are logged and retried on the next tick.
    pub async fn run<F>(mut self, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    // Errors are logged by flush; the next tick retries.
                    let _ = self.flush().await;
                }
                () = &mut shutdown => {
                    info!("Drain loop stopping, final flush");
                    if let Err(e) = self.flush().await {
                        error!(error = %e, "Final flush failed, payloads remain stored");
                    }
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{RetryPolicy, SenderConfig};
    use tempfile::TempDir;

    async fn create_test_batcher(dir: &TempDir) -> PayloadBatcher {
        let store = PayloadStore::open(dir.path().join("pending.jsonl"))
            .await
            .unwrap();
        // Nothing listens on port 9; only used when the store is non-empty.
        let config = SenderConfig::new("http://127.0.0.1:9".to_string(), None)
            .with_retry_policy(RetryPolicy::fast_for_tests().with_max_attempts(1));
        PayloadBatcher::new(Arc::new(store), Sender::new(config))
    }

    #[tokio::test]
    async fn test_flush_empty_store_sends_nothing() {
        let dir = TempDir::new().unwrap();
        let mut batcher = create_test_batcher(&dir).await;

        assert_eq!(batcher.flush().await.unwrap(), 0);
        assert_eq!(batcher.consecutive_failures(), 0);
    }

    #[test]
    fn test_max_batch_size_constant() {
        assert_eq!(MAX_BATCH_SIZE, 1000);
    }

    #[test]
    fn test_batch_endpoint_constant() {
        assert_eq!(BATCH_ENDPOINT, "/data/batch");
    }

    #[tokio::test]
    async fn test_with_max_batch_size_is_clamped() {
        let dir = TempDir::new().unwrap();
        let batcher = create_test_batcher(&dir).await.with_max_batch_size(0);
        assert_eq!(batcher.max_batch_size, 1);

        let batcher = create_test_batcher(&dir)
            .await
            .with_max_batch_size(MAX_BATCH_SIZE + 1);
        assert_eq!(batcher.max_batch_size, MAX_BATCH_SIZE);
    }

    #[test]
    fn test_batch_error_display() {
        let err = BatchError::Send(SenderError::AuthFailed);
        assert_eq!(
            err.to_string(),
            "send error: authentication failed: invalid or expired token"
        );
    }
}
