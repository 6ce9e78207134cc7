//! Turns a keystroke aggregate into a delivery-ready payload.
//!
//! [`PayloadFinalizer::post_data`] closes the window, credits the elapsed
//! session minutes to the project, stamps the cumulative editor seconds and the
//! timezone, and hands the payload to the [`DeliveryQueue`].
//!
//! Finalizing is not idempotent: every call credits session minutes, so each
//! collection window must be posted at most once.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::accumulator::TimeAccumulator;
use crate::batcher::BATCH_ENDPOINT;
use crate::clock::Clock;
use crate::error::Result;
use crate::keystrokes::KeystrokeStats;
use crate::queue::DeliveryQueue;
use crate::tracker::PayloadTracker;
use crate::types::KeystrokePayload;

/// Editor seconds reported when nothing has been accounted for today.
pub const DEFAULT_EDITOR_SECONDS: u64 = 60;

/// Finalizes aggregates and routes them for delivery.
pub struct PayloadFinalizer {
    clock: Arc<dyn Clock>,
    accumulator: Arc<dyn TimeAccumulator>,
    tracker: Arc<dyn PayloadTracker>,
    queue: Arc<dyn DeliveryQueue>,
}

impl PayloadFinalizer {
    #[must_use]
    pub fn new(
        clock: Arc<dyn Clock>,
        accumulator: Arc<dyn TimeAccumulator>,
        tracker: Arc<dyn PayloadTracker>,
        queue: Arc<dyn DeliveryQueue>,
    ) -> Self {
        Self {
            clock,
            accumulator,
            tracker,
            queue,
        }
    }

    /// Builds the finalized payload for `stats` without delivering it.
    ///
    /// Credits the minutes since the previous payload to the project's session
    /// time. Accounting failures are logged and never abort the payload.
    pub async fn finalize(&self, stats: &KeystrokeStats) -> KeystrokePayload {
        let now = self.clock.now();

        let mut payload = stats.to_payload();
        payload.end = now.now_in_sec;
        payload.local_end = now.local_now_in_sec;

        let increment_minutes = self.tracker.minutes_since_last_payload();
        if let Err(e) = self
            .accumulator
            .increment_session_and_file_seconds(&payload.project, increment_minutes)
            .await
        {
            warn!(
                error = %e,
                project = %payload.project.directory,
                "Failed to increment session time"
            );
        }

        let editor_seconds = match self
            .accumulator
            .today_time_data_summary(&payload.project)
            .await
        {
            Ok(Some(td)) => td.cumulative_editor_seconds(),
            Ok(None) => DEFAULT_EDITOR_SECONDS,
            Err(e) => {
                warn!(error = %e, "Failed to read today's time data, using default");
                DEFAULT_EDITOR_SECONDS
            }
        };

        for info in payload.source.values_mut() {
            if !info.is_closed() {
                info.end = now.now_in_sec;
                info.local_end = now.local_now_in_sec;
            }
        }
        payload.cumulative_editor_seconds = editor_seconds;
        payload.timezone = self.clock.timezone();

        debug!(
            keystrokes = payload.keystrokes,
            files = payload.source.len(),
            increment_minutes,
            cumulative_editor_seconds = editor_seconds,
            "Finalized payload"
        );

        payload
    }

    /// Finalizes `stats` and delivers the payload.
    ///
    /// With `send_now` the payload is submitted as a one-element batch without
    /// waiting for the result. Otherwise it is durably stored before this
    /// returns.
    ///
    /// # Errors
    ///
    /// Returns `MonitorError::Store` if the payload could not be stored.
    pub async fn post_data(
        &self,
        stats: &KeystrokeStats,
        send_now: bool,
    ) -> Result<KeystrokePayload> {
        let payload = self.finalize(stats).await;

        if send_now {
            self.queue
                .send_batch_payload(BATCH_ENDPOINT, vec![payload.clone()]);
        } else {
            self.queue.store_payload(payload.clone()).await?;
            info!(keystrokes = payload.keystrokes, "Storing kpm metrics");
        }

        self.tracker.record_payload_end(payload.end);
        Ok(payload)
    }
}
