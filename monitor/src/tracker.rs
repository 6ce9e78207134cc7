//! Tracks when the previous payload closed.
//!
//! The gap between payloads decides how many minutes of session time a new
//! payload adds. Gaps longer than the session threshold start a new session and
//! only count as a single minute.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::Clock;

/// Default gap after which activity is treated as a new session (15 minutes).
pub const DEFAULT_SESSION_THRESHOLD_SECS: u64 = 15 * 60;

/// Minutes credited when there is no usable previous payload.
const DEFAULT_INCREMENT_MINUTES: u64 = 1;

/// Source of the minutes elapsed since the previous payload.
pub trait PayloadTracker: Send + Sync {
    /// Minutes to credit for the window being finalized.
    fn minutes_since_last_payload(&self) -> u64;

    /// Records the close time of a finalized payload.
    fn record_payload_end(&self, end: i64);
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrackerState {
    latest_payload_timestamp_end_utc: Option<i64>,
}

/// [`PayloadTracker`] persisting the last close time in a small JSON file.
pub struct SessionTracker {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    threshold_secs: u64,
    last_end: Mutex<Option<i64>>,
}

impl SessionTracker {
    /// Opens the tracker, loading any previously recorded close time.
    ///
    /// A missing or unreadable state file starts from scratch.
    #[must_use]
    pub fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>, threshold_secs: u64) -> Self {
        let path = path.into();
        let last_end = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<TrackerState>(&contents) {
                Ok(state) => state.latest_payload_timestamp_end_utc,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable tracker state");
                    None
                }
            },
            Err(_) => None,
        };

        Self {
            path,
            clock,
            threshold_secs,
            last_end: Mutex::new(last_end),
        }
    }

    /// The last recorded close time, if any.
    #[must_use]
    pub fn last_payload_end(&self) -> Option<i64> {
        *self.last_end.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, end: i64) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let state = TrackerState {
            latest_payload_timestamp_end_utc: Some(end),
        };
        let body = serde_json::to_vec(&state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, body)?;
        std::fs::rename(&tmp, &self.path)
    }
}

impl PayloadTracker for SessionTracker {
    fn minutes_since_last_payload(&self) -> u64 {
        let Some(last_end) = self.last_payload_end() else {
            return DEFAULT_INCREMENT_MINUTES;
        };

        let diff = self.clock.now().now_in_sec - last_end;
        match u64::try_from(diff) {
            Ok(secs) if secs > 0 && secs <= self.threshold_secs => secs.div_ceil(60),
            _ => DEFAULT_INCREMENT_MINUTES,
        }
    }

    fn record_payload_end(&self, end: i64) {
        *self.last_end.lock().unwrap_or_else(PoisonError::into_inner) = Some(end);

        if let Err(e) = self.persist(end) {
            warn!(path = %self.path.display(), error = %e, "Failed to persist payload end time");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use tempfile::TempDir;

    const NOW: i64 = 1_700_000_000;

    fn tracker(dir: &TempDir) -> SessionTracker {
        let clock = Arc::new(FixedClock::new(NOW, NOW, "UTC"));
        SessionTracker::open(
            dir.path().join("session.json"),
            clock,
            DEFAULT_SESSION_THRESHOLD_SECS,
        )
    }

    #[test]
    fn first_payload_credits_one_minute() {
        let dir = TempDir::new().unwrap();
        assert_eq!(tracker(&dir).minutes_since_last_payload(), 1);
    }

    #[test]
    fn gap_within_threshold_rounds_up_to_minutes() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir);

        t.record_payload_end(NOW - 150);
        assert_eq!(t.minutes_since_last_payload(), 3);

        t.record_payload_end(NOW - 120);
        assert_eq!(t.minutes_since_last_payload(), 2);

        t.record_payload_end(NOW - 15 * 60);
        assert_eq!(t.minutes_since_last_payload(), 15);
    }

    #[test]
    fn gap_beyond_threshold_starts_new_session() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir);

        t.record_payload_end(NOW - 15 * 60 - 1);
        assert_eq!(t.minutes_since_last_payload(), 1);
    }

    #[test]
    fn future_end_time_credits_one_minute() {
        let dir = TempDir::new().unwrap();
        let t = tracker(&dir);

        t.record_payload_end(NOW + 30);
        assert_eq!(t.minutes_since_last_payload(), 1);

        t.record_payload_end(NOW);
        assert_eq!(t.minutes_since_last_payload(), 1);
    }

    #[test]
    fn end_time_survives_reopen() {
        let dir = TempDir::new().unwrap();
        tracker(&dir).record_payload_end(NOW - 300);

        let reopened = tracker(&dir);
        assert_eq!(reopened.last_payload_end(), Some(NOW - 300));
        assert_eq!(reopened.minutes_since_last_payload(), 5);
    }

    #[test]
    fn corrupt_state_is_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("session.json"), "garbage").unwrap();

        let t = tracker(&dir);
        assert_eq!(t.last_payload_end(), None);
    }
}
