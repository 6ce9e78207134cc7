//! Per-project session and editor time accounting.
//!
//! The finalizer adds the minutes elapsed since the previous payload to the
//! active project's session and file seconds, then stamps the day's cumulative
//! editor seconds onto the payload. [`FileTimeAccumulator`] keeps one
//! [`TimeData`] row per (local day, project directory) in a JSON file.
//!
//! Only today's rows are kept: older days are dropped on the next write. A file
//! that no longer parses is moved aside to `*.corrupt` and accounting restarts
//! from an empty file.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::sync_parent_dir;
use crate::types::Project;

/// Seconds per accumulated minute.
const SECONDS_PER_MINUTE: u64 = 60;

/// Errors raised by time accounting storage.
#[derive(Error, Debug)]
pub enum AccumulatorError {
    /// Reading or writing the time data file failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Time data could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Accumulated time for one project on one local day.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeData {
    /// Local day as `YYYY-MM-DD`.
    pub day: String,
    pub project_dir: String,
    pub editor_seconds: u64,
    pub session_seconds: u64,
    pub file_seconds: u64,
}

impl TimeData {
    /// Cumulative editor seconds reported on payloads.
    #[must_use]
    pub fn cumulative_editor_seconds(&self) -> u64 {
        self.editor_seconds.max(self.session_seconds)
    }
}

/// Session/time accounting consulted while finalizing a payload.
#[async_trait]
pub trait TimeAccumulator: Send + Sync {
    /// Adds `minutes` to the project's session and file seconds for today.
    async fn increment_session_and_file_seconds(
        &self,
        project: &Project,
        minutes: u64,
    ) -> Result<(), AccumulatorError>;

    /// Today's totals for the project, or `None` if nothing was recorded yet.
    async fn today_time_data_summary(
        &self,
        project: &Project,
    ) -> Result<Option<TimeData>, AccumulatorError>;
}

/// JSON-file backed [`TimeAccumulator`].
///
/// Rows are increment-only within a day. File access is serialized by an async
/// mutex and every write replaces the file atomically.
pub struct FileTimeAccumulator {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    lock: Mutex<()>,
}

impl FileTimeAccumulator {
    /// Creates an accumulator storing its rows at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            lock: Mutex::new(()),
        }
    }

    /// Location of the time data file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn today(&self) -> String {
        let local = self.clock.now().local_now_in_sec;
        DateTime::from_timestamp(local, 0)
            .map(|dt| dt.date_naive().format("%Y-%m-%d").to_string())
            .unwrap_or_default()
    }

    /// Location a corrupt time data file is moved to.
    #[must_use]
    pub fn quarantine_path(&self) -> PathBuf {
        self.path.with_extension("json.corrupt")
    }

    async fn load(&self) -> Result<Vec<TimeData>, AccumulatorError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }

        match serde_json::from_str(&contents) {
            Ok(rows) => Ok(rows),
            Err(e) => {
                let quarantine = self.quarantine_path();
                warn!(
                    error = %e,
                    path = %self.path.display(),
                    moved_to = %quarantine.display(),
                    "Time data file is corrupt, starting over"
                );
                tokio::fs::rename(&self.path, &quarantine).await?;
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, rows: &[TimeData]) -> Result<(), AccumulatorError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&serde_json::to_vec_pretty(rows)?).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, &self.path).await?;
        sync_parent_dir(&self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TimeAccumulator for FileTimeAccumulator {
    async fn increment_session_and_file_seconds(
        &self,
        project: &Project,
        minutes: u64,
    ) -> Result<(), AccumulatorError> {
        let _guard = self.lock.lock().await;

        let day = self.today();
        let seconds = minutes.saturating_mul(SECONDS_PER_MINUTE);
        let mut rows = self.load().await?;
        let before = rows.len();
        rows.retain(|r| r.day >= day);
        if rows.len() < before {
            debug!(dropped = before - rows.len(), "Dropped time data from earlier days");
        }

        let index = match rows
            .iter()
            .position(|r| r.day == day && r.project_dir == project.directory)
        {
            Some(i) => i,
            None => {
                rows.push(TimeData {
                    day: day.clone(),
                    project_dir: project.directory.clone(),
                    ..TimeData::default()
                });
                rows.len() - 1
            }
        };

        let row = &mut rows[index];
        row.session_seconds = row.session_seconds.saturating_add(seconds);
        row.file_seconds = row.file_seconds.saturating_add(seconds);
        row.editor_seconds = row.editor_seconds.max(row.session_seconds);

        debug!(
            project = %project.directory,
            day = %day,
            minutes,
            session_seconds = row.session_seconds,
            "Incremented session time"
        );

        self.save(&rows).await
    }

    async fn today_time_data_summary(
        &self,
        project: &Project,
    ) -> Result<Option<TimeData>, AccumulatorError> {
        let _guard = self.lock.lock().await;

        let day = self.today();
        let rows = self.load().await?;
        Ok(rows
            .into_iter()
            .find(|r| r.day == day && r.project_dir == project.directory))
    }
}
