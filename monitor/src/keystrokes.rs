//! Keystroke aggregate for a single collection window.
//!
//! The editor integration mutates a [`KeystrokeStats`] as change events
//! arrive. When the window is flushed, [`KeystrokeStats::has_data`] prunes noise
//! entries and reconciles the keystroke total before the aggregate is handed to
//! the [`PayloadFinalizer`](crate::finalizer::PayloadFinalizer).
//!
//! # Example
//!
//! ```
//! use keystats_monitor::keystrokes::KeystrokeStats;
//! use keystats_monitor::types::{ChangeKind, EnvironmentTags, Project};
//!
//! let mut stats = KeystrokeStats::new(
//!     Some(Project::new("/src/app", "app")),
//!     EnvironmentTags::current(2),
//! );
//!
//! let file = stats.file_mut("/src/app/main.rs", 1_700_000_000, 1_700_003_600);
//! file.apply(ChangeKind::Add, 5);
//! file.apply(ChangeKind::LinesAdded, 1);
//!
//! assert!(stats.has_data());
//! assert_eq!(stats.keystrokes, 6);
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{
    null_as_default, EnvironmentTags, FileChangeInfo, KeystrokePayload, Project,
};

/// In-memory aggregate of per-file change counters for one collection window.
///
/// Not designed for concurrent mutation; the producer must serialize updates
/// for a window before flushing it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeystrokeStats {
    /// File path to counters.
    #[serde(deserialize_with = "null_as_default")]
    pub source: HashMap<String, FileChangeInfo>,
    /// Aggregate keystroke counter maintained by the producer.
    pub keystrokes: u64,
    pub start: i64,
    #[serde(rename = "local_start")]
    pub local_start: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub timezone: String,
    pub project: Option<Project>,
    pub plugin_id: u32,
    #[serde(deserialize_with = "null_as_default")]
    pub version: String,
    #[serde(deserialize_with = "null_as_default")]
    pub os: String,
    pub repo_contributor_count: u64,
    pub repo_file_count: u64,
}

impl KeystrokeStats {
    /// Starts a new, empty collection window.
    #[must_use]
    pub fn new(project: Option<Project>, tags: EnvironmentTags) -> Self {
        Self {
            project,
            plugin_id: tags.plugin_id,
            version: tags.version,
            os: tags.os,
            ..Self::default()
        }
    }

    /// Sets the window start times.
    #[must_use]
    pub fn starting_at(mut self, start: i64, local_start: i64) -> Self {
        self.start = start;
        self.local_start = local_start;
        self
    }

    /// Fills any environment tag left blank by the producer.
    pub fn fill_missing_tags(&mut self, tags: &EnvironmentTags) {
        if self.plugin_id == 0 {
            self.plugin_id = tags.plugin_id;
        }
        if self.version.is_empty() {
            self.version.clone_from(&tags.version);
        }
        if self.os.is_empty() {
            self.os.clone_from(&tags.os);
        }
    }

    /// Returns the counters for `path`, creating them on first touch.
    pub fn file_mut(&mut self, path: &str, now: i64, local_now: i64) -> &mut FileChangeInfo {
        self.source
            .entry(path.to_string())
            .or_insert_with(|| FileChangeInfo::started_at(now, local_now))
    }

    /// Adds to the aggregate keystroke counter.
    pub fn increment_keystrokes(&mut self, count: u64) {
        self.keystrokes = self.keystrokes.saturating_add(count);
    }

    /// Replaces the active project identity.
    pub fn set_project(&mut self, project: Option<Project>) {
        self.project = project;
    }

    /// Returns `true` if no file has been touched in this window.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Decides whether this window is worth sending, normalizing it in place.
    ///
    /// Every file's `keystrokes` is recomputed from its raw counters. Files with
    /// only an open or only a close and no keystrokes are removed. A file with
    /// both an open and a close counts as signal even without keystrokes. When
    /// the recomputed tally is positive and differs from the stored total, the
    /// tally replaces it and the window counts as signal.
    ///
    /// Files with no open, no close and no keystrokes are kept and do not count
    /// as signal.
    pub fn has_data(&mut self) -> bool {
        if self.source.is_empty() {
            return false;
        }

        let mut found_signal = self.keystrokes > 0;
        let mut tally: u64 = 0;

        self.source.retain(|path, info| {
            let keystrokes = info.recompute_keystrokes();
            tally = tally.saturating_add(keystrokes);

            let has_open = info.open > 0;
            let has_close = info.close > 0;

            if has_open != has_close && keystrokes == 0 {
                debug!(file = %path, "Dropping file with only focus changes");
                return false;
            }

            if !found_signal && has_open && has_close {
                found_signal = true;
            }
            true
        });

        if tally > 0 && tally != self.keystrokes {
            debug!(
                stored = self.keystrokes,
                tally, "Reconciling keystroke total from file counters"
            );
            self.keystrokes = tally;
            found_signal = true;
        }

        found_signal
    }

    /// Builds the payload snapshot of this aggregate.
    ///
    /// Timestamps that close the window, the timezone and the cumulative editor
    /// seconds are left for the finalizer to fill. An absent project or one
    /// without a directory is replaced by [`Project::placeholder`].
    #[must_use]
    pub fn to_payload(&self) -> KeystrokePayload {
        KeystrokePayload {
            source: self
                .source
                .iter()
                .map(|(path, info)| (path.clone(), info.clone()))
                .collect(),
            keystrokes: self.keystrokes,
            start: self.start,
            local_start: self.local_start,
            end: 0,
            local_end: 0,
            timezone: self.timezone.clone(),
            project: Project::or_placeholder(self.project.as_ref()),
            plugin_id: self.plugin_id,
            version: self.version.clone(),
            os: self.os.clone(),
            repo_contributor_count: self.repo_contributor_count,
            repo_file_count: self.repo_file_count,
            cumulative_editor_seconds: 0,
            payload_id: None,
        }
    }
}
