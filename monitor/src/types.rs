//! Wire types for keystroke usage payloads.
//!
//! This module defines the per-file change counters, the project identity and
//! the finalized payload shape sent to the ingestion endpoint. Field names follow
//! the ingestion API: counters are camelCase (`linesAdded`, `pluginId`) while the
//! timestamp and accounting fields keep their snake_case names (`local_end`,
//! `cumulative_editor_seconds`).

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

/// Project directory used when no workspace folder is open.
pub const UNTITLED_WORKSPACE: &str = "UntitledWorkspace";

/// Project name used when no workspace folder is open.
pub const NO_PROJ_NAME: &str = "Unnamed";

/// Deserializes `null` as the type's default value.
///
/// Editor integrations send `null` for unknown project fields.
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Kind of raw change reported by the editor for a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Characters typed.
    Add,
    /// Characters inserted by a paste.
    Paste,
    /// Characters removed.
    Delete,
    /// Lines added.
    LinesAdded,
    /// Lines removed.
    LinesRemoved,
    /// File brought to the foreground.
    Open,
    /// File sent to the background.
    Close,
}

/// Change counters for one file within a collection window.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FileChangeInfo {
    pub add: u64,
    pub paste: u64,
    pub delete: u64,
    pub lines_added: u64,
    pub lines_removed: u64,
    pub open: u64,
    pub close: u64,

    /// Derived sum of the five edit counters. Recomputed before every
    /// inclusion decision, never trusted as supplied.
    pub keystrokes: u64,

    /// Syntax/language id reported by the editor, if any.
    #[serde(
        skip_serializing_if = "String::is_empty",
        deserialize_with = "null_as_default"
    )]
    pub syntax: String,

    pub start: i64,
    #[serde(rename = "local_start")]
    pub local_start: i64,

    /// Window close for this file; `0` means still open.
    pub end: i64,
    #[serde(rename = "local_end")]
    pub local_end: i64,
}

impl FileChangeInfo {
    /// Creates an empty entry whose activity starts at the given times.
    #[must_use]
    pub fn started_at(start: i64, local_start: i64) -> Self {
        Self {
            start,
            local_start,
            ..Self::default()
        }
    }

    /// Applies a signed editor delta to one counter.
    ///
    /// Negative deltas are clamped to zero; counters never go below zero and
    /// never wrap.
    pub fn apply(&mut self, kind: ChangeKind, delta: i64) {
        let amount = u64::try_from(delta).unwrap_or(0);
        let counter = match kind {
            ChangeKind::Add => &mut self.add,
            ChangeKind::Paste => &mut self.paste,
            ChangeKind::Delete => &mut self.delete,
            ChangeKind::LinesAdded => &mut self.lines_added,
            ChangeKind::LinesRemoved => &mut self.lines_removed,
            ChangeKind::Open => &mut self.open,
            ChangeKind::Close => &mut self.close,
        };
        *counter = counter.saturating_add(amount);
    }

    /// Sum of the five raw edit counters.
    #[must_use]
    pub fn keystroke_sum(&self) -> u64 {
        self.add
            .saturating_add(self.paste)
            .saturating_add(self.delete)
            .saturating_add(self.lines_added)
            .saturating_add(self.lines_removed)
    }

    /// Recomputes [`keystrokes`](Self::keystrokes) from the raw counters and
    /// returns the new value.
    pub fn recompute_keystrokes(&mut self) -> u64 {
        self.keystrokes = self.keystroke_sum();
        self.keystrokes
    }

    /// Whether the file's activity window has a close time.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.end != 0
    }
}

/// Identity of the project a collection window belongs to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Project {
    #[serde(deserialize_with = "null_as_default")]
    pub directory: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    /// VCS identifier (e.g. remote URL), empty when unknown.
    #[serde(deserialize_with = "null_as_default")]
    pub identifier: String,
    /// Repository metadata supplied by the editor integration.
    #[serde(deserialize_with = "null_as_default")]
    pub resource: BTreeMap<String, serde_json::Value>,
}

impl Project {
    /// Creates a project for a workspace directory.
    #[must_use]
    pub fn new(directory: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the VCS identifier.
    #[must_use]
    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = identifier.into();
        self
    }

    /// The grouping key used when no real project is open.
    #[must_use]
    pub fn placeholder() -> Self {
        Self::new(UNTITLED_WORKSPACE, NO_PROJ_NAME)
    }

    /// Whether this identity carries a usable directory.
    #[must_use]
    pub fn has_directory(&self) -> bool {
        !self.directory.is_empty()
    }

    /// Returns the project if it has a directory, otherwise the placeholder.
    #[must_use]
    pub fn or_placeholder(project: Option<&Project>) -> Project {
        match project {
            Some(p) if p.has_directory() => p.clone(),
            _ => Self::placeholder(),
        }
    }
}

/// Static tags describing the reporting plugin and host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentTags {
    pub plugin_id: u32,
    pub version: String,
    pub os: String,
}

impl EnvironmentTags {
    /// Tags for this build running on the current host.
    #[must_use]
    pub fn current(plugin_id: u32) -> Self {
        Self {
            plugin_id,
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// Delivery-ready snapshot of one collection window.
///
/// Built field-by-field from a
/// [`KeystrokeStats`](crate::keystrokes::KeystrokeStats) aggregate and then
/// completed by the [`PayloadFinalizer`](crate::finalizer::PayloadFinalizer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeystrokePayload {
    pub source: BTreeMap<String, FileChangeInfo>,
    pub keystrokes: u64,
    pub start: i64,
    #[serde(rename = "local_start")]
    pub local_start: i64,
    pub end: i64,
    #[serde(rename = "local_end")]
    pub local_end: i64,
    pub timezone: String,
    pub project: Project,
    pub plugin_id: u32,
    pub version: String,
    pub os: String,
    pub repo_contributor_count: u64,
    pub repo_file_count: u64,
    #[serde(rename = "cumulative_editor_seconds")]
    pub cumulative_editor_seconds: u64,
    /// Delivery identity. Repeated deliveries of one payload share it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_id: Option<Uuid>,
}
