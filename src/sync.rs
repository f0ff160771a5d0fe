#![forbid(unsafe_code)]

//! Change propagation between processes sharing one data directory.
//!
//! Two mechanisms cooperate, neither of them transactional:
//!
//! * After each mutation the writer leaves a short-lived [`SyncMarker`] under
//!   [`SYNC_KEY`], tagged with its process [`origin`](SyncMarker::origin).
//!   Readers skip their own markers and never delete foreign ones; only the
//!   writer clears what it wrote.
//! * A [`ChangeDetector`] hashes the stored episode text on a timer so that
//!   changes are picked up even when a marker was missed or overwritten.
//!
//! Concurrent writers overwrite each other at whole-collection granularity;
//! the last write wins.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use chrono::Utc;
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::storage::KeyValueStorage;

pub const SYNC_KEY: &str = "catalogSync";

/// Tag written into every marker; markers carrying any other source are
/// ignored.
pub const SYNC_SOURCE: &str = "fansub-catalog";

static PROCESS_ORIGIN: LazyLock<String> =
    LazyLock::new(|| format!("{}-{:08x}", std::process::id(), OsRng.next_u32()));

/// Identifies markers written by this process.
pub fn process_origin() -> &'static str {
    PROCESS_ORIGIN.as_str()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncAction {
    EpisodeAdded,
    EpisodeUpdated,
    EpisodeDeleted,
    DataImported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMarker {
    pub action: SyncAction,
    #[serde(default)]
    pub data: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub source: String,
    /// Writing process, see [`process_origin`].
    #[serde(default)]
    pub origin: String,
}

impl SyncMarker {
    pub fn new(action: SyncAction, data: serde_json::Value) -> Self {
        Self {
            action,
            data,
            timestamp: Utc::now().timestamp_millis(),
            source: SYNC_SOURCE.to_string(),
            origin: process_origin().to_string(),
        }
    }

    pub fn is_own(&self) -> bool {
        self.origin == process_origin()
    }

    pub fn publish(&self, storage: &dyn KeyValueStorage) -> Result<()> {
        let raw = serde_json::to_string(self).context("serializing sync marker")?;
        storage.set(SYNC_KEY, &raw)
    }

    /// Returns the pending marker, if one from this application is present.
    pub fn read(storage: &dyn KeyValueStorage) -> Result<Option<Self>> {
        let Some(raw) = storage.get(SYNC_KEY)? else {
            return Ok(None);
        };
        match serde_json::from_str::<Self>(&raw) {
            Ok(marker) if marker.source == SYNC_SOURCE => Ok(Some(marker)),
            Ok(marker) => {
                log::debug!("ignoring sync marker from {}", marker.source);
                Ok(None)
            }
            Err(err) => {
                log::warn!("ignoring malformed sync marker: {err}");
                Ok(None)
            }
        }
    }

    /// Removes the pending marker if this process wrote it. Returns whether
    /// anything was removed.
    pub fn clear_own(storage: &dyn KeyValueStorage) -> Result<bool> {
        match Self::read(storage)? {
            Some(marker) if marker.is_own() => {
                storage.remove(SYNC_KEY)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Detects changes to a stored value between polls by comparing digests,
/// and remembers the last foreign marker it reported.
#[derive(Debug, Default)]
pub struct ChangeDetector {
    key: String,
    last: Option<blake3::Hash>,
    last_marker: Option<(String, i64)>,
}

impl ChangeDetector {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            last: None,
            last_marker: None,
        }
    }

    /// True for a marker written by another process that was not reported
    /// before. Our own markers are never reported.
    pub fn observe_marker(&mut self, marker: &SyncMarker) -> bool {
        if marker.is_own() {
            return false;
        }
        let seen = (marker.origin.clone(), marker.timestamp);
        if self.last_marker.as_ref() == Some(&seen) {
            return false;
        }
        self.last_marker = Some(seen);
        true
    }

    /// Records the current digest and reports whether it differs from the
    /// previous observation. The very first observation only sets the
    /// baseline and returns `false`.
    pub fn observe(&mut self, raw: Option<&str>) -> bool {
        let digest = blake3::hash(raw.unwrap_or_default().as_bytes());
        let changed = self.last.is_some_and(|previous| previous != digest);
        self.last = Some(digest);
        changed
    }

    pub fn poll(&mut self, storage: &dyn KeyValueStorage) -> Result<bool> {
        let raw = storage.get(&self.key)?;
        Ok(self.observe(raw.as_deref()))
    }
}
