#![forbid(unsafe_code)]

//! Aggregate counters persisted next to the episode collection.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::episode::Episode;
use crate::storage::KeyValueStorage;

pub const STATS_KEY: &str = "catalogStats";

/// Episodes created within this window count as recent.
pub const RECENT_WINDOW_DAYS: i64 = 7;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CatalogStats {
    pub total_episodes: usize,
    pub published_episodes: usize,
    pub featured_episodes: usize,
    pub total_views: u64,
    pub total_likes: u64,
    pub unique_seasons: usize,
    pub recent_episodes: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

impl CatalogStats {
    pub fn compute(episodes: &[Episode], now: DateTime<Utc>) -> Self {
        let week_ago = now - Duration::days(RECENT_WINDOW_DAYS);
        let seasons: HashSet<u32> = episodes.iter().map(|episode| episode.season).collect();
        Self {
            total_episodes: episodes.len(),
            published_episodes: episodes.iter().filter(|episode| episode.published).count(),
            featured_episodes: episodes.iter().filter(|episode| episode.featured).count(),
            total_views: episodes
                .iter()
                .map(|episode| episode.views)
                .fold(0, u64::saturating_add),
            total_likes: episodes
                .iter()
                .map(|episode| episode.likes)
                .fold(0, u64::saturating_add),
            unique_seasons: seasons.len(),
            recent_episodes: episodes
                .iter()
                .filter(|episode| episode.created_at > week_ago)
                .count(),
            last_updated: Some(now),
        }
    }

    pub fn save(&self, storage: &dyn KeyValueStorage) -> Result<()> {
        let raw = serde_json::to_string(self).context("serializing stats")?;
        storage.set(STATS_KEY, &raw)
    }
}
