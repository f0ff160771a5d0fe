#![forbid(unsafe_code)]

//! The episode collection and every operation that mutates it.
//!
//! The whole collection lives in memory and is rewritten to storage as one
//! JSON array after each mutation. There is no batching and no partial-write
//! recovery: when a write fails the in-memory state stays authoritative, the
//! failure is logged, and the next mutation (or an explicit [`EpisodeStore::flush`])
//! writes everything again.

use std::{
    cmp::Reverse,
    collections::{HashMap, HashSet},
    str::FromStr,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::episode::{DEFAULT_QUALITY, Episode, EpisodeDraft, EpisodePatch};
use crate::error::{CatalogError, CatalogResult};
use crate::resolver::resolve;
use crate::stats::CatalogStats;
use crate::storage::KeyValueStorage;
use crate::sync::{SyncAction, SyncMarker};

pub const EPISODES_KEY: &str = "catalogEpisodes";
pub const DEFAULT_PLACEHOLDER_THUMBNAIL: &str = "img/thumbnail-placeholder.jpg";
pub const BACKUP_VERSION: &str = "1.0.0";

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Thumbnail stored when the resolver cannot derive one.
    pub placeholder_thumbnail: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            placeholder_thumbnail: DEFAULT_PLACEHOLDER_THUMBNAIL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Newest,
    Oldest,
    MostViewed,
    Title,
    Season,
}

impl FromStr for SortOrder {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "newest" => Ok(Self::Newest),
            "oldest" => Ok(Self::Oldest),
            "most_viewed" | "mostviewed" | "popular" => Ok(Self::MostViewed),
            "title" => Ok(Self::Title),
            "season" => Ok(Self::Season),
            other => Err(format!(
                "unknown sort order {other:?} (expected newest, oldest, most_viewed, title or season)"
            )),
        }
    }
}

/// Listing filters. Unset fields do not filter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpisodeQuery {
    pub published: Option<bool>,
    pub featured: Option<bool>,
    pub season: Option<u32>,
    /// Case-insensitive substring of title or description.
    pub search: Option<String>,
    pub sort: Option<SortOrder>,
    pub limit: Option<usize>,
}

/// JSON document produced by [`EpisodeStore::export`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogBackup {
    #[serde(default)]
    pub episodes: Option<Vec<Episode>>,
    #[serde(default)]
    pub stats: Option<CatalogStats>,
    #[serde(default)]
    pub export_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenanceReport {
    /// Records dropped for lacking an id, title or video URL.
    pub removed: usize,
    pub issues: Vec<String>,
}

pub struct EpisodeStore {
    storage: Arc<dyn KeyValueStorage>,
    options: StoreOptions,
    episodes: Vec<Episode>,
    stats: CatalogStats,
    pending_write: bool,
}

impl EpisodeStore {
    /// Loads the collection from storage. A missing key yields an empty
    /// catalog; unreadable JSON is logged and also treated as empty.
    pub fn open(storage: Arc<dyn KeyValueStorage>, options: StoreOptions) -> CatalogResult<Self> {
        let episodes = read_episodes(storage.as_ref())?;
        let stats = CatalogStats::compute(&episodes, Utc::now());
        log::info!("loaded {} episodes", episodes.len());
        Ok(Self {
            storage,
            options,
            episodes,
            stats,
            pending_write: false,
        })
    }

    /// Re-reads storage, picking up writes made by another process. Skipped
    /// (returning `false`) while a local write is still pending, since the
    /// in-memory copy is newer than what storage holds.
    pub fn reload(&mut self) -> CatalogResult<bool> {
        if self.pending_write {
            log::warn!("skipping reload: local changes have not been written yet");
            return Ok(false);
        }
        self.episodes = read_episodes(self.storage.as_ref())?;
        self.stats = CatalogStats::compute(&self.episodes, Utc::now());
        Ok(true)
    }

    pub fn list(&self) -> &[Episode] {
        &self.episodes
    }

    pub fn get(&self, id: &str) -> Option<&Episode> {
        self.episodes.iter().find(|episode| episode.id == id)
    }

    pub fn stats(&self) -> &CatalogStats {
        &self.stats
    }

    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    pub fn has_pending_write(&self) -> bool {
        self.pending_write
    }

    /// Validates `draft`, resolves its video URL and prepends the new episode.
    pub fn add(&mut self, draft: EpisodeDraft) -> CatalogResult<Episode> {
        draft.validate()?;
        let title = draft.title.trim().to_string();
        self.ensure_unique(&title, draft.season, draft.number, None)?;

        let video_url = draft.video_url.trim().to_string();
        let resolution = resolve(&video_url);
        let thumbnail = non_blank(draft.thumbnail)
            .unwrap_or_else(|| resolution.thumbnail_or(&self.options.placeholder_thumbnail));
        let now = Utc::now();

        let episode = Episode {
            id: self.generate_id(now),
            title,
            description: draft.description.trim().to_string(),
            season: draft.season,
            number: draft.number,
            video_url,
            embed_url: resolution.embed_url,
            thumbnail,
            platform: resolution.platform,
            subtitle_date: Some(draft.subtitle_date.unwrap_or_else(|| now.date_naive())),
            published: draft.published.unwrap_or(true),
            featured: draft.featured.unwrap_or(false),
            allow_comments: draft.allow_comments.unwrap_or(true),
            views: 0,
            likes: 0,
            created_at: now,
            updated_at: now,
            last_viewed: None,
            tags: draft.tags,
            quality: non_blank(draft.quality).unwrap_or_else(|| DEFAULT_QUALITY.to_string()),
        };

        self.episodes.insert(0, episode.clone());
        self.persist(SyncAction::EpisodeAdded, json!({ "id": episode.id }));
        log::info!("added episode {} ({})", episode.title, episode.code());
        Ok(episode)
    }

    /// Applies `patch` to the episode with `id`. A new video URL re-runs the
    /// resolver; the derived thumbnail is replaced unless the patch sets one.
    pub fn update(&mut self, id: &str, patch: EpisodePatch) -> CatalogResult<Episode> {
        patch.validate()?;
        let index = self.index_of(id)?;

        let current = &self.episodes[index];
        let title = patch
            .title
            .as_deref()
            .map(str::trim)
            .unwrap_or(current.title.as_str())
            .to_string();
        let season = patch.season.unwrap_or(current.season);
        let number = patch.number.unwrap_or(current.number);
        self.ensure_unique(&title, season, number, Some(id))?;

        let placeholder = self.options.placeholder_thumbnail.clone();
        let episode = &mut self.episodes[index];
        episode.title = title;
        episode.season = season;
        episode.number = number;
        if let Some(description) = patch.description {
            episode.description = description.trim().to_string();
        }
        let thumbnail = non_blank(patch.thumbnail);
        if let Some(video_url) = patch.video_url {
            let video_url = video_url.trim().to_string();
            let resolution = resolve(&video_url);
            episode.embed_url = resolution.embed_url.clone();
            episode.platform = resolution.platform;
            if thumbnail.is_none() {
                episode.thumbnail = resolution.thumbnail_or(&placeholder);
            }
            episode.video_url = video_url;
        }
        if let Some(thumbnail) = thumbnail {
            episode.thumbnail = thumbnail;
        }
        if let Some(subtitle_date) = patch.subtitle_date {
            episode.subtitle_date = Some(subtitle_date);
        }
        if let Some(published) = patch.published {
            episode.published = published;
        }
        if let Some(featured) = patch.featured {
            episode.featured = featured;
        }
        if let Some(allow_comments) = patch.allow_comments {
            episode.allow_comments = allow_comments;
        }
        if let Some(tags) = patch.tags {
            episode.tags = tags;
        }
        if let Some(quality) = non_blank(patch.quality) {
            episode.quality = quality;
        }
        episode.updated_at = Utc::now();

        let updated = episode.clone();
        self.persist(SyncAction::EpisodeUpdated, json!({ "id": updated.id }));
        log::info!("updated episode {}", updated.title);
        Ok(updated)
    }

    pub fn remove(&mut self, id: &str) -> CatalogResult<Episode> {
        let index = self.index_of(id)?;
        let removed = self.episodes.remove(index);
        self.persist(SyncAction::EpisodeDeleted, json!({ "id": removed.id }));
        log::info!("removed episode {}", removed.title);
        Ok(removed)
    }

    /// Counts one playback. Views never decrease.
    pub fn increment_views(&mut self, id: &str) -> CatalogResult<Episode> {
        let index = self.index_of(id)?;
        let now = Utc::now();
        let episode = &mut self.episodes[index];
        episode.views = episode.views.saturating_add(1);
        episode.last_viewed = Some(now);
        episode.updated_at = now;
        let updated = episode.clone();
        self.persist(SyncAction::EpisodeUpdated, json!({ "id": updated.id, "views": updated.views }));
        Ok(updated)
    }

    pub fn increment_likes(&mut self, id: &str) -> CatalogResult<Episode> {
        let index = self.index_of(id)?;
        let episode = &mut self.episodes[index];
        episode.likes = episode.likes.saturating_add(1);
        episode.updated_at = Utc::now();
        let updated = episode.clone();
        self.persist(SyncAction::EpisodeUpdated, json!({ "id": updated.id, "likes": updated.likes }));
        Ok(updated)
    }

    pub fn query(&self, query: &EpisodeQuery) -> Vec<Episode> {
        let search = query
            .search
            .as_deref()
            .map(|term| term.trim().to_lowercase())
            .filter(|term| !term.is_empty());

        let mut matches: Vec<Episode> = self
            .episodes
            .iter()
            .filter(|episode| query.published.is_none_or(|wanted| episode.published == wanted))
            .filter(|episode| query.featured.is_none_or(|wanted| episode.featured == wanted))
            .filter(|episode| query.season.is_none_or(|wanted| episode.season == wanted))
            .filter(|episode| {
                search.as_deref().is_none_or(|term| {
                    episode.title.to_lowercase().contains(term)
                        || episode.description.to_lowercase().contains(term)
                })
            })
            .cloned()
            .collect();

        match query.sort {
            Some(SortOrder::Newest) => matches.sort_by_key(|episode| Reverse(episode.created_at)),
            Some(SortOrder::Oldest) => matches.sort_by_key(|episode| episode.created_at),
            Some(SortOrder::MostViewed) => matches.sort_by_key(|episode| Reverse(episode.views)),
            Some(SortOrder::Title) => matches.sort_by_key(|episode| episode.title.to_lowercase()),
            Some(SortOrder::Season) => {
                matches.sort_by_key(|episode| (episode.season, episode.number))
            }
            None => {}
        }

        if let Some(limit) = query.limit {
            matches.truncate(limit);
        }
        matches
    }

    pub fn featured(&self, limit: usize) -> Vec<Episode> {
        self.query(&EpisodeQuery {
            published: Some(true),
            featured: Some(true),
            sort: Some(SortOrder::Newest),
            limit: Some(limit),
            ..EpisodeQuery::default()
        })
    }

    pub fn recent(&self, limit: usize) -> Vec<Episode> {
        self.query(&EpisodeQuery {
            published: Some(true),
            sort: Some(SortOrder::Newest),
            limit: Some(limit),
            ..EpisodeQuery::default()
        })
    }

    pub fn popular(&self, limit: usize) -> Vec<Episode> {
        self.query(&EpisodeQuery {
            published: Some(true),
            sort: Some(SortOrder::MostViewed),
            limit: Some(limit),
            ..EpisodeQuery::default()
        })
    }

    /// Suggested (season, number) for the next episode: the episode after the
    /// highest one in the latest season, or S1E1 for an empty catalog.
    pub fn next_numbers(&self) -> (u32, u32) {
        let Some(season) = self.episodes.iter().map(|episode| episode.season).max() else {
            return (1, 1);
        };
        let number = self
            .episodes
            .iter()
            .filter(|episode| episode.season == season)
            .map(|episode| episode.number)
            .max()
            .unwrap_or(0);
        (season.max(1), number.saturating_add(1))
    }

    pub fn export(&self) -> CatalogResult<String> {
        let backup = CatalogBackup {
            episodes: Some(self.episodes.clone()),
            stats: Some(self.stats.clone()),
            export_date: Some(Utc::now()),
            version: Some(BACKUP_VERSION.to_string()),
        };
        Ok(serde_json::to_string_pretty(&backup)?)
    }

    /// Replaces the collection with the episodes of a backup produced by
    /// [`export`](Self::export). A backup without an `episodes` array leaves
    /// the catalog untouched. Returns the number of episodes imported.
    ///
    /// Embed URL and platform are re-derived from each video URL. A backup
    /// that repeats an id, a title or a season/number pair is rejected as a
    /// whole.
    pub fn import(&mut self, raw: &str) -> CatalogResult<usize> {
        let backup: CatalogBackup = serde_json::from_str(raw)?;
        let Some(mut episodes) = backup.episodes else {
            return Ok(0);
        };
        ensure_unique_backup(&episodes)?;
        for episode in &mut episodes {
            let resolution = resolve(&episode.video_url);
            if episode.thumbnail.trim().is_empty() {
                episode.thumbnail = resolution.thumbnail_or(&self.options.placeholder_thumbnail);
            }
            episode.embed_url = resolution.embed_url;
            episode.platform = resolution.platform;
        }
        let count = episodes.len();
        self.episodes = episodes;
        self.persist(SyncAction::DataImported, json!({ "episodes": count }));
        log::info!("imported {count} episodes");
        Ok(count)
    }

    /// Drops incomplete records and reports integrity problems (duplicate
    /// ids or season/number pairs) without fixing them.
    pub fn maintenance(&mut self) -> MaintenanceReport {
        let before = self.episodes.len();
        self.episodes.retain(Episode::is_complete);
        let removed = before - self.episodes.len();

        let mut issues = Vec::new();
        let mut ids: HashMap<&str, usize> = HashMap::new();
        let mut codes: HashMap<(u32, u32), usize> = HashMap::new();
        for episode in &self.episodes {
            *ids.entry(episode.id.as_str()).or_default() += 1;
            *codes.entry((episode.season, episode.number)).or_default() += 1;
        }
        let mut duplicate_ids: Vec<&str> = ids
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(id, _)| id)
            .collect();
        duplicate_ids.sort_unstable();
        issues.extend(duplicate_ids.into_iter().map(|id| format!("duplicate id: {id}")));
        let mut duplicate_codes: Vec<(u32, u32)> = codes
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .map(|(code, _)| code)
            .collect();
        duplicate_codes.sort_unstable();
        issues.extend(
            duplicate_codes
                .into_iter()
                .map(|(season, number)| format!("duplicate episode: S{season:02}E{number:02}")),
        );

        if removed > 0 {
            log::info!("removed {removed} incomplete episodes");
            self.persist(SyncAction::EpisodeDeleted, json!({ "removed": removed }));
        } else {
            self.stats = CatalogStats::compute(&self.episodes, Utc::now());
            if let Err(err) = self.stats.save(self.storage.as_ref()) {
                log::warn!("could not save stats: {err:#}");
            }
        }
        for issue in &issues {
            log::warn!("integrity issue: {issue}");
        }

        MaintenanceReport { removed, issues }
    }

    /// Retries a write that failed earlier. No-op when nothing is pending.
    pub fn flush(&mut self) -> CatalogResult<()> {
        if !self.pending_write {
            return Ok(());
        }
        self.write_episodes()?;
        self.pending_write = false;
        if let Err(err) = self.stats.save(self.storage.as_ref()) {
            log::warn!("could not save stats: {err:#}");
        }
        Ok(())
    }

    fn index_of(&self, id: &str) -> CatalogResult<usize> {
        self.episodes
            .iter()
            .position(|episode| episode.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    /// Rejects a title (case-insensitive) or season/number pair already used
    /// by an episode other than `except`.
    fn ensure_unique(
        &self,
        title: &str,
        season: u32,
        number: u32,
        except: Option<&str>,
    ) -> CatalogResult<()> {
        let title = title.to_lowercase();
        for episode in &self.episodes {
            if except == Some(episode.id.as_str()) {
                continue;
            }
            if episode.title.to_lowercase() == title {
                return Err(CatalogError::Duplicate(format!(
                    "an episode titled {:?} already exists",
                    episode.title
                )));
            }
            if episode.season == season && episode.number == number {
                return Err(CatalogError::Duplicate(format!(
                    "{} is already taken by {:?}",
                    episode.code(),
                    episode.title
                )));
            }
        }
        Ok(())
    }

    fn generate_id(&self, now: DateTime<Utc>) -> String {
        loop {
            let millis = u64::try_from(now.timestamp_millis()).unwrap_or_default();
            let id = format!("ep_{}_{}", to_base36(millis), random_suffix(9));
            if self.get(&id).is_none() {
                return id;
            }
        }
    }

    fn write_episodes(&self) -> CatalogResult<()> {
        let raw = serde_json::to_string(&self.episodes)?;
        self.storage
            .set(EPISODES_KEY, &raw)
            .map_err(CatalogError::persistence)
    }

    /// Writes the collection, the stats and a sync marker. Failures are
    /// logged; a failed collection write is remembered for [`flush`](Self::flush).
    fn persist(&mut self, action: SyncAction, data: serde_json::Value) {
        self.stats = CatalogStats::compute(&self.episodes, Utc::now());
        match self.write_episodes() {
            Ok(()) => {
                self.pending_write = false;
                log::debug!("saved {} episodes", self.episodes.len());
            }
            Err(err) => {
                self.pending_write = true;
                log::warn!("episodes kept in memory only: {err}");
                return;
            }
        }
        if let Err(err) = self.stats.save(self.storage.as_ref()) {
            log::warn!("could not save stats: {err:#}");
        }
        if let Err(err) = SyncMarker::new(action, data).publish(self.storage.as_ref()) {
            log::warn!("could not publish sync marker: {err:#}");
        }
    }
}

fn read_episodes(storage: &dyn KeyValueStorage) -> CatalogResult<Vec<Episode>> {
    let raw = storage
        .get(EPISODES_KEY)
        .map_err(CatalogError::persistence)?;
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    match serde_json::from_str(&raw) {
        Ok(episodes) => Ok(episodes),
        Err(err) => {
            log::warn!("{EPISODES_KEY} is unreadable, starting empty: {err}");
            Ok(Vec::new())
        }
    }
}

fn ensure_unique_backup(episodes: &[Episode]) -> CatalogResult<()> {
    let mut ids = HashSet::new();
    let mut titles = HashSet::new();
    let mut codes = HashSet::new();
    for episode in episodes {
        if !episode.id.is_empty() && !ids.insert(episode.id.as_str()) {
            return Err(CatalogError::Duplicate(format!(
                "backup repeats id {:?}",
                episode.id
            )));
        }
        let title = episode.title.trim().to_lowercase();
        if !title.is_empty() && !titles.insert(title) {
            return Err(CatalogError::Duplicate(format!(
                "backup repeats title {:?}",
                episode.title
            )));
        }
        if !codes.insert((episode.season, episode.number)) {
            return Err(CatalogError::Duplicate(format!(
                "backup repeats {}",
                episode.code()
            )));
        }
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".into();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8(digits).unwrap_or_default()
}

fn random_suffix(len: usize) -> String {
    (0..len)
        .map(|_| char::from(BASE36[(OsRng.next_u32() % 36) as usize]))
        .collect()
}
