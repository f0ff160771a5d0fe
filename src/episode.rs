#![forbid(unsafe_code)]

//! The episode record plus the inputs used to create and edit it.
//!
//! Field names serialize in camelCase so the stored JSON keeps the layout the
//! public site already reads (`videoUrl`, `embedUrl`, `createdAt`, ...).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CatalogError, CatalogResult};
use crate::resolver::Platform;

pub const DEFAULT_QUALITY: &str = "HD";

/// One subtitled video in the catalog.
///
/// Every field has a serde default so a partially written or hand-edited
/// record still loads; [`crate::store::EpisodeStore::maintenance`] prunes
/// records that lack an id, title or video URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub season: u32,
    #[serde(default)]
    pub number: u32,
    #[serde(default)]
    pub video_url: String,
    #[serde(default)]
    pub embed_url: String,
    #[serde(default)]
    pub thumbnail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub published: bool,
    #[serde(default)]
    pub featured: bool,
    #[serde(default = "default_true")]
    pub allow_comments: bool,
    #[serde(default)]
    pub views: u64,
    #[serde(default)]
    pub likes: u64,
    #[serde(default)]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_viewed: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_quality")]
    pub quality: String,
}

fn default_true() -> bool {
    true
}

fn default_quality() -> String {
    DEFAULT_QUALITY.to_string()
}

impl Episode {
    /// `published` or `draft`, as shown in the admin table.
    pub fn status(&self) -> &'static str {
        if self.published { "published" } else { "draft" }
    }

    /// `S01E03` style code used in listings and integrity reports.
    pub fn code(&self) -> String {
        format!("S{:02}E{:02}", self.season, self.number)
    }

    /// Records missing any of these cannot be displayed or played.
    pub fn is_complete(&self) -> bool {
        !self.id.trim().is_empty()
            && !self.title.trim().is_empty()
            && !self.video_url.trim().is_empty()
    }
}

/// Form input for a new episode. Missing fields deserialize empty so that
/// validation, not the decoder, reports them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EpisodeDraft {
    pub title: String,
    pub description: String,
    pub season: u32,
    pub number: u32,
    pub video_url: String,
    /// Overrides the thumbnail derived from the video URL.
    pub thumbnail: Option<String>,
    pub subtitle_date: Option<NaiveDate>,
    pub published: Option<bool>,
    pub featured: Option<bool>,
    pub allow_comments: Option<bool>,
    pub tags: Vec<String>,
    pub quality: Option<String>,
}

impl EpisodeDraft {
    /// Checks required fields, positive numbering and that the video URL
    /// parses. Duplicate detection needs the collection and lives in the store.
    pub fn validate(&self) -> CatalogResult<()> {
        require_text("title", &self.title)?;
        require_text("description", &self.description)?;
        require_positive("season", self.season)?;
        require_positive("number", self.number)?;
        require_url(&self.video_url)?;
        Ok(())
    }
}

/// Partial edit. `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodePatch {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub season: Option<u32>,
    #[serde(default)]
    pub number: Option<u32>,
    #[serde(default)]
    pub video_url: Option<String>,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub subtitle_date: Option<NaiveDate>,
    #[serde(default)]
    pub published: Option<bool>,
    #[serde(default)]
    pub featured: Option<bool>,
    #[serde(default)]
    pub allow_comments: Option<bool>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub quality: Option<String>,
}

impl EpisodePatch {
    pub fn validate(&self) -> CatalogResult<()> {
        if let Some(title) = &self.title {
            require_text("title", title)?;
        }
        if let Some(description) = &self.description {
            require_text("description", description)?;
        }
        if let Some(season) = self.season {
            require_positive("season", season)?;
        }
        if let Some(number) = self.number {
            require_positive("number", number)?;
        }
        if let Some(video_url) = &self.video_url {
            require_url(video_url)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

fn require_text(field: &str, value: &str) -> CatalogResult<()> {
    if value.trim().is_empty() {
        return Err(CatalogError::Validation(format!("{field} is required")));
    }
    Ok(())
}

fn require_positive(field: &str, value: u32) -> CatalogResult<()> {
    if value == 0 {
        return Err(CatalogError::Validation(format!(
            "{field} must be a positive number"
        )));
    }
    Ok(())
}

fn require_url(value: &str) -> CatalogResult<()> {
    require_text("videoUrl", value)?;
    let parsed = url::Url::parse(value.trim())
        .map_err(|err| CatalogError::Validation(format!("videoUrl is not a valid URL: {err}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(CatalogError::Validation(format!(
            "videoUrl must be an http(s) link, not {scheme}:"
        ))),
    }
}
