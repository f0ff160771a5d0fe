#![forbid(unsafe_code)]

//! Maps user-facing video links onto embeddable player URLs.
//!
//! Resolution is a pure string/regex mapping: the same input always yields the
//! same [`Resolution`] and nothing here performs I/O. Unrecognized inputs are
//! passed through untouched on the assumption that they already point at
//! something playable (a direct media file or a pre-formed embed link).
//!
//! Each rule in [`RULES`] is tried in isolation and the first match wins. The
//! patterns are written so that no real URL matches two of them.

use std::fmt;
use std::sync::LazyLock;

use mime_guess::mime;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Video hosting services the resolver knows how to embed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    #[serde(rename = "youtube")]
    YouTube,
    Vimeo,
    Dailymotion,
    GoogleDrive,
    Archive,
    Streamable,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::YouTube => "youtube",
            Self::Vimeo => "vimeo",
            Self::Dailymotion => "dailymotion",
            Self::GoogleDrive => "google_drive",
            Self::Archive => "archive",
            Self::Streamable => "streamable",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::YouTube => "YouTube",
            Self::Vimeo => "Vimeo",
            Self::Dailymotion => "Dailymotion",
            Self::GoogleDrive => "Google Drive",
            Self::Archive => "Archive.org",
            Self::Streamable => "Streamable",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of resolving one URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    /// `None` when no rule matched and `embed_url` is the input verbatim.
    pub platform: Option<Platform>,
    pub video_id: Option<String>,
    pub embed_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_url: Option<String>,
}

/// What the public page should render for a resolved URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Player {
    Iframe { src: String },
    Video { src: String, mime: String },
    /// The link is not an http(s) resource and must not reach the page.
    Unavailable,
}

impl Resolution {
    /// Thumbnail URL, or the configured placeholder when none is derivable.
    pub fn thumbnail_or(&self, placeholder: &str) -> String {
        self.thumbnail_url
            .clone()
            .unwrap_or_else(|| placeholder.to_string())
    }

    /// Recognized platforms always play through their iframe player. A
    /// pass-through URL becomes a `<video>` source when its path carries a
    /// known audio/video extension and an iframe otherwise. Pass-through
    /// links with any scheme but http(s) are [`Player::Unavailable`].
    pub fn player(&self) -> Player {
        if self.platform.is_none() {
            if !is_web_url(&self.embed_url) {
                return Player::Unavailable;
            }
            if let Some(mime) = media_mime(&self.embed_url) {
                return Player::Video {
                    src: self.embed_url.clone(),
                    mime,
                };
            }
        }
        Player::Iframe {
            src: self.embed_url.clone(),
        }
    }
}

/// How a rule pulls the identifier out of the input.
enum Extract {
    /// The named `id` capture group of the rule's pattern.
    Capture,
    /// Everything after the final `/`, taken verbatim. dai.ly links are
    /// resolved this way without any validation, so `https://dai.ly/x1?a=b`
    /// produces the id `x1?a=b`. Inputs in the wild vary too much to reject.
    LastSegment,
}

struct Rule {
    platform: Platform,
    pattern: Regex,
    extract: Extract,
    embed: fn(&str) -> String,
    thumbnail: Option<fn(&str) -> String>,
}

impl Rule {
    fn new(
        platform: Platform,
        pattern: &str,
        extract: Extract,
        embed: fn(&str) -> String,
        thumbnail: Option<fn(&str) -> String>,
    ) -> Self {
        Self {
            platform,
            // Patterns are literals defined below; a failure here is a
            // programming error caught by the test suite.
            pattern: Regex::new(pattern).unwrap_or_else(|err| panic!("bad resolver rule: {err}")),
            extract,
            embed,
            thumbnail,
        }
    }

    fn apply(&self, input: &str) -> Option<Resolution> {
        let id = match self.extract {
            Extract::Capture => self.pattern.captures(input)?.name("id")?.as_str(),
            Extract::LastSegment => {
                if !self.pattern.is_match(input) {
                    return None;
                }
                input.rsplit('/').next().unwrap_or_default()
            }
        };
        Some(Resolution {
            platform: Some(self.platform),
            video_id: Some(id.to_string()),
            embed_url: (self.embed)(id),
            thumbnail_url: self.thumbnail.map(|thumbnail| thumbnail(id)),
        })
    }
}

static RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    vec![
        // watch?v=, youtu.be/, embed/, v/, e/ and /<anything>/.../<id> forms.
        // The id is exactly 11 characters, so a longer token does not match.
        Rule::new(
            Platform::YouTube,
            r#"(?i)(?:youtube\.com/(?:[^/]+/.+/|(?:v|e(?:mbed)?)/|.*[?&]v=)|youtu\.be/)(?P<id>[A-Za-z0-9_-]{11})(?:[^A-Za-z0-9_-]|$)"#,
            Extract::Capture,
            youtube_embed,
            Some(youtube_thumbnail),
        ),
        Rule::new(
            Platform::Dailymotion,
            r"(?i)(?:^|[/.])dai\.ly/",
            Extract::LastSegment,
            dailymotion_embed,
            None,
        ),
        Rule::new(
            Platform::Dailymotion,
            r"(?i)dailymotion\.com/(?:embed/)?video/(?P<id>[A-Za-z0-9]+)",
            Extract::Capture,
            dailymotion_embed,
            Some(dailymotion_thumbnail),
        ),
        Rule::new(
            Platform::Vimeo,
            r"(?i)vimeo\.com/(?:channels/(?:\w+/)?|groups/[^/]*/videos/|album/\d+/video/|video/)?(?P<id>\d+)(?:$|[/?#])",
            Extract::Capture,
            vimeo_embed,
            None,
        ),
        Rule::new(
            Platform::GoogleDrive,
            r"(?i)drive\.google\.com/file/d/(?P<id>[^/?&#\s]+)",
            Extract::Capture,
            drive_embed,
            None,
        ),
        Rule::new(
            Platform::Archive,
            r"(?i)archive\.org/(?:details|embed)/(?P<id>[^/?&#\s]+)",
            Extract::Capture,
            archive_embed,
            None,
        ),
        Rule::new(
            Platform::Streamable,
            r"(?i)streamable\.com/(?:e/)?(?P<id>[A-Za-z0-9]+)",
            Extract::Capture,
            streamable_embed,
            None,
        ),
    ]
});

fn youtube_embed(id: &str) -> String {
    format!("https://www.youtube.com/embed/{id}?enablejsapi=1&rel=0")
}

fn youtube_thumbnail(id: &str) -> String {
    format!("https://img.youtube.com/vi/{id}/mqdefault.jpg")
}

fn dailymotion_embed(id: &str) -> String {
    format!("https://www.dailymotion.com/embed/video/{id}")
}

fn dailymotion_thumbnail(id: &str) -> String {
    format!("https://www.dailymotion.com/thumbnail/video/{id}")
}

fn vimeo_embed(id: &str) -> String {
    format!("https://player.vimeo.com/video/{id}")
}

fn drive_embed(id: &str) -> String {
    format!("https://drive.google.com/file/d/{id}/preview")
}

fn archive_embed(id: &str) -> String {
    format!("https://archive.org/embed/{id}")
}

fn streamable_embed(id: &str) -> String {
    format!("https://streamable.com/e/{id}")
}

/// Resolves `input` to an embeddable player URL. Never fails: when nothing
/// matches, the input comes back unchanged with `platform = None`.
pub fn resolve(input: &str) -> Resolution {
    RULES
        .iter()
        .find_map(|rule| rule.apply(input))
        .unwrap_or_else(|| Resolution {
            platform: None,
            video_id: None,
            embed_url: input.to_string(),
            thumbnail_url: None,
        })
}

pub fn detect_platform(input: &str) -> Option<Platform> {
    resolve(input).platform
}

/// True for absolute `http`/`https` URLs.
pub fn is_web_url(raw: &str) -> bool {
    url::Url::parse(raw.trim())
        .is_ok_and(|parsed| matches!(parsed.scheme(), "http" | "https"))
}

/// Returns the audio/video MIME type implied by the URL's path extension.
fn media_mime(raw: &str) -> Option<String> {
    let path = match url::Url::parse(raw) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => raw
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_string(),
    };
    let guess = mime_guess::from_path(path).first()?;
    if guess.type_() == mime::VIDEO || guess.type_() == mime::AUDIO {
        Some(guess.essence_str().to_string())
    } else {
        None
    }
}
