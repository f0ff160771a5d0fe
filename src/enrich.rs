#![forbid(unsafe_code)]

//! Optional metadata lookup through the public oEmbed endpoints of Vimeo and
//! Dailymotion. Used to prefill the admin form; the resolver's embed and
//! thumbnail URLs are never derived from it. Every failure is swallowed and
//! reported as `None`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::form_urlencoded;

use crate::resolver::{Platform, detect_platform};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub title: String,
    pub description: Option<String>,
    /// Length in seconds, when the provider reports it.
    pub duration: Option<u64>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OEmbedResponse {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    duration: Option<u64>,
    #[serde(default)]
    thumbnail_url: Option<String>,
}

/// oEmbed endpoint for `video_url`, or `None` for platforms without one.
pub fn oembed_endpoint(video_url: &str) -> Option<String> {
    let encoded: String = form_urlencoded::byte_serialize(video_url.trim().as_bytes()).collect();
    match detect_platform(video_url)? {
        Platform::Vimeo => Some(format!("https://vimeo.com/api/oembed.json?url={encoded}")),
        Platform::Dailymotion => Some(format!(
            "https://www.dailymotion.com/services/oembed?url={encoded}&format=json"
        )),
        _ => None,
    }
}

/// Parses an oEmbed JSON body. A response without a title is useless to the
/// form and yields `None`.
pub fn parse_oembed(body: &str) -> Option<VideoInfo> {
    let response: OEmbedResponse = serde_json::from_str(body).ok()?;
    let title = response.title.filter(|title| !title.trim().is_empty())?;
    Some(VideoInfo {
        title,
        description: response.description.filter(|text| !text.trim().is_empty()),
        duration: response.duration,
        thumbnail: response.thumbnail_url,
    })
}

/// Blocking lookup. Returns `None` for unsupported platforms, network errors,
/// non-success statuses and unparsable bodies alike.
pub fn fetch_oembed(video_url: &str) -> Option<VideoInfo> {
    let endpoint = oembed_endpoint(video_url)?;
    let agent = ureq::AgentBuilder::new().timeout(REQUEST_TIMEOUT).build();
    let body = match agent.get(&endpoint).call() {
        Ok(response) => match response.into_string() {
            Ok(body) => body,
            Err(err) => {
                log::debug!("reading oEmbed response from {endpoint} failed: {err}");
                return None;
            }
        },
        Err(err) => {
            log::debug!("oEmbed request to {endpoint} failed: {err}");
            return None;
        }
    };
    let info = parse_oembed(&body);
    if info.is_none() {
        log::debug!("oEmbed response from {endpoint} had no usable metadata");
    }
    info
}

/// `m:ss`, or `h:mm:ss` from one hour up.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes}:{secs:02}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_exist_only_for_oembed_platforms() {
        assert_eq!(
            oembed_endpoint("https://vimeo.com/76979871").as_deref(),
            Some("https://vimeo.com/api/oembed.json?url=https%3A%2F%2Fvimeo.com%2F76979871")
        );
        assert_eq!(
            oembed_endpoint("https://www.dailymotion.com/video/x8k2l9m").as_deref(),
            Some(
                "https://www.dailymotion.com/services/oembed?url=https%3A%2F%2Fwww.dailymotion.com%2Fvideo%2Fx8k2l9m&format=json"
            )
        );
        assert!(oembed_endpoint("https://youtu.be/dQw4w9WgXcQ").is_none());
        assert!(oembed_endpoint("https://example.com/a.mp4").is_none());
    }

    #[test]
    fn parses_vimeo_style_body() {
        let body = r#"{
            "type": "video",
            "title": "Episodio 1",
            "description": "",
            "duration": 1325,
            "thumbnail_url": "https://i.vimeocdn.com/video/1_640.jpg"
        }"#;
        let info = parse_oembed(body).unwrap();
        assert_eq!(info.title, "Episodio 1");
        assert_eq!(info.description, None);
        assert_eq!(info.duration, Some(1325));
        assert_eq!(
            info.thumbnail.as_deref(),
            Some("https://i.vimeocdn.com/video/1_640.jpg")
        );
    }

    #[test]
    fn rejects_bodies_without_title() {
        assert!(parse_oembed(r#"{"type":"video"}"#).is_none());
        assert!(parse_oembed(r#"{"title":"   "}"#).is_none());
        assert!(parse_oembed("<html>").is_none());
    }

    #[test]
    fn unsupported_platform_skips_network() {
        assert!(fetch_oembed("https://archive.org/details/some-item").is_none());
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(0), "0:00");
        assert_eq!(format_duration(65), "1:05");
        assert_eq!(format_duration(3725), "1:02:05");
    }
}
