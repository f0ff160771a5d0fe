#![forbid(unsafe_code)]

//! HTML fragments for the public listing, the admin table and the player.
//!
//! Every piece of episode text passes through `html_escape` before it lands
//! in markup. Action buttons only carry `data-action`/`data-id` attributes;
//! wiring them up is the page script's job.

use html_escape::{encode_double_quoted_attribute as attr, encode_text as text};

use crate::episode::Episode;
use crate::resolver::{Player, Resolution, resolve};

/// Admin table body: one row per episode with edit, preview and delete
/// actions.
pub fn episode_table(episodes: &[Episode]) -> String {
    if episodes.is_empty() {
        return r#"<tr class="empty"><td colspan="7">No episodes yet.</td></tr>"#.to_string();
    }
    let mut out = String::new();
    for episode in episodes {
        let platform = episode
            .platform
            .map(|platform| platform.label())
            .unwrap_or("Direct");
        out.push_str(&format!(
            r#"<tr data-id="{id}">
  <td><img class="thumb" src="{thumb}" alt="" loading="lazy"></td>
  <td>{code}</td>
  <td>{title}</td>
  <td>{platform}</td>
  <td><span class="status status-{status}">{status}</span>{featured}</td>
  <td>{views}</td>
  <td class="actions">
    <button data-action="edit" data-id="{id}">Edit</button>
    <button data-action="preview" data-id="{id}">Preview</button>
    <button data-action="delete" data-id="{id}">Delete</button>
  </td>
</tr>
"#,
            id = attr(&episode.id),
            thumb = attr(&episode.thumbnail),
            code = episode.code(),
            title = text(&episode.title),
            platform = platform,
            status = episode.status(),
            featured = if episode.featured {
                r#" <span class="badge">featured</span>"#
            } else {
                ""
            },
            views = episode.views,
        ));
    }
    out
}

/// Public listing cards linking to the watch page.
pub fn episode_cards(episodes: &[Episode]) -> String {
    if episodes.is_empty() {
        return r#"<p class="empty">No episodes published yet.</p>"#.to_string();
    }
    let mut out = String::from(r#"<div class="episode-grid">"#);
    out.push('\n');
    for episode in episodes {
        let href = format!("/watch/{}", episode.id);
        out.push_str(&format!(
            r#"<article class="episode-card">
  <a href="{href}"><img src="{thumb}" alt="{alt}" loading="lazy"><span class="quality">{quality}</span></a>
  <h3><a href="{href}">{code} · {title}</a></h3>
  <p>{description}</p>
  <footer>{views} views · {likes} likes</footer>
</article>
"#,
            href = attr(&href),
            thumb = attr(&episode.thumbnail),
            alt = attr(&episode.title),
            quality = text(&episode.quality),
            code = episode.code(),
            title = text(&episode.title),
            description = text(&episode.description),
            views = episode.views,
            likes = episode.likes,
        ));
    }
    out.push_str("</div>\n");
    out
}

/// `<iframe>` for platform embeds and unknown web links, `<video>` for direct
/// media files. Anything else renders a notice instead of a player.
pub fn player(resolution: &Resolution) -> String {
    match resolution.player() {
        Player::Iframe { src } => format!(
            r#"<iframe class="player" src="{}" allow="autoplay; encrypted-media; fullscreen; picture-in-picture" allowfullscreen></iframe>"#,
            attr(&src)
        ),
        Player::Video { src, mime } => format!(
            r#"<video class="player" controls preload="metadata"><source src="{}" type="{}"></video>"#,
            attr(&src),
            attr(&mime)
        ),
        Player::Unavailable => {
            r#"<div class="player player-unavailable">This video cannot be played here.</div>"#
                .to_string()
        }
    }
}

/// Full watch page body for one episode. The player is re-derived from the
/// stored video URL so playback and data entry share the same mapping.
pub fn watch_page(episode: &Episode) -> String {
    let resolution = resolve(&episode.video_url);
    let body = format!(
        r#"<main class="watch">
{player}
<h1>{code} · {title}</h1>
<p class="meta">{views} views · {likes} likes</p>
<p>{description}</p>
<button data-action="like" data-id="{id}">Like</button>
<p><a href="/">Back to episodes</a></p>
</main>"#,
        player = player(&resolution),
        code = episode.code(),
        title = text(&episode.title),
        views = episode.views,
        likes = episode.likes,
        description = text(&episode.description),
        id = attr(&episode.id),
    );
    page(&episode.title, &body)
}

/// Wraps `body` in a minimal HTML document.
pub fn page(title: &str, body: &str) -> String {
    format!(
        "<!doctype html>\n<html lang=\"es\">\n<head>\n<meta charset=\"utf-8\">\n<meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n<title>{}</title>\n</head>\n<body>\n{}\n</body>\n</html>\n",
        text(title),
        body
    )
}
