#![forbid(unsafe_code)]

//! Admin command-line tool for the fansub catalog.
//!
//! Works directly on the data directory the server uses; a running server
//! notices the changes on its next sync poll. Commands that change the
//! catalog need a session created with `catalog login`.

use std::{
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use fansub_catalog::{
    config::{DEFAULT_ENV_PATH, RuntimeConfig, RuntimeOverrides, resolve_runtime_config, upsert_env_value},
    enrich::{fetch_oembed, format_duration},
    episode::{Episode, EpisodeDraft, EpisodePatch},
    render,
    resolver::{Player, resolve},
    session::{Session, SessionGate},
    storage::{FileStorage, KeyValueStorage},
    store::{EpisodeQuery, EpisodeStore, SortOrder},
};

#[derive(Parser, Debug)]
#[command(name = "catalog", version, about = "Manage the fansub episode catalog")]
struct Cli {
    /// Directory holding the catalog JSON files
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show how a video URL will be embedded
    Resolve {
        url: String,
        /// Also fetch title/duration through oEmbed
        #[arg(long)]
        enrich: bool,
    },
    /// List episodes, drafts included
    List {
        #[arg(long)]
        season: Option<u32>,
        #[arg(long)]
        featured: bool,
        /// Only published episodes
        #[arg(long, conflicts_with = "drafts")]
        published: bool,
        /// Only drafts
        #[arg(long)]
        drafts: bool,
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        sort: Option<SortOrder>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, conflicts_with = "html")]
        json: bool,
        /// Print the admin table markup instead of text
        #[arg(long)]
        html: bool,
    },
    /// Add an episode; season/number default to the next free slot
    Add {
        #[arg(long)]
        title: String,
        #[arg(long)]
        description: String,
        #[arg(long)]
        url: String,
        #[arg(long)]
        season: Option<u32>,
        #[arg(long)]
        number: Option<u32>,
        #[arg(long)]
        thumbnail: Option<String>,
        /// Subtitle release date (YYYY-MM-DD), today when omitted
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        featured: bool,
        /// Save unpublished
        #[arg(long)]
        draft: bool,
        #[arg(long = "no-comments")]
        no_comments: bool,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        quality: Option<String>,
    },
    /// Change fields of an existing episode
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        season: Option<u32>,
        #[arg(long)]
        number: Option<u32>,
        #[arg(long)]
        thumbnail: Option<String>,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long)]
        published: Option<bool>,
        #[arg(long)]
        featured: Option<bool>,
        #[arg(long)]
        comments: Option<bool>,
        /// Replaces all tags
        #[arg(long = "tag")]
        tags: Option<Vec<String>>,
        #[arg(long)]
        quality: Option<String>,
    },
    Remove {
        id: String,
    },
    Login {
        username: String,
        password: String,
        /// Keep the session for 30 days instead of 24 hours
        #[arg(long)]
        remember: bool,
    },
    Logout,
    /// Show the active session
    Whoami,
    Stats,
    /// Write a JSON backup to a file, or stdout without a path
    Export {
        path: Option<PathBuf>,
    },
    /// Replace the catalog with a backup made by `export`
    Import {
        path: PathBuf,
    },
    /// Drop incomplete records and report integrity problems
    Maintenance,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Write one CATALOG_* setting into the .env file
    Set { key: String, value: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let env_path = cli
        .env_file
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));

    if let Command::Config {
        action: ConfigAction::Set { key, value },
    } = &cli.command
    {
        upsert_env_value(&env_path, key, value)?;
        println!("{key} written to {}", env_path.display());
        return Ok(());
    }

    let config = resolve_runtime_config(RuntimeOverrides {
        data_dir: cli.data_dir.clone(),
        env_path: Some(env_path),
        ..RuntimeOverrides::default()
    })?;
    let storage: Arc<dyn KeyValueStorage> =
        Arc::new(FileStorage::open(&config.data_dir).context("opening data directory")?);
    let app = CatalogApp::new(config, storage);
    let stdout = io::stdout();
    app.run(cli.command, &mut stdout.lock())
}

struct CatalogApp {
    config: RuntimeConfig,
    storage: Arc<dyn KeyValueStorage>,
    gate: SessionGate,
}

impl CatalogApp {
    fn new(config: RuntimeConfig, storage: Arc<dyn KeyValueStorage>) -> Self {
        let gate = SessionGate::new(storage.clone(), config.credentials());
        Self {
            config,
            storage,
            gate,
        }
    }

    fn open_store(&self) -> Result<EpisodeStore> {
        EpisodeStore::open(self.storage.clone(), self.config.store_options())
            .context("loading episodes")
    }

    fn require_session(&self) -> Result<Session> {
        match self.gate.current() {
            Some(session) => Ok(session),
            None => bail!("not logged in (or session expired); run `catalog login` first"),
        }
    }

    /// The process exits right after a command, so an unsaved change would be
    /// lost; surface it as an error instead.
    fn save(store: &mut EpisodeStore) -> Result<()> {
        store.flush().context("saving catalog")
    }

    fn run(&self, command: Command, out: &mut dyn Write) -> Result<()> {
        match command {
            Command::Resolve { url, enrich } => self.resolve(&url, enrich, out),
            Command::List {
                season,
                featured,
                published,
                drafts,
                search,
                sort,
                limit,
                json,
                html,
            } => {
                let query = EpisodeQuery {
                    published: if published {
                        Some(true)
                    } else if drafts {
                        Some(false)
                    } else {
                        None
                    },
                    featured: featured.then_some(true),
                    season,
                    search,
                    sort: Some(sort.unwrap_or(SortOrder::Season)),
                    limit,
                };
                let episodes = self.open_store()?.query(&query);
                if json {
                    writeln!(out, "{}", serde_json::to_string_pretty(&episodes)?)?;
                } else if html {
                    write!(out, "{}", render::episode_table(&episodes))?;
                } else {
                    print_episodes(&episodes, out)?;
                }
                Ok(())
            }
            Command::Add {
                title,
                description,
                url,
                season,
                number,
                thumbnail,
                date,
                featured,
                draft,
                no_comments,
                tags,
                quality,
            } => {
                self.require_session()?;
                let mut store = self.open_store()?;
                let (next_season, next_number) = store.next_numbers();
                let season = season.unwrap_or(next_season);
                let number = number.unwrap_or(if season == next_season { next_number } else { 1 });
                let episode = store.add(EpisodeDraft {
                    title,
                    description,
                    season,
                    number,
                    video_url: url,
                    thumbnail,
                    subtitle_date: date,
                    published: Some(!draft),
                    featured: Some(featured),
                    allow_comments: Some(!no_comments),
                    tags,
                    quality,
                })?;
                Self::save(&mut store)?;
                writeln!(out, "Added {} {} ({})", episode.code(), episode.title, episode.id)?;
                writeln!(out, "  embed: {}", episode.embed_url)?;
                Ok(())
            }
            Command::Update {
                id,
                title,
                description,
                url,
                season,
                number,
                thumbnail,
                date,
                published,
                featured,
                comments,
                tags,
                quality,
            } => {
                self.require_session()?;
                let patch = EpisodePatch {
                    title,
                    description,
                    season,
                    number,
                    video_url: url,
                    thumbnail,
                    subtitle_date: date,
                    published,
                    featured,
                    allow_comments: comments,
                    tags,
                    quality,
                };
                if patch.is_empty() {
                    bail!("nothing to update; pass at least one field");
                }
                let mut store = self.open_store()?;
                let episode = store.update(&id, patch)?;
                Self::save(&mut store)?;
                writeln!(out, "Updated {} {}", episode.code(), episode.title)?;
                Ok(())
            }
            Command::Remove { id } => {
                self.require_session()?;
                let mut store = self.open_store()?;
                let removed = store.remove(&id)?;
                Self::save(&mut store)?;
                writeln!(out, "Removed {} {}", removed.code(), removed.title)?;
                Ok(())
            }
            Command::Login {
                username,
                password,
                remember,
            } => {
                let session = self.gate.login(&username, &password, remember)?;
                writeln!(
                    out,
                    "Logged in as {} until {}",
                    session.username,
                    format_millis(session.expires_at)
                )?;
                Ok(())
            }
            Command::Logout => {
                self.gate.logout()?;
                writeln!(out, "Logged out")?;
                Ok(())
            }
            Command::Whoami => {
                match self.gate.current() {
                    Some(session) => writeln!(
                        out,
                        "{} (expires {})",
                        session.username,
                        format_millis(session.expires_at)
                    )?,
                    None => writeln!(out, "not logged in")?,
                }
                if let Some(last) = self.gate.last_login() {
                    writeln!(out, "last login: {last}")?;
                }
                Ok(())
            }
            Command::Stats => {
                let store = self.open_store()?;
                let stats = store.stats();
                writeln!(out, "Episodes:  {}", stats.total_episodes)?;
                writeln!(out, "Published: {}", stats.published_episodes)?;
                writeln!(out, "Featured:  {}", stats.featured_episodes)?;
                writeln!(out, "Seasons:   {}", stats.unique_seasons)?;
                writeln!(out, "Recent:    {}", stats.recent_episodes)?;
                writeln!(out, "Views:     {}", stats.total_views)?;
                writeln!(out, "Likes:     {}", stats.total_likes)?;
                Ok(())
            }
            Command::Export { path } => {
                let backup = self.open_store()?.export()?;
                match path {
                    Some(path) => {
                        fs::write(&path, backup)
                            .with_context(|| format!("writing {}", path.display()))?;
                        writeln!(out, "Backup written to {}", path.display())?;
                    }
                    None => writeln!(out, "{backup}")?,
                }
                Ok(())
            }
            Command::Import { path } => {
                self.require_session()?;
                let raw = read_backup(&path)?;
                let mut store = self.open_store()?;
                let imported = store.import(&raw)?;
                Self::save(&mut store)?;
                writeln!(out, "Imported {imported} episodes")?;
                Ok(())
            }
            Command::Maintenance => {
                self.require_session()?;
                let mut store = self.open_store()?;
                let report = store.maintenance();
                Self::save(&mut store)?;
                writeln!(out, "Removed {} incomplete episodes", report.removed)?;
                if report.issues.is_empty() {
                    writeln!(out, "No integrity issues found")?;
                }
                for issue in &report.issues {
                    writeln!(out, "  ! {issue}")?;
                }
                Ok(())
            }
            Command::Config { .. } => bail!("config commands are handled before loading the catalog"),
        }
    }

    fn resolve(&self, url: &str, enrich: bool, out: &mut dyn Write) -> Result<()> {
        let resolution = resolve(url);
        let platform = resolution
            .platform
            .map(|platform| platform.label())
            .unwrap_or("none (passed through)");
        writeln!(out, "platform:  {platform}")?;
        if let Some(id) = &resolution.video_id {
            writeln!(out, "video id:  {id}")?;
        }
        writeln!(out, "embed:     {}", resolution.embed_url)?;
        writeln!(
            out,
            "thumbnail: {}",
            resolution.thumbnail_or(&self.config.placeholder_thumbnail)
        )?;
        match resolution.player() {
            Player::Iframe { .. } => writeln!(out, "player:    iframe")?,
            Player::Video { mime, .. } => writeln!(out, "player:    video ({mime})")?,
            Player::Unavailable => writeln!(out, "player:    none (not an http(s) link)")?,
        }
        if enrich || self.config.enrich {
            match fetch_oembed(url) {
                Some(info) => {
                    writeln!(out, "title:     {}", info.title)?;
                    if let Some(duration) = info.duration {
                        writeln!(out, "duration:  {}", format_duration(duration))?;
                    }
                }
                None => writeln!(out, "no oEmbed metadata available")?,
            }
        }
        Ok(())
    }
}

fn print_episodes(episodes: &[Episode], out: &mut dyn Write) -> Result<()> {
    if episodes.is_empty() {
        writeln!(out, "No episodes.")?;
        return Ok(());
    }
    for episode in episodes {
        let flags = match (episode.published, episode.featured) {
            (true, true) => "published, featured",
            (true, false) => "published",
            (false, true) => "draft, featured",
            (false, false) => "draft",
        };
        writeln!(
            out,
            "{}  {:<40}  {:>6} views  [{}]  {}",
            episode.code(),
            episode.title,
            episode.views,
            flags,
            episode.id
        )?;
    }
    Ok(())
}

fn read_backup(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn format_millis(millis: i64) -> String {
    chrono::DateTime::from_timestamp_millis(millis)
        .map(|time| time.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| millis.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fansub_catalog::storage::MemoryStorage;
    use fansub_catalog::store::EPISODES_KEY;
    use tempfile::tempdir;

    fn config() -> RuntimeConfig {
        resolve_runtime_config(RuntimeOverrides {
            env_path: Some(PathBuf::from("/nonexistent/catalog.env")),
            ..RuntimeOverrides::default()
        })
        .unwrap()
    }

    fn app() -> (Arc<MemoryStorage>, CatalogApp) {
        let storage = Arc::new(MemoryStorage::new());
        let app = CatalogApp::new(config(), storage.clone());
        (storage, app)
    }

    fn run(app: &CatalogApp, args: &[&str]) -> Result<String> {
        let cli = Cli::try_parse_from(std::iter::once("catalog").chain(args.iter().copied()))?;
        let mut out = Vec::new();
        app.run(cli.command, &mut out)?;
        Ok(String::from_utf8(out)?)
    }

    #[test]
    fn resolve_prints_embed() {
        let (_storage, app) = app();
        let output = run(&app, &["resolve", "https://youtu.be/dQw4w9WgXcQ"]).unwrap();
        assert!(output.contains("platform:  YouTube"));
        assert!(output.contains("video id:  dQw4w9WgXcQ"));
        assert!(output.contains("https://www.youtube.com/embed/dQw4w9WgXcQ?enablejsapi=1&rel=0"));
        assert!(output.contains("player:    iframe"));

        let output = run(&app, &["resolve", "https://cdn.example.com/ep.mp4"]).unwrap();
        assert!(output.contains("none (passed through)"));
        assert!(output.contains("video (video/mp4)"));
    }

    #[test]
    fn mutations_need_login() {
        let (storage, app) = app();
        let err = run(
            &app,
            &["add", "--title", "Uno", "--description", "d", "--url", "https://vimeo.com/1"],
        )
        .unwrap_err();
        assert!(err.to_string().contains("not logged in"));
        assert!(storage.get(EPISODES_KEY).unwrap().is_none());

        assert!(run(&app, &["login", "admin", "wrong"]).is_err());
        let output = run(&app, &["login", "admin", "admin123"]).unwrap();
        assert!(output.starts_with("Logged in as admin"));
        assert!(run(&app, &["whoami"]).unwrap().starts_with("admin"));

        run(&app, &["logout"]).unwrap();
        assert!(run(&app, &["whoami"]).unwrap().starts_with("not logged in"));
        assert!(run(&app, &["remove", "ep_x"]).is_err());
    }

    #[test]
    fn add_list_update_remove() {
        let (_storage, app) = app();
        run(&app, &["login", "admin", "admin123", "--remember"]).unwrap();

        let added = run(
            &app,
            &[
                "add",
                "--title",
                "Uno",
                "--description",
                "Primero",
                "--url",
                "https://www.dailymotion.com/video/x8k2l9m",
            ],
        )
        .unwrap();
        assert!(added.starts_with("Added S01E01 Uno"));
        assert!(added.contains("https://www.dailymotion.com/embed/video/x8k2l9m"));

        let second = run(
            &app,
            &[
                "add",
                "--title",
                "Dos",
                "--description",
                "Segundo",
                "--url",
                "https://vimeo.com/2",
                "--draft",
            ],
        )
        .unwrap();
        assert!(second.starts_with("Added S01E02 Dos"));

        let listed = run(&app, &["list"]).unwrap();
        let lines: Vec<&str> = listed.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("S01E01"));
        assert!(lines[1].contains("[draft]"));

        let drafts = run(&app, &["list", "--drafts", "--json"]).unwrap();
        let parsed: Vec<Episode> = serde_json::from_str(&drafts).unwrap();
        assert_eq!(parsed.len(), 1);
        let id = parsed[0].id.clone();

        let html = run(&app, &["list", "--html"]).unwrap();
        assert!(html.contains(&format!(r#"data-action="edit" data-id="{id}""#)));

        let updated = run(&app, &["update", &id, "--published", "true", "--title", "Dos!"]).unwrap();
        assert!(updated.contains("Updated S01E02 Dos!"));
        assert!(run(&app, &["update", &id]).is_err());

        run(&app, &["remove", &id]).unwrap();
        assert_eq!(run(&app, &["list"]).unwrap().lines().count(), 1);
        assert!(run(&app, &["remove", &id]).is_err());

        let stats = run(&app, &["stats"]).unwrap();
        assert!(stats.contains("Episodes:  1"));
    }

    #[test]
    fn duplicate_add_fails() {
        let (_storage, app) = app();
        run(&app, &["login", "admin", "admin123"]).unwrap();
        let args = [
            "add",
            "--title",
            "Uno",
            "--description",
            "d",
            "--url",
            "https://vimeo.com/1",
            "--season",
            "1",
            "--number",
            "1",
        ];
        run(&app, &args).unwrap();
        let err = run(&app, &args).unwrap_err();
        assert!(err.to_string().contains("duplicate episode"));
    }

    #[test]
    fn export_and_import_files() {
        let dir = tempdir().unwrap();
        let backup = dir.path().join("backup.json");
        let (_storage, app) = app();
        run(&app, &["login", "admin", "admin123"]).unwrap();
        run(
            &app,
            &["add", "--title", "Uno", "--description", "d", "--url", "https://vimeo.com/1"],
        )
        .unwrap();
        let output = run(&app, &["export", backup.to_str().unwrap()]).unwrap();
        assert!(output.starts_with("Backup written to"));

        let (_other_storage, other) = self::app();
        run(&other, &["login", "admin", "admin123"]).unwrap();
        let output = run(&other, &["import", backup.to_str().unwrap()]).unwrap();
        assert_eq!(output.trim(), "Imported 1 episodes");
        assert!(run(&other, &["list"]).unwrap().contains("Uno"));

        let report = run(&other, &["maintenance"]).unwrap();
        assert!(report.contains("No integrity issues found"));
    }

    #[test]
    fn failed_save_is_reported() {
        let storage = Arc::new(MemoryStorage::with_quota(400));
        let app = CatalogApp::new(config(), storage);
        run(&app, &["login", "admin", "admin123"]).unwrap();
        let err = run(
            &app,
            &["add", "--title", "Uno", "--description", "d", "--url", "https://vimeo.com/1"],
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("saving catalog"));
    }

    #[test]
    fn config_set_is_parsed() {
        let cli = Cli::try_parse_from(["catalog", "config", "set", "CATALOG_PORT", "9000"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Config {
                action: ConfigAction::Set { ref key, ref value }
            } if key == "CATALOG_PORT" && value == "9000"
        ));
        let cli = Cli::try_parse_from(["catalog", "list", "--sort", "most_viewed"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::List {
                sort: Some(SortOrder::MostViewed),
                ..
            }
        ));
    }
}
