#![forbid(unsafe_code)]

//! Axum server for the fansub catalog.
//!
//! The public side renders the published episodes and a watch page per
//! episode; everything the site's scripts need is also exposed as JSON. The
//! admin side is a JSON API gated by the session token returned from
//! `/api/admin/login`, sent back in the `X-Admin-Session` header.
//!
//! A background task polls the shared data directory so edits made through
//! the `catalog` CLI (or another server) show up without a restart.

use std::{net::IpAddr, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::Utc;
use clap::Parser;
use fansub_catalog::{
    config::{RuntimeOverrides, resolve_runtime_config},
    enrich::{VideoInfo, fetch_oembed},
    episode::{Episode, EpisodeDraft, EpisodePatch},
    error::CatalogError,
    render,
    resolver::{Player, Resolution, resolve},
    session::{Session, SessionGate},
    stats::CatalogStats,
    storage::{FileStorage, KeyValueStorage},
    store::{EPISODES_KEY, EpisodeQuery, EpisodeStore, MaintenanceReport, SortOrder},
    sync::{ChangeDetector, SyncMarker},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::signal;

const ADMIN_HEADER: &str = "x-admin-session";

/// How long a sync marker written by this process stays visible to others.
const MARKER_TTL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "server", version, about = "Fansub episode catalog: public site and admin API")]
struct ServerArgs {
    /// Directory holding the catalog JSON files
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    /// Seconds between checks for changes written by other processes
    #[arg(long)]
    sync_interval: Option<u64>,
    /// Allow oEmbed lookups from /api/resolve
    #[arg(long)]
    enrich: bool,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl ServerArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            data_dir: self.data_dir.clone(),
            host: self.host.clone(),
            port: self.port,
            sync_interval_secs: self.sync_interval,
            enrich: self.enrich.then_some(true),
            env_path: self.env_file.clone(),
        }
    }
}

/// Shared handler state. The store is the only mutable piece; its lock is
/// never held across an `.await`.
#[derive(Clone)]
struct AppState {
    store: Arc<RwLock<EpisodeStore>>,
    gate: Arc<SessionGate>,
    storage: Arc<dyn KeyValueStorage>,
    enrich: bool,
}

impl AppState {
    fn new(store: EpisodeStore, gate: SessionGate, storage: Arc<dyn KeyValueStorage>, enrich: bool) -> Self {
        Self {
            store: Arc::new(RwLock::new(store)),
            gate: Arc::new(gate),
            storage,
            enrich,
        }
    }

    fn require_admin(&self, headers: &HeaderMap) -> ApiResult<Session> {
        let token = headers
            .get(ADMIN_HEADER)
            .and_then(|value| value.to_str().ok())
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ApiError::unauthorized("admin session required"))?;
        Ok(self.gate.authorize(token)?)
    }

    /// Removes our sync marker once other processes had a chance to see it.
    fn schedule_marker_clear(&self) {
        let storage = self.storage.clone();
        tokio::spawn(async move {
            tokio::time::sleep(MARKER_TTL).await;
            if let Err(err) = SyncMarker::clear_own(storage.as_ref()) {
                log::debug!("could not clear sync marker: {err:#}");
            }
        });
    }

    /// One polling round: looks for a new foreign marker, checks the stored
    /// episodes for changes and reloads when either fired. Markers are left
    /// in place for their writer to clear.
    fn sync_once(&self, detector: &mut ChangeDetector) -> Result<bool> {
        let marker = SyncMarker::read(self.storage.as_ref())?
            .filter(|marker| detector.observe_marker(marker));
        let changed = detector.poll(self.storage.as_ref())?;
        if marker.is_none() && !changed {
            return Ok(false);
        }
        if let Some(marker) = &marker {
            log::debug!(
                "sync marker {:?} from {} at {}",
                marker.action,
                marker.origin,
                marker.timestamp
            );
        }
        let reloaded = self.store.write().reload()?;
        if reloaded {
            log::info!("reloaded catalog after external change");
        }
        Ok(reloaded)
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<CatalogError> for ApiError {
    fn from(err: CatalogError) -> Self {
        let status = match &err {
            CatalogError::Validation(_) => StatusCode::BAD_REQUEST,
            CatalogError::Duplicate(_) => StatusCode::CONFLICT,
            CatalogError::NotFound(_) => StatusCode::NOT_FOUND,
            CatalogError::Auth(_) => StatusCode::UNAUTHORIZED,
            CatalogError::Persistence(_) | CatalogError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = ServerArgs::parse();
    let config = resolve_runtime_config(args.overrides())?;

    let storage: Arc<dyn KeyValueStorage> =
        Arc::new(FileStorage::open(&config.data_dir).context("opening data directory")?);
    let store = EpisodeStore::open(storage.clone(), config.store_options())
        .context("loading episodes")?;
    let gate = SessionGate::new(storage.clone(), config.credentials());
    let state = AppState::new(store, gate, storage, config.enrich);

    tokio::spawn(sync_loop(
        state.clone(),
        Duration::from_secs(config.sync_interval_secs),
    ));

    let host: IpAddr = config
        .host
        .parse()
        .with_context(|| format!("invalid listen host {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    log::info!(
        "catalog server listening on http://{} (data in {})",
        addr,
        config.data_dir.display()
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running catalog server")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/watch/{id}", get(watch))
        .route("/api/episodes", get(list_episodes))
        .route("/api/episodes/{id}", get(get_episode))
        .route("/api/episodes/{id}/like", post(like_episode))
        .route("/api/stats", get(get_stats))
        .route("/api/resolve", get(resolve_url))
        .route("/api/admin/login", post(admin_login))
        .route("/api/admin/logout", post(admin_logout))
        .route(
            "/api/admin/episodes",
            get(admin_list_episodes).post(admin_create_episode),
        )
        .route("/api/admin/episodes/table", get(admin_episode_table))
        .route(
            "/api/admin/episodes/{id}",
            put(admin_update_episode).delete(admin_delete_episode),
        )
        .route("/api/admin/maintenance", post(admin_maintenance))
        .route("/api/admin/export", get(admin_export))
        .route("/api/admin/import", post(admin_import))
        .route("/api/admin/next-numbers", get(admin_next_numbers))
        .fallback(fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        log::error!("failed to install Ctrl+C handler: {err}");
    }
}

async fn sync_loop(state: AppState, every: Duration) {
    let mut detector = ChangeDetector::new(EPISODES_KEY);
    if let Err(err) = detector.poll(state.storage.as_ref()) {
        log::warn!("initial sync poll failed: {err:#}");
    }
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(err) = state.sync_once(&mut detector) {
            log::warn!("sync poll failed: {err:#}");
        }
    }
}

async fn fallback() -> ApiError {
    ApiError::not_found("endpoint not found")
}

// ---- public pages ----

async fn index(State(state): State<AppState>) -> Html<String> {
    let (featured, recent) = {
        let store = state.store.read();
        (store.featured(6), store.recent(usize::MAX))
    };
    let mut body = String::from("<main>\n");
    if !featured.is_empty() {
        body.push_str("<h2>Featured</h2>\n");
        body.push_str(&render::episode_cards(&featured));
    }
    body.push_str("<h2>Episodes</h2>\n");
    body.push_str(&render::episode_cards(&recent));
    body.push_str("</main>");
    Html(render::page("Episodes", &body))
}

async fn watch(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Html<String>> {
    let episode = {
        let mut store = state.store.write();
        published(store.get(&id), &id)?;
        store.increment_views(&id)?
    };
    state.schedule_marker_clear();
    Ok(Html(render::watch_page(&episode)))
}

/// Drafts are invisible on the public side.
fn published(episode: Option<&Episode>, id: &str) -> ApiResult<Episode> {
    episode
        .filter(|episode| episode.published)
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("episode not found: {id}")))
}

// ---- public JSON ----

async fn list_episodes(
    State(state): State<AppState>,
    Query(mut query): Query<EpisodeQuery>,
) -> Json<Vec<Episode>> {
    query.published = Some(true);
    if query.sort.is_none() {
        query.sort = Some(SortOrder::Newest);
    }
    Json(state.store.read().query(&query))
}

async fn get_episode(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Episode>> {
    let store = state.store.read();
    Ok(Json(published(store.get(&id), &id)?))
}

async fn like_episode(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Episode>> {
    let episode = {
        let mut store = state.store.write();
        published(store.get(&id), &id)?;
        store.increment_likes(&id)?
    };
    state.schedule_marker_clear();
    Ok(Json(episode))
}

async fn get_stats(State(state): State<AppState>) -> Json<CatalogStats> {
    Json(state.store.read().stats().clone())
}

#[derive(Debug, Deserialize)]
struct ResolveParams {
    url: String,
    #[serde(default)]
    enrich: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ResolveResponse {
    #[serde(flatten)]
    resolution: Resolution,
    platform_label: Option<&'static str>,
    /// `iframe` or `video`.
    player: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    info: Option<VideoInfo>,
}

/// Preview used by the admin form while typing a URL. oEmbed enrichment
/// runs only when the server allows it.
async fn resolve_url(
    State(state): State<AppState>,
    Query(params): Query<ResolveParams>,
) -> ApiResult<Json<ResolveResponse>> {
    let url = params.url.trim().to_string();
    if url.is_empty() {
        return Err(ApiError::bad_request("url is required"));
    }
    let resolution = resolve(&url);
    let player = match resolution.player() {
        Player::Iframe { .. } => "iframe",
        Player::Video { .. } => "video",
        Player::Unavailable => "unavailable",
    };
    let info = if state.enrich && params.enrich.unwrap_or(true) {
        tokio::task::spawn_blocking(move || fetch_oembed(&url))
            .await
            .map_err(|err| ApiError::internal(format!("enrichment task failed: {err}")))?
    } else {
        None
    };
    Ok(Json(ResolveResponse {
        platform_label: resolution.platform.map(|platform| platform.label()),
        resolution,
        player,
        info,
    }))
}

// ---- admin ----

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest {
    username: String,
    password: String,
    #[serde(default)]
    remember_me: bool,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    session: Session,
}

async fn admin_login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<LoginResponse>> {
    let session = state
        .gate
        .login(&request.username, &request.password, request.remember_me)?;
    Ok(Json(LoginResponse {
        token: session.token()?,
        session,
    }))
}

async fn admin_logout(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<StatusCode> {
    state.require_admin(&headers)?;
    state.gate.logout()?;
    Ok(StatusCode::NO_CONTENT)
}

async fn admin_list_episodes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EpisodeQuery>,
) -> ApiResult<Json<Vec<Episode>>> {
    state.require_admin(&headers)?;
    Ok(Json(state.store.read().query(&query)))
}

async fn admin_episode_table(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<EpisodeQuery>,
) -> ApiResult<Html<String>> {
    state.require_admin(&headers)?;
    let episodes = state.store.read().query(&query);
    Ok(Html(render::episode_table(&episodes)))
}

async fn admin_create_episode(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(draft): Json<EpisodeDraft>,
) -> ApiResult<(StatusCode, Json<Episode>)> {
    state.require_admin(&headers)?;
    let episode = {
        let mut store = state.store.write();
        let episode = store.add(draft)?;
        store.flush()?;
        episode
    };
    state.schedule_marker_clear();
    Ok((StatusCode::CREATED, Json(episode)))
}

async fn admin_update_episode(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<EpisodePatch>,
) -> ApiResult<Json<Episode>> {
    state.require_admin(&headers)?;
    if patch.is_empty() {
        return Err(ApiError::bad_request("no changes supplied"));
    }
    let episode = {
        let mut store = state.store.write();
        let episode = store.update(&id, patch)?;
        store.flush()?;
        episode
    };
    state.schedule_marker_clear();
    Ok(Json(episode))
}

async fn admin_delete_episode(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Episode>> {
    state.require_admin(&headers)?;
    let removed = {
        let mut store = state.store.write();
        let removed = store.remove(&id)?;
        store.flush()?;
        removed
    };
    state.schedule_marker_clear();
    Ok(Json(removed))
}

async fn admin_maintenance(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<MaintenanceReport>> {
    state.require_admin(&headers)?;
    let report = {
        let mut store = state.store.write();
        let report = store.maintenance();
        store.flush()?;
        report
    };
    state.schedule_marker_clear();
    Ok(Json(report))
}

async fn admin_export(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    state.require_admin(&headers)?;
    let backup = state.store.read().export()?;
    let filename = format!("catalog-backup-{}.json", Utc::now().format("%Y-%m-%d"));
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        backup,
    )
        .into_response())
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    imported: usize,
}

async fn admin_import(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<ImportResponse>> {
    state.require_admin(&headers)?;
    let imported = {
        let mut store = state.store.write();
        let imported = store.import(&body).map_err(|err| match err {
            CatalogError::Serialization(err) => {
                ApiError::bad_request(format!("backup is not valid JSON: {err}"))
            }
            other => other.into(),
        })?;
        store.flush()?;
        imported
    };
    state.schedule_marker_clear();
    Ok(Json(ImportResponse { imported }))
}

#[derive(Debug, Serialize)]
struct NextNumbers {
    season: u32,
    number: u32,
}

async fn admin_next_numbers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<NextNumbers>> {
    state.require_admin(&headers)?;
    let (season, number) = state.store.read().next_numbers();
    Ok(Json(NextNumbers { season, number }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::to_bytes, extract::State as AxumState, http::HeaderValue};
    use fansub_catalog::{
        session::Credentials,
        storage::MemoryStorage,
        store::StoreOptions,
        sync::{SYNC_KEY, SyncAction},
    };
    use serde_json::Value;

    struct ServerTestContext {
        storage: Arc<MemoryStorage>,
        state: AppState,
    }

    impl ServerTestContext {
        fn new() -> Self {
            let storage = Arc::new(MemoryStorage::new());
            let store = EpisodeStore::open(storage.clone(), StoreOptions::default()).unwrap();
            let gate = SessionGate::new(storage.clone(), Credentials::new("admin", "admin123"));
            Self {
                state: AppState::new(store, gate, storage.clone(), false),
                storage,
            }
        }

        async fn admin_headers(&self) -> HeaderMap {
            let Json(login) = admin_login(
                AxumState(self.state.clone()),
                Json(LoginRequest {
                    username: "admin".into(),
                    password: "admin123".into(),
                    remember_me: false,
                }),
            )
            .await
            .unwrap();
            let mut headers = HeaderMap::new();
            headers.insert(ADMIN_HEADER, HeaderValue::from_str(&login.token).unwrap());
            headers
        }

        async fn create(&self, headers: &HeaderMap, draft: EpisodeDraft) -> Episode {
            let (status, Json(episode)) = admin_create_episode(
                AxumState(self.state.clone()),
                headers.clone(),
                Json(draft),
            )
            .await
            .unwrap();
            assert_eq!(status, StatusCode::CREATED);
            episode
        }
    }

    fn draft(title: &str, number: u32, published: bool) -> EpisodeDraft {
        EpisodeDraft {
            title: title.into(),
            description: "desc".into(),
            season: 1,
            number,
            video_url: format!("https://vimeo.com/{number}"),
            published: Some(published),
            ..EpisodeDraft::default()
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn admin_routes_require_session() {
        let ctx = ServerTestContext::new();
        let err = admin_create_episode(
            AxumState(ctx.state.clone()),
            HeaderMap::new(),
            Json(draft("Uno", 1, true)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);

        let mut forged = HeaderMap::new();
        forged.insert(ADMIN_HEADER, HeaderValue::from_static("bm90IGpzb24="));
        let err = admin_next_numbers(AxumState(ctx.state.clone()), forged)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn bad_login_is_unauthorized() {
        let ctx = ServerTestContext::new();
        let err = admin_login(
            AxumState(ctx.state.clone()),
            Json(LoginRequest {
                username: "admin".into(),
                password: "nope".into(),
                remember_me: true,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        let body = body_json(err.into_response()).await;
        assert!(body["error"].as_str().unwrap().contains("invalid username"));
    }

    #[tokio::test]
    async fn logout_revokes_token() {
        let ctx = ServerTestContext::new();
        let headers = ctx.admin_headers().await;
        let status = admin_logout(AxumState(ctx.state.clone()), headers.clone())
            .await
            .unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);
        let err = admin_next_numbers(AxumState(ctx.state.clone()), headers)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn public_side_hides_drafts() {
        let ctx = ServerTestContext::new();
        let headers = ctx.admin_headers().await;
        let visible = ctx.create(&headers, draft("Uno", 1, true)).await;
        let hidden = ctx.create(&headers, draft("Dos", 2, false)).await;

        let Json(listed) =
            list_episodes(AxumState(ctx.state.clone()), Query(EpisodeQuery::default())).await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, visible.id);

        let err = get_episode(AxumState(ctx.state.clone()), Path(hidden.id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        let err = watch(AxumState(ctx.state.clone()), Path(hidden.id.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let Json(all) = admin_list_episodes(
            AxumState(ctx.state.clone()),
            headers.clone(),
            Query(EpisodeQuery::default()),
        )
        .await
        .unwrap();
        assert_eq!(all.len(), 2);

        let Html(table) = admin_episode_table(
            AxumState(ctx.state.clone()),
            headers,
            Query(EpisodeQuery::default()),
        )
        .await
        .unwrap();
        assert!(table.contains(&format!(r#"data-action="delete" data-id="{}""#, hidden.id)));

        let Html(home) = index(AxumState(ctx.state.clone())).await;
        assert!(home.contains("Uno"));
        assert!(!home.contains("Dos"));
    }

    #[tokio::test]
    async fn watch_and_like_bump_counters() {
        let ctx = ServerTestContext::new();
        let headers = ctx.admin_headers().await;
        let episode = ctx.create(&headers, draft("Uno", 1, true)).await;

        let Html(page) = watch(AxumState(ctx.state.clone()), Path(episode.id.clone()))
            .await
            .unwrap();
        assert!(page.contains("https://player.vimeo.com/video/1"));
        assert!(page.contains("1 views"));

        let Json(liked) = like_episode(AxumState(ctx.state.clone()), Path(episode.id.clone()))
            .await
            .unwrap();
        assert_eq!(liked.likes, 1);
        assert_eq!(liked.views, 1);

        let Json(stats) = get_stats(AxumState(ctx.state.clone())).await;
        assert_eq!(stats.total_views, 1);
        assert_eq!(stats.total_likes, 1);
    }

    #[tokio::test]
    async fn catalog_errors_map_to_statuses() {
        let ctx = ServerTestContext::new();
        let headers = ctx.admin_headers().await;
        let episode = ctx.create(&headers, draft("Uno", 1, true)).await;

        let err = admin_create_episode(
            AxumState(ctx.state.clone()),
            headers.clone(),
            Json(draft("uno", 2, true)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::CONFLICT);

        let err = admin_create_episode(
            AxumState(ctx.state.clone()),
            headers.clone(),
            Json(EpisodeDraft::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = admin_update_episode(
            AxumState(ctx.state.clone()),
            headers.clone(),
            Path(episode.id.clone()),
            Json(EpisodePatch::default()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);

        let err = admin_delete_episode(
            AxumState(ctx.state.clone()),
            headers.clone(),
            Path("ghost".into()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);

        let Json(removed) = admin_delete_episode(
            AxumState(ctx.state.clone()),
            headers,
            Path(episode.id.clone()),
        )
        .await
        .unwrap();
        assert_eq!(removed.id, episode.id);
    }

    #[tokio::test]
    async fn update_changes_embed() {
        let ctx = ServerTestContext::new();
        let headers = ctx.admin_headers().await;
        let episode = ctx.create(&headers, draft("Uno", 1, true)).await;
        let Json(updated) = admin_update_episode(
            AxumState(ctx.state.clone()),
            headers,
            Path(episode.id),
            Json(EpisodePatch {
                video_url: Some("https://youtu.be/dQw4w9WgXcQ".into()),
                ..EpisodePatch::default()
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            updated.embed_url,
            "https://www.youtube.com/embed/dQw4w9WgXcQ?enablejsapi=1&rel=0"
        );
    }

    #[tokio::test]
    async fn resolve_endpoint_reports_player() {
        let ctx = ServerTestContext::new();
        let Json(response) = resolve_url(
            AxumState(ctx.state.clone()),
            Query(ResolveParams {
                url: "https://dai.ly/x7abc12".into(),
                enrich: None,
            }),
        )
        .await
        .unwrap();
        assert_eq!(
            response.resolution.embed_url,
            "https://www.dailymotion.com/embed/video/x7abc12"
        );
        assert_eq!(response.player, "iframe");
        assert_eq!(response.platform_label, Some("Dailymotion"));
        assert!(response.info.is_none());

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["embedUrl"], "https://www.dailymotion.com/embed/video/x7abc12");
        assert_eq!(value["platform"], "dailymotion");

        let Json(direct) = resolve_url(
            AxumState(ctx.state.clone()),
            Query(ResolveParams {
                url: "https://cdn.example.com/ep.webm".into(),
                enrich: Some(true),
            }),
        )
        .await
        .unwrap();
        assert_eq!(direct.player, "video");
        assert!(direct.resolution.platform.is_none());

        let err = resolve_url(
            AxumState(ctx.state.clone()),
            Query(ResolveParams {
                url: "  ".into(),
                enrich: None,
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn export_then_import_round_trip() {
        let ctx = ServerTestContext::new();
        let headers = ctx.admin_headers().await;
        ctx.create(&headers, draft("Uno", 1, true)).await;
        ctx.create(&headers, draft("Dos", 2, true)).await;

        let response = admin_export(AxumState(ctx.state.clone()), headers.clone())
            .await
            .unwrap();
        assert!(
            response
                .headers()
                .get(header::CONTENT_DISPOSITION)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("attachment; filename=\"catalog-backup-")
        );
        let backup = body_json(response).await;
        assert_eq!(backup["episodes"].as_array().unwrap().len(), 2);

        let other = ServerTestContext::new();
        let other_headers = other.admin_headers().await;
        let Json(imported) = admin_import(
            AxumState(other.state.clone()),
            other_headers.clone(),
            backup.to_string(),
        )
        .await
        .unwrap();
        assert_eq!(imported.imported, 2);

        let Json(next) = admin_next_numbers(AxumState(other.state.clone()), other_headers.clone())
            .await
            .unwrap();
        assert_eq!((next.season, next.number), (1, 3));

        let err = admin_import(AxumState(other.state.clone()), other_headers, "nope".into())
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn failed_write_is_reported_but_kept_in_memory() {
        let storage = Arc::new(MemoryStorage::with_quota(400));
        let store = EpisodeStore::open(storage.clone(), StoreOptions::default()).unwrap();
        let gate = SessionGate::new(storage.clone(), Credentials::new("admin", "admin123"));
        let ctx = ServerTestContext {
            state: AppState::new(store, gate, storage.clone(), false),
            storage,
        };
        let headers = ctx.admin_headers().await;

        let err = admin_create_episode(
            AxumState(ctx.state.clone()),
            headers,
            Json(draft("Uno", 1, true)),
        )
        .await
        .unwrap_err();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(ctx.storage.get(EPISODES_KEY).unwrap().is_none());

        let store = ctx.state.store.read();
        assert_eq!(store.list().len(), 1);
        assert!(store.has_pending_write());
    }

    #[tokio::test]
    async fn maintenance_reports_through_api() {
        let ctx = ServerTestContext::new();
        let headers = ctx.admin_headers().await;
        ctx.create(&headers, draft("Uno", 1, true)).await;
        let Json(report) = admin_maintenance(AxumState(ctx.state.clone()), headers)
            .await
            .unwrap();
        assert_eq!(report.removed, 0);
        assert!(report.issues.is_empty());
    }

    #[tokio::test]
    async fn sync_picks_up_external_writes() {
        let ctx = ServerTestContext::new();
        let mut detector = ChangeDetector::new(EPISODES_KEY);
        assert!(!ctx.state.sync_once(&mut detector).unwrap());

        // Another process sharing the storage adds an episode.
        let mut external =
            EpisodeStore::open(ctx.storage.clone(), StoreOptions::default()).unwrap();
        external.add(draft("Externo", 1, true)).unwrap();
        assert!(ctx.storage.get(SYNC_KEY).unwrap().is_some());

        assert!(ctx.state.sync_once(&mut detector).unwrap());
        assert_eq!(ctx.state.store.read().list().len(), 1);
        assert!(ctx.storage.get(SYNC_KEY).unwrap().is_some());
        assert!(!ctx.state.sync_once(&mut detector).unwrap());
    }

    #[tokio::test]
    async fn foreign_marker_triggers_one_reload_and_stays() {
        let ctx = ServerTestContext::new();
        let mut detector = ChangeDetector::new(EPISODES_KEY);
        assert!(!ctx.state.sync_once(&mut detector).unwrap());

        let marker = SyncMarker {
            origin: "other-server".into(),
            ..SyncMarker::new(SyncAction::EpisodeUpdated, Value::Null)
        };
        marker.publish(ctx.storage.as_ref()).unwrap();

        assert!(ctx.state.sync_once(&mut detector).unwrap());
        assert!(!ctx.state.sync_once(&mut detector).unwrap());
        assert!(ctx.storage.get(SYNC_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn marker_is_cleared_after_mutation() {
        let ctx = ServerTestContext::new();
        let headers = ctx.admin_headers().await;
        ctx.create(&headers, draft("Uno", 1, true)).await;
        assert!(ctx.storage.get(SYNC_KEY).unwrap().is_some());
        tokio::time::sleep(MARKER_TTL + Duration::from_millis(200)).await;
        assert!(ctx.storage.get(SYNC_KEY).unwrap().is_none());
    }

    #[test]
    fn args_map_to_overrides() {
        let args = ServerArgs::parse_from([
            "server",
            "--data-dir",
            "/tmp/catalog",
            "--port",
            "9999",
            "--enrich",
        ]);
        let overrides = args.overrides();
        assert_eq!(overrides.data_dir, Some(PathBuf::from("/tmp/catalog")));
        assert_eq!(overrides.port, Some(9999));
        assert_eq!(overrides.enrich, Some(true));
        assert!(overrides.host.is_none());
    }
}
