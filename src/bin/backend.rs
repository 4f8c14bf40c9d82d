#![forbid(unsafe_code)]

//! Axum backend that aggregates public Piped API mirrors.
//!
//! Nothing here talks to YouTube directly. Every upstream call fans out
//! across a ranked pool of community mirrors with failover, responses
//! are cached briefly in memory, and a small ranking layer scores feed
//! candidates against locally supplied viewing signals.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, RawQuery, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use mirrortube::categories::{CATEGORIES, find_category};
use mirrortube::channels::{ChannelResolver, extract_channel_ref};
use mirrortube::config::{CacheTtls, RuntimeOverrides, resolve_config, split_instance_list};
use mirrortube::mirrors::{MirrorDiscovery, MirrorPool};
use mirrortube::ranking::{
    DiversityConstraints, RankOptions, UserSignals, VideoCandidate, rank_videos,
};
use mirrortube::security::ensure_not_root;
use mirrortube::upstream::{
    CircuitBreaker, ProxiedResponse, RetryPolicy, UpstreamClient, UpstreamOutcome,
    encode_query_component,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_REGION: &str = "US";

#[derive(Debug, Clone, Default)]
struct BackendArgs {
    host: Option<String>,
    port: Option<u16>,
    instances: Option<Vec<String>>,
    env_file: Option<PathBuf>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            if let Some(value) = arg.strip_prefix("--host=") {
                parsed.host = Some(value.to_string());
                continue;
            }
            if let Some(value) = arg.strip_prefix("--port=") {
                parsed.port = Some(parse_port_arg(value)?);
                continue;
            }
            if let Some(value) = arg.strip_prefix("--instances=") {
                parsed.instances = Some(split_instance_list(value));
                continue;
            }
            if let Some(value) = arg.strip_prefix("--env-file=") {
                parsed.env_file = Some(PathBuf::from(value));
                continue;
            }

            match arg.as_str() {
                "--host" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--host requires a value"))?;
                    parsed.host = Some(value);
                }
                "--port" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--port requires a value"))?;
                    parsed.port = Some(parse_port_arg(&value)?);
                }
                "--instances" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--instances requires a value"))?;
                    parsed.instances = Some(split_instance_list(&value));
                }
                "--env-file" => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("--env-file requires a value"))?;
                    parsed.env_file = Some(PathBuf::from(value));
                }
                _ => return Err(anyhow!("unknown argument: {arg}")),
            }
        }
        Ok(parsed)
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/MIRRORTUBE_HOST")
}

#[derive(Clone)]
struct AppState {
    upstream: Arc<UpstreamClient>,
    resolver: Arc<ChannelResolver>,
    cache: Arc<ApiCache>,
}

/// One TTL'd map per endpoint family, matching the upstream data's churn
/// (trending and search move fast, channel and video pages less so).
struct ApiCache {
    trending: TtlCache<Arc<Vec<VideoListItem>>>,
    search: TtlCache<Value>,
    channels: TtlCache<Value>,
    videos: TtlCache<Value>,
}

impl ApiCache {
    fn new(ttls: &CacheTtls) -> Self {
        Self {
            trending: TtlCache::new(ttls.trending),
            search: TtlCache::new(ttls.search),
            channels: TtlCache::new(ttls.channel),
            videos: TtlCache::new(ttls.video),
        }
    }
}

/// Expired entries are ignored on read and purged on the next insert;
/// there is no sweeper task. A zero TTL disables the cache.
struct TtlCache<T> {
    ttl: Duration,
    entries: RwLock<HashMap<String, (Instant, T)>>,
}

impl<T: Clone> TtlCache<T> {
    fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<T> {
        let entries = self.entries.read();
        let (deadline, value) = entries.get(key)?;
        (Instant::now() < *deadline).then(|| value.clone())
    }

    fn insert(&self, key: impl Into<String>, value: T) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        // Writes double as the sweep; keys are client-controlled, so
        // expired entries must not outlive the next insert.
        entries.retain(|_, (deadline, _)| now < *deadline);
        entries.insert(key.into(), (now + self.ttl, value));
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageRef {
    quality: String,
    url: String,
    width: u32,
    height: u32,
}

/// The list-item shape every video collection endpoint answers with,
/// regardless of which Piped endpoint the data came from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct VideoListItem {
    #[serde(rename = "type")]
    kind: String,
    title: String,
    video_id: String,
    author: String,
    author_id: String,
    author_url: String,
    video_thumbnails: Vec<ImageRef>,
    view_count: i64,
    published: i64,
    published_text: String,
    length_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_thumbnails: Option<Vec<ImageRef>>,
    author_verified: bool,
}

/// Maps one loosely-typed Piped stream item. Missing fields become
/// empty/zero rather than failing the whole page.
fn map_stream_item(item: &Value) -> VideoListItem {
    let url = item.get("url").and_then(Value::as_str).unwrap_or("");
    let uploader_url = item.get("uploaderUrl").and_then(Value::as_str).unwrap_or("");
    VideoListItem {
        kind: "video".to_string(),
        title: text_field(item, "title"),
        video_id: extract_video_id(url),
        author: text_field(item, "uploaderName"),
        author_id: extract_channel_ref(uploader_url).unwrap_or_default(),
        author_url: uploader_url.to_string(),
        video_thumbnails: vec![ImageRef {
            quality: "medium".to_string(),
            url: text_field(item, "thumbnail"),
            width: 320,
            height: 180,
        }],
        // Piped reports -1 views/duration for live streams; passed through.
        view_count: item.get("views").and_then(Value::as_i64).unwrap_or(0),
        published: 0,
        published_text: text_field(item, "uploadedDate"),
        length_seconds: item.get("duration").and_then(Value::as_i64).unwrap_or(0),
        author_thumbnails: item
            .get("uploaderAvatar")
            .and_then(Value::as_str)
            .map(|avatar| {
                vec![ImageRef {
                    quality: "default".to_string(),
                    url: avatar.to_string(),
                    width: 48,
                    height: 48,
                }]
            }),
        author_verified: item
            .get("uploaderVerified")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    }
}

fn text_field(item: &Value, key: &str) -> String {
    item.get(key).and_then(Value::as_str).unwrap_or("").to_string()
}

/// Maps the `/watch` entries of a mixed stream list; channels and
/// playlists in the same list are dropped.
fn watch_items(streams: Option<&Value>) -> Vec<VideoListItem> {
    streams
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter(|item| {
                    item.get("url")
                        .and_then(Value::as_str)
                        .is_some_and(|url| url.contains("/watch"))
                })
                .map(map_stream_item)
                .collect()
        })
        .unwrap_or_default()
}

/// The `v` query parameter of a `/watch` URL, empty when absent.
fn extract_video_id(url: &str) -> String {
    let Some((_, query)) = url.split_once('?') else {
        return String::new();
    };
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("v=") {
            return value.to_string();
        }
    }
    String::new()
}

fn is_valid_video_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 32
        && id
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-')
}

fn candidate_from_list_item(item: &VideoListItem) -> VideoCandidate {
    VideoCandidate {
        id: item.video_id.clone(),
        channel_id: item.author_id.clone(),
        title: item.title.clone(),
        description: None,
        view_count: item.view_count.max(0) as u64,
        length_seconds: item.length_seconds.max(0) as u64,
        published: item.published,
    }
}

impl AppState {
    /// Cached trending list per region. A failed upstream fetch yields an
    /// empty list that is never cached, so the next request retries.
    async fn trending_list(&self, region: &str) -> Arc<Vec<VideoListItem>> {
        if let Some(cached) = self.cache.trending.get(region) {
            return cached;
        }
        let path = format!("/trending?region={}", encode_query_component(region));
        let Some(items) = self.upstream.fetch_json::<Vec<Value>>(&path).await else {
            return Arc::new(Vec::new());
        };
        let list: Arc<Vec<VideoListItem>> =
            Arc::new(items.iter().map(map_stream_item).collect());
        self.cache.trending.insert(region, list.clone());
        list
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

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_gateway(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: message.into(),
        }
    }

    fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

/// Browse payloads are user-independent, so clients may hold them for
/// five minutes and shared caches for ten.
const BROWSE_CACHE_CONTROL: &str = "public, max-age=300, s-maxage=600";

/// JSON response carrying the browse `Cache-Control` header. Errors skip
/// it; a failure must not be cached downstream.
#[derive(Debug)]
struct CachedJson(Value);

impl IntoResponse for CachedJson {
    fn into_response(self) -> Response {
        let mut response = Json(self.0).into_response();
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static(BROWSE_CACHE_CONTROL),
        );
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[tokio::main]
async fn main() -> Result<()> {
    let args = BackendArgs::parse()?;

    ensure_not_root("backend")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = resolve_config(RuntimeOverrides {
        host: args.host,
        port: args.port,
        instances: args.instances,
        env_path: args.env_file,
    })?;
    let host = parse_host_arg(&config.host)?;

    let pool = Arc::new(MirrorPool::new(config.instances.clone()));
    let breaker = Arc::new(CircuitBreaker::new(config.circuit_retry));
    // Mirror traffic must not follow redirects; a redirecting mirror is
    // treated as broken, never silently followed off-pool.
    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .context("building upstream HTTP client")?;
    let upstream = Arc::new(UpstreamClient::new(
        pool.clone(),
        breaker,
        http.clone(),
        config.request_timeout,
        RetryPolicy::default(),
    ));
    let resolver = Arc::new(ChannelResolver::new(upstream.clone()));

    let discovery = MirrorDiscovery::new(
        pool,
        http,
        config.registry_url.clone(),
        config.instances.clone(),
    )?;
    discovery.spawn(config.discovery_interval);

    let state = AppState {
        upstream,
        resolver,
        cache: Arc::new(ApiCache::new(&config.cache)),
    };

    let app = Router::new()
        .route("/api/piped/{*path}", get(proxy_piped))
        .route("/api/trending", get(get_trending))
        .route("/api/search", get(search))
        .route("/api/channels/{id}", get(get_channel))
        .route("/api/videos/{id}", get(get_video))
        .route("/api/categories", get(list_categories))
        .route("/api/categories/{slug}", get(browse_category))
        .route("/api/feed", post(rank_feed))
        .route("/api/health", get(health))
        .fallback(api_fallback)
        .with_state(state);

    let addr = SocketAddr::new(host, config.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!(%addr, "piped aggregation backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running API server")?;

    Ok(())
}

async fn shutdown_signal() {
    // Only graceful shutdown is lost if this fails; the process still
    // terminates when Ctrl+C fires.
    if let Err(err) = signal::ctrl_c().await {
        warn!(error = %err, "failed to install Ctrl+C handler");
    }
}

async fn api_fallback() -> Response {
    ApiError::not_found("endpoint not found").into_response()
}

/// Transparent passthrough of an arbitrary Piped path. The winning
/// mirror's status, content type, and body are relayed verbatim.
async fn proxy_piped(
    State(state): State<AppState>,
    AxumPath(path): AxumPath<String>,
    RawQuery(query): RawQuery,
) -> Response {
    let mut upstream_path = format!("/{path}");
    if let Some(query) = query.filter(|query| !query.is_empty()) {
        upstream_path.push('?');
        upstream_path.push_str(&query);
    }

    // `into_proxied` settles pool exhaustion into the last upstream error
    // (or a synthetic 502); only an open circuit yields nothing.
    match state.upstream.fetch(&upstream_path).await.into_proxied() {
        Some(proxied) => proxied_response(proxied),
        None => ApiError::unavailable("Piped upstream temporarily unavailable").into_response(),
    }
}

fn proxied_response(proxied: ProxiedResponse) -> Response {
    let mut response = Response::new(Body::from(proxied.body));
    *response.status_mut() = proxied.status;
    if let Ok(value) = header::HeaderValue::from_str(&proxied.content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response
}

#[derive(Debug, Deserialize)]
struct TrendingParams {
    #[serde(default)]
    region: Option<String>,
}

async fn get_trending(
    State(state): State<AppState>,
    Query(params): Query<TrendingParams>,
) -> ApiResult<CachedJson> {
    let region = params
        .region
        .as_deref()
        .map(str::trim)
        .filter(|region| !region.is_empty())
        .unwrap_or(DEFAULT_REGION);
    let items = state.trending_list(region).await;
    Ok(CachedJson(json!({ "data": &*items })))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    nextpage: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<CachedJson> {
    let query = params.q.as_deref().unwrap_or("").trim().to_string();
    if query.is_empty() {
        return Ok(CachedJson(
            json!({"data": [], "meta": {"nextPage": Value::Null}}),
        ));
    }
    let filter = params
        .filter
        .as_deref()
        .map(str::trim)
        .filter(|filter| !filter.is_empty())
        .unwrap_or("videos")
        .to_string();
    let nextpage = params.nextpage.as_deref().filter(|token| !token.is_empty());

    let cache_key = format!("{query}|{filter}|{}", nextpage.unwrap_or("first"));
    if let Some(hit) = state.cache.search.get(&cache_key) {
        return Ok(CachedJson(hit));
    }

    let path = match nextpage {
        Some(token) => format!(
            "/nextpage/search?q={}&filter={}&nextpage={}",
            encode_query_component(&query),
            encode_query_component(&filter),
            encode_query_component(token)
        ),
        None => format!(
            "/search?q={}&filter={}",
            encode_query_component(&query),
            encode_query_component(&filter)
        ),
    };

    let Some(page) = state.upstream.fetch_json::<Value>(&path).await else {
        return Ok(CachedJson(
            json!({"data": [], "meta": {"nextPage": Value::Null}}),
        ));
    };
    let videos = watch_items(page.get("items"));
    let next = page.get("nextpage").cloned().unwrap_or(Value::Null);

    let payload = json!({"data": videos, "meta": {"nextPage": next}});
    state.cache.search.insert(cache_key, payload.clone());
    Ok(CachedJson(payload))
}

async fn get_channel(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<CachedJson> {
    let requested = id.trim().to_string();
    if requested.is_empty() {
        return Err(ApiError::not_found("Channel not found"));
    }
    if let Some(hit) = state.cache.channels.get(&requested) {
        return Ok(CachedJson(hit));
    }

    let canonical = state
        .resolver
        .resolve(&requested)
        .await
        .ok_or_else(|| ApiError::not_found("Channel not found"))?;
    let detail: Value = state
        .upstream
        .fetch_json(&format!("/channel/{}", canonical.id))
        .await
        .ok_or_else(|| ApiError::not_found("Channel not found"))?;
    if detail.get("error").is_some() {
        return Err(ApiError::not_found("Channel not found"));
    }

    let payload = json!({"data": map_channel_dto(&canonical.id, &detail)});
    state.cache.channels.insert(requested, payload.clone());
    Ok(CachedJson(payload))
}

fn map_channel_dto(ucid: &str, detail: &Value) -> Value {
    let videos = watch_items(detail.get("relatedStreams"));

    json!({
        "id": detail.get("id").and_then(Value::as_str).unwrap_or(ucid),
        "name": text_field(detail, "name"),
        "avatarUrl": detail
            .get("avatarUrl")
            .or_else(|| detail.get("avatar_url"))
            .and_then(Value::as_str)
            .unwrap_or(""),
        "bannerUrl": detail
            .get("bannerUrl")
            .or_else(|| detail.get("banner_url"))
            .and_then(Value::as_str)
            .unwrap_or(""),
        "description": text_field(detail, "description"),
        "subscriberCount": detail
            .get("subscriberCount")
            .or_else(|| detail.get("subscriber_count"))
            .and_then(Value::as_i64)
            .unwrap_or(0),
        "verified": detail.get("verified").and_then(Value::as_bool).unwrap_or(false),
        "videos": videos,
        "nextpage": detail.get("nextpage").cloned().unwrap_or(Value::Null),
    })
}

async fn get_video(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<String>,
) -> ApiResult<CachedJson> {
    let id = id.trim().to_string();
    if !is_valid_video_id(&id) {
        return Err(ApiError::bad_request("invalid video id"));
    }
    if let Some(hit) = state.cache.videos.get(&id) {
        return Ok(CachedJson(hit));
    }

    match state.upstream.fetch(&format!("/streams/{id}")).await {
        UpstreamOutcome::Success(response) => {
            let value: Value = serde_json::from_slice(&response.body)
                .map_err(|_| ApiError::bad_gateway("invalid upstream payload"))?;
            if value.get("error").is_some() {
                return Err(ApiError::not_found("Video not found"));
            }
            let payload = json!({"data": value});
            state.cache.videos.insert(id, payload.clone());
            Ok(CachedJson(payload))
        }
        UpstreamOutcome::PoolExhausted(Some(last)) if last.status == StatusCode::NOT_FOUND => {
            Err(ApiError::not_found("Video not found"))
        }
        UpstreamOutcome::PoolExhausted(_) => {
            Err(ApiError::bad_gateway("All Piped API instances unavailable"))
        }
        UpstreamOutcome::CircuitOpen => {
            Err(ApiError::unavailable("Piped upstream temporarily unavailable"))
        }
    }
}

async fn list_categories() -> Json<Value> {
    Json(json!({ "data": CATEGORIES }))
}

/// One category shelf: the descriptor plus its video list. `all` carries
/// no backing query and answers the region's trending list; every other
/// slug runs its fixed video search.
async fn browse_category(
    State(state): State<AppState>,
    AxumPath(slug): AxumPath<String>,
    Query(params): Query<TrendingParams>,
) -> ApiResult<CachedJson> {
    let slug = slug.trim().to_ascii_lowercase();
    let category = find_category(&slug).ok_or_else(|| ApiError::not_found("Unknown category"))?;

    let Some(query) = category.query else {
        let region = params
            .region
            .as_deref()
            .map(str::trim)
            .filter(|region| !region.is_empty())
            .unwrap_or(DEFAULT_REGION);
        let items = state.trending_list(region).await;
        return Ok(CachedJson(
            json!({"data": {"category": category, "videos": &*items}}),
        ));
    };

    let cache_key = format!("category:{slug}");
    if let Some(hit) = state.cache.search.get(&cache_key) {
        return Ok(CachedJson(hit));
    }

    let path = format!("/search?q={}&filter=videos", encode_query_component(query));
    let Some(page) = state.upstream.fetch_json::<Value>(&path).await else {
        // Not cached, so the next request retries.
        return Ok(CachedJson(
            json!({"data": {"category": category, "videos": []}}),
        ));
    };
    let payload =
        json!({"data": {"category": category, "videos": watch_items(page.get("items"))}});
    state.cache.search.insert(cache_key, payload.clone());
    Ok(CachedJson(payload))
}

/// Ranking request: user signals plus optional explicit candidates. When
/// candidates are absent the region's trending list is ranked instead.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedRequest {
    #[serde(default)]
    signals: UserSignals,
    #[serde(default)]
    candidates: Option<Vec<VideoCandidate>>,
    #[serde(default)]
    region: Option<String>,
    /// Watched video id -> channel id, supplied by the client that owns
    /// the watch history.
    #[serde(default)]
    history_channels: HashMap<String, String>,
    /// Watched video id -> length in seconds.
    #[serde(default)]
    video_lengths: HashMap<String, f64>,
    #[serde(default)]
    diversity: Option<DiversityConstraints>,
}

async fn rank_feed(
    State(state): State<AppState>,
    Json(request): Json<FeedRequest>,
) -> ApiResult<Json<Value>> {
    let candidates = match request.candidates {
        Some(candidates) => candidates,
        None => {
            let region = request
                .region
                .as_deref()
                .map(str::trim)
                .filter(|region| !region.is_empty())
                .unwrap_or(DEFAULT_REGION);
            state
                .trending_list(region)
                .await
                .iter()
                .map(candidate_from_list_item)
                .collect()
        }
    };

    let options = RankOptions {
        history_channels: request.history_channels,
        video_lengths: request.video_lengths,
        diversity: request.diversity.unwrap_or_default(),
        now: None,
    };
    let ranked = rank_videos(&candidates, &request.signals, &options);
    Ok(Json(json!({ "data": ranked })))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "mirrors": state.upstream.pool().len(),
        "circuitOpen": state.upstream.breaker().is_open(),
    }))
}
