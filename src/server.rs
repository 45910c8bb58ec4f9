#![forbid(unsafe_code)]

//! HTTP surface: route dispatch, response shaping and the streaming proxy.
//!
//! Handlers stay small; the interesting parts are the byte-cache fast path,
//! the egress-client selection for IP-locked URLs and the single 403
//! re-resolve under a distinct singleflight key.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use axum::{
    Json, Router,
    body::Body,
    extract::{Path as AxumPath, Query, RawQuery, Request, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::cache::{ByteCache, MAX_ENTRY_BYTES, POT_TOKEN_TTL, PotCache, TtlCache};
use crate::config::Config;
use crate::resolver::{
    BYTE_CACHE_FALLBACK_TTL, ResolvedUrl, Resolver, UrlCache, cache_key, derive_cache_ttl,
    is_valid_video_id,
};
use crate::search::{SearchHit, SearchResponse, video_search};
use crate::singleflight::{SharedError, Singleflight};

const SEARCH_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const RESOLVE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const BYTE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const POT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36";

/// Shared state injected into every handler.
///
/// Everything in here is process-global infrastructure: the three caches,
/// the resolver with its subprocess semaphore, the singleflight table, and
/// the two upstream HTTP clients (IP-locked URLs must leave through the same
/// egress that resolved them).
#[derive(Clone)]
pub struct AppState {
    pub search_cache: Arc<TtlCache<SearchResponse>>,
    pub url_cache: Arc<UrlCache>,
    pub byte_cache: Arc<ByteCache>,
    pub pot_cache: Arc<PotCache>,
    pub resolver: Arc<Resolver>,
    pub flights: Arc<Singleflight<ResolvedUrl>>,
    pub direct_client: reqwest::Client,
    pub proxied_client: reqwest::Client,
    pub search_cache_ttl: Duration,
    pub pot_provider_url: Option<String>,
}

impl AppState {
    pub fn build(config: &Config, cookies_file: Option<PathBuf>) -> Result<Self> {
        let direct_client = streaming_client(None)?;
        let proxied_client = match &config.proxy_url {
            Some(proxy) => streaming_client(Some(proxy))?,
            None => direct_client.clone(),
        };

        let resolver = Resolver::new(
            config.ytdlp_path.clone(),
            config.proxy_url.clone(),
            config.pot_endpoint(),
            cookies_file,
        );

        Ok(Self {
            search_cache: Arc::new(TtlCache::new()),
            url_cache: Arc::new(UrlCache::new()),
            byte_cache: Arc::new(ByteCache::new(config.byte_cache_max_bytes)),
            pot_cache: Arc::new(PotCache::new()),
            resolver: Arc::new(resolver),
            flights: Arc::new(Singleflight::new()),
            direct_client,
            proxied_client,
            search_cache_ttl: config.search_cache_ttl,
            pot_provider_url: config.pot_provider_url.clone(),
        })
    }

    /// Cache sweepers plus the one-shot PO-token warmup.
    pub fn spawn_background_tasks(&self) {
        self.search_cache
            .spawn_sweeper(SEARCH_SWEEP_INTERVAL, "search");
        self.url_cache.spawn_sweeper(RESOLVE_SWEEP_INTERVAL);
        self.byte_cache.spawn_sweeper(BYTE_SWEEP_INTERVAL);

        if self.pot_provider_url.is_some() {
            let state = self.clone();
            tokio::spawn(async move {
                match fetch_pot_token(&state, None).await {
                    Ok(_) => info!("PO token warmed up"),
                    Err(err) => warn!("PO token warmup failed: {err:#}"),
                }
            });
        }
    }
}

fn streaming_client(proxy: Option<&str>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90));
    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy).context("invalid PROXY_URL")?);
    }
    // No total timeout: proxied streams can legitimately run for hours.
    builder.build().context("building HTTP client")
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/search", get(search))
        .route("/resolve/{video_id}", get(resolve_video))
        .route("/proxy/{video_id}", get(proxy_video))
        .route("/prefetch/{video_id}", post(prefetch_video))
        .route("/pot", get(pot_token))
        .route("/health", get(health))
        .layer(middleware::from_fn(log_requests))
        .layer(cors)
        .with_state(state)
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    info!(
        %method,
        path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "request"
    );
    response
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

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
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
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Default, Deserialize)]
struct SearchParams {
    q: Option<String>,
    limit: Option<String>,
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let query = params.q.as_deref().map(str::trim).unwrap_or("");
    if query.is_empty() {
        return Err(ApiError::bad_request("missing query parameter 'q'"));
    }
    let limit = params
        .limit
        .as_deref()
        .and_then(|value| value.parse::<usize>().ok())
        .map(|value| value.clamp(1, 50))
        .unwrap_or(10);

    let key = format!("{query}:{limit}");
    if let Some(mut cached) = state.search_cache.get(&key) {
        // Flag the in-flight copy only; the stored entry keeps cached=false.
        cached.cached = true;
        return Ok(Json(cached));
    }

    let hits = video_search(&state.direct_client, query)
        .await
        .map_err(|err| {
            warn!(query, "search failed: {err:#}");
            ApiError::internal("search failed")
        })?;

    let response = SearchResponse {
        items: hits
            .into_iter()
            .take(limit)
            .map(SearchHit::into_result)
            .collect(),
        query: query.to_string(),
        cached: false,
        cache_at: Utc::now().timestamp(),
    };
    state
        .search_cache
        .insert(key, response.clone(), state.search_cache_ttl);
    Ok(Json(response))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AudioModeParams {
    video_only: Option<String>,
}

async fn resolve_video(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
    Query(params): Query<AudioModeParams>,
) -> ApiResult<Json<ResolvedUrl>> {
    let video_id = video_id.trim().to_string();
    if !is_valid_video_id(&video_id) {
        return Err(ApiError::bad_request("invalid video ID"));
    }
    let video_only = params.video_only.as_deref() == Some("true");
    let key = cache_key(&video_id, video_only);

    if let Some(record) = state.url_cache.get(&key) {
        return Ok(Json(record));
    }

    let record = resolve_via_flight(&state, &key, &video_id, video_only)
        .await
        .map_err(|err| {
            warn!(video_id, "resolve failed: {err:#}");
            ApiError::internal("failed to resolve video")
        })?;
    Ok(Json(record))
}

/// Resolves under singleflight and stores the record, so concurrent misses
/// for the same key spawn one subprocess and the first writer wins.
async fn resolve_via_flight(
    state: &AppState,
    key: &str,
    video_id: &str,
    video_only: bool,
) -> Result<ResolvedUrl, SharedError> {
    let (result, shared) = state
        .flights
        .run(key, async {
            let record = state.resolver.resolve(video_id, video_only).await?;
            state.url_cache.store(key, &record);
            Ok(record)
        })
        .await;
    if shared {
        debug!(key, "joined in-flight resolve");
    }
    result
}

async fn proxy_video(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
    Query(params): Query<AudioModeParams>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let video_id = video_id.trim().to_string();
    if !is_valid_video_id(&video_id) {
        return Err(ApiError::bad_request("invalid video ID"));
    }
    let video_only = params.video_only.as_deref() != Some("false");
    let key = cache_key(&video_id, video_only);
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    if byte_cache_eligible(range.as_deref())
        && let Some(body) = state.byte_cache.get(&key)
    {
        debug!(%key, size = body.len(), "serving from byte cache");
        return Ok(cached_body_response(body));
    }

    let mut record = match state.url_cache.get(&key) {
        Some(record) => record,
        None => resolve_via_flight(&state, &key, &video_id, video_only)
            .await
            .map_err(|err| {
                warn!(video_id, "resolve failed: {err:#}");
                ApiError::internal("failed to resolve video")
            })?,
    };

    let mut upstream = fetch_upstream(&state, &record, range.as_deref())
        .await
        .map_err(|err| {
            warn!(video_id, "upstream request failed: {err:#}");
            ApiError::bad_gateway("upstream request failed")
        })?;

    // A 403 here almost always means the cached URL went stale or is
    // IP-locked to an egress we no longer use. Re-resolve once, under a key
    // that cannot be coalesced with the flight that produced the stale
    // record; a second 403 passes through to the client.
    if upstream.status() == StatusCode::FORBIDDEN {
        info!(%key, "upstream 403, re-resolving");
        let retry_key = format!("{key}:retry");
        let (result, _) = state
            .flights
            .run(&retry_key, async {
                let fresh = state.resolver.resolve(&video_id, video_only).await?;
                state.url_cache.store(&key, &fresh);
                Ok(fresh)
            })
            .await;
        record = result.map_err(|err| {
            warn!(video_id, "re-resolve failed: {err:#}");
            ApiError::internal("failed to resolve video")
        })?;

        upstream = fetch_upstream(&state, &record, range.as_deref())
            .await
            .map_err(|err| {
                warn!(video_id, "upstream retry failed: {err:#}");
                ApiError::bad_gateway("upstream request failed")
            })?;
    }

    Ok(relay_upstream(&state, &key, &record, range.as_deref(), upstream))
}

/// The byte cache only holds whole bodies, so it can serve a request with no
/// range or the full-file range; anything narrower goes upstream.
fn byte_cache_eligible(range: Option<&str>) -> bool {
    match range {
        None => true,
        Some(value) => value.trim() == "bytes=0-",
    }
}

fn cached_body_response(body: Bytes) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::CONTENT_LENGTH, body.len())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from(body))
        .unwrap()
}

/// Issues the upstream GET with browser-shaped headers through the egress
/// the URL was resolved on.
async fn fetch_upstream(
    state: &AppState,
    record: &ResolvedUrl,
    range: Option<&str>,
) -> Result<reqwest::Response> {
    let client = if record.used_proxy {
        &state.proxied_client
    } else {
        &state.direct_client
    };

    let mut request = client
        .get(&record.url)
        .header(header::USER_AGENT, BROWSER_USER_AGENT)
        .header(header::ACCEPT, "*/*")
        .header(header::ACCEPT_LANGUAGE, "en-US,en;q=0.9")
        .header(header::ORIGIN, "https://www.youtube.com")
        .header(header::REFERER, "https://www.youtube.com/");
    if let Some(range) = range {
        request = request.header(header::RANGE, range);
    }
    request.send().await.context("connecting upstream")
}

/// Mirrors the upstream response to the client, teeing eligible bodies into
/// the byte cache on the way through.
fn relay_upstream(
    state: &AppState,
    key: &str,
    record: &ResolvedUrl,
    range: Option<&str>,
    upstream: reqwest::Response,
) -> Response {
    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("video/mp4"));

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "no-cache");
    if let Some(value) = upstream.headers().get(header::CONTENT_LENGTH) {
        builder = builder.header(header::CONTENT_LENGTH, value.clone());
    }
    if let Some(value) = upstream.headers().get(header::CONTENT_RANGE) {
        builder = builder.header(header::CONTENT_RANGE, value.clone());
    }

    let body = if range.is_none() && status == StatusCode::OK {
        let ttl = derive_cache_ttl(
            record.expires_at_ms,
            Utc::now().timestamp_millis(),
            BYTE_CACHE_FALLBACK_TTL,
        );
        teeing_body(
            upstream,
            Arc::clone(&state.byte_cache),
            key.to_string(),
            ttl,
        )
    } else {
        Body::from_stream(upstream.bytes_stream())
    };

    builder.body(body).unwrap()
}

/// Relays the upstream body chunk by chunk while keeping a parallel copy.
/// If the body completes cleanly at or under the per-entry cap, the copy
/// goes into the byte cache; larger bodies stop accumulating but keep
/// streaming.
fn teeing_body(
    upstream: reqwest::Response,
    cache: Arc<ByteCache>,
    key: String,
    ttl: Duration,
) -> Body {
    let (tx, rx) = tokio::sync::mpsc::channel::<std::io::Result<Bytes>>(8);
    tokio::spawn(async move {
        let mut stream = upstream.bytes_stream();
        let mut copy = BytesMut::new();
        let mut copying = true;
        let mut total: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    warn!(%key, bytes_written = total, "stream copy error: {err}");
                    let _ = tx.send(Err(std::io::Error::other(err))).await;
                    return;
                }
            };
            total += chunk.len() as u64;
            if copying {
                if copy.len() + chunk.len() <= MAX_ENTRY_BYTES {
                    copy.extend_from_slice(&chunk);
                } else {
                    copying = false;
                    copy = BytesMut::new();
                }
            }
            if tx.send(Ok(chunk)).await.is_err() {
                // Client went away; expected for seeks and tab closes.
                debug!(%key, bytes_written = total, "client disconnected");
                return;
            }
        }

        if copying && !copy.is_empty() {
            debug!(%key, size = copy.len(), "caching streamed body");
            cache.insert(key, copy.freeze(), ttl);
        }
    });
    Body::from_stream(ReceiverStream::new(rx))
}

async fn prefetch_video(
    State(state): State<AppState>,
    AxumPath(video_id): AxumPath<String>,
) -> ApiResult<Response> {
    let video_id = video_id.trim().to_string();
    if !is_valid_video_id(&video_id) {
        return Err(ApiError::bad_request("invalid video ID"));
    }
    let key = cache_key(&video_id, true);
    if state.byte_cache.contains(&key) {
        return Ok((StatusCode::OK, Json(json!({ "status": "already_cached" }))).into_response());
    }

    let task_state = state.clone();
    let task_key = key.clone();
    tokio::spawn(async move {
        if let Err(err) = prefetch_into_cache(&task_state, &task_key, &video_id).await {
            warn!(key = %task_key, "prefetch failed: {err:#}");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "prefetching" }))).into_response())
}

async fn prefetch_into_cache(state: &AppState, key: &str, video_id: &str) -> Result<()> {
    let record = match state.url_cache.get(key) {
        Some(record) => record,
        None => resolve_via_flight(state, key, video_id, true)
            .await
            .map_err(|err| anyhow!("{err:#}"))?,
    };

    let upstream = fetch_upstream(state, &record, None).await?;
    if !upstream.status().is_success() {
        bail!("upstream answered {}", upstream.status());
    }

    let mut stream = upstream.bytes_stream();
    let mut body = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("reading upstream body")?;
        if body.len() + chunk.len() > MAX_ENTRY_BYTES {
            debug!(key, "body exceeds cacheable size, abandoning prefetch");
            return Ok(());
        }
        body.extend_from_slice(&chunk);
    }

    let ttl = derive_cache_ttl(
        record.expires_at_ms,
        Utc::now().timestamp_millis(),
        BYTE_CACHE_FALLBACK_TTL,
    );
    info!(key, size = body.len(), "prefetched body into cache");
    state.byte_cache.insert(key, body.freeze(), ttl);
    Ok(())
}

async fn pot_token(
    State(state): State<AppState>,
    RawQuery(raw_query): RawQuery,
) -> ApiResult<Response> {
    if state.pot_provider_url.is_none() {
        return Err(ApiError::unavailable("PO token provider not configured"));
    }

    if let Some(token) = state.pot_cache.get() {
        return Ok(plain_text(token));
    }

    let token = fetch_pot_token(&state, raw_query.as_deref())
        .await
        .map_err(|err| {
            warn!("PO token fetch failed: {err:#}");
            ApiError::internal("failed to fetch PO token")
        })?;
    Ok(plain_text(token))
}

fn plain_text(body: String) -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

/// Fetches a token from the external provider, forwarding the caller's query
/// string untouched, and fills the single-slot cache.
async fn fetch_pot_token(state: &AppState, raw_query: Option<&str>) -> Result<String> {
    let Some(provider) = &state.pot_provider_url else {
        bail!("PO token provider not configured");
    };
    let url = match raw_query {
        Some(query) if !query.is_empty() => format!("{provider}?{query}"),
        _ => provider.clone(),
    };

    let response = state
        .direct_client
        .get(&url)
        .timeout(POT_FETCH_TIMEOUT)
        .send()
        .await
        .context("contacting PO token provider")?;
    if !response.status().is_success() {
        bail!("PO token provider answered {}", response.status());
    }

    let token = response.text().await.context("reading PO token")?;
    let token = token.trim().to_string();
    if token.is_empty() {
        bail!("PO token provider returned an empty token");
    }
    state.pot_cache.set(&token, POT_TOKEN_TTL);
    Ok(token)
}
