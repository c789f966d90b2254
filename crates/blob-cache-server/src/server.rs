//! HTTP server for blob cache endpoints
//!
//! Provides /health, /blob/{stash}/{*key} (GET, PUT, DELETE) and
//! /admin/clear endpoints.

use crate::types::{ErrorResponse, HealthResponse, PutResponse};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use blob_cache::{Blob, Cache, GetOptions, PutOptions};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Applied when an upload carries no `Cache-Control: max-age`
const DEFAULT_MAX_AGE: u32 = 86400;

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Shared state for the HTTP server
pub struct ServerState {
    pub cache: Arc<Cache>,
    pub started_at: DateTime<Utc>,
}

impl ServerState {
    pub fn new(cache: Cache) -> Self {
        Self {
            cache: Arc::new(cache),
            started_at: Utc::now(),
        }
    }
}

pub type SharedState = Arc<ServerState>;

#[derive(Debug, Default, Deserialize)]
pub struct BlobQuery {
    #[serde(default)]
    pub stale: bool,
}

/// Create the HTTP router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/blob/{stash}/{*key}",
            get(get_blob).put(put_blob).delete(delete_blob),
        )
        .route("/admin/clear", post(clear_all))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve until ctrl-c, then flush the cache to disk
pub async fn start_server(state: SharedState, port: u16) -> std::io::Result<()> {
    let router = create_router(Arc::clone(&state));
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let cache = Arc::clone(&state.cache);
    if let Err(e) = tokio::task::spawn_blocking(move || cache.shutdown()).await {
        error!(error = %e, "Cache shutdown task failed");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

/// Health check endpoint
async fn health(State(state): State<SharedState>) -> Json<HealthResponse> {
    let uptime_secs = (Utc::now() - state.started_at).num_seconds() as u64;

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs,
        cache: state.cache.stats(),
    })
}

/// Get a cached blob
async fn get_blob(
    State(state): State<SharedState>,
    Path((stash, key)): Path<(String, String)>,
    Query(query): Query<BlobQuery>,
) -> Response {
    let cache = Arc::clone(&state.cache);
    let opts = GetOptions {
        pad: 0,
        allow_stale: query.stale,
    };

    // Reads the blob file, keep it off the async workers
    let result = tokio::task::spawn_blocking(move || cache.get(&key, &stash, opts)).await;

    match result {
        Ok(Some(blob)) => blob_response(blob),
        Ok(None) => not_found(),
        Err(e) => {
            error!(error = %e, "Cache read task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "Cache read failed".to_string(),
                }),
            )
                .into_response()
        }
    }
}

fn blob_response(mut blob: Blob) -> Response {
    let mut headers = HeaderMap::new();

    let content_type = blob
        .content_type
        .as_deref()
        .and_then(|ct| HeaderValue::from_str(ct).ok())
        .unwrap_or(HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);

    if let Some(etag) = blob.etag.as_deref().and_then(|e| HeaderValue::from_str(e).ok()) {
        headers.insert(header::ETAG, etag);
    }

    if let Some(modtime) = DateTime::from_timestamp(blob.modtime, 0).filter(|_| blob.modtime > 0) {
        if let Ok(value) = HeaderValue::from_str(&modtime.format(HTTP_DATE).to_string()) {
            headers.insert(header::LAST_MODIFIED, value);
        }
    }

    headers.insert(
        "X-Cache-Stale",
        HeaderValue::from_static(if blob.stale { "true" } else { "false" }),
    );

    blob.data.truncate(blob.len);
    (StatusCode::OK, headers, blob.data).into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: "Blob not found".to_string(),
        }),
    )
        .into_response()
}

/// Store a blob; attributes come from the usual HTTP caching headers
async fn put_blob(
    State(state): State<SharedState>,
    Path((stash, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Json<PutResponse> {
    let opts = put_options(&headers);
    let unchanged = state.cache.put(&key, &stash, body.to_vec(), opts);
    Json(PutResponse { unchanged })
}

fn header_str<'a>(headers: &'a HeaderMap, name: impl header::AsHeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn put_options(headers: &HeaderMap) -> PutOptions {
    let max_age = header_str(headers, header::CACHE_CONTROL)
        .and_then(parse_max_age)
        .unwrap_or(DEFAULT_MAX_AGE);

    let mut opts = PutOptions::new(max_age);
    if let Some(content_type) = header_str(headers, header::CONTENT_TYPE) {
        opts = opts.content_type(content_type);
    }
    if let Some(etag) = header_str(headers, header::ETAG) {
        opts = opts.etag(etag);
    }
    if let Some(modtime) = header_str(headers, header::LAST_MODIFIED)
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
    {
        opts = opts.modtime(modtime.timestamp());
    }
    let important = header_str(headers, "X-Important")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    opts.important(important)
}

fn parse_max_age(cache_control: &str) -> Option<u32> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|secs| secs.trim_matches('"').parse().ok())
}

/// Evict one blob
async fn delete_blob(
    State(state): State<SharedState>,
    Path((stash, key)): Path<(String, String)>,
) -> StatusCode {
    state.cache.evict(&key, &stash);
    StatusCode::NO_CONTENT
}

/// Evict everything
async fn clear_all(State(state): State<SharedState>) -> StatusCode {
    let cleared = state.cache.clear_all();
    info!(cleared, "Cache cleared via admin endpoint");
    StatusCode::NO_CONTENT
}
