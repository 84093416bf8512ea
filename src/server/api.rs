//! HTTP API over the cache engine.
//!
//! - GET /health, GET /metrics
//! - GET/PUT/DELETE /v1/config/{key}
//! - POST /v1/config/batch
//! - GET /v1/config/events (SSE)
//! - POST /v1/assets/preload, GET /v1/assets?url=
//! - POST /v1/navigation
//! - GET /v1/cache/stats

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::cache::asset::{AssetRecord, AssetRequest};
use crate::cache::facade::{CacheStats, GetOptions, PerformanceReport, SetOptions};
use crate::cache::preloader::{PreloadReport, PreloaderStats};
use crate::cache::ttl_store::VolatilityClass;
use crate::engine::CacheEngine;
use crate::server::streaming::changes_to_sse_stream;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Arc<CacheEngine>,
    pub start_time: Instant,
}

/// Build the axum router with all API routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/config/batch", post(get_config_batch))
        .route("/v1/config/events", get(config_events))
        .route(
            "/v1/config/{key}",
            get(get_config).put(set_config).delete(invalidate_config),
        )
        .route("/v1/assets", get(get_asset))
        .route("/v1/assets/preload", post(preload_assets))
        .route("/v1/navigation", post(navigate))
        .route("/v1/cache/stats", get(cache_stats))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ReadQuery {
    #[serde(default)]
    pub class: VolatilityClass,
    #[serde(default)]
    pub remote: bool,
}

impl ReadQuery {
    fn options(&self) -> GetOptions {
        GetOptions {
            class: self.class,
            use_remote: self.remote,
            ..GetOptions::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigValueResponse {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Deserialize)]
pub struct SetConfigRequest {
    pub value: Value,
    #[serde(default)]
    pub class: VolatilityClass,
    #[serde(default)]
    pub push_remote: bool,
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub keys: Vec<String>,
    #[serde(default)]
    pub class: VolatilityClass,
    #[serde(default)]
    pub remote: bool,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PreloadRequest {
    pub assets: Vec<AssetRequest>,
}

#[derive(Debug, Deserialize)]
pub struct AssetQuery {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct NavigationRequest {
    pub from: String,
    pub to: String,
    pub role: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NavigationResponse {
    pub queued: usize,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub context: String,
    pub build_version: String,
}

/// Cache statistics response.
#[derive(Debug, Serialize)]
pub struct CacheStatsResponse {
    pub config: CacheStats,
    pub assets: PreloaderStats,
    pub performance: PerformanceReport,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        context: state.engine.mirror().context_id().to_string(),
        build_version: state.engine.assets().gate().build_version().to_string(),
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.metrics().encode(),
    )
}

async fn get_config(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Query(query): Query<ReadQuery>,
) -> Json<ConfigValueResponse> {
    let value = state.engine.configs().get_config(&key, query.options()).await;
    Json(ConfigValueResponse { key, value })
}

async fn set_config(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(req): Json<SetConfigRequest>,
) -> Json<ConfigValueResponse> {
    info!(key, push_remote = req.push_remote, "Config update");
    let options = SetOptions {
        class: req.class,
        push_remote: req.push_remote,
    };
    state
        .engine
        .configs()
        .set_config(&key, req.value.clone(), options)
        .await;
    Json(ConfigValueResponse {
        key,
        value: req.value,
    })
}

async fn invalidate_config(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> StatusCode {
    state.engine.configs().invalidate_config(&key);
    StatusCode::NO_CONTENT
}

async fn get_config_batch(
    State(state): State<Arc<AppState>>,
    Json(req): Json<BatchRequest>,
) -> Json<HashMap<String, Value>> {
    let options = GetOptions {
        class: req.class,
        use_remote: req.remote,
        ..GetOptions::default()
    };
    Json(state.engine.configs().get_configs(&req.keys, options).await)
}

async fn config_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let rx = state.engine.configs().watch();
    Sse::new(changes_to_sse_stream(rx, query.key)).keep_alive(KeepAlive::default())
}

async fn preload_assets(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PreloadRequest>,
) -> Json<PreloadReport> {
    info!(assets = req.assets.len(), "Preload request");
    Json(state.engine.assets().preload(&req.assets).await)
}

async fn get_asset(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AssetQuery>,
) -> Result<Json<AssetRecord>, StatusCode> {
    state
        .engine
        .assets()
        .get_asset(&query.url)
        .await
        .map(|record| Json(record.as_ref().clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn navigate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<NavigationRequest>,
) -> Json<NavigationResponse> {
    let queued = state
        .engine
        .navigate(&req.from, &req.to, req.role.as_deref());
    Json(NavigationResponse { queued })
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStatsResponse> {
    let engine = &state.engine;
    Json(CacheStatsResponse {
        config: engine.configs().get_cache_stats(),
        assets: engine.assets().stats(),
        performance: engine.configs().performance_report(),
    })
}
