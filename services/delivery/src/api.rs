//! HTTP ingress for the delivery pipeline.

use crate::config::ApiConfig;
use crate::error::{PipelineError, Result as PipelineResult};
use crate::matching::Gallery;
use crate::pipeline::RequestPipeline;
use crate::request_store::RequestStore;
use crate::status::{StatusQuery, StatusView};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RequestPipeline>,
    pub status: Arc<StatusQuery>,
    pub gallery: Gallery,
    pub store: Arc<dyn RequestStore>,
}

/// Frame upload body
#[derive(Debug, Deserialize)]
pub struct UploadFramesRequest {
    #[serde(default)]
    pub request_id: String,
    /// Base64 images, optionally as data URLs
    #[serde(default)]
    pub frames: Vec<String>,
}

/// Submission body
#[derive(Debug, Deserialize)]
pub struct StoreEmailRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub event_name: String,
}

/// Status lookup, as query string or JSON body
#[derive(Debug, Deserialize)]
pub struct StatusParams {
    #[serde(default)]
    pub request_id: String,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/upload_frames", post(upload_frames))
        .route("/store_email", post(store_email))
        .route("/status", get(status_by_query).post(status_by_body))
        .route("/list_events", get(list_events))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "delivery-service"
    }))
}

async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Stage probe frames for a request
#[instrument(skip(state, body), fields(request_id = %body.request_id, frame_count = body.frames.len()))]
async fn upload_frames(
    State(state): State<AppState>,
    Json(body): Json<UploadFramesRequest>,
) -> PipelineResult<Json<Value>> {
    if body.request_id.is_empty() {
        return Err(PipelineError::InvalidInput("request_id is required".to_string()));
    }
    if body.frames.is_empty() {
        return Err(PipelineError::NoFrames(body.request_id));
    }

    state
        .pipeline
        .stage_frames(&body.request_id, &body.frames)
        .await?;

    Ok(Json(json!({ "status": "ok" })))
}

/// Create the request and start matching in the background
#[instrument(skip(state, body), fields(request_id = %body.request_id))]
async fn store_email(
    State(state): State<AppState>,
    Json(body): Json<StoreEmailRequest>,
) -> PipelineResult<Json<Value>> {
    if body.email.trim().is_empty() || body.request_id.is_empty() || body.event_name.trim().is_empty() {
        return Err(PipelineError::InvalidInput(
            "email, request_id and event_name are required".to_string(),
        ));
    }

    let request = state
        .pipeline
        .submit(&body.request_id, &body.email, &body.event_name)
        .await?;

    Ok(Json(json!({ "status": "ok", "request_id": request.id })))
}

async fn status_by_query(
    State(state): State<AppState>,
    Query(params): Query<StatusParams>,
) -> PipelineResult<Json<StatusView>> {
    lookup_status(&state, &params.request_id).await
}

async fn status_by_body(
    State(state): State<AppState>,
    Json(params): Json<StatusParams>,
) -> PipelineResult<Json<StatusView>> {
    lookup_status(&state, &params.request_id).await
}

async fn lookup_status(state: &AppState, request_id: &str) -> PipelineResult<Json<StatusView>> {
    if request_id.is_empty() {
        return Err(PipelineError::InvalidInput("request_id is required".to_string()));
    }
    Ok(Json(state.status.get_status(request_id).await?))
}

async fn list_events(State(state): State<AppState>) -> PipelineResult<Json<Value>> {
    let events = state.gallery.list_events().await?;
    Ok(Json(json!({ "status": "ok", "events": events })))
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting delivery API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
