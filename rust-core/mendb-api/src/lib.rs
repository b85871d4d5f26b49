// SPDX-License-Identifier: PMPL-1.0-or-later
//! MendDB API
//!
//! Wires the detector and fixer loops together and exposes the shared state
//! over HTTP: the full status snapshot, a liveness probe and prometheus
//! metrics. Every endpoint is read-only.

#![forbid(unsafe_code)]

pub mod config;
pub mod orchestrator;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, IntGauge, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, instrument};

use mendb_detect::DetectError;
use mendb_fixer::FixError;
use mendb_state::{SharedState, StateError, StateSnapshot, SystemStatus};

pub use config::{ConfigError, MendConfig, ServerConfig, CONFIG_ENV};
pub use orchestrator::Orchestrator;

/// API errors
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Detector error: {0}")]
    Detect(#[from] DetectError),

    #[error("Fixer error: {0}")]
    Fix(#[from] FixError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
        });

        (status, body).into_response()
    }
}

/// Error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: SystemStatus,
    pub version: String,
    pub uptime_seconds: u64,
    pub repository_reachable: bool,
}

/// Application state shared by the handlers
#[derive(Clone)]
pub struct AppState {
    pub state: Arc<SharedState>,
    pub registry: Registry,
    queue_depth: IntGauge,
    pub start_time: Instant,
}

impl AppState {
    /// Registers the queue depth gauge on `registry`.
    pub fn new(state: Arc<SharedState>, registry: Registry) -> Result<Self, ApiError> {
        let queue_depth = IntGauge::new("mendb_queue_depth", "Anomalies waiting to be fixed")
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        registry
            .register(Box::new(queue_depth.clone()))
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        Ok(Self {
            state,
            registry,
            queue_depth,
            start_time: Instant::now(),
        })
    }
}

/// Build the status router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/status", get(status_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Liveness handler
#[instrument(skip(app))]
async fn health_handler(State(app): State<AppState>) -> Result<Json<HealthResponse>, ApiError> {
    let snapshot = app.state.snapshot()?;
    Ok(Json(HealthResponse {
        status: snapshot.health.status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: app.start_time.elapsed().as_secs(),
        repository_reachable: snapshot.health.repository_reachable,
    }))
}

/// Full snapshot of statistics, health and the recent lists
#[instrument(skip(app))]
async fn status_handler(State(app): State<AppState>) -> Result<Json<StateSnapshot>, ApiError> {
    Ok(Json(app.state.snapshot()?))
}

#[instrument(skip(app))]
async fn metrics_handler(State(app): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    app.queue_depth.set(app.state.queue_depth() as i64);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&app.registry.gather(), &mut buffer)
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    Ok((
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    ))
}

/// Serve the status router until `shutdown` resolves
pub async fn serve<F>(state: AppState, config: &ServerConfig, shutdown: F) -> Result<(), ApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting MendDB status server on {}", addr);

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
