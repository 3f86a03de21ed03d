/*!
 * # Health Check Module
 *
 * - Health check (`/health`): store reachability plus build version
 * - Liveness check (`/health/live`): the process is up and serving
 * - Version (`/health/version`): build information
 */

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error};
use utoipa::ToSchema;

use crate::AppState;

/// Basic health status
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Up,
    Down,
}

impl HealthStatus {
    fn status_code(self) -> StatusCode {
        match self {
            HealthStatus::Up => StatusCode::OK,
            HealthStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Store health as reported by `/health`
#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct StoreHealth {
    pub backend: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Overall health information
#[derive(Serialize, Deserialize, Debug, Clone, ToSchema)]
pub struct HealthInfo {
    pub status: HealthStatus,
    pub store: StoreHealth,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service healthy", body = HealthInfo),
        (status = 503, description = "Store unreachable", body = HealthInfo)
    ),
    tag = "Health"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    debug!("Health check endpoint called");

    let backend = state.store.backend_name().to_string();
    let store = match state.store.health_check().await {
        Ok(()) => StoreHealth {
            backend,
            status: HealthStatus::Up,
            message: None,
        },
        Err(e) => {
            error!(%backend, "Store health check failed: {}", e);
            StoreHealth {
                backend,
                status: HealthStatus::Down,
                message: Some(e.response_message()),
            }
        }
    };

    let info = HealthInfo {
        status: store.status,
        store,
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    };

    (info.status.status_code(), Json(info))
}

/// Liveness check endpoint
pub async fn liveness_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "alive": true,
            "timestamp": Utc::now(),
        })),
    )
}

/// Returns build and version information
pub async fn version_info() -> impl IntoResponse {
    Json(json!({
        "name": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/live", get(liveness_check))
        .route("/health/version", get(version_info))
}
