//! Admin Handlers
//!
//! Health check, probe and statistics endpoints.

use std::sync::Arc;

use axum::{Extension, Json};

use crate::protocol::rest::dto::{ApiResponse, HealthDto, StatsDto};
use crate::protocol::TableHandler;

fn health_dto(handler: &TableHandler, status: &str) -> HealthDto {
    HealthDto {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: handler.uptime_seconds(),
    }
}

/// Health check endpoint
pub async fn health(
    Extension(handler): Extension<Arc<TableHandler>>,
) -> Json<ApiResponse<HealthDto>> {
    Json(ApiResponse::success(health_dto(&handler, "healthy")))
}

/// Liveness probe: the process is serving requests.
pub async fn liveness(
    Extension(handler): Extension<Arc<TableHandler>>,
) -> Json<ApiResponse<HealthDto>> {
    Json(ApiResponse::success(health_dto(&handler, "alive")))
}

/// Readiness probe. The store is in memory, so it is ready as soon as the
/// listener is.
pub async fn readiness(
    Extension(handler): Extension<Arc<TableHandler>>,
) -> Json<ApiResponse<HealthDto>> {
    Json(ApiResponse::success(health_dto(&handler, "ready")))
}

/// Server statistics endpoint
pub async fn stats(Extension(handler): Extension<Arc<TableHandler>>) -> Json<ApiResponse<StatsDto>> {
    let stats = handler.stats();
    Json(ApiResponse::success(StatsDto {
        tables: stats.tables,
        requests: stats.requests,
        batches: stats.batches,
        errors: stats.errors,
        uptime_secs: stats.uptime_secs,
    }))
}
