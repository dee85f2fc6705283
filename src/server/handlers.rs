//! Admin HTTP handlers.
//!
//! Pool management and read-only reporting for operators and the engine
//! lifecycle tooling.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::error::{ProxyError, Result};
use crate::pool::{EngineFamily, InstanceSnapshot, MetricsSnapshot};
use crate::server::AppState;

/// Request body for installing a pool for one backend instance.
#[derive(Debug, Deserialize)]
pub struct CreatePoolRequest {
    pub capacity: usize,
    pub scene_id: String,
    pub host: String,
}

/// Health check endpoint.
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let degraded = state.registry.enabled_families().into_iter().any(|family| {
        state
            .registry
            .metrics_snapshot(family)
            .map(|snapshot| snapshot.degraded)
            .unwrap_or(false)
    });

    Json(serde_json::json!({
        "status": if degraded { "degraded" } else { "healthy" },
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "pools_created": state.registry.stats().created(),
        "pools_released": state.registry.stats().released(),
    }))
}

/// Prometheus metrics endpoint.
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Load report for one family.
pub async fn pool_snapshot(
    State(state): State<Arc<AppState>>,
    Path(family): Path<String>,
) -> Result<Json<MetricsSnapshot>> {
    let family: EngineFamily = family.parse()?;
    Ok(Json(state.registry.metrics_snapshot(family)?))
}

/// Install or replace the pool for one backend instance.
pub async fn create_pool(
    State(state): State<Arc<AppState>>,
    Path(family): Path<String>,
    Json(request): Json<CreatePoolRequest>,
) -> Result<(StatusCode, Json<InstanceSnapshot>)> {
    let family: EngineFamily = family.parse()?;
    let pool = state
        .registry
        .create_pools_for_instance(family, request.capacity, &request.scene_id, &request.host)
        .await?;

    info!("Installed {} pool {} at {}", family, pool.name(), pool.address());
    let stats = pool.stats();
    Ok((
        StatusCode::CREATED,
        Json(InstanceSnapshot {
            name: stats.name,
            leased: stats.leased,
            idle: stats.idle,
            capacity: stats.capacity,
            address: stats.address,
            healthy: stats.healthy,
        }),
    ))
}

/// Drain and remove one pool.
pub async fn release_pool(
    State(state): State<Arc<AppState>>,
    Path((family, pool_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let family: EngineFamily = family.parse()?;
    state.registry.release_pool(&pool_id, family).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Schedule a pool recreation after an instance update.
pub async fn migrate_pool(
    State(state): State<Arc<AppState>>,
    Path((family, scene_id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let family: EngineFamily = family.parse()?;
    let reconciler = state
        .reconciler
        .clone()
        .ok_or_else(|| ProxyError::Validation("discovery is not enabled".to_string()))?;
    if state.registry.routing(family).is_none() {
        return Err(ProxyError::NotFound(format!("engine family {} is not configured", family)));
    }

    state.shutdown.spawn("migrate", move |shutdown| async move {
        match reconciler.migrate_after_update(family, &scene_id, shutdown).await {
            Ok(true) => info!("{} pool {} migrated", family, scene_id),
            Ok(false) => warn!("{} pool {} was not migrated", family, scene_id),
            Err(e) => warn!("{} pool {} migration failed: {}", family, scene_id, e),
        }
    });

    Ok(StatusCode::ACCEPTED)
}

/// Create the admin router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/pools/:family", get(pool_snapshot).post(create_pool))
        .route("/pools/:family/:pool_id", delete(release_pool))
        .route("/pools/:family/:pool_id/migrate", post(migrate_pool))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
