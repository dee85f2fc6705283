//! Admin HTTP surface.
//!
//! Serves health, Prometheus metrics, per-family pool snapshots and the pool
//! create/release/migrate operations used by engine lifecycle tooling.

mod handlers;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Result;

pub use handlers::{
    create_pool, create_router, health_check, metrics_handler, migrate_pool, pool_snapshot,
    release_pool, CreatePoolRequest,
};
pub use state::AppState;

/// Serve the admin router on `addr` until `shutdown` fires.
pub async fn serve_admin(
    addr: SocketAddr,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("Admin server listening on {}", listener.local_addr()?);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Admin server stopped");
    Ok(())
}
