//! Application state for dependency injection.
//!
//! This module provides the state shared between all admin request handlers.

use std::sync::Arc;

use crate::discovery::Reconciler;
use crate::pool::PoolRegistry;
use crate::reliability::{GatewayMetrics, GracefulShutdown};

/// Shared application state containing dependencies.
#[derive(Clone)]
pub struct AppState {
    /// Every connection and tenant pool in the process
    pub registry: Arc<PoolRegistry>,

    /// Present only when discovery is running (dynamic routing mode)
    pub reconciler: Option<Arc<Reconciler>>,

    /// Prometheus handle for `/metrics`
    pub metrics: GatewayMetrics,

    /// Background tasks spawned by handlers stop with the process
    pub shutdown: GracefulShutdown,
}

impl AppState {
    pub fn new(
        registry: Arc<PoolRegistry>,
        reconciler: Option<Arc<Reconciler>>,
        metrics: GatewayMetrics,
        shutdown: GracefulShutdown,
    ) -> Self {
        Self {
            registry,
            reconciler,
            metrics,
            shutdown,
        }
    }
}
