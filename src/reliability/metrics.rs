//! Prometheus metrics collection and export.
//!
//! Counters are recorded through the `metrics` facade from wherever the event
//! happens; [`GatewayMetrics`] owns the Prometheus handle that renders them.

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Metrics recorder for the gateway.
#[derive(Clone)]
pub struct GatewayMetrics {
    prometheus_handle: PrometheusHandle,
}

impl GatewayMetrics {
    /// Install the global Prometheus recorder.
    pub fn install() -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let prometheus_handle = PrometheusBuilder::new().install_recorder()?;
        Self::register_metrics();
        info!("Metrics collection initialized");
        Ok(Self { prometheus_handle })
    }

    /// A recorder that is not installed globally; renders nothing recorded
    /// through the facade.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            prometheus_handle: recorder.handle(),
        }
    }

    fn register_metrics() {
        describe_counter!(
            "gateway_pool_created_total",
            "Connection pools created, by engine family"
        );
        describe_counter!(
            "gateway_pool_released_total",
            "Connection pools closed and removed, by engine family"
        );
        describe_counter!(
            "gateway_route_total",
            "Routing outcomes, by engine family and outcome"
        );
        describe_gauge!(
            "gateway_pool_healthy",
            "1 when the pool's backend answered its last probe, 0 otherwise"
        );
        describe_counter!(
            "gateway_reconcile_total",
            "Discovery reconciliation passes, by engine family"
        );
    }

    /// Get the Prometheus metrics as a string.
    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }
}

pub fn record_pool_created(family: &str) {
    counter!("gateway_pool_created_total", "family" => family.to_string()).increment(1);
}

pub fn record_pool_released(family: &str) {
    counter!("gateway_pool_released_total", "family" => family.to_string()).increment(1);
}

pub fn record_route(family: &str, outcome: &'static str) {
    counter!("gateway_route_total", "family" => family.to_string(), "outcome" => outcome).increment(1);
}

pub fn record_pool_health(family: &str, pool: &str, healthy: bool) {
    gauge!("gateway_pool_healthy", "family" => family.to_string(), "pool" => pool.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_reconcile(family: &str) {
    counter!("gateway_reconcile_total", "family" => family.to_string()).increment(1);
}
