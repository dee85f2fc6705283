//! Process lifecycle and observability: graceful shutdown, logging setup,
//! and Prometheus metrics.

pub mod graceful_shutdown;
pub mod metrics;
pub mod tracing;

pub use graceful_shutdown::{drain_tasks, GracefulShutdown};
pub use metrics::GatewayMetrics;
pub use self::tracing::{init_tracing, TracingConfig};
