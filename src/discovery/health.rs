//! Periodic backend health probing.
//!
//! Each sweep probes every pool of one family. A failed probe is retried a few
//! times before the pool is marked down; any successful probe marks it up.
//! Health is tracked per pool only; aggregate state is derived on demand.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::HealthConfig;
use crate::discovery::probe::Prober;
use crate::pool::{ConnectionPool, EngineFamily, PoolRegistry};
use crate::reliability::metrics::record_pool_health;

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub up: usize,
    pub down: usize,
}

pub struct HealthMonitor {
    registry: Arc<PoolRegistry>,
    prober: Arc<dyn Prober>,
    config: HealthConfig,
}

impl HealthMonitor {
    pub fn new(registry: Arc<PoolRegistry>, prober: Arc<dyn Prober>, config: HealthConfig) -> Self {
        Self {
            registry,
            prober,
            config,
        }
    }

    /// Probe every pool of `family` once and update its health flag.
    pub async fn check_once(&self, family: EngineFamily) -> HealthReport {
        let pools = self.registry.pools(family);
        let results = futures::future::join_all(pools.iter().map(|pool| self.probe(pool))).await;

        let mut report = HealthReport::default();
        for (pool, healthy) in pools.iter().zip(results) {
            let was_healthy = pool.set_healthy(healthy);
            record_pool_health(family.as_str(), pool.name(), healthy);

            match (was_healthy, healthy) {
                (true, false) => error!("{} pool {} ({}) is down", family, pool.name(), pool.address()),
                (false, true) => info!("{} pool {} ({}) is back up", family, pool.name(), pool.address()),
                _ => {}
            }

            if healthy {
                report.up += 1;
            } else {
                report.down += 1;
            }
        }
        report
    }

    async fn probe(&self, pool: &ConnectionPool) -> bool {
        let timeout = self.config.probe_timeout;
        if self.prober.check_reachable(pool.address(), timeout).await {
            return true;
        }

        for attempt in 1..=self.config.retry_attempts {
            tokio::time::sleep(self.config.retry_delay).await;
            if self.prober.check_reachable(pool.address(), timeout).await {
                debug!("{} reachable again on retry {}", pool.address(), attempt);
                return true;
            }
        }
        false
    }

    /// Sweep `family` every `interval` until `shutdown` fires.
    pub async fn run(&self, family: EngineFamily, shutdown: CancellationToken) {
        info!("Health loop started for {}", family);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                report = self.check_once(family) => {
                    if report.down > 0 {
                        debug!("{} health sweep: {} up, {} down", family, report.up, report.down);
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!("Health loop stopped for {}", family);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, GatewayConfig};
    use crate::pool::GrpcDialer;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Answers from a per-address script of results; the last entry repeats.
    #[derive(Default)]
    struct ScriptedProber {
        script: Mutex<HashMap<String, Vec<bool>>>,
        calls: Mutex<HashMap<String, usize>>,
    }

    impl ScriptedProber {
        fn set(&self, address: &str, answers: &[bool]) {
            self.script.lock().insert(address.to_string(), answers.to_vec());
            self.calls.lock().remove(address);
        }

        fn calls(&self, address: &str) -> usize {
            self.calls.lock().get(address).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn check_reachable(&self, address: &str, _timeout: Duration) -> bool {
            let call = {
                let mut calls = self.calls.lock();
                let count = calls.entry(address.to_string()).or_insert(0);
                *count += 1;
                *count - 1
            };
            let script = self.script.lock();
            let answers = script.get(address).map(Vec::as_slice).unwrap_or(&[true]);
            answers.get(call).or(answers.last()).copied().unwrap_or(true)
        }
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.health.retry_delay = Duration::from_millis(1);
        config.engines = vec![EngineConfig {
            family: EngineFamily::Asr,
            enabled: true,
            proxy_port: "50051".to_string(),
            server_port: "9000".to_string(),
            selector_value: "asr".to_string(),
            reusable: true,
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            acquire_timeout: Duration::ZERO,
            discovery_interval: Duration::ZERO,
            backends: Vec::new(),
        }];
        config
    }

    async fn monitor() -> (HealthMonitor, Arc<PoolRegistry>, Arc<ScriptedProber>) {
        let config = config();
        let registry = Arc::new(PoolRegistry::new(&config, Arc::new(GrpcDialer::lazy())));
        for (scene, host) in [("scene01", "10.0.0.1"), ("scene02", "10.0.0.2")] {
            registry
                .create_pools_for_instance(EngineFamily::Asr, 1, scene, host)
                .await
                .unwrap();
        }
        let prober = Arc::new(ScriptedProber::default());
        let monitor = HealthMonitor::new(registry.clone(), prober.clone(), config.health);
        (monitor, registry, prober)
    }

    #[tokio::test]
    async fn test_pool_marked_down_after_retries() {
        let (monitor, registry, prober) = monitor().await;
        prober.set("10.0.0.1:9000", &[false]);

        let report = monitor.check_once(EngineFamily::Asr).await;
        assert_eq!(report, HealthReport { up: 1, down: 1 });
        // First probe plus five retries.
        assert_eq!(prober.calls("10.0.0.1:9000"), 6);
        assert!(!registry.pool(EngineFamily::Asr, "scene01").unwrap().is_healthy());
        assert!(registry.pool(EngineFamily::Asr, "scene02").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_transient_failure_stays_up() {
        let (monitor, registry, prober) = monitor().await;
        prober.set("10.0.0.1:9000", &[false, false, true]);

        let report = monitor.check_once(EngineFamily::Asr).await;
        assert_eq!(report.down, 0);
        assert_eq!(prober.calls("10.0.0.1:9000"), 3);
        assert!(registry.pool(EngineFamily::Asr, "scene01").unwrap().is_healthy());
    }

    #[tokio::test]
    async fn test_one_recovery_does_not_clear_other_failures() {
        let (monitor, registry, prober) = monitor().await;
        prober.set("10.0.0.1:9000", &[false]);
        prober.set("10.0.0.2:9000", &[false]);
        monitor.check_once(EngineFamily::Asr).await;

        prober.set("10.0.0.2:9000", &[true]);
        monitor.check_once(EngineFamily::Asr).await;

        assert!(!registry.pool(EngineFamily::Asr, "scene01").unwrap().is_healthy());
        assert!(registry.pool(EngineFamily::Asr, "scene02").unwrap().is_healthy());
        assert!(registry.metrics_snapshot(EngineFamily::Asr).unwrap().degraded);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (monitor, _, _) = monitor().await;
        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { monitor.run(EngineFamily::Asr, shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();
        assert!(tokio::time::timeout(Duration::from_millis(200), handle).await.is_ok());
    }
}
