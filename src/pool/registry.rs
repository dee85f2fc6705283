//! Process-wide pool registry.
//!
//! One [`PoolRegistry`] is built at startup and shared (behind an `Arc`) by the
//! routing director, the health and discovery loops, and the admin surface.
//! Pools are inserted only once fully dialed, so a routing read either sees a
//! complete pool or none at all. Structural changes for a family (create,
//! replace, release) are serialized by a per-family lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tracing::info;

use crate::config::{ClusterConfig, GatewayConfig, NetworkMode, RoutingMode, TenantConfig};
use crate::error::{ProxyError, Result};
use crate::pool::connection::{ConnectionPool, PoolPolicy};
use crate::pool::dial::Dial;
use crate::pool::tenant::TenantPool;
use crate::pool::EngineFamily;
use crate::reliability::metrics::{record_pool_created, record_pool_released};

/// A backend instance name of the form `<family>-<capacity>-<scene>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceName {
    pub family: EngineFamily,
    pub capacity: usize,
    pub scene_id: String,
}

impl InstanceName {
    pub fn parse(name: &str) -> Result<Self> {
        let invalid = || ProxyError::Validation(format!("malformed instance name '{}'", name));

        let parts: Vec<&str> = name.split('-').collect();
        let [family, capacity, scene_id] = parts.as_slice() else {
            return Err(invalid());
        };

        let family = family.parse::<EngineFamily>().map_err(|_| invalid())?;
        let capacity = capacity.parse::<usize>().map_err(|_| invalid())?;
        if capacity == 0 || scene_id.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            family,
            capacity,
            scene_id: scene_id.to_string(),
        })
    }
}

/// Routing configuration derived for one family at startup.
#[derive(Debug, Clone)]
pub struct FamilyRouting {
    pub family: EngineFamily,
    pub enabled: bool,
    /// Address key inbound calls must present to reach this family.
    pub external_addr: String,
    /// Port the family's backends listen on.
    pub service_port: String,
    pub selector_key: String,
    pub selector_value: String,
    pub policy: PoolPolicy,
    pub discovery_interval: Duration,
}

struct FamilyPools {
    routing: FamilyRouting,
    pools: DashMap<String, ConnectionPool>,
    tenants: DashMap<String, TenantPool>,
    structure: tokio::sync::Mutex<()>,
}

impl FamilyPools {
    fn sorted_pools(&self) -> Vec<ConnectionPool> {
        let mut pools: Vec<ConnectionPool> =
            self.pools.iter().map(|entry| entry.value().clone()).collect();
        pools.sort_by(|a, b| a.name().cmp(b.name()));
        pools
    }
}

/// Lifetime pool creation/release counts.
#[derive(Debug, Default)]
pub struct RegistryStats {
    pub pools_created: AtomicU64,
    pub pools_released: AtomicU64,
}

impl RegistryStats {
    pub fn created(&self) -> u64 {
        self.pools_created.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> u64 {
        self.pools_released.load(Ordering::Relaxed)
    }
}

/// One connection pool as reported by [`PoolRegistry::metrics_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceSnapshot {
    pub name: String,
    pub leased: usize,
    pub idle: usize,
    pub capacity: usize,
    pub address: String,
    pub healthy: bool,
}

/// One tenant pool as reported by [`PoolRegistry::metrics_snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TenantSnapshot {
    pub tenant_id: String,
    pub tenant_name: String,
    pub leased: usize,
    pub idle: usize,
    pub capacity: usize,
    pub address: String,
}

/// Read-only load report for one family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub family: EngineFamily,
    pub enabled: bool,
    /// At least one pool is currently marked down.
    pub degraded: bool,
    pub instances: Vec<InstanceSnapshot>,
    pub tenants: Vec<TenantSnapshot>,
}

/// Leased count for reporting; a pool with all handles idle reports zero.
fn reported_leased(idle: usize, capacity: usize) -> usize {
    if idle >= capacity {
        0
    } else {
        capacity - idle
    }
}

/// Owner of every connection pool and tenant pool in the process.
pub struct PoolRegistry {
    network_mode: NetworkMode,
    routing_mode: RoutingMode,
    cluster: ClusterConfig,
    dialer: Arc<dyn Dial>,
    families: HashMap<EngineFamily, FamilyPools>,
    stats: RegistryStats,
}

impl PoolRegistry {
    /// Build an empty registry with routing derived from `config`.
    pub fn new(config: &GatewayConfig, dialer: Arc<dyn Dial>) -> Self {
        let families = config
            .engines
            .iter()
            .map(|engine| {
                let routing = FamilyRouting {
                    family: engine.family,
                    enabled: engine.enabled,
                    external_addr: config.external_addr(engine),
                    service_port: engine.server_port.clone(),
                    selector_key: config.discovery.selector_key.clone(),
                    selector_value: engine.selector_value.clone(),
                    policy: engine.policy(),
                    discovery_interval: if engine.discovery_interval.is_zero() {
                        config.discovery.interval
                    } else {
                        engine.discovery_interval
                    },
                };
                let pools = FamilyPools {
                    routing,
                    pools: DashMap::new(),
                    tenants: DashMap::new(),
                    structure: tokio::sync::Mutex::new(()),
                };
                (engine.family, pools)
            })
            .collect();

        Self {
            network_mode: config.settings.network_mode,
            routing_mode: config.settings.routing_mode,
            cluster: config.cluster.clone(),
            dialer,
            families,
            stats: RegistryStats::default(),
        }
    }

    fn family(&self, family: EngineFamily) -> Result<&FamilyPools> {
        self.families
            .get(&family)
            .ok_or_else(|| ProxyError::NotFound(format!("engine family {} is not configured", family)))
    }

    fn enabled_family(&self, family: EngineFamily) -> Result<&FamilyPools> {
        let pools = self.family(family)?;
        if !pools.routing.enabled {
            return Err(ProxyError::Validation(format!("engine family {} is disabled", family)));
        }
        Ok(pools)
    }

    /// Create one pool per statically declared backend.
    ///
    /// Any dial failure aborts startup. Skipped in dynamic mode, where pools
    /// come from discovery instead.
    pub async fn initialize_static(&self, config: &GatewayConfig) -> Result<()> {
        if self.routing_mode == RoutingMode::Dynamic {
            info!("Dynamic routing enabled, ignoring statically declared backends");
            return Ok(());
        }

        for engine in config.engines.iter().filter(|engine| engine.enabled) {
            let family = self.family(engine.family)?;
            for backend in &engine.backends {
                let address = format!("{}:{}", backend.host, engine.server_port);
                let pool = ConnectionPool::create(
                    uuid::Uuid::new_v4().to_string(),
                    address,
                    self.cluster.share(backend.capacity),
                    family.routing.policy.clone(),
                    self.dialer.clone(),
                )
                .await?;
                family.pools.insert(pool.name().to_string(), pool);
                self.record_created(engine.family);
            }
        }
        Ok(())
    }

    /// Reserve every tenant's capacity from its family's pools.
    ///
    /// Fails with [`ProxyError::Allocation`] when the family cannot cover a
    /// tenant; callers treat that as fatal.
    pub async fn initialize_tenants(&self, tenants: &[TenantConfig]) -> Result<()> {
        for config in tenants {
            let family = self.enabled_family(config.family)?;
            let _guard = family.structure.lock().await;
            let pools = family.sorted_pools();
            let tenant = TenantPool::reserve(config, &pools).await?;
            if let Some(previous) = family.tenants.insert(config.tenant_id.clone(), tenant) {
                previous.close();
            }
        }
        Ok(())
    }

    /// Capacity this replica pools for a backend declaring `declared`.
    pub fn shared_capacity(&self, declared: usize) -> usize {
        self.cluster.share(declared)
    }

    /// Install (or replace) the pool for one provisioned backend instance.
    ///
    /// The pool is keyed by `scene_id` and dials `host` on the family's
    /// service port. A replaced pool is closed once the new one is in place.
    pub async fn create_pools_for_instance(
        &self,
        family: EngineFamily,
        capacity: usize,
        scene_id: &str,
        host: &str,
    ) -> Result<ConnectionPool> {
        if capacity == 0 {
            return Err(ProxyError::Validation("capacity must be at least 1".to_string()));
        }
        if scene_id.is_empty() || host.is_empty() {
            return Err(ProxyError::Validation("scene_id and host are required".to_string()));
        }

        let pools = self.enabled_family(family)?;
        let address = format!("{}:{}", host, pools.routing.service_port);

        let _guard = pools.structure.lock().await;
        let pool = ConnectionPool::create(
            scene_id,
            address,
            self.cluster.share(capacity),
            pools.routing.policy.clone(),
            self.dialer.clone(),
        )
        .await?;

        if let Some(previous) = pools.pools.insert(scene_id.to_string(), pool.clone()) {
            previous.close();
            self.record_released(family);
        }
        self.record_created(family);
        Ok(pool)
    }

    /// Close and remove one pool.
    pub async fn release_pool(&self, pool_id: &str, family: EngineFamily) -> Result<()> {
        let pools = self.family(family)?;
        let _guard = pools.structure.lock().await;
        let Some((_, pool)) = pools.pools.remove(pool_id) else {
            return Err(ProxyError::NotFound(format!("{} pool {}", family, pool_id)));
        };
        pool.close();
        self.record_released(family);
        info!("Released {} pool {}", family, pool_id);
        Ok(())
    }

    /// Every connection pool of `family`, ordered by name.
    pub fn pools(&self, family: EngineFamily) -> Vec<ConnectionPool> {
        self.families
            .get(&family)
            .map(FamilyPools::sorted_pools)
            .unwrap_or_default()
    }

    pub fn pool(&self, family: EngineFamily, pool_id: &str) -> Option<ConnectionPool> {
        self.families
            .get(&family)?
            .pools
            .get(pool_id)
            .map(|entry| entry.value().clone())
    }

    pub fn tenant(&self, family: EngineFamily, tenant_id: &str) -> Option<TenantPool> {
        self.families
            .get(&family)?
            .tenants
            .get(tenant_id)
            .map(|entry| entry.value().clone())
    }

    /// Every tenant pool of `family`, ordered by tenant id.
    pub fn tenants(&self, family: EngineFamily) -> Vec<TenantPool> {
        let Some(pools) = self.families.get(&family) else {
            return Vec::new();
        };
        let mut tenants: Vec<TenantPool> =
            pools.tenants.iter().map(|entry| entry.value().clone()).collect();
        tenants.sort_by(|a, b| a.tenant_id().cmp(b.tenant_id()));
        tenants
    }

    pub fn routing(&self, family: EngineFamily) -> Option<&FamilyRouting> {
        self.families.get(&family).map(|pools| &pools.routing)
    }

    /// Enabled families, in routing comparison order.
    pub fn enabled_families(&self) -> Vec<EngineFamily> {
        EngineFamily::ALL
            .into_iter()
            .filter(|family| self.families.get(family).is_some_and(|p| p.routing.enabled))
            .collect()
    }

    /// The family whose external address equals `key`, checking asr before tts.
    pub fn match_authority(&self, key: &str) -> Option<EngineFamily> {
        EngineFamily::ALL.into_iter().find(|family| {
            self.families
                .get(family)
                .is_some_and(|pools| pools.routing.enabled && pools.routing.external_addr == key)
        })
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.network_mode
    }

    pub fn routing_mode(&self) -> RoutingMode {
        self.routing_mode
    }

    pub fn stats(&self) -> &RegistryStats {
        &self.stats
    }

    /// Current load report for `family`. Never mutates routing state.
    pub fn metrics_snapshot(&self, family: EngineFamily) -> Result<MetricsSnapshot> {
        let pools = self.family(family)?;
        if !pools.routing.enabled {
            return Ok(MetricsSnapshot {
                family,
                enabled: false,
                degraded: false,
                instances: Vec::new(),
                tenants: Vec::new(),
            });
        }

        let instances: Vec<InstanceSnapshot> = pools
            .sorted_pools()
            .iter()
            .map(|pool| {
                let idle = pool.size();
                InstanceSnapshot {
                    name: pool.name().to_string(),
                    leased: reported_leased(idle, pool.capacity()),
                    idle,
                    capacity: pool.capacity(),
                    address: pool.address().to_string(),
                    healthy: pool.is_healthy(),
                }
            })
            .collect();

        let tenants = self
            .tenants(family)
            .iter()
            .map(|tenant| {
                let idle = tenant.size();
                TenantSnapshot {
                    tenant_id: tenant.tenant_id().to_string(),
                    tenant_name: tenant.tenant_name().to_string(),
                    leased: reported_leased(idle, tenant.capacity()),
                    idle,
                    capacity: tenant.capacity(),
                    address: tenant.remote_address().to_string(),
                }
            })
            .collect();

        Ok(MetricsSnapshot {
            family,
            enabled: true,
            degraded: instances.iter().any(|instance| !instance.healthy),
            instances,
            tenants,
        })
    }

    /// Close every tenant and connection pool. Used on shutdown.
    pub fn close_all(&self) {
        for pools in self.families.values() {
            for tenant in pools.tenants.iter() {
                tenant.value().close();
            }
            for pool in pools.pools.iter() {
                pool.value().close();
            }
        }
        info!("All pools closed");
    }

    fn record_created(&self, family: EngineFamily) {
        self.stats.pools_created.fetch_add(1, Ordering::Relaxed);
        record_pool_created(family.as_str());
    }

    fn record_released(&self, family: EngineFamily) {
        self.stats.pools_released.fetch_add(1, Ordering::Relaxed);
        record_pool_released(family.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, EngineConfig};
    use crate::pool::dial::GrpcDialer;

    fn engine(family: EngineFamily, proxy_port: &str, backends: &[(&str, usize)]) -> EngineConfig {
        EngineConfig {
            family,
            enabled: true,
            proxy_port: proxy_port.to_string(),
            server_port: "9000".to_string(),
            selector_value: family.to_string(),
            reusable: true,
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            acquire_timeout: Duration::ZERO,
            discovery_interval: Duration::ZERO,
            backends: backends
                .iter()
                .map(|(host, capacity)| BackendConfig {
                    host: host.to_string(),
                    capacity: *capacity,
                })
                .collect(),
        }
    }

    fn config() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.engines = vec![
            engine(EngineFamily::Asr, "50051", &[("10.0.0.1", 2), ("10.0.0.2", 3)]),
            engine(EngineFamily::Tts, "50052", &[("10.0.1.1", 4)]),
        ];
        config
    }

    fn registry(config: &GatewayConfig) -> PoolRegistry {
        PoolRegistry::new(config, Arc::new(GrpcDialer::lazy()))
    }

    #[test]
    fn test_instance_name_parsing() {
        let name = InstanceName::parse("asr-4-scene01").unwrap();
        assert_eq!(name.family, EngineFamily::Asr);
        assert_eq!(name.capacity, 4);
        assert_eq!(name.scene_id, "scene01");

        assert!(InstanceName::parse("asr-4").is_err());
        assert!(InstanceName::parse("asr-4-scene-01").is_err());
        assert!(InstanceName::parse("asr-four-scene01").is_err());
        assert!(InstanceName::parse("mt-4-scene01").is_err());
        assert!(InstanceName::parse("tts-0-scene01").is_err());
    }

    #[tokio::test]
    async fn test_static_initialization() {
        let config = config();
        let registry = registry(&config);
        registry.initialize_static(&config).await.unwrap();

        let asr = registry.pools(EngineFamily::Asr);
        assert_eq!(asr.len(), 2);
        assert_eq!(asr.iter().map(|p| p.capacity()).sum::<usize>(), 5);
        assert!(asr.iter().any(|p| p.address() == "10.0.0.2:9000"));
        assert_eq!(registry.pools(EngineFamily::Tts).len(), 1);
        assert_eq!(registry.stats().created(), 3);
    }

    #[tokio::test]
    async fn test_dynamic_mode_skips_static_backends() {
        let mut config = config();
        config.settings.routing_mode = RoutingMode::Dynamic;
        let registry = registry(&config);
        registry.initialize_static(&config).await.unwrap();
        assert!(registry.pools(EngineFamily::Asr).is_empty());
    }

    #[tokio::test]
    async fn test_cluster_share_applied() {
        let mut config = config();
        config.cluster = ClusterConfig { enabled: true, node_count: 2 };
        let registry = registry(&config);

        let pool = registry
            .create_pools_for_instance(EngineFamily::Asr, 5, "scene01", "10.0.0.9")
            .await
            .unwrap();
        assert_eq!(pool.capacity(), 3);
        assert_eq!(pool.address(), "10.0.0.9:9000");
    }

    #[tokio::test]
    async fn test_create_replaces_and_closes_previous_pool() {
        let config = config();
        let registry = registry(&config);

        let first = registry
            .create_pools_for_instance(EngineFamily::Asr, 2, "scene01", "10.0.0.9")
            .await
            .unwrap();
        let second = registry
            .create_pools_for_instance(EngineFamily::Asr, 4, "scene01", "10.0.0.9")
            .await
            .unwrap();

        assert!(first.is_closed());
        assert!(!second.is_closed());
        let current = registry.pool(EngineFamily::Asr, "scene01").unwrap();
        assert!(current.same_pool(&second));
        assert_eq!(registry.stats().created(), 2);
        assert_eq!(registry.stats().released(), 1);
    }

    #[tokio::test]
    async fn test_release_pool() {
        let config = config();
        let registry = registry(&config);
        let pool = registry
            .create_pools_for_instance(EngineFamily::Tts, 1, "scene02", "10.0.1.9")
            .await
            .unwrap();

        registry.release_pool("scene02", EngineFamily::Tts).await.unwrap();
        assert!(pool.is_closed());
        assert!(registry.pool(EngineFamily::Tts, "scene02").is_none());
        assert!(matches!(
            registry.release_pool("scene02", EngineFamily::Tts).await,
            Err(ProxyError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_match_authority() {
        let mut config = config();
        let registry = registry(&config);
        assert_eq!(registry.match_authority("50051"), Some(EngineFamily::Asr));
        assert_eq!(registry.match_authority("50052"), Some(EngineFamily::Tts));
        assert_eq!(registry.match_authority("50053"), None);

        config.engines[1].enabled = false;
        let registry = PoolRegistry::new(&config, Arc::new(GrpcDialer::lazy()));
        assert_eq!(registry.match_authority("50052"), None);
        assert_eq!(registry.enabled_families(), vec![EngineFamily::Asr]);
    }

    #[tokio::test]
    async fn test_tenant_initialization_over_capacity_is_fatal() {
        let mut config = config();
        config.settings.routing_mode = RoutingMode::Tenant;
        let registry = registry(&config);
        registry.initialize_static(&config).await.unwrap();

        let tenants = vec![TenantConfig {
            tenant_id: "scene01".to_string(),
            tenant_name: "Acme".to_string(),
            family: EngineFamily::Asr,
            capacity: 10,
        }];
        let result = registry.initialize_tenants(&tenants).await;
        assert!(matches!(result, Err(ProxyError::Allocation(_))));
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let mut config = config();
        config.settings.routing_mode = RoutingMode::Tenant;
        let registry = registry(&config);
        registry.initialize_static(&config).await.unwrap();
        registry
            .initialize_tenants(&[TenantConfig {
                tenant_id: "scene01".to_string(),
                tenant_name: "Acme".to_string(),
                family: EngineFamily::Tts,
                capacity: 1,
            }])
            .await
            .unwrap();

        let tts = registry.pools(EngineFamily::Tts);
        tts[0].set_healthy(false);
        let _lease = registry.tenant(EngineFamily::Tts, "scene01").unwrap().acquire().await.unwrap();

        let snapshot = registry.metrics_snapshot(EngineFamily::Tts).unwrap();
        assert!(snapshot.enabled);
        assert!(snapshot.degraded);
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.instances[0].capacity, 4);
        assert_eq!(snapshot.instances[0].leased, 1);
        assert_eq!(snapshot.instances[0].idle, 3);
        assert_eq!(snapshot.tenants.len(), 1);
        assert_eq!(snapshot.tenants[0].leased, 1);
        assert_eq!(snapshot.tenants[0].address, "10.0.1.1:9000");

        let asr = registry.metrics_snapshot(EngineFamily::Asr).unwrap();
        assert!(!asr.degraded);
        assert!(asr.instances.iter().all(|instance| instance.leased == 0));
    }

    #[tokio::test]
    async fn test_disabled_family_reports_empty_snapshot() {
        let mut config = config();
        config.engines[0].enabled = false;
        let registry = registry(&config);
        registry.initialize_static(&config).await.unwrap();

        let snapshot = registry.metrics_snapshot(EngineFamily::Asr).unwrap();
        assert!(!snapshot.enabled);
        assert!(snapshot.instances.is_empty());
        assert!(matches!(
            registry
                .create_pools_for_instance(EngineFamily::Asr, 1, "s", "10.0.0.1")
                .await,
            Err(ProxyError::Validation(_))
        ));
    }
}
