//! Discovery reconciliation.
//!
//! Keeps a family's per-instance pools in line with the live instances the
//! orchestration layer reports. Instance names carry the desired capacity, so
//! a pool is recreated whenever the encoded capacity changes.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::defaults::MIGRATE_DELAY_SECS;
use crate::discovery::probe::Prober;
use crate::discovery::source::{InstanceSource, LiveInstance, Selector};
use crate::error::{ProxyError, Result};
use crate::pool::{EngineFamily, FamilyRouting, InstanceName, PoolRegistry};
use crate::reliability::metrics::record_reconcile;

/// What one reconciliation pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub released: usize,
    /// Pools already matching their instance.
    pub skipped: usize,
    /// New instances that did not answer a probe.
    pub unreachable: usize,
    /// Names that do not parse as `<family>-<capacity>-<scene>`.
    pub invalid: usize,
    /// Pool creations that failed to dial; retried next pass.
    pub failed: usize,
}

fn selector(routing: &FamilyRouting) -> Selector {
    Selector {
        key: routing.selector_key.clone(),
        value: routing.selector_value.clone(),
    }
}

pub struct Reconciler {
    registry: Arc<PoolRegistry>,
    source: Arc<dyn InstanceSource>,
    prober: Arc<dyn Prober>,
    probe_timeout: Duration,
    migrate_delay: Duration,
}

impl Reconciler {
    pub fn new(
        registry: Arc<PoolRegistry>,
        source: Arc<dyn InstanceSource>,
        prober: Arc<dyn Prober>,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            source,
            prober,
            probe_timeout,
            migrate_delay: Duration::from_secs(MIGRATE_DELAY_SECS),
        }
    }

    /// How long [`Reconciler::migrate_after_update`] waits before recreating.
    pub fn with_migrate_delay(mut self, delay: Duration) -> Self {
        self.migrate_delay = delay;
        self
    }

    fn routing(&self, family: EngineFamily) -> Result<&FamilyRouting> {
        self.registry
            .routing(family)
            .ok_or_else(|| ProxyError::NotFound(format!("engine family {} is not configured", family)))
    }

    /// Live instances with parseable names, plus how many names were rejected.
    async fn live_instances(
        &self,
        routing: &FamilyRouting,
    ) -> Result<(Vec<(LiveInstance, InstanceName)>, usize)> {
        let instances = self.source.list_live_instances(&selector(routing)).await?;

        let mut invalid = 0;
        let parsed = instances
            .into_iter()
            .filter_map(|instance| match InstanceName::parse(&instance.name) {
                Ok(name) => Some((instance, name)),
                Err(e) => {
                    debug!("Ignoring instance: {}", e);
                    invalid += 1;
                    None
                }
            })
            .collect();
        Ok((parsed, invalid))
    }

    async fn reachable(&self, routing: &FamilyRouting, host: &str) -> bool {
        let address = format!("{}:{}", host, routing.service_port);
        self.prober.check_reachable(&address, self.probe_timeout).await
    }

    /// Run one pass over the family's live instances.
    ///
    /// A resized instance has its pool replaced in a single registry step, so
    /// the scene stays routable throughout.
    pub async fn reconcile_once(&self, family: EngineFamily) -> Result<ReconcileReport> {
        let routing = self.routing(family)?;
        let (listed, invalid) = self.live_instances(routing).await?;

        let mut report = ReconcileReport {
            invalid,
            ..ReconcileReport::default()
        };
        for (instance, name) in listed {
            if name.family != family {
                continue;
            }

            let desired = self.registry.shared_capacity(name.capacity);
            let resized = match self.registry.pool(family, &name.scene_id) {
                Some(existing) if existing.capacity() == desired => {
                    report.skipped += 1;
                    continue;
                }
                Some(existing) => {
                    info!(
                        "{} instance {} resized from {} to {}",
                        family,
                        name.scene_id,
                        existing.capacity(),
                        desired
                    );
                    true
                }
                None => {
                    if !self.reachable(routing, &instance.address).await {
                        debug!("{} instance {} is not reachable yet", family, instance.name);
                        report.unreachable += 1;
                        continue;
                    }
                    false
                }
            };

            match self
                .registry
                .create_pools_for_instance(family, name.capacity, &name.scene_id, &instance.address)
                .await
            {
                Ok(pool) => {
                    info!("Discovered {} pool {} at {}", family, pool.name(), pool.address());
                    report.created += 1;
                    if resized {
                        report.released += 1;
                    }
                }
                Err(e) => {
                    warn!("Failed to create {} pool for {}: {}", family, instance.name, e);
                    report.failed += 1;
                }
            }
        }

        record_reconcile(family.as_str());
        Ok(report)
    }

    /// Reconcile `family` every discovery interval until `shutdown` fires.
    pub async fn run(&self, family: EngineFamily, shutdown: CancellationToken) {
        let interval = match self.routing(family) {
            Ok(routing) => routing.discovery_interval,
            Err(e) => {
                warn!("Discovery not started: {}", e);
                return;
            }
        };

        info!("Discovery loop started for {} every {:?}", family, interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.reconcile_once(family) => match result {
                    Ok(report) if report.created + report.released > 0 => {
                        info!("{} discovery: {:?}", family, report);
                    }
                    Ok(report) => debug!("{} discovery: {:?}", family, report),
                    Err(e) => warn!("{} discovery pass failed: {}", family, e),
                },
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Discovery loop stopped for {}", family);
    }

    /// After an instance update, wait the migrate delay and recreate the pool
    /// for `scene_id` from the live listing, whatever its capacity.
    ///
    /// Returns whether a pool was recreated.
    pub async fn migrate_after_update(
        &self,
        family: EngineFamily,
        scene_id: &str,
        shutdown: CancellationToken,
    ) -> Result<bool> {
        let routing = self.routing(family)?;

        tokio::select! {
            _ = shutdown.cancelled() => return Ok(false),
            _ = tokio::time::sleep(self.migrate_delay) => {}
        }

        let (live, _) = self.live_instances(routing).await?;
        let Some((instance, name)) = live
            .into_iter()
            .find(|(_, name)| name.family == family && name.scene_id == scene_id)
        else {
            warn!("{} instance {} not found after update", family, scene_id);
            return Ok(false);
        };

        if !self.reachable(routing, &instance.address).await {
            warn!("{} instance {} not reachable after update", family, instance.name);
            return Ok(false);
        }

        let pool = self
            .registry
            .create_pools_for_instance(family, name.capacity, &name.scene_id, &instance.address)
            .await?;
        info!("Migrated {} pool {} to {}", family, pool.name(), pool.address());
        Ok(true)
    }
}
