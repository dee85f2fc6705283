//! Per-call routing decisions.

use std::sync::Arc;
use std::time::Duration;

use tonic::metadata::MetadataMap;
use tracing::{debug, warn};

use crate::config::{NetworkMode, RoutingMode};
use crate::error::{ProxyError, Result, RouteError};
use crate::pool::{select, ConnectionPool, EngineFamily, Lease, PoolRegistry, TenantPool};
use crate::proxy::token::{RoutingToken, TOKEN_METADATA_KEY};
use crate::reliability::metrics::record_route;

/// Where a call should go, before any lease is taken.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    Pool(ConnectionPool),
    Tenant(TenantPool),
}

/// A routed call: the family it matched and the lease it holds.
///
/// Dropping the target releases the lease.
#[derive(Debug)]
pub struct RouteTarget {
    pub family: EngineFamily,
    pub lease: Lease,
}

/// Picks a backend lease for each inbound call.
pub struct RoutingDirector {
    registry: Arc<PoolRegistry>,
    reserved_prefix: String,
}

impl RoutingDirector {
    pub fn new(registry: Arc<PoolRegistry>, reserved_prefix: impl Into<String>) -> Self {
        Self {
            registry,
            reserved_prefix: reserved_prefix.into(),
        }
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    /// The part of `authority` compared against family addresses.
    pub fn authority_key<'a>(&self, authority: &'a str) -> &'a str {
        match self.registry.network_mode() {
            NetworkMode::Strict => authority,
            NetworkMode::Global => authority
                .rsplit_once(':')
                .map_or(authority, |(_, port)| port),
        }
    }

    /// Decide the target pool without leasing anything.
    pub fn decide(
        &self,
        method: &str,
        authority: &str,
        metadata: &MetadataMap,
    ) -> std::result::Result<(EngineFamily, RouteDecision), RouteError> {
        if method.starts_with(&self.reserved_prefix) {
            return Err(RouteError::ReservedMethod(method.to_string()));
        }

        let family = self
            .registry
            .match_authority(self.authority_key(authority))
            .ok_or(RouteError::UnknownAuthority)?;

        let decision = match self.registry.routing_mode() {
            RoutingMode::Dynamic => {
                let id = Self::token_identity(metadata)?;
                self.registry
                    .pool(family, &id)
                    .map(RouteDecision::Pool)
                    .ok_or(RouteError::UnknownPool(id))?
            }
            RoutingMode::Tenant => {
                let id = Self::token_identity(metadata)?;
                self.registry
                    .tenant(family, &id)
                    .map(RouteDecision::Tenant)
                    .ok_or(RouteError::UnknownTenant(id))?
            }
            RoutingMode::Balanced => {
                let pools = self.registry.pools(family);
                select(&pools)
                    .cloned()
                    .map(RouteDecision::Pool)
                    .ok_or(RouteError::NoHealthyPool(family))?
            }
        };

        Ok((family, decision))
    }

    fn token_identity(metadata: &MetadataMap) -> std::result::Result<String, RouteError> {
        let raw = metadata
            .get(TOKEN_METADATA_KEY)
            .ok_or(RouteError::MissingToken)?
            .to_str()
            .map_err(|_| RouteError::TokenDecode)?;
        RoutingToken::parse(raw).map(|token| token.engine_id().to_string())
    }

    /// Decide and lease. `deadline` is the caller's remaining time budget and
    /// bounds the wait together with the pool's own acquire timeout.
    pub async fn route(
        &self,
        method: &str,
        authority: &str,
        metadata: &MetadataMap,
        deadline: Option<Duration>,
    ) -> Result<RouteTarget> {
        let (family, decision) = match self.decide(method, authority, metadata) {
            Ok(decided) => decided,
            Err(e) => {
                warn!("Rejected {} (authority {:?}): {}", method, authority, e);
                record_route("unknown", "rejected");
                return Err(e.into());
            }
        };

        let leased = match decision {
            RouteDecision::Pool(pool) => {
                let wait = shortest(pool.policy().acquire_timeout, deadline);
                pool.acquire_within(wait).await.map(Lease::Pool)
            }
            RouteDecision::Tenant(tenant) => tenant.acquire_within(deadline).await.map(Lease::Tenant),
        };

        match leased {
            Ok(lease) => {
                debug!("Routed {} to {} pool {}", method, family, lease.owner());
                record_route(family.as_str(), "ok");
                Ok(RouteTarget { family, lease })
            }
            Err(e) => {
                warn!("No {} connection for {}: {}", family, method, e);
                record_route(family.as_str(), outcome_label(&e));
                Err(e)
            }
        }
    }
}

fn shortest(a: Option<Duration>, b: Option<Duration>) -> Option<Duration> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn outcome_label(err: &ProxyError) -> &'static str {
    match err {
        ProxyError::AcquireTimeout(_) => "timeout",
        ProxyError::PoolClosed(_) => "closed",
        _ => "error",
    }
}
