//! Tenant-isolated sub-pools.
//!
//! A tenant pool reserves its handles from the family's connection pools once,
//! at startup, and keeps them for its whole life. Exhausting a tenant only ever
//! blocks that tenant's own callers.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tonic::transport::Channel;
use tracing::{debug, info};

use crate::config::TenantConfig;
use crate::error::{ProxyError, Result};
use crate::pool::balancer::{select_most_idle, Balanced};
use crate::pool::connection::{ConnectionPool, PooledConnection};
use crate::pool::EngineFamily;

struct TenantPoolInner {
    tenant_id: String,
    tenant_name: String,
    family: EngineFamily,
    capacity: usize,
    remote_address: String,
    leases: Mutex<VecDeque<PooledConnection>>,
    semaphore: Semaphore,
    closed: AtomicBool,
}

impl TenantPoolInner {
    fn return_lease(&self, conn: PooledConnection) {
        let mut leases = self.leases.lock();
        if self.closed.load(Ordering::Acquire) {
            drop(leases);
            // Goes straight back to the connection pool it was reserved from.
            drop(conn);
            return;
        }
        leases.push_back(conn);
        drop(leases);
        self.semaphore.add_permits(1);
    }
}

/// A lease on one of a tenant's reserved handles.
pub struct TenantConnection {
    channel: Channel,
    conn: Option<PooledConnection>,
    tenant: Arc<TenantPoolInner>,
}

impl TenantConnection {
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant.tenant_id
    }
}

impl Drop for TenantConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.tenant.return_lease(conn);
        }
    }
}

/// Fixed-capacity pool of handles reserved for one tenant.
#[derive(Clone)]
pub struct TenantPool {
    inner: Arc<TenantPoolInner>,
}

impl TenantPool {
    /// Reserve `config.capacity` handles from `pools`, one at a time from
    /// whichever pool has the most idle headroom.
    ///
    /// Fails with [`ProxyError::Allocation`] as soon as the family has no idle
    /// capacity left; handles reserved so far go back to their pools.
    pub async fn reserve(config: &TenantConfig, pools: &[ConnectionPool]) -> Result<Self> {
        let mut leases = VecDeque::with_capacity(config.capacity);
        let mut addresses: Vec<String> = Vec::new();

        while leases.len() < config.capacity {
            let exhausted = || {
                ProxyError::Allocation(format!(
                    "tenant {} needs {} {} connections but only {} are available",
                    config.tenant_id,
                    config.capacity,
                    config.family,
                    leases.len()
                ))
            };

            let Some(pool) = select_most_idle(pools) else {
                return Err(exhausted());
            };
            let Some(conn) = pool.try_acquire().await? else {
                return Err(exhausted());
            };

            if !addresses.iter().any(|address| address == pool.address()) {
                addresses.push(pool.address().to_string());
            }
            debug!("Tenant {} reserved a connection from {}", config.tenant_id, pool.name());
            leases.push_back(conn);
        }

        let inner = TenantPoolInner {
            tenant_id: config.tenant_id.clone(),
            tenant_name: config.tenant_name.clone(),
            family: config.family,
            capacity: config.capacity,
            remote_address: addresses.join(","),
            leases: Mutex::new(leases),
            semaphore: Semaphore::new(config.capacity),
            closed: AtomicBool::new(false),
        };

        info!(
            "Reserved {} {} connections for tenant {} ({}) on {}",
            inner.capacity, inner.family, inner.tenant_id, inner.tenant_name, inner.remote_address
        );

        Ok(Self { inner: Arc::new(inner) })
    }

    /// Lease one of the tenant's handles, waiting until one is free.
    pub async fn acquire(&self) -> Result<TenantConnection> {
        self.acquire_within(None).await
    }

    /// Lease one of the tenant's handles, waiting at most `wait`.
    pub async fn acquire_within(&self, wait: Option<Duration>) -> Result<TenantConnection> {
        if self.is_closed() {
            return Err(ProxyError::PoolClosed(self.inner.tenant_id.clone()));
        }

        let permit = match wait {
            Some(wait) => tokio::time::timeout(wait, self.inner.semaphore.acquire())
                .await
                .map_err(|_| ProxyError::AcquireTimeout(self.inner.tenant_id.clone()))?,
            None => self.inner.semaphore.acquire().await,
        }
        .map_err(|_| ProxyError::PoolClosed(self.inner.tenant_id.clone()))?;
        permit.forget();

        let Some(conn) = self.inner.leases.lock().pop_front() else {
            return Err(ProxyError::PoolClosed(self.inner.tenant_id.clone()));
        };

        let mut lease = TenantConnection {
            channel: conn.channel(),
            conn: Some(conn),
            tenant: self.inner.clone(),
        };
        if let Some(conn) = lease.conn.as_mut() {
            conn.ensure_fresh().await?;
            lease.channel = conn.channel();
        }
        Ok(lease)
    }

    pub fn tenant_id(&self) -> &str {
        &self.inner.tenant_id
    }

    pub fn tenant_name(&self) -> &str {
        &self.inner.tenant_name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Comma-separated backend addresses the reservation was drawn from.
    pub fn remote_address(&self) -> &str {
        &self.inner.remote_address
    }

    /// Idle reserved handles.
    pub fn size(&self) -> usize {
        self.inner.leases.lock().len()
    }

    pub fn current_load(&self) -> usize {
        self.inner.capacity.saturating_sub(self.size())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Give every idle reserved handle back to its connection pool. Idempotent.
    pub fn close(&self) {
        let drained: Vec<PooledConnection> = {
            let mut leases = self.inner.leases.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            leases.drain(..).collect()
        };
        self.inner.semaphore.close();
        info!(
            "Closed tenant pool {}, returning {} connections",
            self.inner.tenant_id,
            drained.len()
        );
    }
}

impl Balanced for TenantPool {
    fn is_healthy(&self) -> bool {
        !self.is_closed()
    }

    fn size(&self) -> usize {
        TenantPool::size(self)
    }
}

impl fmt::Debug for TenantPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantPool")
            .field("tenant_id", &self.inner.tenant_id)
            .field("family", &self.inner.family)
            .field("capacity", &self.inner.capacity)
            .field("idle", &self.size())
            .finish()
    }
}
