//! Bounded connection pool for one engine backend.
//!
//! A pool owns exactly `capacity` slots. Each slot is either idle in the pool or
//! leased out as a [`PooledConnection`]; dropping the lease puts the slot back.
//! Capacity never changes in place: resizing means closing the pool and
//! creating a new one.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, TryAcquireError};
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::pool::balancer::Balanced;
use crate::pool::dial::Dial;

/// Creation policy for a pool's handles.
#[derive(Debug, Clone)]
pub struct PoolPolicy {
    /// A handle idle for this long is re-dialed before reuse.
    pub idle_timeout: Duration,
    /// A handle older than this is re-dialed before reuse.
    pub max_lifetime: Duration,
    /// How long `acquire` waits; `None` waits until a handle frees up.
    pub acquire_timeout: Option<Duration>,
    /// Whether a handle goes back to the pool after the call.
    pub reusable: bool,
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            acquire_timeout: None,
            reusable: true,
        }
    }
}

/// One unit of capacity. An empty channel means "dial on next checkout".
struct Slot {
    channel: Option<Channel>,
    created_at: Instant,
    last_used: Instant,
}

impl Slot {
    fn vacant() -> Self {
        let now = Instant::now();
        Self {
            channel: None,
            created_at: now,
            last_used: now,
        }
    }

    fn fresh(channel: Channel) -> Self {
        let now = Instant::now();
        Self {
            channel: Some(channel),
            created_at: now,
            last_used: now,
        }
    }
}

fn is_stale(created_at: Instant, last_used: Instant, policy: &PoolPolicy) -> bool {
    created_at.elapsed() >= policy.max_lifetime || last_used.elapsed() >= policy.idle_timeout
}

/// Internal connection pool state.
struct ConnectionPoolInner {
    name: String,
    address: String,
    capacity: usize,
    policy: PoolPolicy,
    dialer: Arc<dyn Dial>,
    slots: Mutex<VecDeque<Slot>>,
    /// One permit per idle slot.
    semaphore: Semaphore,
    healthy: AtomicBool,
    closed: AtomicBool,
}

impl ConnectionPoolInner {
    fn return_slot(&self, slot: Slot) {
        {
            let mut slots = self.slots.lock();
            if self.closed.load(Ordering::Acquire) {
                debug!("Pool {} closed, dropping returned connection", self.name);
                return;
            }
            slots.push_back(slot);
        }
        self.semaphore.add_permits(1);
    }
}

/// A slot taken out of the pool but not yet handed to the caller.
///
/// Goes back as a vacant slot if checkout is abandoned part-way (dial failure
/// or the acquiring future being dropped), so capacity is never leaked.
struct Reservation {
    pool: Arc<ConnectionPoolInner>,
    slot: Option<Slot>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.slot.take().is_some() {
            self.pool.return_slot(Slot::vacant());
        }
    }
}

/// A leased backend connection.
///
/// Returned to its pool when dropped; single-use leases return an empty slot
/// that is re-dialed on its next checkout.
pub struct PooledConnection {
    channel: Channel,
    pool: Arc<ConnectionPoolInner>,
    created_at: Instant,
    last_used: Instant,
}

impl PooledConnection {
    /// The backend channel to issue the call on.
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }

    /// Name of the owning pool.
    pub fn pool_name(&self) -> &str {
        &self.pool.name
    }

    /// Backend address of the owning pool.
    pub fn address(&self) -> &str {
        &self.pool.address
    }

    /// Get the age of this connection.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Re-dial the handle if it outlived the pool's lifetime or idle limits.
    ///
    /// Used for leases parked outside the pool (tenant reservations), which
    /// never pass through the pool's own checkout again.
    pub async fn ensure_fresh(&mut self) -> Result<()> {
        if is_stale(self.created_at, self.last_used, &self.pool.policy) {
            debug!(
                "Refreshing stale connection for pool {} (age {:?})",
                self.pool.name,
                self.age()
            );
            self.channel = self.pool.dialer.dial(&self.pool.address).await?;
            self.created_at = Instant::now();
        }
        self.last_used = Instant::now();
        Ok(())
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.name)
            .field("address", &self.pool.address)
            .field("age", &self.age())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let slot = if self.pool.policy.reusable {
            Slot {
                channel: Some(self.channel.clone()),
                created_at: self.created_at,
                last_used: Instant::now(),
            }
        } else {
            Slot::vacant()
        };
        self.pool.return_slot(slot);
    }
}

/// Bounded, health-tracked set of connections to one backend address.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<ConnectionPoolInner>,
}

impl ConnectionPool {
    /// Create a pool and dial all `capacity` handles up front.
    ///
    /// Any dial failure fails the whole creation; callers decide whether that
    /// is fatal (static backends) or retried later (discovered backends).
    pub async fn create(
        name: impl Into<String>,
        address: impl Into<String>,
        capacity: usize,
        policy: PoolPolicy,
        dialer: Arc<dyn Dial>,
    ) -> Result<Self> {
        let name = name.into();
        let address = address.into();
        if capacity == 0 {
            return Err(ProxyError::Config(format!(
                "pool {} for {} must have non-zero capacity",
                name, address
            )));
        }

        let channels = futures::future::try_join_all(
            (0..capacity).map(|_| dialer.dial(&address)),
        )
        .await?;
        let slots = channels.into_iter().map(Slot::fresh).collect::<VecDeque<_>>();

        let inner = Arc::new(ConnectionPoolInner {
            name,
            address,
            capacity,
            policy,
            dialer,
            slots: Mutex::new(slots),
            semaphore: Semaphore::new(capacity),
            healthy: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });

        info!(
            "Created connection pool {} for {} with capacity {}",
            inner.name, inner.address, inner.capacity
        );

        Ok(Self { inner })
    }

    /// Lease a connection, waiting up to the policy's acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_within(self.inner.policy.acquire_timeout).await
    }

    /// Lease a connection, waiting at most `wait` (`None` = until one frees up).
    ///
    /// Fails immediately on a closed pool. Dropping the returned future before
    /// it completes consumes nothing.
    pub async fn acquire_within(&self, wait: Option<Duration>) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(ProxyError::PoolClosed(self.inner.name.clone()));
        }

        let permit = match wait {
            Some(wait) => tokio::time::timeout(wait, self.inner.semaphore.acquire())
                .await
                .map_err(|_| ProxyError::AcquireTimeout(self.inner.name.clone()))?,
            None => self.inner.semaphore.acquire().await,
        }
        .map_err(|_| ProxyError::PoolClosed(self.inner.name.clone()))?;
        permit.forget();

        self.checkout().await
    }

    /// Lease a connection only if one is idle right now.
    pub async fn try_acquire(&self) -> Result<Option<PooledConnection>> {
        match self.inner.semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.checkout().await.map(Some)
            }
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => Err(ProxyError::PoolClosed(self.inner.name.clone())),
        }
    }

    /// Turn a held permit into a lease, re-dialing the slot if it is empty or stale.
    async fn checkout(&self) -> Result<PooledConnection> {
        let slot = self.inner.slots.lock().pop_front();
        let Some(slot) = slot else {
            // Only reachable when close() drained the slots under us.
            return Err(ProxyError::PoolClosed(self.inner.name.clone()));
        };

        let mut reservation = Reservation {
            pool: self.inner.clone(),
            slot: Some(slot),
        };

        let reusable = reservation.slot.as_ref().and_then(|slot| match &slot.channel {
            Some(channel) if !is_stale(slot.created_at, slot.last_used, &self.inner.policy) => {
                Some((channel.clone(), slot.created_at))
            }
            _ => None,
        });

        let (channel, created_at) = match reusable {
            Some(found) => found,
            None => {
                debug!("Re-dialing connection for pool {}", self.inner.name);
                let channel = self.inner.dialer.dial(&self.inner.address).await?;
                (channel, Instant::now())
            }
        };

        reservation.slot = None;
        Ok(PooledConnection {
            channel,
            pool: self.inner.clone(),
            created_at,
            last_used: Instant::now(),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.inner.policy
    }

    /// Idle handles right now; the inverse load signal.
    pub fn size(&self) -> usize {
        self.inner.slots.lock().len()
    }

    /// Leased handles, never reported below zero.
    pub fn current_load(&self) -> usize {
        self.inner.capacity.saturating_sub(self.size())
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.healthy.load(Ordering::Acquire)
    }

    /// Set the health flag, returning the previous value.
    pub fn set_healthy(&self, healthy: bool) -> bool {
        self.inner.healthy.swap(healthy, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Drain and invalidate every idle handle. Idempotent.
    ///
    /// Calls already holding a lease keep their channel; the lease is simply
    /// discarded when it comes back.
    pub fn close(&self) {
        let drained = {
            let mut slots = self.inner.slots.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
            slots.drain(..).count()
        };
        self.inner.semaphore.close();

        if drained < self.inner.capacity {
            warn!(
                "Closed pool {} with {} connections still leased",
                self.inner.name,
                self.inner.capacity - drained
            );
        } else {
            info!("Closed pool {} ({})", self.inner.name, self.inner.address);
        }
    }

    /// Whether two handles refer to the same pool instance.
    pub fn same_pool(&self, other: &ConnectionPool) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Get pool statistics.
    pub fn stats(&self) -> PoolStats {
        let idle = self.size();
        PoolStats {
            name: self.inner.name.clone(),
            address: self.inner.address.clone(),
            capacity: self.inner.capacity,
            idle,
            leased: self.inner.capacity.saturating_sub(idle),
            healthy: self.is_healthy(),
        }
    }
}

impl Balanced for ConnectionPool {
    fn is_healthy(&self) -> bool {
        ConnectionPool::is_healthy(self) && !self.is_closed()
    }

    fn size(&self) -> usize {
        ConnectionPool::size(self)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.inner.name)
            .field("address", &self.inner.address)
            .field("capacity", &self.inner.capacity)
            .field("idle", &self.size())
            .field("healthy", &self.is_healthy())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Pool statistics.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub name: String,
    pub address: String,
    pub capacity: usize,
    pub idle: usize,
    pub leased: usize,
    pub healthy: bool,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool {} ({}): {}/{} leased, {} idle, {}",
            self.name,
            self.address,
            self.leased,
            self.capacity,
            self.idle,
            if self.healthy { "up" } else { "down" }
        )
    }
}
