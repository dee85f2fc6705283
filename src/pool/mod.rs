//! Backend connection pooling.
//!
//! This module provides the bounded, health-tracked connection pools that sit
//! behind every proxied call, the tenant-isolated sub-pools carved out of them,
//! the load balancer that picks among pools, and the registry that owns them all.

mod balancer;
mod connection;
mod dial;
mod registry;
mod tenant;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ProxyError;

pub use balancer::{select, select_most_idle, select_with, Balanced};
pub use connection::{ConnectionPool, PoolPolicy, PoolStats, PooledConnection};
pub use dial::{Dial, GrpcDialer};
pub use registry::{
    FamilyRouting, InstanceName, InstanceSnapshot, MetricsSnapshot, PoolRegistry, RegistryStats,
    TenantSnapshot,
};
pub use tenant::{TenantConnection, TenantPool};

/// One of the two backend service classes with independent pools and ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineFamily {
    /// Speech recognition.
    Asr,
    /// Speech synthesis.
    Tts,
}

impl EngineFamily {
    /// Every family, in routing comparison order.
    pub const ALL: [EngineFamily; 2] = [EngineFamily::Asr, EngineFamily::Tts];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineFamily::Asr => "asr",
            EngineFamily::Tts => "tts",
        }
    }
}

impl fmt::Display for EngineFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineFamily {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "asr" => Ok(EngineFamily::Asr),
            "tts" => Ok(EngineFamily::Tts),
            other => Err(ProxyError::Validation(format!("unknown engine family '{}'", other))),
        }
    }
}

/// Either kind of lease handed out for one proxied call.
///
/// Dropping the lease releases it to whichever pool it came from.
pub enum Lease {
    Pool(PooledConnection),
    Tenant(TenantConnection),
}

impl Lease {
    /// The backend channel to forward the call over.
    pub fn channel(&self) -> tonic::transport::Channel {
        match self {
            Lease::Pool(conn) => conn.channel(),
            Lease::Tenant(conn) => conn.channel(),
        }
    }

    /// Name of the pool or tenant the lease belongs to.
    pub fn owner(&self) -> &str {
        match self {
            Lease::Pool(conn) => conn.pool_name(),
            Lease::Tenant(conn) => conn.tenant_id(),
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Lease::Pool(conn) => write!(f, "Lease::Pool({})", conn.pool_name()),
            Lease::Tenant(conn) => write!(f, "Lease::Tenant({})", conn.tenant_id()),
        }
    }
}
