//! Backend reachability probing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

/// Answers whether a backend address accepts connections.
#[async_trait]
pub trait Prober: Send + Sync + 'static {
    async fn check_reachable(&self, address: &str, timeout: Duration) -> bool;
}

/// Probes by opening (and immediately dropping) a TCP connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProber;

#[async_trait]
impl Prober for TcpProber {
    async fn check_reachable(&self, address: &str, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Probe of {} failed: {}", address, e);
                false
            }
            Err(_) => {
                debug!("Probe of {} timed out after {:?}", address, timeout);
                false
            }
        }
    }
}
