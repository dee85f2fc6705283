//! Backend dialing.

use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, error};

use crate::config::{DialConfig, GatewayConfig};
use crate::error::{ProxyError, Result};

/// Establishes one backend channel for a pool slot.
#[async_trait]
pub trait Dial: Send + Sync + 'static {
    async fn dial(&self, address: &str) -> Result<Channel>;
}

/// Dials engine backends over plaintext HTTP/2 with the configured keepalive
/// and flow-control windows.
#[derive(Debug, Clone)]
pub struct GrpcDialer {
    config: DialConfig,
}

impl GrpcDialer {
    pub fn new(config: DialConfig) -> Self {
        Self { config }
    }

    /// A dialer that never touches the network until a channel is first used.
    pub fn lazy() -> Self {
        let mut config = GatewayConfig::default().dial;
        config.lazy = true;
        Self { config }
    }

    fn endpoint(&self, address: &str) -> Result<Endpoint> {
        let uri = if address.starts_with("http://") || address.starts_with("https://") {
            address.to_string()
        } else {
            format!("http://{}", address)
        };

        let endpoint = Endpoint::from_shared(uri).map_err(|e| ProxyError::Dial {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        Ok(endpoint
            .connect_timeout(self.config.timeout)
            .http2_keep_alive_interval(self.config.keepalive_time)
            .keep_alive_timeout(self.config.keepalive_timeout)
            .keep_alive_while_idle(true)
            .initial_stream_window_size(self.config.initial_stream_window_size)
            .initial_connection_window_size(self.config.initial_connection_window_size)
            .tcp_nodelay(true))
    }
}

#[async_trait]
impl Dial for GrpcDialer {
    async fn dial(&self, address: &str) -> Result<Channel> {
        let endpoint = self.endpoint(address)?;

        if self.config.lazy {
            debug!("Lazily dialing {}", address);
            return Ok(endpoint.connect_lazy());
        }

        match tokio::time::timeout(self.config.timeout, endpoint.connect()).await {
            Ok(Ok(channel)) => {
                debug!("Dialed {}", address);
                Ok(channel)
            }
            Ok(Err(e)) => {
                error!("gRPC dial to {} failed: {}", address, e);
                Err(ProxyError::Dial {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                error!("gRPC dial to {} timed out after {:?}", address, self.config.timeout);
                Err(ProxyError::Dial {
                    address: address.to_string(),
                    reason: format!("timed out after {:?}", self.config.timeout),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lazy_dial_does_not_connect() {
        // Nothing listens on port 1; a lazy dial must still succeed.
        let channel = GrpcDialer::lazy().dial("127.0.0.1:1").await;
        assert!(channel.is_ok());
    }

    #[tokio::test]
    async fn test_invalid_address_is_dial_error() {
        let result = GrpcDialer::lazy().dial("bad host:port").await;
        assert!(matches!(result, Err(ProxyError::Dial { .. })));
    }

    #[tokio::test]
    async fn test_eager_dial_to_closed_port_fails() {
        let mut config = GatewayConfig::default().dial;
        config.timeout = std::time::Duration::from_millis(500);
        let result = GrpcDialer::new(config).dial("127.0.0.1:1").await;
        assert!(matches!(result, Err(ProxyError::Dial { .. })));
    }
}
