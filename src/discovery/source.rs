//! Live instance listing from the orchestration layer.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ProxyError, Result};

/// One live backend instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LiveInstance {
    /// Instance name, `<family>-<capacity>-<scene>`.
    pub name: String,
    /// Host the instance is reachable at, without port.
    pub address: String,
}

/// Label selector narrowing the listing to one family's services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    pub key: String,
    pub value: String,
}

/// Lists live backend instances.
#[async_trait]
pub trait InstanceSource: Send + Sync + 'static {
    async fn list_live_instances(&self, selector: &Selector) -> Result<Vec<LiveInstance>>;
}

/// Lists instances from an HTTP endpoint returning a JSON array of
/// `{"name", "address"}` objects; the selector is passed as a query parameter.
#[derive(Debug, Clone)]
pub struct HttpInstanceSource {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpInstanceSource {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl InstanceSource for HttpInstanceSource {
    async fn list_live_instances(&self, selector: &Selector) -> Result<Vec<LiveInstance>> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[(selector.key.as_str(), selector.value.as_str())])
            .send()
            .await
            .map_err(|e| ProxyError::Orchestration(format!("listing {} failed: {}", self.endpoint, e)))?;

        let response = response.error_for_status().map_err(|e| {
            ProxyError::Orchestration(format!("listing {} failed: {}", self.endpoint, e))
        })?;

        let instances: Vec<LiveInstance> = response.json().await.map_err(|e| {
            ProxyError::Orchestration(format!("invalid listing from {}: {}", self.endpoint, e))
        })?;

        debug!(
            "{} live instances for {}={}",
            instances.len(),
            selector.key,
            selector.value
        );
        Ok(instances)
    }
}
