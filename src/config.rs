//! Gateway configuration.
//!
//! Configuration is loaded from multiple sources with `figment` and validated at the
//! boundary: every section is a typed struct, so the rest of the crate never has to
//! dig through loosely typed key/value bundles.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::pool::{EngineFamily, PoolPolicy};

/// Serde helper for Duration serialization/deserialization as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Same as `duration_secs`, in milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Built-in defaults
pub mod defaults {
    /// Method prefix that is never forwarded.
    pub const RESERVED_METHOD_PREFIX: &str = "/ivc.v1.internal";

    /// Admin HTTP listener.
    pub const ADMIN_ADDR: &str = "0.0.0.0:8080";

    /// Proxy bind / gateway address.
    pub const GATEWAY_PROXY_ADDR: &str = "0.0.0.0";

    /// Backend dial timeout in seconds.
    pub const DIAL_TIMEOUT_SECS: u64 = 5;

    /// HTTP/2 keepalive ping interval in seconds.
    pub const KEEPALIVE_TIME_SECS: u64 = 10;

    /// HTTP/2 keepalive ack timeout in seconds.
    pub const KEEPALIVE_TIMEOUT_SECS: u64 = 3;

    /// Stream and connection window size (1 GiB).
    pub const INITIAL_WINDOW_SIZE: u32 = 1 << 30;

    /// Pause between health sweeps in milliseconds.
    pub const HEALTH_INTERVAL_MS: u64 = 1000;

    /// TCP probe timeout in milliseconds.
    pub const PROBE_TIMEOUT_MS: u64 = 3000;

    /// Extra probes after a failure before a pool is marked down.
    pub const PROBE_RETRY_ATTEMPTS: u32 = 5;

    /// Spacing between retry probes in milliseconds.
    pub const PROBE_RETRY_DELAY_MS: u64 = 1000;

    /// Discovery reconciliation interval in seconds.
    pub const DISCOVERY_INTERVAL_SECS: u64 = 30;

    /// Settle time after an instance update before its pool is recreated.
    pub const MIGRATE_DELAY_SECS: u64 = 5;

    /// Label key used to select engine services.
    pub const SELECTOR_KEY: &str = "engine";
}

fn default_true() -> bool { true }
fn default_reserved_prefix() -> String { defaults::RESERVED_METHOD_PREFIX.to_string() }
fn default_admin_addr() -> String { defaults::ADMIN_ADDR.to_string() }
fn default_gateway_proxy_addr() -> String { defaults::GATEWAY_PROXY_ADDR.to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_dial_timeout() -> Duration { Duration::from_secs(defaults::DIAL_TIMEOUT_SECS) }
fn default_keepalive_time() -> Duration { Duration::from_secs(defaults::KEEPALIVE_TIME_SECS) }
fn default_keepalive_timeout() -> Duration { Duration::from_secs(defaults::KEEPALIVE_TIMEOUT_SECS) }
fn default_window_size() -> u32 { defaults::INITIAL_WINDOW_SIZE }
fn default_health_interval() -> Duration { Duration::from_millis(defaults::HEALTH_INTERVAL_MS) }
fn default_probe_timeout() -> Duration { Duration::from_millis(defaults::PROBE_TIMEOUT_MS) }
fn default_retry_attempts() -> u32 { defaults::PROBE_RETRY_ATTEMPTS }
fn default_retry_delay() -> Duration { Duration::from_millis(defaults::PROBE_RETRY_DELAY_MS) }
fn default_discovery_interval() -> Duration { Duration::from_secs(defaults::DISCOVERY_INTERVAL_SECS) }
fn default_selector_key() -> String { defaults::SELECTOR_KEY.to_string() }
fn default_node_count() -> usize { 1 }
fn default_idle_timeout() -> Duration { Duration::from_secs(300) }
fn default_max_lifetime() -> Duration { Duration::from_secs(3600) }

/// How the `:authority` of an inbound call is compared with a family's listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Compare the full `host:port`.
    Strict,
    /// Compare the port only.
    Global,
}

/// Which routing strategy the director applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    /// Load-balance over every connection pool of the family.
    Balanced,
    /// Pools are discovered from live instances; calls carry a token naming one.
    Dynamic,
    /// Calls carry a token naming a tenant pool.
    Tenant,
}

/// Process-wide gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub network_mode: NetworkMode,

    /// Address the proxy listeners bind to; also the host part of the
    /// external address in strict mode.
    #[serde(default = "default_gateway_proxy_addr")]
    pub gateway_proxy_addr: String,

    pub routing_mode: RoutingMode,

    #[serde(default = "default_reserved_prefix")]
    pub reserved_method_prefix: String,

    /// Admin HTTP listener address
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,

    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

/// Backend dial policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialConfig {
    #[serde(with = "duration_secs", default = "default_dial_timeout")]
    pub timeout: Duration,

    #[serde(with = "duration_secs", default = "default_keepalive_time")]
    pub keepalive_time: Duration,

    #[serde(with = "duration_secs", default = "default_keepalive_timeout")]
    pub keepalive_timeout: Duration,

    #[serde(default = "default_window_size")]
    pub initial_stream_window_size: u32,

    #[serde(default = "default_window_size")]
    pub initial_connection_window_size: u32,

    /// Defer the TCP/HTTP2 handshake until first use.
    #[serde(default)]
    pub lazy: bool,
}

/// Health loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(with = "duration_millis", default = "default_health_interval")]
    pub interval: Duration,

    #[serde(with = "duration_millis", default = "default_probe_timeout")]
    pub probe_timeout: Duration,

    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(with = "duration_millis", default = "default_retry_delay")]
    pub retry_delay: Duration,
}

/// Discovery loop settings (dynamic routing mode only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_selector_key")]
    pub selector_key: String,

    /// Orchestration endpoint returning live instances as JSON.
    #[serde(default)]
    pub endpoint_url: Option<String>,

    #[serde(with = "duration_secs", default = "default_discovery_interval")]
    pub interval: Duration,
}

/// Multi-replica capacity sharing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_node_count")]
    pub node_count: usize,
}

impl ClusterConfig {
    /// The share of `declared` backend capacity this replica pools.
    ///
    /// Parity rule: even capacities split evenly (`declared / nodes`), odd
    /// ones take one extra (`declared / nodes + 1`). Never below one handle.
    pub fn share(&self, declared: usize) -> usize {
        if !self.enabled || self.node_count <= 1 {
            return declared;
        }
        let base = declared / self.node_count;
        let share = if declared % 2 == 0 { base } else { base + 1 };
        share.max(1)
    }
}

/// A statically declared backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub capacity: usize,
}

/// Per-family engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub family: EngineFamily,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Port this gateway listens on for the family.
    pub proxy_port: String,

    /// Port the engine backends listen on.
    pub server_port: String,

    /// Selector value used to list this family's live instances.
    #[serde(default)]
    pub selector_value: String,

    /// Whether a lease goes back to the pool after the call.
    #[serde(default = "default_true")]
    pub reusable: bool,

    #[serde(with = "duration_secs", default = "default_idle_timeout")]
    pub idle_timeout: Duration,

    #[serde(with = "duration_secs", default = "default_max_lifetime")]
    pub max_lifetime: Duration,

    /// Zero waits indefinitely.
    #[serde(with = "duration_secs", default)]
    pub acquire_timeout: Duration,

    /// Overrides `discovery.interval` for this family when non-zero.
    #[serde(with = "duration_secs", default)]
    pub discovery_interval: Duration,

    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

impl EngineConfig {
    /// Build the pool creation policy for this family.
    pub fn policy(&self) -> PoolPolicy {
        PoolPolicy {
            idle_timeout: self.idle_timeout,
            max_lifetime: self.max_lifetime,
            acquire_timeout: (!self.acquire_timeout.is_zero()).then_some(self.acquire_timeout),
            reusable: self.reusable,
        }
    }
}

/// One tenant's reserved slice of a family's capacity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub tenant_name: String,
    pub family: EngineFamily,
    pub capacity: usize,
}

/// Gateway configuration loaded from multiple sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub settings: Settings,
    pub dial: DialConfig,
    pub health: HealthConfig,
    pub discovery: DiscoveryConfig,
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub engines: Vec<EngineConfig>,
    #[serde(default)]
    pub tenants: Vec<TenantConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            settings: Settings {
                network_mode: NetworkMode::Global,
                gateway_proxy_addr: default_gateway_proxy_addr(),
                routing_mode: RoutingMode::Balanced,
                reserved_method_prefix: default_reserved_prefix(),
                admin_addr: default_admin_addr(),
                log_level: default_log_level(),
                log_json: false,
            },
            dial: DialConfig {
                timeout: default_dial_timeout(),
                keepalive_time: default_keepalive_time(),
                keepalive_timeout: default_keepalive_timeout(),
                initial_stream_window_size: default_window_size(),
                initial_connection_window_size: default_window_size(),
                lazy: false,
            },
            health: HealthConfig {
                interval: default_health_interval(),
                probe_timeout: default_probe_timeout(),
                retry_attempts: default_retry_attempts(),
                retry_delay: default_retry_delay(),
            },
            discovery: DiscoveryConfig {
                selector_key: default_selector_key(),
                endpoint_url: None,
                interval: default_discovery_interval(),
            },
            cluster: ClusterConfig {
                enabled: false,
                node_count: default_node_count(),
            },
            engines: Vec::new(),
            tenants: Vec::new(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Environment variables prefixed `GATEWAY_` (highest priority)
    /// 2. gateway.yaml (if exists)
    /// 3. gateway.toml (if exists)
    /// 4. Built-in defaults (lowest priority)
    pub fn load() -> Result<Self> {
        let figment = Self::default_figment()
            .merge(Toml::file("gateway.toml"))
            .merge(Yaml::file("gateway.yaml"));
        Self::extract(figment)
    }

    /// Load configuration from one explicit file (TOML or YAML by extension),
    /// still honoring environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Self::default_figment().merge(Yaml::file(path)),
            Some("toml") => Self::default_figment().merge(Toml::file(path)),
            _ => {
                return Err(ProxyError::Config(format!(
                    "unsupported config file format: {}",
                    path.display()
                )))
            }
        };
        Self::extract(figment)
    }

    fn default_figment() -> Figment {
        Figment::from(Serialized::defaults(GatewayConfig::default()))
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: GatewayConfig = figment
            .merge(Env::prefixed("GATEWAY_").split("__"))
            .extract()
            .map_err(|e| ProxyError::Config(format!("Failed to load configuration: {}", e)))?;

        config.validate()?;
        debug!("Loaded gateway configuration: {:?}", config);
        Ok(config)
    }

    /// The configuration of one family, if declared.
    pub fn engine(&self, family: EngineFamily) -> Option<&EngineConfig> {
        self.engines.iter().find(|engine| engine.family == family)
    }

    /// Address key inbound calls for `engine` must present.
    ///
    /// `gateway:port` in strict mode, `port` alone in global mode.
    pub fn external_addr(&self, engine: &EngineConfig) -> String {
        match self.settings.network_mode {
            NetworkMode::Strict => {
                format!("{}:{}", self.settings.gateway_proxy_addr, engine.proxy_port)
            }
            NetworkMode::Global => engine.proxy_port.clone(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.settings.network_mode == NetworkMode::Strict
            && self.settings.gateway_proxy_addr.trim().is_empty()
        {
            return Err(ProxyError::Config(
                "settings.gateway_proxy_addr is required in strict network mode".to_string(),
            ));
        }

        if self.cluster.enabled && self.cluster.node_count == 0 {
            return Err(ProxyError::Config(
                "cluster.node_count must be at least 1".to_string(),
            ));
        }

        let mut families = HashSet::new();
        let mut ports = HashSet::new();
        for engine in &self.engines {
            if !families.insert(engine.family) {
                return Err(ProxyError::Config(format!(
                    "engine family {} is declared twice",
                    engine.family
                )));
            }
            if !engine.enabled {
                continue;
            }
            if engine.proxy_port.parse::<u16>().map_or(true, |port| port == 0) {
                return Err(ProxyError::Config(format!(
                    "{} proxy_port '{}' is not a valid port",
                    engine.family, engine.proxy_port
                )));
            }
            if engine.server_port.parse::<u16>().map_or(true, |port| port == 0) {
                return Err(ProxyError::Config(format!(
                    "{} server_port '{}' is not a valid port",
                    engine.family, engine.server_port
                )));
            }
            if !ports.insert(engine.proxy_port.as_str()) {
                return Err(ProxyError::Config(format!(
                    "proxy_port {} is shared by two engine families",
                    engine.proxy_port
                )));
            }
            if let Some(backend) = engine.backends.iter().find(|b| b.capacity == 0) {
                return Err(ProxyError::Config(format!(
                    "{} backend {} has zero capacity",
                    engine.family, backend.host
                )));
            }
        }

        for tenant in &self.tenants {
            if tenant.capacity == 0 {
                return Err(ProxyError::Config(format!(
                    "tenant {} has zero capacity",
                    tenant.tenant_id
                )));
            }
            if !self.engine(tenant.family).is_some_and(|engine| engine.enabled) {
                return Err(ProxyError::Config(format!(
                    "tenant {} targets disabled engine family {}",
                    tenant.tenant_id, tenant.family
                )));
            }
        }

        if !self.tenants.is_empty() && self.settings.routing_mode != RoutingMode::Tenant {
            warn!(
                "{} tenants configured but routing_mode is {:?}; tenant pools will not be built",
                self.tenants.len(),
                self.settings.routing_mode
            );
        }

        Ok(())
    }
}
