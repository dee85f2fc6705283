//! Structured logging setup.

use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Configuration for the log subscriber.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    /// Fallback filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Emit one JSON object per event instead of compact text.
    pub json: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: env!("CARGO_PKG_NAME").to_string(),
            log_level: "info".to_string(),
            json: false,
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TracingConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.log_level))?;

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if config.json {
        subscriber
            .with(fmt::layer().json().with_current_span(false).with_target(true))
            .try_init()?;
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(true).compact())
            .try_init()?;
    }

    info!("Logging initialized for {}", config.service_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let config = TracingConfig {
            log_level: "debug".to_string(),
            ..TracingConfig::default()
        };
        // Whichever call wins, a second install is rejected.
        let _ = init_tracing(&config);
        assert!(init_tracing(&config).is_err());
    }
}
