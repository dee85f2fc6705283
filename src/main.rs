//! Speech engine gRPC gateway.
//!
//! Loads configuration, builds the pool registry, and runs one proxy listener
//! per enabled engine family plus the admin HTTP server until SIGINT/SIGTERM.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{info, warn};

use speech_rpc_gateway::{
    config::{GatewayConfig, RoutingMode},
    discovery::{HealthMonitor, HttpInstanceSource, Reconciler, TcpProber},
    pool::{GrpcDialer, PoolRegistry},
    proxy::{ProxyServer, RoutingDirector},
    reliability::{drain_tasks, init_tracing, GatewayMetrics, GracefulShutdown, TracingConfig},
    server::{serve_admin, AppState},
};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration; an explicit file path may be given as the only argument
    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::load_from(&path),
        None => GatewayConfig::load(),
    }
    .context("loading gateway configuration")?;

    init_tracing(&TracingConfig {
        service_name: env!("CARGO_PKG_NAME").to_string(),
        log_level: config.settings.log_level.clone(),
        json: config.settings.log_json,
    })
    .map_err(|e| anyhow::anyhow!("initializing tracing: {}", e))?;

    let metrics =
        GatewayMetrics::install().map_err(|e| anyhow::anyhow!("installing metrics recorder: {}", e))?;

    info!(
        "Starting {} v{} ({:?} routing, {:?} network)",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        config.settings.routing_mode,
        config.settings.network_mode
    );

    let dialer = Arc::new(GrpcDialer::new(config.dial.clone()));
    let registry = Arc::new(PoolRegistry::new(&config, dialer));
    registry
        .initialize_static(&config)
        .await
        .context("creating static backend pools")?;
    if config.settings.routing_mode == RoutingMode::Tenant {
        registry
            .initialize_tenants(&config.tenants)
            .await
            .context("reserving tenant pools")?;
    }

    let shutdown = GracefulShutdown::new();
    let mut tasks = Vec::new();
    let prober = Arc::new(TcpProber);

    let monitor = Arc::new(HealthMonitor::new(
        registry.clone(),
        prober.clone(),
        config.health.clone(),
    ));
    for family in registry.enabled_families() {
        let monitor = monitor.clone();
        tasks.push(shutdown.spawn("health", move |token| async move {
            monitor.run(family, token).await
        }));
    }

    let reconciler = match (&config.settings.routing_mode, &config.discovery.endpoint_url) {
        (RoutingMode::Dynamic, Some(endpoint)) => {
            let reconciler = Arc::new(Reconciler::new(
                registry.clone(),
                Arc::new(HttpInstanceSource::new(endpoint.clone())),
                prober.clone(),
                config.health.probe_timeout,
            ));
            for family in registry.enabled_families() {
                let reconciler = reconciler.clone();
                tasks.push(shutdown.spawn("discovery", move |token| async move {
                    reconciler.run(family, token).await
                }));
            }
            Some(reconciler)
        }
        (RoutingMode::Dynamic, None) => {
            warn!("Dynamic routing without discovery.endpoint_url; pools come from the admin API only");
            None
        }
        _ => None,
    };

    let director = Arc::new(RoutingDirector::new(
        registry.clone(),
        config.settings.reserved_method_prefix.clone(),
    ));
    for engine in config.engines.iter().filter(|engine| engine.enabled) {
        let addr: SocketAddr = format!("{}:{}", config.settings.gateway_proxy_addr, engine.proxy_port)
            .parse()
            .with_context(|| format!("invalid {} proxy listen address", engine.family))?;
        let server = ProxyServer::new(
            engine.family,
            director.clone(),
            config.dial.initial_stream_window_size,
        );
        let family = engine.family;
        let stop = shutdown.clone();
        tasks.push(shutdown.spawn("proxy", move |token| async move {
            if let Err(e) = server.serve(addr, token).await {
                warn!("{} proxy failed: {}", family, e);
                stop.shutdown();
            }
        }));
    }

    let admin_addr: SocketAddr = config
        .settings
        .admin_addr
        .parse()
        .context("invalid settings.admin_addr")?;
    let state = Arc::new(AppState::new(
        registry.clone(),
        reconciler,
        metrics,
        shutdown.clone(),
    ));
    let stop = shutdown.clone();
    tasks.push(shutdown.spawn("admin", move |token| async move {
        if let Err(e) = serve_admin(admin_addr, state, token).await {
            warn!("Admin server failed: {}", e);
            stop.shutdown();
        }
    }));

    shutdown.listen_for_signals();
    shutdown.wait().await;
    info!("Shutting down");

    if !drain_tasks(tasks, SHUTDOWN_GRACE).await {
        warn!("Some tasks did not stop within {:?}", SHUTDOWN_GRACE);
    }
    registry.close_all();

    info!("Shutdown complete");
    Ok(())
}
