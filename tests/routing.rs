//! Routing and pooling driven through the public API, with lazily-connected
//! channels so no backend needs to be running.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tonic::metadata::{MetadataMap, MetadataValue};

use speech_rpc_gateway::config::{
    BackendConfig, EngineConfig, GatewayConfig, NetworkMode, RoutingMode, TenantConfig,
};
use speech_rpc_gateway::error::{ProxyError, RouteError};
use speech_rpc_gateway::pool::{EngineFamily, GrpcDialer, PoolRegistry};
use speech_rpc_gateway::proxy::{RoutingDirector, RoutingToken, TOKEN_METADATA_KEY};

const METHOD: &str = "/asr.v1.Asr/StreamingRecognize";

fn engine(family: EngineFamily, proxy_port: &str, backends: &[(&str, usize)]) -> EngineConfig {
    EngineConfig {
        family,
        enabled: true,
        proxy_port: proxy_port.to_string(),
        server_port: "9000".to_string(),
        selector_value: family.as_str().to_string(),
        reusable: true,
        idle_timeout: Duration::from_secs(300),
        max_lifetime: Duration::from_secs(3600),
        acquire_timeout: Duration::ZERO,
        discovery_interval: Duration::ZERO,
        backends: backends
            .iter()
            .map(|(host, capacity)| BackendConfig {
                host: host.to_string(),
                capacity: *capacity,
            })
            .collect(),
    }
}

async fn director(config: GatewayConfig) -> RoutingDirector {
    let registry = Arc::new(PoolRegistry::new(&config, Arc::new(GrpcDialer::lazy())));
    registry.initialize_static(&config).await.unwrap();
    registry.initialize_tenants(&config.tenants).await.unwrap();
    RoutingDirector::new(registry, config.settings.reserved_method_prefix.clone())
}

fn balanced(backends: &[(&str, usize)]) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.settings.network_mode = NetworkMode::Global;
    config.settings.routing_mode = RoutingMode::Balanced;
    config.engines = vec![
        engine(EngineFamily::Asr, "50051", backends),
        engine(EngineFamily::Tts, "50052", &[("10.0.1.1", 1)]),
    ];
    config
}

fn token(identifier: &str) -> MetadataMap {
    let mut metadata = MetadataMap::new();
    metadata.insert(
        TOKEN_METADATA_KEY,
        MetadataValue::try_from(RoutingToken::encode(identifier)).unwrap(),
    );
    metadata
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn third_call_waits_for_a_release() {
    let director = Arc::new(director(balanced(&[("10.0.0.1", 2)])).await);

    let first = director.route(METHOD, "gw:50051", &MetadataMap::new(), None).await.unwrap();
    let _second = director.route(METHOD, "gw:50051", &MetadataMap::new(), None).await.unwrap();

    let waiter = {
        let director = director.clone();
        tokio::spawn(async move {
            director
                .route(METHOD, "gw:50051", &MetadataMap::new(), None)
                .await
                .map(|target| target.lease.owner().to_string())
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    drop(first);
    let owner = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap().unwrap();
    assert!(!owner.is_empty());
}

#[tokio::test]
async fn leased_plus_idle_matches_capacity() {
    let director = director(balanced(&[("10.0.0.1", 3), ("10.0.0.2", 2)])).await;
    let registry = director.registry().clone();

    let held: Vec<_> = {
        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(director.route(METHOD, "gw:50051", &MetadataMap::new(), None).await.unwrap());
        }
        held
    };

    let snapshot = registry.metrics_snapshot(EngineFamily::Asr).unwrap();
    assert_eq!(snapshot.instances.len(), 2);
    for instance in &snapshot.instances {
        assert_eq!(instance.leased + instance.idle, instance.capacity);
    }
    let leased: usize = snapshot.instances.iter().map(|i| i.leased).sum();
    assert_eq!(leased, 4);

    drop(held);
    let snapshot = registry.metrics_snapshot(EngineFamily::Asr).unwrap();
    assert!(snapshot.instances.iter().all(|i| i.leased == 0));
}

#[tokio::test]
async fn balancer_prefers_most_idle_pool() {
    let director = director(balanced(&[("10.0.0.1", 3), ("10.0.0.2", 5)])).await;

    let target = director.route(METHOD, "gw:50051", &MetadataMap::new(), None).await.unwrap();
    let pools = director.registry().pools(EngineFamily::Asr);
    let chosen = pools
        .iter()
        .find(|pool| pool.name() == target.lease.owner())
        .unwrap();
    assert_eq!(chosen.address(), "10.0.0.2:9000");
    assert_eq!(chosen.size(), 4);
}

#[tokio::test]
async fn closed_pool_fails_fast() {
    let director = director(balanced(&[("10.0.0.1", 1)])).await;
    let pool = director.registry().pools(EngineFamily::Asr).remove(0);
    let held = director.route(METHOD, "gw:50051", &MetadataMap::new(), None).await.unwrap();

    pool.close();
    let result = timeout(Duration::from_millis(200), pool.acquire()).await.unwrap();
    assert!(matches!(result, Err(ProxyError::PoolClosed(_))));

    // Returning a lease to a closed pool discards it.
    drop(held);
    assert_eq!(pool.size(), 0);
}

#[tokio::test]
async fn reserved_and_unknown_calls_are_rejected() {
    let director = director(balanced(&[("10.0.0.1", 1)])).await;

    let reserved = director
        .route("/ivc.v1.internal.Control/Drain", "gw:50051", &MetadataMap::new(), None)
        .await;
    assert!(matches!(reserved, Err(ProxyError::Route(RouteError::ReservedMethod(_)))));

    let unknown = director.route(METHOD, "gw:59999", &MetadataMap::new(), None).await;
    assert!(matches!(unknown, Err(ProxyError::Route(RouteError::UnknownAuthority))));
}

#[tokio::test]
async fn dynamic_routing_follows_the_token() {
    let mut config = balanced(&[]);
    config.settings.routing_mode = RoutingMode::Dynamic;
    let director = director(config).await;
    let registry = director.registry().clone();

    registry
        .create_pools_for_instance(EngineFamily::Asr, 2, "scene01", "10.0.0.7")
        .await
        .unwrap();
    registry
        .create_pools_for_instance(EngineFamily::Asr, 2, "scene02", "10.0.0.8")
        .await
        .unwrap();

    let target = director.route(METHOD, "gw:50051", &token("u1-scene02-a"), None).await.unwrap();
    assert_eq!(target.lease.owner(), "scene02");
    assert_eq!(registry.pool(EngineFamily::Asr, "scene01").unwrap().size(), 2);

    let malformed = director.route(METHOD, "gw:50051", &token("xyz"), None).await;
    assert!(matches!(malformed, Err(ProxyError::Route(RouteError::MalformedToken))));
    assert_eq!(registry.pool(EngineFamily::Asr, "scene02").unwrap().size(), 1);

    registry.release_pool("scene02", EngineFamily::Asr).await.unwrap();
    let released = director.route(METHOD, "gw:50051", &token("u1-scene02-a"), None).await;
    assert!(matches!(
        released,
        Err(ProxyError::Route(RouteError::UnknownPool(ref id))) if id == "scene02"
    ));
}

#[tokio::test]
async fn tenants_are_isolated_from_each_other() {
    let mut config = balanced(&[("10.0.0.1", 4)]);
    config.settings.routing_mode = RoutingMode::Tenant;
    config.tenants = vec![
        TenantConfig {
            tenant_id: "acme".to_string(),
            tenant_name: "Acme".to_string(),
            family: EngineFamily::Asr,
            capacity: 1,
        },
        TenantConfig {
            tenant_id: "globex".to_string(),
            tenant_name: "Globex".to_string(),
            family: EngineFamily::Asr,
            capacity: 2,
        },
    ];
    let director = director(config).await;

    let _acme = director.route(METHOD, "gw:50051", &token("u-acme"), None).await.unwrap();
    let blocked = director
        .route(METHOD, "gw:50051", &token("u-acme"), Some(Duration::from_millis(30)))
        .await;
    assert!(matches!(blocked, Err(ProxyError::AcquireTimeout(_))));

    let globex = director.route(METHOD, "gw:50051", &token("u-globex"), None).await.unwrap();
    assert_eq!(globex.lease.owner(), "globex");

    let snapshot = director.registry().metrics_snapshot(EngineFamily::Asr).unwrap();
    assert_eq!(snapshot.tenants.len(), 2);
    assert_eq!(snapshot.instances[0].idle, 1);
}

#[tokio::test]
async fn tenant_over_allocation_is_fatal() {
    let mut config = balanced(&[("10.0.0.1", 5)]);
    config.settings.routing_mode = RoutingMode::Tenant;
    config.tenants = vec![TenantConfig {
        tenant_id: "acme".to_string(),
        tenant_name: "Acme".to_string(),
        family: EngineFamily::Asr,
        capacity: 10,
    }];

    let registry = PoolRegistry::new(&config, Arc::new(GrpcDialer::lazy()));
    registry.initialize_static(&config).await.unwrap();
    let result = registry.initialize_tenants(&config.tenants).await;
    assert!(matches!(result, Err(ProxyError::Allocation(_))));
}
