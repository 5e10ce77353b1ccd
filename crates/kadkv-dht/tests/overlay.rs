//! Overlay integration tests
//!
//! Two or three nodes wired through the public API. The memory substrate
//! runs everywhere; the libp2p loopback test needs free local TCP ports and
//! is ignored by default.

use kadkv_dht::orchestrator::{close_all, round_trip};
use kadkv_dht::prelude::*;
use kadkv_dht::{dial_address, CancellationToken, Libp2pFactory, MemoryNetwork, NodeFactory};
use std::time::Duration;
use tokio::time::{timeout, Instant};

const TEST_KEY: &str = "/myapp/testkey";
const TEST_VALUE: &str = "Hello, libp2p DHT!";
const NETWORK_TIMEOUT: Duration = Duration::from_secs(30);

fn fast_config() -> DhtConfig {
    let mut config = DhtConfig::default();
    config.readiness = ReadinessConfig::every(Duration::from_millis(100));
    config
}

async fn memory_pair() -> (MemoryNetwork, DhtNode<kadkv_dht::MemoryHost>, DhtNode<kadkv_dht::MemoryHost>) {
    let network = MemoryNetwork::new();
    let orchestrator = NodeOrchestrator::new(network.clone(), fast_config());
    let (a, b) = orchestrator
        .build_pair(NodeMode::Server, NodeMode::Server)
        .await
        .expect("pair should build");
    (network, a, b)
}

#[test_log::test(tokio::test)]
async fn end_to_end_scenario() {
    let (_network, a, b) = memory_pair().await;

    let sizes = wait_all_ready(&[a.clone(), b.clone()]).await.unwrap();
    assert!(sizes.iter().all(|&s| s > 0));
    assert_eq!(a.state(), NodeState::Ready);
    assert_eq!(b.state(), NodeState::Ready);

    let retrieved = round_trip(&b, &a, TEST_KEY, TEST_VALUE.as_bytes()).await.unwrap();
    assert_eq!(String::from_utf8(retrieved).unwrap(), TEST_VALUE);

    close_all(&[a.clone(), b.clone()]).await;
    assert!(a.is_closed());
    assert!(b.is_closed());
}

#[tokio::test]
async fn values_are_visible_from_both_sides() {
    let (_network, a, b) = memory_pair().await;

    a.put("/myapp/from-a", b"alpha".to_vec()).await.unwrap();
    b.put("/myapp/from-b", b"beta".to_vec()).await.unwrap();

    assert_eq!(b.get("/myapp/from-a").await.unwrap(), b"alpha");
    assert_eq!(a.get("/myapp/from-b").await.unwrap(), b"beta");
}

#[tokio::test]
async fn overwrite_returns_latest_value() {
    let (_network, a, b) = memory_pair().await;

    a.put(TEST_KEY, b"first".to_vec()).await.unwrap();
    a.put(TEST_KEY, b"second".to_vec()).await.unwrap();

    assert_eq!(b.get(TEST_KEY).await.unwrap(), b"second");
}

#[tokio::test(start_paused = true)]
async fn missing_key_is_not_found_without_retries() {
    let (_network, a, _b) = memory_pair().await;
    let start = Instant::now();

    let err = a.get("/myapp/absent").await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test]
async fn foreign_namespace_is_rejected() {
    let (_network, a, _b) = memory_pair().await;

    assert!(matches!(
        a.put("/other/testkey", b"x".to_vec()).await,
        Err(DhtError::InvalidKey { .. })
    ));
    assert!(matches!(a.get("myapp/testkey").await, Err(DhtError::InvalidKey { .. })));
}

#[tokio::test(start_paused = true)]
async fn isolated_node_put_exhausts_retries() {
    let network = MemoryNetwork::new();
    let lonely = network.create(fast_config()).await.unwrap();
    let start = Instant::now();

    let err = lonely.put(TEST_KEY, TEST_VALUE.as_bytes().to_vec()).await.unwrap_err();
    assert!(matches!(err, DhtError::StoreFailed { attempts: 3, .. }));
    assert_eq!(err.attempts(), Some(3));
    // Default policy: 500 ms between each of three attempts.
    assert_eq!(start.elapsed(), Duration::from_millis(1000));

    // A failed store leaves nothing behind locally.
    let err = lonely.get(TEST_KEY).await.unwrap_err();
    assert!(matches!(err, DhtError::FetchFailed { attempts: 3, .. }));
}

#[tokio::test(start_paused = true)]
async fn wait_all_ready_blocks_on_isolated_node() {
    let (network, a, _b) = memory_pair().await;
    let isolated = network.create(fast_config()).await.unwrap();

    let waited = timeout(Duration::from_secs(5), wait_all_ready(&[a, isolated.clone()])).await;
    assert!(waited.is_err(), "readiness must not complete with an empty table");
    assert_eq!(isolated.routing_table_size().await.unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn readiness_wait_can_be_cancelled() {
    let network = MemoryNetwork::new();
    let isolated = network.create(fast_config()).await.unwrap();
    let token = CancellationToken::new();

    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        canceller.cancel();
    });

    let result = isolated.await_routing_ready(isolated.readiness(), Some(&token)).await;
    assert!(matches!(result, Err(DhtError::Cancelled)));
}

#[tokio::test]
async fn third_node_joins_through_bootstrap_seed() {
    let (network, a, _b) = memory_pair().await;

    let seed = dial_address(&a.listen_addrs().await.unwrap()[0], a.peer_id());
    let mut config = fast_config();
    config.add_bootstrap_node(seed.to_string());
    let c = network.create(config).await.unwrap();

    c.bootstrap().await.unwrap();
    assert_eq!(c.await_ready().await.unwrap(), 1);

    a.put(TEST_KEY, TEST_VALUE.as_bytes().to_vec()).await.unwrap();
    assert_eq!(c.get(TEST_KEY).await.unwrap(), TEST_VALUE.as_bytes());
}

#[tokio::test]
async fn client_reader_fetches_from_server() {
    let network = MemoryNetwork::new();
    let orchestrator = NodeOrchestrator::new(network, fast_config());
    let (server, client) = orchestrator
        .build_pair(NodeMode::Server, NodeMode::Client)
        .await
        .unwrap();

    assert_eq!(client.await_ready().await.unwrap(), 1);
    assert_eq!(server.routing_table_size().await.unwrap(), 0);

    client.put(TEST_KEY, TEST_VALUE.as_bytes().to_vec()).await.unwrap();
    assert_eq!(server.get(TEST_KEY).await.unwrap(), TEST_VALUE.as_bytes());
}

#[tokio::test]
async fn closed_node_rejects_everything() {
    let (network, a, b) = memory_pair().await;

    a.close().await.unwrap();
    a.close().await.unwrap();
    assert_eq!(a.state(), NodeState::Closed);
    assert_eq!(network.host_count(), 1);

    assert!(matches!(a.put(TEST_KEY, b"x".to_vec()).await, Err(DhtError::Closed)));
    assert!(matches!(a.get(TEST_KEY).await, Err(DhtError::Closed)));
    assert!(matches!(a.bootstrap().await, Err(DhtError::Closed)));
    assert!(matches!(a.routing_table_size().await, Err(DhtError::Closed)));
    assert!(matches!(a.await_ready().await, Err(DhtError::Closed)));

    assert_eq!(
        b.connection_state(a.peer_id()).await.unwrap(),
        Connectedness::NotConnected
    );
}

#[test_log::test(tokio::test)]
#[ignore = "binds local TCP ports"]
async fn libp2p_loopback_round_trip() {
    let orchestrator = NodeOrchestrator::new(Libp2pFactory, fast_config());

    let (a, b) = timeout(NETWORK_TIMEOUT, orchestrator.build_pair(NodeMode::Server, NodeMode::Server))
        .await
        .expect("pair build timed out")
        .expect("pair should build");

    assert_eq!(
        b.connection_state(a.peer_id()).await.unwrap(),
        Connectedness::Connected
    );

    timeout(NETWORK_TIMEOUT, wait_all_ready(&[a.clone(), b.clone()]))
        .await
        .expect("readiness timed out")
        .unwrap();

    let retrieved = timeout(
        NETWORK_TIMEOUT,
        round_trip(&b, &a, TEST_KEY, TEST_VALUE.as_bytes()),
    )
    .await
    .expect("round trip timed out")
    .unwrap();
    assert_eq!(retrieved, TEST_VALUE.as_bytes());

    close_all(&[a.clone(), b.clone()]).await;
    assert!(matches!(a.get(TEST_KEY).await, Err(DhtError::Closed)));
}
