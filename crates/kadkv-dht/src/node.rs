//! DHT node
//!
//! [`DhtNode`] hides a [`Substrate`] behind bootstrap, connect, readiness
//! polling and namespaced put/get with retries. Handles are cheap to clone;
//! all clones share one substrate and one lifecycle state.

use libp2p::{Multiaddr, PeerId};
use parking_lot::RwLock;
use std::fmt;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, field, info, info_span, warn, Instrument, Span};

use crate::config::{DhtConfig, NodeMode, ReadinessConfig};
use crate::error::{DhtError, Result};
use crate::key::{Namespace, RecordKey};
use crate::retry::{RetryError, RetryPolicy, RetryRunner};
use crate::substrate::{dial_address, peer_of, Connectedness, Substrate};
use crate::swarm::SwarmSubstrate;

/// Lifecycle of a node
///
/// States only move forward; `Closed` is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    /// Identity and transport allocated
    Created,
    /// Self-bootstrap triggered
    Bootstrapped,
    /// Connected to at least one explicitly dialed peer
    Connected,
    /// Routing table observed non-empty
    Ready,
    /// Resources released
    Closed,
}

struct NodeInner<S> {
    substrate: S,
    peer_id: PeerId,
    mode: NodeMode,
    namespace: Namespace,
    retry: RetryPolicy,
    fetch_timeout: Duration,
    readiness: ReadinessConfig,
    state: RwLock<NodeState>,
    span: Span,
}

/// One participant in the overlay
pub struct DhtNode<S: Substrate = SwarmSubstrate> {
    inner: Arc<NodeInner<S>>,
}

impl<S: Substrate> Clone for DhtNode<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Substrate> fmt::Debug for DhtNode<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhtNode")
            .field("peer_id", &self.inner.peer_id)
            .field("mode", &self.inner.mode)
            .field("state", &self.state())
            .finish()
    }
}

impl DhtNode<SwarmSubstrate> {
    /// Create a libp2p-backed node listening on `config.listen_addresses`
    pub async fn create(config: DhtConfig) -> Result<Self> {
        let span = info_span!("node", peer = field::Empty, mode = %config.mode);
        let substrate = SwarmSubstrate::spawn(&config, &span).await?;
        Ok(Self::assemble(substrate, &config, span))
    }
}

impl<S: Substrate> DhtNode<S> {
    /// Wrap an already running substrate
    pub fn with_substrate(substrate: S, config: &DhtConfig) -> Self {
        let span = info_span!("node", peer = field::Empty, mode = %config.mode);
        Self::assemble(substrate, config, span)
    }

    fn assemble(substrate: S, config: &DhtConfig, span: Span) -> Self {
        let peer_id = substrate.local_peer_id();
        span.record("peer", field::display(peer_id));
        info!(parent: &span, "Node created in {} mode", config.mode);

        Self {
            inner: Arc::new(NodeInner {
                substrate,
                peer_id,
                mode: config.mode,
                namespace: config.namespace.clone(),
                retry: config.retry.clone(),
                fetch_timeout: config.fetch_timeout(),
                readiness: config.readiness.clone(),
                state: RwLock::new(NodeState::Created),
                span,
            }),
        }
    }

    /// Our peer ID
    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// Operating mode
    pub fn mode(&self) -> NodeMode {
        self.inner.mode
    }

    /// Current lifecycle state
    pub fn state(&self) -> NodeState {
        *self.inner.state.read()
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state() == NodeState::Closed
    }

    /// Key namespace
    pub fn namespace(&self) -> &Namespace {
        &self.inner.namespace
    }

    /// Readiness polling configured for this node
    pub fn readiness(&self) -> &ReadinessConfig {
        &self.inner.readiness
    }

    /// Logging span of this node
    pub fn span(&self) -> &Span {
        &self.inner.span
    }

    /// Underlying substrate
    pub fn substrate(&self) -> &S {
        &self.inner.substrate
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DhtError::Closed);
        }
        Ok(())
    }

    fn advance(&self, to: NodeState) {
        let mut state = self.inner.state.write();
        if *state != NodeState::Closed && *state < to {
            debug!(parent: &self.inner.span, "State {:?} -> {:?}", *state, to);
            *state = to;
        }
    }

    /// Addresses the transport listens on
    pub async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        self.ensure_open()?;
        self.inner.substrate.listen_addrs().await
    }

    /// Listen addresses suffixed with `/p2p/<peer id>`
    pub async fn dial_addrs(&self) -> Result<Vec<Multiaddr>> {
        let peer_id = self.peer_id();
        Ok(self
            .listen_addrs()
            .await?
            .iter()
            .map(|addr| dial_address(addr, peer_id))
            .collect())
    }

    /// Trigger the substrate's self-bootstrap
    ///
    /// Not retried here; a caller may recreate the node instead.
    pub async fn bootstrap(&self) -> Result<()> {
        self.ensure_open()?;
        info!(parent: &self.inner.span, "Bootstrapping DHT");

        self.inner
            .substrate
            .bootstrap()
            .instrument(self.inner.span.clone())
            .await
            .map_err(|e| match e {
                DhtError::Bootstrap(_) | DhtError::Closed => e,
                other => DhtError::Bootstrap(other.to_string()),
            })?;

        self.advance(NodeState::Bootstrapped);
        Ok(())
    }

    /// Dial `peer` and wait until it is connected
    pub async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<()> {
        self.ensure_open()?;
        if addrs.is_empty() {
            return Err(DhtError::Connect {
                peer,
                reason: "no addresses to dial".to_string(),
            });
        }
        info!(parent: &self.inner.span, "Connecting to {} at {:?}", peer, addrs);

        self.inner
            .substrate
            .connect(peer, addrs)
            .instrument(self.inner.span.clone())
            .await
            .map_err(|e| match e {
                DhtError::Connect { .. } | DhtError::Closed => e,
                other => DhtError::Connect {
                    peer,
                    reason: other.to_string(),
                },
            })?;

        info!(parent: &self.inner.span, "Connected to {}", peer);
        self.advance(NodeState::Connected);
        Ok(())
    }

    /// Dial a `/p2p/`-terminated address
    pub async fn connect_addr(&self, addr: &Multiaddr) -> Result<PeerId> {
        let peer = peer_of(addr).ok_or_else(|| {
            DhtError::Configuration(format!("address {} does not end with /p2p/<peer id>", addr))
        })?;
        self.connect(peer, vec![addr.clone()]).await?;
        Ok(peer)
    }

    /// Transport connection state towards `peer`
    pub async fn connection_state(&self, peer: PeerId) -> Result<Connectedness> {
        self.ensure_open()?;
        self.inner.substrate.connection_state(peer).await
    }

    /// Number of routing-table entries
    pub async fn routing_table_size(&self) -> Result<usize> {
        self.ensure_open()?;
        self.inner.substrate.routing_table_size().await
    }

    /// Poll with the node's own readiness configuration
    pub async fn await_ready(&self) -> Result<usize> {
        let readiness = self.inner.readiness.clone();
        self.await_routing_ready(&readiness, None).await
    }

    /// Poll the routing table until it holds at least one peer
    ///
    /// Returns the observed size. Without `cancel` and without
    /// `readiness.max_wait_ms` this waits indefinitely.
    pub async fn await_routing_ready(
        &self,
        readiness: &ReadinessConfig,
        cancel: Option<&CancellationToken>,
    ) -> Result<usize> {
        let span = &self.inner.span;
        let deadline = readiness.max_wait().map(|max| Instant::now() + max);
        let mut polls: u32 = 0;

        loop {
            let size = self.routing_table_size().await?;
            if size > 0 {
                info!(parent: span, "Routing table populated with {} peers", size);
                self.advance(NodeState::Ready);
                return Ok(size);
            }

            if polls % readiness.log_every.max(1) == 0 {
                info!(parent: span, "Routing table empty, waiting...");
            }
            polls = polls.wrapping_add(1);

            let cancelled = async {
                match cancel {
                    Some(token) => token.cancelled().await,
                    None => pending().await,
                }
            };
            let expired = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => pending().await,
                }
            };

            tokio::select! {
                _ = tokio::time::sleep(readiness.poll_interval()) => {}
                _ = cancelled => {
                    debug!(parent: span, "Readiness wait cancelled after {} polls", polls);
                    return Err(DhtError::Cancelled);
                }
                _ = expired => {
                    return Err(DhtError::Timeout(format!(
                        "routing table still empty after {:?}",
                        readiness.max_wait().unwrap_or_default()
                    )));
                }
            }
        }
    }

    /// Store `value` under `key` with the node's retry policy
    pub async fn put(&self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        let policy = self.inner.retry.clone();
        self.put_with(key, value, &policy).await
    }

    /// Store `value` under `key` with an explicit retry policy
    pub async fn put_with(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        policy: &RetryPolicy,
    ) -> Result<()> {
        self.ensure_open()?;
        let key = self.inner.namespace.validate(key)?;
        let value = value.into();
        info!(parent: &self.inner.span, "Storing key: {} ({} bytes)", key, value.len());

        let runner = RetryRunner::new(policy.clone(), "put", &self.inner.span);
        let result = runner
            .run(|_| {
                let key = key.clone();
                let value = value.clone();
                async move {
                    self.ensure_open()?;
                    self.inner.substrate.put_value(key, value).await
                }
            })
            .await;

        match result {
            Ok(()) => {
                info!(parent: &self.inner.span, "Key-value pair stored successfully");
                Ok(())
            }
            Err(RetryError::Exhausted { attempts, last_error }) => Err(DhtError::StoreFailed {
                attempts,
                source: Box::new(last_error),
            }),
            Err(RetryError::Aborted { error, .. }) => Err(error),
        }
    }

    /// Fetch the value for `key` with the node's deadline and retry policy
    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let policy = self.inner.retry.clone();
        self.get_with(key, self.inner.fetch_timeout, &policy).await
    }

    /// Fetch the value for `key`, giving up after `deadline`
    ///
    /// The deadline covers every attempt and the delays between them; on
    /// expiry the in-flight attempt is dropped.
    pub async fn get_with(
        &self,
        key: &str,
        deadline: Duration,
        policy: &RetryPolicy,
    ) -> Result<Vec<u8>> {
        self.ensure_open()?;
        let key = self.inner.namespace.validate(key)?;
        info!(parent: &self.inner.span, "Retrieving value for key: {}", key);

        let runner = RetryRunner::new(policy.clone(), "get", &self.inner.span);
        let fetch = runner.run(|_| {
            let key = key.clone();
            async move {
                self.ensure_open()?;
                match self.inner.substrate.get_value(key.clone()).await? {
                    Some(value) => Ok(value),
                    None => Err(DhtError::NotFound(key.to_string())),
                }
            }
        });

        match tokio::time::timeout(deadline, fetch).await {
            Ok(Ok(value)) => {
                info!(parent: &self.inner.span, "Retrieved {} bytes for key {}", value.len(), key);
                Ok(value)
            }
            Ok(Err(RetryError::Exhausted { attempts, last_error })) => Err(DhtError::FetchFailed {
                attempts,
                source: Box::new(last_error),
            }),
            Ok(Err(RetryError::Aborted { error, .. })) => Err(error),
            Err(_) => {
                warn!(parent: &self.inner.span, "Fetch of {} exceeded {:?}", key, deadline);
                Err(DhtError::Timeout(format!("get {} exceeded {:?}", key, deadline)))
            }
        }
    }

    /// Release transport and identity resources
    ///
    /// Idempotent: only the first call reaches the substrate.
    pub async fn close(&self) -> Result<()> {
        let previous = {
            let mut state = self.inner.state.write();
            std::mem::replace(&mut *state, NodeState::Closed)
        };
        if previous == NodeState::Closed {
            debug!(parent: &self.inner.span, "Node already closed");
            return Ok(());
        }

        info!(parent: &self.inner.span, "Closing node");
        self.inner.substrate.shutdown().await
    }

    /// Validate `key` against this node's namespace without touching the network
    pub fn validate_key(&self, key: &str) -> Result<RecordKey> {
        self.inner.namespace.validate(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substrate::MockSubstrate;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mock() -> MockSubstrate {
        let mut substrate = MockSubstrate::new();
        substrate.expect_local_peer_id().return_const(PeerId::random());
        substrate
    }

    fn node(substrate: MockSubstrate) -> DhtNode<MockSubstrate> {
        DhtNode::with_substrate(substrate, &DhtConfig::default())
    }

    #[tokio::test]
    async fn test_invalid_key_makes_no_substrate_call() {
        let mut substrate = mock();
        substrate.expect_put_value().never();
        substrate.expect_get_value().never();
        let node = node(substrate);

        for key in ["testkey", "/other/testkey", "/myapp/"] {
            assert!(matches!(node.put(key, "v").await, Err(DhtError::InvalidKey { .. })));
            assert!(matches!(node.get(key).await, Err(DhtError::InvalidKey { .. })));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_put_exhaustion_reports_attempts() {
        let mut substrate = mock();
        substrate
            .expect_put_value()
            .times(3)
            .returning(|_, _| Err(DhtError::Network("quorum failed".into())));
        let node = node(substrate);

        let err = node.put("/myapp/k", "v").await.unwrap_err();
        assert_eq!(err.attempts(), Some(3));
        assert!(matches!(err, DhtError::StoreFailed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_not_found_is_not_retried() {
        let mut substrate = mock();
        substrate.expect_get_value().times(1).returning(|_| Ok(None));
        let node = node(substrate);

        let err = node.get("/myapp/missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_retries_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut substrate = mock();
        substrate.expect_get_value().times(2).returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(DhtError::Network("routing table is empty".into()))
            } else {
                Ok(Some(b"value".to_vec()))
            }
        });
        let node = node(substrate);

        assert_eq!(node.get("/myapp/k").await.unwrap(), b"value");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_returns_immediately_when_populated() {
        let mut substrate = mock();
        substrate.expect_routing_table_size().times(1).returning(|| Ok(2));
        let node = node(substrate);

        let start = Instant::now();
        let size = node
            .await_routing_ready(&ReadinessConfig::every(Duration::from_secs(3)), None)
            .await
            .unwrap();
        assert_eq!(size, 2);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(node.state(), NodeState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_waits_for_first_peer() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let mut substrate = mock();
        substrate
            .expect_routing_table_size()
            .returning(move || Ok(if counter.fetch_add(1, Ordering::SeqCst) < 3 { 0 } else { 1 }));
        let node = node(substrate);

        let start = Instant::now();
        node.await_routing_ready(&ReadinessConfig::every(Duration::from_millis(100)), None)
            .await
            .unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 4);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_cancellation() {
        let mut substrate = mock();
        substrate.expect_routing_table_size().returning(|| Ok(0));
        let node = node(substrate);

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let result = node
            .await_routing_ready(&ReadinessConfig::every(Duration::from_millis(100)), Some(&token))
            .await;
        assert!(matches!(result, Err(DhtError::Cancelled)));
        assert_eq!(node.state(), NodeState::Created);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_max_wait() {
        let mut substrate = mock();
        substrate.expect_routing_table_size().returning(|| Ok(0));
        let node = node(substrate);

        let readiness =
            ReadinessConfig::every(Duration::from_millis(100)).with_max_wait(Duration::from_secs(2));
        let result = node.await_routing_ready(&readiness, None).await;
        assert!(matches!(result, Err(DhtError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_log_every_still_polls() {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let mut substrate = mock();
        substrate
            .expect_routing_table_size()
            .returning(move || Ok(if counter.fetch_add(1, Ordering::SeqCst) < 2 { 0 } else { 3 }));

        let mut config = DhtConfig::default();
        config.readiness.log_every = 0;
        let node = DhtNode::with_substrate(substrate, &config);

        assert_eq!(node.await_ready().await.unwrap(), 3);
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_debug_shows_peer_and_state() {
        let node = node(mock());
        let rendered = format!("{:?}", node);
        assert!(rendered.contains(&node.peer_id().to_string()));
        assert!(rendered.contains("Created"));
        assert!(rendered.contains("Server"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let mut substrate = mock();
        substrate.expect_shutdown().times(1).returning(|| Ok(()));
        substrate.expect_put_value().never();
        let node = node(substrate);
        let peer = PeerId::random();

        node.close().await.unwrap();
        node.close().await.unwrap();

        assert!(node.is_closed());
        assert!(matches!(node.bootstrap().await, Err(DhtError::Closed)));
        assert!(matches!(node.connect(peer, vec![]).await, Err(DhtError::Closed)));
        assert!(matches!(node.put("/myapp/k", "v").await, Err(DhtError::Closed)));
        assert!(matches!(node.get("/myapp/k").await, Err(DhtError::Closed)));
        assert!(matches!(node.routing_table_size().await, Err(DhtError::Closed)));
        assert!(matches!(node.listen_addrs().await, Err(DhtError::Closed)));
        assert!(matches!(
            node.await_routing_ready(&ReadinessConfig::default(), None).await,
            Err(DhtError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_failure_is_typed() {
        let mut substrate = mock();
        substrate
            .expect_bootstrap()
            .returning(|| Err(DhtError::Network("dial refused".into())));
        let node = node(substrate);

        assert!(matches!(node.bootstrap().await, Err(DhtError::Bootstrap(_))));
        assert_eq!(node.state(), NodeState::Created);
    }

    #[tokio::test]
    async fn test_state_moves_forward_only() {
        let mut substrate = mock();
        substrate.expect_bootstrap().returning(|| Ok(()));
        substrate.expect_connect().returning(|_, _| Ok(()));
        let node = node(substrate);
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();

        node.connect(PeerId::random(), vec![addr]).await.unwrap();
        assert_eq!(node.state(), NodeState::Connected);
        node.bootstrap().await.unwrap();
        assert_eq!(node.state(), NodeState::Connected);
    }

    #[tokio::test]
    async fn test_connect_addr_requires_peer_suffix() {
        let node = node(mock());
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        assert!(matches!(
            node.connect_addr(&addr).await,
            Err(DhtError::Configuration(_))
        ));
    }

    /// Substrate whose lookups never complete
    struct StalledSubstrate {
        peer_id: PeerId,
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl Substrate for StalledSubstrate {
        fn local_peer_id(&self) -> PeerId {
            self.peer_id
        }
        async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
            Ok(vec![])
        }
        async fn bootstrap(&self) -> Result<()> {
            Ok(())
        }
        async fn connect(&self, _peer: PeerId, _addrs: Vec<Multiaddr>) -> Result<()> {
            Ok(())
        }
        async fn connection_state(&self, _peer: PeerId) -> Result<Connectedness> {
            Ok(Connectedness::NotConnected)
        }
        async fn routing_table_size(&self) -> Result<usize> {
            Ok(1)
        }
        async fn put_value(&self, _key: RecordKey, _value: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn get_value(&self, _key: RecordKey) -> Result<Option<Vec<u8>>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            pending().await
        }
        async fn shutdown(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_deadline_returns_timeout() {
        let node = DhtNode::with_substrate(
            StalledSubstrate {
                peer_id: PeerId::random(),
                lookups: AtomicUsize::new(0),
            },
            &DhtConfig::default(),
        );

        let start = Instant::now();
        let err = node
            .get_with("/myapp/k", Duration::from_secs(10), &RetryPolicy::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DhtError::Timeout(_)));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(node.substrate().lookups.load(Ordering::SeqCst), 1);
    }
}
