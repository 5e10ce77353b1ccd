//! Multi-node harness
//!
//! Stands up node pairs, wires them together through advertised addresses
//! and joins readiness across many nodes.

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::config::{DhtConfig, NodeMode};
use crate::error::{DhtError, Result};
use crate::memory::{MemoryHost, MemoryNetwork};
use crate::node::DhtNode;
use crate::substrate::{Connectedness, Substrate};
use crate::swarm::SwarmSubstrate;

/// Creates nodes on some substrate
#[async_trait]
pub trait NodeFactory: Send + Sync {
    /// Substrate backing created nodes
    type Substrate: Substrate;

    /// Create a node from `config`
    async fn create(&self, config: DhtConfig) -> Result<DhtNode<Self::Substrate>>;
}

/// Nodes on real libp2p swarms
#[derive(Clone, Copy, Debug, Default)]
pub struct Libp2pFactory;

#[async_trait]
impl NodeFactory for Libp2pFactory {
    type Substrate = SwarmSubstrate;

    async fn create(&self, config: DhtConfig) -> Result<DhtNode<SwarmSubstrate>> {
        DhtNode::create(config).await
    }
}

#[async_trait]
impl NodeFactory for MemoryNetwork {
    type Substrate = MemoryHost;

    async fn create(&self, config: DhtConfig) -> Result<DhtNode<MemoryHost>> {
        if config.listen_addresses.is_empty() {
            return Err(DhtError::Transport("no listen address to bind".to_string()));
        }
        config.validate().map_err(DhtError::Configuration)?;
        let host = self.spawn_host(
            config.mode,
            &config.listen_multiaddrs()?,
            config.bootstrap_multiaddrs()?,
        )?;
        Ok(DhtNode::with_substrate(host, &config))
    }
}

/// Builds and drives groups of nodes
pub struct NodeOrchestrator<F: NodeFactory> {
    factory: F,
    first: DhtConfig,
    second: DhtConfig,
}

impl<F: NodeFactory> NodeOrchestrator<F> {
    /// Use the same base configuration for both nodes of a pair
    pub fn new(factory: F, base: DhtConfig) -> Self {
        Self {
            factory,
            first: base.clone(),
            second: base,
        }
    }

    /// Use distinct configurations for the first and second node
    pub fn with_configs(factory: F, first: DhtConfig, second: DhtConfig) -> Self {
        Self {
            factory,
            first,
            second,
        }
    }

    /// Factory in use
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Create two bootstrapped nodes and connect the second to the first
    ///
    /// The second node dials the first node's first advertised address and
    /// must then report it connected; anything else is a
    /// [`DhtError::Verification`] failure. Nodes are closed on failure.
    pub async fn build_pair(
        &self,
        first_mode: NodeMode,
        second_mode: NodeMode,
    ) -> Result<(DhtNode<F::Substrate>, DhtNode<F::Substrate>)> {
        let first = self
            .factory
            .create(DhtConfig {
                mode: first_mode,
                ..self.first.clone()
            })
            .await?;
        info!("Node 1 created with ID: {}", first.peer_id());

        let second = match self
            .factory
            .create(DhtConfig {
                mode: second_mode,
                ..self.second.clone()
            })
            .await
        {
            Ok(node) => node,
            Err(e) => {
                close_all(&[first]).await;
                return Err(e);
            }
        };
        info!("Node 2 created with ID: {}", second.peer_id());

        match Self::wire(&first, &second).await {
            Ok(()) => Ok((first, second)),
            Err(e) => {
                close_all(&[first, second]).await;
                Err(e)
            }
        }
    }

    async fn wire(first: &DhtNode<F::Substrate>, second: &DhtNode<F::Substrate>) -> Result<()> {
        first.bootstrap().await?;
        second.bootstrap().await?;

        let target = first
            .dial_addrs()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| DhtError::Verification("node 1 advertises no address".to_string()))?;
        info!("Connecting node 2 to node 1 at address: {}", target);
        second.connect(first.peer_id(), vec![target]).await?;

        match second.connection_state(first.peer_id()).await? {
            Connectedness::Connected => {
                info!("Connection verified");
                Ok(())
            }
            Connectedness::NotConnected => Err(DhtError::Verification(format!(
                "node 2 not connected to node 1 ({})",
                first.peer_id()
            ))),
        }
    }
}

/// Wait until every node reports a non-empty routing table
///
/// Runs one polling task per node with that node's own readiness
/// configuration and joins them all. Returns the observed table sizes in
/// input order, or the first error.
pub async fn wait_all_ready<S: Substrate>(nodes: &[DhtNode<S>]) -> Result<Vec<usize>> {
    info!("Waiting for DHT routing tables to populate on {} nodes", nodes.len());

    let mut tasks = JoinSet::new();
    for (index, node) in nodes.iter().enumerate() {
        let node = node.clone();
        tasks.spawn(async move { (index, node.await_ready().await) });
    }

    let mut sizes = vec![0; nodes.len()];
    while let Some(joined) = tasks.join_next().await {
        let (index, result) =
            joined.map_err(|e| DhtError::Internal(format!("readiness task failed: {}", e)))?;
        sizes[index] = result?;
    }
    Ok(sizes)
}

/// Put `value` from `writer`, read it back from `reader` and compare
pub async fn round_trip<S: Substrate>(
    writer: &DhtNode<S>,
    reader: &DhtNode<S>,
    key: &str,
    value: &[u8],
) -> Result<Vec<u8>> {
    writer.put(key, value).await?;
    let retrieved = reader.get(key).await?;
    if retrieved != value {
        return Err(DhtError::Verification(format!(
            "value for {} differs: stored {} bytes, retrieved {} bytes",
            key,
            value.len(),
            retrieved.len()
        )));
    }
    Ok(retrieved)
}

/// Close every node, logging failures
pub async fn close_all<S: Substrate>(nodes: &[DhtNode<S>]) {
    for node in nodes {
        if let Err(e) = node.close().await {
            warn!("Failed to close node {}: {}", node.peer_id(), e);
        }
    }
}
