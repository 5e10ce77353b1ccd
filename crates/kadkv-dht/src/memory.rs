//! In-process substrate
//!
//! Hosts attached to one [`MemoryNetwork`] see each other after an explicit
//! `connect`, with routing and storage rules that follow Kademlia's mode
//! semantics: only server-mode peers enter routing tables and hold records
//! for others.

use async_trait::async_trait;
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::NodeMode;
use crate::error::{DhtError, Result};
use crate::key::RecordKey;
use crate::substrate::{peer_of, Connectedness, Substrate};

struct HostState {
    mode: NodeMode,
    listen_addrs: Vec<Multiaddr>,
    seeds: Vec<Multiaddr>,
    routing: HashSet<PeerId>,
    connections: HashSet<PeerId>,
    records: HashMap<Vec<u8>, Vec<u8>>,
    closed: bool,
}

#[derive(Default)]
struct Inner {
    hosts: HashMap<PeerId, HostState>,
}

/// Shared in-memory network
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<RwLock<Inner>>,
    next_port: Arc<AtomicU16>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self {
            inner: Arc::default(),
            next_port: Arc::new(AtomicU16::new(1)),
        }
    }

    /// Attach a host listening on `listen_addrs`
    ///
    /// Port `0` is replaced by a unique port, mimicking an OS-assigned one.
    pub fn spawn_host(
        &self,
        mode: NodeMode,
        listen_addrs: &[Multiaddr],
        seeds: Vec<Multiaddr>,
    ) -> Result<MemoryHost> {
        if listen_addrs.is_empty() {
            return Err(DhtError::Transport("no listen address to bind".to_string()));
        }

        let peer_id = PeerId::random();
        let bound: Vec<Multiaddr> = listen_addrs.iter().map(|a| self.bind(a)).collect();

        debug!(%peer_id, ?bound, %mode, "Memory host attached");
        self.inner.write().hosts.insert(
            peer_id,
            HostState {
                mode,
                listen_addrs: bound,
                seeds,
                routing: HashSet::new(),
                connections: HashSet::new(),
                records: HashMap::new(),
                closed: false,
            },
        );

        Ok(MemoryHost {
            network: self.clone(),
            peer_id,
        })
    }

    /// Number of attached, open hosts
    pub fn host_count(&self) -> usize {
        self.inner.read().hosts.values().filter(|h| !h.closed).count()
    }

    fn bind(&self, addr: &Multiaddr) -> Multiaddr {
        addr.iter()
            .map(|p| match p {
                Protocol::Tcp(0) => Protocol::Tcp(self.next_port.fetch_add(1, Ordering::Relaxed)),
                other => other,
            })
            .collect()
    }

    fn find_by_addr(inner: &Inner, addr: &Multiaddr) -> Option<PeerId> {
        if let Some(peer) = peer_of(addr) {
            return inner.hosts.contains_key(&peer).then_some(peer);
        }
        inner
            .hosts
            .iter()
            .find(|(_, h)| h.listen_addrs.contains(addr))
            .map(|(peer, _)| *peer)
    }

    fn link(inner: &mut Inner, local: PeerId, remote: PeerId) -> Result<()> {
        let remote_mode = match inner.hosts.get(&remote) {
            Some(h) if !h.closed => h.mode,
            _ => return Err(DhtError::Network(format!("peer {} unreachable", remote))),
        };
        let local_mode = inner.hosts.get(&local).map(|h| h.mode).unwrap_or(NodeMode::Client);

        if let Some(h) = inner.hosts.get_mut(&local) {
            h.connections.insert(remote);
            if remote_mode == NodeMode::Server {
                h.routing.insert(remote);
            }
        }
        if let Some(h) = inner.hosts.get_mut(&remote) {
            h.connections.insert(local);
            if local_mode == NodeMode::Server {
                h.routing.insert(local);
            }
        }
        Ok(())
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// One host on a [`MemoryNetwork`]
pub struct MemoryHost {
    network: MemoryNetwork,
    peer_id: PeerId,
}

impl MemoryHost {
    fn with_host<T>(&self, f: impl FnOnce(&HostState) -> T) -> Result<T> {
        let inner = self.network.inner.read();
        match inner.hosts.get(&self.peer_id) {
            Some(h) if !h.closed => Ok(f(h)),
            _ => Err(DhtError::Closed),
        }
    }

    /// Number of records held locally
    pub fn record_count(&self) -> usize {
        self.with_host(|h| h.records.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Substrate for MemoryHost {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn listen_addrs(&self) -> Result<Vec<Multiaddr>> {
        self.with_host(|h| h.listen_addrs.clone())
    }

    async fn bootstrap(&self) -> Result<()> {
        let seeds = self.with_host(|h| h.seeds.clone())?;
        let mut inner = self.network.inner.write();
        for seed in seeds {
            let remote = MemoryNetwork::find_by_addr(&inner, &seed)
                .ok_or_else(|| DhtError::Bootstrap(format!("seed {} unreachable", seed)))?;
            MemoryNetwork::link(&mut inner, self.peer_id, remote)
                .map_err(|e| DhtError::Bootstrap(e.to_string()))?;
        }
        Ok(())
    }

    async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<()> {
        self.with_host(|_| ())?;
        let mut inner = self.network.inner.write();
        let reachable = addrs
            .iter()
            .any(|a| MemoryNetwork::find_by_addr(&inner, a) == Some(peer));
        if !reachable {
            return Err(DhtError::Connect {
                peer,
                reason: "no address reaches the peer".to_string(),
            });
        }
        MemoryNetwork::link(&mut inner, self.peer_id, peer).map_err(|e| DhtError::Connect {
            peer,
            reason: e.to_string(),
        })
    }

    async fn connection_state(&self, peer: PeerId) -> Result<Connectedness> {
        self.with_host(|h| {
            if h.connections.contains(&peer) {
                Connectedness::Connected
            } else {
                Connectedness::NotConnected
            }
        })
    }

    async fn routing_table_size(&self) -> Result<usize> {
        self.with_host(|h| h.routing.len())
    }

    async fn put_value(&self, key: RecordKey, value: Vec<u8>) -> Result<()> {
        let mut inner = self.network.inner.write();
        let routing: Vec<PeerId> = match inner.hosts.get(&self.peer_id) {
            Some(h) if !h.closed => h.routing.iter().copied().collect(),
            _ => return Err(DhtError::Closed),
        };

        let replicas: Vec<PeerId> = routing
            .into_iter()
            .filter(|peer| {
                inner
                    .hosts
                    .get(peer)
                    .is_some_and(|h| !h.closed && h.mode == NodeMode::Server)
            })
            .collect();
        trace!(%key, replicas = replicas.len(), "Memory put");
        if replicas.is_empty() {
            return Err(DhtError::Network("no peers reachable to store the record".to_string()));
        }

        for peer in replicas.iter().chain(std::iter::once(&self.peer_id)) {
            if let Some(h) = inner.hosts.get_mut(peer) {
                h.records.insert(key.as_bytes().to_vec(), value.clone());
            }
        }
        Ok(())
    }

    async fn get_value(&self, key: RecordKey) -> Result<Option<Vec<u8>>> {
        let inner = self.network.inner.read();
        let host = match inner.hosts.get(&self.peer_id) {
            Some(h) if !h.closed => h,
            _ => return Err(DhtError::Closed),
        };

        if let Some(value) = host.records.get(key.as_bytes()) {
            return Ok(Some(value.clone()));
        }
        if host.routing.is_empty() {
            return Err(DhtError::Network("routing table is empty".to_string()));
        }

        let found = host
            .routing
            .iter()
            .filter_map(|peer| inner.hosts.get(peer))
            .filter(|h| !h.closed)
            .find_map(|h| h.records.get(key.as_bytes()).cloned());
        Ok(found)
    }

    async fn shutdown(&self) -> Result<()> {
        let mut inner = self.network.inner.write();
        if let Some(h) = inner.hosts.get_mut(&self.peer_id) {
            h.closed = true;
            h.connections.clear();
        }
        for h in inner.hosts.values_mut() {
            h.connections.remove(&self.peer_id);
        }
        Ok(())
    }
}
