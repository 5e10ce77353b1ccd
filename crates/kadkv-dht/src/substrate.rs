//! The DHT substrate boundary
//!
//! [`DhtNode`](crate::DhtNode) depends only on this trait. The libp2p swarm
//! and the in-memory network both implement it.

use async_trait::async_trait;
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};

use crate::error::Result;
use crate::key::RecordKey;

/// Transport-level connection state towards a peer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Connectedness {
    /// At least one live connection
    Connected,
    /// No live connection
    NotConnected,
}

/// Primitives consumed from the underlying DHT and transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Substrate: Send + Sync + 'static {
    /// Identity of the local peer
    fn local_peer_id(&self) -> PeerId;

    /// Addresses the transport is listening on
    async fn listen_addrs(&self) -> Result<Vec<Multiaddr>>;

    /// Discover initial peers from preconfigured seeds
    async fn bootstrap(&self) -> Result<()>;

    /// Dial `peer` and wait until the transport reports it connected
    async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<()>;

    /// Current connection state towards `peer`
    async fn connection_state(&self, peer: PeerId) -> Result<Connectedness>;

    /// Number of entries in the routing table
    async fn routing_table_size(&self) -> Result<usize>;

    /// Replicate a record
    async fn put_value(&self, key: RecordKey, value: Vec<u8>) -> Result<()>;

    /// Look a record up; `None` when the network has no value for the key
    async fn get_value(&self, key: RecordKey) -> Result<Option<Vec<u8>>>;

    /// Release transport and identity resources
    async fn shutdown(&self) -> Result<()>;
}

/// Address usable to dial `peer`: `addr` with a trailing `/p2p/<peer>`
pub fn dial_address(addr: &Multiaddr, peer: PeerId) -> Multiaddr {
    match addr.iter().last() {
        Some(Protocol::P2p(_)) => addr.clone(),
        _ => addr.clone().with(Protocol::P2p(peer)),
    }
}

/// Peer id carried by a trailing `/p2p` component, if any
pub fn peer_of(addr: &Multiaddr) -> Option<PeerId> {
    match addr.iter().last() {
        Some(Protocol::P2p(peer)) => Some(peer),
        _ => None,
    }
}
