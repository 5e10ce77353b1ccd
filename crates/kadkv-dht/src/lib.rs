//! # kadkv DHT
//!
//! Peer-to-peer key-value store node on a Kademlia distributed hash table.
//! Based on Kademlia via libp2p.
//!
//! ## Features
//!
//! - **Node lifecycle**: create, bootstrap, connect, wait for routing, close
//! - **Namespaced records**: keys are validated against an application prefix
//!   before any network call
//! - **Bounded retries**: put and get share one retry policy; definitive
//!   absence is never retried
//! - **Deadlines**: fetches run under a deadline, readiness waits can be
//!   cancelled
//!
//! ## Architecture
//!
//! [`DhtNode`] depends only on the [`Substrate`] trait:
//! 1. [`SwarmSubstrate`] runs a libp2p swarm (TCP, noise, yamux, Kademlia,
//!    identify) on its own event-loop task
//! 2. [`MemoryNetwork`] connects hosts inside one process
//! 3. [`NodeOrchestrator`] builds connected node pairs on either

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod key;
pub mod memory;
pub mod node;
pub mod orchestrator;
pub mod retry;
pub mod substrate;
pub mod swarm;

pub use config::{DhtConfig, NodeMode, ReadinessConfig};
pub use error::{DhtError, Result};
pub use key::{Namespace, RecordKey};
pub use memory::{MemoryHost, MemoryNetwork};
pub use node::{DhtNode, NodeState};
pub use orchestrator::{wait_all_ready, Libp2pFactory, NodeFactory, NodeOrchestrator};
pub use retry::{Retriable, RetryError, RetryPolicy, RetryRunner};
pub use substrate::{dial_address, Connectedness, Substrate};
pub use swarm::SwarmSubstrate;

/// Re-exported so callers can cancel readiness waits
pub use tokio_util::sync::CancellationToken;

/// Default number of put/get attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default fetch deadline in seconds
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::config::{DhtConfig, NodeMode, ReadinessConfig};
    pub use crate::error::{DhtError, Result};
    pub use crate::node::{DhtNode, NodeState};
    pub use crate::orchestrator::{wait_all_ready, NodeOrchestrator};
    pub use crate::retry::RetryPolicy;
    pub use crate::substrate::{Connectedness, Substrate};
}
