//! DHT configuration

use libp2p::Multiaddr;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DhtError, Result};
use crate::key::Namespace;
use crate::retry::RetryPolicy;

/// Default Kademlia protocol name
pub const DEFAULT_PROTOCOL_NAME: &str = "/ipfs/kad/1.0.0";

/// Whether a node serves routing for others
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeMode {
    /// Answers DHT queries and stores records for others
    #[default]
    Server,
    /// Queries only
    Client,
}

impl fmt::Display for NodeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeMode::Server => f.write_str("server"),
            NodeMode::Client => f.write_str("client"),
        }
    }
}

impl FromStr for NodeMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(NodeMode::Server),
            "client" => Ok(NodeMode::Client),
            other => Err(format!("unknown mode {:?}, expected server or client", other)),
        }
    }
}

/// DHT node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    /// Operating mode
    pub mode: NodeMode,
    /// Listen addresses
    pub listen_addresses: Vec<String>,
    /// Bootstrap nodes, dialed by `bootstrap()`
    pub bootstrap_nodes: Vec<String>,
    /// Key namespace
    pub namespace: Namespace,
    /// Kademlia protocol name
    pub protocol_name: String,
    /// Kademlia query timeout
    pub query_timeout_secs: u64,
    /// Connection timeout
    pub connection_timeout_secs: u64,
    /// Idle connection timeout
    pub idle_connection_timeout_secs: u64,
    /// Deadline for a whole `get`, retries included
    pub fetch_timeout_secs: u64,
    /// Retry policy for put and get
    pub retry: RetryPolicy,
    /// Routing readiness polling
    pub readiness: ReadinessConfig,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            mode: NodeMode::Server,
            listen_addresses: vec!["/ip4/127.0.0.1/tcp/0".to_string()],
            bootstrap_nodes: Vec::new(),
            namespace: Namespace::default(),
            protocol_name: DEFAULT_PROTOCOL_NAME.to_string(),
            query_timeout_secs: 30,
            connection_timeout_secs: 10,
            idle_connection_timeout_secs: 60,
            fetch_timeout_secs: crate::DEFAULT_FETCH_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
            readiness: ReadinessConfig::default(),
        }
    }
}

impl DhtConfig {
    /// Create with a mode
    pub fn with_mode(mode: NodeMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing fields take defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            DhtError::Configuration(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate().map_err(DhtError::Configuration)?;
        Ok(config)
    }

    /// Add bootstrap node
    pub fn add_bootstrap_node(&mut self, addr: impl Into<String>) {
        self.bootstrap_nodes.push(addr.into());
    }

    /// Parsed listen addresses
    pub fn listen_multiaddrs(&self) -> Result<Vec<Multiaddr>> {
        parse_multiaddrs(&self.listen_addresses)
    }

    /// Parsed bootstrap addresses
    pub fn bootstrap_multiaddrs(&self) -> Result<Vec<Multiaddr>> {
        parse_multiaddrs(&self.bootstrap_nodes)
    }

    /// Query timeout as Duration
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }

    /// Connection timeout as Duration
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Idle connection timeout as Duration
    pub fn idle_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_connection_timeout_secs)
    }

    /// Fetch deadline as Duration
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.listen_addresses.is_empty() {
            return Err("at least one listen address is required".to_string());
        }
        if !self.protocol_name.starts_with('/') {
            return Err("protocol_name must start with '/'".to_string());
        }
        if self.connection_timeout_secs == 0 {
            return Err("connection_timeout_secs must be > 0".to_string());
        }
        if self.fetch_timeout_secs == 0 {
            return Err("fetch_timeout_secs must be > 0".to_string());
        }
        self.retry.validate()?;
        self.readiness.validate()?;
        Ok(())
    }
}

fn parse_multiaddrs(raw: &[String]) -> Result<Vec<Multiaddr>> {
    raw.iter()
        .map(|addr| {
            addr.parse::<Multiaddr>()
                .map_err(|e| DhtError::Configuration(format!("invalid multiaddr {}: {}", addr, e)))
        })
        .collect()
}

/// Routing-table readiness polling
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    /// Delay between routing-table size checks (milliseconds)
    pub poll_interval_ms: u64,
    /// Log the empty table every this many polls
    pub log_every: u32,
    /// Give up after this long; `None` waits indefinitely
    pub max_wait_ms: Option<u64>,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            log_every: 10,
            max_wait_ms: None,
        }
    }
}

impl ReadinessConfig {
    /// Poll every `interval`, logging each poll
    pub fn every(interval: Duration) -> Self {
        Self {
            poll_interval_ms: interval.as_millis() as u64,
            log_every: 1,
            max_wait_ms: None,
        }
    }

    /// Bound the wait
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_ms = Some(max_wait.as_millis() as u64);
        self
    }

    /// Poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Maximum wait as Duration
    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_ms.map(Duration::from_millis)
    }

    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.poll_interval_ms == 0 {
            return Err("poll_interval_ms must be > 0".to_string());
        }
        if self.log_every == 0 {
            return Err("log_every must be > 0".to_string());
        }
        Ok(())
    }
}
