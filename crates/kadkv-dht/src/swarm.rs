//! libp2p substrate
//!
//! A Kademlia + identify swarm driven by a single event-loop task. The
//! [`SwarmSubstrate`] handle talks to it over a command channel; every reply
//! travels back on a oneshot.

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    core::transport::ListenerId,
    identify, identity,
    kad::{self, store::MemoryStore, store::RecordStore},
    noise,
    swarm::{dial_opts::DialOpts, NetworkBehaviour, SwarmEvent},
    tcp, yamux, Multiaddr, PeerId, StreamProtocol, Swarm,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::config::{DhtConfig, NodeMode};
use crate::error::{self, DhtError};
use crate::key::RecordKey;
use crate::substrate::{peer_of, Connectedness, Substrate};

/// Identify protocol version advertised by every node
const IDENTIFY_PROTOCOL: &str = "/kadkv/id/1.0.0";

/// How often abandoned requests are swept
const PRUNE_INTERVAL: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<error::Result<T>>;

#[derive(Debug)]
enum Command {
    ListenAddrs {
        response: oneshot::Sender<Vec<Multiaddr>>,
    },
    Bootstrap {
        response: Reply<()>,
    },
    Dial {
        peer: PeerId,
        addrs: Vec<Multiaddr>,
        response: Reply<()>,
    },
    ConnectionState {
        peer: PeerId,
        response: oneshot::Sender<Connectedness>,
    },
    RoutingTableSize {
        response: oneshot::Sender<usize>,
    },
    PutRecord {
        key: RecordKey,
        value: Vec<u8>,
        response: Reply<()>,
    },
    GetRecord {
        key: RecordKey,
        response: Reply<Option<Vec<u8>>>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Kademlia for records and routing, identify to learn peer addresses
#[derive(NetworkBehaviour)]
struct KadKvBehaviour {
    kademlia: kad::Behaviour<MemoryStore>,
    identify: identify::Behaviour,
}

/// Handle to a running libp2p swarm
pub struct SwarmSubstrate {
    command_tx: mpsc::Sender<Command>,
    peer_id: PeerId,
    connect_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SwarmSubstrate {
    /// Build the swarm, bind every listen address and start the event loop
    ///
    /// Fails with [`DhtError::Transport`] when no listen address can be bound.
    pub async fn spawn(config: &DhtConfig, span: &Span) -> error::Result<Self> {
        if config.listen_addresses.is_empty() {
            return Err(DhtError::Transport("no listen address to bind".to_string()));
        }
        config.validate().map_err(DhtError::Configuration)?;

        let local_key = identity::Keypair::generate_ed25519();
        let peer_id = PeerId::from(local_key.public());
        let protocol = StreamProtocol::try_from_owned(config.protocol_name.clone())
            .map_err(|e| DhtError::Configuration(format!("invalid protocol name: {}", e)))?;

        let mut swarm = Self::create_swarm(config, local_key, protocol.clone())?;
        let listen_addrs = Self::bind(&mut swarm, config)
            .instrument(span.clone())
            .await?;
        info!(parent: span, "Peer {} listening on {:?}", peer_id, listen_addrs);

        let (command_tx, command_rx) = mpsc::channel(64);
        let event_loop = EventLoop {
            swarm,
            command_rx,
            protocol,
            listen_addrs,
            bootstrap_nodes: config.bootstrap_multiaddrs()?,
            pending_dials: HashMap::new(),
            pending_puts: HashMap::new(),
            pending_gets: HashMap::new(),
        };
        let task = tokio::spawn(event_loop.run().instrument(span.clone()));

        Ok(Self {
            command_tx,
            peer_id,
            connect_timeout: config.connection_timeout(),
            task: Mutex::new(Some(task)),
        })
    }

    fn create_swarm(
        config: &DhtConfig,
        local_key: identity::Keypair,
        protocol: StreamProtocol,
    ) -> error::Result<Swarm<KadKvBehaviour>> {
        let mode = match config.mode {
            NodeMode::Server => kad::Mode::Server,
            NodeMode::Client => kad::Mode::Client,
        };
        let query_timeout = config.query_timeout();

        let swarm = libp2p::SwarmBuilder::with_existing_identity(local_key)
            .with_tokio()
            .with_tcp(
                tcp::Config::default().nodelay(true),
                noise::Config::new,
                yamux::Config::default,
            )
            .map_err(|e| DhtError::Transport(format!("Failed to configure TCP: {}", e)))?
            .with_behaviour(|key| {
                let local_peer_id = PeerId::from(key.public());

                let mut kad_config = kad::Config::default();
                kad_config.set_protocol_names(vec![protocol]);
                kad_config.set_query_timeout(query_timeout);
                let mut kademlia = kad::Behaviour::with_config(
                    local_peer_id,
                    MemoryStore::new(local_peer_id),
                    kad_config,
                );
                kademlia.set_mode(Some(mode));

                let identify = identify::Behaviour::new(identify::Config::new(
                    IDENTIFY_PROTOCOL.to_string(),
                    key.public(),
                ));

                KadKvBehaviour { kademlia, identify }
            })
            .map_err(|e| DhtError::Transport(format!("Failed to create behaviour: {}", e)))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(config.idle_connection_timeout()))
            .build();

        Ok(swarm)
    }

    /// Listen on every configured address and wait for the first bound address of each
    async fn bind(swarm: &mut Swarm<KadKvBehaviour>, config: &DhtConfig) -> error::Result<Vec<Multiaddr>> {
        let mut pending: HashSet<ListenerId> = HashSet::new();
        let mut last_error = None;

        for addr in config.listen_multiaddrs()? {
            match swarm.listen_on(addr.clone()) {
                Ok(id) => {
                    pending.insert(id);
                }
                Err(e) => {
                    error!("Failed to listen on {}: {}", addr, e);
                    last_error = Some(DhtError::from(e));
                }
            }
        }
        if pending.is_empty() {
            return Err(last_error
                .unwrap_or_else(|| DhtError::Transport("no listen address configured".to_string())));
        }

        let mut bound = Vec::new();
        let deadline = tokio::time::sleep(config.connection_timeout());
        tokio::pin!(deadline);

        while !pending.is_empty() {
            tokio::select! {
                event = swarm.select_next_some() => match event {
                    SwarmEvent::NewListenAddr { listener_id, address } => {
                        debug!("Bound {}", address);
                        bound.push(address);
                        pending.remove(&listener_id);
                    }
                    SwarmEvent::ListenerError { listener_id, error } => {
                        error!("Listener failed: {}", error);
                        pending.remove(&listener_id);
                    }
                    SwarmEvent::ListenerClosed { listener_id, reason, .. } => {
                        warn!("Listener closed: {:?}", reason);
                        pending.remove(&listener_id);
                    }
                    _ => {}
                },
                _ = &mut deadline => break,
            }
        }

        if bound.is_empty() {
            return Err(DhtError::Transport("no listen address could be bound".to_string()));
        }
        Ok(bound)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> error::Result<T> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| DhtError::Closed)?;
        rx.await.map_err(|_| DhtError::Closed)
    }
}

#[async_trait]
impl Substrate for SwarmSubstrate {
    fn local_peer_id(&self) -> PeerId {
        self.peer_id
    }

    async fn listen_addrs(&self) -> error::Result<Vec<Multiaddr>> {
        self.request(|response| Command::ListenAddrs { response }).await
    }

    async fn bootstrap(&self) -> error::Result<()> {
        self.request(|response| Command::Bootstrap { response }).await?
    }

    async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> error::Result<()> {
        let dial = self.request(|response| Command::Dial { peer, addrs, response });
        match tokio::time::timeout(self.connect_timeout, dial).await {
            Ok(result) => result?,
            Err(_) => Err(DhtError::Connect {
                peer,
                reason: format!("timed out after {:?}", self.connect_timeout),
            }),
        }
    }

    async fn connection_state(&self, peer: PeerId) -> error::Result<Connectedness> {
        self.request(|response| Command::ConnectionState { peer, response }).await
    }

    async fn routing_table_size(&self) -> error::Result<usize> {
        self.request(|response| Command::RoutingTableSize { response }).await
    }

    async fn put_value(&self, key: RecordKey, value: Vec<u8>) -> error::Result<()> {
        self.request(|response| Command::PutRecord { key, value, response }).await?
    }

    async fn get_value(&self, key: RecordKey) -> error::Result<Option<Vec<u8>>> {
        self.request(|response| Command::GetRecord { key, response }).await?
    }

    async fn shutdown(&self) -> error::Result<()> {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(Command::Shutdown { response: tx }).await.is_ok() {
            let _ = rx.await;
        }
        if let Err(e) = task.await {
            warn!("DHT event loop ended abnormally: {}", e);
        }
        Ok(())
    }
}

impl Drop for SwarmSubstrate {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

struct EventLoop {
    swarm: Swarm<KadKvBehaviour>,
    command_rx: mpsc::Receiver<Command>,
    protocol: StreamProtocol,
    listen_addrs: Vec<Multiaddr>,
    bootstrap_nodes: Vec<Multiaddr>,
    pending_dials: HashMap<PeerId, Vec<Reply<()>>>,
    pending_puts: HashMap<kad::QueryId, Reply<()>>,
    pending_gets: HashMap<kad::QueryId, Reply<Option<Vec<u8>>>>,
}

impl EventLoop {
    async fn run(mut self) {
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);

        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                command = self.command_rx.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        debug!("All handles dropped, stopping event loop");
                        break;
                    }
                },
                _ = prune.tick() => self.prune_abandoned(),
            }
        }
    }

    fn routing_table_size(&mut self) -> usize {
        self.swarm
            .behaviour_mut()
            .kademlia
            .kbuckets()
            .map(|bucket| bucket.num_entries())
            .sum()
    }

    /// Returns `false` once the loop should stop
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::ListenAddrs { response } => {
                let _ = response.send(self.listen_addrs.clone());
            }
            Command::Bootstrap { response } => {
                let _ = response.send(self.bootstrap());
            }
            Command::Dial { peer, addrs, response } => {
                if self.swarm.is_connected(&peer) {
                    let _ = response.send(Ok(()));
                    return true;
                }
                let opts = DialOpts::peer_id(peer).addresses(addrs).build();
                match self.swarm.dial(opts) {
                    Ok(()) => self.pending_dials.entry(peer).or_default().push(response),
                    Err(e) => {
                        let _ = response.send(Err(DhtError::Connect {
                            peer,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            Command::ConnectionState { peer, response } => {
                let state = if self.swarm.is_connected(&peer) {
                    Connectedness::Connected
                } else {
                    Connectedness::NotConnected
                };
                let _ = response.send(state);
            }
            Command::RoutingTableSize { response } => {
                let size = self.routing_table_size();
                let _ = response.send(size);
            }
            Command::PutRecord { key, value, response } => {
                if self.routing_table_size() == 0 {
                    let _ = response.send(Err(DhtError::Network(
                        "no known peers to replicate to".to_string(),
                    )));
                    return true;
                }
                let record = kad::Record::new(kad::RecordKey::new(&key), value);
                match self.swarm.behaviour_mut().kademlia.put_record(record, kad::Quorum::One) {
                    Ok(query_id) => {
                        debug!("Storing record {} (query {:?})", key, query_id);
                        self.pending_puts.insert(query_id, response);
                    }
                    Err(e) => {
                        let _ = response.send(Err(DhtError::Internal(format!(
                            "local store rejected record: {:?}",
                            e
                        ))));
                    }
                }
            }
            Command::GetRecord { key, response } => {
                let record_key = kad::RecordKey::new(&key);
                if self.routing_table_size() == 0 {
                    let local = self
                        .swarm
                        .behaviour_mut()
                        .kademlia
                        .store_mut()
                        .get(&record_key)
                        .map(|r| r.value.clone());
                    let _ = match local {
                        Some(value) => response.send(Ok(Some(value))),
                        None => response.send(Err(DhtError::Network(
                            "routing table is empty".to_string(),
                        ))),
                    };
                    return true;
                }
                let query_id = self.swarm.behaviour_mut().kademlia.get_record(record_key);
                debug!("Looking up record {} (query {:?})", key, query_id);
                self.pending_gets.insert(query_id, response);
            }
            Command::Shutdown { response } => {
                info!("DHT node shutting down");
                let _ = response.send(());
                return false;
            }
        }
        true
    }

    fn bootstrap(&mut self) -> error::Result<()> {
        let mut dialed = 0;
        for addr in self.bootstrap_nodes.clone() {
            if let Some(peer) = peer_of(&addr) {
                self.swarm.behaviour_mut().kademlia.add_address(&peer, addr.clone());
            }
            match self.swarm.dial(addr.clone()) {
                Ok(()) => dialed += 1,
                Err(e) => warn!("Failed to dial bootstrap node {}: {}", addr, e),
            }
        }
        if !self.bootstrap_nodes.is_empty() && dialed == 0 {
            return Err(DhtError::Bootstrap("no bootstrap node could be dialed".to_string()));
        }

        match self.swarm.behaviour_mut().kademlia.bootstrap() {
            Ok(query_id) => debug!("Bootstrap query started: {:?}", query_id),
            Err(_) => debug!("No known peers yet, bootstrap deferred to routing updates"),
        }
        Ok(())
    }

    fn handle_event(&mut self, event: SwarmEvent<KadKvBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                if !self.listen_addrs.contains(&address) {
                    self.listen_addrs.push(address);
                }
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.retain(|a| a != &address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, endpoint, .. } => {
                debug!("Connected to peer {} via {:?}", peer_id, endpoint);
                for response in self.pending_dials.remove(&peer_id).unwrap_or_default() {
                    let _ = response.send(Ok(()));
                }
            }
            SwarmEvent::OutgoingConnectionError { peer_id: Some(peer), error, .. } => {
                warn!("Failed to connect to {}: {}", peer, error);
                if self.swarm.is_connected(&peer) {
                    return;
                }
                for response in self.pending_dials.remove(&peer).unwrap_or_default() {
                    let _ = response.send(Err(DhtError::Connect {
                        peer,
                        reason: error.to_string(),
                    }));
                }
            }
            SwarmEvent::ConnectionClosed { peer_id, cause, .. } => {
                debug!("Disconnected from peer {}: {:?}", peer_id, cause);
            }
            SwarmEvent::Behaviour(KadKvBehaviourEvent::Identify(event)) => {
                self.handle_identify_event(event);
            }
            SwarmEvent::Behaviour(KadKvBehaviourEvent::Kademlia(event)) => {
                self.handle_kademlia_event(event);
            }
            _ => {}
        }
    }

    fn handle_identify_event(&mut self, event: identify::Event) {
        if let identify::Event::Received { peer_id, info, .. } = event {
            if !info.protocols.contains(&self.protocol) {
                debug!("Peer {} does not serve {}", peer_id, self.protocol);
                return;
            }
            for addr in info.listen_addrs {
                self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
            }
        }
    }

    fn handle_kademlia_event(&mut self, event: kad::Event) {
        match event {
            kad::Event::OutboundQueryProgressed { id, result, .. } => match result {
                kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FoundRecord(peer_record))) => {
                    if let Some(response) = self.pending_gets.remove(&id) {
                        debug!(
                            "Found record {} ({} bytes)",
                            hex::encode(peer_record.record.key.as_ref()),
                            peer_record.record.value.len()
                        );
                        let _ = response.send(Ok(Some(peer_record.record.value)));
                    }
                    if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                        query.finish();
                    }
                }
                kad::QueryResult::GetRecord(Ok(kad::GetRecordOk::FinishedWithNoAdditionalRecord {
                    ..
                })) => {
                    if let Some(response) = self.pending_gets.remove(&id) {
                        let _ = response.send(Ok(None));
                    }
                }
                kad::QueryResult::GetRecord(Err(kad::GetRecordError::NotFound { key, .. })) => {
                    debug!("Record {} not found", hex::encode(key.as_ref()));
                    if let Some(response) = self.pending_gets.remove(&id) {
                        let _ = response.send(Ok(None));
                    }
                }
                kad::QueryResult::GetRecord(Err(err)) => {
                    debug!("Failed to get record: {:?}", err);
                    if let Some(response) = self.pending_gets.remove(&id) {
                        let _ = response.send(Err(DhtError::Network(err.to_string())));
                    }
                }
                kad::QueryResult::PutRecord(Ok(_)) => {
                    debug!("Successfully stored record in DHT");
                    if let Some(response) = self.pending_puts.remove(&id) {
                        let _ = response.send(Ok(()));
                    }
                }
                kad::QueryResult::PutRecord(Err(err)) => {
                    warn!("Failed to store record: {:?}", err);
                    if let Some(response) = self.pending_puts.remove(&id) {
                        let _ = response.send(Err(DhtError::Network(err.to_string())));
                    }
                }
                kad::QueryResult::Bootstrap(Ok(ok)) => {
                    debug!("Bootstrap step done, {} remaining", ok.num_remaining);
                }
                kad::QueryResult::Bootstrap(Err(err)) => {
                    warn!("Bootstrap failed: {:?}", err);
                }
                _ => {}
            },
            kad::Event::RoutingUpdated { peer, is_new_peer, .. } => {
                if is_new_peer {
                    info!("Routing table gained peer {}", peer);
                }
            }
            kad::Event::UnroutablePeer { peer } => {
                debug!("Peer {} connected without a routable address", peer);
            }
            _ => {}
        }
    }

    /// Finish queries whose requester has gone away, e.g. after a fetch deadline
    fn prune_abandoned(&mut self) {
        let abandoned: Vec<kad::QueryId> = self
            .pending_gets
            .iter()
            .filter(|(_, tx)| tx.is_closed())
            .map(|(id, _)| *id)
            .chain(
                self.pending_puts
                    .iter()
                    .filter(|(_, tx)| tx.is_closed())
                    .map(|(id, _)| *id),
            )
            .collect();

        for id in abandoned {
            debug!("Finishing abandoned query {:?}", id);
            self.pending_gets.remove(&id);
            self.pending_puts.remove(&id);
            if let Some(mut query) = self.swarm.behaviour_mut().kademlia.query_mut(&id) {
                query.finish();
            }
        }

        self.pending_dials.retain(|_, waiters| {
            waiters.retain(|tx| !tx.is_closed());
            !waiters.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bad_protocol_name_is_rejected_before_binding() {
        let mut config = DhtConfig::default();
        config.protocol_name = "kad".to_string();

        let result = SwarmSubstrate::spawn(&config, &Span::none()).await;
        assert!(matches!(result, Err(DhtError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_no_listen_address_is_transport_error() {
        let mut config = DhtConfig::default();
        config.listen_addresses.clear();

        let result = SwarmSubstrate::spawn(&config, &Span::none()).await;
        assert!(matches!(result, Err(DhtError::Transport(_))));
    }

    #[tokio::test]
    #[ignore = "binds a local TCP port"]
    async fn test_spawn_binds_ephemeral_port() {
        let substrate = SwarmSubstrate::spawn(&DhtConfig::default(), &Span::none())
            .await
            .unwrap();

        let addrs = substrate.listen_addrs().await.unwrap();
        assert!(!addrs.is_empty());
        assert!(!addrs[0].to_string().ends_with("/tcp/0"));
        assert_eq!(substrate.routing_table_size().await.unwrap(), 0);

        substrate.shutdown().await.unwrap();
        substrate.shutdown().await.unwrap();
        assert!(matches!(substrate.routing_table_size().await, Err(DhtError::Closed)));
    }
}
