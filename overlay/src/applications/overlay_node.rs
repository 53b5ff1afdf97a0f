//! An overlay node joins through the registry, connects to the fingers in the
//! manifest it is sent, and then originates and relays data packets.
//!
//! The node never learns the full topology. Every packet it handles is either
//! for itself, or is handed to one of its fingers according to
//! [`RoutingTable::next_hop`].

mod counters;
pub use counters::{CounterSnapshot, Counters};

use crate::config::NodeConfig;
use futures::future::join_all;
use itertools::Itertools;
use overlay_core::{
    logging::{node_event, packet_event},
    transport::{connect, serve, StreamError},
    wire::FAILURE_STATUS,
    Connection, ConnectionCache, Handler, Message, NodeId, PeerAddress, RoutingTable,
    SharedConnection, Shutdown,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    fmt::{self, Display, Formatter, Write},
    io,
    sync::{Arc, RwLock},
};
use thiserror::Error as ThisError;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};

/// Where a node is in joining the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Unregistered,
    Registered,
    ManifestReceived,
    ConnectionsEstablished,
    ConnectionsFailed,
    /// The setup outcome has been sent to the registry.
    SetupReported { established: bool },
}

impl Display for NodeState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct OverlayNode {
    config: NodeConfig,
    /// The address advertised to the registry and to other nodes
    address: PeerAddress,
    /// Connections to the registry and to this node's fingers
    connections: ConnectionCache,
    topology: RwLock<Topology>,
    counters: Counters,
    state: watch::Sender<NodeState>,
    shutdown: Shutdown,
}

#[derive(Debug, Default)]
struct Topology {
    id: Option<NodeId>,
    routing_table: RoutingTable,
    /// Every ID in the overlay, this node's included
    node_ids: Vec<NodeId>,
}

impl OverlayNode {
    /// Starts listening for peers on an ephemeral port, connects to the
    /// registry, and asks to register.
    pub async fn join(config: NodeConfig) -> Result<Arc<Self>, NodeError> {
        let listener = TcpListener::bind((config.listen_host.as_str(), 0))
            .await
            .map_err(NodeError::Bind)?;
        let stream = TcpStream::connect((config.registry.host.as_str(), config.registry.port))
            .await
            .map_err(|source| NodeError::RegistryUnreachable {
                address: config.registry.clone(),
                source,
            })?;
        // advertise the interface the registry sees us on
        let address = PeerAddress::new(
            stream.local_addr()?.ip().to_string(),
            listener.local_addr()?.port(),
        );

        let (state, _) = watch::channel(NodeState::Unregistered);
        let node = Arc::new(Self {
            config,
            address,
            connections: ConnectionCache::new(),
            topology: Default::default(),
            counters: Counters::new(),
            state,
            shutdown: Shutdown::new(),
        });

        let max_frame_length = node.config.max_frame_length;
        let registry = Connection::spawn(stream, node.clone(), max_frame_length)?;
        node.connections
            .put(node.config.registry.clone(), registry.clone());
        tokio::spawn(serve(
            listener,
            node.clone(),
            max_frame_length,
            node.shutdown.clone(),
        ));

        registry.enqueue(Message::NodeRegisters {
            address: node.address.clone(),
        })?;
        node_event(None, NodeState::Unregistered, "registration requested");
        Ok(node)
    }

    pub fn id(&self) -> Option<NodeId> {
        self.topology.read().unwrap().id
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn state(&self) -> NodeState {
        *self.state.borrow()
    }

    /// Watches the node's setup state.
    pub fn subscribe_state(&self) -> watch::Receiver<NodeState> {
        self.state.subscribe()
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn routing_table(&self) -> RoutingTable {
        self.topology.read().unwrap().routing_table.clone()
    }

    /// Stops accepting peers.
    pub fn shut_down(&self) {
        self.shutdown.shut_down();
    }

    /// Asks the registry to remove this node. The node returns to
    /// [`NodeState::Unregistered`] once the registry agrees.
    pub fn exit_overlay(&self) -> Result<(), NodeError> {
        let id = self.id().ok_or(NodeError::NotRegistered)?;
        let registry = self.registry().ok_or(NodeError::RegistryDisconnected)?;
        registry.enqueue(Message::NodeDeregisters {
            address: self.address.clone(),
            id,
        })?;
        node_event(Some(id), self.state(), "deregistration requested");
        Ok(())
    }

    /// The counters, setup state, and routing table, for the console.
    pub fn diagnostics(&self) -> String {
        let topology = self.topology.read().unwrap();
        let mut out = String::new();
        let _ = match topology.id {
            Some(id) => writeln!(out, "Node {} at {}", id, self.address),
            None => writeln!(out, "Unregistered node at {}", self.address),
        };
        let _ = writeln!(out, "State: {}", self.state());
        let _ = writeln!(out, "{}", self.counters.snapshot());
        let _ = writeln!(out, "Known nodes: {}", topology.node_ids.len());
        let _ = writeln!(out, "Routing table:");
        if topology.routing_table.is_empty() {
            let _ = writeln!(out, "  (empty)");
        }
        for entry in topology.routing_table.entries() {
            let _ = writeln!(out, "  {:>3}: {}", entry.id, entry.address);
        }
        out
    }

    fn registry(&self) -> Option<SharedConnection> {
        self.connections.get_live(&self.config.registry)
    }

    fn send_to_registry(&self, message: Message) {
        let kind = message.kind();
        let result = match self.registry() {
            Some(registry) => registry.enqueue(message),
            None => Err(StreamError::Closed),
        };
        if let Err(e) = result {
            tracing::warn!(target: "NODE", %kind, error = %e, "could not reach the registry");
        }
    }

    fn set_state(&self, state: NodeState, message: &str) {
        self.state.send_replace(state);
        node_event(self.id(), state, message);
    }

    fn registration_status(&self, status: i32, info: String) {
        if status < 0 {
            if self.config.output {
                println!("{info}");
            }
            node_event(None, NodeState::Unregistered, &info);
            return;
        }
        match NodeId::try_from(status) {
            Ok(id) => {
                self.topology.write().unwrap().id = Some(id);
                if self.config.output {
                    println!("{info}");
                }
                self.set_state(NodeState::Registered, &info);
            }
            Err(e) => tracing::warn!(target: "NODE", error = %e, "registry assigned a bad ID"),
        }
    }

    fn deregistration_status(&self, status: i32, info: String) {
        if self.config.output {
            println!("{info}");
        }
        if status < 0 {
            node_event(self.id(), self.state(), &info);
            return;
        }
        *self.topology.write().unwrap() = Topology::default();
        if let Some(registry) = self.connections.remove(&self.config.registry) {
            registry.close();
        }
        self.set_state(NodeState::Unregistered, &info);
    }

    async fn manifest(self: Arc<Self>, routing_table: RoutingTable, node_ids: Vec<NodeId>) {
        let fingers: Vec<PeerAddress> = routing_table
            .entries()
            .iter()
            .map(|entry| entry.address.clone())
            .unique()
            .collect();
        let id = {
            let mut topology = self.topology.write().unwrap();
            topology.routing_table = routing_table;
            topology.node_ids = node_ids;
            topology.id
        };
        self.set_state(NodeState::ManifestReceived, "manifest received");

        let dials = fingers
            .iter()
            .filter(|address| self.connections.get_live(address).is_none())
            .map(|address| {
                let node = self.clone();
                async move {
                    let max_frame_length = node.config.max_frame_length;
                    (address, connect(address, node, max_frame_length).await)
                }
            });
        let mut failures = Vec::new();
        for (address, result) in join_all(dials).await {
            match result {
                Ok(connection) => {
                    self.connections.put(address.clone(), connection);
                }
                Err(e) => {
                    tracing::warn!(target: "NODE", %address, error = %e, "could not reach finger");
                    failures.push(e.to_string());
                }
            }
        }

        let (status, info) = match id {
            Some(id) if failures.is_empty() => {
                let info = format!("Node {id} connected to {} fingers", fingers.len());
                self.set_state(NodeState::ConnectionsEstablished, &info);
                (id.as_status(), info)
            }
            Some(_) => {
                let info = format!("Could not connect to every finger: {}", failures.join("; "));
                self.set_state(NodeState::ConnectionsFailed, &info);
                (FAILURE_STATUS, info)
            }
            None => {
                let info = "Received a manifest before registering".to_string();
                self.set_state(NodeState::ConnectionsFailed, &info);
                (FAILURE_STATUS, info)
            }
        };
        self.send_to_registry(Message::OverlaySetupStatus { status, info });
        let established = status != FAILURE_STATUS;
        self.set_state(NodeState::SetupReported { established }, "setup reported");
    }

    fn initiate_task(&self, count: u32) {
        let (id, others) = {
            let topology = self.topology.read().unwrap();
            let others: Vec<NodeId> = topology
                .node_ids
                .iter()
                .copied()
                .filter(|other| Some(*other) != topology.id)
                .collect();
            (topology.id, others)
        };
        let Some(id) = id else {
            tracing::warn!(target: "NODE", "asked to send before registering");
            return;
        };

        // with nobody else in the overlay there is nowhere to send to
        if !others.is_empty() {
            let mut rng = SmallRng::from_entropy();
            for _ in 0..count {
                let dst = others[rng.gen_range(0..others.len())];
                let payload: i32 = rng.gen();
                self.counters.record_sent(payload);
                packet_event(id, "originated", id, dst, payload, 0);
                self.forward(id, dst, id, payload, Vec::new());
            }
        }

        node_event(Some(id), self.state(), &format!("finished sending {count} packets"));
        self.send_to_registry(Message::TaskFinished {
            address: self.address.clone(),
            id,
        });
    }

    fn data_packet(&self, dst: NodeId, src: NodeId, payload: i32, mut trace: Vec<NodeId>) {
        let Some(me) = self.id() else {
            tracing::warn!(target: "NODE", "dropping a packet received before registering");
            return;
        };
        if dst == me {
            self.counters.record_received(payload);
            packet_event(me, "delivered", src, dst, payload, trace.len());
            return;
        }

        trace.push(me);
        let hops = trace.len();
        if self.forward(me, dst, src, payload, trace) {
            self.counters.record_relayed();
            packet_event(me, "relayed", src, dst, payload, hops);
        }
    }

    /// Hands a packet to the finger chosen by the routing table. Returns
    /// whether it was queued.
    fn forward(
        &self,
        me: NodeId,
        dst: NodeId,
        src: NodeId,
        payload: i32,
        trace: Vec<NodeId>,
    ) -> bool {
        let hops = trace.len();
        let next = self
            .topology
            .read()
            .unwrap()
            .routing_table
            .next_hop(dst)
            .map(|hop| hop.entry().clone());
        let Some(next) = next else {
            tracing::warn!(target: "PACKET", dst = dst.into_inner(), "no route");
            packet_event(me, "dropped", src, dst, payload, hops);
            return false;
        };
        let Some(connection) = self.connections.get_live(&next.address) else {
            tracing::warn!(
                target: "PACKET",
                dst = dst.into_inner(),
                next = %next.address,
                "no connection to the next hop"
            );
            packet_event(me, "dropped", src, dst, payload, hops);
            return false;
        };
        let packet = Message::DataPacket {
            dst,
            src,
            payload,
            trace,
        };
        match connection.enqueue(packet) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(target: "PACKET", next = %next.address, error = %e, "send failed");
                packet_event(me, "dropped", src, dst, payload, hops);
                false
            }
        }
    }

    fn traffic_summary(&self, connection: SharedConnection) {
        let Some(id) = self.id() else {
            tracing::warn!(target: "NODE", "asked for a traffic summary before registering");
            return;
        };
        let summary = self.counters.take().summary(id);
        if let Err(e) = connection.enqueue(Message::TrafficSummaryReport(summary)) {
            tracing::warn!(target: "NODE", error = %e, "could not report traffic summary");
        }
    }
}

#[async_trait::async_trait]
impl Handler for OverlayNode {
    async fn on_message(self: Arc<Self>, message: Message, connection: SharedConnection) {
        match message {
            Message::RegistrationStatus { status, info } => self.registration_status(status, info),
            Message::DeregistrationStatus { status, info } => {
                self.deregistration_status(status, info)
            }
            Message::NodeManifest {
                routing_table,
                node_ids,
            } => self.manifest(routing_table, node_ids).await,
            Message::TaskInitiate { count } => self.initiate_task(count),
            Message::DataPacket {
                dst,
                src,
                payload,
                trace,
            } => self.data_packet(dst, src, payload, trace),
            Message::TrafficSummaryRequest => self.traffic_summary(connection),
            other => tracing::warn!(
                target: "NODE",
                kind = %other.kind(),
                peer = %connection.peer_addr(),
                "unexpected message"
            ),
        }
    }
}

#[derive(Debug, ThisError)]
pub enum NodeError {
    #[error("Could not open a listening socket: {0}")]
    Bind(#[source] io::Error),
    #[error("Could not reach the registry at {address}: {source}")]
    RegistryUnreachable {
        address: PeerAddress,
        #[source]
        source: io::Error,
    },
    #[error("The node is not registered")]
    NotRegistered,
    #[error("The connection to the registry is gone")]
    RegistryDisconnected,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Stream(#[from] StreamError),
}
