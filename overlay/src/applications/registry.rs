//! The registry admits overlay nodes, lays out their finger tables, and runs
//! traffic experiments over the resulting overlay.
//!
//! A run goes through the phases of [`ExperimentPhase`]. `setup-overlay`
//! sends every node its manifest and waits for each to report that it reached
//! its fingers. `start` then has every node originate packets. Once all nodes
//! report they are finished, the registry waits for the quiescence delay so
//! relayed packets can land, and then collects a traffic summary from each
//! node.
//!
//! A run only waits on the nodes it actually reached. If a node of the overlay
//! leaves or drops its connection, the overlay is abandoned and the registry
//! goes back to [`ExperimentPhase::Idle`] until the next `setup-overlay`.

mod membership;
pub use membership::{Membership, ValidationError};

mod statistics;
pub use statistics::{StatisticsCollector, Totals, TrafficReport};

use crate::config::RegistryConfig;
use overlay_core::{
    logging::{coordinator_event, registration_event},
    routing::{build_finger_tables, OverlayError},
    transport::serve,
    wire::{TrafficSummary, FAILURE_STATUS, MAX_COUNT},
    ConnectionCache, Handler, Message, NodeId, PeerAddress, RoutingTable, SharedConnection,
    Shutdown, RING_SIZE,
};
use rand::{rngs::SmallRng, SeedableRng};
use std::{
    fmt::{self, Display, Formatter, Write},
    io,
    net::SocketAddr,
    sync::{Arc, Mutex},
};
use thiserror::Error as ThisError;
use tokio::{
    net::TcpListener,
    sync::{broadcast, watch},
};

/// Where the registry is in the life of an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExperimentPhase {
    /// No overlay has been set up yet.
    Idle,
    /// Manifests are out; waiting for every node to report its setup.
    AwaitingSetup,
    /// Every node reached its fingers. A run may start.
    Ready,
    /// Nodes are originating packets.
    Running,
    /// Every node finished sending; waiting out the quiescence delay.
    Draining,
    /// Traffic summaries have been requested.
    Collecting,
}

impl ExperimentPhase {
    fn is_running(self) -> bool {
        matches!(
            self,
            ExperimentPhase::Running | ExperimentPhase::Draining | ExperimentPhase::Collecting
        )
    }
}

impl Display for ExperimentPhase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct Registry {
    config: RegistryConfig,
    /// The address the accept loop is bound to
    local_addr: SocketAddr,
    state: Mutex<RegistryState>,
    /// Connections to registered nodes, keyed by their advertised address
    connections: ConnectionCache,
    phase: watch::Sender<ExperimentPhase>,
    reports: broadcast::Sender<TrafficReport>,
    shutdown: Shutdown,
}

struct RegistryState {
    membership: Membership,
    rng: SmallRng,
    phase: ExperimentPhase,
    /// The overlay built by the last `setup-overlay`
    overlay: Option<Overlay>,
    progress: Progress,
    statistics: StatisticsCollector,
}

struct Overlay {
    tables: Vec<(NodeId, RoutingTable)>,
    participants: Vec<PeerAddress>,
}

#[derive(Debug, Default)]
struct Progress {
    expected: usize,
    established: usize,
    failed: usize,
    finished: usize,
}

impl Registry {
    /// Binds the listening socket and starts accepting nodes.
    pub async fn listen(config: RegistryConfig) -> Result<Arc<Self>, RegistryError> {
        if config.ring_size == 0 || config.ring_size > RING_SIZE {
            Err(RegistryError::InvalidRingSize(config.ring_size))?
        }
        let listener = TcpListener::bind((config.listen_host.as_str(), config.port))
            .await
            .map_err(|source| RegistryError::Bind {
                host: config.listen_host.clone(),
                port: config.port,
                source,
            })?;
        let local_addr = listener.local_addr()?;

        let (phase, _) = watch::channel(ExperimentPhase::Idle);
        let (reports, _) = broadcast::channel(8);
        let registry = Arc::new(Self {
            state: Mutex::new(RegistryState {
                membership: Membership::new(config.ring_size),
                rng: SmallRng::from_entropy(),
                phase: ExperimentPhase::Idle,
                overlay: None,
                progress: Progress::default(),
                statistics: StatisticsCollector::new(),
            }),
            config,
            local_addr,
            connections: ConnectionCache::new(),
            phase,
            reports,
            shutdown: Shutdown::new(),
        });

        tokio::spawn(serve(
            listener,
            registry.clone(),
            registry.config.max_frame_length,
            registry.shutdown.clone(),
        ));
        coordinator_event(ExperimentPhase::Idle, &format!("listening on {local_addr}"));
        Ok(registry)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn phase(&self) -> ExperimentPhase {
        self.state.lock().unwrap().phase
    }

    /// Watches the experiment phase.
    pub fn subscribe_phase(&self) -> watch::Receiver<ExperimentPhase> {
        self.phase.subscribe()
    }

    /// Receives the report of every run completed after subscribing.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<TrafficReport> {
        self.reports.subscribe()
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().unwrap().membership.len()
    }

    /// Stops accepting new nodes.
    pub fn shut_down(&self) {
        self.shutdown.shut_down();
    }

    /// One line per registered node, `ID, host, port`, in ID order.
    pub fn list_messaging_nodes(&self) -> String {
        let state = self.state.lock().unwrap();
        if state.membership.is_empty() {
            return "There are no registered messaging nodes".into();
        }
        let mut out = String::new();
        for (id, address) in state.membership.iter() {
            let _ = writeln!(out, "{}, {}, {}", id, address.host, address.port);
        }
        out
    }

    /// Every node's table from the last `setup-overlay`, in hop order.
    pub fn list_routing_tables(&self) -> String {
        let state = self.state.lock().unwrap();
        let Some(overlay) = state.overlay.as_ref() else {
            return "No overlay has been set up".into();
        };
        let mut out = String::new();
        for ((id, table), address) in overlay.tables.iter().zip(overlay.participants.iter()) {
            let _ = writeln!(out, "Routing table for node {id} ({address}):");
            if table.is_empty() {
                let _ = writeln!(out, "  (empty)");
            }
            for entry in table.entries() {
                let _ = writeln!(out, "  {:>3}: {}", entry.id, entry.address);
            }
        }
        out
    }

    /// Builds a finger table of `size` entries (or the configured default)
    /// for every registered node and sends each node its manifest. Returns
    /// the number of nodes in the overlay.
    pub fn setup_overlay(&self, size: Option<usize>) -> Result<usize, CommandError> {
        let size = size.unwrap_or(self.config.default_table_size);
        let mut state = self.state.lock().unwrap();
        if state.phase.is_running() {
            Err(CommandError::RunInProgress(state.phase))?
        }

        let members = state.membership.entries();
        let tables = build_finger_tables(&members, size)?;
        let node_ids: Vec<NodeId> = members.iter().map(|member| member.id).collect();
        for (member, (_, table)) in members.iter().zip(tables.iter()) {
            self.send(
                &member.address,
                Message::NodeManifest {
                    routing_table: table.clone(),
                    node_ids: node_ids.clone(),
                },
            );
        }

        let nodes = members.len();
        state.overlay = Some(Overlay {
            tables,
            participants: members.into_iter().map(|member| member.address).collect(),
        });
        state.progress = Progress {
            expected: nodes,
            ..Default::default()
        };
        self.set_phase(&mut state, ExperimentPhase::AwaitingSetup);
        Ok(nodes)
    }

    /// Has every node in the overlay originate `count` packets. Returns the
    /// number of nodes told to start.
    pub fn start(&self, count: u32) -> Result<usize, CommandError> {
        if count > MAX_COUNT {
            Err(CommandError::CountTooLarge(count))?
        }
        let mut state = self.state.lock().unwrap();
        match state.phase {
            ExperimentPhase::Ready => {}
            ExperimentPhase::Idle => Err(CommandError::NotSetUp)?,
            ExperimentPhase::AwaitingSetup => Err(CommandError::SetupIncomplete {
                established: state.progress.established,
                failed: state.progress.failed,
                expected: state.progress.expected,
            })?,
            phase => Err(CommandError::RunInProgress(phase))?,
        }

        let nodes = self.broadcast(&state, Message::TaskInitiate { count });
        if nodes == 0 {
            Err(CommandError::NoNodesReached)?
        }
        state.progress.expected = nodes;
        state.progress.finished = 0;
        state.statistics.clear();
        self.set_phase(&mut state, ExperimentPhase::Running);
        Ok(nodes)
    }

    fn register(self: &Arc<Self>, address: PeerAddress, connection: SharedConnection) {
        let observed = connection.peer_addr().ip();
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let result = state
            .membership
            .register(address.clone(), observed, &mut state.rng);

        let (status, info) = match &result {
            Ok(id) => {
                self.connections.put(address.clone(), connection.clone());
                self.watch_connection(address.clone(), connection.clone());
                (
                    id.as_status(),
                    format!(
                        "Registration request successful. The number of messaging nodes \
                         currently constituting the overlay is ({})",
                        state.membership.len()
                    ),
                )
            }
            Err(e) => (FAILURE_STATUS, format!("Registration request failed: {e}")),
        };
        drop(guard);

        let id = result.as_ref().ok().copied();
        registration_event("register", id, &address, result.is_ok(), &info);
        if self.config.output {
            match result {
                Ok(id) => println!("Registered node from {address}, ID is {id}"),
                Err(e) => println!("Refused registration from {address}: {e}"),
            }
        }
        if let Err(e) = connection.enqueue(Message::RegistrationStatus { status, info }) {
            tracing::warn!(target: "REGISTRY", error = %e, "could not answer registration");
        }
    }

    fn deregister(&self, address: PeerAddress, id: NodeId, connection: SharedConnection) {
        let observed = connection.peer_addr().ip();
        let mut state = self.state.lock().unwrap();
        let result = state.membership.deregister(&address, id, observed);

        let (status, info) = match &result {
            Ok(_) => {
                // the reply still goes out on the connection we were handed
                self.connections.remove(&address);
                self.abandon_overlay(&mut state, &address, "left the overlay");
                (
                    id.as_status(),
                    format!(
                        "Deregistration request successful. The number of messaging nodes \
                         currently constituting the overlay is ({})",
                        state.membership.len()
                    ),
                )
            }
            Err(e) => (FAILURE_STATUS, format!("Deregistration request failed: {e}")),
        };
        drop(state);

        registration_event("deregister", Some(id), &address, result.is_ok(), &info);
        if self.config.output {
            match result {
                Ok(_) => println!("Deregistered node {id} at {address}"),
                Err(e) => println!("Refused deregistration from {address}: {e}"),
            }
        }
        if let Err(e) = connection.enqueue(Message::DeregistrationStatus { status, info }) {
            tracing::warn!(target: "REGISTRY", error = %e, "could not answer deregistration");
        }
    }

    /// Forgets a registered node once its connection closes without it
    /// deregistering first.
    fn watch_connection(self: &Arc<Self>, address: PeerAddress, connection: SharedConnection) {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            connection.closed().await;
            if let Some(registry) = registry.upgrade() {
                registry.connection_lost(&address, &connection);
            }
        });
    }

    fn connection_lost(&self, address: &PeerAddress, connection: &SharedConnection) {
        let mut state = self.state.lock().unwrap();
        // the node may have deregistered, or registered again on a new connection
        let current = self
            .connections
            .get(address)
            .map_or(false, |cached| Arc::ptr_eq(&cached, connection));
        if !current {
            return;
        }
        self.connections.remove(address);
        let id = state.membership.remove_address(address);
        registration_event(
            "disconnect",
            id,
            address,
            true,
            "connection closed without deregistering",
        );
        if self.config.output {
            println!("Lost the connection to the node at {address}");
        }
        self.abandon_overlay(&mut state, address, "disconnected");
    }

    /// Drops the current overlay if the node at `address` is part of it. Any
    /// run in progress is abandoned with it.
    fn abandon_overlay(&self, state: &mut RegistryState, address: &PeerAddress, reason: &str) {
        let participant = state
            .overlay
            .as_ref()
            .map_or(false, |overlay| overlay.participants.contains(address));
        if !participant {
            return;
        }
        tracing::warn!(
            target: "REGISTRY",
            %address,
            phase = %state.phase,
            reason,
            "overlay abandoned"
        );
        if self.config.output {
            println!("The node at {address} {reason}; run setup-overlay again");
        }
        state.overlay = None;
        state.progress = Progress::default();
        state.statistics.clear();
        self.set_phase(state, ExperimentPhase::Idle);
    }

    fn setup_reported(&self, status: i32, info: String, connection: SharedConnection) {
        let mut state = self.state.lock().unwrap();
        if state.phase != ExperimentPhase::AwaitingSetup {
            tracing::warn!(
                target: "REGISTRY",
                phase = %state.phase,
                status,
                "ignoring setup status outside of setup"
            );
            return;
        }

        if status < 0 {
            state.progress.failed += 1;
            tracing::warn!(
                target: "REGISTRY",
                peer = %connection.peer_addr(),
                info = %info,
                "node failed to set up its connections"
            );
            if self.config.output {
                println!("A node at {} failed to set up: {}", connection.peer_addr(), info);
            }
            return;
        }

        state.progress.established += 1;
        let progress = &state.progress;
        if progress.established == progress.expected && progress.failed == 0 {
            self.set_phase(&mut state, ExperimentPhase::Ready);
            if self.config.output {
                println!("Registry now ready to initiate tasks");
            }
        }
    }

    fn task_finished(self: Arc<Self>, address: PeerAddress, id: NodeId) {
        let mut state = self.state.lock().unwrap();
        if state.phase != ExperimentPhase::Running {
            tracing::warn!(
                target: "REGISTRY",
                %address,
                id = id.into_inner(),
                "unexpected task finished"
            );
            return;
        }
        state.progress.finished += 1;
        if state.progress.finished < state.progress.expected {
            return;
        }

        self.set_phase(&mut state, ExperimentPhase::Draining);
        drop(state);
        let delay = self.config.quiescence_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.request_traffic_summaries();
        });
    }

    fn request_traffic_summaries(&self) {
        let mut state = self.state.lock().unwrap();
        if state.phase != ExperimentPhase::Draining {
            return;
        }
        state.statistics.clear();
        let nodes = self.broadcast(&state, Message::TrafficSummaryRequest);
        if nodes == 0 {
            tracing::warn!(target: "REGISTRY", "no node could be asked for a traffic summary");
            self.set_phase(&mut state, ExperimentPhase::Ready);
            return;
        }
        state.progress.expected = nodes;
        self.set_phase(&mut state, ExperimentPhase::Collecting);
    }

    fn traffic_summary(&self, summary: TrafficSummary) {
        let mut state = self.state.lock().unwrap();
        if state.phase != ExperimentPhase::Collecting {
            tracing::warn!(
                target: "REGISTRY",
                id = summary.id.into_inner(),
                "unexpected traffic summary"
            );
            return;
        }
        state.statistics.add(summary);
        if state.statistics.len() < state.progress.expected {
            return;
        }

        let report = state.statistics.take_report();
        self.set_phase(&mut state, ExperimentPhase::Ready);
        drop(state);

        if self.config.output {
            println!("{report}");
        }
        // nobody may be listening, which is fine
        let _ = self.reports.send(report);
    }

    /// Sends `message` to every node in the current overlay. Returns how many
    /// nodes it was queued for.
    fn broadcast(&self, state: &RegistryState, message: Message) -> usize {
        let Some(overlay) = state.overlay.as_ref() else {
            return 0;
        };
        overlay
            .participants
            .iter()
            .filter(|address| self.send(address, message.clone()))
            .count()
    }

    fn send(&self, address: &PeerAddress, message: Message) -> bool {
        let kind = message.kind();
        let result = match self.connections.get(address) {
            Some(connection) => connection.enqueue(message).map_err(|e| e.to_string()),
            None => Err("no connection".to_string()),
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(target: "REGISTRY", %address, %kind, error = %e, "could not send");
                false
            }
        }
    }

    fn set_phase(&self, state: &mut RegistryState, phase: ExperimentPhase) {
        state.phase = phase;
        self.phase.send_replace(phase);
        let progress = &state.progress;
        coordinator_event(
            phase,
            &format!(
                "expected {}, established {}, failed {}, finished {}",
                progress.expected, progress.established, progress.failed, progress.finished
            ),
        );
    }
}

#[async_trait::async_trait]
impl Handler for Registry {
    async fn on_message(self: Arc<Self>, message: Message, connection: SharedConnection) {
        match message {
            Message::NodeRegisters { address } => self.register(address, connection),
            Message::NodeDeregisters { address, id } => self.deregister(address, id, connection),
            Message::OverlaySetupStatus { status, info } => {
                self.setup_reported(status, info, connection)
            }
            Message::TaskFinished { address, id } => self.task_finished(address, id),
            Message::TrafficSummaryReport(summary) => self.traffic_summary(summary),
            other => tracing::warn!(
                target: "REGISTRY",
                kind = %other.kind(),
                peer = %connection.peer_addr(),
                "unexpected message"
            ),
        }
    }
}

/// A console command the registry refused.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("The overlay has not been set up; run setup-overlay first")]
    NotSetUp,
    #[error(
        "Setup is not complete: {established} of {expected} nodes established their \
         connections, {failed} failed"
    )]
    SetupIncomplete {
        established: usize,
        failed: usize,
        expected: usize,
    },
    #[error("A run is still in progress ({0})")]
    RunInProgress(ExperimentPhase),
    #[error("Could not build the overlay: {0}")]
    Overlay(#[from] OverlayError),
    #[error("At most {MAX_COUNT} packets may be sent per node, not {0}")]
    CountTooLarge(u32),
    #[error("None of the nodes in the overlay could be reached")]
    NoNodesReached,
}

#[derive(Debug, ThisError)]
pub enum RegistryError {
    #[error("The ring size must be between 1 and {RING_SIZE}, not {0}")]
    InvalidRingSize(u32),
    #[error("Could not listen on {host}:{port}: {source}")]
    Bind {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> RegistryConfig {
        RegistryConfig::new()
            .listen_host("127.0.0.1")
            .port(0)
            .output(false)
            .quiescence_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn commands_need_an_overlay() {
        let registry = Registry::listen(config()).await.unwrap();
        assert_eq!(registry.phase(), ExperimentPhase::Idle);
        assert_eq!(registry.start(5), Err(CommandError::NotSetUp));
        assert_eq!(
            registry.setup_overlay(None),
            Err(CommandError::Overlay(OverlayError::NoNodes))
        );
        assert_eq!(
            registry.list_messaging_nodes(),
            "There are no registered messaging nodes"
        );
        assert_eq!(registry.list_routing_tables(), "No overlay has been set up");
        assert_eq!(
            registry.start(MAX_COUNT + 1),
            Err(CommandError::CountTooLarge(MAX_COUNT + 1))
        );
        assert_eq!(
            registry.setup_overlay(Some(usize::MAX)),
            Err(CommandError::Overlay(OverlayError::NoNodes))
        );
        registry.shut_down();
    }

    #[tokio::test]
    async fn rejects_ring_sizes_off_the_ring() {
        let result = Registry::listen(config().ring_size(RING_SIZE + 1)).await;
        assert!(matches!(result, Err(RegistryError::InvalidRingSize(129))));
    }
}
