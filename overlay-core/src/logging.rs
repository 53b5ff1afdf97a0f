//! Logging holds wrapper functions for logging events.
//! Each function corresponds to a type of logging (registrations, connections,
//! packets, ...) and writes under a fixed target so a log file can be filtered
//! by concern. The subscriber itself is installed by the binary.

use crate::{NodeId, PeerAddress};
use std::{fmt::Display, net::SocketAddr};
use tracing::{event, Level};

/// Registration and deregistration outcomes as seen by the registry.
/// Captures the following data: action, id, address, accepted, info
pub fn registration_event(
    action: &str,
    id: Option<NodeId>,
    address: &PeerAddress,
    accepted: bool,
    info: &str,
) {
    event!(
        target: "REGISTRY",
        Level::INFO,
        action = action,
        id = id.map(|id| id.into_inner()),
        address = %address,
        accepted = accepted,
        info = info
    );
}

/// Experiment phase transitions and orchestration steps of the registry.
pub fn coordinator_event(phase: impl Display, message: &str) {
    event!(target: "REGISTRY", Level::INFO, phase = %phase, message = message);
}

/// State changes of an overlay node.
/// Captures the following data: id, state, message
pub fn node_event(id: Option<NodeId>, state: impl Display, message: &str) {
    event!(
        target: "NODE",
        Level::INFO,
        id = id.map(|id| id.into_inner()),
        state = %state,
        message = message
    );
}

/// A connection was opened or torn down.
/// Captures the following data: local, peer, state
pub fn connection_event(local: SocketAddr, peer: SocketAddr, state: &str) {
    event!(target: "CONNECTION", Level::INFO, local = %local, peer = %peer, state = state);
}

/// A connection failed. The connection is closed afterwards.
pub fn connection_error_event(peer: SocketAddr, error: &dyn Display) {
    event!(target: "CONNECTION", Level::WARN, peer = %peer, error = %error);
}

/// A data packet was originated, relayed, delivered, or dropped by `node`.
/// Captures the following data: node, action, src, dst, payload, hops
pub fn packet_event(
    node: NodeId,
    action: &str,
    src: NodeId,
    dst: NodeId,
    payload: i32,
    hops: usize,
) {
    event!(
        target: "PACKET",
        Level::DEBUG,
        node = node.into_inner(),
        action = action,
        src = src.into_inner(),
        dst = dst.into_inner(),
        payload = payload,
        hops = hops
    );
}
