//! The building blocks of a structured peer-to-peer overlay over TCP.
//!
//! Nodes sit on a small identifier ring. A registry admits them, hands each
//! one a finger table, and drives an experiment in which every node sends
//! data packets to random destinations. Packets are forwarded greedily, one
//! hop at a time, using only the forwarding node's own finger table.
//!
//! # Organization
//! - [`NodeId`] and [`PeerAddress`] name nodes on the ring and on the network
//! - [`wire`] defines the framed [`Message`]s exchanged between processes
//! - [`transport`] provides the [`Connection`]s that carry them, a
//!   [`ConnectionCache`] and the accept loop
//! - [`routing`] holds the [`RoutingTable`] and the greedy forwarding rule
//!
//! The registry and overlay node applications that use these live in the
//! `overlay` crate.

use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;

pub mod logging;
pub mod utility;

pub mod id;
pub use id::{NodeId, RING_SIZE};

pub mod address;
pub use address::PeerAddress;

pub mod wire;
pub use wire::Message;

pub mod routing;
pub use routing::{RoutingEntry, RoutingTable};

pub mod transport;
pub use transport::{Connection, ConnectionCache, Handler, SharedConnection};

mod shutdown;
pub use shutdown::Shutdown;

pub(crate) type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<FxHasher>>;
