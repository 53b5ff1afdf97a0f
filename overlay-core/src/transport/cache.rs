use super::SharedConnection;
use crate::{FxDashMap, PeerAddress};

/// The live connections of one process, keyed by the peer's advertised
/// address.
///
/// Entries are not evicted; they stay until removed, even after the
/// connection underneath has closed. Use [`ConnectionCache::get_live`] to skip
/// dead entries.
#[derive(Debug, Default)]
pub struct ConnectionCache {
    connections: FxDashMap<PeerAddress, SharedConnection>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a mapping, returning the connection it replaced.
    pub fn put(
        &self,
        address: PeerAddress,
        connection: SharedConnection,
    ) -> Option<SharedConnection> {
        self.connections.insert(address, connection)
    }

    pub fn get(&self, address: &PeerAddress) -> Option<SharedConnection> {
        self.connections.get(address).map(|entry| entry.value().clone())
    }

    /// Like [`get`](ConnectionCache::get), but ignores connections that have
    /// already closed.
    pub fn get_live(&self, address: &PeerAddress) -> Option<SharedConnection> {
        self.get(address).filter(|connection| !connection.is_closed())
    }

    /// Removes a mapping and hands back the connection so a final message can
    /// still be sent on it.
    pub fn remove(&self, address: &PeerAddress) -> Option<SharedConnection> {
        self.connections.remove(address).map(|(_, connection)| connection)
    }

    pub fn contains(&self, address: &PeerAddress) -> bool {
        self.connections.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}
