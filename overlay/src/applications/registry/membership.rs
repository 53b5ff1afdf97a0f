use overlay_core::{NodeId, PeerAddress, RoutingEntry};
use rand::{rngs::SmallRng, Rng};
use std::{collections::BTreeMap, net::IpAddr};
use thiserror::Error as ThisError;

/// The registered nodes, ordered by ID.
///
/// IDs and addresses are each unique across the table.
#[derive(Debug)]
pub struct Membership {
    nodes: BTreeMap<NodeId, PeerAddress>,
    ring_size: u32,
}

impl Membership {
    /// Creates an empty table handing out IDs from `0..ring_size`.
    pub fn new(ring_size: u32) -> Self {
        Self {
            nodes: BTreeMap::new(),
            ring_size,
        }
    }

    /// Admits a node claiming to listen on `claimed`, whose connection was
    /// observed coming from `observed`. The ID is drawn uniformly from the
    /// free IDs on the ring.
    pub fn register(
        &mut self,
        claimed: PeerAddress,
        observed: IpAddr,
        rng: &mut SmallRng,
    ) -> Result<NodeId, ValidationError> {
        if self.nodes.len() >= self.ring_size as usize {
            Err(ValidationError::RingFull(self.ring_size))?
        }
        if self.nodes.values().any(|address| *address == claimed) {
            Err(ValidationError::AddressTaken(claimed.clone()))?
        }
        if !claimed.matches_host(observed) {
            Err(ValidationError::HostMismatch {
                claimed: claimed.clone(),
                observed,
            })?
        }

        let id = loop {
            let draw = rng.gen_range(0..self.ring_size);
            // ring_size never exceeds RING_SIZE, so the draw is always on the ring
            let Ok(id) = NodeId::new(draw) else { continue };
            if !self.nodes.contains_key(&id) {
                break id;
            }
        };
        self.nodes.insert(id, claimed);
        Ok(id)
    }

    /// Removes node `id`, provided it is registered under `claimed` and the
    /// request came from that host. Returns the removed address.
    pub fn deregister(
        &mut self,
        claimed: &PeerAddress,
        id: NodeId,
        observed: IpAddr,
    ) -> Result<PeerAddress, ValidationError> {
        let registered = self
            .nodes
            .get(&id)
            .ok_or(ValidationError::NotRegistered(id))?;
        if registered != claimed {
            Err(ValidationError::AddressMismatch {
                id,
                registered: registered.clone(),
                claimed: claimed.clone(),
            })?
        }
        if !claimed.matches_host(observed) {
            Err(ValidationError::HostMismatch {
                claimed: claimed.clone(),
                observed,
            })?
        }
        self.nodes
            .remove(&id)
            .ok_or(ValidationError::NotRegistered(id))
    }

    /// Removes whichever node is registered at `address`, returning its ID.
    pub fn remove_address(&mut self, address: &PeerAddress) -> Option<NodeId> {
        let id = self
            .nodes
            .iter()
            .find(|(_, registered)| *registered == address)
            .map(|(id, _)| *id)?;
        self.nodes.remove(&id);
        Some(id)
    }

    pub fn get(&self, id: NodeId) -> Option<&PeerAddress> {
        self.nodes.get(&id)
    }

    /// Every node in ID order.
    pub fn entries(&self) -> Vec<RoutingEntry> {
        self.nodes
            .iter()
            .map(|(id, address)| RoutingEntry::new(*id, address.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &PeerAddress)> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Why a registration or deregistration was refused. The requesting node is
/// told the reason and its connection stays open.
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("There is no room left on the ring of {0} identifiers")]
    RingFull(u32),
    #[error("A node is already registered at {0}")]
    AddressTaken(PeerAddress),
    #[error("The request claims {claimed} but came from {observed}")]
    HostMismatch { claimed: PeerAddress, observed: IpAddr },
    #[error("Node {0} is not registered")]
    NotRegistered(NodeId),
    #[error("Node {id} is registered at {registered}, not {claimed}")]
    AddressMismatch {
        id: NodeId,
        registered: PeerAddress,
        claimed: PeerAddress,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::{collections::HashSet, net::Ipv4Addr};

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(0xBAD5EED)
    }

    fn local(port: u16) -> PeerAddress {
        PeerAddress::new("127.0.0.1", port)
    }

    #[test]
    fn fills_the_ring_with_unique_ids() {
        let mut rng = rng();
        let mut membership = Membership::new(16);
        let ids: HashSet<NodeId> = (0..16)
            .map(|port| membership.register(local(port), LOCAL, &mut rng).unwrap())
            .collect();
        assert_eq!(ids.len(), 16);
        assert!(ids.iter().all(|id| id.into_inner() < 16));

        assert_eq!(
            membership.register(local(99), LOCAL, &mut rng),
            Err(ValidationError::RingFull(16))
        );
    }

    #[test]
    fn rejects_bad_registrations() {
        let mut rng = rng();
        let mut membership = Membership::new(128);
        membership.register(local(1), LOCAL, &mut rng).unwrap();

        assert_eq!(
            membership.register(local(1), LOCAL, &mut rng),
            Err(ValidationError::AddressTaken(local(1)))
        );
        let elsewhere = IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1));
        assert_eq!(
            membership.register(local(2), elsewhere, &mut rng),
            Err(ValidationError::HostMismatch {
                claimed: local(2),
                observed: elsewhere
            })
        );
        assert_eq!(membership.len(), 1);
        membership.register(local(2), LOCAL, &mut rng).unwrap();
        assert_eq!(membership.len(), 2);
    }

    #[test]
    fn deregistration_frees_the_id() {
        let mut rng = rng();
        let mut membership = Membership::new(128);
        let id = membership.register(local(1), LOCAL, &mut rng).unwrap();
        let other = membership.register(local(2), LOCAL, &mut rng).unwrap();

        assert_eq!(
            membership.deregister(&local(2), id, LOCAL),
            Err(ValidationError::AddressMismatch {
                id,
                registered: local(1),
                claimed: local(2)
            })
        );
        assert_eq!(membership.deregister(&local(1), id, LOCAL), Ok(local(1)));
        assert_eq!(
            membership.deregister(&local(1), id, LOCAL),
            Err(ValidationError::NotRegistered(id))
        );

        // the address can register again once it has left
        membership.register(local(1), LOCAL, &mut rng).unwrap();
        let ordered: Vec<NodeId> = membership.entries().iter().map(|e| e.id).collect();
        let mut sorted = ordered.clone();
        sorted.sort();
        assert_eq!(ordered, sorted);
        assert!(membership.get(other).is_some());
    }

    #[test]
    fn removal_by_address() {
        let mut rng = rng();
        let mut membership = Membership::new(128);
        let id = membership.register(local(1), LOCAL, &mut rng).unwrap();
        membership.register(local(2), LOCAL, &mut rng).unwrap();

        assert_eq!(membership.remove_address(&local(3)), None);
        assert_eq!(membership.remove_address(&local(1)), Some(id));
        assert_eq!(membership.get(id), None);
        assert_eq!(membership.len(), 1);
    }
}
