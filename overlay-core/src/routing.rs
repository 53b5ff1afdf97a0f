//! Per-node finger tables and the greedy forwarding rule.
//!
//! Entry `i` of a node's table is the node `2^i` positions further along the
//! registry's sorted membership. A node never sees the whole ring, so when a
//! destination is not one of its fingers it hands the packet to the finger
//! that precedes the destination most closely, wrapping around to its largest
//! finger when every finger lies past the destination.
//!
//! [`build_finger_tables`] is the registry's side: it lays the tables out over
//! the current membership.

use crate::{NodeId, PeerAddress};
use std::fmt::{self, Display, Formatter};
use thiserror::Error as ThisError;

/// One finger: a node on the ring and where to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoutingEntry {
    pub id: NodeId,
    pub address: PeerAddress,
}

impl RoutingEntry {
    pub fn new(id: NodeId, address: PeerAddress) -> Self {
        Self { id, address }
    }
}

/// An ordered finger table. Insertion order is hop order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    entries: Vec<RoutingEntry>,
}

/// The outcome of a forwarding decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop<'a> {
    /// The destination is itself one of the fingers.
    Exact(&'a RoutingEntry),
    /// The greatest finger that is still less than the destination.
    Preceding(&'a RoutingEntry),
    /// No finger is less than the destination, so it lies past the largest
    /// finger on the wrapped-around part of the ring.
    Wraparound(&'a RoutingEntry),
}

impl<'a> NextHop<'a> {
    pub fn entry(self) -> &'a RoutingEntry {
        match self {
            NextHop::Exact(entry) | NextHop::Preceding(entry) | NextHop::Wraparound(entry) => {
                entry
            }
        }
    }
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from fingers given in hop order.
    pub fn from_entries(
        entries: impl IntoIterator<Item = RoutingEntry>,
    ) -> Result<Self, RoutingError> {
        let mut table = Self::new();
        for entry in entries {
            table.push(entry)?;
        }
        Ok(table)
    }

    /// Appends a finger. IDs within a table are unique.
    pub fn push(&mut self, entry: RoutingEntry) -> Result<(), RoutingError> {
        if self.contains(entry.id) {
            return Err(RoutingError::DuplicateEntry(entry.id));
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn get(&self, id: NodeId) -> Option<&RoutingEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// The fingers in hop order.
    pub fn entries(&self) -> &[RoutingEntry] {
        &self.entries
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.entries.iter().map(|entry| entry.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Picks the finger a packet for `dst` should be handed to. Returns
    /// `None` only when the table is empty.
    pub fn next_hop(&self, dst: NodeId) -> Option<NextHop<'_>> {
        if let Some(entry) = self.get(dst) {
            return Some(NextHop::Exact(entry));
        }

        let mut sorted: Vec<&RoutingEntry> = self.entries.iter().collect();
        sorted.sort_by_key(|entry| entry.id);

        let mut largest = None;
        let mut closest = None;
        for entry in sorted {
            // ascending, so the last one seen is the largest
            largest = Some(entry);
            if entry.id < dst {
                closest = Some(entry);
            }
        }

        match closest {
            Some(entry) => Some(NextHop::Preceding(entry)),
            None => largest.map(NextHop::Wraparound),
        }
    }
}

impl Display for RoutingTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for entry in self.entries.iter() {
            writeln!(f, "{:>3}: {}", entry.id, entry.address)?;
        }
        Ok(())
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum RoutingError {
    #[error("Node {0} already has an entry in this routing table")]
    DuplicateEntry(NodeId),
}

/// Builds a finger table of `size` entries for every member.
///
/// `members` must be ordered by ID. Entry `e` of the table for the member at
/// position `i` is the member at position `(i + 2^e) mod N`. A lone member
/// gets an empty table. Otherwise a size that would put a node in its own
/// table, or put the same node in a table twice, is rejected.
pub fn build_finger_tables(
    members: &[RoutingEntry],
    size: usize,
) -> Result<Vec<(NodeId, RoutingTable)>, OverlayError> {
    let nodes = members.len();
    if nodes == 0 {
        Err(OverlayError::NoNodes)?
    }
    if size == 0 {
        Err(OverlayError::EmptyTable)?
    }
    if nodes == 1 {
        return Ok(vec![(members[0].id, RoutingTable::new())]);
    }

    // there are only N positions, so by the N-th offset a size this large
    // has already landed on its own node or repeated one
    let offsets = finger_offsets(nodes, size.min(nodes));
    let mut seen = vec![false; nodes];
    for &offset in offsets.iter() {
        if offset == 0 {
            Err(OverlayError::SelfEntry { size, nodes })?
        }
        if std::mem::replace(&mut seen[offset], true) {
            Err(OverlayError::RepeatedEntry { size, nodes })?
        }
    }

    members
        .iter()
        .enumerate()
        .map(|(position, member)| -> Result<_, OverlayError> {
            let fingers = offsets
                .iter()
                .map(|offset| members[(position + offset) % nodes].clone());
            Ok((member.id, RoutingTable::from_entries(fingers)?))
        })
        .collect()
}

/// `2^e mod nodes` for each `e` in `0..size`.
fn finger_offsets(nodes: usize, size: usize) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(size);
    let mut offset = 1 % nodes;
    for _ in 0..size {
        offsets.push(offset);
        offset = offset * 2 % nodes;
    }
    offsets
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum OverlayError {
    #[error("There are no registered nodes to build an overlay from")]
    NoNodes,
    #[error("Routing tables must have at least one entry")]
    EmptyTable,
    #[error("A routing table of size {size} over {nodes} nodes would contain its own node")]
    SelfEntry { size: usize, nodes: usize },
    #[error("A routing table of size {size} over {nodes} nodes would repeat an entry")]
    RepeatedEntry { size: usize, nodes: usize },
    #[error(transparent)]
    Routing(#[from] RoutingError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn table(ids: &[u32]) -> RoutingTable {
        let entries = ids
            .iter()
            .map(|&n| RoutingEntry::new(id(n), PeerAddress::new("127.0.0.1", 6000 + n as u16)));
        RoutingTable::from_entries(entries).unwrap()
    }

    #[test]
    fn exact_match_wins() {
        let table = table(&[40, 3, 90, 12]);
        assert_eq!(
            table.next_hop(id(12)),
            Some(NextHop::Exact(table.get(id(12)).unwrap()))
        );
    }

    #[test]
    fn closest_preceding_finger() {
        let table = table(&[3, 12, 40, 90]);
        let hop = table.next_hop(id(95)).unwrap();
        assert!(matches!(hop, NextHop::Preceding(_)));
        assert_eq!(hop.entry().id, id(90));

        assert_eq!(table.next_hop(id(41)).unwrap().entry().id, id(40));
        assert_eq!(table.next_hop(id(4)).unwrap().entry().id, id(3));
    }

    #[test]
    fn wraps_to_largest_finger() {
        // inserted out of order to make sure the rule does not rely on hop order
        let table = table(&[90, 3, 40, 12]);
        let hop = table.next_hop(id(1)).unwrap();
        assert!(matches!(hop, NextHop::Wraparound(_)));
        assert_eq!(hop.entry().id, id(90));
    }

    #[test]
    fn empty_table_has_no_hop() {
        assert_eq!(RoutingTable::new().next_hop(id(5)), None);
    }

    fn members(count: u32) -> Vec<RoutingEntry> {
        // IDs spread over the ring, already in ascending order
        (0..count)
            .map(|n| {
                let address = PeerAddress::new("127.0.0.1", 7000 + n as u16);
                RoutingEntry::new(id(n * 7 + 2), address)
            })
            .collect()
    }

    #[test]
    fn fingers_double_around_the_membership() {
        let members = members(4);
        let tables = build_finger_tables(&members, 2).unwrap();
        assert_eq!(tables.len(), 4);

        let (owner, first) = &tables[0];
        assert_eq!(*owner, members[0].id);
        assert_eq!(first.entries(), &members[1..3]);

        // the last member wraps around to the front
        let (_, last) = &tables[3];
        assert_eq!(last.entries(), &[members[0].clone(), members[1].clone()]);
    }

    #[test]
    fn offsets_may_wrap_without_colliding() {
        let members = members(5);
        let tables = build_finger_tables(&members, 4).unwrap();
        let ids: Vec<NodeId> = tables[0].1.ids().collect();
        // positions 1, 2, 4 and 8 % 5 = 3
        assert_eq!(
            ids,
            vec![members[1].id, members[2].id, members[4].id, members[3].id]
        );
    }

    #[test]
    fn rejects_degenerate_sizes() {
        assert_eq!(build_finger_tables(&[], 3), Err(OverlayError::NoNodes));
        assert_eq!(
            build_finger_tables(&members(4), 0),
            Err(OverlayError::EmptyTable)
        );
        assert_eq!(
            build_finger_tables(&members(4), 3),
            Err(OverlayError::SelfEntry { size: 3, nodes: 4 })
        );
        assert_eq!(
            build_finger_tables(&members(3), 3),
            Err(OverlayError::RepeatedEntry { size: 3, nodes: 3 })
        );
    }

    #[test]
    fn huge_sizes_are_rejected_without_building() {
        assert_eq!(
            build_finger_tables(&members(4), usize::MAX),
            Err(OverlayError::SelfEntry {
                size: usize::MAX,
                nodes: 4
            })
        );
        // offsets 1, 2, 1 over three nodes
        assert_eq!(
            build_finger_tables(&members(3), usize::MAX),
            Err(OverlayError::RepeatedEntry {
                size: usize::MAX,
                nodes: 3
            })
        );
        assert_eq!(
            build_finger_tables(&members(5), 5),
            Err(OverlayError::RepeatedEntry { size: 5, nodes: 5 })
        );
        assert!(build_finger_tables(&members(1), usize::MAX).is_ok());
    }

    #[test]
    fn lone_member_gets_empty_table() {
        let tables = build_finger_tables(&members(1), 3).unwrap();
        assert_eq!(tables.len(), 1);
        assert!(tables[0].1.is_empty());
    }

    #[test]
    fn rejects_duplicate_ids() {
        let mut table = table(&[7]);
        let duplicate = RoutingEntry::new(id(7), PeerAddress::new("10.0.0.1", 1));
        assert_eq!(table.push(duplicate), Err(RoutingError::DuplicateEntry(id(7))));
        assert_eq!(table.len(), 1);
    }
}
