//! Walks packets across whole overlays built by the registry's finger layout
//! and checks that greedy forwarding always reaches the destination.

use overlay_core::{
    routing::build_finger_tables, NodeId, PeerAddress, RoutingEntry, RoutingTable,
};
use std::collections::BTreeMap;

fn overlay(ids: &[u32], size: usize) -> BTreeMap<NodeId, RoutingTable> {
    let members: Vec<RoutingEntry> = ids
        .iter()
        .map(|&n| {
            let address = PeerAddress::new("127.0.0.1", 20000 + n as u16);
            RoutingEntry::new(NodeId::new(n).unwrap(), address)
        })
        .collect();
    build_finger_tables(&members, size)
        .unwrap()
        .into_iter()
        .collect()
}

/// Follows next hops from `src` until the packet lands, returning the path
/// taken (the nodes that relayed it).
fn walk(tables: &BTreeMap<NodeId, RoutingTable>, src: NodeId, dst: NodeId) -> Vec<NodeId> {
    let mut trace = vec![];
    let mut at = src;
    while at != dst {
        if at != src {
            trace.push(at);
        }
        assert!(trace.len() < tables.len(), "{src} -> {dst} is looping: {trace:?}");
        at = tables[&at].next_hop(dst).unwrap().entry().id;
    }
    trace
}

fn every_pair_arrives(ids: &[u32], size: usize) {
    let tables = overlay(ids, size);
    for &src in tables.keys() {
        for &dst in tables.keys().filter(|&&dst| dst != src) {
            let trace = walk(&tables, src, dst);
            assert!(!trace.contains(&src));
            assert!(!trace.contains(&dst));
        }
    }
}

#[test]
fn small_overlay() {
    every_pair_arrives(&[4, 19, 77, 101], 2);
}

#[test]
fn successor_only_overlay() {
    // with one finger each packet walks the ring one node at a time
    let ids = [1, 2, 3, 50, 64, 65, 127];
    every_pair_arrives(&ids, 1);
    let tables = overlay(&ids, 1);
    let one = NodeId::new(1).unwrap();
    let trace = walk(&tables, NodeId::new(2).unwrap(), one);
    assert_eq!(trace.len(), ids.len() - 2);
}

#[test]
fn larger_overlays() {
    let ids: Vec<u32> = (0..40).map(|n| n * 3 + 1).collect();
    every_pair_arrives(&ids, 3);
    every_pair_arrives(&ids[..33], 5);
    every_pair_arrives(&ids[..10], 3);
}

#[test]
fn exact_fingers_are_one_hop() {
    let tables = overlay(&[10, 20, 30, 40, 50], 2);
    let ten = NodeId::new(10).unwrap();
    for finger in tables[&ten].ids() {
        assert!(walk(&tables, ten, finger).is_empty());
    }
}
