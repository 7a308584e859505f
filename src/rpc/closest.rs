//! A fixed-capacity set of the closest nodes seen around a target.

use crate::common::{Id, Node};

/// Keeps the `capacity` nodes closest to `target` by xor distance,
/// in a small sorted array.
#[derive(Debug, Clone)]
pub struct ClosestSet {
    target: Id,
    capacity: usize,
    nodes: Vec<Node>,
}

impl ClosestSet {
    pub fn new(target: Id, capacity: usize) -> Self {
        Self {
            target,
            capacity,
            nodes: Vec::with_capacity(capacity + 1),
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        &self.target
    }

    /// Nodes sorted by ascending distance to the target.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The distance of the furthest kept node, or `None` while the set
    /// still has room (an infinite threshold).
    pub fn threshold(&self) -> Option<Id> {
        if self.nodes.len() < self.capacity {
            return None;
        }

        self.nodes.last().map(|node| node.id().xor(&self.target))
    }

    /// Returns `true` if a node with this id would make the set closer.
    pub fn improves(&self, id: &Id) -> bool {
        match self.threshold() {
            None => true,
            Some(threshold) => id.xor(&self.target) < threshold,
        }
    }

    // === Public Methods ===

    /// Insert a node, keeping the set sorted and capped at capacity.
    pub fn insert(&mut self, node: Node) {
        let distance = node.id().xor(&self.target);

        if let Err(position) = self.nodes.binary_search_by(|probe| {
            if probe.id() == node.id() {
                std::cmp::Ordering::Equal
            } else {
                probe.id().xor(&self.target).cmp(&distance)
            }
        }) {
            self.nodes.insert(position, node);
            self.nodes.truncate(self.capacity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddrV4;

    fn node(id: Id) -> Node {
        Node::new(id, SocketAddrV4::new([127, 0, 0, 1].into(), 0))
    }

    #[test]
    fn keeps_only_the_closest() {
        let target = Id::random();
        let mut set = ClosestSet::new(target, 8);

        let mut all: Vec<Id> = (0..50).map(|_| Id::random()).collect();
        for id in &all {
            set.insert(node(*id));
        }

        all.sort_by_key(|id| id.xor(&target));

        let kept: Vec<Id> = set.nodes().iter().map(|n| *n.id()).collect();
        assert_eq!(kept, all[..8].to_vec());
    }

    #[test]
    fn threshold_infinite_until_full() {
        let target = Id::random();
        let mut set = ClosestSet::new(target, 3);

        assert!(set.threshold().is_none());
        assert!(set.improves(&Id::random()));

        for _ in 0..3 {
            set.insert(node(Id::random()));
        }

        let threshold = set.threshold().unwrap();
        assert_eq!(
            threshold,
            set.nodes().last().unwrap().id().xor(&target)
        );
    }

    #[test]
    fn duplicate_ids_are_ignored() {
        let target = Id::random();
        let mut set = ClosestSet::new(target, 8);

        let id = Id::random();
        set.insert(node(id));
        set.insert(node(id));

        assert_eq!(set.len(), 1);
    }
}
