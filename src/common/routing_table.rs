//! Kademlia routing table: a splitting binary trie of K-buckets.

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{Id, Node, ID_SIZE};

/// K, the maximum number of nodes in a bucket.
pub const DEFAULT_BUCKET_SIZE: usize = 8;

/// Default number of nodes returned by [RoutingTable::closest].
pub const DEFAULT_CLOSEST_COUNT: usize = 10;

/// How often buckets are swept for staleness, and how old a bucket's
/// `last_changed` has to be before it is refreshed.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// How long an eviction probe waits for a ping response before the probed
/// node is considered gone, regardless of what the host does with the probe.
pub const PROBE_DEADLINE: Duration = Duration::from_secs(5);

const MAX_DEPTH: usize = ID_SIZE * 8;

/// Actions the routing table asks its host to perform.
///
/// The table never touches the network itself; [RoutingTable::tick] hands
/// these out and the outcomes flow back in through [RoutingTable::record_response]
/// and [RoutingTable::record_no_response].
#[derive(Debug, Clone, PartialEq)]
pub enum TableEvent {
    /// Send a ping to this node to check whether it is still alive.
    Ping(Node),
    /// Issue a find_node query for this id to repopulate a stale bucket.
    Refresh(Id),
}

#[derive(Debug)]
pub struct RoutingTable {
    id: Id,
    k: usize,
    root: Bucket,
    /// At most one leaf is being evaluated for an eviction at a time.
    eviction: Option<EvictionCheck>,
    last_refresh_sweep: Instant,
}

struct Bucket {
    /// The first `depth` bits all ids in this bucket's range share.
    prefix: Id,
    depth: usize,
    last_changed: Instant,
    kind: BucketKind,
}

enum BucketKind {
    Leaf(Vec<Node>),
    Branch(Box<[Bucket; 2]>),
}

/// A full leaf's unknown nodes being pinged, stalest first, to decide
/// whether `candidate` replaces one of them.
#[derive(Debug)]
struct EvictionCheck {
    candidate: Node,
    pending: Vec<Node>,
    probing: Option<(Id, Instant)>,
}

impl RoutingTable {
    pub fn new(id: Id) -> Self {
        RoutingTable {
            id,
            k: DEFAULT_BUCKET_SIZE,
            root: Bucket::root(),
            eviction: None,
            last_refresh_sweep: Instant::now(),
        }
    }

    // === Options ===

    pub fn with_bucket_size(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn bucket_size(&self) -> usize {
        self.k
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn size(&self) -> usize {
        self.root.size()
    }

    /// All nodes in the table.
    pub fn to_vec(&self) -> Vec<Node> {
        let mut nodes = Vec::with_capacity(self.size());
        self.root.collect(&mut nodes);
        nodes
    }

    /// The `n` nodes closest to `target` by xor distance.
    pub fn closest(&self, target: &Id, n: usize) -> Vec<Node> {
        let mut nodes = self.to_vec();
        nodes.sort_by_key(|node| node.id.xor(target));
        nodes.truncate(n);
        nodes
    }

    pub fn contains(&self, id: &Id) -> bool {
        self.root.leaf_for(id).find(id).is_some()
    }

    // === Public Methods ===

    /// Record a response received from this node, inserting it if new.
    pub fn record_response(&mut self, id: Id, address: SocketAddrV4) {
        self.probe_answered(&id);

        let existing = match self.root.leaf_for_mut(&id).find_mut(&id) {
            Some(node) => {
                node.note_response();
                true
            }
            None => false,
        };

        if existing {
            self.root.leaf_for_mut(&id).touch();
            return;
        }

        let mut node = Node::new(id, address);
        node.note_response();
        self.insert(node);
    }

    /// Record a query received from this node, inserting it if new.
    pub fn record_query(&mut self, id: Id, address: SocketAddrV4) {
        let existing = match self.root.leaf_for_mut(&id).find_mut(&id) {
            Some(node) => {
                node.note_query();
                true
            }
            None => false,
        };

        if existing {
            self.root.leaf_for_mut(&id).touch();
            return;
        }

        let mut node = Node::new(id, address);
        node.note_query();
        self.insert(node);
    }

    /// Record a query to this address timing out. Does nothing for
    /// addresses not in the table.
    pub fn record_no_response(&mut self, address: SocketAddrV4) {
        let failed_id = match self.root.find_by_address_mut(address) {
            Some(node) => {
                node.note_failure();
                node.id
            }
            None => return,
        };

        self.probe_failed(&failed_id);
    }

    /// Advance eviction probes and bucket refreshes.
    pub fn tick(&mut self) -> Vec<TableEvent> {
        let mut events = Vec::new();

        self.tick_eviction(&mut events);
        self.tick_refresh(&mut events);

        events
    }

    /// Forget all nodes and abandon any eviction in progress.
    pub fn clear(&mut self) {
        self.root = Bucket::root();
        self.eviction = None;
    }

    // === Snapshot ===

    /// A flat snapshot of every node, suitable for persisting.
    pub fn to_snapshot(&self) -> Vec<NodeSnapshot> {
        self.to_vec().iter().map(NodeSnapshot::from).collect()
    }

    /// Reinsert a previously snapshotted node through the normal insert path.
    pub fn load(&mut self, snapshot: &NodeSnapshot) {
        if let Some(node) = snapshot.to_node() {
            self.insert(node)
        }
    }

    // === Private Methods ===

    fn insert(&mut self, node: Node) {
        if node.id == self.id {
            return;
        }

        loop {
            let local_id = self.id;
            let k = self.k;
            let leaf = self.root.leaf_for_mut(&node.id);

            let nodes = match &mut leaf.kind {
                BucketKind::Leaf(nodes) => nodes,
                BucketKind::Branch(_) => unreachable!("leaf_for_mut returns leaves"),
            };

            if nodes.len() < k {
                nodes.push(node);
                leaf.touch();
                return;
            }

            // A full leaf covering our own id splits; any other applies
            // the eviction policy.
            if leaf.covers(&local_id) && leaf.depth < MAX_DEPTH {
                leaf.split();
                continue;
            }

            self.evict_or_discard(node);
            return;
        }
    }

    fn evict_or_discard(&mut self, candidate: Node) {
        let leaf = self.root.leaf_for_mut(&candidate.id);
        let nodes = match &mut leaf.kind {
            BucketKind::Leaf(nodes) => nodes,
            BucketKind::Branch(_) => unreachable!("leaf_for_mut returns leaves"),
        };

        // A bad node is replaced without pinging anyone.
        if let Some(index) = nodes.iter().position(|node| node.is_bad()) {
            let evicted = nodes[index].id;
            debug!(?evicted, new = ?candidate.id, "Replaced bad node");

            nodes[index] = candidate;
            leaf.touch();
            return;
        }

        let mut unknowns: Vec<Node> = nodes
            .iter()
            .filter(|node| node.is_unknown())
            .cloned()
            .collect();

        // All nodes good, or another leaf is already being evaluated.
        if unknowns.is_empty() || self.eviction.is_some() {
            return;
        }

        // Stalest first; nodes that never responded are the stalest of all.
        unknowns.sort_by_key(|node| node.last_response);
        unknowns.reverse();

        self.eviction = Some(EvictionCheck {
            candidate,
            pending: unknowns,
            probing: None,
        });
    }

    fn tick_eviction(&mut self, events: &mut Vec<TableEvent>) {
        let Some(check) = &mut self.eviction else {
            return;
        };

        if let Some((id, started)) = check.probing {
            if started.elapsed() > PROBE_DEADLINE {
                self.probe_failed(&id);
            }
            return;
        }

        match check.pending.pop() {
            Some(node) => {
                check.probing = Some((node.id, Instant::now()));
                events.push(TableEvent::Ping(node));
            }
            None => {
                // Everyone answered; the candidate loses.
                self.eviction = None;
            }
        }
    }

    /// The node being probed responded; move on to the next unknown,
    /// or discard the candidate if it was the last one.
    fn probe_answered(&mut self, id: &Id) {
        let Some(check) = &mut self.eviction else {
            return;
        };

        if check.probing.map(|(probed, _)| probed) != Some(*id) {
            return;
        }

        check.probing = None;

        if check.pending.is_empty() {
            let discarded = check.candidate.id;
            debug!(?discarded, "All probed nodes alive, discarding candidate");

            self.eviction = None;
        }
    }

    /// The node being probed timed out; the candidate takes its place.
    fn probe_failed(&mut self, id: &Id) {
        let Some(check) = &self.eviction else {
            return;
        };

        if check.probing.map(|(probed, _)| probed) != Some(*id) {
            return;
        }

        let candidate = self
            .eviction
            .take()
            .expect("eviction checked above")
            .candidate;

        debug!(evicted = ?id, new = ?candidate.id, "Probed node did not respond, replacing");

        let k = self.k;
        let leaf = self.root.leaf_for_mut(&candidate.id);
        if let BucketKind::Leaf(nodes) = &mut leaf.kind {
            nodes.retain(|node| node.id != *id);

            // The probed node may have been replaced through the bad-node
            // path in the meantime; the candidate only takes a free slot.
            if nodes.len() < k {
                nodes.push(candidate);
                leaf.touch();
            }
        }
    }

    fn tick_refresh(&mut self, events: &mut Vec<TableEvent>) {
        if self.last_refresh_sweep.elapsed() < REFRESH_INTERVAL {
            return;
        }
        self.last_refresh_sweep = Instant::now();

        self.root.visit_leaves(&mut |leaf| {
            if leaf.last_changed.elapsed() > REFRESH_INTERVAL {
                events.push(TableEvent::Refresh(Id::random_in_range(
                    &leaf.prefix,
                    leaf.depth,
                )));
            }
        });
    }
}

impl Bucket {
    fn root() -> Bucket {
        Bucket {
            prefix: Id([0; ID_SIZE]),
            depth: 0,
            last_changed: Instant::now(),
            kind: BucketKind::Leaf(Vec::new()),
        }
    }

    /// Returns `true` if `id` is in this bucket's range.
    fn covers(&self, id: &Id) -> bool {
        id.shares_prefix(&self.prefix, self.depth)
    }

    fn touch(&mut self) {
        self.last_changed = Instant::now();
    }

    fn leaf_for(&self, id: &Id) -> &Bucket {
        match &self.kind {
            BucketKind::Leaf(_) => self,
            BucketKind::Branch(children) => children[id.bit(self.depth) as usize].leaf_for(id),
        }
    }

    fn leaf_for_mut(&mut self, id: &Id) -> &mut Bucket {
        if let BucketKind::Leaf(_) = &self.kind {
            return self;
        }
        match &mut self.kind {
            BucketKind::Branch(children) => children[id.bit(self.depth) as usize].leaf_for_mut(id),
            BucketKind::Leaf(_) => unreachable!(),
        }
    }

    fn find(&self, id: &Id) -> Option<&Node> {
        match &self.kind {
            BucketKind::Leaf(nodes) => nodes.iter().find(|node| node.id == *id),
            BucketKind::Branch(_) => None,
        }
    }

    fn find_mut(&mut self, id: &Id) -> Option<&mut Node> {
        match &mut self.kind {
            BucketKind::Leaf(nodes) => nodes.iter_mut().find(|node| node.id == *id),
            BucketKind::Branch(_) => None,
        }
    }

    fn find_by_address_mut(&mut self, address: SocketAddrV4) -> Option<&mut Node> {
        match &mut self.kind {
            BucketKind::Leaf(nodes) => nodes.iter_mut().find(|node| node.address == address),
            BucketKind::Branch(children) => children
                .iter_mut()
                .find_map(|child| child.find_by_address_mut(address)),
        }
    }

    /// Split a leaf at the midpoint of its range, redistributing its nodes
    /// over the two halves.
    fn split(&mut self) {
        debug_assert!(self.depth < MAX_DEPTH);

        let nodes = match &mut self.kind {
            BucketKind::Leaf(nodes) => std::mem::take(nodes),
            BucketKind::Branch(_) => return,
        };

        let depth = self.depth + 1;

        let mut zero = Bucket {
            prefix: self.prefix,
            depth,
            last_changed: self.last_changed,
            kind: BucketKind::Leaf(Vec::new()),
        };
        let mut one = Bucket {
            prefix: self.prefix.with_bit(self.depth),
            depth,
            last_changed: self.last_changed,
            kind: BucketKind::Leaf(Vec::new()),
        };

        for node in nodes {
            let half = if node.id.bit(self.depth) {
                &mut one
            } else {
                &mut zero
            };
            if let BucketKind::Leaf(nodes) = &mut half.kind {
                nodes.push(node);
            }
        }

        self.kind = BucketKind::Branch(Box::new([zero, one]));
    }

    fn size(&self) -> usize {
        match &self.kind {
            BucketKind::Leaf(nodes) => nodes.len(),
            BucketKind::Branch(children) => children.iter().map(Bucket::size).sum(),
        }
    }

    fn collect(&self, out: &mut Vec<Node>) {
        match &self.kind {
            BucketKind::Leaf(nodes) => out.extend(nodes.iter().cloned()),
            BucketKind::Branch(children) => {
                for child in children.iter() {
                    child.collect(out);
                }
            }
        }
    }

    fn visit_leaves(&self, visit: &mut impl FnMut(&Bucket)) {
        match &self.kind {
            BucketKind::Leaf(_) => visit(self),
            BucketKind::Branch(children) => {
                for child in children.iter() {
                    child.visit_leaves(visit);
                }
            }
        }
    }
}

impl Debug for Bucket {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.kind {
            BucketKind::Leaf(nodes) => write!(
                f,
                "Leaf {{ prefix: {}/{}, nodes: {} }}",
                self.prefix,
                self.depth,
                nodes.len()
            ),
            BucketKind::Branch(_) => write!(f, "Branch {{ prefix: {}/{} }}", self.prefix, self.depth),
        }
    }
}

/// One node of the routing table in its persistable form:
/// `(id, address, port, family, token, last_response_age,
/// last_received_query_age, failed_responses)`, ages in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSnapshot(
    pub String,
    pub String,
    pub u16,
    pub String,
    pub Option<String>,
    pub Option<u64>,
    pub Option<u64>,
    pub u8,
);

impl From<&Node> for NodeSnapshot {
    fn from(node: &Node) -> Self {
        NodeSnapshot(
            node.id.to_string(),
            node.address.ip().to_string(),
            node.address.port(),
            "ipv4".to_string(),
            node.token.as_ref().map(|token| to_hex(token)),
            node.last_response.map(|t| t.elapsed().as_secs()),
            node.last_received_query.map(|t| t.elapsed().as_secs()),
            node.failed_responses,
        )
    }
}

impl NodeSnapshot {
    fn to_node(&self) -> Option<Node> {
        if self.3 != "ipv4" {
            return None;
        }

        let id: Id = self.0.as_str().try_into().ok()?;
        let ip = self.1.parse().ok()?;

        let mut node = Node::new(id, SocketAddrV4::new(ip, self.2));
        node.token = self.4.as_deref().and_then(from_hex).map(Vec::into_boxed_slice);
        node.last_response = self.5.and_then(age_to_instant);
        node.last_received_query = self.6.and_then(age_to_instant);
        node.failed_responses = self.7;

        Some(node)
    }
}

fn age_to_instant(age_secs: u64) -> Option<Instant> {
    Instant::now().checked_sub(Duration::from_secs(age_secs))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }

    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    fn addr(port: u16) -> SocketAddrV4 {
        SocketAddrV4::new([127, 0, 0, 1].into(), port)
    }

    #[test]
    fn should_not_add_self() {
        let id = Id::random();
        let mut table = RoutingTable::new(id);

        table.record_response(id, addr(1));

        assert!(table.is_empty());
    }

    #[test]
    fn every_node_in_the_leaf_covering_its_id() {
        let mut table = RoutingTable::new(Id::random());

        for i in 0..200 {
            table.record_response(Id::random(), addr(i));
        }

        for node in table.to_vec() {
            let leaf = table.root.leaf_for(&node.id);
            assert!(leaf.covers(&node.id));
            assert!(leaf.find(&node.id).is_some());
        }
    }

    #[test]
    fn leaves_partition_the_id_space() {
        let mut table = RoutingTable::new(Id::random());

        for i in 0..500 {
            table.record_response(Id::random(), addr(i));
        }

        // Every id is covered by exactly one leaf.
        for _ in 0..1000 {
            let probe = Id::random();

            let mut covering = 0;
            table.root.visit_leaves(&mut |leaf| {
                if leaf.covers(&probe) {
                    covering += 1;
                }
            });

            assert_eq!(covering, 1);
        }
    }

    #[test]
    fn bucket_size_is_respected() {
        let local: Id = "0000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let mut table = RoutingTable::new(local);

        for i in 0..100 {
            table.record_response(Id::random(), addr(i));
        }

        table.root.visit_leaves(&mut |leaf| {
            if let BucketKind::Leaf(nodes) = &leaf.kind {
                assert!(nodes.len() <= table.k);
            }
        });
    }

    #[test]
    fn closest_returns_n_sorted_by_distance() {
        let target = Id::random();
        let mut table = RoutingTable::new(Id::random());

        for i in 0..100 {
            table.record_response(Id::random(), addr(i));
        }

        let closest = table.closest(&target, DEFAULT_CLOSEST_COUNT);

        assert_eq!(closest.len(), DEFAULT_CLOSEST_COUNT);

        let distances: Vec<Id> = closest.iter().map(|n| n.id.xor(&target)).collect();
        let mut sorted = distances.clone();
        sorted.sort();
        assert_eq!(distances, sorted);

        // No node in the table is closer than the furthest returned.
        let furthest = distances.last().unwrap();
        for node in table.to_vec() {
            if !closest.contains(&node) {
                assert!(node.id.xor(&target) >= *furthest);
            }
        }
    }

    #[test]
    fn bad_node_replaced_without_ping() {
        let local: Id = "0000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let far: Id = "f000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let also_far: Id = "f100000000000000000000000000000000000000"
            .try_into()
            .unwrap();

        let mut table = RoutingTable::new(local).with_bucket_size(1);

        table.record_response(far, addr(1));
        for _ in 0..3 {
            table.record_no_response(addr(1));
        }
        assert!(table.to_vec()[0].is_bad());

        table.record_response(also_far, addr(2));

        assert!(table.contains(&also_far));
        assert!(!table.contains(&far));
        // Replacement happened immediately, no probe was scheduled.
        assert!(table.tick().is_empty());
    }

    #[test]
    fn all_good_nodes_discards_candidate() {
        let local: Id = "0000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let far: Id = "f000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let also_far: Id = "f100000000000000000000000000000000000000"
            .try_into()
            .unwrap();

        let mut table = RoutingTable::new(local).with_bucket_size(1);

        table.record_response(far, addr(1));
        table.record_response(also_far, addr(2));

        assert!(table.contains(&far));
        assert!(!table.contains(&also_far));
    }

    #[test]
    fn eviction_probe_alive_keeps_node() {
        let local: Id = "0000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let unknown: Id = "f000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let candidate: Id = "f100000000000000000000000000000000000000"
            .try_into()
            .unwrap();

        let mut table = RoutingTable::new(local).with_bucket_size(1);

        // Known only through a query it sent us, so it is unknown.
        table.record_query(unknown, addr(6));
        table.record_response(candidate, addr(3));

        let events = table.tick();
        assert_eq!(events.len(), 1);
        let TableEvent::Ping(probed) = &events[0] else {
            panic!("expected a ping event");
        };
        assert_eq!(probed.id, unknown);

        // The ping handler answers "alive".
        table.record_response(unknown, addr(6));

        assert!(table.contains(&unknown));
        assert!(!table.contains(&candidate));
        assert!(table.eviction.is_none());
    }

    #[test]
    fn eviction_probe_dead_installs_candidate() {
        let local: Id = "0000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let unknown: Id = "f000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let candidate: Id = "f100000000000000000000000000000000000000"
            .try_into()
            .unwrap();

        let mut table = RoutingTable::new(local).with_bucket_size(1);

        table.record_query(unknown, addr(6));
        table.record_response(candidate, addr(3));

        let events = table.tick();
        assert!(matches!(events[0], TableEvent::Ping(_)));

        // The ping handler answers "dead".
        table.record_no_response(addr(6));

        assert!(!table.contains(&unknown));
        assert!(table.contains(&candidate));
        assert!(table.eviction.is_none());
    }

    #[test]
    fn one_eviction_check_at_a_time() {
        let local: Id = "0000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let mut table = RoutingTable::new(local).with_bucket_size(1);

        let unknown: Id = "f000000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        table.record_query(unknown, addr(6));

        let first: Id = "f100000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        let second: Id = "f200000000000000000000000000000000000000"
            .try_into()
            .unwrap();
        table.record_response(first, addr(3));
        table.record_response(second, addr(4));

        // Only one probe in flight, and the later candidate was dropped.
        assert_eq!(table.tick().len(), 1);
        table.record_no_response(addr(6));

        assert!(table.contains(&first));
        assert!(!table.contains(&second));
    }

    #[test]
    fn snapshot_roundtrip() {
        let mut table = RoutingTable::new(Id::random());

        for i in 0..30 {
            table.record_response(Id::random(), addr(i));
        }

        let snapshot = table.to_snapshot();

        let mut restored = RoutingTable::new(*table.id());
        for node in &snapshot {
            restored.load(node);
        }

        assert_eq!(restored.size(), table.size());
        for node in table.to_vec() {
            assert!(restored.contains(&node.id));
        }
        // Liveness survives the roundtrip.
        for node in restored.to_vec() {
            assert!(node.is_good());
        }
    }
}
