//! Struct and implementation of the Node entry in the Kademlia routing table

use std::fmt::{self, Debug, Formatter};
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

use crate::common::Id;

/// The age of a node's last interaction before it is no longer considered good.
pub const GOOD_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// Consecutive failed responses before a node is considered bad.
pub const MAX_FAILED_RESPONSES: u8 = 3;

/// How long a write token received from a node stays usable.
///
/// Matches the receiver side, which accepts tokens generated with the
/// current or the previous secret, rotated every 10 minutes.
pub const TOKEN_ACCEPT_INTERVAL: Duration = Duration::from_secs(10 * 60);

#[derive(Clone)]
/// Node entry in the Kademlia routing table
pub struct Node {
    pub(crate) id: Id,
    pub(crate) address: SocketAddrV4,
    pub(crate) token: Option<Box<[u8]>>,
    pub(crate) last_response: Option<Instant>,
    pub(crate) last_received_query: Option<Instant>,
    pub(crate) failed_responses: u8,
}

impl Node {
    /// Creates a new Node from an id and socket address.
    pub fn new(id: Id, address: SocketAddrV4) -> Node {
        Node {
            id,
            address,
            token: None,
            last_response: None,
            last_received_query: None,
            failed_responses: 0,
        }
    }

    // === Options ===

    pub fn with_token(mut self, token: Box<[u8]>) -> Self {
        self.token = Some(token);
        self
    }

    // === Getters ===

    pub fn id(&self) -> &Id {
        &self.id
    }

    pub fn address(&self) -> SocketAddrV4 {
        self.address
    }

    pub fn token(&self) -> Option<Box<[u8]>> {
        self.token.clone()
    }

    /// Node responded to a query from us, or sent us a query, within
    /// [GOOD_INTERVAL], has responded at least once, and didn't fail
    /// [MAX_FAILED_RESPONSES] times in a row.
    pub fn is_good(&self) -> bool {
        if self.failed_responses >= MAX_FAILED_RESPONSES {
            return false;
        }

        match self.last_response {
            None => false,
            Some(last_response) => {
                last_response.elapsed() <= GOOD_INTERVAL
                    || self
                        .last_received_query
                        .map(|t| t.elapsed() <= GOOD_INTERVAL)
                        .unwrap_or(false)
            }
        }
    }

    /// Node failed to respond [MAX_FAILED_RESPONSES] times in a row.
    pub fn is_bad(&self) -> bool {
        self.failed_responses >= MAX_FAILED_RESPONSES
    }

    /// Neither [good][Node::is_good] nor [bad][Node::is_bad].
    pub fn is_unknown(&self) -> bool {
        !self.is_good() && !self.is_bad()
    }

    /// The node's token was received recently enough to still be accepted.
    pub fn valid_token(&self) -> bool {
        self.token.is_some()
            && self
                .last_response
                .map(|t| t.elapsed() <= TOKEN_ACCEPT_INTERVAL)
                .unwrap_or(false)
    }

    // === Public Methods ===

    /// Mark a response received from this node.
    pub(crate) fn note_response(&mut self) {
        self.last_response = Some(Instant::now());
        self.failed_responses = 0;
    }

    /// Mark a query received from this node.
    pub(crate) fn note_query(&mut self) {
        self.last_received_query = Some(Instant::now());
    }

    /// Mark a query to this node as timed out.
    pub(crate) fn note_failure(&mut self) {
        self.failed_responses = self.failed_responses.saturating_add(1);
    }

    /// Creates a node with a random Id for testing purposes.
    #[cfg(test)]
    pub(crate) fn random() -> Node {
        Node::new(Id::random(), SocketAddrV4::new([0, 0, 0, 0].into(), 0))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.address == other.address
    }
}

impl Eq for Node {}

impl Debug for Node {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Node")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("failed_responses", &self.failed_responses)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn starts_unknown() {
        let node = Node::random();

        assert!(node.is_unknown());
        assert!(!node.is_good());
        assert!(!node.is_bad());
    }

    #[test]
    fn good_after_response() {
        let mut node = Node::random();
        node.note_response();

        assert!(node.is_good());
    }

    #[test]
    fn query_alone_is_not_good() {
        // A node that only ever sent us queries never proved it can respond.
        let mut node = Node::random();
        node.note_query();

        assert!(node.is_unknown());
    }

    #[test]
    fn bad_after_three_failures() {
        let mut node = Node::random();
        node.note_response();

        for _ in 0..MAX_FAILED_RESPONSES {
            node.note_failure();
        }

        assert!(node.is_bad());
        assert!(!node.is_good());
    }

    #[test]
    fn response_resets_failures() {
        let mut node = Node::random();

        node.note_failure();
        node.note_failure();
        node.note_response();

        assert_eq!(node.failed_responses, 0);
        assert!(node.is_good());
    }
}
