//! Manage iterative queries and their corresponding requests/responses.

use std::collections::HashSet;
use std::net::SocketAddrV4;

use tracing::{debug, trace};

use crate::common::{Id, Node, RequestSpecific};

use super::closest::ClosestSet;
use super::response::{Response, ResponseSender};
use super::socket::KrpcSocket;

/// An iterative process of concurrently sending a request to the closest
/// known nodes to the target, visiting closer nodes discovered in the
/// responses, until no unvisited node would improve on the closest set.
#[derive(Debug)]
pub(crate) struct IterativeQuery {
    pub request: RequestSpecific,
    /// Nodes seeded from the routing table plus nodes that responded.
    ///
    /// Its threshold is what decides whether a discovered candidate is
    /// worth visiting.
    closest: ClosestSet,
    /// Responding nodes that returned a write token.
    responders: ClosestSet,
    inflight_requests: Vec<u32>,
    visited: HashSet<SocketAddrV4>,
    senders: Vec<ResponseSender>,
    responses: Vec<Response>,
    /// Set when a validated value short-circuits the traversal.
    finished_early: bool,
}

impl IterativeQuery {
    pub fn new(target: Id, request: RequestSpecific, k: usize) -> Self {
        trace!(?target, request = ?request.request_type, "New iterative query");

        Self {
            request,
            closest: ClosestSet::new(target, k),
            responders: ClosestSet::new(target, k),
            inflight_requests: Vec::new(),
            visited: HashSet::new(),
            senders: Vec::new(),
            responses: Vec::new(),
            finished_early: false,
        }
    }

    // === Getters ===

    pub fn target(&self) -> &Id {
        self.closest.target()
    }

    /// The closest nodes this query converged on.
    pub fn closest(&self) -> &[Node] {
        self.closest.nodes()
    }

    /// The closest responding nodes holding a write token.
    pub fn responders(&self) -> &[Node] {
        self.responders.nodes()
    }

    /// No inflight requests remain; the traversal is drained.
    pub fn is_done(&self, socket: &KrpcSocket) -> bool {
        self.finished_early
            || !self
                .inflight_requests
                .iter()
                .any(|tid| socket.inflight(tid))
    }

    // === Public Methods ===

    /// Add a sender to the query, replaying all responses seen so far to it.
    pub fn add_sender(&mut self, sender: Option<ResponseSender>) {
        if let Some(sender) = sender {
            for response in &self.responses {
                send_value(&sender, response.clone());
            }

            self.senders.push(sender);
        }
    }

    /// Seed the query with a node from the routing table, visiting it
    /// right away.
    pub fn seed(&mut self, socket: &mut KrpcSocket, node: Node) {
        let address = node.address();
        self.closest.insert(node);
        self.visit(socket, address);
    }

    /// Visit an explicitly given address, such as a bootstrap node.
    pub fn visit(&mut self, socket: &mut KrpcSocket, address: SocketAddrV4) {
        if self.visited.contains(&address) {
            return;
        }

        let tid = socket.request(address, self.request.clone());
        self.inflight_requests.push(tid);
        self.visited.insert(address);
    }

    /// A node discovered in a response; visited only if it is unvisited
    /// and improves on the current closest set.
    pub fn add_candidate(&mut self, socket: &mut KrpcSocket, node: Node) {
        if self.visited.contains(&node.address()) || !self.closest.improves(node.id()) {
            return;
        }

        self.visit(socket, node.address());
    }

    /// Remove an inflight request and return true if it belonged to this query.
    pub fn remove_inflight_request(&mut self, tid: u32) -> bool {
        if let Some(index) = self.inflight_requests.iter().position(|&x| x == tid) {
            self.inflight_requests.remove(index);
            return true;
        }

        false
    }

    /// A node responded; it joins the closest set, and the responders set
    /// if it sent a write token.
    pub fn add_responding_node(&mut self, node: Node) {
        if node.token().is_some() {
            self.responders.insert(node.clone());
        }

        self.closest.insert(node);
    }

    /// Record a validated value from a response and fan it out to senders.
    pub fn response(&mut self, from: SocketAddrV4, response: Response) {
        debug!(target = ?self.target(), ?response, ?from, "Query got response");

        for sender in &self.senders {
            send_value(sender, response.clone());
        }

        self.responses.push(response);
    }

    /// Stop traversing: a response already satisfied this query.
    ///
    /// Cancels all outstanding requests.
    pub fn finish_early(&mut self, socket: &mut KrpcSocket) {
        for tid in &self.inflight_requests {
            socket.cancel(tid);
        }

        self.inflight_requests.clear();
        self.finished_early = true;
    }

    /// Drop requests the socket no longer tracks (timed out), and once
    /// nothing is left inflight, resolve the remaining senders.
    ///
    /// Returns true when the query is done and can be removed.
    pub fn tick(&mut self, socket: &mut KrpcSocket) -> bool {
        self.inflight_requests.retain(|tid| socket.inflight(tid));

        if !self.is_done(socket) {
            return false;
        }

        debug!(
            target = ?self.target(),
            visited = self.visited.len(),
            responders = self.responders.len(),
            "Done query"
        );

        for sender in self.senders.drain(..) {
            if let ResponseSender::ClosestNodes(sender) = sender {
                let _ = sender.send(self.closest.nodes().into());
            }
            // Other senders end their receiving iterators by being dropped.
        }

        true
    }
}

fn send_value(sender: &ResponseSender, value: Response) {
    match (sender, value) {
        (ResponseSender::Peers(sender), Response::Peer(peer)) => {
            let _ = sender.send(peer);
        }
        (ResponseSender::Immutable(sender), Response::Immutable(value)) => {
            let _ = sender.send(value);
        }
        (ResponseSender::Mutable(sender), Response::Mutable(item)) => {
            let _ = sender.send(item);
        }
        _ => {}
    }
}
