//! Fan a put request out to the closest responding nodes.

use std::collections::HashMap;

use flume::Sender;
use tracing::{debug, trace};

use crate::common::{
    ErrorSpecific, Id, Node, PutRequest, PutRequestSpecific, RequestSpecific, RequestTypeSpecific,
};

use super::response::PutResult;
use super::socket::KrpcSocket;

/// Once an [super::query::IterativeQuery] collected the closest nodes that
/// returned a write token, a PutQuery sends them the put request (each with
/// its own token) and tracks acknowledgements and errors.
#[derive(Debug)]
pub(crate) struct PutQuery {
    pub target: Id,
    pub request: PutRequestSpecific,
    /// Nodes that confirmed success.
    stored_at: u8,
    inflight_requests: Vec<u32>,
    started: bool,
    /// Remote errors seen so far, counted per KRPC error code.
    errors: HashMap<i32, (u32, ErrorSpecific)>,
    sender: Option<Sender<PutResult>>,
}

impl PutQuery {
    pub fn new(target: Id, request: PutRequestSpecific, sender: Option<Sender<PutResult>>) -> Self {
        Self {
            target,
            request,
            stored_at: 0,
            inflight_requests: Vec::new(),
            started: false,
            errors: HashMap::new(),
            sender,
        }
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Send the put request to every node holding a usable write token,
    /// injecting each node's own token.
    pub fn start(&mut self, socket: &mut KrpcSocket, requester_id: Id, nodes: &[Node]) {
        debug_assert!(!self.started, "PutQuery already started");
        self.started = true;

        let target = self.target;
        trace!(?target, nodes = nodes.len(), "PutQuery start");

        for node in nodes {
            if let Some(token) = node.token() {
                if !node.valid_token() {
                    continue;
                }

                let tid = socket.request(
                    node.address(),
                    RequestSpecific {
                        requester_id,
                        request_type: RequestTypeSpecific::Put(PutRequest {
                            token,
                            put_request_type: self.request.clone(),
                        }),
                    },
                );

                self.inflight_requests.push(tid);
            }
        }

        if self.inflight_requests.is_empty() {
            self.resolve(Err(PutQueryError::NoClosestNodes.into()));
        }
    }

    pub fn inflight(&self, tid: u32) -> bool {
        self.inflight_requests.contains(&tid)
    }

    pub fn remove_inflight_request(&mut self, tid: u32) -> bool {
        if let Some(index) = self.inflight_requests.iter().position(|&x| x == tid) {
            self.inflight_requests.remove(index);
            return true;
        }

        false
    }

    /// A node acknowledged the put.
    pub fn success(&mut self) {
        debug!(target = ?self.target, "PutQuery got success response");
        self.stored_at = self.stored_at.saturating_add(1);
    }

    /// A node rejected the put with a KRPC error.
    pub fn error(&mut self, error: ErrorSpecific) {
        debug!(target = ?self.target, ?error, "PutQuery got error");

        self.errors
            .entry(error.code)
            .and_modify(|(count, _)| *count += 1)
            .or_insert((1, error));
    }

    /// Returns true when all requests got a response, an error, or timed out,
    /// resolving the host's sender with the outcome.
    pub fn tick(&mut self, socket: &KrpcSocket) -> bool {
        if !self.started {
            return false;
        }

        self.inflight_requests.retain(|tid| socket.inflight(tid));

        if !self.inflight_requests.is_empty() {
            return false;
        }

        if self.stored_at == 0 {
            let error = self
                .most_common_error()
                .unwrap_or(PutError::Query(PutQueryError::Timeout));

            debug!(target = ?self.target, ?error, "PutQuery failed");

            self.resolve(Err(error));
        } else {
            debug!(target = ?self.target, stored_at = self.stored_at, "PutQuery done");

            self.resolve(Ok(self.target));
        }

        true
    }

    /// Reject the host's sender, for example at disposal.
    pub fn reject(&mut self, error: PutError) {
        self.resolve(Err(error));
    }

    // === Private Methods ===

    fn resolve(&mut self, result: PutResult) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(result);
        }
    }

    fn most_common_error(&self) -> Option<PutError> {
        self.errors
            .values()
            .max_by_key(|(count, _)| *count)
            .map(|(_, error)| match error.code {
                301 => PutError::Concurrency(ConcurrencyError::CasFailed),
                302 => PutError::Concurrency(ConcurrencyError::NotMostRecent),
                _ => PutError::Query(PutQueryError::ErrorResponse(error.clone())),
            })
    }
}

#[derive(thiserror::Error, Debug, Clone)]
/// PutQuery errors
pub enum PutError {
    /// Common PutQuery errors
    #[error(transparent)]
    Query(#[from] PutQueryError),

    #[error(transparent)]
    /// PutQuery for mutable items errors
    Concurrency(#[from] ConcurrencyError),
}

#[derive(thiserror::Error, Debug, Clone)]
/// Common PutQuery errors
pub enum PutQueryError {
    /// Failed to find any nodes close to the target that returned a write
    /// token, usually because the routing table failed to bootstrap.
    #[error("Failed to find any nodes to store the value at")]
    NoClosestNodes,

    /// The put was stored nowhere, and the most common response was this error.
    #[error("Remote nodes rejected the put: {} {}", .0.code, .0.description)]
    ErrorResponse(ErrorSpecific),

    /// The put was stored nowhere, with no responses at all.
    #[error("PutQuery timed out with no responses, neither success nor errors")]
    Timeout,

    /// Another put for the same target is already in flight.
    #[error("Another put for the same target is already in flight")]
    ConcurrentPut,

    /// The node is shutting down.
    #[error("Node is disposing")]
    Disposing,
}

#[derive(thiserror::Error, Debug, Clone)]
/// Conflicts between concurrent writers of the same mutable item.
pub enum ConcurrencyError {
    /// The item's `seq` is lower than the sequence already stored at
    /// remote nodes. Read the most recent item before writing again.
    #[error("A more recent value is already stored, read it before writing again")]
    NotMostRecent,

    /// The `cas` condition did not match the `seq` of the stored item.
    #[error("CAS check failed, read the most recent value before writing again")]
    CasFailed,
}
