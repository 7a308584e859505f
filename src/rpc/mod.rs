//! KRPC implementation: a single-threaded actor multiplexing queries over
//! one UDP socket.

mod closest;
pub(crate) mod config;
mod put_query;
mod query;
mod response;
pub(crate) mod server;
mod socket;

use std::collections::HashMap;
use std::net::{SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::num::NonZeroUsize;

use bytes::Bytes;
use flume::Sender;
use lru::LruCache;
use tracing::{debug, error};

use crate::common::{
    validate_immutable, FindNodeRequestArguments, GetMutableResponseArguments,
    GetPeersRequestArguments, GetPeersResponseArguments, GetValueRequestArguments, Id, Message,
    MessageType, MutableItem, Node, NodeSnapshot, PutRequestSpecific, RequestSpecific,
    RequestTypeSpecific, ResponseSpecific, RoutingTable, TableEvent,
};
use crate::{Error, Result};

pub use config::Config;
pub use put_query::{ConcurrencyError, PutError, PutQueryError};
pub use response::{PutResult, Response, ResponseSender};
pub use socket::{DEFAULT_PORT, DEFAULT_REQUEST_TIMEOUT};

use put_query::PutQuery;
use query::IterativeQuery;
use server::Server;
use socket::KrpcSocket;

pub const DEFAULT_BOOTSTRAP_NODES: [&str; 4] = [
    "router.bittorrent.com:6881",
    "dht.transmissionbt.com:6881",
    "dht.libtorrent.org:25401",
    "dht.anacrolix.link:42069",
];

const MAX_CACHED_CLOSEST_NODES: usize = 1000;

/// Internal Rpc called in the Dht thread loop, useful to create your own
/// actor setup.
#[derive(Debug)]
pub struct Rpc {
    id: Id,
    bootstrap: Vec<String>,

    socket: KrpcSocket,

    /// Closest nodes to this node.
    routing_table: RoutingTable,

    /// Active iterative queries, by target.
    queries: HashMap<Id, IterativeQuery>,
    /// Put queries wait for a corresponding get query to collect
    /// token-bearing nodes, then fan out to them.
    put_queries: HashMap<Id, PutQuery>,
    /// One-shot pings awaiting a pong, by transaction id.
    pending_pings: HashMap<u32, Option<Sender<Result<Id>>>>,

    /// Responders of recently finished queries, reused by subsequent puts
    /// to the same target.
    closest_nodes: LruCache<Id, Vec<Node>>,

    server: Server,
}

impl Rpc {
    pub fn new(config: &Config) -> Result<Self, std::io::Error> {
        let id = config.id.unwrap_or_else(|| match config.public_ip {
            Some(ip) => Id::from_ipv4(ip, rand::random()),
            None => Id::random(),
        });

        let socket = KrpcSocket::new(config)?;

        Ok(Rpc {
            id,
            bootstrap: config.bootstrap.clone(),
            socket,
            routing_table: RoutingTable::new(id).with_bucket_size(config.bucket_size),
            queries: HashMap::new(),
            put_queries: HashMap::new(),
            pending_pings: HashMap::new(),
            closest_nodes: LruCache::new(
                NonZeroUsize::new(MAX_CACHED_CLOSEST_NODES).expect("non-zero"),
            ),
            server: Server::new(),
        })
    }

    // === Getters ===

    /// Returns the node's Id.
    pub fn id(&self) -> &Id {
        &self.id
    }

    /// Returns the address the server is listening on.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.socket.local_addr()
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.routing_table
    }

    pub fn routing_table_size(&self) -> usize {
        self.routing_table.size()
    }

    // === Public Methods ===

    /// Ping the bootstrap nodes and look up our own id to populate
    /// the routing table.
    pub fn bootstrap(&mut self) {
        for address in self.bootstrap_addresses() {
            self.ping(address, None);
        }

        self.populate();
    }

    /// Advance the inflight queries, expire abandoned requests, maintain the
    /// routing table, and receive at most one incoming message.
    pub fn tick(&mut self) {
        // === Expire requests that never got a response ===
        for (tid, to) in self.socket.timeouts() {
            self.routing_table.record_no_response(to);

            if let Some(Some(sender)) = self.pending_pings.remove(&tid) {
                let _ = sender.send(Err(Error::Timeout));
            }
        }

        // === Advance put queries ===
        let mut done_put_queries = Vec::new();
        for (target, query) in self.put_queries.iter_mut() {
            if query.started() && query.tick(&self.socket) {
                done_put_queries.push(*target);
            }
        }
        for target in done_put_queries {
            self.put_queries.remove(&target);
        }

        // === Advance iterative queries ===
        let mut done_queries = Vec::new();
        for (target, query) in self.queries.iter_mut() {
            if query.tick(&mut self.socket) {
                done_queries.push(*target);
            }
        }
        for target in done_queries {
            let query = self.queries.remove(&target).expect("done query exists");
            let responders = query.responders().to_vec();

            if let Some(put_query) = self.put_queries.get_mut(&target) {
                if !put_query.started() {
                    put_query.start(&mut self.socket, self.id, &responders);
                }
            }

            if target == self.id {
                let size = self.routing_table.size();
                if size == 0 {
                    error!("Could not bootstrap the routing table");
                } else {
                    debug!(size, "Populated the routing table");
                }
            }

            self.closest_nodes.put(target, responders);
        }

        // === Routing table maintenance ===
        for event in self.routing_table.tick() {
            match event {
                TableEvent::Ping(node) => {
                    self.ping(node.address(), None);
                }
                TableEvent::Refresh(id) => {
                    self.get(
                        id,
                        RequestTypeSpecific::FindNode(FindNodeRequestArguments { target: id }),
                        None,
                    );
                }
            }
        }

        // === Receive a message ===
        if let Some((message, from)) = self.socket.recv_from() {
            match &message.message_type {
                MessageType::Request(request) => {
                    // Read-only nodes can't answer queries, so they don't
                    // belong in the routing table.
                    if !message.read_only {
                        if let Some(id) = message.get_author_id() {
                            self.routing_table.record_query(id, from);
                        }
                    }

                    if !self.socket.read_only {
                        let reply =
                            self.server
                                .handle_request(&self.routing_table, from, request.clone());

                        match reply {
                            MessageType::Response(response) => {
                                self.socket.response(from, &message.transaction_id, response)
                            }
                            MessageType::Error(error) => {
                                self.socket.error(from, &message.transaction_id, error)
                            }
                            MessageType::Request(_) => {}
                        }
                    }
                }
                MessageType::Response(_) => {
                    if let Some(id) = message.get_author_id() {
                        self.routing_table.record_response(id, from);
                    }

                    self.handle_response(from, &message);
                }
                MessageType::Error(_) => {
                    self.handle_error(&message);
                }
            }
        }
    }

    /// Send a single ping, optionally reporting the responder's id
    /// (or a timeout) to `sender`.
    pub fn ping(&mut self, address: SocketAddrV4, sender: Option<Sender<Result<Id>>>) -> u32 {
        let tid = self.socket.request(
            address,
            RequestSpecific {
                requester_id: self.id,
                request_type: RequestTypeSpecific::Ping,
            },
        );

        self.pending_pings.insert(tid, sender);

        tid
    }

    /// Run an iterative query towards `target`.
    ///
    /// While a query for the same target is traversing the network, further
    /// calls just attach their senders to it, receiving all responses seen
    /// so far and any subsequent ones; effectively backing off the network.
    pub fn get(
        &mut self,
        target: Id,
        request: RequestTypeSpecific,
        sender: Option<ResponseSender>,
    ) {
        if let Some(query) = self.queries.get_mut(&target) {
            query.add_sender(sender);
            return;
        }

        let mut query = IterativeQuery::new(
            target,
            RequestSpecific {
                requester_id: self.id,
                request_type: request,
            },
            self.routing_table.bucket_size(),
        );

        query.add_sender(sender);

        // Seed the query with the closest nodes from the routing table, or
        // the bootstrap nodes if we don't know enough nodes yet.
        let closest = self
            .routing_table
            .closest(&target, self.routing_table.bucket_size());

        if closest.len() < self.bootstrap.len() {
            for address in self.bootstrap_addresses() {
                query.visit(&mut self.socket, address);
            }
        }

        for node in closest {
            query.seed(&mut self.socket, node);
        }

        self.queries.insert(target, query);
    }

    /// Store a value (or announce a peer) at the closest nodes to the
    /// request's target, going through a collecting lookup first unless a
    /// recent one already gathered token-bearing nodes.
    pub fn put(&mut self, request: PutRequestSpecific, sender: Option<Sender<PutResult>>) {
        let target = *request.target();

        if self.put_queries.contains_key(&target) {
            if let Some(sender) = sender {
                let _ = sender.send(Err(PutQueryError::ConcurrentPut.into()));
            }
            return;
        }

        let mut query = PutQuery::new(target, request.clone(), sender);

        let cached = self
            .closest_nodes
            .get(&target)
            .filter(|nodes| !nodes.is_empty() && nodes.iter().any(|node| node.valid_token()))
            .cloned();

        if let Some(nodes) = cached {
            query.start(&mut self.socket, self.id, &nodes);
        } else {
            let collect_request = match &request {
                PutRequestSpecific::AnnouncePeer(args) => {
                    RequestTypeSpecific::GetPeers(GetPeersRequestArguments {
                        info_hash: args.info_hash,
                    })
                }
                PutRequestSpecific::PutMutable(args) => {
                    RequestTypeSpecific::GetValue(GetValueRequestArguments {
                        target,
                        seq: None,
                        salt: args.salt.clone(),
                    })
                }
                PutRequestSpecific::PutImmutable(_) => {
                    RequestTypeSpecific::GetValue(GetValueRequestArguments {
                        target,
                        seq: None,
                        salt: None,
                    })
                }
            };

            self.get(target, collect_request, None);
        }

        self.put_queries.insert(target, query);
    }

    /// Peers announced directly to this node for an info_hash, without
    /// touching the network.
    pub fn announced_peers(&mut self, info_hash: &Id) -> Vec<SocketAddrV4> {
        self.server.announced_peers(info_hash)
    }

    /// A value in the local store, without touching the network.
    pub fn get_immutable_local(&mut self, target: &Id) -> Option<Bytes> {
        self.server
            .immutable_value(target)
            .map(|v| Bytes::from(v.to_vec()))
    }

    /// A mutable item in the local store, without touching the network.
    pub fn get_mutable_local(&mut self, target: &Id) -> Option<MutableItem> {
        self.server.mutable_value(target).cloned()
    }

    /// A flat snapshot of the routing table for persisting.
    pub fn snapshot(&self) -> (usize, Id, Vec<NodeSnapshot>) {
        (
            self.routing_table.bucket_size(),
            self.id,
            self.routing_table.to_snapshot(),
        )
    }

    /// Reinsert snapshotted nodes through the normal insert path.
    pub fn load_snapshot(&mut self, nodes: &[NodeSnapshot]) {
        for node in nodes {
            self.routing_table.load(node);
        }
    }

    /// Reject all pending work and empty the routing table.
    pub fn dispose(&mut self) {
        for (_, sender) in self.pending_pings.drain() {
            if let Some(sender) = sender {
                let _ = sender.send(Err(Error::Disposing));
            }
        }

        for (_, mut query) in self.put_queries.drain() {
            query.reject(PutQueryError::Disposing.into());
        }

        // Dropping the queries drops their senders, ending host iterators.
        self.queries.clear();

        self.routing_table.clear();
    }

    // === Private Methods ===

    fn bootstrap_addresses(&self) -> Vec<SocketAddrV4> {
        let mut addresses = Vec::with_capacity(self.bootstrap.len());

        for node in &self.bootstrap {
            if let Ok(resolved) = node.to_socket_addrs() {
                for address in resolved {
                    if let SocketAddr::V4(address) = address {
                        addresses.push(address);
                    }
                }
            }
        }

        addresses
    }

    /// Ping bootstrap nodes and populate the routing table with a lookup
    /// for our own id.
    fn populate(&mut self) {
        let id = self.id;
        debug!(?id, "Bootstrapping the routing table");

        self.get(
            id,
            RequestTypeSpecific::FindNode(FindNodeRequestArguments { target: id }),
            None,
        );
    }

    fn handle_response(&mut self, from: SocketAddrV4, message: &Message) {
        let Some(tid) = socket::parse_tid(&message.transaction_id) else {
            return;
        };

        // One-shot pings.
        if let Some(sender) = self.pending_pings.remove(&tid) {
            if let (Some(sender), Some(id)) = (sender, message.get_author_id()) {
                let _ = sender.send(Ok(id));
            }
            return;
        }

        // A put query's storage request got acknowledged.
        let mut acked_put_query = None;
        for query in self.put_queries.values_mut() {
            if query.remove_inflight_request(tid) {
                acked_put_query = Some(query);
                break;
            }
        }
        if let Some(query) = acked_put_query {
            query.success();
            return;
        }

        let socket = &mut self.socket;

        // An iterative query's request resolved.
        let mut resolved_query = None;
        for query in self.queries.values_mut() {
            if query.remove_inflight_request(tid) {
                resolved_query = Some(query);
                break;
            }
        }
        if let Some(query) = resolved_query {
            if let Some(nodes) = message.get_closer_nodes() {
                for node in nodes {
                    query.add_candidate(socket, node.clone());
                }
            }

            if let Some(responder_id) = message.get_author_id() {
                let mut node = Node::new(responder_id, from);
                if let Some((_, token)) = message.get_token() {
                    node = node.with_token(token.into());
                }
                node.note_response();

                query.add_responding_node(node);
            }

            match &message.message_type {
                MessageType::Response(ResponseSpecific::GetPeers(GetPeersResponseArguments {
                    values,
                    ..
                })) => {
                    for peer in values.clone() {
                        query.response(from, Response::Peer(peer));
                    }
                }
                MessageType::Response(ResponseSpecific::GetImmutable(arguments)) => {
                    if validate_immutable(&arguments.v, query.target()) {
                        query.response(from, Response::Immutable(arguments.v.to_vec().into()));
                        query.finish_early(socket);
                    } else {
                        let target = query.target();
                        debug!(?target, ?from, "Invalid immutable value");
                    }
                }
                MessageType::Response(ResponseSpecific::GetMutable(
                    GetMutableResponseArguments {
                        v, k, seq, sig, ..
                    },
                )) => {
                    let salt = match &query.request.request_type {
                        RequestTypeSpecific::GetValue(args) => args.salt.clone(),
                        _ => None,
                    };

                    match MutableItem::from_dht_message(
                        query.target(),
                        k,
                        Bytes::from(v.to_vec()),
                        *seq,
                        sig,
                        salt.map(|salt| Bytes::from(salt.into_vec())),
                        None,
                    ) {
                        Ok(item) => {
                            query.response(from, Response::Mutable(item));
                            query.finish_early(socket);
                        }
                        Err(error) => {
                            let target = query.target();
                            debug!(?target, ?from, ?error, "Invalid mutable record");
                        }
                    }
                }
                MessageType::Response(ResponseSpecific::NoMoreRecentValue(arguments)) => {
                    debug!(
                        target = ?query.target(),
                        seq = arguments.seq,
                        ?from,
                        "No more recent value"
                    );
                }
                // Ping and FindNode responses were fully handled above.
                _ => {}
            }
        }
    }

    fn handle_error(&mut self, message: &Message) {
        let MessageType::Error(error) = &message.message_type else {
            return;
        };

        let Some(tid) = socket::parse_tid(&message.transaction_id) else {
            return;
        };

        debug!(?error, "Received an error response");

        if let Some(Some(sender)) = self.pending_pings.remove(&tid) {
            let _ = sender.send(Err(Error::RemoteError {
                code: error.code,
                description: error.description.clone(),
            }));
            return;
        }

        let mut errored_put_query = None;
        for query in self.put_queries.values_mut() {
            if query.remove_inflight_request(tid) {
                errored_put_query = Some(query);
                break;
            }
        }
        if let Some(query) = errored_put_query {
            query.error(error.clone());
            return;
        }

        // An iterative query treats an error like a non-response.
        self.queries
            .values_mut()
            .any(|query| query.remove_inflight_request(tid));
    }
}
