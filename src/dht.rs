//! Dht node: the host-facing handle running the Rpc actor on its own thread.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use flume::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::common::{
    hash_immutable, AnnouncePeerRequestArguments, FindNodeRequestArguments,
    GetPeersRequestArguments, GetValueRequestArguments, Id, MutableItem, Node, NodeSnapshot,
    PutImmutableRequestArguments, PutMutableRequestArguments, PutRequestSpecific,
    RequestTypeSpecific, MAX_SALT_SIZE, MAX_VALUE_SIZE,
};
use crate::rpc::{Config, PutResult, ResponseSender, Rpc};
use crate::{Error, Result};

#[derive(Debug)]
/// A Mainline DHT node.
///
/// Cheap to clone; all clones speak to the same actor thread.
pub struct Dht {
    handle: Option<JoinHandle<()>>,
    sender: Sender<ActorMessage>,
}

impl Clone for Dht {
    fn clone(&self) -> Self {
        Dht {
            handle: None,
            sender: self.sender.clone(),
        }
    }
}

impl Dht {
    /// Returns a builder to configure a new node.
    pub fn builder() -> DhtBuilder {
        DhtBuilder::default()
    }

    /// Create a new node with default configuration.
    pub fn new() -> Result<Self> {
        Dht::with_config(Config::default())
    }

    /// Create a new node: bind the UDP socket, spawn the actor thread,
    /// ping the bootstrap nodes and look up our own id.
    pub fn with_config(config: Config) -> Result<Self> {
        let mut rpc = Rpc::new(&config)?;
        rpc.bootstrap();

        let (sender, receiver) = flume::unbounded();

        let handle = thread::spawn(move || run(rpc, receiver));

        Ok(Dht {
            handle: Some(handle),
            sender,
        })
    }

    // === Getters ===

    /// Returns the node's Id.
    pub fn id(&self) -> Result<Id> {
        Ok(self.info()?.0)
    }

    /// Returns the address the node is listening on.
    pub fn local_addr(&self) -> Result<SocketAddrV4> {
        Ok(self.info()?.1)
    }

    /// Returns the number of nodes in the routing table.
    pub fn routing_table_size(&self) -> Result<usize> {
        Ok(self.info()?.2)
    }

    // === Public Methods ===

    /// Shut the node down: reject all pending work, empty the routing table
    /// and close the socket.
    pub fn shutdown(&self) {
        let _ = self.sender.send(ActorMessage::Shutdown);
    }

    /// Block until the actor thread exits after [Dht::shutdown].
    pub fn block_until_shutdown(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    /// Ping a node, returning its Id.
    pub fn ping(&self, address: SocketAddrV4) -> Result<Id> {
        let (sender, receiver) = flume::bounded(1);

        self.send(ActorMessage::Ping(address, sender))?;

        receiver.recv().map_err(|_| Error::Disposing)?
    }

    /// Find the closest nodes to `target` in the whole network.
    pub fn find_node(&self, target: Id) -> Result<Box<[Node]>> {
        let (sender, receiver) = flume::bounded(1);

        self.send(ActorMessage::FindNode(target, sender))?;

        receiver.recv().map_err(|_| Error::Disposing)
    }

    /// The closest nodes to `target` in the local routing table.
    pub fn closest_nodes(&self, target: Id, n: Option<usize>) -> Result<Vec<Node>> {
        let (sender, receiver) = flume::bounded(1);

        self.send(ActorMessage::ClosestNodes(target, n, sender))?;

        receiver.recv().map_err(|_| Error::Disposing)
    }

    /// Returns an iterator over peers announced for this info_hash, as
    /// they are discovered.
    pub fn get_peers(&self, info_hash: Id) -> GetPeersResponse {
        let (sender, receiver) = flume::unbounded();

        let _ = self.send(ActorMessage::GetPeers(info_hash, sender));

        GetPeersResponse { receiver }
    }

    /// The peers announced directly to this node for `info_hash`.
    ///
    /// Unlike [Dht::get_peers] this never queries the network; it inspects
    /// what this node stores on behalf of announcers.
    pub fn announced_peers(&self, info_hash: Id) -> Result<Vec<SocketAddrV4>> {
        let (sender, receiver) = flume::bounded(1);

        self.send(ActorMessage::AnnouncedPeers(info_hash, sender))?;

        receiver.recv().map_err(|_| Error::Disposing)
    }

    /// Announce that this node is a peer for `info_hash`, to the closest
    /// nodes in the network.
    ///
    /// With no explicit `port`, receivers use the source port of our
    /// datagrams (`implied_port`).
    pub fn announce_peer(&self, info_hash: Id, port: Option<u16>) -> Result<Id> {
        let (sender, receiver) = flume::bounded(1);

        self.send(ActorMessage::AnnouncePeer(info_hash, port, sender))?;

        Ok(receiver.recv().map_err(|_| Error::Disposing)??)
    }

    /// Get an immutable value by its target (the SHA-1 of its bencoded form).
    ///
    /// Consults the local store first, then the network.
    pub fn get_immutable(&self, target: Id) -> Option<Bytes> {
        let (sender, receiver) = flume::bounded(1);

        self.send(ActorMessage::GetImmutable(target, sender)).ok()?;

        receiver.recv().ok()
    }

    /// Store an immutable value at the closest nodes to its target,
    /// returning that target.
    pub fn put_immutable(&self, value: Bytes) -> Result<Id> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge(value.len()));
        }

        let (sender, receiver) = flume::bounded(1);

        self.send(ActorMessage::PutImmutable(value, sender))?;

        Ok(receiver.recv().map_err(|_| Error::Disposing)??)
    }

    /// Get the mutable item published under a public key and optional salt.
    ///
    /// Consults the local store first, then the network.
    pub fn get_mutable(&self, public_key: &[u8; 32], salt: Option<Bytes>) -> Option<MutableItem> {
        let target = MutableItem::target_from_key(public_key, &salt);

        let (sender, receiver) = flume::bounded(1);

        self.send(ActorMessage::GetMutable(target, salt, sender)).ok()?;

        receiver.recv().ok()
    }

    /// Store a signed mutable item at the closest nodes to its target.
    pub fn put_mutable(&self, item: MutableItem) -> Result<Id> {
        if item.value().len() > MAX_VALUE_SIZE {
            return Err(Error::ValueTooLarge(item.value().len()));
        }
        if let Some(salt) = item.salt() {
            if salt.len() > MAX_SALT_SIZE {
                return Err(Error::SaltTooLarge(salt.len()));
            }
        }

        let (sender, receiver) = flume::bounded(1);

        self.send(ActorMessage::PutMutable(item, sender))?;

        Ok(receiver.recv().map_err(|_| Error::Disposing)??)
    }

    /// Persist the routing table to a JSON file at `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let (sender, receiver) = flume::bounded(1);

        self.send(ActorMessage::Snapshot(sender))?;

        let (k, id, nodes) = receiver.recv().map_err(|_| Error::Disposing)?;

        let state = PersistentState {
            k,
            id: id.to_string(),
            nodes,
        };

        std::fs::write(path, serde_json::to_vec_pretty(&state)?)?;

        Ok(())
    }

    /// Load a routing table previously saved with [Dht::save], reinserting
    /// its nodes through the normal insert path.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = std::fs::read(path)?;
        let state: PersistentState = serde_json::from_slice(&bytes)?;

        info!(nodes = state.nodes.len(), "Loading persisted routing table");

        self.send(ActorMessage::LoadSnapshot(state.nodes))
    }

    // === Private Methods ===

    fn send(&self, message: ActorMessage) -> Result<()> {
        self.sender.send(message).map_err(|_| Error::Disposing)
    }

    fn info(&self) -> Result<(Id, SocketAddrV4, usize)> {
        let (sender, receiver) = flume::bounded(1);

        self.send(ActorMessage::Info(sender))?;

        receiver.recv().map_err(|_| Error::Disposing)
    }
}

/// Configure and build a [Dht] node.
#[derive(Debug, Default, Clone)]
pub struct DhtBuilder(Config);

impl DhtBuilder {
    /// Set an explicit node Id.
    pub fn id(mut self, id: Id) -> Self {
        self.0.id = Some(id);
        self
    }

    /// Override the default bootstrap nodes.
    pub fn bootstrap(mut self, bootstrap: &[SocketAddrV4]) -> Self {
        self.0.bootstrap = bootstrap.iter().map(|addr| addr.to_string()).collect();
        self
    }

    /// Bind to a specific address.
    pub fn host(mut self, host: Ipv4Addr) -> Self {
        self.0.host = Some(host);
        self
    }

    /// Listen on a specific port.
    pub fn port(mut self, port: u16) -> Self {
        self.0.port = Some(port);
        self
    }

    /// Set the request timeout. Zero disables timeouts.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.0.request_timeout = timeout;
        self
    }

    /// Set the routing table bucket size (K).
    pub fn bucket_size(mut self, k: usize) -> Self {
        self.0.bucket_size = k;
        self
    }

    /// Don't respond to queries, and ask not to be added to routing tables.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.0.read_only = read_only;
        self
    }

    /// Derive a secure node Id from this public IPv4 address (BEP_0042).
    pub fn public_ip(mut self, ip: Ipv4Addr) -> Self {
        self.0.public_ip = Some(ip);
        self
    }

    pub fn build(self) -> Result<Dht> {
        Dht::with_config(self.0)
    }
}

/// An iterator over peers discovered by [Dht::get_peers].
///
/// Ends when the query has drained the closest nodes to the info_hash.
pub struct GetPeersResponse {
    receiver: Receiver<SocketAddrV4>,
}

impl Iterator for GetPeersResponse {
    type Item = SocketAddrV4;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}

/// The JSON document persisted by [Dht::save].
#[derive(Debug, Serialize, Deserialize)]
struct PersistentState {
    k: usize,
    id: String,
    nodes: Vec<NodeSnapshot>,
}

enum ActorMessage {
    Shutdown,
    Info(Sender<(Id, SocketAddrV4, usize)>),
    Ping(SocketAddrV4, Sender<Result<Id>>),
    FindNode(Id, Sender<Box<[Node]>>),
    ClosestNodes(Id, Option<usize>, Sender<Vec<Node>>),
    GetPeers(Id, Sender<SocketAddrV4>),
    AnnouncedPeers(Id, Sender<Vec<SocketAddrV4>>),
    AnnouncePeer(Id, Option<u16>, Sender<PutResult>),
    GetImmutable(Id, Sender<Bytes>),
    PutImmutable(Bytes, Sender<PutResult>),
    GetMutable(Id, Option<Bytes>, Sender<MutableItem>),
    PutMutable(MutableItem, Sender<PutResult>),
    Snapshot(Sender<(usize, Id, Vec<NodeSnapshot>)>),
    LoadSnapshot(Vec<NodeSnapshot>),
}

fn run(mut rpc: Rpc, receiver: Receiver<ActorMessage>) {
    loop {
        if let Ok(message) = receiver.try_recv() {
            match message {
                ActorMessage::Shutdown => {
                    rpc.dispose();
                    break;
                }
                ActorMessage::Info(sender) => {
                    let _ = sender.send((*rpc.id(), rpc.local_addr(), rpc.routing_table_size()));
                }
                ActorMessage::Ping(address, sender) => {
                    rpc.ping(address, Some(sender));
                }
                ActorMessage::FindNode(target, sender) => {
                    rpc.get(
                        target,
                        RequestTypeSpecific::FindNode(FindNodeRequestArguments { target }),
                        Some(ResponseSender::ClosestNodes(sender)),
                    );
                }
                ActorMessage::ClosestNodes(target, n, sender) => {
                    let n = n.unwrap_or(crate::common::DEFAULT_CLOSEST_COUNT);
                    let _ = sender.send(rpc.routing_table().closest(&target, n));
                }
                ActorMessage::GetPeers(info_hash, sender) => {
                    rpc.get(
                        info_hash,
                        RequestTypeSpecific::GetPeers(GetPeersRequestArguments { info_hash }),
                        Some(ResponseSender::Peers(sender)),
                    );
                }
                ActorMessage::AnnouncedPeers(info_hash, sender) => {
                    let _ = sender.send(rpc.announced_peers(&info_hash));
                }
                ActorMessage::AnnouncePeer(info_hash, port, sender) => {
                    let (port, implied_port) = match port {
                        Some(port) => (port, None),
                        None => (0, Some(true)),
                    };

                    rpc.put(
                        PutRequestSpecific::AnnouncePeer(AnnouncePeerRequestArguments {
                            info_hash,
                            port,
                            implied_port,
                        }),
                        Some(sender),
                    );
                }
                ActorMessage::GetImmutable(target, sender) => {
                    if let Some(value) = rpc.get_immutable_local(&target) {
                        let _ = sender.send(value);
                        continue;
                    }

                    rpc.get(
                        target,
                        RequestTypeSpecific::GetValue(GetValueRequestArguments {
                            target,
                            seq: None,
                            salt: None,
                        }),
                        Some(ResponseSender::Immutable(sender)),
                    );
                }
                ActorMessage::PutImmutable(value, sender) => {
                    let target = Id::from_bytes(hash_immutable(&value))
                        .expect("hash_immutable returns 20 bytes");

                    rpc.put(
                        PutRequestSpecific::PutImmutable(PutImmutableRequestArguments {
                            target,
                            v: value.to_vec().into(),
                        }),
                        Some(sender),
                    );
                }
                ActorMessage::GetMutable(target, salt, sender) => {
                    if let Some(item) = rpc.get_mutable_local(&target) {
                        let _ = sender.send(item);
                        continue;
                    }

                    rpc.get(
                        target,
                        RequestTypeSpecific::GetValue(GetValueRequestArguments {
                            target,
                            seq: None,
                            salt: salt.map(|salt| salt.to_vec().into()),
                        }),
                        Some(ResponseSender::Mutable(sender)),
                    );
                }
                ActorMessage::PutMutable(item, sender) => {
                    rpc.put(
                        PutRequestSpecific::PutMutable(PutMutableRequestArguments {
                            target: *item.target(),
                            v: item.value().to_vec().into(),
                            k: *item.key(),
                            seq: item.seq(),
                            sig: *item.signature(),
                            salt: item.salt().as_ref().map(|salt| salt.to_vec().into()),
                            cas: item.cas(),
                        }),
                        Some(sender),
                    );
                }
                ActorMessage::Snapshot(sender) => {
                    let _ = sender.send(rpc.snapshot());
                }
                ActorMessage::LoadSnapshot(nodes) => {
                    rpc.load_snapshot(&nodes);
                }
            }
        }

        rpc.tick();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shutdown() {
        let dht = Dht::builder()
            .host([127, 0, 0, 1].into())
            .port(0)
            .bootstrap(&[])
            .build()
            .unwrap();

        let clone = dht.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));

            clone.shutdown();
        });

        dht.block_until_shutdown();
    }

    #[test]
    fn save_and_load_state() {
        let dir = std::env::temp_dir().join("mainstay-state-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        let dht = Dht::builder()
            .host([127, 0, 0, 1].into())
            .port(0)
            .bootstrap(&[])
            .build()
            .unwrap();

        dht.save(&path).unwrap();

        let loaded = Dht::builder()
            .host([127, 0, 0, 1].into())
            .port(0)
            .bootstrap(&[])
            .build()
            .unwrap();

        loaded.load(&path).unwrap();

        dht.shutdown();
        loaded.shutdown();

        std::fs::remove_file(path).unwrap();
    }
}
