//! End-to-end scenarios over a swarm of nodes bound to localhost.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::Bytes;
use ed25519_dalek::SigningKey;

use mainstay::{Dht, Id, MutableItem};

const LOCALHOST: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Opt into log output with e.g. `RUST_LOG=mainstay=debug`.
fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// A deterministic id for the `index`th node, spread over the id space.
fn node_id(index: usize) -> Id {
    let mut bytes = [0_u8; 20];
    for (j, byte) in bytes.iter_mut().enumerate() {
        *byte = ((index * 31 + j * 97 + index * j * 13) % 256) as u8;
    }

    Id::from_bytes(bytes).unwrap()
}

/// Twenty nodes seeded with fixed ids, the first one acting as the
/// bootstrap node for the rest.
fn swarm(n: usize) -> Vec<Dht> {
    init_logging();

    let mut nodes: Vec<Dht> = Vec::with_capacity(n);

    let first = Dht::builder()
        .id(node_id(0))
        .host(LOCALHOST)
        .port(0)
        .bootstrap(&[])
        .build()
        .unwrap();

    let bootstrap = [first.local_addr().unwrap()];
    nodes.push(first);

    for index in 1..n {
        nodes.push(
            Dht::builder()
                .id(node_id(index))
                .host(LOCALHOST)
                .port(0)
                .bootstrap(&bootstrap)
                .build()
                .unwrap(),
        );
    }

    // Let every node traverse the network once so routing tables settle.
    for node in &nodes {
        let id = node.id().unwrap();
        node.find_node(id).unwrap();
    }

    nodes
}

fn shutdown(nodes: Vec<Dht>) {
    for node in nodes {
        node.shutdown();
        node.block_until_shutdown();
    }
}

#[test]
fn get_peers_before_any_announcement_is_empty() {
    let nodes = swarm(20);

    let target = Id::from_bytes([7; 20]).unwrap();
    let peers: Vec<SocketAddrV4> = nodes[5].get_peers(target).collect();

    assert!(peers.is_empty());

    shutdown(nodes);
}

#[test]
fn announce_and_get_peers() {
    let nodes = swarm(20);

    let info_hash = Id::from_bytes([42; 20]).unwrap();

    nodes[2].announce_peer(info_hash, Some(1234)).unwrap();
    nodes[14].announce_peer(info_hash, Some(5678)).unwrap();

    let peers: HashSet<SocketAddrV4> = nodes[9].get_peers(info_hash).collect();

    let expected: HashSet<SocketAddrV4> = [
        SocketAddrV4::new(LOCALHOST, 1234),
        SocketAddrV4::new(LOCALHOST, 5678),
    ]
    .into();

    assert_eq!(peers, expected);

    // The peer set is replicated at the closest nodes; a query from any
    // other node sees the same announcements.
    let peers: HashSet<SocketAddrV4> = nodes[17].get_peers(info_hash).collect();
    assert_eq!(peers, expected);

    // Both announcements landed at the eight nodes closest to the
    // info_hash by xor distance, and each of them holds exactly that
    // announcement set; nobody else was asked to store anything.
    let mut by_distance: Vec<usize> = (0..nodes.len()).collect();
    by_distance.sort_by_key(|index| node_id(*index).xor(&info_hash));

    for index in &by_distance[..8] {
        let stored: HashSet<SocketAddrV4> = nodes[*index]
            .announced_peers(info_hash)
            .unwrap()
            .into_iter()
            .collect();

        assert_eq!(stored, expected, "node {index} should store both peers");
    }

    for index in &by_distance[8..] {
        assert!(
            nodes[*index].announced_peers(info_hash).unwrap().is_empty(),
            "node {index} is not among the closest and should store nothing"
        );
    }

    shutdown(nodes);
}

#[test]
fn put_and_get_immutable() {
    let nodes = swarm(20);

    let value = Bytes::from_static(b"test-immutable");
    let target = nodes[3].put_immutable(value.clone()).unwrap();

    // A node that didn't store the value resolves it over the network.
    let found = nodes[17].get_immutable(target).unwrap();

    assert_eq!(found, value);

    shutdown(nodes);
}

#[test]
fn oversize_immutable_value_never_leaves_the_node() {
    let nodes = swarm(3);

    let result = nodes[1].put_immutable(Bytes::from(vec![0_u8; 1001]));

    assert!(matches!(
        result,
        Err(mainstay::Error::ValueTooLarge(1001))
    ));

    shutdown(nodes);
}

#[test]
fn put_and_get_mutable() {
    let nodes = swarm(20);

    let signer = SigningKey::from_bytes(&[56; 32]);
    let public_key = signer.verifying_key().to_bytes();

    let item = MutableItem::new(signer.clone(), Bytes::from_static(b"test-mutable"), 0, None);
    nodes[5].put_mutable(item).unwrap();

    let found = nodes[11].get_mutable(&public_key, None).unwrap();

    assert_eq!(found.value(), &Bytes::from_static(b"test-mutable"));
    assert_eq!(found.seq(), 0);

    // A second write with a higher sequence number wins.
    let item = MutableItem::new(signer, Bytes::from_static(b"v2"), 1, None);
    nodes[5].put_mutable(item).unwrap();

    let found = nodes[16].get_mutable(&public_key, None).unwrap();

    assert_eq!(found.value(), &Bytes::from_static(b"v2"));
    assert_eq!(found.seq(), 1);

    shutdown(nodes);
}

#[test]
fn salted_mutable_items_have_their_own_target() {
    let nodes = swarm(20);

    let signer = SigningKey::from_bytes(&[91; 32]);
    let public_key = signer.verifying_key().to_bytes();
    let salt = Bytes::from_static(b"profile");

    let item = MutableItem::new(
        signer,
        Bytes::from_static(b"salted"),
        0,
        Some(salt.clone()),
    );
    nodes[4].put_mutable(item).unwrap();

    let found = nodes[12].get_mutable(&public_key, Some(salt)).unwrap();
    assert_eq!(found.value(), &Bytes::from_static(b"salted"));

    // The unsalted target holds nothing.
    assert!(nodes[12].get_mutable(&public_key, None).is_none());

    shutdown(nodes);
}

#[test]
fn request_to_a_dead_address_times_out() {
    init_logging();

    let node = Dht::builder()
        .host(LOCALHOST)
        .port(0)
        .bootstrap(&[])
        .build()
        .unwrap();

    // Nothing is listening here; the outbound datagram is silently lost.
    let dead = SocketAddrV4::new(LOCALHOST, 1);

    let error = node.ping(dead).unwrap_err();

    assert_eq!(error.to_string(), "Timeout exceeded");

    node.shutdown();
    node.block_until_shutdown();
}
