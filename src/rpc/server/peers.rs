//! Manage announced peers for info_hashes.

use std::net::SocketAddrV4;
use std::num::NonZeroUsize;

use lru::LruCache;
use rand::seq::SliceRandom;

use crate::common::Id;

/// Default maximum number of info_hashes for which to store peers.
pub const MAX_INFO_HASHES: usize = 2000;
/// Default maximum number of peers to store per info_hash.
pub const MAX_PEERS_PER_INFO_HASH: usize = 500;

/// How many peers a single get_peers response carries at most.
const RESPONSE_PEERS: usize = 20;

/// An LRU cache of announced peers per info_hash.
///
/// The announcement set is deduplicated by peer address.
#[derive(Debug)]
pub struct PeersStore {
    info_hashes: LruCache<Id, LruCache<SocketAddrV4, ()>>,
    max_peers: NonZeroUsize,
}

impl PeersStore {
    pub fn new(max_info_hashes: NonZeroUsize, max_peers: NonZeroUsize) -> Self {
        Self {
            info_hashes: LruCache::new(max_info_hashes),
            max_peers,
        }
    }

    /// Add an announced peer for an info_hash.
    pub fn add_peer(&mut self, info_hash: Id, peer: SocketAddrV4) {
        if let Some(peers) = self.info_hashes.get_mut(&info_hash) {
            peers.put(peer, ());
        } else {
            let mut peers = LruCache::new(self.max_peers);
            peers.put(peer, ());
            self.info_hashes.put(info_hash, peers);
        }
    }

    /// Returns the announced peers for an info_hash, a uniform random
    /// sample of [RESPONSE_PEERS] when more are known.
    pub fn get_random_peers(&mut self, info_hash: &Id) -> Option<Vec<SocketAddrV4>> {
        let peers = self.info_hashes.get(info_hash)?;

        if peers.is_empty() {
            return None;
        }

        let addresses: Vec<SocketAddrV4> = peers.iter().map(|(address, _)| *address).collect();

        if addresses.len() <= RESPONSE_PEERS {
            return Some(addresses);
        }

        let mut rng = rand::thread_rng();

        Some(
            addresses
                .choose_multiple(&mut rng, RESPONSE_PEERS)
                .copied()
                .collect(),
        )
    }
}

impl Default for PeersStore {
    fn default() -> Self {
        Self::new(
            NonZeroUsize::new(MAX_INFO_HASHES).expect("MAX_INFO_HASHES is non-zero"),
            NonZeroUsize::new(MAX_PEERS_PER_INFO_HASH).expect("MAX_PEERS_PER_INFO_HASH is non-zero"),
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn max_info_hashes() {
        let mut store = PeersStore::new(
            NonZeroUsize::new(1).unwrap(),
            NonZeroUsize::new(100).unwrap(),
        );

        let info_hash_a = Id::random();
        let info_hash_b = Id::random();

        store.add_peer(info_hash_a, SocketAddrV4::new([127, 0, 1, 1].into(), 0));
        store.add_peer(info_hash_b, SocketAddrV4::new([127, 0, 1, 1].into(), 0));

        assert_eq!(store.info_hashes.len(), 1);
        assert_eq!(
            store.get_random_peers(&info_hash_b),
            Some(vec![SocketAddrV4::new([127, 0, 1, 1].into(), 0)])
        );
    }

    #[test]
    fn peers_are_deduplicated() {
        let mut store = PeersStore::default();

        let info_hash = Id::random();
        let peer = SocketAddrV4::new([127, 0, 1, 1].into(), 1234);

        store.add_peer(info_hash, peer);
        store.add_peer(info_hash, peer);

        assert_eq!(store.get_random_peers(&info_hash), Some(vec![peer]));
    }

    #[test]
    fn all_peers_when_few() {
        let mut store = PeersStore::default();

        let info_hash = Id::random();

        store.add_peer(info_hash, SocketAddrV4::new([127, 0, 1, 1].into(), 1234));
        store.add_peer(info_hash, SocketAddrV4::new([127, 0, 1, 2].into(), 5678));

        let mut peers = store.get_random_peers(&info_hash).unwrap();
        peers.sort();

        assert_eq!(
            peers,
            vec![
                SocketAddrV4::new([127, 0, 1, 1].into(), 1234),
                SocketAddrV4::new([127, 0, 1, 2].into(), 5678),
            ]
        );
    }

    #[test]
    fn random_peers_subset() {
        let mut store = PeersStore::default();

        let info_hash = Id::random();

        for i in 0..200 {
            store.add_peer(
                info_hash,
                SocketAddrV4::new([127, 0, 1, i].into(), 1000 + i as u16),
            );
        }

        let sample = store.get_random_peers(&info_hash).unwrap();

        assert_eq!(sample.len(), 20);

        // Sampled without replacement.
        let mut deduped = sample.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), 20);
    }
}
