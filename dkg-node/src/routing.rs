//! Membership-aware Kademlia routing table
//!
//! Peers are positioned by SHA-256 of their id. One physical peer set can
//! serve several logical networks, so membership is filtered before peers
//! are ranked by XOR distance.

use std::{
    cmp::Ordering,
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    sync::Arc,
};

use log::debug;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::types::{BlockchainId, PeerId};

/// 256-bit point in the keyspace.
pub type Position = [u8; 32];

#[must_use]
pub fn position_of(bytes: &[u8]) -> Position {
    Sha256::digest(bytes).into()
}

/// Keyspace position of an operation key (dataset root or keyword).
#[must_use]
pub fn key_position(key: &str) -> Position {
    position_of(key.as_bytes())
}

#[must_use]
pub fn xor_distance(a: &Position, b: &Position) -> Position {
    let mut out = [0u8; 32];
    for (o, (x, y)) in out.iter_mut().zip(a.iter().zip(b.iter())) {
        *o = x ^ y;
    }
    out
}

/// Big-endian comparison of two distances.
#[must_use]
pub fn distance_cmp(a: &Position, b: &Position) -> Ordering {
    a.cmp(b)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub blockchains: BTreeSet<BlockchainId>,
    pub position: Position,
}

impl PeerRecord {
    fn shares_membership(&self, other: &BTreeSet<BlockchainId>) -> bool {
        !self.blockchains.is_disjoint(other)
    }
}

/// Where a peer can be dialled and which protocols it speaks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressEntry {
    pub address: SocketAddr,
    pub protocols: Vec<String>,
}

/// Known reachable addresses.
#[derive(Default)]
pub struct AddressBook {
    entries: RwLock<HashMap<PeerId, AddressEntry>>,
}

impl AddressBook {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, peer: PeerId, address: AddressEntry) {
        self.entries.write().await.insert(peer, address);
    }

    pub async fn remove(&self, peer: &PeerId) -> Option<AddressEntry> {
        self.entries.write().await.remove(peer)
    }

    pub async fn get(&self, peer: &PeerId) -> Option<AddressEntry> {
        self.entries.read().await.get(peer).cloned()
    }

    pub async fn contains(&self, peer: &PeerId) -> bool {
        self.entries.read().await.contains_key(peer)
    }

    /// Reverse lookup used to attribute inbound datagrams.
    pub async fn peer_at(&self, address: SocketAddr) -> Option<PeerId> {
        self.entries
            .read()
            .await
            .iter()
            .find(|(_, entry)| entry.address == address)
            .map(|(peer, _)| peer.clone())
    }
}

/// Peer to membership map shared by every command chain.
pub struct RoutingTable {
    peers: RwLock<HashMap<PeerId, PeerRecord>>,
    address_book: Arc<AddressBook>,
}

impl RoutingTable {
    #[must_use]
    pub fn new(address_book: Arc<AddressBook>) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            address_book,
        }
    }

    #[must_use]
    pub fn address_book(&self) -> &Arc<AddressBook> {
        &self.address_book
    }

    /// Adds one membership. Returns whether anything changed.
    pub async fn add(&self, peer_id: &PeerId, blockchain: &BlockchainId) -> bool {
        let mut peers = self.peers.write().await;
        let record = peers.entry(peer_id.clone()).or_insert_with(|| PeerRecord {
            peer_id: peer_id.clone(),
            blockchains: BTreeSet::new(),
            position: position_of(peer_id.as_str().as_bytes()),
        });
        let inserted = record.blockchains.insert(blockchain.clone());
        if inserted {
            debug!("Routing table: {peer_id} joined {blockchain}");
        }
        inserted
    }

    /// Drops one membership; the peer goes with its last one.
    pub async fn remove(&self, peer_id: &PeerId, blockchain: &BlockchainId) -> bool {
        let mut peers = self.peers.write().await;
        let Some(record) = peers.get_mut(peer_id) else {
            return false;
        };
        let removed = record.blockchains.remove(blockchain);
        if record.blockchains.is_empty() {
            peers.remove(peer_id);
            debug!("Routing table: evicted {peer_id}");
        }
        removed
    }

    pub async fn find(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.read().await.get(peer_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Peers sharing a membership with `reference`, closest first, reference excluded.
    pub async fn closest_peers(&self, reference: &PeerId, count: usize) -> Vec<PeerId> {
        let candidates: Vec<PeerRecord> = {
            let peers = self.peers.read().await;
            let Some(origin) = peers.get(reference) else {
                return Vec::new();
            };
            let origin_position = origin.position;
            let mut candidates: Vec<PeerRecord> = peers
                .values()
                .filter(|p| &p.peer_id != reference && p.shares_membership(&origin.blockchains))
                .cloned()
                .collect();
            sort_by_distance(&mut candidates, &origin_position);
            candidates
        };
        self.reachable(candidates, count).await
    }

    /// Members of `blockchain` closest to `key`, local node included when it is a member.
    pub async fn closest_to_key(
        &self,
        key: &Position,
        blockchain: &BlockchainId,
        count: usize,
    ) -> Vec<PeerId> {
        let candidates: Vec<PeerRecord> = {
            let peers = self.peers.read().await;
            let mut candidates: Vec<PeerRecord> = peers
                .values()
                .filter(|p| p.blockchains.contains(blockchain))
                .cloned()
                .collect();
            sort_by_distance(&mut candidates, key);
            candidates
        };
        self.reachable(candidates, count).await
    }

    async fn reachable(&self, ordered: Vec<PeerRecord>, count: usize) -> Vec<PeerId> {
        let mut out = Vec::with_capacity(count.min(ordered.len()));
        for record in ordered {
            if out.len() == count {
                break;
            }
            if self.address_book.contains(&record.peer_id).await {
                out.push(record.peer_id);
            }
        }
        out
    }
}

/// Ascending XOR distance, peer id breaking ties.
fn sort_by_distance(records: &mut [PeerRecord], target: &Position) {
    records.sort_by(|a, b| {
        distance_cmp(
            &xor_distance(&a.position, target),
            &xor_distance(&b.position, target),
        )
        .then_with(|| a.peer_id.cmp(&b.peer_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> AddressEntry {
        AddressEntry {
            address: SocketAddr::from(([127, 0, 0, 1], port)),
            protocols: vec!["/store/1.0.0".into()],
        }
    }

    /// `chains` is a comma separated membership list.
    async fn table(peers: &[(&str, &str)]) -> RoutingTable {
        let book = Arc::new(AddressBook::new());
        let table = RoutingTable::new(Arc::clone(&book));
        for (i, (peer, chains)) in peers.iter().enumerate() {
            for chain in chains.split(',') {
                table.add(&(*peer).into(), &chain.into()).await;
            }
            book.insert((*peer).into(), addr(9000 + i as u16)).await;
        }
        table
    }

    #[test]
    fn test_xor_distance() {
        let a = [0xffu8; 32];
        let mut b = [0xffu8; 32];
        b[31] = 0xf0;
        let d = xor_distance(&a, &b);
        assert_eq!(d[31], 0x0f);
        assert!(d[..31].iter().all(|&x| x == 0));
        assert_eq!(xor_distance(&a, &a), [0u8; 32]);

        let mut smaller = [0u8; 32];
        let mut larger = [0u8; 32];
        smaller[0] = 1;
        larger[0] = 2;
        assert_eq!(distance_cmp(&smaller, &larger), Ordering::Less);
    }

    #[tokio::test]
    async fn test_add_is_idempotent_and_remove_evicts() {
        let table = table(&[]).await;
        let peer: PeerId = "peer-a".into();
        assert!(table.add(&peer, &"b1".into()).await);
        assert!(!table.add(&peer, &"b1".into()).await);
        assert!(table.add(&peer, &"b2".into()).await);
        let position = table.find(&peer).await.unwrap().position;
        assert_eq!(position, position_of(b"peer-a"));

        assert!(table.remove(&peer, &"b1".into()).await);
        assert!(table.find(&peer).await.is_some());
        assert!(table.remove(&peer, &"b2".into()).await);
        assert!(table.find(&peer).await.is_none());
        assert!(!table.remove(&peer, &"b2".into()).await);
    }

    #[tokio::test]
    async fn test_closest_peers_filters_membership_and_self() {
        let table = table(&[
            ("a", "b1"),
            ("b", "b1"),
            ("c", "b2"),
            ("d", "b1,b2"),
        ])
        .await;

        let from_a = table.closest_peers(&"a".into(), 10).await;
        assert!(!from_a.contains(&"a".into()));
        assert!(!from_a.contains(&"c".into()));
        assert_eq!(from_a.len(), 2);

        let from_c = table.closest_peers(&"c".into(), 10).await;
        assert_eq!(from_c, vec![PeerId::from("d")]);

        assert!(table.closest_peers(&"unknown".into(), 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_closest_skips_unreachable_peers() {
        let table = table(&[("a", "b1"), ("b", "b1")]).await;
        table.add(&"ghost".into(), &"b1".into()).await;
        let found = table
            .closest_to_key(&key_position("root"), &"b1".into(), 10)
            .await;
        assert_eq!(found.len(), 2);
        assert!(!found.contains(&"ghost".into()));
    }

    #[tokio::test]
    async fn test_closest_to_key_is_ordered_and_truncated() {
        let names: Vec<String> = (0..12).map(|i| format!("peer-{i}")).collect();
        let entries: Vec<(&str, &str)> = names.iter().map(|n| (n.as_str(), "b1")).collect();
        let table = table(&entries).await;
        let key = key_position("some-dataset-root");

        let first = table.closest_to_key(&key, &"b1".into(), 5).await;
        assert_eq!(first.len(), 5);
        assert_eq!(first, table.closest_to_key(&key, &"b1".into(), 5).await);

        let distances: Vec<Position> = first
            .iter()
            .map(|p| xor_distance(&position_of(p.as_str().as_bytes()), &key))
            .collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));
    }
}
