//! Shard lookup with liveness filtering on top of the routing table.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use crate::{
    config::NodeConfig,
    error::Result,
    routing::{key_position, RoutingTable},
    types::{now_ms, BlockchainId, PeerId},
};

/// A resolved shard member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddress {
    pub id: PeerId,
    pub protocols: Vec<String>,
    pub address: SocketAddr,
}

#[async_trait]
pub trait ShardingTableService: Send + Sync {
    /// Members of `blockchain` closest to `key`, optionally without inactive peers.
    async fn find_shard(
        &self,
        blockchain: &BlockchainId,
        key: &str,
        filter_inactive: bool,
    ) -> Result<Vec<PeerId>>;

    async fn find_peer_address_and_protocols(&self, peer: &PeerId) -> Result<Option<PeerAddress>>;

    /// A response arrived from `peer`.
    async fn record_seen(&self, _peer: &PeerId) {}

    /// A request to `peer` failed without a response.
    async fn record_dial_failure(&self, _peer: &PeerId) {}
}

#[derive(Debug, Clone, Copy, Default)]
struct Liveness {
    last_seen: Option<u64>,
    last_failure: Option<u64>,
}

pub struct LocalShardingTable {
    local: PeerId,
    routing: Arc<RoutingTable>,
    liveness: RwLock<HashMap<PeerId, Liveness>>,
    redial_after_ms: u64,
    shard_size: usize,
}

impl LocalShardingTable {
    #[must_use]
    pub fn new(routing: Arc<RoutingTable>, config: &NodeConfig) -> Self {
        Self {
            local: config.peer_id.clone(),
            routing,
            liveness: RwLock::new(HashMap::new()),
            redial_after_ms: config.liveness.redial_after_ms,
            shard_size: config.replication.shard_size,
        }
    }

    #[must_use]
    pub fn routing(&self) -> &Arc<RoutingTable> {
        &self.routing
    }

    pub async fn is_active(&self, peer: &PeerId) -> bool {
        if peer == &self.local {
            return true;
        }
        let Some(entry) = self.liveness.read().await.get(peer).copied() else {
            return true;
        };
        match (entry.last_seen, entry.last_failure) {
            (_, None) => true,
            (Some(seen), Some(failure)) if seen >= failure => true,
            // failed last time; eligible again once the backoff has passed
            (_, Some(failure)) => now_ms().saturating_sub(failure) >= self.redial_after_ms,
        }
    }
}

#[async_trait]
impl ShardingTableService for LocalShardingTable {
    async fn find_shard(
        &self,
        blockchain: &BlockchainId,
        key: &str,
        filter_inactive: bool,
    ) -> Result<Vec<PeerId>> {
        let ordered = self
            .routing
            .closest_to_key(&key_position(key), blockchain, usize::MAX)
            .await;

        let mut shard = Vec::with_capacity(self.shard_size.min(ordered.len()));
        for peer in ordered {
            if shard.len() == self.shard_size {
                break;
            }
            if !filter_inactive || self.is_active(&peer).await {
                shard.push(peer);
            }
        }
        Ok(shard)
    }

    async fn find_peer_address_and_protocols(&self, peer: &PeerId) -> Result<Option<PeerAddress>> {
        Ok(self
            .routing
            .address_book()
            .get(peer)
            .await
            .map(|entry| PeerAddress {
                id: peer.clone(),
                protocols: entry.protocols,
                address: entry.address,
            }))
    }

    async fn record_seen(&self, peer: &PeerId) {
        self.liveness
            .write()
            .await
            .entry(peer.clone())
            .or_default()
            .last_seen = Some(now_ms());
    }

    async fn record_dial_failure(&self, peer: &PeerId) {
        debug!("Dial to {peer} failed");
        self.liveness
            .write()
            .await
            .entry(peer.clone())
            .or_default()
            .last_failure = Some(now_ms());
    }
}
