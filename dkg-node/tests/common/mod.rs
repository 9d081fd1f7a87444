#![allow(dead_code)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use dkg_node::{
    config::{PeerConfig, PhaseConfig},
    transport::MemoryNetwork,
    BlockchainId, Node, NodeConfig, TransportKind,
};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn chains(list: &str) -> Vec<BlockchainId> {
    list.split(',').map(BlockchainId::from).collect()
}

pub fn address(index: usize) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9100 + u16::try_from(index).unwrap()))
}

/// Config for `members[index]` that knows every other member.
pub fn member_config(members: &[(&str, &str)], index: usize) -> NodeConfig {
    let (id, own) = members[index];
    let mut config = NodeConfig::new(id, chains(own));
    config.bind_addr = address(index);
    config.peers = members
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(i, (peer, peer_chains))| PeerConfig {
            peer_id: (*peer).into(),
            address: address(i),
            blockchains: chains(peer_chains),
        })
        .collect();
    let fast = PhaseConfig {
        timeout_ms: 500,
        retries: 2,
        period_ms: 10,
    };
    config.protocol.init = fast;
    config.protocol.request = fast;
    config
}

pub async fn start_member(network: &Arc<MemoryNetwork>, config: NodeConfig) -> Node {
    let node = Node::new(config, TransportKind::Memory(Arc::clone(network)))
        .await
        .unwrap();
    node.start().await.unwrap();
    node
}

/// One started node per member, all on the same broker.
pub async fn cluster(network: &Arc<MemoryNetwork>, members: &[(&str, &str)]) -> Vec<Node> {
    let mut nodes = Vec::with_capacity(members.len());
    for index in 0..members.len() {
        nodes.push(start_member(network, member_config(members, index)).await);
    }
    nodes
}

pub fn assertion(subject: &str) -> Vec<String> {
    vec![
        format!("<urn:{subject}> <http://schema.org/name> \"{subject}\" ."),
        format!("<urn:{subject}> <http://schema.org/kind> \"asset\" ."),
    ]
}

/// Polls until the node has no cached protocol sessions left.
pub async fn wait_for_idle_sessions(node: &Node) -> usize {
    let transport = &node.context().transport;
    for _ in 0..100 {
        if transport.cached_sessions().await == 0 {
            return 0;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    transport.cached_sessions().await
}
