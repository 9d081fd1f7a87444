mod common;

use std::{net::SocketAddr, sync::Arc};

use common::{assertion, cluster, member_config, start_member, WAIT};
use dkg_common::MessageType;
use dkg_node::{
    command::CommandData,
    find_shard::select_shard,
    routing::{
        key_position, position_of, xor_distance, AddressBook, AddressEntry, Position, RoutingTable,
    },
    transport::MemoryNetwork,
    types::{dataset_root, ErrorType},
    AssertionRequest, BlockchainId, OperationKind, OperationStatus, PeerId,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const CHAINS: [&str; 3] = ["otp:2043", "gnosis:100", "base:8453"];

async fn random_table(rng: &mut StdRng, peers: usize) -> RoutingTable {
    let book = Arc::new(AddressBook::new());
    let table = RoutingTable::new(Arc::clone(&book));
    for i in 0..peers {
        let peer = PeerId::new(format!("peer-{i}"));
        for chain in CHAINS {
            if rng.random_bool(0.4) {
                table.add(&peer, &chain.into()).await;
            }
        }
        if table.find(&peer).await.is_none() {
            table.add(&peer, &CHAINS[i % CHAINS.len()].into()).await;
        }
        book.insert(
            peer,
            AddressEntry {
                address: SocketAddr::from(([10, 0, 0, 1], 9000)),
                protocols: Vec::new(),
            },
        )
        .await;
    }
    table
}

fn distance(peer: &PeerId, target: &Position) -> Position {
    xor_distance(&position_of(peer.as_str().as_bytes()), target)
}

#[tokio::test]
async fn test_closest_peers_is_deterministic_and_ordered() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for round in 0..10 {
        let table = random_table(&mut rng, 25).await;
        let reference = PeerId::new(format!("peer-{}", round % 25));
        let origin = table.find(&reference).await.unwrap();

        let first = table.closest_peers(&reference, 10).await;
        let second = table.closest_peers(&reference, 10).await;
        assert_eq!(first, second);
        assert!(!first.contains(&reference));

        let distances: Vec<Position> = first
            .iter()
            .map(|p| distance(p, &origin.position))
            .collect();
        assert!(distances.windows(2).all(|w| w[0] <= w[1]));

        for peer in &first {
            let record = table.find(peer).await.unwrap();
            assert!(!record.blockchains.is_disjoint(&origin.blockchains));
        }
    }
}

#[tokio::test]
async fn test_disjoint_memberships_never_see_each_other() {
    let book = Arc::new(AddressBook::new());
    let table = RoutingTable::new(Arc::clone(&book));
    for (peer, chain) in [("left", "otp:2043"), ("right", "gnosis:100")] {
        table.add(&peer.into(), &chain.into()).await;
        book.insert(
            peer.into(),
            AddressEntry {
                address: SocketAddr::from(([10, 0, 0, 1], 9000)),
                protocols: Vec::new(),
            },
        )
        .await;
    }
    assert!(table.closest_peers(&"left".into(), 10).await.is_empty());
    assert!(table.closest_peers(&"right".into(), 10).await.is_empty());
}

#[tokio::test]
async fn test_quorum_gate_over_random_shards() {
    let mut rng = StdRng::seed_from_u64(42);
    for round in 0..12 {
        let remote = rng.random_range(0..=6usize);
        let local_member = rng.random_bool(0.5);
        let min_acks = rng.random_range(1..=7usize);

        let names: Vec<String> = (0..remote).map(|i| format!("r{round}-{i}")).collect();
        let mut members: Vec<(&str, &str)> =
            vec![("local", if local_member { "otp:2043" } else { "gnosis:100" })];
        members.extend(names.iter().map(|n| (n.as_str(), "otp:2043")));

        let network = MemoryNetwork::new();
        for name in &names {
            network.always(name.as_str().into(), MessageType::Ack).await;
        }
        let node = start_member(&network, member_config(&members, 0)).await;

        let id = node
            .publish(AssertionRequest {
                blockchain: "otp:2043".into(),
                assertion: assertion(&format!("round-{round}")),
                min_ack_responses: Some(min_acks),
            })
            .await
            .unwrap();
        let record = node.wait_for(id, WAIT).await.unwrap();

        let found = remote + usize::from(local_member);
        if found < min_acks {
            assert_eq!(record.status, OperationStatus::Failed, "round {round}");
            assert_eq!(record.error_type, Some(ErrorType::FindShardError));
            assert!(record
                .error_message
                .unwrap()
                .starts_with("Unable to find enough nodes"));
            for name in &names {
                assert!(network.sent_to(&name.as_str().into()).await.is_empty());
            }
        } else {
            assert_eq!(record.status, OperationStatus::Completed, "round {round}");
        }
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_five_peer_scenario_includes_local_and_closest_member() {
    let members = [
        ("local", "B"),
        ("peer-b1", "B"),
        ("peer-b2", "B"),
        ("peer-c1", "C"),
        ("peer-c2", "C"),
    ];
    let b_members: Vec<PeerId> = members
        .iter()
        .filter(|(_, chain)| *chain == "B")
        .map(|(id, _)| PeerId::from(*id))
        .collect();

    // pick content whose shard of two contains the local node
    let (content, key, expected) = (0..)
        .find_map(|i| {
            let content = assertion(&format!("scenario-{i}"));
            let key = dataset_root(&content);
            let target = key_position(&key);
            let mut ranked = b_members.clone();
            ranked.sort_by_key(|p| (distance(p, &target), p.clone()));
            (ranked[..2].contains(&"local".into())).then(|| {
                let other = ranked[..2]
                    .iter()
                    .find(|p| p.as_str() != "local")
                    .cloned()
                    .unwrap();
                (content, key, other)
            })
        })
        .unwrap();

    let network = MemoryNetwork::new();
    let mut configs: Vec<_> = (0..members.len()).map(|i| member_config(&members, i)).collect();
    for config in &mut configs {
        config.replication.shard_size = 2;
        config.replication.min_ack_responses = 2;
    }
    let mut nodes = Vec::new();
    for config in configs {
        nodes.push(start_member(&network, config).await);
    }
    let local = &nodes[0];

    let data = CommandData {
        kind: Some(OperationKind::Publish),
        blockchain: Some(BlockchainId::from("B")),
        key: Some(key.clone()),
        ..CommandData::default()
    };
    let ctx = local.context();
    let selection = select_shard(&ctx.sharding, ctx.peer_id(), &data).await.unwrap();
    assert!(selection.local_included);
    assert_eq!(selection.nodes.len(), 1);
    assert_eq!(selection.nodes[0].id, expected);

    let id = local
        .publish(AssertionRequest {
            blockchain: "B".into(),
            assertion: content.clone(),
            min_ack_responses: None,
        })
        .await
        .unwrap();
    let record = local.wait_for(id, WAIT).await.unwrap();
    assert_eq!(record.status, OperationStatus::Completed);

    let chain = BlockchainId::from("B");
    assert!(local.store().assertion_exists(&chain, &key).await.unwrap());
    let remote = nodes.iter().find(|n| n.peer_id() == &expected).unwrap();
    assert!(remote.store().assertion_exists(&chain, &key).await.unwrap());
    for node in &nodes[1..] {
        if node.peer_id() != &expected {
            assert!(network.sent_to(node.peer_id()).await.is_empty());
        }
    }
}

#[tokio::test]
async fn test_cluster_members_agree_on_shard() {
    let network = MemoryNetwork::new();
    let members = [("n1", "B"), ("n2", "B"), ("n3", "B"), ("n4", "B")];
    let nodes = cluster(&network, &members).await;
    let data = CommandData {
        kind: Some(OperationKind::Get),
        blockchain: Some("B".into()),
        key: Some("shared-key".into()),
        ..CommandData::default()
    };

    let mut shards = Vec::new();
    for node in &nodes {
        let shard = node
            .context()
            .sharding
            .find_shard(&"B".into(), "shared-key", true)
            .await
            .unwrap();
        shards.push(shard);
        let selection = select_shard(&node.context().sharding, node.peer_id(), &data)
            .await
            .unwrap();
        assert!(selection.local_included);
        assert_eq!(selection.nodes.len(), 3);
    }
    assert!(shards.windows(2).all(|w| w[0] == w[1]));
}
