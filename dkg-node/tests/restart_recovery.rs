mod common;

use std::time::Duration;

use common::{assertion, member_config, start_member, WAIT};
use dkg_common::MessageType;
use dkg_node::{
    operation::{OperationPhase, OperationResult},
    transport::MemoryNetwork,
    types::dataset_root,
    AssertionRequest, OperationKind, OperationStatus,
};

#[tokio::test]
async fn test_publish_interrupted_during_init_finishes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let network = MemoryNetwork::new();
    network.script("remote".into(), |_| None).await;
    let members = [("local", "B"), ("remote", "B")];
    let config = || {
        let mut config = member_config(&members, 0);
        config.data_dir = Some(dir.path().to_path_buf());
        config
    };

    let content = assertion("restarted");
    let key = dataset_root(&content);
    let id = {
        let node = start_member(&network, config()).await;
        let id = node
            .publish(AssertionRequest {
                blockchain: "B".into(),
                assertion: content,
                min_ack_responses: Some(2),
            })
            .await
            .unwrap();
        let init_start = OperationStatus::Phase(OperationKind::Publish, OperationPhase::InitStart);
        let mut reached = false;
        for _ in 0..200 {
            if node.operations().get(id).await.map(|r| r.status) == Some(init_start) {
                reached = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(reached, "publish never reached {init_start}");
        node.shutdown().await;
        id
    };

    network.always("remote".into(), MessageType::Ack).await;
    let node = start_member(&network, config()).await;
    let restored = node.operations().get(id).await;
    assert!(restored.is_some(), "operation {id} was lost on restart");

    let record = node.wait_for(id, WAIT).await.unwrap();
    assert_eq!(record.status, OperationStatus::Completed);
    assert!(matches!(record.result, Some(OperationResult::Replicated { key: ref k }) if *k == key));
    let sent = network.sent_to(&"remote".into()).await;
    assert!(sent
        .iter()
        .any(|m| m.message_type() == Ok(MessageType::ProtocolRequest)));
}
