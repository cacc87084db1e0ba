use opaldb::core::atomic::messages::{CacheMessage, DhtDeferredAckResponse};
use opaldb::core::cluster::NodeId;
use opaldb::core::errors::OpalDBError;
use opaldb::core::transport::{InMemoryMesh, MeshTransport, Transport};
use opaldb::core::version::CacheVersion;
use std::time::Duration;

fn ack(order: u64) -> CacheMessage {
    CacheMessage::DhtDeferredAck(DhtDeferredAckResponse {
        future_versions: vec![CacheVersion {
            topology_version: 1,
            order,
            node_order: 0,
            data_center_id: 0,
        }],
    })
}

fn ack_order(message: &CacheMessage) -> u64 {
    match message {
        CacheMessage::DhtDeferredAck(ack) => ack.future_versions[0].order,
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn test_send_delivers_with_source_id() {
    let mesh = InMemoryMesh::new();
    let receiver_id = NodeId::random();
    let sender_id = NodeId::random();
    let mut inbox = mesh.register(receiver_id.clone());
    let transport = MeshTransport::new(mesh, sender_id.clone());

    transport.send(&receiver_id, ack(7)).await.expect("send");
    let (source, message) = inbox.recv().await.expect("delivery");
    assert_eq!(source, sender_id);
    assert_eq!(ack_order(&message), 7);
}

#[tokio::test]
async fn test_send_to_unknown_node_is_a_topology_error() {
    let mesh = InMemoryMesh::new();
    let sender = MeshTransport::new(mesh, NodeId::random());

    let err = sender
        .send(&NodeId::random(), ack(1))
        .await
        .expect_err("unknown target must fail");
    assert!(matches!(err, OpalDBError::Topology(_)));
}

#[tokio::test]
async fn test_unregister_stops_delivery() {
    let mesh = InMemoryMesh::new();
    let receiver_id = NodeId::random();
    let _inbox = mesh.register(receiver_id.clone());
    let sender = MeshTransport::new(mesh.clone(), NodeId::random());

    sender.send(&receiver_id, ack(1)).await.expect("send");
    mesh.unregister(&receiver_id);
    let err = sender
        .send(&receiver_id, ack(2))
        .await
        .expect_err("detached target must fail");
    assert!(matches!(err, OpalDBError::Topology(_)));
}

#[tokio::test]
async fn test_send_ordered_preserves_per_topic_order() {
    let mesh = InMemoryMesh::new();
    let receiver_id = NodeId::random();
    let mut inbox = mesh.register(receiver_id.clone());
    let sender = MeshTransport::new(mesh, NodeId::random());

    for i in 0..32u64 {
        sender
            .send_ordered(&receiver_id, "acks", ack(i), Duration::from_secs(1))
            .await
            .expect("ordered send");
    }
    for i in 0..32u64 {
        let (_, message) = inbox.recv().await.expect("delivery");
        assert_eq!(ack_order(&message), i);
    }
}
