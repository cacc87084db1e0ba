use bytes::Bytes;
use opaldb::config::{WriteOrderMode, WriteSyncMode};
use opaldb::core::atomic::messages::{
    CacheMessage, DhtDeferredAckResponse, DhtUpdateEntry, DhtUpdateRequest, DhtUpdateResponse,
    Filter, NearUpdateRequest, NearUpdateResponse, Operation, Transform,
};
use opaldb::core::version::CacheVersion;

fn version(order: u64) -> CacheVersion {
    CacheVersion {
        topology_version: 4,
        order,
        node_order: 2,
        data_center_id: 1,
    }
}

fn roundtrip(message: CacheMessage) -> CacheMessage {
    let raw = message.encode().expect("encode");
    CacheMessage::decode(&raw).expect("decode")
}

#[test]
fn test_near_request_roundtrip() {
    let request = NearUpdateRequest {
        future_version: version(9),
        write_version: Some(version(10)),
        topology_version: 4,
        write_sync: WriteSyncMode::PrimarySync,
        atomic_order: WriteOrderMode::Clock,
        operation: Operation::Update,
        keys: vec![b"k1".to_vec(), b"k2".to_vec()],
        values: Some(vec![b"v1".to_vec(), b"v2".to_vec()]),
        transforms: None,
        filter: Some(Filter::NoValue),
        ttl_ms: Some(30_000),
        return_value: false,
        fast_map: true,
        dr_ttls_ms: Some(vec![Some(1), None]),
        dr_expire_times_ms: None,
        dr_versions: Some(vec![None, Some(version(2))]),
    };
    let CacheMessage::NearRequest(decoded) = roundtrip(CacheMessage::NearRequest(request.clone()))
    else {
        panic!("wrong variant");
    };
    assert_eq!(decoded.future_version, request.future_version);
    assert_eq!(decoded.write_version, request.write_version);
    assert_eq!(decoded.keys, request.keys);
    assert_eq!(decoded.values, request.values);
    assert_eq!(decoded.filter, request.filter);
    assert_eq!(decoded.dr_ttls_ms, request.dr_ttls_ms);
    assert_eq!(decoded.dr_versions, request.dr_versions);
    assert_eq!(decoded.write_sync, WriteSyncMode::PrimarySync);
    assert_eq!(decoded.atomic_order, WriteOrderMode::Clock);
}

#[test]
fn test_near_response_roundtrip() {
    let response = NearUpdateResponse {
        future_version: version(1),
        return_value: Some(b"old".to_vec()),
        failed_keys: vec![b"bad".to_vec()],
        errors: vec!["Persistence store failure: disk".to_string()],
        remap_keys: vec![b"moved".to_vec()],
    };
    let CacheMessage::NearResponse(decoded) =
        roundtrip(CacheMessage::NearResponse(response.clone()))
    else {
        panic!("wrong variant");
    };
    assert_eq!(decoded.return_value, response.return_value);
    assert_eq!(decoded.failed_keys, response.failed_keys);
    assert_eq!(decoded.errors, response.errors);
    assert_eq!(decoded.remap_keys, response.remap_keys);
}

#[test]
fn test_dht_request_roundtrip() {
    let request = DhtUpdateRequest {
        future_version: version(7),
        write_version: version(8),
        write_sync: WriteSyncMode::FullSync,
        topology_version: 4,
        ttl_ms: None,
        entries: vec![
            DhtUpdateEntry {
                key: b"k1".to_vec(),
                value: Some(b"v1".to_vec()),
                ttl_ms: Some(500),
                expire_time_ms: None,
                dr_version: None,
            },
            DhtUpdateEntry {
                key: b"k2".to_vec(),
                value: None,
                ttl_ms: None,
                expire_time_ms: Some(123),
                dr_version: Some(version(3)),
            },
        ],
    };
    let CacheMessage::DhtRequest(decoded) = roundtrip(CacheMessage::DhtRequest(request.clone()))
    else {
        panic!("wrong variant");
    };
    assert_eq!(decoded.write_version, request.write_version);
    assert_eq!(decoded.entries.len(), 2);
    assert_eq!(decoded.entries[0].value, Some(b"v1".to_vec()));
    assert_eq!(decoded.entries[1].value, None);
    assert_eq!(decoded.entries[1].dr_version, Some(version(3)));
}

#[test]
fn test_dht_response_and_deferred_ack_roundtrip() {
    let response = DhtUpdateResponse {
        future_version: version(5),
        failed_keys: vec![],
        errors: vec![],
    };
    let CacheMessage::DhtResponse(decoded) =
        roundtrip(CacheMessage::DhtResponse(response.clone()))
    else {
        panic!("wrong variant");
    };
    assert_eq!(decoded.future_version, response.future_version);

    let ack = DhtDeferredAckResponse {
        future_versions: (0..300).map(version).collect(),
    };
    let CacheMessage::DhtDeferredAck(decoded) =
        roundtrip(CacheMessage::DhtDeferredAck(ack.clone()))
    else {
        panic!("wrong variant");
    };
    assert_eq!(decoded.future_versions, ack.future_versions);
}

#[test]
fn test_transform_append_prepend() {
    let current = Bytes::from_static(b"abc");
    assert_eq!(
        Transform::Append(b"def".to_vec()).apply(Some(&current)).unwrap(),
        Some(Bytes::from_static(b"abcdef"))
    );
    assert_eq!(
        Transform::Prepend(b"xy".to_vec()).apply(Some(&current)).unwrap(),
        Some(Bytes::from_static(b"xyabc"))
    );
    assert_eq!(
        Transform::Append(b"def".to_vec()).apply(None).unwrap(),
        Some(Bytes::from_static(b"def"))
    );
}

#[test]
fn test_transform_incr_by() {
    let current = Bytes::from_static(b"41");
    assert_eq!(
        Transform::IncrBy(1).apply(Some(&current)).unwrap(),
        Some(Bytes::from_static(b"42"))
    );
    // A missing value counts as zero.
    assert_eq!(
        Transform::IncrBy(-5).apply(None).unwrap(),
        Some(Bytes::from_static(b"-5"))
    );
    // A non-numeric value fails the key, not the batch.
    assert!(Transform::IncrBy(1)
        .apply(Some(&Bytes::from_static(b"not-a-number")))
        .is_err());
}

#[test]
fn test_transform_remove_if_equals_converts_to_delete() {
    let current = Bytes::from_static(b"target");
    // A None result converts the operation into a delete.
    assert_eq!(
        Transform::RemoveIfEquals(b"target".to_vec())
            .apply(Some(&current))
            .unwrap(),
        None
    );
    assert_eq!(
        Transform::RemoveIfEquals(b"other".to_vec())
            .apply(Some(&current))
            .unwrap(),
        Some(current.clone())
    );
}

#[test]
fn test_filter_semantics() {
    let value = Bytes::from_static(b"v");
    assert!(Filter::Always.matches(None));
    assert!(Filter::Always.matches(Some(&value)));
    assert!(Filter::HasValue.matches(Some(&value)));
    assert!(!Filter::HasValue.matches(None));
    assert!(Filter::NoValue.matches(None));
    assert!(!Filter::NoValue.matches(Some(&value)));
    assert!(Filter::ValueEquals(b"v".to_vec()).matches(Some(&value)));
    assert!(!Filter::ValueEquals(b"w".to_vec()).matches(Some(&value)));
    assert!(!Filter::ValueEquals(b"v".to_vec()).matches(None));
}
