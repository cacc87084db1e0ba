use bytes::Bytes;
use opaldb::core::storage::{CacheData, EntryOp, TombstoneQueue};
use opaldb::core::version::{CacheVersion, OrderWinsResolver};
use std::time::Duration;

fn data() -> CacheData {
    let (queue, _rx) = TombstoneQueue::new();
    CacheData::new(16, queue)
}

fn version(order: u64) -> CacheVersion {
    CacheVersion {
        topology_version: 1,
        order,
        node_order: 0,
        data_center_id: 0,
    }
}

#[tokio::test]
async fn test_lock_entries_in_request_order() {
    let data = data();
    let keys: Vec<Bytes> = (0..8).map(|i| Bytes::from(format!("k{i}"))).collect();
    let locked = data.lock_entries(&keys, 4).await.expect("lock batch");
    assert_eq!(locked.len(), keys.len());
    for (le, key) in locked.iter().zip(keys.iter()) {
        assert_eq!(&le.entry.key, key);
    }
}

#[tokio::test]
async fn test_single_key_fast_path() {
    let data = data();
    let key = Bytes::from_static(b"solo");
    let locked = data.lock_entries(std::slice::from_ref(&key), 4).await.expect("lock");
    assert_eq!(locked.len(), 1);
    assert_eq!(locked[0].entry.key, key);
}

#[tokio::test]
async fn test_obsolete_entry_restarts_acquisition_with_fresh_entry() {
    let data = data();
    let key = Bytes::from_static(b"reborn");

    // Make the resident entry obsolete, as the deferred-delete collector
    // would.
    let stale = data.partition_for_key(&key).resolve_or_create(&key);
    stale.state().lock_owned().await.mark_obsolete();

    // Locking must observe the obsolete entry, replace it, and hand back a
    // live one.
    let locked = data.lock_entry(&key, 4).await.expect("lock");
    assert!(!locked.guard.is_obsolete());
    let fresh = data.partition_for_key(&key).peek(&key).expect("resident");
    assert!(!std::ptr::eq(fresh.as_ref(), stale.as_ref()));
}

#[tokio::test]
async fn test_contended_lock_waits_for_release() {
    let data = std::sync::Arc::new(data());
    let key = Bytes::from_static(b"contended");

    let held = data.lock_entry(&key, 4).await.expect("first lock");

    let data2 = data.clone();
    let key2 = key.clone();
    let waiter = tokio::spawn(async move {
        data2.lock_entry(&key2, 4).await.expect("second lock")
    });

    // The waiter cannot make progress while the guard is held.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    data.release(vec![held]);
    let locked = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter must finish")
        .expect("join");
    assert_eq!(locked.entry.key, key);
}

#[tokio::test]
async fn test_batch_lock_serializes_writers() {
    let data = std::sync::Arc::new(data());
    let keys: Vec<Bytes> = (0..4).map(|i| Bytes::from(format!("b{i}"))).collect();

    let mut locked = data.lock_entries(&keys, 4).await.expect("lock batch");
    for (i, le) in locked.iter_mut().enumerate() {
        le.guard.apply(
            &EntryOp::Update(Bytes::from(format!("v{i}"))),
            version(i as u64 + 1),
            None,
            false,
            &OrderWinsResolver,
        );
    }
    data.release(locked);

    // The same keys, locked again in the same canonical order, observe the
    // writes.
    let second = data.lock_entries(&keys, 4).await.expect("relock");
    for (i, le) in second.iter().enumerate() {
        assert_eq!(le.guard.raw_value(), Some(&Bytes::from(format!("v{i}"))));
    }
}

#[tokio::test]
async fn test_tombstone_collection_requires_matching_version() {
    let data = data();
    let key = Bytes::from_static(b"gone");
    let store = data.partition_for_key(&key);

    let mut locked = data.lock_entry(&key, 4).await.expect("lock");
    locked
        .guard
        .apply(&EntryOp::Delete, version(3), None, false, &OrderWinsResolver);
    let partition = locked.entry.partition;
    data.release(vec![locked]);

    // A mismatched version must not collect the tombstone.
    assert!(!store.collect_tombstone(&key, &version(2)).await);
    assert!(store.peek(&key).is_some());

    // The matching version collects it and removes the resident entry.
    assert!(store.collect_tombstone(&key, &version(3)).await);
    assert!(store.peek(&key).is_none());
    assert_eq!(partition, store.id);
}
