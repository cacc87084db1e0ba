mod common;

use bytes::Bytes;
use common::{key_with_primary, raw_entry, test_config, TestCluster};
use opaldb::config::CacheConfig;
use opaldb::core::atomic::messages::Transform;
use opaldb::core::store::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

fn store_config() -> CacheConfig {
    CacheConfig {
        backups: 0,
        store_enabled: true,
        ..test_config()
    }
}

#[tokio::test]
async fn test_batched_write_through_on_put_all() {
    let cluster = TestCluster::new();
    let store = Arc::new(MemoryStore::new());
    let node = cluster.add_node_with_store(store_config(), Some(store.clone()));
    cluster.await_topology(&[&node], 1).await;

    let pairs: Vec<(Bytes, Bytes)> = (0..10)
        .map(|i| (Bytes::from(format!("k{i}")), Bytes::from(format!("v{i}"))))
        .collect();
    let result = node.put_all(pairs.clone()).await.expect("put_all");
    assert!(result.failed.is_empty());

    assert_eq!(store.len(), 10);
    for (key, value) in &pairs {
        assert_eq!(store.get(key).as_ref(), Some(value));
    }
}

#[tokio::test]
async fn test_write_through_remove_all() {
    let cluster = TestCluster::new();
    let store = Arc::new(MemoryStore::new());
    let node = cluster.add_node_with_store(store_config(), Some(store.clone()));
    cluster.await_topology(&[&node], 1).await;

    let keys: Vec<Bytes> = (0..5).map(|i| Bytes::from(format!("k{i}"))).collect();
    let pairs: Vec<(Bytes, Bytes)> = keys
        .iter()
        .map(|k| (k.clone(), Bytes::from_static(b"v")))
        .collect();
    node.put_all(pairs).await.expect("put_all");
    assert_eq!(store.len(), 5);

    let result = node.remove_all(keys.clone()).await.expect("remove_all");
    assert!(result.failed.is_empty());
    assert!(store.is_empty());
    for key in &keys {
        assert_eq!(node.get(key).await.expect("get"), None);
    }
}

#[tokio::test]
async fn test_transform_conversions_split_the_batch() {
    let cluster = TestCluster::new();
    let store = Arc::new(MemoryStore::new());
    let node = cluster.add_node_with_store(store_config(), Some(store.clone()));
    cluster.await_topology(&[&node], 1).await;

    let k1 = Bytes::from_static(b"counter");
    let k2 = Bytes::from_static(b"text");
    let k3 = Bytes::from_static(b"doomed");
    node.put_all(vec![
        (k1.clone(), Bytes::from_static(b"1")),
        (k2.clone(), Bytes::from_static(b"x")),
        (k3.clone(), Bytes::from_static(b"target")),
    ])
    .await
    .expect("seed");

    // Two update conversions followed by a delete conversion: the batched
    // path flushes the update sub-batch before switching to the delete.
    let result = node
        .transform_all(vec![
            (k1.clone(), Transform::IncrBy(1)),
            (k2.clone(), Transform::Append(b"y".to_vec())),
            (k3.clone(), Transform::RemoveIfEquals(b"target".to_vec())),
        ])
        .await
        .expect("transform_all");
    assert!(result.failed.is_empty(), "failed: {:?}", result.failed);

    assert_eq!(node.get(&k1).await.expect("get"), Some(Bytes::from_static(b"2")));
    assert_eq!(node.get(&k2).await.expect("get"), Some(Bytes::from_static(b"xy")));
    assert_eq!(node.get(&k3).await.expect("get"), None);

    assert_eq!(store.get(&k1), Some(Bytes::from_static(b"2")));
    assert_eq!(store.get(&k2), Some(Bytes::from_static(b"xy")));
    assert_eq!(store.get(&k3), None);
}

#[tokio::test]
async fn test_store_failure_fails_keys_and_leaves_entries_untouched() {
    let cluster = TestCluster::new();
    let store = Arc::new(MemoryStore::new());
    let node = cluster.add_node_with_store(store_config(), Some(store.clone()));
    cluster.await_topology(&[&node], 1).await;

    let key = Bytes::from_static(b"durable");
    node.put(key.clone(), Bytes::from_static(b"v1"))
        .await
        .expect("seed put");

    store.set_failing(true);
    let result = node
        .put(key.clone(), Bytes::from_static(b"v2"))
        .await
        .expect("put with failing store");
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].0, key);
    assert!(
        result.failed[0].1.contains("store"),
        "unexpected error: {}",
        result.failed[0].1
    );

    // Write-through runs ahead of the entry update, so the entry kept its
    // old value.
    let (_, value) = raw_entry(&node, &key).await.expect("entry");
    assert_eq!(value, Some(Bytes::from_static(b"v1")));
    assert_eq!(store.get(&key), Some(Bytes::from_static(b"v1")));

    store.set_failing(false);
    let result = node
        .put(key.clone(), Bytes::from_static(b"v2"))
        .await
        .expect("put after recovery");
    assert!(result.failed.is_empty());
    assert_eq!(store.get(&key), Some(Bytes::from_static(b"v2")));
}

#[tokio::test]
async fn test_store_ignored_when_disabled() {
    let cluster = TestCluster::new();
    let store = Arc::new(MemoryStore::new());
    let config = CacheConfig {
        backups: 0,
        store_enabled: false,
        ..test_config()
    };
    let node = cluster.add_node_with_store(config, Some(store.clone()));
    cluster.await_topology(&[&node], 1).await;

    let key = Bytes::from_static(b"ephemeral");
    node.put(key.clone(), Bytes::from_static(b"v"))
        .await
        .expect("put");
    assert_eq!(
        node.get(&key).await.expect("get"),
        Some(Bytes::from_static(b"v"))
    );
    assert!(store.is_empty());
}

#[tokio::test]
async fn test_backup_never_writes_through() {
    let cluster = TestCluster::new();
    let primary_store = Arc::new(MemoryStore::new());
    let backup_store = Arc::new(MemoryStore::new());
    let config = CacheConfig {
        backups: 1,
        store_enabled: true,
        ..test_config()
    };
    let n1 = cluster.add_node_with_store(config.clone(), Some(primary_store.clone()));
    let n2 = cluster.add_node_with_store(config, Some(backup_store.clone()));
    cluster.await_topology(&[&n1, &n2], 2).await;

    let key = key_with_primary(&n1, n1.id(), "primary-only");
    let result = n1
        .put(key.clone(), Bytes::from_static(b"v"))
        .await
        .expect("put");
    assert!(result.failed.is_empty());

    // The store sits behind the primary only; the backup applied the entry
    // but never touched its own store.
    assert_eq!(primary_store.get(&key), Some(Bytes::from_static(b"v")));
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some((_, Some(value))) = raw_entry(&n2, &key).await
                && value == Bytes::from_static(b"v")
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("backup entry must converge");
    assert!(backup_store.is_empty());
}
