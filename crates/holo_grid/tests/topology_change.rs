//! Partition ownership changes between topology versions.

mod common;

use std::sync::Arc;

use common::{Cluster, PARTITIONS};
use holo_grid::{AffinityFunction, CacheConfig, Concurrency, FnAffinity, GridError, TxOptions};

/// Version 1 splits partitions across two nodes; later versions hand
/// everything to node 1.
fn shrinking_affinity() -> Arc<dyn AffinityFunction> {
    Arc::new(FnAffinity::new(PARTITIONS, |partition, version| {
        if version <= 1 {
            vec![u64::from(partition % 2) + 1]
        } else {
            vec![1]
        }
    }))
}

fn cluster() -> Cluster {
    Cluster::start(2, CacheConfig::default(), shrinking_affinity())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_partitions_purge_unlocked_entries() {
    let cluster = cluster();
    let key = cluster.key_owned_by(2, "k");
    cluster.node(2).put(key.clone(), "v".to_string()).await.expect("seed");

    let node = cluster.node(2);
    let topology = &node.context().topology;
    let partition = topology.partition(&key);
    let local = topology.local_partition(partition).expect("owned partition");
    assert!(local.contains(&key));
    assert_eq!(node.dht().size(), 1);

    assert_eq!(node.on_topology_changed(2), 1);
    assert_eq!(topology.version(), 2);
    assert!(!local.is_valid());
    assert!(!topology.is_valid(partition));
    assert!(topology.local_partition(partition).is_none());
    assert_eq!(node.dht().size(), 0);

    // The gaining node has nothing to purge.
    assert_eq!(cluster.node(1).on_topology_changed(2), 0);
    assert_eq!(cluster.node(1).context().topology.local_partitions().len(), PARTITIONS as usize);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lost_partition_rejects_new_dht_entries() {
    let cluster = cluster();
    let key = cluster.key_owned_by(2, "k");
    let node = cluster.node(2);
    node.on_topology_changed(2);

    let err = node.dht().entry_ex(&key).expect_err("partition is gone");
    assert!(matches!(err, GridError::InvalidPartition { .. }), "unexpected error: {err}");

    // Access through the near cache falls back to a near entry.
    let entry = node.near().entry_ex(&key).expect("near entry");
    assert!(entry.partition().is_none());
    assert!(node.near().peek_near_entry(&key).is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn locked_entry_is_purged_when_unlocked() {
    let cluster = cluster();
    let key = cluster.key_owned_by(2, "k");
    let tx = cluster.node(1).tx_start_with(TxOptions {
        concurrency: Concurrency::Pessimistic,
        ..TxOptions::default()
    });
    tx.put(key.clone(), "held".to_string()).await.expect("lock");

    let node = cluster.node(2);
    assert_eq!(node.on_topology_changed(2), 0);
    let entry = node.dht().peek_ex(&key).expect("locked entry survives");
    assert!(!entry.partition_valid());

    tx.rollback().await.expect("rollback");
    assert!(node.dht().peek_ex(&key).is_none());
    assert!(entry.is_obsolete());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_topology_versions_are_ignored() {
    let cluster = cluster();
    let key = cluster.key_owned_by(2, "k");
    cluster.node(2).put(key.clone(), "v".to_string()).await.expect("seed");
    let node = cluster.node(2);

    assert_eq!(node.on_topology_changed(1), 0);
    assert_eq!(node.context().topology.version(), 1);
    assert!(node.dht().peek(&key).expect("peek").is_some());

    assert_eq!(node.on_topology_changed(3), 1);
    assert_eq!(node.on_topology_changed(2), 0);
    assert_eq!(node.context().topology.version(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn writes_follow_the_new_owner() {
    let cluster = cluster();
    let key = cluster.key_owned_by(2, "k");
    for node in &cluster.nodes {
        node.on_topology_changed(2);
    }

    cluster.node(2).put(key.clone(), "moved".to_string()).await.expect("put");

    let value = cluster.node(1).dht().peek(&key).expect("peek");
    assert_eq!(value.as_deref().map(String::as_str), Some("moved"));
    assert_eq!(cluster.node(2).dht().size(), 0);
    let read = cluster.node(2).get(&key).await.expect("get");
    assert_eq!(read.as_deref().map(String::as_str), Some("moved"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn purged_entries_leave_the_lru() {
    let cluster = Cluster::start(
        2,
        CacheConfig {
            dht_max_size: 8,
            ..CacheConfig::default()
        },
        shrinking_affinity(),
    );
    let key = cluster.key_owned_by(2, "k");
    let node = cluster.node(2);
    node.put(key.clone(), "v".to_string()).await.expect("seed");
    let lru = node.dht_lru().expect("dht lru");
    assert_eq!(lru.queue(), vec![key.clone()]);

    assert_eq!(node.on_topology_changed(2), 1);
    assert!(lru.queue().is_empty());
    assert_eq!(lru.current_size(), 0);
}
