//! Two-phase transactions across an in-memory three-node cluster.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{round_robin_affinity, Cluster, MemoryStore};
use holo_grid::transport::{FinishRequest, PrepareRequest, TxEntryMessage, TxOp};
use holo_grid::{CacheConfig, Concurrency, GridError, Isolation, TxOptions, TxState};

fn cluster() -> Cluster {
    Cluster::start(3, CacheConfig::default(), round_robin_affinity(3, 0))
}

fn pessimistic() -> TxOptions {
    TxOptions {
        concurrency: Concurrency::Pessimistic,
        ..TxOptions::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn optimistic_commit_applies_on_every_owner() {
    let cluster = cluster();
    let a = cluster.key_owned_by(1, "a");
    let b = cluster.key_owned_by(2, "b");

    let tx = cluster.node(3).tx_start();
    tx.put(a.clone(), "va".to_string()).await.expect("put a");
    tx.put(b.clone(), "vb".to_string()).await.expect("put b");
    assert_eq!(tx.node_ids(), vec![1, 2, 3]);
    tx.commit().await.expect("commit");

    assert_eq!(tx.state(), TxState::Committed);
    let va = cluster.node(1).dht().peek(&a).expect("peek a");
    let vb = cluster.node(2).dht().peek(&b).expect("peek b");
    assert_eq!(va.as_deref().map(String::as_str), Some("va"));
    assert_eq!(vb.as_deref().map(String::as_str), Some("vb"));
    assert_eq!(cluster.node(1).tm().completion(tx.xid()), Some(true));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn conflicting_prepare_rolls_back_every_node() {
    let cluster = cluster();
    let a = cluster.key_owned_by(1, "a");
    let b = cluster.key_owned_by(2, "b");
    cluster
        .node(3)
        .put(b.clone(), "b0".to_string())
        .await
        .expect("seed b");

    let tx = cluster.node(1).tx_start();
    let seen = tx.get(&b).await.expect("read b");
    assert_eq!(seen.as_deref().map(String::as_str), Some("b0"));
    tx.put(a.clone(), "a1".to_string()).await.expect("put a");
    tx.put(b.clone(), "b1".to_string()).await.expect("put b");

    // A concurrent writer moves b past the version tx observed.
    cluster
        .node(3)
        .put(b.clone(), "b2".to_string())
        .await
        .expect("concurrent put");

    let err = tx.commit().await.expect_err("commit must fail");
    assert!(err.is_optimistic_conflict(), "unexpected error: {err}");
    assert!(matches!(err, GridError::Rollback { .. }));
    assert_eq!(tx.state(), TxState::RolledBack);

    let entry = cluster.node(1).dht().peek_ex(&a).expect("a was locked on node 1");
    assert!(!entry.has_candidates().expect("live entry"));
    assert_eq!(cluster.node(1).dht().peek(&a).expect("peek a"), None);
    let vb = cluster.node(2).dht().peek(&b).expect("peek b");
    assert_eq!(vb.as_deref().map(String::as_str), Some("b2"));
    assert_eq!(cluster.node(2).tm().active_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn read_committed_does_not_validate_reads() {
    let cluster = cluster();
    let b = cluster.key_owned_by(2, "b");
    cluster.node(1).put(b.clone(), "b0".to_string()).await.expect("seed");

    let tx = cluster.node(1).tx_start_with(TxOptions {
        isolation: Isolation::ReadCommitted,
        ..TxOptions::default()
    });
    tx.get(&b).await.expect("read");
    tx.put(b.clone(), "b1".to_string()).await.expect("put");
    cluster.node(3).put(b.clone(), "b2".to_string()).await.expect("concurrent put");
    tx.commit().await.expect("read committed commit");

    let vb = cluster.node(2).dht().peek(&b).expect("peek");
    assert_eq!(vb.as_deref().map(String::as_str), Some("b1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pessimistic_lock_blocks_until_rollback() {
    let cluster = cluster();
    let b = cluster.key_owned_by(2, "b");

    let holder = cluster.node(1).tx_start_with(pessimistic());
    holder.put(b.clone(), "held".to_string()).await.expect("lock b");
    let owner = cluster
        .node(2)
        .dht()
        .peek_ex(&b)
        .expect("entry")
        .owner()
        .expect("live entry")
        .expect("owner");
    assert_eq!(owner.version, holder.xid());

    let waiter = cluster.node(3).tx_start_with(TxOptions {
        timeout: Some(Duration::from_millis(100)),
        ..pessimistic()
    });
    let err = waiter.get(&b).await.expect_err("lock must time out");
    assert!(err.is_timeout(), "unexpected error: {err}");
    assert!(waiter.is_rollback_only());

    holder.rollback().await.expect("rollback");
    assert_eq!(holder.state(), TxState::RolledBack);
    let entry = cluster.node(2).dht().peek_ex(&b).expect("entry");
    assert_eq!(entry.owner().expect("live entry"), None);

    let next = cluster.node(3).tx_start_with(pessimistic());
    next.put(b.clone(), "next".to_string()).await.expect("lock after rollback");
    next.commit().await.expect("commit");
    let vb = cluster.node(2).dht().peek(&b).expect("peek");
    assert_eq!(vb.as_deref().map(String::as_str), Some("next"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pessimistic_read_returns_locked_value() {
    let cluster = cluster();
    let a = cluster.key_owned_by(1, "a");
    cluster.node(2).put(a.clone(), "v1".to_string()).await.expect("seed");

    let tx = cluster.node(3).tx_start_with(pessimistic());
    let value = tx.get(&a).await.expect("locking read");
    assert_eq!(value.as_deref().map(String::as_str), Some("v1"));
    tx.put(a.clone(), "v2".to_string()).await.expect("reentrant write");
    tx.commit().await.expect("commit");
    let va = cluster.node(1).dht().peek(&a).expect("peek");
    assert_eq!(va.as_deref().map(String::as_str), Some("v2"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finish_is_idempotent() {
    let cluster = cluster();
    let a = cluster.key_owned_by(1, "a");
    let tx = cluster.node(2).tx_start();
    tx.put(a, "v".to_string()).await.expect("put");

    assert!(tx.commit_async().ptr_eq(&tx.commit_async()));
    tx.commit().await.expect("commit");
    assert_eq!(tx.finish(true).await, Ok(false));
    assert_eq!(tx.finish(false).await, Ok(false));
    assert_eq!(tx.state(), TxState::Committed);
    assert!(tx.commit_version().is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollback_only_transaction_cannot_commit() {
    let cluster = cluster();
    let a = cluster.key_owned_by(1, "a");
    let tx = cluster.node(2).tx_start();
    tx.put(a.clone(), "v".to_string()).await.expect("put");
    assert!(tx.set_rollback_only());

    let err = tx.commit().await.expect_err("rollback-only commit");
    assert!(matches!(err.root_cause(), GridError::InvalidState(_)), "unexpected error: {err}");
    assert_eq!(tx.state(), TxState::RolledBack);
    assert_eq!(cluster.node(1).dht().peek(&a).expect("peek"), None);
    tx.rollback().await.expect("rollback after failed prepare");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollback_after_prepare_releases_locks() {
    let cluster = cluster();
    let a = cluster.key_owned_by(1, "a");
    let tx = cluster.node(3).tx_start();
    tx.put(a.clone(), "v".to_string()).await.expect("put");
    tx.prepare_async().wait().await.expect("prepare");
    assert_eq!(tx.state(), TxState::Prepared);
    let entry = cluster.node(1).dht().peek_ex(&a).expect("locked entry");
    assert!(entry.is_locked_by(tx.xid()).expect("live entry"));

    tx.rollback().await.expect("rollback");
    assert_eq!(tx.state(), TxState::RolledBack);
    assert!(!entry.has_candidates().expect("live entry"));
    assert_eq!(cluster.node(1).tm().completion(tx.xid()), Some(false));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreachable_participant_rolls_the_transaction_back() {
    let cluster = cluster();
    let b = cluster.key_owned_by(2, "b");
    let c = cluster.key_owned_by(3, "c");
    let tx = cluster.node(1).tx_start();
    tx.put(b, "v".to_string()).await.expect("put b");
    tx.put(c.clone(), "v".to_string()).await.expect("put c");
    cluster.network.set_alive(2, false);

    let err = tx.commit().await.expect_err("commit against a dead node");
    assert!(matches!(err, GridError::Rollback { .. }), "unexpected error: {err}");
    assert!(matches!(err.root_cause(), GridError::Transport(_)), "unexpected error: {err}");
    assert_eq!(tx.state(), TxState::RolledBack);
    assert!(!tx.is_invalidate());

    // The live participant was told to roll back.
    let entry = cluster.node(3).dht().peek_ex(&c);
    assert!(entry.map_or(true, |e| !e.has_candidates().expect("live entry")));
    assert_eq!(cluster.node(3).tm().completion(tx.xid()), Some(false));
    assert_eq!(cluster.node(3).dht().peek(&c).expect("peek"), None);
}

#[tokio::test]
async fn expired_transaction_rejects_operations() {
    let cluster = cluster();
    let a = cluster.key_owned_by(1, "a");
    let tx = cluster.node(1).tx_start_with(TxOptions {
        timeout: Some(Duration::from_millis(1)),
        ..TxOptions::default()
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(tx.timed_out());
    let err = tx.put(a, "v".to_string()).await.expect_err("expired");
    assert!(err.is_timeout());
    assert!(tx.is_rollback_only());
}

#[tokio::test]
async fn mappings_track_touched_nodes() {
    let cluster = cluster();
    let b = cluster.key_owned_by(2, "b");
    let c = cluster.key_owned_by(3, "c");
    let tx = cluster.node(1).tx_start();
    tx.put(b.clone(), "vb".to_string()).await.expect("put b");
    tx.put(c.clone(), "vc".to_string()).await.expect("put c");

    assert_eq!(tx.mapping(&b), Some(2));
    assert_eq!(tx.node_ids(), vec![1, 2, 3]);
    assert!(tx.remove_key_mapping(3, &c));
    assert_eq!(tx.mapping(&c), None);
    assert_eq!(tx.node_ids(), vec![1, 2]);
    assert!(tx.remove_mapping(2).is_some());
    assert_eq!(tx.node_ids(), vec![1]);
    tx.rollback().await.expect("rollback");
    assert_eq!(tx.state(), TxState::RolledBack);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn implicit_operations_round_trip() {
    let cluster = cluster();
    let key = cluster.key_owned_by(2, "k");
    cluster.node(1).put(key.clone(), "v".to_string()).await.expect("put");
    let got = cluster.node(3).get(&key).await.expect("get");
    assert_eq!(got.as_deref().map(String::as_str), Some("v"));

    cluster.node(3).remove(key.clone()).await.expect("remove");
    assert_eq!(cluster.node(1).get(&key).await.expect("get"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commit_replicates_to_backups() {
    let config = CacheConfig {
        backups: 1,
        ..CacheConfig::default()
    };
    let cluster = Cluster::start(3, config, round_robin_affinity(3, 1));
    let key = cluster.key_owned_by(1, "k");
    let owners = cluster.node(1).context().topology.key_owners(&key, None).expect("owners");
    assert_eq!(owners, vec![1, 2]);

    cluster.node(3).put(key.clone(), "v".to_string()).await.expect("put");
    let backup = cluster.node(2).dht().peek(&key).expect("peek backup");
    assert_eq!(backup.as_deref().map(String::as_str), Some("v"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn store_is_read_on_miss_and_written_on_commit() {
    let config = CacheConfig {
        store_enabled: true,
        ..CacheConfig::default()
    };
    let store = Arc::new(MemoryStore::default());
    let cluster = Cluster::start_with_store(3, config, round_robin_affinity(3, 0), Some(store.clone()));
    let loaded = cluster.key_owned_by(2, "loaded");
    store
        .data
        .lock()
        .expect("store lock")
        .insert(loaded.clone(), "from-store".to_string());

    let got = cluster.node(1).get(&loaded).await.expect("get");
    assert_eq!(got.as_deref().map(String::as_str), Some("from-store"));

    let written = cluster.key_owned_by(3, "written");
    cluster.node(1).put(written.clone(), "v".to_string()).await.expect("put");
    let writes = store.writes.lock().expect("store lock").clone();
    assert_eq!(writes, vec![(written, Some("v".to_string()))]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_commit_apply_leaves_outcome_unknown() {
    let config = CacheConfig {
        store_enabled: true,
        ..CacheConfig::default()
    };
    let store = Arc::new(MemoryStore::default());
    let cluster = Cluster::start_with_store(3, config, round_robin_affinity(3, 0), Some(store.clone()));
    let b = cluster.key_owned_by(2, "b");
    store.fail_writes.store(true, Ordering::SeqCst);

    let tx = cluster.node(1).tx_start();
    tx.put(b.clone(), "v".to_string()).await.expect("put");
    let err = tx.commit().await.expect_err("store rejects the write");
    assert!(matches!(err, GridError::Heuristic(_)), "unexpected error: {err}");
    assert_eq!(tx.state(), TxState::Unknown);
    assert!(tx.is_invalidate());

    let entry = cluster.node(2).dht().peek_ex(&b);
    assert!(entry.map_or(true, |e| e.has_candidates().map_or(true, |held| !held)));
    assert_eq!(cluster.node(2).dht().peek(&b).expect("peek"), None);
    assert!(store.writes.lock().expect("store lock").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollback_waits_for_blocked_prepare() {
    let cluster = cluster();
    let b = cluster.key_owned_by(2, "b");
    let holder = cluster.node(1).tx_start_with(pessimistic());
    holder.put(b.clone(), "held".to_string()).await.expect("lock b");

    let tx = cluster.node(3).tx_start();
    tx.put(b.clone(), "queued".to_string()).await.expect("put");
    let prepare = tx.prepare_async();
    let entry = cluster.node(2).dht().peek_ex(&b).expect("entry");
    let watched = entry.clone();
    let queued = common::eventually(Duration::from_secs(2), move || {
        watched.candidates().map(|c| c.len() == 2).unwrap_or(false)
    })
    .await;
    assert!(queued, "prepare never queued behind the holder");

    let rolling = tx.rollback_async();
    holder.rollback().await.expect("holder rollback");
    rolling.wait().await.expect("rollback");
    let _ = prepare.wait().await;

    assert_eq!(tx.state(), TxState::RolledBack);
    assert!(entry.has_candidates().map_or(true, |held| !held));
    assert_eq!(cluster.node(2).tm().completion(tx.xid()), Some(false));
    assert_eq!(cluster.node(2).dht().peek(&b).expect("peek"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn finish_during_blocked_prepare_releases_the_lock() {
    let cluster = cluster();
    let b = cluster.key_owned_by(2, "b");
    let holder = cluster.node(1).tx_start_with(pessimistic());
    holder.put(b.clone(), "held".to_string()).await.expect("lock b");

    let owner = cluster.node(2).clone();
    let ctx = cluster.node(3).context();
    let xid = ctx.versions.next();
    let prepare_req = PrepareRequest {
        near_node: 3,
        xid,
        commit_version: xid,
        thread_id: 1,
        topology_version: ctx.topology.version(),
        concurrency: Concurrency::Optimistic,
        isolation: Isolation::RepeatableRead,
        timeout_ms: 5_000,
        entries: vec![TxEntryMessage {
            key: ctx.encode_key(&b).expect("key"),
            op: TxOp::Update(ctx.encode_value(&"late".to_string()).expect("value")),
            expected_version: None,
        }],
    };
    let preparing = {
        let owner = owner.clone();
        tokio::spawn(async move { owner.handle_prepare(prepare_req).await })
    };
    let entry = owner.dht().peek_ex(&b).expect("entry");
    let watched = entry.clone();
    let queued = common::eventually(Duration::from_secs(2), move || {
        watched.candidates().map(|c| c.len() == 2).unwrap_or(false)
    })
    .await;
    assert!(queued, "prepare never queued behind the holder");

    let finished = owner
        .handle_finish(FinishRequest {
            near_node: 3,
            xid,
            commit: false,
            commit_version: xid,
            topology_version: ctx.topology.version(),
            entries: Vec::new(),
            backup: false,
        })
        .await;
    assert_eq!(finished.error, None);

    holder.rollback().await.expect("holder rollback");
    let resp = preparing.await.expect("prepare task");
    assert!(resp.error.is_some(), "prepare must not outlive its rollback");
    assert!(entry.has_candidates().map_or(true, |held| !held));
    assert_eq!(owner.tm().completion(xid), Some(false));
}
