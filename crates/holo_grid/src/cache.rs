//! Node-level cache facade: wiring, client entry points and the handlers
//! for requests arriving from other nodes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::{self, Instant};

use crate::config::CacheConfig;
use crate::context::CacheContext;
use crate::dht::DhtCache;
use crate::entry::GridCacheEntry;
use crate::error::{GridError, Result};
use crate::eviction::{EvictionPolicy, LruEvictionPolicy, NoopEvictionPolicy};
use crate::mvcc::{CandidateSpec, LockTimeout};
use crate::near::NearCache;
use crate::topology::{AffinityFunction, PartitionTopology};
use crate::transport::{
    CacheStore, FinishRequest, FinishResponse, GetRequest, GetResponse, InvalidateRequest,
    JsonMarshaller, LockRequest, LockResponse, Marshaller, Membership, PrepareRequest,
    PrepareResponse, RemoveReaderRequest, Transport, TxEntryMessage, TxOp,
};
use crate::tx::{NearTxLocal, TxManager, TxOptions};
use crate::types::{CacheKey, CacheValue, Concurrency, NodeId, PeekMode, TopologyVersion};
use crate::version::{Version, VersionGenerator};

/// Locks a remote transaction holds on this node until it finishes.
struct RemoteTx<K, V> {
    near_node: NodeId,
    topology_version: TopologyVersion,
    locked: Vec<(K, Arc<GridCacheEntry<K, V>>)>,
}

impl<K: CacheKey, V> RemoteTx<K, V> {
    fn new(near_node: NodeId, topology_version: TopologyVersion) -> Self {
        Self {
            near_node,
            topology_version,
            locked: Vec::new(),
        }
    }

    fn holds(&self, key: &K) -> bool {
        self.locked.iter().any(|(k, _)| k == key)
    }
}

pub struct GridCacheBuilder<K, V> {
    config: CacheConfig,
    membership: Arc<dyn Membership>,
    transport: Arc<dyn Transport>,
    affinity: Arc<dyn AffinityFunction>,
    topology_version: TopologyVersion,
    keys: Option<Arc<dyn Marshaller<K>>>,
    values: Option<Arc<dyn Marshaller<V>>>,
    store: Option<Arc<dyn CacheStore<K, V>>>,
}

impl<K: CacheKey, V: CacheValue> GridCacheBuilder<K, V> {
    pub fn topology_version(mut self, version: TopologyVersion) -> Self {
        self.topology_version = version;
        self
    }

    pub fn key_marshaller(mut self, keys: Arc<dyn Marshaller<K>>) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn value_marshaller(mut self, values: Arc<dyn Marshaller<V>>) -> Self {
        self.values = Some(values);
        self
    }

    pub fn store(mut self, store: Arc<dyn CacheStore<K, V>>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Result<Arc<GridCache<K, V>>> {
        self.config.validate()?;
        let keys = self
            .keys
            .ok_or_else(|| GridError::Config("key marshaller is required".to_string()))?;
        let values = self
            .values
            .ok_or_else(|| GridError::Config("value marshaller is required".to_string()))?;
        let node_id = self.membership.local_node_id();
        let topology = Arc::new(PartitionTopology::new(
            node_id,
            self.affinity,
            self.topology_version,
        ));
        let ctx = Arc::new(CacheContext {
            node_id,
            versions: Arc::new(VersionGenerator::new(node_id)),
            topology,
            membership: self.membership,
            transport: self.transport,
            keys,
            values,
            store: self.store,
            tm: Arc::new(TxManager::new(self.config.completed_history)),
            config: self.config,
        });

        let dht_lru = lru_policy(ctx.config.dht_max_size)?;
        let near_lru = lru_policy(ctx.config.near_max_size)?;
        let dht = Arc::new(DhtCache::new(ctx.clone(), policy_or_noop(&dht_lru)));
        let near = Arc::new(NearCache::new(ctx.clone(), dht.clone(), policy_or_noop(&near_lru)));
        tracing::debug!(
            node_id,
            cache = %ctx.config.name,
            topology_version = ctx.topology.version(),
            "grid cache started"
        );
        Ok(Arc::new(GridCache {
            ctx,
            dht,
            near,
            dht_lru,
            near_lru,
            remote_txs: DashMap::new(),
            threads: AtomicU64::new(0),
        }))
    }
}

impl<K, V> GridCacheBuilder<K, V>
where
    K: CacheKey + Serialize + DeserializeOwned,
    V: CacheValue + Serialize + DeserializeOwned,
{
    pub fn with_json_marshallers(self) -> Self {
        self.key_marshaller(Arc::new(JsonMarshaller::<K>::new()))
            .value_marshaller(Arc::new(JsonMarshaller::<V>::new()))
    }
}

fn lru_policy<K: CacheKey>(max: usize) -> Result<Option<Arc<LruEvictionPolicy<K>>>> {
    if max == 0 {
        return Ok(None);
    }
    Ok(Some(Arc::new(LruEvictionPolicy::new(max)?)))
}

fn policy_or_noop<K: CacheKey>(lru: &Option<Arc<LruEvictionPolicy<K>>>) -> Arc<dyn EvictionPolicy<K>> {
    match lru {
        Some(lru) => {
            let policy: Arc<dyn EvictionPolicy<K>> = lru.clone();
            policy
        }
        None => Arc::new(NoopEvictionPolicy),
    }
}

/// One node's transactional cache.
pub struct GridCache<K, V> {
    ctx: Arc<CacheContext<K, V>>,
    dht: Arc<DhtCache<K, V>>,
    near: Arc<NearCache<K, V>>,
    dht_lru: Option<Arc<LruEvictionPolicy<K>>>,
    near_lru: Option<Arc<LruEvictionPolicy<K>>>,
    remote_txs: DashMap<Version, RemoteTx<K, V>>,
    threads: AtomicU64,
}

impl<K: CacheKey, V: CacheValue> GridCache<K, V> {
    pub fn builder(
        config: CacheConfig,
        membership: Arc<dyn Membership>,
        transport: Arc<dyn Transport>,
        affinity: Arc<dyn AffinityFunction>,
    ) -> GridCacheBuilder<K, V> {
        GridCacheBuilder {
            config,
            membership,
            transport,
            affinity,
            topology_version: 1,
            keys: None,
            values: None,
            store: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id
    }

    pub fn context(&self) -> &Arc<CacheContext<K, V>> {
        &self.ctx
    }

    pub fn config(&self) -> &CacheConfig {
        &self.ctx.config
    }

    pub fn dht(&self) -> &Arc<DhtCache<K, V>> {
        &self.dht
    }

    pub fn near(&self) -> &Arc<NearCache<K, V>> {
        &self.near
    }

    pub fn tm(&self) -> &Arc<TxManager> {
        &self.ctx.tm
    }

    pub fn dht_lru(&self) -> Option<&Arc<LruEvictionPolicy<K>>> {
        self.dht_lru.as_ref()
    }

    pub fn near_lru(&self) -> Option<&Arc<LruEvictionPolicy<K>>> {
        self.near_lru.as_ref()
    }

    /// Start an optimistic, repeatable-read transaction.
    pub fn tx_start(self: &Arc<Self>) -> Arc<NearTxLocal<K, V>> {
        self.tx_start_with(TxOptions::default())
    }

    pub fn tx_start_with(self: &Arc<Self>, options: TxOptions) -> Arc<NearTxLocal<K, V>> {
        let xid = self.ctx.versions.next();
        let thread_id = self.threads.fetch_add(1, Ordering::Relaxed) + 1;
        let timeout = options.timeout.or_else(|| self.ctx.config.tx_timeout());
        tracing::debug!(
            xid = %xid,
            concurrency = ?options.concurrency,
            isolation = ?options.isolation,
            implicit = options.implicit,
            "transaction started"
        );
        Arc::new(NearTxLocal::new(self.clone(), xid, thread_id, options, timeout))
    }

    fn implicit_tx(self: &Arc<Self>) -> Arc<NearTxLocal<K, V>> {
        self.tx_start_with(TxOptions {
            concurrency: Concurrency::Optimistic,
            implicit: true,
            ..TxOptions::default()
        })
    }

    /// Write one key in its own transaction.
    pub async fn put(self: &Arc<Self>, key: K, value: V) -> Result<()> {
        let tx = self.implicit_tx();
        tx.put(key, value).await?;
        tx.commit().await
    }

    pub async fn remove(self: &Arc<Self>, key: K) -> Result<()> {
        let tx = self.implicit_tx();
        tx.remove(key).await?;
        tx.commit().await
    }

    pub async fn get(&self, key: &K) -> Result<Option<Arc<V>>> {
        Ok(self.near.get(key).await?.1)
    }

    pub fn peek(&self, key: &K) -> Result<Option<Arc<V>>> {
        self.near.peek(key)
    }

    pub fn peek_mode(&self, key: &K, mode: PeekMode) -> Result<Option<Arc<V>>> {
        self.near.peek_mode(key, mode)
    }

    /// Install a new topology version; returns the number of purged entries.
    pub fn on_topology_changed(&self, version: TopologyVersion) -> usize {
        let purged = self.dht.on_topology_changed(version);
        tracing::debug!(node_id = self.ctx.node_id, version, purged, "topology changed");
        purged
    }

    /// Lock wait granted to a request carrying `timeout_ms`.
    fn lock_wait(&self, timeout_ms: u64) -> Duration {
        if timeout_ms > 0 {
            Duration::from_millis(timeout_ms)
        } else {
            self.ctx.config.lock_timeout()
        }
    }

    pub(crate) async fn send_prepare(&self, target: NodeId, req: PrepareRequest) -> Result<PrepareResponse> {
        let window = self.ctx.config.rpc_timeout() + self.lock_wait(req.timeout_ms);
        let resp = if self.ctx.is_local(target) {
            self.handle_prepare(req).await
        } else {
            rpc(window, target, "prepare", self.ctx.transport.prepare(target, req)).await?
        };
        match resp.error {
            Some(err) => Err(err),
            None => Ok(resp),
        }
    }

    pub(crate) async fn send_finish(&self, target: NodeId, req: FinishRequest) -> Result<()> {
        let resp = if self.ctx.is_local(target) {
            self.handle_finish(req).await
        } else {
            let window = self.ctx.config.rpc_timeout();
            rpc(window, target, "finish", self.ctx.transport.finish(target, req)).await?
        };
        match resp.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) async fn send_lock(&self, target: NodeId, req: LockRequest) -> Result<LockResponse> {
        let window = self.ctx.config.rpc_timeout() + self.lock_wait(req.timeout_ms);
        let resp = if self.ctx.is_local(target) {
            self.handle_lock(req).await
        } else {
            rpc(window, target, "lock", self.ctx.transport.lock(target, req)).await?
        };
        match resp.error {
            Some(err) => Err(err),
            None => Ok(resp),
        }
    }

    pub async fn handle_prepare(&self, req: PrepareRequest) -> PrepareResponse {
        match self.rpc_prepare(req).await {
            Ok(resp) => resp,
            Err(err) => PrepareResponse {
                error: Some(err),
                ..PrepareResponse::default()
            },
        }
    }

    pub async fn handle_finish(&self, req: FinishRequest) -> FinishResponse {
        FinishResponse {
            error: self.rpc_finish(req).await.err(),
        }
    }

    pub async fn handle_lock(&self, req: LockRequest) -> LockResponse {
        match self.rpc_lock(req).await {
            Ok(resp) => resp,
            Err(err) => LockResponse {
                error: Some(err),
                ..LockResponse::default()
            },
        }
    }

    pub async fn handle_get(&self, req: GetRequest) -> GetResponse {
        match self.rpc_get(req).await {
            Ok(resp) => resp,
            Err(err) => GetResponse {
                error: Some(err),
                ..GetResponse::default()
            },
        }
    }

    pub fn handle_invalidate(&self, req: InvalidateRequest) {
        for bytes in &req.keys {
            match self.ctx.decode_key(bytes) {
                Ok(key) => {
                    if self.near.invalidate(&key, req.version) {
                        tracing::debug!(key = ?key, origin = req.origin, "near entry invalidated");
                    }
                }
                Err(err) => tracing::warn!(error = ?err, "failed to decode invalidated key"),
            }
        }
    }

    pub fn handle_remove_reader(&self, req: RemoveReaderRequest) -> bool {
        let removed = self
            .ctx
            .decode_key(&req.key)
            .and_then(|key| self.dht.remove_reader(&key, req.near_node, req.msg_id));
        match removed {
            Ok(removed) => removed,
            Err(err) => {
                tracing::debug!(error = ?err, node = req.near_node, "reader removal failed");
                false
            }
        }
    }

    /// Lock `key` for `xid`, re-fetching the entry if it was evicted
    /// while the request was queued.
    async fn lock_entry(
        &self,
        key: &K,
        spec: CandidateSpec,
        topology_version: TopologyVersion,
        deadline: Instant,
    ) -> Result<Arc<GridCacheEntry<K, V>>> {
        for _ in 0..crate::entry::MAX_ENTRY_RETRIES {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let entry = self.dht.entry_ex_at(key, Some(topology_version))?;
            let spec = spec.clone().with_timeout(LockTimeout::After(remaining));
            match entry.lock(spec).await {
                Ok(Some(_)) => return Ok(entry),
                Ok(None) => break,
                Err(err) if err.is_entry_removed() => continue,
                Err(GridError::LockCancelled { .. }) if Instant::now() >= deadline => break,
                Err(err) => return Err(err),
            }
        }
        Err(GridError::TransactionTimeout(format!(
            "failed to lock {key:?} for transaction {}",
            spec.version
        )))
    }

    fn check_owned(&self, key: &K, topology_version: TopologyVersion) -> Result<()> {
        let owners = self.ctx.topology.key_owners(key, Some(topology_version))?;
        if owners.contains(&self.ctx.node_id) {
            Ok(())
        } else {
            Err(self.dht.invalid_partition(key))
        }
    }

    async fn rpc_prepare(&self, req: PrepareRequest) -> Result<PrepareResponse> {
        let xid = req.xid;
        if let Some(committed) = self.ctx.tm.completion(xid) {
            return Err(GridError::InvalidState(format!(
                "transaction {xid} already finished (committed: {committed})"
            )));
        }
        self.ctx.tm.on_started(xid);
        self.ctx.versions.on_received(xid);

        let mut remote = self
            .remote_txs
            .remove(&xid)
            .map(|(_, remote)| remote)
            .unwrap_or_else(|| RemoteTx::new(req.near_node, req.topology_version));
        match self.prepare_entries(&req, &mut remote).await {
            Ok(()) => {
                self.remote_txs.insert(xid, remote);
                // A rollback that arrived while locks were pending found nothing to release.
                if self.ctx.tm.completion(xid).is_some() {
                    if let Some((_, remote)) = self.remote_txs.remove(&xid) {
                        self.abort_remote(xid, remote);
                    }
                    return Err(GridError::InvalidState(format!(
                        "transaction {xid} finished while preparing"
                    )));
                }
                let (committed, rolled_back) = self.ctx.tm.completed_versions(xid);
                Ok(PrepareResponse {
                    dht_version: Some(self.ctx.versions.next()),
                    committed,
                    rolled_back,
                    error: None,
                })
            }
            Err(err) => {
                tracing::debug!(xid = %xid, error = ?err, "prepare rejected");
                self.abort_remote(xid, remote);
                Err(err)
            }
        }
    }

    async fn prepare_entries(&self, req: &PrepareRequest, remote: &mut RemoteTx<K, V>) -> Result<()> {
        let mut entries = req.entries.clone();
        // Everyone locks in key-byte order.
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let deadline = Instant::now() + self.lock_wait(req.timeout_ms);
        for msg in &entries {
            let key = self.ctx.decode_key(&msg.key)?;
            self.check_owned(&key, req.topology_version)?;
            let entry = match remote.locked.iter().find(|(k, _)| *k == key) {
                Some((_, entry)) => entry.clone(),
                None => {
                    let mut spec = CandidateSpec::new(req.near_node, req.xid, req.thread_id);
                    spec.topology_version = Some(req.topology_version);
                    spec.read = !msg.op.is_write();
                    let entry = self
                        .lock_entry(&key, spec, req.topology_version, deadline)
                        .await?;
                    remote.locked.push((key.clone(), entry.clone()));
                    entry
                }
            };
            entry.set_mapped_nodes(req.xid, vec![req.near_node])?;
            if let Some(expected) = msg.expected_version {
                let current = entry.version()?;
                if current != expected {
                    return Err(GridError::OptimisticConflict(format!(
                        "{key:?} changed since read: expected {expected}, found {current}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn abort_remote(&self, xid: Version, remote: RemoteTx<K, V>) {
        for (_, entry) in &remote.locked {
            self.dht.unlock(entry, xid);
        }
        self.ctx.tm.on_finished(xid, false);
    }

    async fn rpc_finish(&self, req: FinishRequest) -> Result<()> {
        let xid = req.xid;
        self.ctx.versions.on_received(req.commit_version);
        if req.backup {
            return self.apply_backup(&req);
        }
        if !req.commit {
            // Recorded before the lookup so a prepare still acquiring locks sees it.
            self.ctx.tm.on_finished(xid, false);
            if let Some((_, remote)) = self.remote_txs.remove(&xid) {
                self.abort_remote(xid, remote);
            }
            tracing::debug!(xid = %xid, "remote transaction rolled back");
            return Ok(());
        }
        let remote = self.remote_txs.remove(&xid).map(|(_, remote)| remote);
        let Some(remote) = remote else {
            return match self.ctx.tm.completion(xid) {
                Some(true) => Ok(()),
                _ => Err(GridError::InvalidState(format!(
                    "cannot commit unprepared transaction {xid}"
                ))),
            };
        };
        let result = self.apply_commit(&req, &remote).await;
        for (_, entry) in &remote.locked {
            self.dht.unlock(entry, xid);
        }
        self.ctx.tm.on_finished(xid, result.is_ok());
        if let Err(err) = &result {
            tracing::error!(xid = %xid, error = ?err, "failed to apply committed transaction");
        }
        result
    }

    fn decode_write(&self, msg: &TxEntryMessage) -> Result<Option<(K, Option<Arc<V>>)>> {
        let value = match &msg.op {
            TxOp::Read => return Ok(None),
            TxOp::Update(bytes) => Some(Arc::new(self.ctx.decode_value(bytes)?)),
            TxOp::Delete => None,
        };
        Ok(Some((self.ctx.decode_key(&msg.key)?, value)))
    }

    fn apply_backup(&self, req: &FinishRequest) -> Result<()> {
        for msg in &req.entries {
            if let Some((key, value)) = self.decode_write(msg)? {
                self.dht.apply(&key, value, req.commit_version, req.near_node)?;
            }
        }
        Ok(())
    }

    async fn apply_commit(&self, req: &FinishRequest, remote: &RemoteTx<K, V>) -> Result<()> {
        let mut stale: BTreeMap<NodeId, Vec<Vec<u8>>> = BTreeMap::new();
        let mut backups: BTreeMap<NodeId, Vec<TxEntryMessage>> = BTreeMap::new();
        for msg in &req.entries {
            let Some((key, value)) = self.decode_write(msg)? else {
                continue;
            };
            if !remote.holds(&key) {
                return Err(GridError::InvalidState(format!(
                    "transaction {} does not hold a lock on {key:?}",
                    req.xid
                )));
            }
            self.ctx.store_write(&key, value.as_deref())?;
            for node in self.dht.apply(&key, value, req.commit_version, remote.near_node)? {
                stale.entry(node).or_default().push(msg.key.clone());
            }
            let owners = match self.ctx.topology.key_owners(&key, Some(remote.topology_version)) {
                Ok(owners) => owners,
                Err(err) => {
                    tracing::warn!(xid = %req.xid, key = ?key, error = ?err, "skipping backup replication");
                    Vec::new()
                }
            };
            for node in owners {
                if !self.ctx.is_local(node) {
                    backups.entry(node).or_default().push(msg.clone());
                }
            }
        }

        let window = self.ctx.config.rpc_timeout();
        let transport = &self.ctx.transport;
        let backup_sends = backups.into_iter().map(|(node, entries)| {
            let req = FinishRequest {
                near_node: remote.near_node,
                xid: req.xid,
                commit: true,
                commit_version: req.commit_version,
                topology_version: remote.topology_version,
                entries,
                backup: true,
            };
            async move { (node, rpc(window, node, "backup finish", transport.finish(node, req)).await) }
        });
        for (node, res) in join_all(backup_sends).await {
            let err = match res {
                Ok(resp) => resp.error,
                Err(err) => Some(err),
            };
            if let Some(err) = err {
                tracing::warn!(xid = %req.xid, backup = node, error = ?err, "failed to update backup");
            }
        }

        let invalidations = stale.into_iter().map(|(node, keys)| {
            let req = InvalidateRequest {
                origin: self.ctx.node_id,
                keys,
                version: req.commit_version,
            };
            async move { (node, rpc(window, node, "invalidate", transport.invalidate(node, req)).await) }
        });
        for (node, res) in join_all(invalidations).await {
            if let Err(err) = res {
                tracing::debug!(reader = node, error = ?err, "near invalidation failed");
            }
        }
        Ok(())
    }

    async fn rpc_lock(&self, req: LockRequest) -> Result<LockResponse> {
        let key = self.ctx.decode_key(&req.key)?;
        self.check_owned(&key, req.topology_version)?;
        if self.ctx.tm.completion(req.xid).is_some() {
            return Err(GridError::InvalidState(format!(
                "transaction {} already finished",
                req.xid
            )));
        }
        self.ctx.tm.on_started(req.xid);
        let held = self
            .remote_txs
            .get(&req.xid)
            .and_then(|remote| remote.locked.iter().find(|(k, _)| *k == key).map(|(_, e)| e.clone()));
        let entry = match held {
            Some(entry) => entry,
            None => {
                let mut spec = CandidateSpec::new(req.near_node, req.xid, req.thread_id).reentrant();
                spec.topology_version = Some(req.topology_version);
                let deadline = Instant::now() + self.lock_wait(req.timeout_ms);
                let entry = self
                    .lock_entry(&key, spec, req.topology_version, deadline)
                    .await?;
                self.remote_txs
                    .entry(req.xid)
                    .or_insert_with(|| RemoteTx::new(req.near_node, req.topology_version))
                    .locked
                    .push((key.clone(), entry.clone()));
                entry
            }
        };
        let (version, value) = match entry.versioned_value()? {
            Some((version, value)) => (version, Some(value)),
            None => (entry.version()?, None),
        };
        Ok(LockResponse {
            acquired: true,
            value: value.map(|v| self.ctx.encode_value(&v)).transpose()?,
            version: Some(version),
            error: None,
        })
    }

    async fn rpc_get(&self, req: GetRequest) -> Result<GetResponse> {
        let key = self.ctx.decode_key(&req.key)?;
        if !self.ctx.topology.local_owns(&key, None) {
            return Err(self.dht.invalid_partition(&key));
        }
        let cacheable = match self.dht.add_reader(&key, req.near_node, req.msg_id)? {
            Some(pending) => {
                let settled = time::timeout(self.ctx.config.reader_wait(), pending.wait())
                    .await
                    .is_ok();
                if !settled {
                    tracing::debug!(key = ?key, reader = req.near_node, "writers still active, value not cacheable");
                }
                settled
            }
            None => false,
        };
        let (version, value) = self.dht.get_local(&key)?;
        Ok(GetResponse {
            value: value.map(|v| self.ctx.encode_value(&v)).transpose()?,
            version: Some(version),
            cacheable,
            error: None,
        })
    }
}

async fn rpc<T>(
    window: Duration,
    target: NodeId,
    what: &str,
    fut: impl std::future::Future<Output = anyhow::Result<T>>,
) -> Result<T> {
    match time::timeout(window, fut).await {
        Ok(resp) => resp.map_err(GridError::transport),
        Err(_) => Err(GridError::Transport(format!("{what} rpc to node {target} timed out"))),
    }
}
