use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::sync::mpsc;

use crate::cache::GridCache;
use crate::context::CacheContext;
use crate::error::{GridError, Result};
use crate::future::GridFuture;
use crate::mvcc::CandidateSpec;
use crate::sync::lock;
use crate::topology::TopologyState;
use crate::transport::{FinishRequest, LockRequest, PrepareRequest, PrepareResponse, TxEntryMessage, TxOp};
use crate::tx::{TxEntry, TxMapping, TxOperation};
use crate::types::{CacheKey, CacheValue, Concurrency, Isolation, NodeId, ThreadId, TopologyVersion, TxState};
use crate::version::Version;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxOptions {
    pub concurrency: Concurrency,
    pub isolation: Isolation,
    /// Falls back to the configured transaction timeout.
    pub timeout: Option<Duration>,
    pub implicit: bool,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            concurrency: Concurrency::Optimistic,
            isolation: Isolation::RepeatableRead,
            timeout: None,
            implicit: false,
        }
    }
}

/// Transaction coordinated by the node that started it.
///
/// Reads and writes are buffered in the transaction map. Each touched key is
/// mapped to its primary node; commit prepares every mapped node, then sends
/// the finish decision to all of them. Prepare, commit and rollback each run
/// at most once: the first caller creates the shared future and later callers
/// get the same handle.
pub struct NearTxLocal<K, V> {
    cache: Arc<GridCache<K, V>>,
    ctx: Arc<CacheContext<K, V>>,
    xid: Version,
    thread_id: ThreadId,
    concurrency: Concurrency,
    isolation: Isolation,
    implicit: bool,
    timeout: Option<Duration>,
    started: Instant,
    state: Mutex<TxState>,
    rollback_only: AtomicBool,
    invalidate: AtomicBool,
    tx_map: Mutex<HashMap<K, TxEntry<K, V>>>,
    mappings: DashMap<NodeId, TxMapping<K>>,
    topology_version: OnceLock<TopologyVersion>,
    commit_version: OnceLock<Version>,
    prep_fut: OnceLock<GridFuture<()>>,
    commit_fut: OnceLock<GridFuture<()>>,
    rollback_fut: OnceLock<GridFuture<()>>,
}

impl<K: CacheKey, V: CacheValue> NearTxLocal<K, V> {
    pub(crate) fn new(
        cache: Arc<GridCache<K, V>>,
        xid: Version,
        thread_id: ThreadId,
        options: TxOptions,
        timeout: Option<Duration>,
    ) -> Self {
        let ctx = cache.context().clone();
        Self {
            cache,
            ctx,
            xid,
            thread_id,
            concurrency: options.concurrency,
            isolation: options.isolation,
            implicit: options.implicit,
            timeout,
            started: Instant::now(),
            state: Mutex::new(TxState::Active),
            rollback_only: AtomicBool::new(false),
            invalidate: AtomicBool::new(false),
            tx_map: Mutex::new(HashMap::new()),
            mappings: DashMap::new(),
            topology_version: OnceLock::new(),
            commit_version: OnceLock::new(),
            prep_fut: OnceLock::new(),
            commit_fut: OnceLock::new(),
            rollback_fut: OnceLock::new(),
        }
    }

    pub fn xid(&self) -> Version {
        self.xid
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    pub fn isolation(&self) -> Isolation {
        self.isolation
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    pub fn is_implicit_single(&self) -> bool {
        self.implicit && lock(&self.tx_map).len() == 1
    }

    pub fn state(&self) -> TxState {
        *lock(&self.state)
    }

    pub fn commit_version(&self) -> Option<Version> {
        self.commit_version.get().copied()
    }

    /// Topology version the transaction maps keys against, fixed on first use.
    pub fn topology_version(&self) -> TopologyVersion {
        *self
            .topology_version
            .get_or_init(|| self.ctx.topology.version())
    }

    pub fn timed_out(&self) -> bool {
        self.timeout
            .is_some_and(|timeout| self.started.elapsed() > timeout)
    }

    /// Mark the transaction so it can only roll back.
    ///
    /// Returns `false` once commit has started.
    pub fn set_rollback_only(&self) -> bool {
        if matches!(self.state(), TxState::Committing | TxState::Committed) {
            return false;
        }
        self.rollback_only.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::SeqCst)
    }

    /// Set when the outcome on some node could not be confirmed.
    pub fn is_invalidate(&self) -> bool {
        self.invalidate.load(Ordering::SeqCst)
    }

    fn timeout_error(&self) -> GridError {
        GridError::TransactionTimeout(format!(
            "transaction {} timed out after {:?}",
            self.xid,
            self.started.elapsed()
        ))
    }

    fn check_active(&self) -> Result<()> {
        if self.timed_out() {
            self.set_rollback_only();
            return Err(self.timeout_error());
        }
        let state = self.state();
        if state != TxState::Active {
            return Err(GridError::InvalidState(format!(
                "transaction {} is {state}",
                self.xid
            )));
        }
        Ok(())
    }

    fn transition(&self, next: TxState) -> Result<()> {
        let mut state = lock(&self.state);
        if self.is_rollback_only()
            && matches!(next, TxState::Preparing | TxState::Prepared | TxState::Committing)
        {
            return Err(GridError::InvalidState(format!(
                "transaction {} is marked rollback-only",
                self.xid
            )));
        }
        if !state.can_transition_to(next) {
            return Err(GridError::InvalidState(format!(
                "transaction {} cannot move from {} to {next}",
                self.xid, *state
            )));
        }
        let from = *state;
        tracing::debug!(xid = %self.xid, from = %from, to = %next, "transaction state changed");
        *state = next;
        Ok(())
    }

    /// Milliseconds a lock request may wait.
    fn lock_wait_ms(&self) -> u64 {
        let wait = match self.timeout {
            Some(timeout) => timeout.saturating_sub(self.started.elapsed()),
            None => self.ctx.config.lock_timeout(),
        };
        (wait.as_millis() as u64).max(1)
    }

    pub async fn get(&self, key: &K) -> Result<Option<Arc<V>>> {
        self.check_active()?;
        if let Some(value) = self.buffered(key) {
            return Ok(value);
        }
        let (owner, version, value) = match self.concurrency {
            Concurrency::Pessimistic => self.lock_key(key).await?,
            Concurrency::Optimistic => {
                let owner = self.ctx.topology.owning_node(key, None)?;
                self.add_key_mapping(owner, key.clone());
                let (version, value) = self.cache.near().get(key).await?;
                (owner, version, value)
            }
        };
        let mut map = lock(&self.tx_map);
        let entry = map
            .entry(key.clone())
            .or_insert_with(|| TxEntry::new(key.clone(), TxOperation::Read));
        if !entry.read || self.isolation == Isolation::ReadCommitted {
            entry.read_value = value;
            entry.observed = Some(version);
        }
        entry.read = true;
        entry.node_id = Some(owner);
        entry.locked |= self.concurrency == Concurrency::Pessimistic;
        Ok(entry.visible_value())
    }

    /// Value already visible to this transaction, if the key needs no read.
    fn buffered(&self, key: &K) -> Option<Option<Arc<V>>> {
        let map = lock(&self.tx_map);
        let entry = map.get(key)?;
        let repeatable = entry.read && self.isolation != Isolation::ReadCommitted;
        (entry.op.is_write() || repeatable).then(|| entry.visible_value())
    }

    pub async fn put(&self, key: K, value: V) -> Result<()> {
        self.write(key, TxOperation::Update(Arc::new(value))).await
    }

    pub async fn remove(&self, key: K) -> Result<()> {
        self.write(key, TxOperation::Delete).await
    }

    async fn write(&self, key: K, op: TxOperation<V>) -> Result<()> {
        self.check_active()?;
        let locked = match self.concurrency {
            Concurrency::Pessimistic if !self.holds_lock(&key) => Some(self.lock_key(&key).await?),
            Concurrency::Pessimistic => None,
            Concurrency::Optimistic => {
                let owner = self.ctx.topology.owning_node(&key, None)?;
                self.add_key_mapping(owner, key.clone());
                None
            }
        };
        let mut map = lock(&self.tx_map);
        let entry = map
            .entry(key.clone())
            .or_insert_with(|| TxEntry::new(key, TxOperation::Read));
        entry.op = op;
        if let Some((owner, version, value)) = locked {
            entry.locked = true;
            entry.node_id = Some(owner);
            if !entry.read {
                entry.read_value = value;
                entry.observed = Some(version);
            }
        }
        Ok(())
    }

    fn holds_lock(&self, key: &K) -> bool {
        lock(&self.tx_map).get(key).is_some_and(|entry| entry.locked)
    }

    /// Lock `key` on its primary; returns the owner and the locked value.
    async fn lock_key(&self, key: &K) -> Result<(NodeId, Version, Option<Arc<V>>)> {
        let topology_version = self.topology_version();
        let owner = self.ctx.topology.owning_node(key, Some(topology_version))?;
        self.add_key_mapping(owner, key.clone());
        self.mark_explicit(owner);
        let req = LockRequest {
            near_node: self.ctx.node_id,
            xid: self.xid,
            thread_id: self.thread_id,
            topology_version,
            key: self.ctx.encode_key(key)?,
            timeout_ms: self.lock_wait_ms(),
        };
        let resp = match self.cache.send_lock(owner, req).await {
            Ok(resp) if resp.acquired => resp,
            Ok(_) => {
                self.set_rollback_only();
                return Err(GridError::TransactionTimeout(format!(
                    "lock on {key:?} was not acquired"
                )));
            }
            Err(err) => {
                self.set_rollback_only();
                return Err(err);
            }
        };
        let version = resp.version.unwrap_or_else(Version::zero);
        self.ctx.versions.on_received(version);
        let value = match resp.value {
            Some(bytes) => Some(Arc::new(self.ctx.decode_value(&bytes)?)),
            None => None,
        };
        Ok((owner, version, value))
    }

    /// Version a prepare must find on the key, if the read is validated.
    fn expected_version(&self, entry: &TxEntry<K, V>) -> Option<Version> {
        if !entry.read || self.concurrency == Concurrency::Pessimistic {
            return None;
        }
        match self.isolation {
            Isolation::ReadCommitted => None,
            Isolation::RepeatableRead => entry.observed.filter(|_| entry.op.is_write()),
            Isolation::Serializable => entry.observed,
        }
    }

    fn entry_message(&self, entry: &TxEntry<K, V>) -> Result<TxEntryMessage> {
        let op = match &entry.op {
            TxOperation::Read => TxOp::Read,
            TxOperation::Update(value) => TxOp::Update(self.ctx.encode_value(value)?),
            TxOperation::Delete => TxOp::Delete,
        };
        Ok(TxEntryMessage {
            key: self.ctx.encode_key(&entry.key)?,
            op,
            expected_version: self.expected_version(entry),
        })
    }

    /// Prepare the transaction on every mapped node.
    pub fn prepare_async(self: &Arc<Self>) -> GridFuture<()> {
        let mut created = false;
        let fut = self
            .prep_fut
            .get_or_init(|| {
                created = true;
                GridFuture::new()
            })
            .clone();
        if !created {
            return fut;
        }
        let tx = self.clone();
        let done = fut.clone();
        tokio::spawn(async move {
            match tx.prepare_inner().await {
                Ok(()) => {
                    done.on_done(());
                }
                Err(err) => tx.on_prepare_failure(&done, err).await,
            }
        });
        fut
    }

    async fn prepare_inner(self: &Arc<Self>) -> Result<()> {
        if self.timed_out() {
            self.set_rollback_only();
            return Err(self.timeout_error());
        }
        if let Err(err) = self.transition(TxState::Preparing) {
            return Err(if self.timed_out() { self.timeout_error() } else { err });
        }
        match self.concurrency {
            Concurrency::Pessimistic => self.validate_locks()?,
            Concurrency::Optimistic => {
                let requests = {
                    let guard = self.ctx.topology.read_lock();
                    let topology_version = *self.topology_version.get_or_init(|| guard.version());
                    self.user_prepare(&guard, topology_version)?
                };
                self.distribute_prepare(requests).await?;
            }
        }
        self.transition(TxState::Prepared)
    }

    fn validate_locks(&self) -> Result<()> {
        let map = lock(&self.tx_map);
        match map.values().find(|entry| entry.op.is_write() && !entry.locked) {
            Some(entry) => Err(GridError::InvalidState(format!(
                "pessimistic transaction {} writes {:?} without a lock",
                self.xid, entry.key
            ))),
            None => Ok(()),
        }
    }

    /// Map the keys to prepare at `topology_version` and build one prepare
    /// request per primary. Runs under the topology read lock.
    fn user_prepare(
        &self,
        state: &TopologyState<K>,
        topology_version: TopologyVersion,
    ) -> Result<Vec<(NodeId, PrepareRequest)>> {
        let mut map = lock(&self.tx_map);
        let implicit_single = self.implicit && map.len() == 1;
        let keys: Vec<K> = map
            .values()
            .filter(|entry| entry.op.is_write() || self.expected_version(entry).is_some())
            .map(|entry| entry.key.clone())
            .collect();
        let mapped = self
            .ctx
            .topology
            .map_keys_in(state, keys.iter(), topology_version)?;
        self.mappings.clear();

        let mut requests = Vec::with_capacity(mapped.len());
        for (node, keys) in mapped {
            let mut entries = Vec::with_capacity(keys.len());
            for key in &keys {
                let Some(entry) = map.get_mut(key) else {
                    continue;
                };
                entry.node_id = Some(node);
                entries.push(self.entry_message(entry)?);
                if node != self.ctx.node_id && entry.op.is_write() {
                    self.add_near_candidate(entry, implicit_single);
                }
            }
            for key in keys {
                self.add_key_mapping(node, key);
            }
            requests.push((
                node,
                PrepareRequest {
                    near_node: self.ctx.node_id,
                    xid: self.xid,
                    commit_version: self.xid,
                    thread_id: self.thread_id,
                    topology_version,
                    concurrency: self.concurrency,
                    isolation: self.isolation,
                    timeout_ms: self.lock_wait_ms(),
                    entries,
                },
            ));
        }
        tracing::debug!(xid = %self.xid, nodes = requests.len(), "prepared transaction mappings");
        Ok(requests)
    }

    /// Queue a local candidate on the near copy of a remote key so local
    /// transactions on it are ordered.
    fn add_near_candidate(&self, entry: &mut TxEntry<K, V>, implicit_single: bool) {
        let Some(near) = self.cache.near().peek_near_entry(&entry.key) else {
            return;
        };
        let mut spec = CandidateSpec::new(self.ctx.node_id, self.xid, self.thread_id);
        spec.implicit_single = implicit_single;
        match near.add_candidate(spec) {
            Ok(_) => entry.near_entry = Some(near),
            Err(err) => {
                tracing::debug!(xid = %self.xid, key = ?entry.key, error = ?err, "skipping near candidate");
            }
        }
    }

    async fn distribute_prepare(&self, requests: Vec<(NodeId, PrepareRequest)>) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<(NodeId, Result<PrepareResponse>)>(requests.len().max(1));
        for (node, req) in requests {
            let cache = self.cache.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let resp = cache.send_prepare(node, req).await;
                let _ = tx.send((node, resp)).await;
            });
        }
        drop(tx);

        let mut failure = None;
        while let Some((node, resp)) = rx.recv().await {
            match resp {
                Ok(resp) => {
                    if let Some(version) = resp.dht_version {
                        self.add_dht_version(node, version);
                    }
                    self.order_completed(&resp.committed, &resp.rolled_back);
                }
                Err(err) => {
                    tracing::error!(xid = %self.xid, node, error = ?err, "prepare failed");
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn on_prepare_failure(&self, done: &GridFuture<()>, err: GridError) {
        self.set_rollback_only();
        let rolled_back = self.finish(false).await.map(|_| ());
        if let Err(rollback_err) = &rolled_back {
            tracing::error!(xid = %self.xid, error = ?rollback_err, "rollback after failed prepare failed");
        }
        let _ = self.rollback_fut.set(GridFuture::completed(rolled_back));
        done.on_error(GridError::rollback(
            format!("failed to prepare transaction {}", self.xid),
            err,
        ));
    }

    /// Prepare, then commit on every mapped node.
    pub fn commit_async(self: &Arc<Self>) -> GridFuture<()> {
        let mut created = false;
        let fut = self
            .commit_fut
            .get_or_init(|| {
                created = true;
                GridFuture::new()
            })
            .clone();
        if !created {
            return fut;
        }
        let tx = self.clone();
        let done = fut.clone();
        tokio::spawn(async move {
            let res = tx.commit_inner().await;
            done.complete(res);
        });
        fut
    }

    async fn commit_inner(self: &Arc<Self>) -> Result<()> {
        self.prepare_async().wait().await?;
        if self.finish(true).await? {
            return Ok(());
        }
        Err(GridError::rollback(
            format!("transaction {} was rolled back concurrently", self.xid),
            GridError::InvalidState(self.state().to_string()),
        ))
    }

    pub async fn commit(self: &Arc<Self>) -> Result<()> {
        self.commit_async().wait().await
    }

    /// Roll back, waiting for an in-flight prepare first.
    pub async fn rollback(self: &Arc<Self>) -> Result<()> {
        self.rollback_async().wait().await
    }

    pub fn rollback_async(self: &Arc<Self>) -> GridFuture<()> {
        let mut created = false;
        let fut = self
            .rollback_fut
            .get_or_init(|| {
                created = true;
                GridFuture::new()
            })
            .clone();
        if !created {
            return fut;
        }
        let tx = self.clone();
        let done = fut.clone();
        tokio::spawn(async move {
            let res = tx.rollback_inner().await;
            done.complete(res);
        });
        fut
    }

    async fn rollback_inner(&self) -> Result<()> {
        self.set_rollback_only();
        if let Some(prepare) = self.prep_fut.get().cloned() {
            if let Err(err) = prepare.wait().await {
                tracing::debug!(xid = %self.xid, error = ?err, "ignoring prepare failure on rollback");
            }
        }
        if self.finish(false).await? {
            return Ok(());
        }
        if let Some(commit) = self.commit_fut.get().cloned() {
            let _ = commit.wait().await;
        }
        match self.state() {
            TxState::Committing | TxState::Committed => Err(GridError::InvalidState(format!(
                "transaction {} is already committed",
                self.xid
            ))),
            _ => Ok(()),
        }
    }

    /// Move to COMMITTING or ROLLING_BACK and finish on every node.
    ///
    /// Returns `Ok(false)` without doing anything when another caller already
    /// started finishing. A commit requested on a rollback-only transaction
    /// rolls back and reports why. Only a commit that fails on some node ends
    /// UNKNOWN; rollback never does.
    pub async fn finish(&self, commit_requested: bool) -> Result<bool> {
        let commit = commit_requested && !self.is_rollback_only();
        let target = if commit {
            TxState::Committing
        } else {
            TxState::RollingBack
        };
        {
            let mut state = lock(&self.state);
            let current = *state;
            if matches!(
                current,
                TxState::Committing
                    | TxState::Committed
                    | TxState::RollingBack
                    | TxState::RolledBack
                    | TxState::Unknown
            ) {
                tracing::debug!(xid = %self.xid, state = %current, "transaction already finishing");
                return Ok(false);
            }
            if !current.can_transition_to(target) {
                return Err(GridError::InvalidState(format!(
                    "transaction {} cannot move from {current} to {target}",
                    self.xid
                )));
            }
            tracing::debug!(xid = %self.xid, from = %current, to = %target, "transaction state changed");
            *state = target;
        }

        let commit_version = if commit {
            *self.commit_version.get_or_init(|| self.ctx.versions.next())
        } else {
            self.xid
        };
        let res = self.finish_mappings(commit, commit_version).await;
        if commit && res.is_ok() {
            self.apply_near(commit_version);
        }
        self.release_near_candidates();

        let terminal = match (&res, commit) {
            (Ok(()), true) => TxState::Committed,
            (Ok(()), false) => TxState::RolledBack,
            (Err(_), _) => TxState::Unknown,
        };
        *lock(&self.state) = terminal;
        self.ctx.tm.on_finished(self.xid, commit && res.is_ok());
        tracing::debug!(xid = %self.xid, state = %terminal, "transaction finished");

        match res {
            Ok(()) if commit_requested && !commit => Err(GridError::rollback(
                format!("transaction {} was rolled back", self.xid),
                GridError::InvalidState("transaction was marked rollback-only".to_string()),
            )),
            Ok(()) => Ok(true),
            Err(err) => {
                self.invalidate.store(true, Ordering::SeqCst);
                tracing::warn!(xid = %self.xid, error = ?err, "transaction outcome is unknown");
                Err(GridError::Heuristic(format!(
                    "transaction {} finished in an unknown state: {err}",
                    self.xid
                )))
            }
        }
    }

    async fn finish_mappings(&self, commit: bool, commit_version: Version) -> Result<()> {
        let topology_version = self.topology_version();
        let prepared = self.prep_fut.get().is_some();
        let requests = {
            let map = lock(&self.tx_map);
            let mut requests = Vec::new();
            for mapping in self.mappings.iter() {
                // Nothing is held on a node that was never locked or prepared.
                if !commit && !prepared && !mapping.explicit_lock() {
                    continue;
                }
                let node = mapping.node_id();
                if !commit && !self.ctx.is_local(node) && !self.ctx.membership.is_alive(node) {
                    tracing::debug!(xid = %self.xid, node, "skipping rollback on departed node");
                    continue;
                }
                let mut entries = Vec::new();
                if commit {
                    for key in mapping.keys() {
                        if let Some(entry) = map.get(key).filter(|entry| entry.op.is_write()) {
                            entries.push(self.entry_message(entry)?);
                        }
                    }
                }
                requests.push((
                    mapping.node_id(),
                    FinishRequest {
                        near_node: self.ctx.node_id,
                        xid: self.xid,
                        commit,
                        commit_version,
                        topology_version,
                        entries,
                        backup: false,
                    },
                ));
            }
            requests
        };

        let sends = requests.into_iter().map(|(node, req)| {
            let cache = self.cache.clone();
            async move { (node, cache.send_finish(node, req).await) }
        });
        let mut failure = None;
        for (node, res) in join_all(sends).await {
            match res {
                Ok(()) => {}
                Err(err) if commit => {
                    tracing::error!(xid = %self.xid, node, error = ?err, "commit failed");
                    failure.get_or_insert(err);
                }
                // Rollback is best effort.
                Err(err) => {
                    tracing::warn!(xid = %self.xid, node, error = ?err, "rollback failed");
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Refresh this node's near copies of the committed writes.
    fn apply_near(&self, commit_version: Version) {
        let writes: Vec<(K, Option<Arc<V>>)> = lock(&self.tx_map)
            .values()
            .filter(|entry| entry.op.is_write())
            .map(|entry| (entry.key.clone(), entry.visible_value()))
            .collect();
        for (key, value) in writes {
            self.cache.near().apply(&key, value, commit_version);
        }
    }

    fn release_near_candidates(&self) {
        let held: Vec<_> = lock(&self.tx_map)
            .values_mut()
            .filter_map(|entry| entry.near_entry.take())
            .collect();
        for near in held {
            match near.release(self.xid) {
                Ok(_) => {}
                Err(err) if err.is_entry_removed() => {}
                Err(err) => {
                    tracing::warn!(xid = %self.xid, key = ?near.key(), error = ?err, "failed to release near candidate");
                }
            }
        }
    }

    /// Drop candidates of transactions a node reported as finished from the
    /// near entries this transaction queued on.
    pub fn order_completed(&self, committed: &[Version], rolled_back: &[Version]) {
        if committed.is_empty() && rolled_back.is_empty() {
            return;
        }
        let mut map = lock(&self.tx_map);
        for entry in map.values_mut() {
            let Some(mut near) = entry.near_entry.clone() else {
                continue;
            };
            for _ in 0..crate::entry::MAX_ENTRY_RETRIES {
                match near.done_remote(self.xid, committed, rolled_back) {
                    Ok(()) => break,
                    Err(err) if err.is_entry_removed() => {
                        match self.cache.near().peek_near_entry(&entry.key) {
                            Some(fresh) => {
                                near = fresh;
                                entry.near_entry = Some(near.clone());
                            }
                            None => {
                                entry.near_entry = None;
                                break;
                            }
                        }
                    }
                    Err(err) => {
                        tracing::warn!(xid = %self.xid, key = ?entry.key, error = ?err, "failed to order completed versions");
                        break;
                    }
                }
            }
        }
    }

    pub fn add_key_mapping(&self, node: NodeId, key: K) {
        self.mappings
            .entry(node)
            .or_insert_with(|| TxMapping::new(node))
            .add(key);
    }

    pub fn add_entry_mapping(&self, mapping: TxMapping<K>) {
        let node = mapping.node_id();
        self.mappings
            .entry(node)
            .or_insert_with(|| TxMapping::new(node))
            .merge(mapping);
    }

    pub fn remove_mapping(&self, node: NodeId) -> Option<TxMapping<K>> {
        self.mappings.remove(&node).map(|(_, mapping)| mapping)
    }

    /// Drop `key` from the mapping of `node`; empty mappings are removed.
    pub fn remove_key_mapping(&self, node: NodeId, key: &K) -> bool {
        let removed = match self.mappings.get_mut(&node) {
            Some(mut mapping) => mapping.remove(key),
            None => false,
        };
        self.mappings.remove_if(&node, |_, mapping| mapping.is_empty());
        removed
    }

    pub fn mark_explicit(&self, node: NodeId) {
        if let Some(mut mapping) = self.mappings.get_mut(&node) {
            mapping.mark_explicit_lock();
        }
    }

    /// Node `key` is mapped to.
    pub fn mapping(&self, key: &K) -> Option<NodeId> {
        self.mappings
            .iter()
            .find(|mapping| mapping.keys().contains(key))
            .map(|mapping| mapping.node_id())
    }

    pub fn mapping_of(&self, node: NodeId) -> Option<TxMapping<K>> {
        self.mappings.get(&node).map(|mapping| mapping.value().clone())
    }

    /// Nodes taking part in the transaction; always includes this node.
    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.mappings.iter().map(|m| *m.key()).collect();
        nodes.push(self.ctx.node_id);
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    /// Record the version a node assigned the transaction and keep local
    /// versions ahead of it.
    pub fn add_dht_version(&self, node: NodeId, version: Version) {
        if let Some(mut mapping) = self.mappings.get_mut(&node) {
            mapping.set_dht_version(version);
        }
        self.ctx.versions.on_received(version);
    }
}
