//! Versioned cache entries and the sharded entry arena.
//!
//! Every entry owns a short-lived mutex guarding value, version, lock queue,
//! reader list and policy metadata. Nothing blocks while that mutex is held:
//! lock waits happen on oneshot channels after it is released, and
//! owner-changed callbacks run only once the guard has been dropped.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{GridError, Result};
use crate::eviction::{EvictableEntry, EvictionPolicy};
use crate::future::GridFuture;
use crate::mvcc::{Candidate, CandidateQueue, CandidateRef, CandidateSpec, CandidateStatus, LockTimeout};
use crate::sync::lock;
use crate::topology::{hash_key, LocalPartition};
use crate::types::{CacheKey, CacheValue, NodeId};
use crate::version::{Version, VersionGenerator};

/// Lock versions remembered per entry after they were released or cancelled.
const REMOVED_HISTORY: usize = 64;
/// Bound on re-fetch attempts after hitting an obsolete entry.
pub const MAX_ENTRY_RETRIES: usize = 64;

/// Opaque per-policy metadata attached to an entry.
pub type MetaValue = Arc<dyn Any + Send + Sync>;
/// Predicate gating `peek` results.
pub type EntryFilter<K, V> = Arc<dyn Fn(&K, Option<&V>) -> bool + Send + Sync>;

/// A near node that read an entry and must be invalidated on change.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReaderId {
    pub node_id: NodeId,
    /// Id of the last read request seen from that node.
    pub msg_id: u64,
}

/// Receives lock-ownership changes, always outside the entry mutex.
pub trait OwnerListener<K>: Send + Sync + 'static {
    fn on_owner_changed(&self, key: &K, previous: Option<&Candidate>, owner: Option<&Candidate>);
}

pub struct NoopOwnerListener;

impl<K> OwnerListener<K> for NoopOwnerListener {
    fn on_owner_changed(&self, _key: &K, _previous: Option<&Candidate>, _owner: Option<&Candidate>) {}
}

/// Result of appending a lock candidate.
#[derive(Debug)]
pub enum LockAttempt {
    Owner(Candidate),
    Waiting(Candidate, oneshot::Receiver<Candidate>),
    NotAcquired,
}

/// Result of registering a near reader on a DHT entry.
#[derive(Debug)]
pub enum ReaderRegistration {
    /// New reader; `future` completes after the listed transactions finish.
    Added {
        future: GridFuture<bool>,
        active: Vec<Version>,
    },
    /// Reader was already known; carries the pending future, if any.
    Existing(Option<GridFuture<bool>>),
}

struct EntryState<V> {
    value: Option<Arc<V>>,
    version: Version,
    obsolete: Option<Version>,
    queue: CandidateQueue,
    waiters: HashMap<CandidateRef, Vec<oneshot::Sender<Candidate>>>,
    removed: VecDeque<Version>,
    readers: Arc<Vec<ReaderId>>,
    tx_fut: Option<GridFuture<bool>>,
    meta: HashMap<String, MetaValue>,
}

impl<V> EntryState<V> {
    fn remember_removed(&mut self, version: Version) {
        if self.removed.contains(&version) {
            return;
        }
        if self.removed.len() >= REMOVED_HISTORY {
            self.removed.pop_front();
        }
        self.removed.push_back(version);
    }
}

struct OwnerChange {
    previous: Option<Candidate>,
    owner: Option<Candidate>,
    waiters: Vec<oneshot::Sender<Candidate>>,
}

pub struct GridCacheEntry<K, V> {
    key: K,
    hash: u64,
    partition: Option<Arc<LocalPartition<K>>>,
    listener: Arc<dyn OwnerListener<K>>,
    state: Mutex<EntryState<V>>,
}

impl<K: CacheKey, V: CacheValue> std::fmt::Debug for GridCacheEntry<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("GridCacheEntry")
            .field("key", &self.key)
            .field("version", &state.version)
            .field("obsolete", &state.obsolete)
            .field("candidates", &state.queue.len())
            .field("readers", &state.readers.len())
            .finish()
    }
}

impl<K: CacheKey, V: CacheValue> GridCacheEntry<K, V> {
    pub fn new(
        key: K,
        partition: Option<Arc<LocalPartition<K>>>,
        listener: Arc<dyn OwnerListener<K>>,
    ) -> Self {
        let hash = hash_key(&key);
        Self {
            key,
            hash,
            partition,
            listener,
            state: Mutex::new(EntryState {
                value: None,
                version: Version::zero(),
                obsolete: None,
                queue: CandidateQueue::new(),
                waiters: HashMap::new(),
                removed: VecDeque::new(),
                readers: Arc::new(Vec::new()),
                tx_fut: None,
                meta: HashMap::new(),
            }),
        }
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    pub fn partition(&self) -> Option<&Arc<LocalPartition<K>>> {
        self.partition.as_ref()
    }

    /// Near entries have no partition and are always valid.
    pub fn partition_valid(&self) -> bool {
        self.partition
            .as_ref()
            .map_or(true, |part| part.is_valid())
    }

    fn live(&self) -> Result<MutexGuard<'_, EntryState<V>>> {
        let state = lock(&self.state);
        if state.obsolete.is_some() {
            return Err(GridError::entry_removed(&self.key));
        }
        Ok(state)
    }

    pub fn is_obsolete(&self) -> bool {
        lock(&self.state).obsolete.is_some()
    }

    pub fn obsolete_version(&self) -> Option<Version> {
        lock(&self.state).obsolete
    }

    /// No value was ever set on this entry.
    pub fn is_new(&self) -> Result<bool> {
        let state = self.live()?;
        Ok(state.value.is_none() && state.version.is_zero())
    }

    pub fn version(&self) -> Result<Version> {
        Ok(self.live()?.version)
    }

    pub fn peek(&self) -> Result<Option<Arc<V>>> {
        Ok(self.live()?.value.clone())
    }

    /// Value, if every filter accepts it.
    pub fn peek_filtered(&self, filters: &[EntryFilter<K, V>]) -> Result<Option<Arc<V>>> {
        let value = self.peek()?;
        if filters
            .iter()
            .all(|filter| filter(&self.key, value.as_deref()))
        {
            Ok(value)
        } else {
            Ok(None)
        }
    }

    pub fn versioned_value(&self) -> Result<Option<(Version, Arc<V>)>> {
        let state = self.live()?;
        Ok(state.value.clone().map(|value| (state.version, value)))
    }

    /// Install a value written at `version`; older versions are ignored.
    pub fn set_value(&self, value: Option<Arc<V>>, version: Version) -> Result<bool> {
        let mut state = self.live()?;
        if version < state.version {
            return Ok(false);
        }
        state.value = value;
        state.version = version;
        Ok(true)
    }

    /// Run `f` against live state, then grant the lock to the new queue head
    /// and publish the owner change once the mutex is released.
    fn with_queue<R>(&self, f: impl FnOnce(&mut EntryState<V>) -> Result<R>) -> Result<R> {
        let (result, change) = {
            let mut state = self.live()?;
            let previous = state.queue.owner().cloned();
            let result = f(&mut state)?;
            state.queue.promote_head();
            let owner = state.queue.owner().cloned();
            let before = previous.as_ref().map(|c| c.handle);
            let after = owner.as_ref().map(|c| c.handle);
            let change = (before != after).then(|| {
                let waiters = owner
                    .as_ref()
                    .and_then(|c| state.waiters.remove(&c.handle))
                    .unwrap_or_default();
                OwnerChange {
                    previous,
                    owner,
                    waiters,
                }
            });
            (result, change)
        };
        if let Some(change) = change {
            if let Some(owner) = &change.owner {
                for waiter in change.waiters {
                    let _ = waiter.send(owner.clone());
                }
            }
            self.listener
                .on_owner_changed(&self.key, change.previous.as_ref(), change.owner.as_ref());
        }
        Ok(result)
    }

    /// Append a lock candidate without waiting.
    pub fn add_candidate(&self, spec: CandidateSpec) -> Result<LockAttempt> {
        if lock(&self.state).removed.contains(&spec.version) {
            return Err(GridError::LockCancelled {
                version: spec.version,
            });
        }
        self.with_queue(|state| {
            let existing = state.queue.find_version(spec.version).cloned().or_else(|| {
                spec.reentry
                    .then(|| state.queue.find_thread(spec.node_id, spec.thread_id))
                    .flatten()
                    .filter(|c| c.is_owner())
                    .cloned()
            });
            if let Some(mut existing) = existing {
                existing.reentry = true;
                if existing.is_owner() {
                    return Ok(LockAttempt::Owner(existing));
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.entry(existing.handle).or_default().push(tx);
                return Ok(LockAttempt::Waiting(existing, rx));
            }
            if spec.timeout == LockTimeout::NoWait && !state.queue.is_empty() {
                return Ok(LockAttempt::NotAcquired);
            }
            let candidate = state.queue.push_back(spec);
            if candidate.is_owner() {
                return Ok(LockAttempt::Owner(candidate));
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(candidate.handle).or_default().push(tx);
            Ok(LockAttempt::Waiting(candidate, rx))
        })
    }

    /// Acquire the lock for `spec.version`.
    ///
    /// Returns `Ok(None)` for a no-wait request facing another owner, and
    /// `LockCancelled` when the wait window expires or the candidate is
    /// dropped from the queue while waiting.
    pub async fn lock(&self, spec: CandidateSpec) -> Result<Option<Candidate>> {
        let timeout = spec.timeout;
        match self.add_candidate(spec)? {
            LockAttempt::NotAcquired => Ok(None),
            LockAttempt::Owner(owner) => Ok(Some(owner)),
            LockAttempt::Waiting(candidate, rx) => {
                let granted = match timeout {
                    LockTimeout::After(window) => tokio::time::timeout(window, rx)
                        .await
                        .ok()
                        .and_then(|res| res.ok()),
                    LockTimeout::NoWait | LockTimeout::Unbounded => rx.await.ok(),
                };
                match granted {
                    Some(owner) => Ok(Some(owner)),
                    None => self.cancel(candidate.handle, candidate.version),
                }
            }
        }
    }

    fn cancel(&self, handle: CandidateRef, version: Version) -> Result<Option<Candidate>> {
        let granted = self.with_queue(|state| {
            if let Some(candidate) = state.queue.get(handle) {
                if candidate.is_owner() {
                    return Ok(Some(candidate.clone()));
                }
                state.queue.remove(handle, CandidateStatus::Cancelled);
                state.waiters.remove(&handle);
                state.remember_removed(version);
            }
            Ok(None)
        })?;
        match granted {
            Some(owner) => Ok(Some(owner)),
            None => Err(GridError::LockCancelled { version }),
        }
    }

    /// Release the candidate of `version`; returns it if it was queued.
    pub fn release(&self, version: Version) -> Result<Option<Candidate>> {
        self.with_queue(|state| {
            let Some(handle) = state.queue.find_version(version).map(|c| c.handle) else {
                return Ok(None);
            };
            state.waiters.remove(&handle);
            state.remember_removed(version);
            Ok(state.queue.remove(handle, CandidateStatus::Released))
        })
    }

    pub fn owner(&self) -> Result<Option<Candidate>> {
        Ok(self.live()?.queue.owner().cloned())
    }

    pub fn candidates(&self) -> Result<Vec<Candidate>> {
        Ok(self.live()?.queue.snapshot())
    }

    pub fn local_candidates(&self) -> Result<Vec<Candidate>> {
        Ok(self
            .live()?
            .queue
            .iter()
            .filter(|c| c.local)
            .cloned()
            .collect())
    }

    pub fn candidate(&self, version: Version) -> Result<Option<Candidate>> {
        Ok(self.live()?.queue.find_version(version).cloned())
    }

    /// Local candidate paired with a near transaction version.
    pub fn local_candidate_by_near_version(&self, near: Version) -> Result<Option<Candidate>> {
        Ok(self
            .live()?
            .queue
            .find_other_version(near)
            .filter(|c| c.local)
            .cloned())
    }

    pub fn has_candidates(&self) -> Result<bool> {
        Ok(!self.live()?.queue.is_empty())
    }

    pub fn is_locked_by(&self, version: Version) -> Result<bool> {
        Ok(self
            .live()?
            .queue
            .owner()
            .is_some_and(|owner| owner.version == version))
    }

    /// Record the nodes a candidate's transaction was mapped to.
    pub fn set_mapped_nodes(&self, version: Version, nodes: Vec<NodeId>) -> Result<bool> {
        let mut state = self.live()?;
        let Some(handle) = state.queue.find_version(version).map(|c| c.handle) else {
            return Ok(false);
        };
        match state.queue.get_mut(handle) {
            Some(candidate) => {
                candidate.mapped_nodes = nodes;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Apply remote completion knowledge for the transaction `base`.
    ///
    /// Candidates of transactions known to be committed or rolled back are
    /// dropped from the queue; the candidate of `base` is marked ready.
    pub fn done_remote(
        &self,
        base: Version,
        committed: &[Version],
        rolled_back: &[Version],
    ) -> Result<()> {
        self.with_queue(|state| {
            let finished: Vec<(CandidateRef, Version)> = state
                .queue
                .iter()
                .filter(|c| c.version != base)
                .filter(|c| committed.contains(&c.version) || rolled_back.contains(&c.version))
                .map(|c| (c.handle, c.version))
                .collect();
            for (handle, version) in finished {
                state.queue.remove(handle, CandidateStatus::Released);
                state.waiters.remove(&handle);
                state.remember_removed(version);
            }
            if let Some(handle) = state.queue.find_version(base).map(|c| c.handle) {
                if let Some(candidate) = state.queue.get_mut(handle) {
                    candidate.ready = true;
                }
            }
            Ok(())
        })
    }

    /// Mark the entry obsolete and detach it from its partition.
    ///
    /// Refused while any lock candidate is queued.
    pub fn mark_obsolete(&self, version: Version) -> bool {
        let mut state = lock(&self.state);
        if state.obsolete.is_some() {
            return true;
        }
        if !state.queue.is_empty() {
            return false;
        }
        state.obsolete = Some(version);
        state.value = None;
        state.readers = Arc::new(Vec::new());
        if let Some(part) = &self.partition {
            part.remove(&self.key);
        }
        true
    }

    pub fn register_reader(&self, node_id: NodeId, msg_id: u64) -> Result<ReaderRegistration> {
        let mut state = self.live()?;
        if let Some(pos) = state.readers.iter().position(|r| r.node_id == node_id) {
            if state.readers[pos].msg_id < msg_id {
                let mut next = (*state.readers).clone();
                next[pos].msg_id = msg_id;
                state.readers = Arc::new(next);
            }
            return Ok(ReaderRegistration::Existing(state.tx_fut.clone()));
        }
        let mut next = (*state.readers).clone();
        next.push(ReaderId { node_id, msg_id });
        state.readers = Arc::new(next);
        if let Some(pending) = state.tx_fut.clone() {
            return Ok(ReaderRegistration::Added {
                future: pending,
                active: Vec::new(),
            });
        }
        let active: Vec<Version> = state.queue.iter().filter(|c| c.tx).map(|c| c.version).collect();
        let future = GridFuture::new();
        state.tx_fut = Some(future.clone());
        Ok(ReaderRegistration::Added { future, active })
    }

    /// Forget the reader transaction future once it has completed.
    pub fn clear_tx_future(&self, future: &GridFuture<bool>) {
        let mut state = lock(&self.state);
        if state.tx_fut.as_ref().is_some_and(|f| f.ptr_eq(future)) {
            state.tx_fut = None;
        }
    }

    /// Remove a reader unless a newer read from it was already seen.
    pub fn remove_reader(&self, node_id: NodeId, msg_id: u64) -> Result<bool> {
        let mut state = self.live()?;
        let Some(pos) = state.readers.iter().position(|r| r.node_id == node_id) else {
            return Ok(false);
        };
        if state.readers[pos].msg_id > msg_id {
            return Ok(false);
        }
        let mut next = (*state.readers).clone();
        next.remove(pos);
        state.readers = Arc::new(next);
        Ok(true)
    }

    pub fn readers_snapshot(&self) -> Result<Arc<Vec<ReaderId>>> {
        Ok(self.live()?.readers.clone())
    }

    /// Drop readers on nodes that are no longer alive; returns the survivors.
    pub fn prune_readers(&self, is_alive: impl Fn(NodeId) -> bool) -> Result<Arc<Vec<ReaderId>>> {
        let mut state = self.live()?;
        if state.readers.iter().all(|r| is_alive(r.node_id)) {
            return Ok(state.readers.clone());
        }
        let next: Vec<ReaderId> = state
            .readers
            .iter()
            .filter(|r| is_alive(r.node_id))
            .cloned()
            .collect();
        state.readers = Arc::new(next);
        Ok(state.readers.clone())
    }

    pub fn clear_readers(&self) -> Result<Vec<ReaderId>> {
        let mut state = self.live()?;
        let old = std::mem::replace(&mut state.readers, Arc::new(Vec::new()));
        Ok((*old).clone())
    }

    pub fn add_meta(&self, name: &str, value: MetaValue) -> Option<MetaValue> {
        lock(&self.state).meta.insert(name.to_string(), value)
    }

    pub fn meta(&self, name: &str) -> Option<MetaValue> {
        lock(&self.state).meta.get(name).cloned()
    }

    pub fn remove_meta(&self, name: &str) -> Option<MetaValue> {
        lock(&self.state).meta.remove(name)
    }

    pub fn meta_as<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.meta(name).and_then(|value| value.downcast::<T>().ok())
    }
}

type Shard<K, V> = Mutex<HashMap<K, Arc<GridCacheEntry<K, V>>>>;

/// Entries sharded by key hash.
pub struct EntryMap<K, V> {
    shards: Vec<Shard<K, V>>,
    policy: Arc<dyn EvictionPolicy<K>>,
    versions: Arc<VersionGenerator>,
}

impl<K: CacheKey, V: CacheValue> EntryMap<K, V> {
    pub fn new(
        shards: usize,
        policy: Arc<dyn EvictionPolicy<K>>,
        versions: Arc<VersionGenerator>,
    ) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| Mutex::new(HashMap::new())).collect(),
            policy,
            versions,
        }
    }

    fn shard(&self, hash: u64) -> &Shard<K, V> {
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    pub fn get(&self, key: &K) -> Option<Arc<GridCacheEntry<K, V>>> {
        lock(self.shard(hash_key(key)))
            .get(key)
            .filter(|entry| !entry.is_obsolete())
            .cloned()
    }

    /// Existing live entry, or a new one built by `make`.
    pub fn get_or_try_insert(
        &self,
        key: &K,
        make: impl FnOnce() -> Result<GridCacheEntry<K, V>>,
    ) -> Result<Arc<GridCacheEntry<K, V>>> {
        let mut shard = lock(self.shard(hash_key(key)));
        if let Some(entry) = shard.get(key) {
            if !entry.is_obsolete() {
                return Ok(entry.clone());
            }
        }
        let entry = Arc::new(make()?);
        shard.insert(key.clone(), entry.clone());
        Ok(entry)
    }

    /// Remove `entry` if it is still the mapped instance for its key.
    pub fn remove_if_same(&self, entry: &Arc<GridCacheEntry<K, V>>) -> bool {
        let mut shard = lock(self.shard(entry.hash()));
        match shard.get(entry.key()) {
            Some(current) if Arc::ptr_eq(current, entry) => {
                shard.remove(entry.key());
                true
            }
            _ => false,
        }
    }

    /// Make `entry` obsolete, drop it from the map and tell the policy.
    pub fn evict(&self, entry: &Arc<GridCacheEntry<K, V>>) -> bool {
        if !self.remove_obsolete(entry) {
            return false;
        }
        if !entry.key().is_internal() {
            let handle: Arc<dyn EvictableEntry<K>> = Arc::new(EvictionHandle {
                entry: entry.clone(),
                map: Weak::new(),
            });
            self.policy.on_entry_accessed(true, handle);
        }
        true
    }

    /// Eviction requested by the policy itself, which already dropped the
    /// entry from its bookkeeping.
    fn remove_obsolete(&self, entry: &Arc<GridCacheEntry<K, V>>) -> bool {
        if !entry.mark_obsolete(self.versions.next()) {
            return false;
        }
        self.remove_if_same(entry);
        true
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| lock(shard).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live user entries; internal keys are skipped.
    pub fn entries(&self) -> Vec<Arc<GridCacheEntry<K, V>>> {
        self.shards
            .iter()
            .flat_map(|shard| {
                lock(shard)
                    .values()
                    .filter(|entry| !entry.key().is_internal() && !entry.is_obsolete())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries()
            .into_iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Report an access to the eviction policy.
    pub fn touch(self: &Arc<Self>, entry: &Arc<GridCacheEntry<K, V>>, removed: bool) {
        if entry.key().is_internal() {
            return;
        }
        let handle: Arc<dyn EvictableEntry<K>> = Arc::new(EvictionHandle {
            entry: entry.clone(),
            map: Arc::downgrade(self),
        });
        self.policy.on_entry_accessed(removed, handle);
    }
}

/// Entry capability handed to eviction policies.
struct EvictionHandle<K, V> {
    entry: Arc<GridCacheEntry<K, V>>,
    map: Weak<EntryMap<K, V>>,
}

impl<K: CacheKey, V: CacheValue> EvictableEntry<K> for EvictionHandle<K, V> {
    fn key(&self) -> &K {
        self.entry.key()
    }

    fn meta(&self, name: &str) -> Option<MetaValue> {
        self.entry.meta(name)
    }

    fn add_meta(&self, name: &str, value: MetaValue) -> Option<MetaValue> {
        self.entry.add_meta(name, value)
    }

    fn remove_meta(&self, name: &str) -> Option<MetaValue> {
        self.entry.remove_meta(name)
    }

    fn evict(&self) -> bool {
        match self.map.upgrade() {
            Some(map) => map.remove_obsolete(&self.entry),
            None => false,
        }
    }
}

/// Fetch an entry and run `op`, re-fetching while it reports `EntryRemoved`.
pub(crate) fn with_entry_retry<K, V, R>(
    key: &K,
    mut fetch: impl FnMut() -> Result<Arc<GridCacheEntry<K, V>>>,
    mut op: impl FnMut(&Arc<GridCacheEntry<K, V>>) -> Result<R>,
) -> Result<R>
where
    K: CacheKey,
    V: CacheValue,
{
    for _ in 0..MAX_ENTRY_RETRIES {
        let entry = fetch()?;
        match op(&entry) {
            Err(err) if err.is_entry_removed() => {
                tracing::debug!(key = ?key, "got removed entry, retrying");
            }
            other => return other,
        }
    }
    Err(GridError::entry_removed(key))
}
