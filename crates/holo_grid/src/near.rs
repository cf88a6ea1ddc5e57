//! Client-side near cache in front of the DHT.
//!
//! Near storage holds copies of keys owned by other nodes. Keys the local
//! node owns are always served by the local [`DhtCache`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::time;

use crate::context::CacheContext;
use crate::dht::DhtCache;
use crate::entry::{EntryFilter, EntryMap, GridCacheEntry, NoopOwnerListener, OwnerListener};
use crate::error::{GridError, Result};
use crate::eviction::EvictionPolicy;
use crate::transport::{GetRequest, RemoveReaderRequest};
use crate::types::{CacheKey, CacheValue, NodeId, PeekMode};
use crate::version::Version;

pub struct NearCache<K, V> {
    ctx: Arc<CacheContext<K, V>>,
    dht: Arc<DhtCache<K, V>>,
    entries: Arc<EntryMap<K, V>>,
    listener: Arc<dyn OwnerListener<K>>,
    msg_ids: AtomicU64,
    /// Message id of the read that registered this node as reader, per key.
    reads: DashMap<K, (NodeId, u64)>,
    /// Remote reads in flight, with the newest invalidation seen meanwhile.
    pending: DashMap<K, PendingRead>,
}

#[derive(Debug, Default)]
struct PendingRead {
    inflight: usize,
    invalidated: Option<Version>,
}

impl<K: CacheKey, V: CacheValue> NearCache<K, V> {
    pub fn new(
        ctx: Arc<CacheContext<K, V>>,
        dht: Arc<DhtCache<K, V>>,
        policy: Arc<dyn EvictionPolicy<K>>,
    ) -> Self {
        let entries = Arc::new(EntryMap::new(
            ctx.config.entry_shards,
            policy,
            ctx.versions.clone(),
        ));
        Self {
            ctx,
            dht,
            entries,
            listener: Arc::new(NoopOwnerListener),
            msg_ids: AtomicU64::new(0),
            reads: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    pub fn dht(&self) -> &Arc<DhtCache<K, V>> {
        &self.dht
    }

    pub fn entries(&self) -> &Arc<EntryMap<K, V>> {
        &self.entries
    }

    /// Entry for `key`: the DHT entry when the local node owns the key,
    /// otherwise (or when the partition just moved away) a near entry.
    pub fn entry_ex(&self, key: &K) -> Result<Arc<GridCacheEntry<K, V>>> {
        if self.ctx.topology.local_owns(key, None) {
            match self.dht.entry_ex(key) {
                Err(GridError::InvalidPartition { partition }) => {
                    tracing::debug!(key = ?key, partition, "partition moved, using near entry");
                }
                other => return other,
            }
        }
        self.near_entry(key)
    }

    pub fn near_entry(&self, key: &K) -> Result<Arc<GridCacheEntry<K, V>>> {
        self.entries
            .get_or_try_insert(key, || Ok(GridCacheEntry::new(key.clone(), None, self.listener.clone())))
    }

    pub fn peek_near_entry(&self, key: &K) -> Option<Arc<GridCacheEntry<K, V>>> {
        self.entries.get(key)
    }

    /// Existing entry, near first, DHT on a miss.
    pub fn peek_ex(&self, key: &K) -> Option<Arc<GridCacheEntry<K, V>>> {
        if self.ctx.topology.local_owns(key, None) {
            return self.dht.peek_ex(key);
        }
        self.entries.get(key).or_else(|| self.dht.peek_ex(key))
    }

    fn share(&self, value: Arc<V>) -> Arc<V> {
        if self.ctx.config.clone_on_read {
            Arc::new(V::clone(&value))
        } else {
            value
        }
    }

    fn peek_near(&self, key: &K, filters: &[EntryFilter<K, V>]) -> Result<Option<Arc<V>>> {
        for _ in 0..crate::entry::MAX_ENTRY_RETRIES {
            let Some(entry) = self.entries.get(key) else {
                return Ok(None);
            };
            match entry.peek_filtered(filters) {
                Err(err) if err.is_entry_removed() => continue,
                other => return other,
            }
        }
        Ok(None)
    }

    fn peek_dht(&self, key: &K, filters: &[EntryFilter<K, V>]) -> Result<Option<Arc<V>>> {
        for _ in 0..crate::entry::MAX_ENTRY_RETRIES {
            let Some(entry) = self.dht.peek_ex(key) else {
                return Ok(None);
            };
            match entry.peek_filtered(filters) {
                Err(err) if err.is_entry_removed() => continue,
                other => return other,
            }
        }
        Ok(None)
    }

    pub fn peek(&self, key: &K) -> Result<Option<Arc<V>>> {
        self.peek_filtered(key, &[])
    }

    pub fn peek_filtered(&self, key: &K, filters: &[EntryFilter<K, V>]) -> Result<Option<Arc<V>>> {
        let value = match self.peek_near(key, filters)? {
            Some(value) => Some(value),
            None => self.peek_dht(key, filters)?,
        };
        Ok(value.map(|value| self.share(value)))
    }

    pub fn peek_mode(&self, key: &K, mode: PeekMode) -> Result<Option<Arc<V>>> {
        let value = match mode {
            PeekMode::Smart | PeekMode::Global => return self.peek(key),
            PeekMode::NearOnly => self.peek_near(key, &[])?,
            PeekMode::PartitionedOnly => self.peek_dht(key, &[])?,
            PeekMode::Db => self.ctx.load(key)?.map(Arc::new),
        };
        Ok(value.map(|value| self.share(value)))
    }

    /// First value found across `modes`, in order.
    pub fn peek_modes(&self, key: &K, modes: &[PeekMode]) -> Result<Option<Arc<V>>> {
        for mode in modes {
            if let Some(value) = self.peek_mode(key, *mode)? {
                return Ok(Some(value));
            }
        }
        Ok(None)
    }

    /// `peek_modes` on a runtime worker, for modes that may hit the store.
    pub async fn peek_async(self: &Arc<Self>, key: K, modes: Vec<PeekMode>) -> Result<Option<Arc<V>>> {
        let near = self.clone();
        tokio::spawn(async move { near.peek_modes(&key, &modes) })
            .await
            .map_err(|err| GridError::InvalidState(format!("peek task failed: {err}")))?
    }

    /// Read `key`, going to the owner on a near miss.
    ///
    /// The owner registers this node as a reader so later commits
    /// invalidate the copy kept here.
    pub async fn get(&self, key: &K) -> Result<(Version, Option<Arc<V>>)> {
        let topology = &self.ctx.topology;
        if topology.local_owns(key, None) {
            match self.dht.get_local(key) {
                Err(GridError::InvalidPartition { .. }) => {}
                Ok((version, value)) => return Ok((version, value.map(|v| self.share(v)))),
                Err(err) => return Err(err),
            }
        }
        if let Some(entry) = self.entries.get(key) {
            if let Ok(Some((version, value))) = entry.versioned_value() {
                self.entries.touch(&entry, false);
                return Ok((version, Some(self.share(value))));
            }
        }

        let owner = topology.owning_node(key, None)?;
        let msg_id = self.msg_ids.fetch_add(1, Ordering::Relaxed) + 1;
        self.pending.entry(key.clone()).or_default().inflight += 1;
        let fetched = self.fetch(key, owner, msg_id).await;
        let cache = self.ctx.config.near_enabled
            && fetched.as_ref().is_ok_and(|(_, _, cacheable)| *cacheable);
        let stale = self.finish_read(key, fetched.as_ref().ok().map(|(version, _, _)| *version));
        let (version, value, _) = fetched?;
        if cache && !stale {
            self.reads.insert(key.clone(), (owner, msg_id));
            let entry = self.near_entry(key)?;
            if let Err(err) = entry.set_value(value.clone(), version) {
                tracing::debug!(error = ?err, key = ?key, "near entry removed while caching read");
            } else {
                self.entries.touch(&entry, false);
            }
        } else if stale {
            tracing::debug!(key = ?key, version = %version, "read overtaken by invalidation, not cached");
        }
        Ok((version, value.map(|v| self.share(v))))
    }

    async fn fetch(&self, key: &K, owner: NodeId, msg_id: u64) -> Result<(Version, Option<Arc<V>>, bool)> {
        let req = GetRequest {
            near_node: self.ctx.node_id,
            msg_id,
            topology_version: self.ctx.topology.version(),
            key: self.ctx.encode_key(key)?,
        };
        let resp = match time::timeout(self.ctx.config.rpc_timeout(), self.ctx.transport.get(owner, req)).await {
            Ok(resp) => resp.map_err(GridError::transport)?,
            Err(_) => return Err(GridError::Transport(format!("get rpc to node {owner} timed out"))),
        };
        if let Some(err) = resp.error {
            return Err(err);
        }
        let version = resp.version.unwrap_or_else(Version::zero);
        let value = match resp.value {
            Some(bytes) => Some(Arc::new(self.ctx.decode_value(&bytes)?)),
            None => None,
        };
        self.ctx.versions.on_received(version);
        Ok((version, value, resp.cacheable))
    }

    /// Close one in-flight read of `key`. True when an invalidation newer
    /// than `version` arrived while it was outstanding.
    fn finish_read(&self, key: &K, version: Option<Version>) -> bool {
        let stale = match self.pending.get_mut(key) {
            Some(mut read) => {
                read.inflight = read.inflight.saturating_sub(1);
                match (read.invalidated, version) {
                    (Some(invalidated), Some(version)) => version < invalidated,
                    _ => false,
                }
            }
            None => false,
        };
        self.pending.remove_if(key, |_, read| read.inflight == 0);
        stale
    }

    /// Apply this node's own committed write to an existing near copy.
    pub fn apply(&self, key: &K, value: Option<Arc<V>>, version: Version) {
        if let Some(entry) = self.entries.get(key) {
            if let Err(err) = entry.set_value(value, version) {
                tracing::debug!(error = ?err, key = ?key, "near entry removed before commit apply");
            }
        }
    }

    /// Drop the near copy of `key` if it is not newer than `version`.
    ///
    /// Reads of `key` still in flight will not cache a value older than
    /// `version`.
    pub fn invalidate(&self, key: &K, version: Version) -> bool {
        if let Some(mut read) = self.pending.get_mut(key) {
            read.invalidated = read.invalidated.max(Some(version));
        }
        let Some(entry) = self.entries.get(key) else {
            return false;
        };
        match entry.version() {
            Ok(current) if current <= version => {
                self.reads.remove(key);
                if self.entries.evict(&entry) {
                    return true;
                }
                // Locked by a local transaction: drop the value so reads go to the owner.
                match entry.set_value(None, version) {
                    Ok(_) => true,
                    Err(err) if err.is_entry_removed() => true,
                    Err(err) => {
                        tracing::debug!(error = ?err, key = ?key, "near invalidation failed");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    /// Evict only the near copy; the owner is told to forget this reader.
    pub fn evict_near_only(&self, key: &K, filters: &[EntryFilter<K, V>]) -> bool {
        let Some(entry) = self.entries.get(key) else {
            return false;
        };
        let value = entry.peek().ok().flatten();
        if !filters.iter().all(|filter| filter(key, value.as_deref())) {
            return false;
        }
        if !self.entries.evict(&entry) {
            return false;
        }
        if let Some((_, (owner, msg_id))) = self.reads.remove(key) {
            self.forget_reader(key, owner, msg_id);
        }
        true
    }

    fn forget_reader(&self, key: &K, owner: NodeId, msg_id: u64) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let key_bytes = match self.ctx.encode_key(key) {
            Ok(bytes) => bytes,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to encode key for reader removal");
                return;
            }
        };
        let transport = self.ctx.transport.clone();
        let req = RemoveReaderRequest {
            near_node: self.ctx.node_id,
            key: key_bytes,
            msg_id,
        };
        runtime.spawn(async move {
            if let Err(err) = transport.remove_reader(owner, req).await {
                tracing::debug!(error = ?err, owner, "reader removal rpc failed");
            }
        });
    }

    pub fn size(&self) -> usize {
        self.entries.entries().len()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.keys()
    }
}
