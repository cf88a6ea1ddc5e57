//! Authoritative partitioned storage and near-reader tracking.

use std::sync::Arc;

use crate::context::CacheContext;
use crate::entry::{with_entry_retry, EntryMap, GridCacheEntry, OwnerListener, ReaderId, ReaderRegistration};
use crate::error::{GridError, Result};
use crate::eviction::EvictionPolicy;
use crate::future::GridFuture;
use crate::types::{CacheKey, CacheValue, NodeId, TopologyVersion};
use crate::version::Version;

/// Primary/backup storage of the partitions the local node owns.
pub struct DhtCache<K, V> {
    ctx: Arc<CacheContext<K, V>>,
    entries: Arc<EntryMap<K, V>>,
    listener: Arc<dyn OwnerListener<K>>,
}

impl<K: CacheKey, V: CacheValue> DhtCache<K, V> {
    pub fn new(ctx: Arc<CacheContext<K, V>>, policy: Arc<dyn EvictionPolicy<K>>) -> Self {
        let entries = Arc::new(EntryMap::new(
            ctx.config.entry_shards,
            policy,
            ctx.versions.clone(),
        ));
        let listener: Arc<dyn OwnerListener<K>> = ctx.tm.clone();
        Self {
            ctx,
            entries,
            listener,
        }
    }

    pub fn context(&self) -> &Arc<CacheContext<K, V>> {
        &self.ctx
    }

    pub fn entries(&self) -> &Arc<EntryMap<K, V>> {
        &self.entries
    }

    /// Entry for `key`, created and registered with its partition if absent.
    pub fn entry_ex(&self, key: &K) -> Result<Arc<GridCacheEntry<K, V>>> {
        self.entry_ex_at(key, None)
    }

    pub fn entry_ex_at(
        &self,
        key: &K,
        version: Option<TopologyVersion>,
    ) -> Result<Arc<GridCacheEntry<K, V>>> {
        self.entries.get_or_try_insert(key, || {
            let partition = self.ctx.topology.on_added(version, key)?;
            Ok(GridCacheEntry::new(
                key.clone(),
                Some(partition),
                self.listener.clone(),
            ))
        })
    }

    /// Existing entry for `key`, without creating one.
    pub fn peek_ex(&self, key: &K) -> Option<Arc<GridCacheEntry<K, V>>> {
        self.entries.get(key)
    }

    pub fn peek(&self, key: &K) -> Result<Option<Arc<V>>> {
        for _ in 0..crate::entry::MAX_ENTRY_RETRIES {
            let Some(entry) = self.peek_ex(key) else {
                return Ok(None);
            };
            match entry.peek() {
                Err(err) if err.is_entry_removed() => continue,
                other => return other,
            }
        }
        Ok(None)
    }

    /// Committed value and version, loading through the store on a miss.
    pub fn get_local(&self, key: &K) -> Result<(Version, Option<Arc<V>>)> {
        let loaded = with_entry_retry(
            key,
            || self.entry_ex(key),
            |entry| {
                let version = entry.version()?;
                let value = entry.peek()?;
                if value.is_some() || !self.ctx.store_enabled() || !entry.is_new()? {
                    return Ok((entry.clone(), version, value));
                }
                match self.ctx.load(key)? {
                    Some(loaded) => {
                        let version = self.ctx.versions.next();
                        let loaded = Arc::new(loaded);
                        entry.set_value(Some(loaded.clone()), version)?;
                        Ok((entry.clone(), version, Some(loaded)))
                    }
                    None => Ok((entry.clone(), version, None)),
                }
            },
        )?;
        let (entry, version, value) = loaded;
        self.entries.touch(&entry, false);
        Ok((version, value))
    }

    /// Register `node` as a near reader of `key`.
    ///
    /// Returns `None` when no registration is needed: the local node, nodes
    /// without a near cache and owners of the key never become readers.
    pub fn add_reader(
        &self,
        key: &K,
        node: NodeId,
        msg_id: u64,
    ) -> Result<Option<GridFuture<bool>>> {
        if self.ctx.is_local(node) {
            return Ok(None);
        }
        if !self.ctx.membership.has_near_cache(node) {
            tracing::debug!(node, key = ?key, "ignoring near reader without near cache");
            return Ok(None);
        }
        if self.ctx.topology.belongs(node, key, None) {
            return Ok(None);
        }
        with_entry_retry(
            key,
            || self.entry_ex(key),
            |entry| {
                let registration = entry.register_reader(node, msg_id)?;
                Ok(Some(match registration {
                    ReaderRegistration::Existing(pending) => {
                        pending.unwrap_or_else(|| GridFuture::completed(Ok(false)))
                    }
                    ReaderRegistration::Added { future, active } => {
                        self.wait_for_active(entry, &future, &active);
                        future
                    }
                }))
            },
        )
    }

    fn wait_for_active(
        &self,
        entry: &Arc<GridCacheEntry<K, V>>,
        future: &GridFuture<bool>,
        active: &[Version],
    ) {
        let waits: Vec<GridFuture<bool>> = active
            .iter()
            .filter_map(|xid| self.ctx.tm.finish_future(*xid))
            .collect();
        let entry = entry.clone();
        let done = future.clone();
        GridFuture::all(waits).listen(move |_| {
            done.on_done(true);
            entry.clear_tx_future(&done);
        });
    }

    /// Remove a reader unless a newer read from it was already seen.
    pub fn remove_reader(&self, key: &K, node: NodeId, msg_id: u64) -> Result<bool> {
        for _ in 0..crate::entry::MAX_ENTRY_RETRIES {
            let Some(entry) = self.peek_ex(key) else {
                return Ok(false);
            };
            match entry.remove_reader(node, msg_id) {
                Err(err) if err.is_entry_removed() => continue,
                other => return other,
            }
        }
        Ok(false)
    }

    /// Live readers of `key`; readers on departed nodes are dropped.
    pub fn check_readers(&self, key: &K) -> Result<Vec<ReaderId>> {
        for _ in 0..crate::entry::MAX_ENTRY_RETRIES {
            let Some(entry) = self.peek_ex(key) else {
                return Ok(Vec::new());
            };
            let before = match entry.readers_snapshot() {
                Ok(readers) => readers.len(),
                Err(err) if err.is_entry_removed() => continue,
                Err(err) => return Err(err),
            };
            let membership = self.ctx.membership.clone();
            match entry.prune_readers(|node| membership.is_alive(node)) {
                Ok(alive) => {
                    if alive.len() != before {
                        tracing::warn!(
                            key = ?key,
                            pruned = before - alive.len(),
                            "removed readers on departed nodes"
                        );
                    }
                    return Ok((*alive).clone());
                }
                Err(err) if err.is_entry_removed() => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(Vec::new())
    }

    pub fn readers(&self, key: &K) -> Result<Vec<NodeId>> {
        Ok(self
            .check_readers(key)?
            .into_iter()
            .map(|reader| reader.node_id)
            .collect())
    }

    /// Install a committed write and detach the readers that must be
    /// invalidated; `origin` keeps its registration.
    pub fn apply(
        &self,
        key: &K,
        value: Option<Arc<V>>,
        version: Version,
        origin: NodeId,
    ) -> Result<Vec<NodeId>> {
        let removed = value.is_none();
        let (entry, stale) = with_entry_retry(
            key,
            || self.entry_ex(key),
            |entry| {
                let membership = self.ctx.membership.clone();
                let readers = entry.prune_readers(|node| membership.is_alive(node))?;
                let mut stale = Vec::new();
                for reader in readers.iter().filter(|r| r.node_id != origin) {
                    if entry.remove_reader(reader.node_id, reader.msg_id)? {
                        stale.push(reader.node_id);
                    }
                }
                entry.set_value(value.clone(), version)?;
                Ok((entry.clone(), stale))
            },
        )?;
        self.entries.touch(&entry, removed);
        Ok(stale)
    }

    /// Release the lock of `xid`, purging the entry if its partition left.
    pub fn unlock(&self, entry: &Arc<GridCacheEntry<K, V>>, xid: Version) {
        match entry.release(xid) {
            Ok(_) => {}
            Err(err) if err.is_entry_removed() => return,
            Err(err) => {
                tracing::warn!(error = ?err, key = ?entry.key(), "failed to release lock");
                return;
            }
        }
        if !entry.partition_valid() && self.entries.evict(entry) {
            tracing::debug!(key = ?entry.key(), "purged unlocked entry of invalid partition");
        }
    }

    pub fn evict(&self, key: &K) -> bool {
        match self.peek_ex(key) {
            Some(entry) => self.entries.evict(&entry),
            None => false,
        }
    }

    /// Adopt a new topology version and purge entries of lost partitions.
    ///
    /// Locked entries stay until their lock is released.
    pub fn on_topology_changed(&self, version: TopologyVersion) -> usize {
        let lost = self.ctx.topology.on_topology_changed(version);
        let mut purged = 0;
        for partition in lost {
            for key in partition.keys() {
                if self.evict(&key) {
                    purged += 1;
                }
            }
        }
        purged
    }

    pub fn size(&self) -> usize {
        self.entries.entries().len()
    }

    pub fn keys(&self) -> Vec<K> {
        self.entries.keys()
    }

    pub(crate) fn invalid_partition(&self, key: &K) -> GridError {
        GridError::InvalidPartition {
            partition: self.ctx.topology.partition(key),
        }
    }
}
