//! Per-node context shared by every cache component.

use std::sync::Arc;

use crate::config::CacheConfig;
use crate::error::{GridError, Result};
use crate::topology::PartitionTopology;
use crate::transport::{CacheStore, Marshaller, Membership, Transport};
use crate::tx::TxManager;
use crate::types::{CacheKey, CacheValue, NodeId};
use crate::version::VersionGenerator;

/// Collaborators and shared services of one node's cache.
pub struct CacheContext<K, V> {
    pub config: CacheConfig,
    pub node_id: NodeId,
    pub versions: Arc<VersionGenerator>,
    pub topology: Arc<PartitionTopology<K>>,
    pub membership: Arc<dyn Membership>,
    pub transport: Arc<dyn Transport>,
    pub keys: Arc<dyn Marshaller<K>>,
    pub values: Arc<dyn Marshaller<V>>,
    pub store: Option<Arc<dyn CacheStore<K, V>>>,
    pub tm: Arc<TxManager>,
}

impl<K: CacheKey, V: CacheValue> CacheContext<K, V> {
    pub fn encode_key(&self, key: &K) -> Result<Vec<u8>> {
        self.keys.encode(key).map_err(GridError::marshal)
    }

    pub fn decode_key(&self, bytes: &[u8]) -> Result<K> {
        self.keys.decode(bytes).map_err(GridError::marshal)
    }

    pub fn encode_value(&self, value: &V) -> Result<Vec<u8>> {
        self.values.encode(value).map_err(GridError::marshal)
    }

    pub fn decode_value(&self, bytes: &[u8]) -> Result<V> {
        self.values.decode(bytes).map_err(GridError::marshal)
    }

    pub fn store_enabled(&self) -> bool {
        self.config.store_enabled && self.store.is_some()
    }

    pub fn load(&self, key: &K) -> Result<Option<V>> {
        match &self.store {
            Some(store) if self.config.store_enabled => store.load(key).map_err(GridError::store),
            _ => Ok(None),
        }
    }

    pub fn store_write(&self, key: &K, value: Option<&V>) -> Result<()> {
        match &self.store {
            Some(store) if self.config.store_enabled => {
                store.store(key, value).map_err(GridError::store)
            }
            _ => Ok(()),
        }
    }

    pub fn is_local(&self, node: NodeId) -> bool {
        node == self.node_id
    }
}
