use std::sync::Arc;

use crate::entry::GridCacheEntry;
use crate::types::NodeId;
use crate::version::Version;

/// What a transaction does to one key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxOperation<V> {
    Read,
    Update(Arc<V>),
    Delete,
}

impl<V> TxOperation<V> {
    pub fn is_write(&self) -> bool {
        !matches!(self, TxOperation::Read)
    }
}

/// One key of a transaction's read/write set.
pub struct TxEntry<K, V> {
    pub key: K,
    pub op: TxOperation<V>,
    /// Value returned by the first read.
    pub read_value: Option<Arc<V>>,
    /// Version observed by the first read, if reads are validated.
    pub observed: Option<Version>,
    pub read: bool,
    pub locked: bool,
    pub node_id: Option<NodeId>,
    /// Near-side entry holding this transaction's local candidate.
    pub near_entry: Option<Arc<GridCacheEntry<K, V>>>,
}

impl<K, V> TxEntry<K, V> {
    pub fn new(key: K, op: TxOperation<V>) -> Self {
        Self {
            key,
            op,
            read_value: None,
            observed: None,
            read: false,
            locked: false,
            node_id: None,
            near_entry: None,
        }
    }

    /// Value this transaction sees for the key.
    pub fn visible_value(&self) -> Option<Arc<V>> {
        match &self.op {
            TxOperation::Update(value) => Some(value.clone()),
            TxOperation::Delete => None,
            TxOperation::Read => self.read_value.clone(),
        }
    }
}

/// Keys of a transaction mapped to one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxMapping<K> {
    node_id: NodeId,
    keys: Vec<K>,
    explicit_lock: bool,
    dht_version: Option<Version>,
}

impl<K: PartialEq + Clone> TxMapping<K> {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            keys: Vec::new(),
            explicit_lock: false,
            dht_version: None,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn add(&mut self, key: K) {
        if !self.keys.contains(&key) {
            self.keys.push(key);
        }
    }

    pub fn remove(&mut self, key: &K) -> bool {
        let before = self.keys.len();
        self.keys.retain(|k| k != key);
        self.keys.len() != before
    }

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn explicit_lock(&self) -> bool {
        self.explicit_lock
    }

    pub fn mark_explicit_lock(&mut self) {
        self.explicit_lock = true;
    }

    pub fn dht_version(&self) -> Option<Version> {
        self.dht_version
    }

    pub fn set_dht_version(&mut self, version: Version) {
        self.dht_version = Some(version);
    }

    /// Fold another mapping for the same node into this one.
    pub fn merge(&mut self, other: TxMapping<K>) {
        for key in other.keys {
            self.add(key);
        }
        self.explicit_lock |= other.explicit_lock;
        if self.dht_version.is_none() {
            self.dht_version = other.dht_version;
        }
    }
}
