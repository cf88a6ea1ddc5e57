//! Eviction policies.
//!
//! Policies only see the [`EvictableEntry`] capability: key, named metadata
//! and an `evict` request the cache may refuse.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::entry::MetaValue;
use crate::error::{GridError, Result};
use crate::sync::lock;
use crate::types::CacheKey;

pub trait EvictableEntry<K>: Send + Sync {
    fn key(&self) -> &K;
    fn meta(&self, name: &str) -> Option<MetaValue>;
    fn add_meta(&self, name: &str, value: MetaValue) -> Option<MetaValue>;
    fn remove_meta(&self, name: &str) -> Option<MetaValue>;
    /// Ask the cache to evict; false if the entry is locked or already gone.
    fn evict(&self) -> bool;
}

pub trait EvictionPolicy<K>: Send + Sync + 'static {
    /// Called on every access; `removed` is true when the entry was removed.
    fn on_entry_accessed(&self, removed: bool, entry: Arc<dyn EvictableEntry<K>>);
}

/// Never evicts.
pub struct NoopEvictionPolicy;

impl<K> EvictionPolicy<K> for NoopEvictionPolicy {
    fn on_entry_accessed(&self, _removed: bool, _entry: Arc<dyn EvictableEntry<K>>) {}
}

/// Evicts an entry on every non-removal access.
pub struct AlwaysEvictionPolicy;

impl<K> EvictionPolicy<K> for AlwaysEvictionPolicy {
    fn on_entry_accessed(&self, removed: bool, entry: Arc<dyn EvictableEntry<K>>) {
        if !removed {
            entry.evict();
        }
    }
}

/// Position of an entry in the LRU queue, stored in the entry's metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueNode {
    slot: usize,
    generation: u64,
}

struct Link<K> {
    entry: Arc<dyn EvictableEntry<K>>,
    prev: Option<usize>,
    next: Option<usize>,
}

struct Slot<K> {
    generation: u64,
    link: Option<Link<K>>,
}

/// Recency list threaded through a slot vector.
struct RecencyQueue<K> {
    slots: Vec<Slot<K>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

impl<K> RecencyQueue<K> {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
        }
    }

    fn push_back(&mut self, entry: Arc<dyn EvictableEntry<K>>) -> QueueNode {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    link: None,
                });
                self.slots.len() - 1
            }
        };
        self.slots[slot].link = Some(Link {
            entry,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => {
                if let Some(link) = self.slots[tail].link.as_mut() {
                    link.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        QueueNode {
            slot,
            generation: self.slots[slot].generation,
        }
    }

    fn remove(&mut self, node: QueueNode) -> Option<Arc<dyn EvictableEntry<K>>> {
        let slot = self.slots.get_mut(node.slot)?;
        if slot.generation != node.generation {
            return None;
        }
        let link = slot.link.take()?;
        slot.generation += 1;
        match link.prev {
            Some(prev) => {
                if let Some(prev) = self.slots[prev].link.as_mut() {
                    prev.next = link.next;
                }
            }
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => {
                if let Some(next) = self.slots[next].link.as_mut() {
                    next.prev = link.prev;
                }
            }
            None => self.tail = link.prev,
        }
        self.free.push(node.slot);
        self.len -= 1;
        Some(link.entry)
    }

    fn pop_front(&mut self) -> Option<Arc<dyn EvictableEntry<K>>> {
        let head = self.head?;
        let generation = self.slots[head].generation;
        self.remove(QueueNode {
            slot: head,
            generation,
        })
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<dyn EvictableEntry<K>>> + '_ {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let link = self.slots[cursor?].link.as_ref()?;
            cursor = link.next;
            Some(&link.entry)
        })
    }
}

static LRU_POLICY_SEQ: AtomicU64 = AtomicU64::new(0);

/// Least-recently-used policy bounded by `max_size` entries.
pub struct LruEvictionPolicy<K> {
    meta_name: String,
    max: AtomicUsize,
    queue: Mutex<RecencyQueue<K>>,
}

impl<K: CacheKey> LruEvictionPolicy<K> {
    pub fn new(max: usize) -> Result<Self> {
        if max == 0 {
            return Err(GridError::Config("LRU maximum size must be > 0".into()));
        }
        let seq = LRU_POLICY_SEQ.fetch_add(1, Ordering::Relaxed);
        Ok(Self {
            meta_name: format!("holo.grid.lru.{seq}"),
            max: AtomicUsize::new(max),
            queue: Mutex::new(RecencyQueue::new()),
        })
    }

    pub fn max_size(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }

    pub fn set_max_size(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(GridError::Config("LRU maximum size must be > 0".into()));
        }
        self.max.store(max, Ordering::Relaxed);
        Ok(())
    }

    pub fn current_size(&self) -> usize {
        lock(&self.queue).len
    }

    /// Name of the metadata attribute holding queue positions.
    pub fn meta_attribute_name(&self) -> &str {
        &self.meta_name
    }

    /// Keys from least to most recently used.
    pub fn queue(&self) -> Vec<K> {
        lock(&self.queue)
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn touch(&self, entry: Arc<dyn EvictableEntry<K>>) {
        let mut queue = lock(&self.queue);
        let current = entry
            .meta(&self.meta_name)
            .and_then(|meta| meta.downcast::<QueueNode>().ok());
        if let Some(node) = current {
            queue.remove(*node);
        }
        let node = queue.push_back(entry.clone());
        entry.add_meta(&self.meta_name, Arc::new(node));
    }

    fn shrink(&self) {
        let start = self.current_size();
        for _ in 0..start {
            let victim = {
                let mut queue = lock(&self.queue);
                if queue.len <= self.max_size() {
                    return;
                }
                let victim = queue.pop_front();
                if let Some(victim) = &victim {
                    victim.remove_meta(&self.meta_name);
                }
                victim
            };
            let Some(victim) = victim else {
                return;
            };
            if !victim.evict() {
                self.touch(victim);
            }
        }
    }
}

impl<K: CacheKey> EvictionPolicy<K> for LruEvictionPolicy<K> {
    fn on_entry_accessed(&self, removed: bool, entry: Arc<dyn EvictableEntry<K>>) {
        if removed {
            let node = entry
                .remove_meta(&self.meta_name)
                .and_then(|meta| meta.downcast::<QueueNode>().ok());
            if let Some(node) = node {
                lock(&self.queue).remove(*node);
            }
        } else {
            self.touch(entry);
        }
        self.shrink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;

    struct TestEntry {
        key: String,
        meta: Mutex<HashMap<String, MetaValue>>,
        evictable: AtomicBool,
        evicted: AtomicBool,
    }

    impl TestEntry {
        fn new(key: &str) -> Arc<Self> {
            Arc::new(Self {
                key: key.to_string(),
                meta: Mutex::new(HashMap::new()),
                evictable: AtomicBool::new(true),
                evicted: AtomicBool::new(false),
            })
        }
    }

    impl EvictableEntry<String> for TestEntry {
        fn key(&self) -> &String {
            &self.key
        }

        fn meta(&self, name: &str) -> Option<MetaValue> {
            lock(&self.meta).get(name).cloned()
        }

        fn add_meta(&self, name: &str, value: MetaValue) -> Option<MetaValue> {
            lock(&self.meta).insert(name.to_string(), value)
        }

        fn remove_meta(&self, name: &str) -> Option<MetaValue> {
            lock(&self.meta).remove(name)
        }

        fn evict(&self) -> bool {
            if !self.evictable.load(Ordering::SeqCst) {
                return false;
            }
            self.evicted.store(true, Ordering::SeqCst);
            true
        }
    }

    #[test]
    fn lru_keeps_the_most_recent_entries() {
        let policy = LruEvictionPolicy::new(2).expect("policy");
        let k1 = TestEntry::new("k1");
        let k2 = TestEntry::new("k2");
        let k3 = TestEntry::new("k3");
        for entry in [&k1, &k2, &k3] {
            policy.on_entry_accessed(false, entry.clone());
        }
        assert_eq!(policy.queue(), vec!["k2".to_string(), "k3".to_string()]);
        assert!(k1.evicted.load(Ordering::SeqCst));
        assert!(k1.meta(policy.meta_attribute_name()).is_none());
        assert!(!k2.evicted.load(Ordering::SeqCst));
    }

    #[test]
    fn touch_moves_an_entry_to_the_tail() {
        let policy = LruEvictionPolicy::new(3).expect("policy");
        let a = TestEntry::new("a");
        let b = TestEntry::new("b");
        policy.on_entry_accessed(false, a.clone());
        policy.on_entry_accessed(false, b.clone());
        policy.on_entry_accessed(false, a.clone());
        assert_eq!(policy.queue(), vec!["b".to_string(), "a".to_string()]);

        policy.on_entry_accessed(true, b.clone());
        assert_eq!(policy.queue(), vec!["a".to_string()]);
        assert!(b.meta(policy.meta_attribute_name()).is_none());
    }

    #[test]
    fn refused_evictions_are_requeued() {
        let policy = LruEvictionPolicy::new(1).expect("policy");
        let locked = TestEntry::new("locked");
        locked.evictable.store(false, Ordering::SeqCst);
        let other = TestEntry::new("other");
        policy.on_entry_accessed(false, locked.clone());
        policy.on_entry_accessed(false, other.clone());
        assert!(other.evicted.load(Ordering::SeqCst));
        assert_eq!(policy.queue(), vec!["locked".to_string()]);
    }

    #[test]
    fn max_size_must_be_positive() {
        assert!(LruEvictionPolicy::<String>::new(0).is_err());
        let policy = LruEvictionPolicy::<String>::new(4).expect("policy");
        assert!(policy.set_max_size(0).is_err());
        policy.set_max_size(8).expect("resize");
        assert_eq!(policy.max_size(), 8);
    }

    #[test]
    fn always_policy_evicts_on_access_only() {
        let policy = AlwaysEvictionPolicy;
        let entry = TestEntry::new("x");
        EvictionPolicy::<String>::on_entry_accessed(&policy, true, entry.clone());
        assert!(!entry.evicted.load(Ordering::SeqCst));
        EvictionPolicy::<String>::on_entry_accessed(&policy, false, entry.clone());
        assert!(entry.evicted.load(Ordering::SeqCst));
    }
}
