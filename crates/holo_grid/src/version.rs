//! Entry and transaction versions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Node-local counter paired with the issuing node.
///
/// Versions order by counter first; equal counters break ties by node id, so
/// two nodes never produce equal versions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub counter: u64,
    pub node_id: NodeId,
}

impl Version {
    pub const fn zero() -> Self {
        Self {
            counter: 0,
            node_id: 0,
        }
    }

    pub const fn new(counter: u64, node_id: NodeId) -> Self {
        Self { counter, node_id }
    }

    pub fn is_zero(&self) -> bool {
        self.counter == 0
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.counter, self.node_id).cmp(&(other.counter, other.node_id))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.counter, self.node_id)
    }
}

fn initial_counter_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros()
        .min(u128::from(u64::MAX)) as u64
}

/// Issues strictly increasing versions for one node.
#[derive(Debug)]
pub struct VersionGenerator {
    node_id: NodeId,
    counter: AtomicU64,
}

impl VersionGenerator {
    pub fn new(node_id: NodeId) -> Self {
        Self::with_seed(node_id, initial_counter_seed())
    }

    pub fn with_seed(node_id: NodeId, seed: u64) -> Self {
        Self {
            node_id,
            counter: AtomicU64::new(seed),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn next(&self) -> Version {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Version::new(counter, self.node_id)
    }

    pub fn last(&self) -> Version {
        Version::new(self.counter.load(Ordering::SeqCst), self.node_id)
    }

    /// Move the local counter past a version observed from another node.
    pub fn on_received(&self, observed: Version) {
        self.counter.fetch_max(observed.counter, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_dominates_node_id() {
        assert!(Version::new(2, 1) > Version::new(1, 9));
        assert!(Version::new(5, 2) > Version::new(5, 1));
        assert_eq!(Version::new(5, 2), Version::new(5, 2));
    }

    #[test]
    fn observed_versions_push_the_counter_forward() {
        let versions = VersionGenerator::with_seed(1, 10);
        assert_eq!(versions.next(), Version::new(11, 1));
        versions.on_received(Version::new(100, 2));
        let next = versions.next();
        assert!(next > Version::new(100, 2));
        versions.on_received(Version::new(3, 2));
        assert!(versions.next() > next);
    }
}
