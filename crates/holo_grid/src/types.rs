//! Shared identifiers, key/value bounds and transaction enums.

use std::fmt::Debug;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Logical node identifier within the grid.
pub type NodeId = u64;
/// Partition identifier produced by hashing a key.
pub type PartitionId = u32;
/// Monotonic version of the cluster membership/assignment.
pub type TopologyVersion = u64;
/// Caller-supplied thread (or task) identity used for lock reentry.
pub type ThreadId = u64;

/// Bounds required from cache keys.
///
/// `is_internal` marks keys of the reserved internal class; those keys are
/// never handed to eviction policies and are skipped by key iteration.
pub trait CacheKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {
    fn is_internal(&self) -> bool {
        false
    }
}

impl CacheKey for String {}
impl CacheKey for Vec<u8> {}
impl CacheKey for u64 {}
impl CacheKey for i64 {}
impl CacheKey for u32 {}

/// Bounds required from cache values.
pub trait CacheValue: Clone + Debug + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Debug + Send + Sync + 'static {}

/// Key of the reserved internal class (grid bookkeeping such as sequences
/// and latches stored next to user data).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InternalKey(pub String);

impl CacheKey for InternalKey {
    fn is_internal(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Concurrency {
    /// Locks are taken at prepare time and read versions are validated.
    Optimistic,
    /// Locks are taken eagerly on every read and write.
    Pessimistic,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Isolation {
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl Isolation {
    /// Whether reads record the observed version for later validation.
    pub fn tracks_read_versions(self) -> bool {
        !matches!(self, Isolation::ReadCommitted)
    }
}

/// Where a `peek` looks for a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeekMode {
    /// Near storage first, then the local DHT partition.
    Smart,
    /// Committed value wherever it lives locally (near or DHT).
    Global,
    /// Near storage only.
    NearOnly,
    /// Local DHT partition only.
    PartitionedOnly,
    /// Persistent store only.
    Db,
}

/// Lifecycle of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxState {
    Active,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Unknown,
}

impl TxState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TxState::Committed | TxState::RolledBack | TxState::Unknown
        )
    }

    /// Legal forward transitions of the state machine.
    pub fn can_transition_to(self, next: TxState) -> bool {
        use TxState::*;
        match (self, next) {
            (Active, Preparing) | (Active, RollingBack) => true,
            (Preparing, Prepared) | (Preparing, RollingBack) | (Preparing, Unknown) => true,
            (Prepared, Committing) | (Prepared, RollingBack) | (Prepared, Unknown) => true,
            (Committing, Committed) | (Committing, Unknown) => true,
            (RollingBack, RolledBack) | (RollingBack, Unknown) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TxState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TxState::Active => "ACTIVE",
            TxState::Preparing => "PREPARING",
            TxState::Prepared => "PREPARED",
            TxState::Committing => "COMMITTING",
            TxState::Committed => "COMMITTED",
            TxState::RollingBack => "ROLLING_BACK",
            TxState::RolledBack => "ROLLED_BACK",
            TxState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}
