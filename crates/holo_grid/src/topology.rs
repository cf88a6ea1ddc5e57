//! Key → partition → owner mapping across topology versions.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use crate::error::{GridError, Result};
use crate::sync::{lock, read, write};
use crate::types::{CacheKey, NodeId, PartitionId, TopologyVersion};

/// Assignments kept for version-pinned ownership queries.
const ASSIGNMENT_HISTORY: usize = 32;

/// Stable hash of a key. Every node must map a key to the same partition,
/// whatever its build or platform.
pub fn hash_key<K: Hash + ?Sized>(key: &K) -> u64 {
    let mut hasher = StableHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a with integers fed little-endian and `usize` widened to 64 bits.
#[derive(Clone, Copy, Debug)]
pub struct StableHasher(u64);

impl Default for StableHasher {
    fn default() -> Self {
        Self(FNV_OFFSET)
    }
}

impl Hasher for StableHasher {
    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.0 ^= u64::from(byte);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
    }

    fn write_u8(&mut self, i: u8) {
        self.write(&[i]);
    }

    fn write_u16(&mut self, i: u16) {
        self.write(&i.to_le_bytes());
    }

    fn write_u32(&mut self, i: u32) {
        self.write(&i.to_le_bytes());
    }

    fn write_u64(&mut self, i: u64) {
        self.write(&i.to_le_bytes());
    }

    fn write_u128(&mut self, i: u128) {
        self.write(&i.to_le_bytes());
    }

    fn write_usize(&mut self, i: usize) {
        self.write_u64(i as u64);
    }

    fn write_i8(&mut self, i: i8) {
        self.write_u8(i as u8);
    }

    fn write_i16(&mut self, i: i16) {
        self.write_u16(i as u16);
    }

    fn write_i32(&mut self, i: i32) {
        self.write_u32(i as u32);
    }

    fn write_i64(&mut self, i: i64) {
        self.write_u64(i as u64);
    }

    fn write_i128(&mut self, i: i128) {
        self.write_u128(i as u128);
    }

    fn write_isize(&mut self, i: isize) {
        self.write_u64(i as u64);
    }

    fn finish(&self) -> u64 {
        self.0
    }
}

/// Injected assignment of partitions to nodes.
///
/// `owners_of` must be a pure function of its arguments; the first node is
/// the primary, the rest are backups.
pub trait AffinityFunction: Send + Sync + 'static {
    fn partitions(&self) -> u32;
    fn owners_of(&self, partition: PartitionId, topology_version: TopologyVersion) -> Vec<NodeId>;
}

/// Affinity backed by a closure.
pub struct FnAffinity<F> {
    partitions: u32,
    f: F,
}

impl<F> FnAffinity<F>
where
    F: Fn(PartitionId, TopologyVersion) -> Vec<NodeId> + Send + Sync + 'static,
{
    pub fn new(partitions: u32, f: F) -> Self {
        Self { partitions, f }
    }
}

impl<F> AffinityFunction for FnAffinity<F>
where
    F: Fn(PartitionId, TopologyVersion) -> Vec<NodeId> + Send + Sync + 'static,
{
    fn partitions(&self) -> u32 {
        self.partitions
    }

    fn owners_of(&self, partition: PartitionId, topology_version: TopologyVersion) -> Vec<NodeId> {
        (self.f)(partition, topology_version)
    }
}

/// Highest-random-weight assignment over the node set of each topology version.
pub struct RendezvousAffinity {
    partitions: u32,
    backups: usize,
    members: RwLock<BTreeMap<TopologyVersion, Vec<NodeId>>>,
}

impl RendezvousAffinity {
    pub fn new(partitions: u32, backups: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            backups,
            members: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record the node set that became current at `version`.
    pub fn set_nodes(&self, version: TopologyVersion, nodes: Vec<NodeId>) {
        write(&self.members).insert(version, nodes);
    }
}

impl AffinityFunction for RendezvousAffinity {
    fn partitions(&self) -> u32 {
        self.partitions
    }

    fn owners_of(&self, partition: PartitionId, topology_version: TopologyVersion) -> Vec<NodeId> {
        let members = read(&self.members);
        let Some((_, nodes)) = members.range(..=topology_version).next_back() else {
            return Vec::new();
        };
        let mut ranked: Vec<(u64, NodeId)> = nodes
            .iter()
            .map(|node| (hash_key(&(partition, *node)), *node))
            .collect();
        ranked.sort_unstable_by(|a, b| b.cmp(a));
        ranked
            .into_iter()
            .take(self.backups + 1)
            .map(|(_, node)| node)
            .collect()
    }
}

/// A partition owned by the local node.
#[derive(Debug)]
pub struct LocalPartition<K> {
    id: PartitionId,
    owned_since: TopologyVersion,
    valid: AtomicBool,
    keys: Mutex<HashSet<K>>,
}

impl<K: CacheKey> LocalPartition<K> {
    fn new(id: PartitionId, owned_since: TopologyVersion) -> Self {
        Self {
            id,
            owned_since,
            valid: AtomicBool::new(true),
            keys: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn owned_since(&self) -> TopologyVersion {
        self.owned_since
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Register a key; refused once the partition is invalid.
    pub fn add(&self, key: K) -> bool {
        let mut keys = lock(&self.keys);
        if !self.is_valid() {
            return false;
        }
        keys.insert(key);
        true
    }

    pub fn remove(&self, key: &K) -> bool {
        lock(&self.keys).remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.keys).contains(key)
    }

    pub fn size(&self) -> usize {
        lock(&self.keys).len()
    }

    pub fn keys(&self) -> Vec<K> {
        lock(&self.keys).iter().cloned().collect()
    }

    fn invalidate(&self) {
        let _keys = lock(&self.keys);
        self.valid.store(false, Ordering::Release);
    }
}

pub struct TopologyState<K> {
    version: TopologyVersion,
    assignments: BTreeMap<TopologyVersion, Arc<Vec<Vec<NodeId>>>>,
    local: HashMap<PartitionId, Arc<LocalPartition<K>>>,
}

impl<K> TopologyState<K> {
    pub fn version(&self) -> TopologyVersion {
        self.version
    }
}

/// Read side of the topology lock; topology changes wait until it drops.
pub type TopologyReadGuard<'a, K> = RwLockReadGuard<'a, TopologyState<K>>;

pub struct PartitionTopology<K> {
    local_node: NodeId,
    affinity: Arc<dyn AffinityFunction>,
    state: RwLock<TopologyState<K>>,
}

impl<K: CacheKey> PartitionTopology<K> {
    pub fn new(
        local_node: NodeId,
        affinity: Arc<dyn AffinityFunction>,
        version: TopologyVersion,
    ) -> Self {
        let assignment = assign(affinity.as_ref(), version);
        let local = owned_partitions(&assignment, local_node)
            .map(|id| (id, Arc::new(LocalPartition::new(id, version))))
            .collect();
        let mut assignments = BTreeMap::new();
        assignments.insert(version, assignment);
        Self {
            local_node,
            affinity,
            state: RwLock::new(TopologyState {
                version,
                assignments,
                local,
            }),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.local_node
    }

    pub fn partitions(&self) -> u32 {
        self.affinity.partitions().max(1)
    }

    pub fn version(&self) -> TopologyVersion {
        read(&self.state).version
    }

    pub fn read_lock(&self) -> TopologyReadGuard<'_, K> {
        read(&self.state)
    }

    pub fn partition(&self, key: &K) -> PartitionId {
        (hash_key(key) % u64::from(self.partitions())) as PartitionId
    }

    /// Owners of a partition at a version, or at the latest one for `None`.
    ///
    /// Versions newer than the local one are rejected: their assignment is
    /// not known here yet.
    pub fn owners(&self, partition: PartitionId, version: Option<TopologyVersion>) -> Result<Vec<NodeId>> {
        let state = read(&self.state);
        self.owners_in(&state, partition, version)
    }

    fn owners_in(
        &self,
        state: &TopologyState<K>,
        partition: PartitionId,
        version: Option<TopologyVersion>,
    ) -> Result<Vec<NodeId>> {
        let version = version.unwrap_or(state.version);
        if version > state.version {
            return Err(GridError::UnknownTopology {
                requested: version,
                current: state.version,
            });
        }
        Ok(match state.assignments.range(..=version).next_back() {
            Some((_, assignment)) => assignment
                .get(partition as usize)
                .cloned()
                .unwrap_or_default(),
            None => self.affinity.owners_of(partition, version),
        })
    }

    pub fn key_owners(&self, key: &K, version: Option<TopologyVersion>) -> Result<Vec<NodeId>> {
        self.owners(self.partition(key), version)
    }

    /// Primary owner of a key.
    pub fn owning_node(&self, key: &K, version: Option<TopologyVersion>) -> Result<NodeId> {
        let partition = self.partition(key);
        self.owners(partition, version)?
            .first()
            .copied()
            .ok_or(GridError::InvalidPartition { partition })
    }

    /// False also for versions this node does not know yet.
    pub fn belongs(&self, node: NodeId, key: &K, version: Option<TopologyVersion>) -> bool {
        self.key_owners(key, version)
            .is_ok_and(|owners| owners.contains(&node))
    }

    pub fn local_owns(&self, key: &K, version: Option<TopologyVersion>) -> bool {
        self.belongs(self.local_node, key, version)
    }

    /// Register a new entry with its local partition.
    pub fn on_added(
        &self,
        version: Option<TopologyVersion>,
        key: &K,
    ) -> Result<Arc<LocalPartition<K>>> {
        let partition = self.partition(key);
        let state = read(&self.state);
        if !self
            .owners_in(&state, partition, version)?
            .contains(&self.local_node)
        {
            return Err(GridError::InvalidPartition { partition });
        }
        let local = state
            .local
            .get(&partition)
            .ok_or(GridError::InvalidPartition { partition })?;
        if !local.add(key.clone()) {
            return Err(GridError::InvalidPartition { partition });
        }
        Ok(local.clone())
    }

    pub fn on_removed(&self, key: &K) -> bool {
        let partition = self.partition(key);
        match read(&self.state).local.get(&partition) {
            Some(local) => local.remove(key),
            None => false,
        }
    }

    pub fn local_partition(&self, partition: PartitionId) -> Option<Arc<LocalPartition<K>>> {
        read(&self.state).local.get(&partition).cloned()
    }

    pub fn is_valid(&self, partition: PartitionId) -> bool {
        self.local_partition(partition)
            .is_some_and(|local| local.is_valid())
    }

    pub fn local_partitions(&self) -> Vec<Arc<LocalPartition<K>>> {
        let mut parts: Vec<_> = read(&self.state).local.values().cloned().collect();
        parts.sort_by_key(|part| part.id());
        parts
    }

    /// Group keys by primary owner at a version.
    pub fn map_keys<'a, I>(&self, keys: I, version: TopologyVersion) -> Result<BTreeMap<NodeId, Vec<K>>>
    where
        I: IntoIterator<Item = &'a K>,
    {
        let state = read(&self.state);
        self.map_keys_in(&state, keys, version)
    }

    /// `map_keys` for a caller already holding the topology read lock.
    pub fn map_keys_in<'a, I>(
        &self,
        state: &TopologyState<K>,
        keys: I,
        version: TopologyVersion,
    ) -> Result<BTreeMap<NodeId, Vec<K>>>
    where
        I: IntoIterator<Item = &'a K>,
    {
        let mut mapped: BTreeMap<NodeId, Vec<K>> = BTreeMap::new();
        for key in keys {
            let partition = self.partition(key);
            let primary = self
                .owners_in(state, partition, Some(version))?
                .first()
                .copied()
                .ok_or(GridError::InvalidPartition { partition })?;
            mapped.entry(primary).or_default().push(key.clone());
        }
        Ok(mapped)
    }

    /// Install a new topology version.
    ///
    /// Returns the partitions the local node stopped owning; they are already
    /// invalid and detached from the topology.
    pub fn on_topology_changed(&self, version: TopologyVersion) -> Vec<Arc<LocalPartition<K>>> {
        let mut state = write(&self.state);
        if version <= state.version {
            tracing::warn!(
                current = state.version,
                proposed = version,
                "ignoring stale topology version"
            );
            return Vec::new();
        }
        let assignment = assign(self.affinity.as_ref(), version);
        let owned: HashSet<PartitionId> = owned_partitions(&assignment, self.local_node).collect();
        state.assignments.insert(version, assignment);
        while state.assignments.len() > ASSIGNMENT_HISTORY {
            state.assignments.pop_first();
        }
        state.version = version;

        let lost_ids: Vec<PartitionId> = state
            .local
            .keys()
            .copied()
            .filter(|id| !owned.contains(id))
            .collect();
        let mut lost = Vec::with_capacity(lost_ids.len());
        for id in lost_ids {
            if let Some(part) = state.local.remove(&id) {
                part.invalidate();
                lost.push(part);
            }
        }
        for id in owned {
            state
                .local
                .entry(id)
                .or_insert_with(|| Arc::new(LocalPartition::new(id, version)));
        }
        tracing::debug!(
            node_id = self.local_node,
            version,
            lost = lost.len(),
            "topology changed"
        );
        lost
    }
}

fn assign(affinity: &dyn AffinityFunction, version: TopologyVersion) -> Arc<Vec<Vec<NodeId>>> {
    Arc::new(
        (0..affinity.partitions().max(1))
            .map(|partition| affinity.owners_of(partition, version))
            .collect(),
    )
}

fn owned_partitions(
    assignment: &[Vec<NodeId>],
    node: NodeId,
) -> impl Iterator<Item = PartitionId> + '_ {
    assignment
        .iter()
        .enumerate()
        .filter(move |(_, owners)| owners.contains(&node))
        .map(|(id, _)| id as PartitionId)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Partition p is owned by node (p % 2) + 1 until version 2, after which
    /// node 1 owns everything.
    fn affinity() -> Arc<dyn AffinityFunction> {
        Arc::new(FnAffinity::new(4, |partition, version| {
            if version >= 2 {
                vec![1]
            } else {
                vec![u64::from(partition % 2) + 1]
            }
        }))
    }

    fn key_in(topology: &PartitionTopology<String>, partition: PartitionId) -> String {
        (0..)
            .map(|i| format!("key-{i}"))
            .find(|key| topology.partition(key) == partition)
            .expect("some key hashes to every partition")
    }

    #[test]
    fn ownership_is_pinned_per_version() {
        let topology = PartitionTopology::<String>::new(2, affinity(), 1);
        let key = key_in(&topology, 1);
        assert_eq!(topology.owning_node(&key, Some(1)).expect("owner"), 2);

        let lost = topology.on_topology_changed(2);
        assert_eq!(lost.len(), 2);
        assert!(lost.iter().all(|part| !part.is_valid()));
        assert_eq!(topology.owning_node(&key, Some(1)).expect("owner"), 2);
        assert_eq!(topology.owning_node(&key, None).expect("owner"), 1);
    }

    #[test]
    fn registrations_require_a_valid_local_partition() {
        let topology = PartitionTopology::<String>::new(2, affinity(), 1);
        let owned = key_in(&topology, 1);
        let foreign = key_in(&topology, 0);

        let part = topology.on_added(None, &owned).expect("owned");
        assert!(part.contains(&owned));
        assert!(matches!(
            topology.on_added(None, &foreign),
            Err(GridError::InvalidPartition { partition: 0 })
        ));

        topology.on_topology_changed(2);
        assert!(!part.is_valid());
        assert!(!part.add(owned.clone()));
        assert!(topology.on_added(None, &owned).is_err());
    }

    #[test]
    fn future_versions_are_not_guessed() {
        let topology = PartitionTopology::<String>::new(2, affinity(), 1);
        let key = key_in(&topology, 1);
        assert_eq!(
            topology.owning_node(&key, Some(2)),
            Err(GridError::UnknownTopology {
                requested: 2,
                current: 1
            })
        );
        assert!(!topology.belongs(2, &key, Some(2)));
        assert!(matches!(
            topology.on_added(Some(2), &key),
            Err(GridError::UnknownTopology { .. })
        ));

        topology.on_topology_changed(2);
        assert_eq!(topology.owning_node(&key, Some(2)).expect("owner"), 1);
    }

    fn fnv1a(bytes: &[u8]) -> u64 {
        bytes.iter().fold(FNV_OFFSET, |hash, &byte| {
            (hash ^ u64::from(byte)).wrapping_mul(FNV_PRIME)
        })
    }

    #[test]
    fn key_hashes_are_fixed_across_builds() {
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        // `str` hashes its bytes followed by a 0xff terminator.
        assert_eq!(hash_key("abc"), fnv1a(b"abc\xff"));
        assert_eq!(hash_key(&7u64), fnv1a(&7u64.to_le_bytes()));
        assert_eq!(hash_key(&7usize), hash_key(&7u64));
    }

    #[test]
    fn stale_versions_are_ignored() {
        let topology = PartitionTopology::<String>::new(1, affinity(), 3);
        assert!(topology.on_topology_changed(2).is_empty());
        assert_eq!(topology.version(), 3);
    }

    #[test]
    fn rendezvous_picks_primary_and_backups_from_members() {
        let affinity = RendezvousAffinity::new(8, 1);
        affinity.set_nodes(1, vec![1, 2, 3]);
        for partition in 0..8 {
            let owners = affinity.owners_of(partition, 1);
            assert_eq!(owners.len(), 2);
            assert_ne!(owners[0], owners[1]);
            assert_eq!(owners, affinity.owners_of(partition, 5));
        }
        assert!(affinity.owners_of(0, 0).is_empty());
    }
}
