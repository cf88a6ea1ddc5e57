//! Shared helpers for integration tests.
//!
//! `InMemoryNetwork` routes requests between `GridCache` nodes living in the
//! same process. Nodes can be marked down (requests fail, membership reports
//! them dead) or as running without a near cache.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use holo_grid::transport::{
    FinishRequest, FinishResponse, GetRequest, GetResponse, InvalidateRequest, LockRequest,
    LockResponse, PrepareRequest, PrepareResponse, RemoveReaderRequest,
};
use holo_grid::{
    AffinityFunction, CacheConfig, CacheStore, FnAffinity, GridCache, Membership, NodeId,
    Transport,
};

pub type TestCache = GridCache<String, String>;

/// Partitions used by the test affinities.
pub const PARTITIONS: u32 = 8;

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[derive(Default)]
pub struct InMemoryNetwork {
    nodes: RwLock<HashMap<NodeId, Weak<TestCache>>>,
    down: RwLock<HashSet<NodeId>>,
    without_near: RwLock<HashSet<NodeId>>,
}

impl InMemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, node: &Arc<TestCache>) {
        self.nodes
            .write()
            .expect("nodes lock")
            .insert(node.node_id(), Arc::downgrade(node));
    }

    pub fn set_alive(&self, node: NodeId, alive: bool) {
        let mut down = self.down.write().expect("down lock");
        if alive {
            down.remove(&node);
        } else {
            down.insert(node);
        }
    }

    pub fn set_near_cache(&self, node: NodeId, enabled: bool) {
        let mut without = self.without_near.write().expect("near lock");
        if enabled {
            without.remove(&node);
        } else {
            without.insert(node);
        }
    }

    pub fn is_alive(&self, node: NodeId) -> bool {
        !self.down.read().expect("down lock").contains(&node)
            && self.nodes.read().expect("nodes lock").contains_key(&node)
    }

    fn node(&self, target: NodeId) -> anyhow::Result<Arc<TestCache>> {
        if self.down.read().expect("down lock").contains(&target) {
            anyhow::bail!("node {target} is unreachable");
        }
        self.nodes
            .read()
            .expect("nodes lock")
            .get(&target)
            .and_then(Weak::upgrade)
            .ok_or_else(|| anyhow::anyhow!("unknown node {target}"))
    }
}

/// One node's view of the network.
pub struct NodeLink {
    network: Arc<InMemoryNetwork>,
    node_id: NodeId,
}

impl Membership for NodeLink {
    fn local_node_id(&self) -> NodeId {
        self.node_id
    }

    fn is_alive(&self, node: NodeId) -> bool {
        self.network.is_alive(node)
    }

    fn has_near_cache(&self, node: NodeId) -> bool {
        !self
            .network
            .without_near
            .read()
            .expect("near lock")
            .contains(&node)
    }
}

#[async_trait]
impl Transport for NodeLink {
    async fn prepare(&self, target: NodeId, req: PrepareRequest) -> anyhow::Result<PrepareResponse> {
        Ok(self.network.node(target)?.handle_prepare(req).await)
    }

    async fn finish(&self, target: NodeId, req: FinishRequest) -> anyhow::Result<FinishResponse> {
        Ok(self.network.node(target)?.handle_finish(req).await)
    }

    async fn lock(&self, target: NodeId, req: LockRequest) -> anyhow::Result<LockResponse> {
        Ok(self.network.node(target)?.handle_lock(req).await)
    }

    async fn get(&self, target: NodeId, req: GetRequest) -> anyhow::Result<GetResponse> {
        Ok(self.network.node(target)?.handle_get(req).await)
    }

    async fn invalidate(&self, target: NodeId, req: InvalidateRequest) -> anyhow::Result<()> {
        self.network.node(target)?.handle_invalidate(req);
        Ok(())
    }

    async fn remove_reader(&self, target: NodeId, req: RemoveReaderRequest) -> anyhow::Result<bool> {
        Ok(self.network.node(target)?.handle_remove_reader(req))
    }
}

/// Partition `p` goes to node `p % nodes + 1`, followed by `backups` next nodes.
pub fn round_robin_affinity(nodes: u64, backups: usize) -> Arc<dyn AffinityFunction> {
    Arc::new(FnAffinity::new(PARTITIONS, move |partition, _version| {
        (0..=backups as u64)
            .map(|offset| (u64::from(partition) + offset) % nodes + 1)
            .collect()
    }))
}

/// Store backed by a map, recording every write.
#[derive(Default)]
pub struct MemoryStore {
    pub data: Mutex<HashMap<String, String>>,
    pub writes: Mutex<Vec<(String, Option<String>)>>,
    pub fail_writes: AtomicBool,
}

impl CacheStore<String, String> for MemoryStore {
    fn load(&self, key: &String) -> anyhow::Result<Option<String>> {
        Ok(self.data.lock().expect("store lock").get(key).cloned())
    }

    fn store(&self, key: &String, value: Option<&String>) -> anyhow::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            anyhow::bail!("store rejected write of {key}");
        }
        let mut data = self.data.lock().expect("store lock");
        match value {
            Some(value) => data.insert(key.clone(), value.clone()),
            None => data.remove(key),
        };
        self.writes
            .lock()
            .expect("store lock")
            .push((key.clone(), value.cloned()));
        Ok(())
    }
}

pub struct Cluster {
    pub network: Arc<InMemoryNetwork>,
    pub nodes: Vec<Arc<TestCache>>,
}

impl Cluster {
    pub fn start(nodes: u64, config: CacheConfig, affinity: Arc<dyn AffinityFunction>) -> Self {
        Self::start_with_store(nodes, config, affinity, None)
    }

    pub fn start_with_store(
        nodes: u64,
        config: CacheConfig,
        affinity: Arc<dyn AffinityFunction>,
        store: Option<Arc<MemoryStore>>,
    ) -> Self {
        init_tracing();
        let network = InMemoryNetwork::new();
        let nodes = (1..=nodes)
            .map(|node_id| {
                let link = Arc::new(NodeLink {
                    network: network.clone(),
                    node_id,
                });
                let mut builder =
                    TestCache::builder(config.clone(), link.clone(), link, affinity.clone())
                        .with_json_marshallers();
                if let Some(store) = &store {
                    builder = builder.store(store.clone());
                }
                let node = builder.build().expect("build cache");
                network.register(&node);
                node
            })
            .collect();
        Self { network, nodes }
    }

    pub fn node(&self, node_id: NodeId) -> &Arc<TestCache> {
        &self.nodes[(node_id - 1) as usize]
    }

    /// First `prefix-N` key whose primary is `owner`.
    pub fn key_owned_by(&self, owner: NodeId, prefix: &str) -> String {
        let topology = &self.nodes[0].context().topology;
        (0..10_000)
            .map(|i| format!("{prefix}-{i}"))
            .find(|key| topology.owning_node(key, None).ok() == Some(owner))
            .expect("no key maps to the requested owner")
    }
}

/// Poll `check` until it holds or the timeout expires.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
