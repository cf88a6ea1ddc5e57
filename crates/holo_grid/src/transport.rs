//! Node-boundary collaborators and message types.
//!
//! Keys and values cross the boundary as marshalled bytes; every response
//! carries an optional [`GridError`] so remote failures keep their kind.

use std::marker::PhantomData;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::GridError;
use crate::types::{Concurrency, Isolation, NodeId, ThreadId, TopologyVersion};
use crate::version::Version;

/// Cluster membership as seen by the local node.
pub trait Membership: Send + Sync + 'static {
    fn local_node_id(&self) -> NodeId;
    fn is_alive(&self, node: NodeId) -> bool;
    /// Whether `node` runs a near cache (and therefore registers as reader).
    fn has_near_cache(&self, node: NodeId) -> bool;
}

/// Request/response messaging between grid nodes.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn prepare(&self, target: NodeId, req: PrepareRequest) -> anyhow::Result<PrepareResponse>;
    async fn finish(&self, target: NodeId, req: FinishRequest) -> anyhow::Result<FinishResponse>;
    async fn lock(&self, target: NodeId, req: LockRequest) -> anyhow::Result<LockResponse>;
    async fn get(&self, target: NodeId, req: GetRequest) -> anyhow::Result<GetResponse>;
    async fn invalidate(&self, target: NodeId, req: InvalidateRequest) -> anyhow::Result<()>;
    async fn remove_reader(
        &self,
        target: NodeId,
        req: RemoveReaderRequest,
    ) -> anyhow::Result<bool>;
}

pub trait Marshaller<T>: Send + Sync + 'static {
    fn encode(&self, value: &T) -> anyhow::Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> anyhow::Result<T>;
}

/// JSON marshaller for any serde type.
pub struct JsonMarshaller<T>(PhantomData<fn() -> T>);

impl<T> JsonMarshaller<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for JsonMarshaller<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Marshaller<T> for JsonMarshaller<T>
where
    T: Serialize + DeserializeOwned + 'static,
{
    fn encode(&self, value: &T) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> anyhow::Result<T> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Optional persistent backing store.
pub trait CacheStore<K, V>: Send + Sync + 'static {
    fn load(&self, key: &K) -> anyhow::Result<Option<V>>;
    /// Persist a committed write; `None` removes the key.
    fn store(&self, key: &K, value: Option<&V>) -> anyhow::Result<()>;
}

/// Operation on one key inside a transaction message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxOp {
    Read,
    Update(Vec<u8>),
    Delete,
}

impl TxOp {
    pub fn is_write(&self) -> bool {
        !matches!(self, TxOp::Read)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxEntryMessage {
    pub key: Vec<u8>,
    pub op: TxOp,
    /// Version the coordinator observed when it read the key.
    pub expected_version: Option<Version>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub near_node: NodeId,
    pub xid: Version,
    pub commit_version: Version,
    pub thread_id: ThreadId,
    pub topology_version: TopologyVersion,
    pub concurrency: Concurrency,
    pub isolation: Isolation,
    pub timeout_ms: u64,
    pub entries: Vec<TxEntryMessage>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PrepareResponse {
    /// Version of the transaction on the responding node.
    pub dht_version: Option<Version>,
    pub committed: Vec<Version>,
    pub rolled_back: Vec<Version>,
    pub error: Option<GridError>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinishRequest {
    pub near_node: NodeId,
    pub xid: Version,
    pub commit: bool,
    pub commit_version: Version,
    pub topology_version: TopologyVersion,
    /// Writes to apply on commit.
    pub entries: Vec<TxEntryMessage>,
    /// Sent by a primary to its backups for an already-decided commit.
    pub backup: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FinishResponse {
    pub error: Option<GridError>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LockRequest {
    pub near_node: NodeId,
    pub xid: Version,
    pub thread_id: ThreadId,
    pub topology_version: TopologyVersion,
    pub key: Vec<u8>,
    pub timeout_ms: u64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LockResponse {
    pub acquired: bool,
    pub value: Option<Vec<u8>>,
    pub version: Option<Version>,
    pub error: Option<GridError>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRequest {
    pub near_node: NodeId,
    pub msg_id: u64,
    pub topology_version: TopologyVersion,
    pub key: Vec<u8>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GetResponse {
    pub value: Option<Vec<u8>>,
    pub version: Option<Version>,
    /// The requester is a registered reader and may keep a near copy.
    #[serde(default)]
    pub cacheable: bool,
    pub error: Option<GridError>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InvalidateRequest {
    pub origin: NodeId,
    pub keys: Vec<Vec<u8>>,
    pub version: Version,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoveReaderRequest {
    pub near_node: NodeId,
    pub key: Vec<u8>,
    pub msg_id: u64,
}
