//! Transactional partitioned cache core.
//!
//! Keys are hashed to partitions and partitions are assigned to nodes by an
//! injected affinity function. Each node keeps the partitions it owns in its
//! DHT storage and caches other nodes' keys in a near storage whose readers
//! the owners invalidate on commit. Every entry carries an MVCC lock queue;
//! transactions lock, validate and apply through it with a two-phase
//! prepare/finish protocol driven by the node that started them.
//!
//! Higher layers supply a [`Transport`], a [`Membership`] view and
//! [`Marshaller`]s, then build a [`GridCache`] per node.

pub mod cache;
pub mod config;
pub mod context;
pub mod dht;
pub mod entry;
pub mod error;
pub mod eviction;
pub mod future;
pub mod mvcc;
pub mod near;
pub mod topology;
pub mod transport;
pub mod tx;
pub mod types;
pub mod version;

mod sync;

pub use cache::{GridCache, GridCacheBuilder};
pub use config::CacheConfig;
pub use error::{GridError, Result};
pub use future::GridFuture;
pub use topology::{AffinityFunction, FnAffinity, RendezvousAffinity};
pub use transport::{CacheStore, JsonMarshaller, Marshaller, Membership, Transport};
pub use tx::{NearTxLocal, TxOptions};
pub use types::{CacheKey, CacheValue, Concurrency, InternalKey, Isolation, NodeId, PeekMode, TxState};
pub use version::Version;
