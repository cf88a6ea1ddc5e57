//! Transactions: the per-node transaction registry, per-node key mappings
//! and the near-local coordinator driving two-phase commit.

mod manager;
mod mapping;
mod near_local;

pub use manager::TxManager;
pub use mapping::{TxEntry, TxMapping, TxOperation};
pub use near_local::{NearTxLocal, TxOptions};
