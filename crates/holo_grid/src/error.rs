//! Error taxonomy shared by entries, caches and transactions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{PartitionId, TopologyVersion};
use crate::version::Version;

/// Errors surfaced by the grid.
///
/// Errors are `Clone` because a single future outcome is handed to every
/// waiter, and serializable because failures of remote nodes travel back in
/// responses.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GridError {
    /// The entry was marked obsolete; re-fetch and retry.
    #[error("entry has been removed: {key}")]
    EntryRemoved { key: String },
    #[error("lock request was cancelled for version {version}")]
    LockCancelled { version: Version },
    #[error("partition {partition} is not valid on this node")]
    InvalidPartition { partition: PartitionId },
    #[error("topology version {requested} is ahead of the local version {current}")]
    UnknownTopology {
        requested: TopologyVersion,
        current: TopologyVersion,
    },
    #[error("optimistic conflict: {0}")]
    OptimisticConflict(String),
    #[error("transaction timed out: {0}")]
    TransactionTimeout(String),
    #[error("invalid transaction state: {0}")]
    InvalidState(String),
    /// Outcome of a transaction could not be determined.
    #[error("heuristic transaction failure: {0}")]
    Heuristic(String),
    #[error("{message}: {cause}")]
    Rollback {
        message: String,
        cause: Box<GridError>,
    },
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("marshalling failure: {0}")]
    Marshal(String),
    #[error("store failure: {0}")]
    Store(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = GridError> = std::result::Result<T, E>;

impl GridError {
    pub fn entry_removed(key: &impl std::fmt::Debug) -> Self {
        GridError::EntryRemoved {
            key: format!("{key:?}"),
        }
    }

    pub fn rollback(message: impl Into<String>, cause: GridError) -> Self {
        GridError::Rollback {
            message: message.into(),
            cause: Box::new(cause),
        }
    }

    pub fn is_entry_removed(&self) -> bool {
        matches!(self, GridError::EntryRemoved { .. })
    }

    /// Innermost error behind any rollback wrappers.
    pub fn root_cause(&self) -> &GridError {
        let mut current = self;
        while let GridError::Rollback { cause, .. } = current {
            current = cause;
        }
        current
    }

    pub fn is_optimistic_conflict(&self) -> bool {
        matches!(self.root_cause(), GridError::OptimisticConflict(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root_cause(), GridError::TransactionTimeout(_))
    }

    pub(crate) fn transport(err: anyhow::Error) -> Self {
        GridError::Transport(format!("{err:#}"))
    }

    pub(crate) fn marshal(err: anyhow::Error) -> Self {
        GridError::Marshal(format!("{err:#}"))
    }

    pub(crate) fn store(err: anyhow::Error) -> Self {
        GridError::Store(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_wrapper_exposes_root_cause() {
        let err = GridError::rollback(
            "failed to prepare transaction",
            GridError::OptimisticConflict("key B changed".into()),
        );
        assert!(err.is_optimistic_conflict());
        let msg = err.to_string();
        assert!(msg.contains("failed to prepare transaction"), "{msg}");
        assert!(msg.contains("key B changed"), "{msg}");
    }

    #[test]
    fn errors_survive_a_json_round_trip() {
        let err = GridError::LockCancelled {
            version: Version::new(7, 3),
        };
        let json = serde_json::to_string(&err).expect("encode");
        let decoded: GridError = serde_json::from_str(&json).expect("decode");
        assert_eq!(decoded, err);
    }
}
