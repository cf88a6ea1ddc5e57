use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::entry::OwnerListener;
use crate::future::GridFuture;
use crate::mvcc::Candidate;
use crate::sync::lock;
use crate::types::CacheKey;
use crate::version::Version;

/// Registry of transactions active on this node.
///
/// Each active transaction has a finish future resolving to `true` on commit
/// and `false` on rollback. A bounded history of outcomes is kept so that
/// prepare responses can report which earlier transactions already finished.
pub struct TxManager {
    active: Mutex<HashMap<Version, GridFuture<bool>>>,
    completed: Mutex<VecDeque<(Version, bool)>>,
    history: usize,
    owner_changes: AtomicU64,
}

impl TxManager {
    pub fn new(history: usize) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(VecDeque::new()),
            history: history.max(1),
            owner_changes: AtomicU64::new(0),
        }
    }

    pub fn on_started(&self, xid: Version) -> GridFuture<bool> {
        lock(&self.active).entry(xid).or_default().clone()
    }

    pub fn finish_future(&self, xid: Version) -> Option<GridFuture<bool>> {
        lock(&self.active).get(&xid).cloned()
    }

    pub fn is_active(&self, xid: Version) -> bool {
        lock(&self.active).contains_key(&xid)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Record the outcome; only the first report for a version counts.
    pub fn on_finished(&self, xid: Version, committed: bool) {
        {
            let mut completed = lock(&self.completed);
            if completed.iter().any(|(v, _)| *v == xid) {
                return;
            }
            if completed.len() >= self.history {
                completed.pop_front();
            }
            completed.push_back((xid, committed));
        }
        let fut = lock(&self.active).remove(&xid);
        if let Some(fut) = fut {
            fut.on_done(committed);
        }
        tracing::debug!(xid = %xid, committed, "transaction finished");
    }

    pub fn completion(&self, xid: Version) -> Option<bool> {
        lock(&self.completed)
            .iter()
            .find(|(v, _)| *v == xid)
            .map(|(_, committed)| *committed)
    }

    /// Finished transactions ordered before `before`, split by outcome.
    pub fn completed_versions(&self, before: Version) -> (Vec<Version>, Vec<Version>) {
        let completed = lock(&self.completed);
        let mut committed = Vec::new();
        let mut rolled_back = Vec::new();
        for (xid, ok) in completed.iter().filter(|(xid, _)| *xid < before) {
            if *ok {
                committed.push(*xid);
            } else {
                rolled_back.push(*xid);
            }
        }
        (committed, rolled_back)
    }

    pub fn owner_changes(&self) -> u64 {
        self.owner_changes.load(Ordering::Relaxed)
    }
}

impl<K: CacheKey> OwnerListener<K> for TxManager {
    fn on_owner_changed(&self, key: &K, previous: Option<&Candidate>, owner: Option<&Candidate>) {
        self.owner_changes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(
            key = ?key,
            previous = ?previous.map(|c| c.version),
            owner = ?owner.map(|c| c.version),
            "lock owner changed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finish_future_resolves_with_the_outcome() {
        let tm = TxManager::new(8);
        let xid = Version::new(1, 1);
        let fut = tm.on_started(xid);
        assert!(tm.is_active(xid));
        tm.on_finished(xid, true);
        tm.on_finished(xid, false);
        assert_eq!(fut.wait().await, Ok(true));
        assert_eq!(tm.completion(xid), Some(true));
        assert!(!tm.is_active(xid));
    }

    #[test]
    fn history_is_bounded_and_split_by_outcome() {
        let tm = TxManager::new(2);
        tm.on_finished(Version::new(1, 1), true);
        tm.on_finished(Version::new(2, 1), false);
        tm.on_finished(Version::new(3, 1), true);
        assert_eq!(tm.completion(Version::new(1, 1)), None);
        let (committed, rolled_back) = tm.completed_versions(Version::new(3, 1));
        assert!(committed.is_empty());
        assert_eq!(rolled_back, vec![Version::new(2, 1)]);
    }
}
