//! Lock candidates and the per-entry candidate queue.
//!
//! The queue is a doubly-linked list threaded through a slot vector. Handles
//! carry the slot index plus a generation counter, so a handle kept after its
//! candidate left the queue can never alias a newer candidate in the same slot.

use std::time::Duration;

use crate::types::{NodeId, ThreadId, TopologyVersion};
use crate::version::Version;

/// How long a lock request is willing to wait behind another owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockTimeout {
    /// Fail with "not acquired" instead of queueing.
    NoWait,
    After(Duration),
    Unbounded,
}

impl LockTimeout {
    /// Negative means no wait, zero means unbounded.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => LockTimeout::NoWait,
            0 => LockTimeout::Unbounded,
            ms => LockTimeout::After(Duration::from_millis(ms as u64)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CandidateStatus {
    Waiting,
    Owner,
    Released,
    Cancelled,
}

/// Stable reference to a queued candidate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CandidateRef {
    slot: u32,
    generation: u32,
}

/// Parameters of a lock request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateSpec {
    pub node_id: NodeId,
    pub version: Version,
    /// Paired version on the other side (near <-> DHT).
    pub other_version: Option<Version>,
    pub thread_id: ThreadId,
    pub timeout: LockTimeout,
    pub reentry: bool,
    pub read: bool,
    pub implicit_single: bool,
    pub local: bool,
    pub tx: bool,
    pub topology_version: Option<TopologyVersion>,
}

impl CandidateSpec {
    pub fn new(node_id: NodeId, version: Version, thread_id: ThreadId) -> Self {
        Self {
            node_id,
            version,
            other_version: None,
            thread_id,
            timeout: LockTimeout::Unbounded,
            reentry: false,
            read: false,
            implicit_single: false,
            local: true,
            tx: true,
            topology_version: None,
        }
    }

    pub fn with_timeout(mut self, timeout: LockTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_other_version(mut self, other: Version) -> Self {
        self.other_version = Some(other);
        self
    }

    pub fn reentrant(mut self) -> Self {
        self.reentry = true;
        self
    }

    pub fn remote(mut self) -> Self {
        self.local = false;
        self
    }
}

/// Snapshot of a queued lock request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub handle: CandidateRef,
    pub node_id: NodeId,
    pub version: Version,
    pub other_version: Option<Version>,
    pub thread_id: ThreadId,
    pub timeout: LockTimeout,
    /// Set on the copy returned for a reentrant request.
    pub reentry: bool,
    pub read: bool,
    pub implicit_single: bool,
    pub local: bool,
    pub tx: bool,
    pub topology_version: Option<TopologyVersion>,
    pub status: CandidateStatus,
    /// Every transaction ahead of this one has been resolved remotely.
    pub ready: bool,
    pub mapped_nodes: Vec<NodeId>,
}

impl Candidate {
    fn from_spec(spec: CandidateSpec, handle: CandidateRef, status: CandidateStatus) -> Self {
        Self {
            handle,
            node_id: spec.node_id,
            version: spec.version,
            other_version: spec.other_version,
            thread_id: spec.thread_id,
            timeout: spec.timeout,
            reentry: false,
            read: spec.read,
            implicit_single: spec.implicit_single,
            local: spec.local,
            tx: spec.tx,
            topology_version: spec.topology_version,
            status,
            ready: false,
            mapped_nodes: Vec::new(),
        }
    }

    pub fn is_owner(&self) -> bool {
        self.status == CandidateStatus::Owner
    }
}

struct Node {
    candidate: Candidate,
    prev: Option<u32>,
    next: Option<u32>,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// Arrival-ordered lock queue; the head is the owner once promoted.
#[derive(Default)]
pub struct CandidateQueue {
    slots: Vec<Slot>,
    free: Vec<u32>,
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append a candidate; it owns the lock immediately if the queue was empty.
    pub fn push_back(&mut self, spec: CandidateSpec) -> Candidate {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let handle = CandidateRef {
            slot,
            generation: self.slots[slot as usize].generation,
        };
        let status = if self.head.is_none() {
            CandidateStatus::Owner
        } else {
            CandidateStatus::Waiting
        };
        let candidate = Candidate::from_spec(spec, handle, status);
        self.slots[slot as usize].node = Some(Node {
            candidate: candidate.clone(),
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => {
                if let Some(node) = self.slots[tail as usize].node.as_mut() {
                    node.next = Some(slot);
                }
            }
            None => self.head = Some(slot),
        }
        self.tail = Some(slot);
        self.len += 1;
        candidate
    }

    fn node(&self, handle: CandidateRef) -> Option<&Node> {
        let slot = self.slots.get(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_ref()
    }

    fn node_mut(&mut self, handle: CandidateRef) -> Option<&mut Node> {
        let slot = self.slots.get_mut(handle.slot as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.node.as_mut()
    }

    pub fn get(&self, handle: CandidateRef) -> Option<&Candidate> {
        self.node(handle).map(|node| &node.candidate)
    }

    pub fn get_mut(&mut self, handle: CandidateRef) -> Option<&mut Candidate> {
        self.node_mut(handle).map(|node| &mut node.candidate)
    }

    /// Unlink a candidate, returning its final snapshot.
    pub fn remove(&mut self, handle: CandidateRef, status: CandidateStatus) -> Option<Candidate> {
        let node = {
            let slot = self.slots.get_mut(handle.slot as usize)?;
            if slot.generation != handle.generation {
                return None;
            }
            let node = slot.node.take()?;
            slot.generation = slot.generation.wrapping_add(1);
            node
        };
        match node.prev {
            Some(prev) => {
                if let Some(prev) = self.slots[prev as usize].node.as_mut() {
                    prev.next = node.next;
                }
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => {
                if let Some(next) = self.slots[next as usize].node.as_mut() {
                    next.prev = node.prev;
                }
            }
            None => self.tail = node.prev,
        }
        self.free.push(handle.slot);
        self.len -= 1;
        let mut candidate = node.candidate;
        candidate.status = status;
        Some(candidate)
    }

    pub fn head(&self) -> Option<&Candidate> {
        let head = self.head?;
        self.slots[head as usize]
            .node
            .as_ref()
            .map(|node| &node.candidate)
    }

    pub fn owner(&self) -> Option<&Candidate> {
        self.head().filter(|candidate| candidate.is_owner())
    }

    /// Grant the lock to the head if it is still waiting.
    pub fn promote_head(&mut self) -> Option<Candidate> {
        let head = self.head?;
        let node = self.slots[head as usize].node.as_mut()?;
        if node.candidate.status != CandidateStatus::Waiting {
            return None;
        }
        node.candidate.status = CandidateStatus::Owner;
        Some(node.candidate.clone())
    }

    pub fn iter(&self) -> QueueIter<'_> {
        QueueIter {
            queue: self,
            cursor: self.head,
        }
    }

    pub fn find_version(&self, version: Version) -> Option<&Candidate> {
        self.iter().find(|candidate| candidate.version == version)
    }

    pub fn find_other_version(&self, other: Version) -> Option<&Candidate> {
        self.iter()
            .find(|candidate| candidate.other_version == Some(other))
    }

    /// Candidate of a given thread on a given node, used for thread reentry.
    pub fn find_thread(&self, node_id: NodeId, thread_id: ThreadId) -> Option<&Candidate> {
        self.iter()
            .find(|candidate| candidate.node_id == node_id && candidate.thread_id == thread_id)
    }

    pub fn snapshot(&self) -> Vec<Candidate> {
        self.iter().cloned().collect()
    }
}

pub struct QueueIter<'a> {
    queue: &'a CandidateQueue,
    cursor: Option<u32>,
}

impl<'a> Iterator for QueueIter<'a> {
    type Item = &'a Candidate;

    fn next(&mut self) -> Option<Self::Item> {
        let slot = self.cursor?;
        let node = self.queue.slots[slot as usize].node.as_ref()?;
        self.cursor = node.next;
        Some(&node.candidate)
    }
}
