//! Leader side commit tracking.

use std::collections::BTreeMap;

use crate::membership::MembershipState;
use crate::NodeId;

/// The greatest value that a majority of the given values are at least equal to.
///
/// Returns `None` if there are no values.
pub(crate) fn majority_index(mut entries: Vec<u64>) -> Option<u64> {
    let len = entries.len();
    if len == 0 {
        return None;
    }

    // Offset of the majority slice of the high end.
    entries.sort_unstable();
    let offset = len - (len / 2 + 1);
    entries.get(offset).copied()
}

/// Tracks the match index of every replication target, including the leader itself, and derives
/// the commit index from them.
///
/// An index is committed only if it is at or after `start_index`, the first index the leader
/// created in its own term. Entries of earlier terms are thereby committed only together with an
/// entry of the current term.
#[derive(Debug)]
pub(crate) struct CommitTracker {
    matched: BTreeMap<NodeId, u64>,
    start_index: u64,
}

impl CommitTracker {
    pub(crate) fn new(start_index: u64) -> Self {
        Self {
            matched: BTreeMap::new(),
            start_index,
        }
    }

    pub(crate) fn start_index(&self) -> u64 {
        self.start_index
    }

    pub(crate) fn matched(&self, id: &NodeId) -> u64 {
        self.matched.get(id).copied().unwrap_or_default()
    }

    /// Record the match index of a node. Match indexes never move backwards.
    ///
    /// Returns true if the recorded value changed.
    pub(crate) fn update_matched(&mut self, id: NodeId, index: u64) -> bool {
        let matched = self.matched.entry(id).or_default();
        if index > *matched {
            *matched = index;
            return true;
        }
        false
    }

    pub(crate) fn remove(&mut self, id: &NodeId) {
        self.matched.remove(id);
    }

    /// Return a new commit index, if the quorum of `membership` allows one greater than `commit_index`.
    pub(crate) fn new_commit_index(&self, membership: &MembershipState, commit_index: u64) -> Option<u64> {
        let quorum = membership.quorum_index(|id| self.matched(id))?;
        if quorum > commit_index && quorum >= self.start_index {
            Some(quorum)
        } else {
            None
        }
    }
}
