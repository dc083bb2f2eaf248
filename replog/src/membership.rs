//! Cluster membership: the set of servers, which of them vote, and the quorum math over them.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Display;
use std::fmt::Formatter;

use serde::Deserialize;
use serde::Serialize;

use crate::commit::majority_index;
use crate::error::ChangeMembershipError;
use crate::MessageSummary;
use crate::NodeId;

/// A server participating in a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    /// The transport address of the server.
    pub addr: String,
    /// Whether the server votes, and counts towards quorum.
    ///
    /// A non-voter only receives replicated log entries.
    pub voter: bool,
}

impl Server {
    pub fn voter(addr: impl ToString) -> Self {
        Self {
            addr: addr.to_string(),
            voter: true,
        }
    }

    pub fn non_voter(addr: impl ToString) -> Self {
        Self {
            addr: addr.to_string(),
            voter: false,
        }
    }
}

/// A cluster configuration: every server by ID.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    servers: BTreeMap<NodeId, Server>,
}

impl Membership {
    pub fn new(servers: BTreeMap<NodeId, Server>) -> Self {
        Self { servers }
    }

    /// Build a configuration in which every given server is a voter.
    pub fn new_voters<A: ToString>(voters: impl IntoIterator<Item = (NodeId, A)>) -> Self {
        let servers = voters.into_iter().map(|(id, addr)| (id, Server::voter(addr))).collect();
        Self { servers }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.servers.contains_key(id)
    }

    pub fn is_voter(&self, id: &NodeId) -> bool {
        self.servers.get(id).map(|s| s.voter).unwrap_or(false)
    }

    pub fn get(&self, id: &NodeId) -> Option<&Server> {
        self.servers.get(id)
    }

    pub fn servers(&self) -> impl Iterator<Item = (&NodeId, &Server)> {
        self.servers.iter()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.servers.keys()
    }

    pub fn voter_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.servers.iter().filter(|(_, s)| s.voter).map(|(id, _)| id)
    }

    /// The voters other than `id`.
    pub fn peer_voter_ids(&self, id: NodeId) -> impl Iterator<Item = &NodeId> {
        self.voter_ids().filter(move |x| **x != id)
    }

    /// floor(N/2)+1 over the voters.
    pub fn majority(&self) -> usize {
        self.voter_ids().count() / 2 + 1
    }

    /// Whether the given set of nodes contains a majority of this configuration's voters.
    ///
    /// A configuration without any voter can never be satisfied.
    pub fn is_majority(&self, granted: &BTreeSet<NodeId>) -> bool {
        let voters = self.voter_ids().count();
        if voters == 0 {
            return false;
        }
        let n = self.voter_ids().filter(|id| granted.contains(id)).count();
        n >= voters / 2 + 1
    }

    /// The greatest log index that a majority of voters have replicated.
    pub fn quorum_index(&self, matched: impl Fn(&NodeId) -> u64) -> Option<u64> {
        let indexes: Vec<u64> = self.voter_ids().map(matched).collect();
        majority_index(indexes)
    }

    /// Build the configuration which results from applying `change` to this one.
    pub fn apply_change(&self, change: &MembershipChange) -> Result<Membership, ChangeMembershipError> {
        let mut servers = self.servers.clone();
        match change {
            MembershipChange::AddVoter { id, addr } => match servers.get_mut(id) {
                Some(s) if s.voter => return Err(ChangeMembershipError::AlreadyMember(*id)),
                // Promote a non-voter.
                Some(s) => {
                    s.voter = true;
                    s.addr = addr.clone();
                }
                None => {
                    servers.insert(*id, Server::voter(addr));
                }
            },
            MembershipChange::AddNonVoter { id, addr } => {
                if servers.contains_key(id) {
                    return Err(ChangeMembershipError::AlreadyMember(*id));
                }
                servers.insert(*id, Server::non_voter(addr));
            }
            MembershipChange::RemoveServer { id } => {
                if servers.remove(id).is_none() {
                    return Err(ChangeMembershipError::NotMember(*id));
                }
                if !servers.values().any(|s| s.voter) {
                    return Err(ChangeMembershipError::NoVoterLeft(*id));
                }
            }
        }
        Ok(Membership { servers })
    }
}

impl Display for Membership {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (id, s)) in self.servers.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}{}@{}", id, if s.voter { "" } else { "(nv)" }, s.addr)?;
        }
        write!(f, "}}")
    }
}

impl MessageSummary for Membership {
    fn summary(&self) -> String {
        self.to_string()
    }
}

/// A single-server change to a cluster configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MembershipChange {
    /// Add a voter, or promote an existing non-voter.
    AddVoter { id: NodeId, addr: String },
    /// Add a server which receives replication but does not vote.
    AddNonVoter { id: NodeId, addr: String },
    /// Remove a server, voter or not.
    RemoveServer { id: NodeId },
}

/// A membership config plus the index of the log entry that carries it.
///
/// `log_index == 0` means the config has not been written to the log yet: it was given at
/// bootstrap, or it is the local fallback config of a node removed from its cluster.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveMembership {
    pub log_index: u64,
    pub membership: Membership,
}

impl EffectiveMembership {
    pub fn new(log_index: u64, membership: Membership) -> Self {
        Self { log_index, membership }
    }
}

impl MessageSummary for EffectiveMembership {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_index, self.membership)
    }
}

/// The last committed config and the last appended config of a node.
///
/// A config takes effect as soon as it is appended. While the appended config is not yet committed,
/// a quorum has to be formed in both of them.
///
/// Since a leader proposes a config only after the previous one is committed, at most two configs
/// are relevant at any time.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct MembershipState {
    committed: EffectiveMembership,
    effective: EffectiveMembership,
}

impl MembershipState {
    /// A state in which `m` is both the committed and the effective config.
    pub(crate) fn new_committed(m: EffectiveMembership) -> Self {
        Self {
            committed: m.clone(),
            effective: m,
        }
    }

    pub(crate) fn committed(&self) -> &EffectiveMembership {
        &self.committed
    }

    pub(crate) fn effective(&self) -> &EffectiveMembership {
        &self.effective
    }

    /// Whether the effective config is still waiting to be committed.
    pub(crate) fn is_pending(&self) -> bool {
        self.effective.log_index > self.committed.log_index
    }

    /// A config entry has been appended to the log.
    ///
    /// The first config a node learns of has nothing before it to form a joint quorum with: it is
    /// taken as committed too.
    pub(crate) fn append(&mut self, m: EffectiveMembership) {
        if self.effective.membership.is_empty() {
            *self = Self::new_committed(m);
            return;
        }

        // Another config entry can only be proposed after the previous one is committed.
        self.committed = std::mem::replace(&mut self.effective, m);
    }

    /// Returns true if the effective config became committed.
    pub(crate) fn commit(&mut self, commit_index: u64) -> bool {
        if self.is_pending() && self.effective.log_index <= commit_index {
            self.committed = self.effective.clone();
            return true;
        }
        false
    }

    /// Log entries since `index` have been deleted: a config carried by them is gone.
    pub(crate) fn truncate(&mut self, index: u64) {
        if self.is_pending() && self.effective.log_index >= index {
            self.effective = self.committed.clone();
        }
    }

    fn configs(&self) -> impl Iterator<Item = &Membership> {
        let committed = if self.is_pending() {
            Some(&self.committed.membership)
        } else {
            None
        };
        std::iter::once(&self.effective.membership).chain(committed)
    }

    /// Whether `granted` forms a quorum in every relevant config.
    pub(crate) fn is_quorum(&self, granted: &BTreeSet<NodeId>) -> bool {
        self.configs().all(|m| m.is_majority(granted))
    }

    /// The greatest index replicated to a quorum in every relevant config.
    pub(crate) fn quorum_index(&self, matched: impl Fn(&NodeId) -> u64) -> Option<u64> {
        self.configs().map(|m| m.quorum_index(&matched)).try_fold(u64::MAX, |acc, x| x.map(|x| acc.min(x)))
    }

    /// All servers of every relevant config, voters or not.
    pub(crate) fn node_ids(&self) -> BTreeSet<NodeId> {
        self.configs().flat_map(|m| m.node_ids().copied()).collect()
    }

    /// The voters of every relevant config.
    pub(crate) fn voter_ids(&self) -> BTreeSet<NodeId> {
        self.configs().flat_map(|m| m.voter_ids().copied()).collect()
    }

    /// The address of a server in any relevant config, preferring the effective one.
    pub(crate) fn addr_of(&self, id: &NodeId) -> Option<&str> {
        self.configs().find_map(|m| m.get(id)).map(|s| s.addr.as_str())
    }
}

#[cfg(test)]
#[path = "membership_test.rs"]
mod membership_test;
