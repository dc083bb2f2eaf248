//! The RPC messages exchanged between Raft nodes, and the client facing request and response types.

use serde::Deserialize;
use serde::Serialize;

use crate::entry::Entry;
use crate::membership::Membership;
use crate::storage::SnapshotMeta;
use crate::AppDataResponse;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;

/// An RPC sent by a cluster leader to replicate log entries (§5.3), and as a heartbeat (§5.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,

    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,

    /// The index of the entry immediately preceding `entries`.
    pub prev_log_index: u64,

    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: u64,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries are batched for efficiency.
    pub entries: Vec<Entry>,

    /// The leader's commit index.
    pub leader_commit: u64,
}

impl AppendEntriesRequest {
    /// The index of the last entry this request covers: the last of `entries`, or `prev_log_index`.
    pub fn last_index(&self) -> u64 {
        self.prev_log_index + self.entries.len() as u64
    }
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}-{}, leader_commit={}, entries={}",
            self.term,
            self.leader_id,
            self.prev_log_term,
            self.prev_log_index,
            self.leader_commit,
            self.entries.as_slice().summary()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,

    /// Will be true if follower contained entry matching `prev_log_index` and `prev_log_term`.
    pub success: bool,

    /// Where the leader should look for a matching prefix, if `success` is false because of a log
    /// mismatch: the first index of `conflict_term` in the follower's log, or the follower's last
    /// index + 1 if its log is too short.
    ///
    /// 0 when the request was rejected for its stale term.
    pub conflict_index: u64,

    /// The term of the follower's entry at `prev_log_index`, if it has one.
    pub conflict_term: Option<u64>,
}

impl AppendEntriesResponse {
    pub(crate) fn success(term: u64) -> Self {
        Self {
            term,
            success: true,
            conflict_index: 0,
            conflict_term: None,
        }
    }

    pub(crate) fn stale_term(term: u64) -> Self {
        Self {
            term,
            success: false,
            conflict_index: 0,
            conflict_term: None,
        }
    }

    pub(crate) fn conflict(term: u64, conflict_index: u64, conflict_term: Option<u64>) -> Self {
        Self {
            term,
            success: false,
            conflict_index,
            conflict_term,
        }
    }
}

/// An RPC sent by candidates to gather votes (§5.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,

    /// The candidate's ID.
    pub candidate_id: NodeId,

    pub last_log_index: u64,

    pub last_log_term: u64,
}

impl VoteRequest {
    pub fn new(term: u64, candidate_id: NodeId, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }

    pub fn last_log_id(&self) -> LogId {
        LogId::new(self.last_log_term, self.last_log_index)
    }
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, candidate_id={}, last_log_id={}",
            self.term,
            self.candidate_id,
            self.last_log_id()
        )
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,

    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

/// An RPC sent by the Raft leader to a follower whose next entries are no longer in the leader's
/// log (§7).
///
/// The whole snapshot is carried in one message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// The leader's current term.
    pub term: u64,

    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: NodeId,

    /// The last included log id, and the config as of it.
    pub meta: SnapshotMeta,

    /// The serialized state machine.
    pub data: Vec<u8>,
}

impl MessageSummary for InstallSnapshotRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, meta={}, len={}",
            self.term,
            self.leader_id,
            self.meta.summary(),
            self.data.len()
        )
    }
}

/// The response to an `InstallSnapshotRequest`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// The receiving node's current term, for leader to update itself.
    pub term: u64,

    /// False if the request carried a stale term.
    pub success: bool,
}

/// All RPCs a Raft node handles.
///
/// A transport registers `Raft::handle_rpc` as its single inbound handler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRpc {
    AppendEntries(AppendEntriesRequest),
    RequestVote(VoteRequest),
    InstallSnapshot(InstallSnapshotRequest),
}

impl RaftRpc {
    /// The ID of the node which sent this RPC.
    pub fn sender(&self) -> NodeId {
        match self {
            RaftRpc::AppendEntries(rpc) => rpc.leader_id,
            RaftRpc::RequestVote(rpc) => rpc.candidate_id,
            RaftRpc::InstallSnapshot(rpc) => rpc.leader_id,
        }
    }
}

impl MessageSummary for RaftRpc {
    fn summary(&self) -> String {
        match self {
            RaftRpc::AppendEntries(rpc) => format!("AppendEntries: {}", rpc.summary()),
            RaftRpc::RequestVote(rpc) => format!("RequestVote: {}", rpc.summary()),
            RaftRpc::InstallSnapshot(rpc) => format!("InstallSnapshot: {}", rpc.summary()),
        }
    }
}

/// The response to a `RaftRpc`, of the same variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftRpcResponse {
    AppendEntries(AppendEntriesResponse),
    RequestVote(VoteResponse),
    InstallSnapshot(InstallSnapshotResponse),
}

/// The response to a client write, sent once the entry is committed and applied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientWriteResponse<R: AppDataResponse> {
    pub log_id: LogId,

    /// Application specific response data.
    #[serde(bound = "R: AppDataResponse")]
    pub data: R,
}

impl<R: AppDataResponse> MessageSummary for ClientWriteResponse<R> {
    fn summary(&self) -> String {
        format!("log_id: {}", self.log_id)
    }
}

/// The response to a membership change, sent once the config entry is committed and applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeMembershipResponse {
    pub log_id: LogId,

    /// The config which is now in effect.
    pub membership: Membership,
}
