//! Error types exposed by this crate.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from a storage collaborator: the log store, the stable store, the
    /// snapshot store or the state machine.
    ///
    /// Such an error is fatal, the node shuts down after reporting it.
    #[error("{0}")]
    Storage(anyhow::Error),
    /// An internal Raft error indicating that Raft is shutting down.
    #[error("Raft is shutting down")]
    ShuttingDown,
}

impl From<tokio::io::Error> for RaftError {
    fn from(src: tokio::io::Error) -> Self {
        RaftError::Storage(src.into())
    }
}

/// The request has to be sent to the cluster leader.
///
/// The ID and the address of the leader are filled in if this node knows them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error, Serialize, Deserialize)]
pub struct ForwardToLeader {
    pub leader_id: Option<NodeId>,
    pub leader_addr: Option<String>,
}

impl fmt::Display for ForwardToLeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "has to forward request to leader: {:?}", self.leader_id)?;
        if let Some(addr) = &self.leader_addr {
            write!(f, "@{}", addr)?;
        }
        Ok(())
    }
}

/// An error related to a client write request.
#[derive(Debug, Error)]
pub enum ClientWriteError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The client write request must be forwarded to the cluster leader.
    #[error(transparent)]
    ForwardToLeader(#[from] ForwardToLeader),
}

/// Error variants related to configuration.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("election timeout must be > 0")]
    ElectionTimeoutIs0,

    #[error("heartbeat interval({heartbeat_interval}) must be < election timeout({election_timeout})")]
    ElectionTimeoutLTHeartBeat {
        election_timeout: u64,
        heartbeat_interval: u64,
    },

    #[error("commit timeout({commit_timeout}) must be < heartbeat interval({heartbeat_interval})")]
    HeartBeatLTCommitTimeout {
        heartbeat_interval: u64,
        commit_timeout: u64,
    },

    #[error("max_append_entries must be > 0")]
    MaxAppendEntriesIs0,

    #[error("snapshot interval must be > 0")]
    SnapshotIntervalIs0,

    #[error("{reason} when parsing {invalid:?}")]
    InvalidArgs { invalid: String, reason: String },
}

/// The set of errors which may take place when initializing a pristine Raft node.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InitializeError {
    /// An internal error has taken place.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The requested action is not allowed due to the Raft node's current state.
    #[error("the requested action is not allowed due to the Raft node's current state")]
    NotAllowed,
}

/// The set of errors which may take place when proposing a membership change.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChangeMembershipError {
    #[error("{0}")]
    RaftError(#[from] RaftError),

    #[error(transparent)]
    ForwardToLeader(#[from] ForwardToLeader),

    /// A previous membership change is not yet committed, or the leader has not yet committed any
    /// entry of its own term.
    #[error("a membership change is in progress: committed config at {committed}, last config at {pending}")]
    InProgress { committed: u64, pending: u64 },

    /// The server to add is already in the cluster with the requested role.
    #[error("node {0} is already a member")]
    AlreadyMember(NodeId),

    /// The server to remove is not in the cluster.
    #[error("node {0} is not a member")]
    NotMember(NodeId),

    /// Removing the server would leave a config without any voter.
    #[error("removing node {0} leaves no voter")]
    NoVoterLeft(NodeId),
}

/// The error returned when waiting for a metrics condition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),

    #[error("raft is shutting down")]
    ShuttingDown,
}
