#![doc = include_str!("../../README.md")]

mod commit;
pub mod config;
mod core;
pub mod entry;
pub mod error;
mod log_id;
pub mod membership;
pub mod metrics;
pub mod network;
pub mod raft;
mod replication;
pub mod state_machine;
pub mod storage;
mod summary;
mod timer;

pub use async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

pub use crate::config::Config;
pub use crate::core::State;
pub use crate::entry::Entry;
pub use crate::entry::EntryKind;
pub use crate::entry::EntryPayload;
pub use crate::error::ChangeMembershipError;
pub use crate::error::ClientWriteError;
pub use crate::error::ConfigError;
pub use crate::error::ForwardToLeader;
pub use crate::error::InitializeError;
pub use crate::error::RaftError;
pub use crate::log_id::LogId;
pub use crate::membership::EffectiveMembership;
pub use crate::membership::Membership;
pub use crate::membership::MembershipChange;
pub use crate::membership::Server;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::state_machine::StateMachine;
pub use crate::storage::LogStore;
pub use crate::storage::SnapshotMeta;
pub use crate::storage::SnapshotStore;
pub use crate::storage::StableStore;
pub use crate::storage::Storage;
pub use crate::storage::Vote;
pub use crate::summary::MessageSummary;

/// A Raft node's ID.
pub type NodeId = u64;

/// A trait defining application specific response data.
///
/// This is the value a `StateMachine` produces when it applies a command entry, and it is handed
/// back to the client which submitted the command once the entry is committed and applied.
///
/// This type must encapsulate both success and error responses: application specific validation
/// of a command is outside the realm of the consensus protocol.
pub trait AppDataResponse: Clone + Send + Sync + std::fmt::Debug + Serialize + DeserializeOwned + 'static {}

/// The set of collaborator types a Raft node is built from.
///
/// A node depends on each collaborator only through its trait, so that in-memory doubles can stand
/// in for disks and sockets in tests.
pub trait RaftTypeConfig: Sized + Send + Sync + 'static {
    /// The response produced by applying a command to the state machine.
    type Response: AppDataResponse;
    /// The outbound transport.
    type Network: RaftNetwork;
    /// Durable storage for log entries.
    type LogStore: LogStore;
    /// Durable storage for the current term and the vote record.
    type StableStore: StableStore;
    /// Durable storage for snapshots.
    type SnapshotStore: SnapshotStore;
    /// The application state machine committed commands are applied to.
    type StateMachine: StateMachine<Response = Self::Response>;
}
