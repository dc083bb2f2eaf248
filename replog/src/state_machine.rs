//! The application state machine interface.

use async_trait::async_trait;

use crate::entry::Entry;
use crate::AppDataResponse;

/// The application state machine committed commands are applied to.
///
/// A Raft node moves its state machine into a dedicated task and invokes it from there only, one
/// call at a time. Entries are applied exactly once and strictly in index order, so the
/// implementation needs no synchronization of its own to preserve ordering.
///
/// Any error returned is fatal: the node shuts down.
#[async_trait]
pub trait StateMachine: Send + 'static {
    /// The response produced by applying a command.
    type Response: AppDataResponse;

    /// Apply a committed command entry.
    ///
    /// Only entries with an `EntryPayload::Normal` payload are passed in.
    async fn apply(&mut self, entry: &Entry) -> anyhow::Result<Self::Response>;

    /// Serialize the whole state, as of the last applied entry.
    async fn snapshot(&mut self) -> anyhow::Result<Vec<u8>>;

    /// Replace the whole state with the one serialized in `data`.
    async fn restore(&mut self, data: &[u8]) -> anyhow::Result<()>;
}

/// A response type for state machines that have nothing to say.
impl AppDataResponse for () {}
