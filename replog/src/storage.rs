//! The Raft storage interfaces and data types.
//!
//! Durable state is split into three collaborators: the log, the term and vote record, and
//! snapshots. An error returned by any of them is fatal to the node: it shuts down rather than
//! risk double voting or log divergence after a restart with inconsistent state.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;

use crate::entry::Entry;
use crate::membership::EffectiveMembership;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftTypeConfig;

/// The vote a node cast, and the term it was cast in.
///
/// A node casts at most one vote per term. A vote record of an older term means the node has not
/// voted in the current term.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub term: u64,
    pub voted_for: NodeId,
}

/// Every snapshot is assigned a unique ID when it is created.
pub type SnapshotId = String;

/// The metadata of a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    /// The last log included in the snapshot.
    pub last_log_id: LogId,

    /// The latest config covered by the snapshot.
    pub membership: EffectiveMembership,

    /// To identify a snapshot when transferring or opening it.
    pub snapshot_id: SnapshotId,
}

impl MessageSummary for SnapshotMeta {
    fn summary(&self) -> String {
        format!(
            "{{id:{}, last_log:{}, membership:{}}}",
            self.snapshot_id,
            self.last_log_id,
            self.membership.summary()
        )
    }
}

/// Durable storage of log entries.
///
/// Log indexes are contiguous. After compaction the log may start at any index greater than 1.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// The index of the first entry in the log, or 0 if the log is empty.
    async fn first_index(&self) -> anyhow::Result<u64>;

    /// The index of the last entry in the log, or 0 if the log is empty.
    async fn last_index(&self) -> anyhow::Result<u64>;

    /// Get the entry at `index`, if there is one.
    async fn get_entry(&self, index: u64) -> anyhow::Result<Option<Entry>>;

    /// Get the entries in `[start, stop)`.
    ///
    /// The result stops at the first missing entry.
    async fn get_entries(&self, start: u64, stop: u64) -> anyhow::Result<Vec<Entry>> {
        let mut res = Vec::with_capacity(stop.saturating_sub(start) as usize);
        for index in start..stop {
            match self.get_entry(index).await? {
                Some(entry) => res.push(entry),
                None => break,
            }
        }
        Ok(res)
    }

    /// Durably append entries to the log.
    ///
    /// Entries are contiguous and start at the index after the current last entry.
    async fn append_entries(&self, entries: &[Entry]) -> anyhow::Result<()>;

    /// Delete the entries in `[min, max]`, both inclusive.
    async fn delete_range(&self, min: u64, max: u64) -> anyhow::Result<()>;
}

/// Durable storage of the current term and the vote record.
///
/// A write must be durable when it returns: the reply to the RPC which caused it is sent after it.
#[async_trait]
pub trait StableStore: Send + Sync + 'static {
    /// The current term, 0 on a pristine node.
    async fn get_term(&self) -> anyhow::Result<u64>;

    async fn set_term(&self, term: u64) -> anyhow::Result<()>;

    /// The last vote cast, if any.
    async fn get_vote(&self) -> anyhow::Result<Option<Vote>>;

    async fn set_vote(&self, vote: &Vote) -> anyhow::Result<()>;
}

/// Durable storage of snapshots.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// A handle to write the data of a new snapshot.
    ///
    /// The snapshot becomes visible to `list()` and `open()` once the handle has been shut down
    /// with `AsyncWriteExt::shutdown()`. A handle dropped before that leaves no snapshot behind.
    type Writer: AsyncWrite + Send + Unpin + 'static;

    /// A handle to read the data of a snapshot.
    type Reader: AsyncRead + Send + Unpin + 'static;

    /// Begin to write a new snapshot described by `meta`.
    async fn create(&self, meta: &SnapshotMeta) -> anyhow::Result<Self::Writer>;

    /// List the metadata of all finished snapshots, newest first.
    async fn list(&self) -> anyhow::Result<Vec<SnapshotMeta>>;

    /// Open a finished snapshot for reading.
    async fn open(&self, id: &SnapshotId) -> anyhow::Result<(SnapshotMeta, Self::Reader)>;
}

/// The three storage collaborators of a Raft node.
pub struct Storage<C: RaftTypeConfig> {
    pub log: Arc<C::LogStore>,
    pub stable: Arc<C::StableStore>,
    pub snapshot: Arc<C::SnapshotStore>,
}

impl<C: RaftTypeConfig> Storage<C> {
    pub fn new(log: Arc<C::LogStore>, stable: Arc<C::StableStore>, snapshot: Arc<C::SnapshotStore>) -> Self {
        Self { log, stable, snapshot }
    }
}

impl<C: RaftTypeConfig> Clone for Storage<C> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            stable: self.stable.clone(),
            snapshot: self.snapshot.clone(),
        }
    }
}

/// The newest snapshot in the store, if any.
pub(crate) async fn latest_snapshot<S: SnapshotStore + ?Sized>(store: &S) -> anyhow::Result<Option<SnapshotMeta>> {
    let metas = store.list().await?;
    Ok(metas.into_iter().max_by_key(|m| m.last_log_id))
}

/// Read the whole data of the newest snapshot.
///
/// A snapshot may be replaced, and removed, between listing and opening it. Then the newer one is
/// read. An error opening a snapshot which is still the newest is returned.
pub(crate) async fn read_latest_snapshot<S: SnapshotStore + ?Sized>(
    store: &S,
) -> anyhow::Result<Option<(SnapshotMeta, Vec<u8>)>> {
    let mut latest = latest_snapshot(store).await?;

    loop {
        let meta = match latest {
            Some(x) => x,
            None => return Ok(None),
        };

        match store.open(&meta.snapshot_id).await {
            Ok((meta, mut reader)) => {
                let mut data = Vec::new();
                reader.read_to_end(&mut data).await?;
                return Ok(Some((meta, data)));
            }
            Err(err) => {
                latest = latest_snapshot(store).await?;
                if latest.as_ref().map(|x| x.snapshot_id == meta.snapshot_id).unwrap_or(false) {
                    return Err(err);
                }
                tracing::info!(error = %err, snapshot_id = %meta.snapshot_id, "snapshot is gone, read the newest one");
            }
        }
    }
}

#[cfg(test)]
#[path = "storage_test.rs"]
mod storage_test;
