#![deny(unused_qualifications)]

//! In-memory collaborators for `replog`: a log store, a term and vote store, a snapshot store
//! and a key-value state machine.
//!
//! Nothing survives the process. A node "restarts" by building a new `Raft` on the same stores
//! and a fresh state machine.


use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::task::Context;
use std::task::Poll;

use anyhow::anyhow;
use async_trait::async_trait;
use replog::storage::SnapshotId;
use replog::AppDataResponse;
use replog::Entry;
use replog::EntryPayload;
use replog::LogId;
use replog::LogStore;
use replog::SnapshotMeta;
use replog::SnapshotStore;
use replog::StableStore;
use replog::StateMachine;
use replog::Vote;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWrite;
use tokio::sync::RwLock;

/// The application data request type which the `MemStateMachine` works with.
///
/// Conceptually, for demo purposes, this represents an update to a client's status info,
/// returning the previously recorded status.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// The ID of the client which has sent the request.
    pub client: String,

    /// The serial number of this request.
    pub serial: u64,

    /// A string describing the status of the client.
    pub status: String,
}

impl ClientRequest {
    pub fn make_request(client_id: impl ToString, serial: u64) -> Self {
        Self {
            client: client_id.to_string(),
            serial,
            status: format!("request-{}", serial),
        }
    }

    /// Encode the request as the payload of a client write.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a struct of strings and integers to json does not fail.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// The application data response type which the `MemStateMachine` works with.
///
/// The status the client had before the request, if any.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ClientResponse(pub Option<String>);

impl AppDataResponse for ClientResponse {}

#[derive(Debug, Error)]
pub enum MemStoreError {
    #[error("injected failure: {0}")]
    Injected(&'static str),

    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),
}

/// An in-memory log store. Entries are kept serialized, as a real store would.
#[derive(Default)]
pub struct MemLogStore {
    log: RwLock<BTreeMap<u64, String>>,

    /// Make every following append fail, for testing the fatal error path.
    fail_append: AtomicBool,
}

impl MemLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_append(&self, fail: bool) {
        self.fail_append.store(fail, Ordering::Relaxed);
    }

    /// All entries in the log, for assertions in tests.
    pub async fn entries(&self) -> anyhow::Result<Vec<Entry>> {
        let log = self.log.read().await;
        let mut res = Vec::with_capacity(log.len());
        for serialized in log.values() {
            res.push(serde_json::from_str(serialized)?);
        }
        Ok(res)
    }
}

#[async_trait]
impl LogStore for MemLogStore {
    async fn first_index(&self) -> anyhow::Result<u64> {
        Ok(self.log.read().await.keys().next().copied().unwrap_or_default())
    }

    async fn last_index(&self) -> anyhow::Result<u64> {
        Ok(self.log.read().await.keys().next_back().copied().unwrap_or_default())
    }

    async fn get_entry(&self, index: u64) -> anyhow::Result<Option<Entry>> {
        let log = self.log.read().await;
        match log.get(&index) {
            Some(serialized) => Ok(Some(serde_json::from_str(serialized)?)),
            None => Ok(None),
        }
    }

    async fn get_entries(&self, start: u64, stop: u64) -> anyhow::Result<Vec<Entry>> {
        if start >= stop {
            return Ok(vec![]);
        }

        let log = self.log.read().await;
        let mut entries = vec![];
        let mut expected = start;
        for (index, serialized) in log.range(start..stop) {
            if *index != expected {
                break;
            }
            entries.push(serde_json::from_str(serialized)?);
            expected += 1;
        }
        Ok(entries)
    }

    #[tracing::instrument(level = "trace", skip_all, fields(n = entries.len()))]
    async fn append_entries(&self, entries: &[Entry]) -> anyhow::Result<()> {
        if self.fail_append.load(Ordering::Relaxed) {
            return Err(MemStoreError::Injected("append_entries").into());
        }

        let mut log = self.log.write().await;
        for entry in entries {
            log.insert(entry.index(), serde_json::to_string(entry)?);
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn delete_range(&self, min: u64, max: u64) -> anyhow::Result<()> {
        if min > max {
            return Ok(());
        }

        let mut log = self.log.write().await;
        let keys = log.range(min..=max).map(|(k, _v)| *k).collect::<Vec<_>>();
        for key in keys {
            log.remove(&key);
        }
        Ok(())
    }
}

/// An in-memory store of the current term and the vote.
#[derive(Default)]
pub struct MemStableStore {
    term: RwLock<u64>,
    vote: RwLock<Option<Vote>>,
}

impl MemStableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StableStore for MemStableStore {
    async fn get_term(&self) -> anyhow::Result<u64> {
        Ok(*self.term.read().await)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn set_term(&self, term: u64) -> anyhow::Result<()> {
        *self.term.write().await = term;
        Ok(())
    }

    async fn get_vote(&self) -> anyhow::Result<Option<Vote>> {
        Ok(*self.vote.read().await)
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn set_vote(&self, vote: &Vote) -> anyhow::Result<()> {
        *self.vote.write().await = Some(*vote);
        Ok(())
    }
}

type Snapshots = Arc<Mutex<BTreeMap<SnapshotId, (SnapshotMeta, Vec<u8>)>>>;

/// An in-memory snapshot store. It keeps the last `retain` snapshots.
pub struct MemSnapshotStore {
    snapshots: Snapshots,
    retain: usize,
}

impl Default for MemSnapshotStore {
    fn default() -> Self {
        Self::new(2)
    }
}

impl MemSnapshotStore {
    pub fn new(retain: usize) -> Self {
        Self {
            snapshots: Default::default(),
            retain: std::cmp::max(1, retain),
        }
    }
}

fn lock_err<T>(_: T) -> io::Error {
    io::Error::new(io::ErrorKind::Other, "snapshot store lock poisoned")
}

/// Buffers the data of a snapshot; the snapshot is stored on `shutdown()`.
pub struct MemSnapshotWriter {
    meta: SnapshotMeta,
    buf: Vec<u8>,
    snapshots: Snapshots,
    retain: usize,
}

impl MemSnapshotWriter {
    fn commit(&mut self) -> io::Result<()> {
        let mut snapshots = self.snapshots.lock().map_err(lock_err)?;

        let data = std::mem::take(&mut self.buf);
        snapshots.insert(self.meta.snapshot_id.clone(), (self.meta.clone(), data));

        while snapshots.len() > self.retain {
            let oldest = snapshots.iter().min_by_key(|(_, (m, _))| m.last_log_id).map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    snapshots.remove(&id);
                }
                None => break,
            }
        }

        tracing::debug!(meta = ?self.meta, "snapshot stored");
        Ok(())
    }
}

impl AsyncWrite for MemSnapshotWriter {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut().buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.get_mut().commit())
    }
}

#[async_trait]
impl SnapshotStore for MemSnapshotStore {
    type Writer = MemSnapshotWriter;
    type Reader = Cursor<Vec<u8>>;

    async fn create(&self, meta: &SnapshotMeta) -> anyhow::Result<Self::Writer> {
        Ok(MemSnapshotWriter {
            meta: meta.clone(),
            buf: vec![],
            snapshots: self.snapshots.clone(),
            retain: self.retain,
        })
    }

    async fn list(&self) -> anyhow::Result<Vec<SnapshotMeta>> {
        let snapshots = self.snapshots.lock().map_err(lock_err)?;
        let mut metas = snapshots.values().map(|(m, _)| m.clone()).collect::<Vec<_>>();
        metas.sort_by(|a, b| b.last_log_id.cmp(&a.last_log_id));
        Ok(metas)
    }

    async fn open(&self, id: &SnapshotId) -> anyhow::Result<(SnapshotMeta, Self::Reader)> {
        let snapshots = self.snapshots.lock().map_err(lock_err)?;
        let (meta, data) = snapshots.get(id).ok_or_else(|| MemStoreError::SnapshotNotFound(id.clone()))?;
        Ok((meta.clone(), Cursor::new(data.clone())))
    }
}

/// The data of the state machine.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct MemStoreStateMachine {
    pub last_applied_log: LogId,

    /// The current status of a client by ID.
    pub client_status: HashMap<String, String>,

    /// The last serial number applied for each client.
    pub client_serial: HashMap<String, u64>,
}

/// An in-memory key-value state machine.
///
/// Clones share the data, so a test can keep one to look into the state machine a node owns.
#[derive(Clone, Default)]
pub struct MemStateMachine {
    sm: Arc<RwLock<MemStoreStateMachine>>,
}

impl MemStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get a copy of the state machine data for testing purposes.
    pub async fn get_state_machine(&self) -> MemStoreStateMachine {
        self.sm.read().await.clone()
    }
}

#[async_trait]
impl StateMachine for MemStateMachine {
    type Response = ClientResponse;

    #[tracing::instrument(level = "trace", skip(self, entry), fields(log_id=%entry.log_id))]
    async fn apply(&mut self, entry: &Entry) -> anyhow::Result<ClientResponse> {
        let data = match &entry.payload {
            EntryPayload::Normal(data) => data,
            _ => return Err(anyhow!("entry {} is not a command", entry.log_id)),
        };

        let req: ClientRequest = serde_json::from_slice(data)?;

        let mut sm = self.sm.write().await;
        sm.last_applied_log = entry.log_id;

        // A retried request is not applied again.
        if let Some(serial) = sm.client_serial.get(&req.client) {
            if *serial >= req.serial {
                return Ok(ClientResponse(sm.client_status.get(&req.client).cloned()));
            }
        }

        sm.client_serial.insert(req.client.clone(), req.serial);
        let previous = sm.client_status.insert(req.client, req.status);
        Ok(ClientResponse(previous))
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn snapshot(&mut self) -> anyhow::Result<Vec<u8>> {
        let sm = self.sm.read().await;
        Ok(serde_json::to_vec(&*sm)?)
    }

    #[tracing::instrument(level = "trace", skip(self, data), fields(len=data.len()))]
    async fn restore(&mut self, data: &[u8]) -> anyhow::Result<()> {
        let new_sm: MemStoreStateMachine = serde_json::from_slice(data)?;
        *self.sm.write().await = new_sm;
        Ok(())
    }
}
