//! The task which owns the state machine.
//!
//! Committed entries are applied here, off the core's loop, so that a slow state machine does not
//! delay RPC handling. The core only hands over work and is told about progress.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::core::client::Responder;
use crate::core::Notify;
use crate::entry::EntryPayload;
use crate::membership::EffectiveMembership;
use crate::storage::SnapshotMeta;
use crate::AppDataResponse;
use crate::LogId;
use crate::LogStore;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftTypeConfig;
use crate::SnapshotStore;
use crate::StateMachine;

/// A job for the state machine worker.
pub(crate) enum Command<R: AppDataResponse> {
    /// Apply every entry up to `upto`, and answer the responders of the applied entries.
    Apply {
        upto: u64,
        responders: Vec<(u64, Responder<R>)>,
    },

    /// Serialize the state machine into a new snapshot.
    BuildSnapshot,

    /// Replace the state machine with a snapshot. If `persist`, store the snapshot first.
    Install {
        meta: SnapshotMeta,
        data: Vec<u8>,
        persist: bool,
        tx: oneshot::Sender<anyhow::Result<()>>,
    },
}

impl<R: AppDataResponse> MessageSummary for Command<R> {
    fn summary(&self) -> String {
        match self {
            Command::Apply { upto, responders } => format!("Apply: upto:{}, responders:{}", upto, responders.len()),
            Command::BuildSnapshot => "BuildSnapshot".to_string(),
            Command::Install { meta, persist, .. } => format!("Install: {}, persist:{}", meta.summary(), persist),
        }
    }
}

/// The core's end of the channel to the state machine worker.
pub(crate) struct StateMachineHandle<R: AppDataResponse> {
    tx: Option<mpsc::UnboundedSender<Command<R>>>,
}

impl<R: AppDataResponse> StateMachineHandle<R> {
    fn send(&self, cmd: Command<R>) -> anyhow::Result<()> {
        let tx = self.tx.as_ref().ok_or_else(|| anyhow!("state machine worker is closed"))?;
        tx.send(cmd).map_err(|_| anyhow!("state machine worker has quit"))
    }

    pub(crate) fn apply(&self, upto: u64, responders: Vec<(u64, Responder<R>)>) -> anyhow::Result<()> {
        self.send(Command::Apply { upto, responders })
    }

    pub(crate) fn build_snapshot(&self) -> anyhow::Result<()> {
        self.send(Command::BuildSnapshot)
    }

    /// Install a snapshot and wait for it to finish.
    pub(crate) async fn install(&self, meta: SnapshotMeta, data: Vec<u8>, persist: bool) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Install {
            meta,
            data,
            persist,
            tx,
        })?;
        rx.await.map_err(|_| anyhow!("state machine worker has quit"))?
    }

    /// No more commands: the worker quits after finishing the queued ones.
    pub(crate) fn close(&mut self) {
        self.tx = None;
    }
}

pub(crate) struct StateMachineWorker<C: RaftTypeConfig> {
    id: NodeId,
    batch: u64,
    fsm: C::StateMachine,
    log: Arc<C::LogStore>,
    snapshots: Arc<C::SnapshotStore>,

    last_applied: LogId,
    /// The config as of `last_applied`.
    last_membership: EffectiveMembership,
    /// Distinguishes snapshots built at the same log id.
    snapshot_seq: u64,

    rx: mpsc::UnboundedReceiver<Command<C::Response>>,
    tx_notify: mpsc::UnboundedSender<Notify>,
}

impl<C: RaftTypeConfig> StateMachineWorker<C> {
    pub(crate) fn spawn(
        id: NodeId,
        batch: u64,
        fsm: C::StateMachine,
        log: Arc<C::LogStore>,
        snapshots: Arc<C::SnapshotStore>,
        tx_notify: mpsc::UnboundedSender<Notify>,
    ) -> (StateMachineHandle<C::Response>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();

        let this = Self {
            id,
            batch,
            fsm,
            log,
            snapshots,
            last_applied: LogId::default(),
            last_membership: EffectiveMembership::default(),
            snapshot_seq: 0,
            rx,
            tx_notify,
        };

        let handle = tokio::spawn(this.main().instrument(tracing::debug_span!("state_machine", id)));
        (StateMachineHandle { tx: Some(tx) }, handle)
    }

    async fn main(mut self) {
        while let Some(cmd) = self.rx.recv().await {
            tracing::debug!("state machine recv: {}", cmd.summary());

            let res = match cmd {
                Command::Apply { upto, responders } => self.apply(upto, responders).await,
                Command::BuildSnapshot => self.build_snapshot().await,
                Command::Install {
                    meta,
                    data,
                    persist,
                    tx,
                } => {
                    let res = self.install(meta, data, persist).await;
                    let failed = res.is_err();
                    let _ = tx.send(res);
                    if failed {
                        // The core shuts down on receiving the error.
                        return;
                    }
                    Ok(())
                }
            };

            if let Err(err) = res {
                tracing::error!(error = %err, id = self.id, "state machine failed");
                let _ = self.tx_notify.send(Notify::Fatal(err));
                return;
            }
        }
    }

    #[tracing::instrument(level = "debug", skip(self, responders))]
    async fn apply(&mut self, upto: u64, responders: Vec<(u64, Responder<C::Response>)>) -> anyhow::Result<()> {
        let mut responders: BTreeMap<u64, Responder<C::Response>> = responders.into_iter().collect();

        while self.last_applied.index < upto {
            let start = self.last_applied.index + 1;
            let stop = std::cmp::min(upto + 1, start + self.batch);

            let entries = self.log.get_entries(start, stop).await?;
            if entries.is_empty() {
                return Err(anyhow!("committed entry {} is not in the log", start));
            }

            for entry in entries.iter() {
                let data = match &entry.payload {
                    EntryPayload::Normal(_) => Some(self.fsm.apply(entry).await?),
                    EntryPayload::Membership(m) => {
                        self.last_membership = EffectiveMembership::new(entry.index(), m.clone());
                        None
                    }
                    EntryPayload::Blank => None,
                };

                self.last_applied = entry.log_id;

                if let Some(responder) = responders.remove(&entry.index()) {
                    responder.applied(entry.log_id, data, &self.last_membership);
                }
            }
        }

        if !responders.is_empty() {
            tracing::warn!(indexes = ?responders.keys().collect::<Vec<_>>(), "requests of entries applied before");
        }

        let _ = self.tx_notify.send(Notify::Applied {
            last_applied: self.last_applied,
        });
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn build_snapshot(&mut self) -> anyhow::Result<()> {
        if self.last_applied.index == 0 {
            let _ = self.tx_notify.send(Notify::SnapshotBuilt(None));
            return Ok(());
        }

        let data = self.fsm.snapshot().await?;

        self.snapshot_seq += 1;
        let meta = SnapshotMeta {
            last_log_id: self.last_applied,
            membership: self.last_membership.clone(),
            snapshot_id: format!("{}-{}-{}", self.last_applied.term, self.last_applied.index, self.snapshot_seq),
        };

        write_snapshot(self.snapshots.as_ref(), &meta, &data).await?;

        tracing::info!(meta = %meta.summary(), len = data.len(), "snapshot built");

        let _ = self.tx_notify.send(Notify::SnapshotBuilt(Some(meta)));
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, meta, data), fields(meta=%meta.summary()))]
    async fn install(&mut self, meta: SnapshotMeta, data: Vec<u8>, persist: bool) -> anyhow::Result<()> {
        if persist {
            write_snapshot(self.snapshots.as_ref(), &meta, &data).await?;
        }

        self.fsm.restore(&data).await?;

        self.last_applied = meta.last_log_id;
        self.last_membership = meta.membership;

        let _ = self.tx_notify.send(Notify::Applied {
            last_applied: self.last_applied,
        });
        Ok(())
    }
}

async fn write_snapshot<S: SnapshotStore + ?Sized>(store: &S, meta: &SnapshotMeta, data: &[u8]) -> anyhow::Result<()> {
    let mut w = store.create(meta).await?;
    w.write_all(data).await?;
    w.shutdown().await?;
    Ok(())
}
