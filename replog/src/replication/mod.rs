//! Replication stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::sleep;
use tokio::time::timeout;
use tokio::time::Interval;
use tokio::time::MissedTickBehavior;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::Notify;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::storage::latest_snapshot;
use crate::storage::read_latest_snapshot;
use crate::LogStore;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftTypeConfig;

/// The public handle to a spawned replication stream.
///
/// Dropping it closes the channel to the stream, which then stops.
pub(crate) struct ReplicationStream {
    /// The channel used for communicating with the replication task.
    repl_tx: mpsc::UnboundedSender<(RaftEvent, Span)>,
}

impl ReplicationStream {
    /// Create a new replication stream for the target peer.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new<C: RaftTypeConfig>(
        id: NodeId,
        target: NodeId,
        addr: String,
        term: u64,
        config: Arc<Config>,
        last_log_index: u64,
        commit_index: u64,
        network: Arc<C::Network>,
        log: Arc<C::LogStore>,
        snapshots: Arc<C::SnapshotStore>,
        tx_core: mpsc::UnboundedSender<Notify>,
    ) -> Self {
        ReplicationCore::<C>::spawn(
            id,
            target,
            addr,
            term,
            config,
            last_log_index,
            commit_index,
            network,
            log,
            snapshots,
            tx_core,
        )
    }

    pub(crate) fn send(&self, event: RaftEvent) {
        let _ = self.repl_tx.send((event, tracing::debug_span!("CH")));
    }
}

/// A task responsible for sending replication events to a target follower in the Raft cluster.
///
/// NOTE: we do not stack replication requests to targets because this could result in
/// out-of-order delivery. We always wait for the response of a request before sending the next.
struct ReplicationCore<C: RaftTypeConfig> {
    //////////////////////////////////////////////////////////////////////////
    // Static Fields /////////////////////////////////////////////////////////
    /// The ID of this Raft node.
    id: NodeId,
    /// The ID of the target Raft node which replication events are to be sent to.
    target: NodeId,
    /// The address of the target.
    addr: String,
    /// The current term, which will never change during the lifetime of this task.
    term: u64,

    /// A channel for sending events to the Raft node.
    tx_core: mpsc::UnboundedSender<Notify>,

    /// A channel for receiving events from the Raft node.
    repl_rx: mpsc::UnboundedReceiver<(RaftEvent, Span)>,

    network: Arc<C::Network>,
    log: Arc<C::LogStore>,
    snapshots: Arc<C::SnapshotStore>,

    /// The Raft's runtime config.
    config: Arc<Config>,

    //////////////////////////////////////////////////////////////////////////
    // Dynamic Fields ////////////////////////////////////////////////////////
    /// The target state of this replication stream.
    target_state: TargetReplState,

    /// The index of the log entry to most recently be appended to the log by the leader.
    last_log_index: u64,
    /// The index of the highest log entry which is known to be committed in the cluster.
    commit_index: u64,
    /// The commit index last sent to the target in a successful request.
    sent_commit_index: u64,

    /// The index of the next entry to send.
    next_index: u64,
    /// The index of the last entry known to be replicated on the target.
    matched: u64,

    /// The last request failed in transport: wait for the next heartbeat before retrying.
    backoff: bool,

    /// The heartbeat interval for ensuring that heartbeats are always delivered in a timely fashion.
    heartbeat: Interval,
}

impl<C: RaftTypeConfig> ReplicationCore<C> {
    /// Spawn a new replication task for the target node.
    #[allow(clippy::too_many_arguments)]
    pub(self) fn spawn(
        id: NodeId,
        target: NodeId,
        addr: String,
        term: u64,
        config: Arc<Config>,
        last_log_index: u64,
        commit_index: u64,
        network: Arc<C::Network>,
        log: Arc<C::LogStore>,
        snapshots: Arc<C::SnapshotStore>,
        tx_core: mpsc::UnboundedSender<Notify>,
    ) -> ReplicationStream {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();

        let mut heartbeat = interval(config.heartbeat());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let this = Self {
            id,
            target,
            addr,
            term,
            tx_core,
            repl_rx,
            network,
            log,
            snapshots,
            config,
            target_state: TargetReplState::LineRate,
            last_log_index,
            commit_index,
            sent_commit_index: 0,
            next_index: last_log_index + 1,
            matched: 0,
            backoff: false,
            heartbeat,
        };

        tokio::spawn(this.main().instrument(tracing::debug_span!("replication", id, target, term)));

        ReplicationStream { repl_tx }
    }

    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, target=self.target, cluster=%self.config.cluster_name))]
    async fn main(mut self) {
        // The first tick of an interval completes at once.
        self.heartbeat.tick().await;

        // Perform an initial heartbeat.
        self.send_append_entries().await;

        // Proceed to the replication stream's inner loop.
        loop {
            match &self.target_state {
                TargetReplState::LineRate => self.line_rate_loop().await,
                TargetReplState::Snapshotting => self.snapshotting_loop().await,
                TargetReplState::Terminating => {
                    self.send_final_commit().await;
                    return;
                }
                TargetReplState::Shutdown => return,
            }
        }
    }

    /// Tell the target the commit index before leaving, so that a removed node learns that the
    /// config which removed it is committed.
    async fn send_final_commit(&mut self) {
        if self.commit_index <= self.sent_commit_index || self.next_index <= self.last_log_index {
            return;
        }
        tracing::debug!(commit_index = self.commit_index, "send the last commit index before terminating");
        self.send_append_entries().await;
    }

    #[tracing::instrument(level = "trace", skip(self), fields(state = "line-rate"))]
    async fn line_rate_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::LineRate {
                return;
            }

            if !self.backoff && self.next_index <= self.last_log_index {
                self.send_append_entries().await;
                continue;
            }

            // An idle leader propagates a new commit index sooner than the next heartbeat.
            let nudge_needed = !self.backoff && self.commit_index > self.sent_commit_index;
            let nudge = sleep(self.config.commit_nudge());

            tokio::select! {
                _ = self.heartbeat.tick() => {
                    self.backoff = false;
                    self.send_append_entries().await;
                }

                _ = nudge, if nudge_needed => {
                    self.send_append_entries().await;
                }

                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_raft_rx(event, span),
                        None => self.set_target_state(TargetReplState::Shutdown),
                    }
                }
            }
        }
    }

    /// Send an AppendEntries RPC to the target.
    ///
    /// This request will timeout if no response is received within the
    /// configured heartbeat interval.
    #[tracing::instrument(level = "debug", skip(self), fields(next_index=self.next_index))]
    async fn send_append_entries(&mut self) {
        let prev_log_index = self.next_index - 1;

        let prev_log_term = match self.log_term_at(prev_log_index).await {
            Ok(Some(x)) => x,
            Ok(None) => {
                tracing::info!(prev_log_index, "entry is compacted, switch to snapshot replication");
                self.set_target_state(TargetReplState::Snapshotting);
                return;
            }
            Err(err) => return self.fatal(err),
        };

        let entries = if self.next_index <= self.last_log_index {
            let stop = std::cmp::min(self.last_log_index, prev_log_index + self.config.max_append_entries) + 1;
            match self.log.get_entries(self.next_index, stop).await {
                Ok(entries) if entries.first().map(|x| x.index()) == Some(self.next_index) => entries,
                Ok(_) => {
                    tracing::info!(self.next_index, "entry is compacted, switch to snapshot replication");
                    self.set_target_state(TargetReplState::Snapshotting);
                    return;
                }
                Err(err) => return self.fatal(err),
            }
        } else {
            vec![]
        };

        let n_entries = entries.len() as u64;
        let leader_commit = self.commit_index;

        let payload = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit,
        };

        tracing::debug!(payload=%payload.summary(), "start sending append_entries");

        let res = timeout(
            self.config.heartbeat(),
            self.network.append_entries(self.target, &self.addr, payload),
        )
        .await;

        let res = match res {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, "error sending AppendEntries RPC to target");
                self.backoff = true;
                return;
            }
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending AppendEntries RPC to target");
                self.backoff = true;
                return;
            }
        };

        self.backoff = false;

        // Handle success conditions.
        if res.success {
            let matched = prev_log_index + n_entries;
            self.next_index = matched + 1;
            self.sent_commit_index = std::cmp::max(self.sent_commit_index, leader_commit);
            self.update_matched(matched);
            return;
        }

        // Replication was not successful, if a newer term has been returned, revert to follower.
        if res.term > self.term {
            tracing::info!({ res.term }, "append entries failed, reverting to follower");
            self.send_to_core(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: res.term,
            });
            self.set_target_state(TargetReplState::Shutdown);
            return;
        }

        if res.conflict_index == 0 {
            tracing::warn!(?res, "append entries rejected without a conflict");
            self.backoff = true;
            return;
        }

        if let Err(err) = self.handle_conflict(prev_log_index, res).await {
            self.fatal(err)
        }
    }

    /// Move `next_index` back to where the target's log may match, as hinted by the target.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_conflict(&mut self, prev_log_index: u64, res: AppendEntriesResponse) -> anyhow::Result<()> {
        let next_index = match res.conflict_term {
            Some(term) => match self.last_index_of_term(term, prev_log_index).await? {
                Some(index) => index + 1,
                None => res.conflict_index,
            },
            None => res.conflict_index,
        };

        self.next_index = std::cmp::max(1, std::cmp::min(next_index, prev_log_index));
        tracing::debug!(self.next_index, "conflict, retry from next_index");
        Ok(())
    }

    /// The last index of entries of `term` in the leader's log before `index`.
    async fn last_index_of_term(&self, term: u64, index: u64) -> anyhow::Result<Option<u64>> {
        let mut i = index.saturating_sub(1);
        while i > 0 {
            match self.log.get_entry(i).await? {
                Some(entry) if entry.term() == term => return Ok(Some(i)),
                Some(entry) if entry.term() < term => return Ok(None),
                Some(_) => i -= 1,
                None => return Ok(None),
            }
        }
        Ok(None)
    }

    /// The term of the entry at `index` in the log or the latest snapshot.
    async fn log_term_at(&self, index: u64) -> anyhow::Result<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }

        if let Some(entry) = self.log.get_entry(index).await? {
            return Ok(Some(entry.term()));
        }

        let snapshot = latest_snapshot(self.snapshots.as_ref()).await?;
        Ok(snapshot.filter(|m| m.last_log_id.index == index).map(|m| m.last_log_id.term))
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn set_target_state(&mut self, state: TargetReplState) {
        self.target_state = state;
    }

    fn update_matched(&mut self, matched: u64) {
        if matched <= self.matched && self.matched != 0 {
            return;
        }
        self.matched = matched;

        tracing::debug!(target=%self.target, matched=%self.matched, "update_matched");

        self.send_to_core(ReplicaEvent::UpdateMatchIndex {
            target: self.target,
            term: self.term,
            matched,
        });
    }

    fn send_to_core(&self, event: ReplicaEvent) {
        let _ = self.tx_core.send(Notify::Replica(event));
    }

    /// A storage error on the leader: stop, and let the core shut down.
    fn fatal(&mut self, err: anyhow::Error) {
        tracing::error!(error=%err, "replication failed on a storage error");
        self.set_target_state(TargetReplState::Shutdown);
        let _ = self.tx_core.send(Notify::Fatal(err));
    }

    /// Fully drain the channel coming in from the Raft node.
    fn drain_raft_rx(&mut self, first: RaftEvent, span: Span) {
        let mut event_opt = Some((first, span));

        while let Some((event, span)) = event_opt.take() {
            let _ent = span.enter();

            // Process the event.
            match event {
                RaftEvent::UpdateCommitIndex { commit_index } => {
                    self.commit_index = std::cmp::max(self.commit_index, commit_index);
                }

                RaftEvent::Replicate {
                    last_log_index,
                    commit_index,
                } => {
                    self.commit_index = std::cmp::max(self.commit_index, commit_index);
                    self.last_log_index = std::cmp::max(self.last_log_index, last_log_index);
                }

                RaftEvent::Terminate => {
                    self.set_target_state(TargetReplState::Terminating);
                    return;
                }
            }

            event_opt = self.repl_rx.try_recv().ok();
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(state = "snapshotting"))]
    async fn snapshotting_loop(&mut self) {
        loop {
            if self.target_state != TargetReplState::Snapshotting {
                return;
            }

            if let Err(err) = self.send_snapshot().await {
                return self.fatal(err);
            }

            if self.target_state != TargetReplState::Snapshotting {
                return;
            }

            // Retry on the next heartbeat.
            tokio::select! {
                _ = self.heartbeat.tick() => {}

                event_span = self.repl_rx.recv() => {
                    match event_span {
                        Some((event, span)) => self.drain_raft_rx(event, span),
                        None => self.set_target_state(TargetReplState::Shutdown),
                    }
                }
            }
        }
    }

    /// Send the latest snapshot to the target in a single request.
    ///
    /// Returns an error only for a storage failure. On success the stream is back at line rate.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn send_snapshot(&mut self) -> anyhow::Result<()> {
        let (meta, data) = match read_latest_snapshot(self.snapshots.as_ref()).await? {
            Some(x) => x,
            None => {
                tracing::warn!("no snapshot to send, wait for one to be built");
                return Ok(());
            }
        };

        tracing::info!(meta = %meta.summary(), len = data.len(), "sending snapshot");

        let snapshot_last = meta.last_log_id;
        let req = InstallSnapshotRequest {
            term: self.term,
            leader_id: self.id,
            meta,
            data,
        };

        let res = timeout(
            self.config.install_snapshot_timeout(),
            self.network.install_snapshot(self.target, &self.addr, req),
        )
        .await;

        let res = match res {
            Ok(Ok(res)) => res,
            Ok(Err(err)) => {
                tracing::warn!(error=%err, "error sending InstallSnapshot RPC to target");
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(error=%err, "timeout while sending InstallSnapshot RPC to target");
                return Ok(());
            }
        };

        if res.term > self.term {
            tracing::info!({ res.term }, "install snapshot failed, reverting to follower");
            self.send_to_core(ReplicaEvent::RevertToFollower {
                target: self.target,
                term: res.term,
            });
            self.set_target_state(TargetReplState::Shutdown);
            return Ok(());
        }

        if !res.success {
            return Ok(());
        }

        self.next_index = snapshot_last.index + 1;
        self.update_matched(snapshot_last.index);
        self.set_target_state(TargetReplState::LineRate);
        Ok(())
    }
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// The state of the replication stream.
#[derive(Debug, Eq, PartialEq)]
enum TargetReplState {
    /// The replication stream is running at line rate.
    LineRate,
    /// The replication stream is sending a snapshot over to the target node.
    Snapshotting,
    /// The replication stream is asked to stop: it sends the last commit index, then shuts down.
    Terminating,
    /// The replication stream is shutting down.
    Shutdown,
}

/// An event from the Raft node.
#[derive(Debug)]
pub(crate) enum RaftEvent {
    Replicate {
        /// The index of the last entry in the leader's log.
        last_log_index: u64,
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    /// A message from Raft indicating a new commit index value.
    UpdateCommitIndex {
        /// The index of the highest log entry which is known to be committed in the cluster.
        commit_index: u64,
    },
    Terminate,
}

/// An event coming from a replication stream.
#[derive(Debug)]
pub(crate) enum ReplicaEvent {
    /// An event from a replication stream which updates the target node's match index.
    UpdateMatchIndex {
        /// The ID of the target node for which the match index is to be updated.
        target: NodeId,
        /// The term of the leader the stream replicates for.
        term: u64,
        /// The index of the most recent log known to have been successfully replicated on the target.
        matched: u64,
    },
    /// An event indicating that the Raft node needs to revert to follower state.
    RevertToFollower {
        /// The ID of the target node from which the new term was observed.
        target: NodeId,
        /// The new term observed.
        term: u64,
    },
}

impl MessageSummary for ReplicaEvent {
    fn summary(&self) -> String {
        match self {
            ReplicaEvent::UpdateMatchIndex { target, term, matched } => {
                format!("UpdateMatchIndex: target: {}, term: {}, matched: {}", target, term, matched)
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                format!("RevertToFollower: target: {}, term: {}", target, term)
            }
        }
    }
}
