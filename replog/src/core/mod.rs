//! The core logic of a Raft node.
//!
//! `RaftCore` is the single owner of all protocol state. Everything that changes the state of a
//! node, an API call, an RPC, the expiry of a timer or the outcome of a background task, reaches
//! the core as a message and is handled to completion before the next one is taken up.

mod admin;
mod append_entries;
mod apply;
mod client;
mod install_snapshot;
mod replication;
mod snapshot;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::commit::CommitTracker;
use crate::config::Config;
use crate::core::apply::StateMachineHandle;
use crate::core::apply::StateMachineWorker;
use crate::core::client::Responder;
use crate::error::ClientWriteError;
use crate::error::ForwardToLeader;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::EffectiveMembership;
use crate::membership::Membership;
use crate::membership::MembershipState;
use crate::metrics::RaftMetrics;
use crate::raft::RaftMsg;
use crate::raft::VoteResponse;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::read_latest_snapshot;
use crate::storage::SnapshotMeta;
use crate::storage::Storage;
use crate::storage::Vote;
use crate::timer::Epochs;
use crate::timer::Tick;
use crate::timer::Timer;
use crate::timer::TimerKind;
use crate::LogId;
use crate::LogStore;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftTypeConfig;
use crate::StableStore;

/// An event produced by a task the core spawned, delivered back into the core.
pub(crate) enum Notify {
    /// A timer expired.
    Tick(Tick),

    /// The response of a peer to a RequestVote sent in `term`.
    VoteResponse {
        target: NodeId,
        term: u64,
        resp: VoteResponse,
    },

    /// An event from a replication stream.
    Replica(ReplicaEvent),

    /// The state machine worker applied entries up to `last_applied`.
    Applied { last_applied: LogId },

    /// The state machine worker finished building a snapshot. `None` if there was nothing to snapshot.
    SnapshotBuilt(Option<SnapshotMeta>),

    /// A background task hit an error it can not recover from.
    Fatal(anyhow::Error),
}

impl From<Tick> for Notify {
    fn from(t: Tick) -> Self {
        Notify::Tick(t)
    }
}

impl MessageSummary for Notify {
    fn summary(&self) -> String {
        match self {
            Notify::Tick(t) => format!("Tick: {:?}", t),
            Notify::VoteResponse { target, term, resp } => {
                format!("VoteResponse: target:{}, term:{}, resp:{:?}", target, term, resp)
            }
            Notify::Replica(ev) => format!("Replica: {}", ev.summary()),
            Notify::Applied { last_applied } => format!("Applied: {}", last_applied),
            Notify::SnapshotBuilt(meta) => format!("SnapshotBuilt: {}", meta.summary()),
            Notify::Fatal(err) => format!("Fatal: {}", err),
        }
    }
}

/// The core type implementing the Raft protocol.
pub struct RaftCore<C: RaftTypeConfig> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The `RaftNetwork` implementation.
    network: Arc<C::Network>,
    /// The storage collaborators.
    storage: Storage<C>,

    /// The committed and the effective cluster config.
    membership: MembershipState,

    /// The target state of the system.
    target_state: State,

    /// The index of the highest log entry known to be committed cluster-wide.
    ///
    /// Is initialized to 0, or to the last index of the snapshot on restart, and increases
    /// monotonically.
    commit_index: u64,
    /// The last log id the state machine worker reported as applied.
    last_applied: LogId,
    /// The greatest index handed to the state machine worker to apply.
    apply_requested: u64,

    /// The current term.
    ///
    /// Is initialized to 0 on first boot, and increases monotonically.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the current term.
    voted_for: Option<NodeId>,

    /// The id of the last entry in the log, or of the snapshot if the log is empty.
    last_log_id: LogId,

    /// The last log id covered by the latest snapshot.
    snapshot_last_log_id: Option<LogId>,
    /// Whether the state machine worker is building a snapshot.
    snapshot_in_progress: bool,

    epochs: Epochs,
    election_timer: Option<Timer>,
    snapshot_timer: Option<Timer>,

    sm: StateMachineHandle<C::Response>,
    sm_handle: Option<JoinHandle<()>>,

    tx_notify: mpsc::UnboundedSender<Notify>,
    rx_notify: mpsc::UnboundedReceiver<Notify>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg<C>, tracing::Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<C: RaftTypeConfig> RaftCore<C> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<C::Network>,
        storage: Storage<C>,
        state_machine: C::StateMachine,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg<C>, tracing::Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let (tx_notify, rx_notify) = mpsc::unbounded_channel();

        let (sm, sm_handle) = StateMachineWorker::<C>::spawn(
            id,
            config.max_append_entries,
            state_machine,
            storage.log.clone(),
            storage.snapshot.clone(),
            tx_notify.clone(),
        );

        let this = Self {
            id,
            config,
            network,
            storage,
            membership: MembershipState::default(),
            target_state: State::Follower,
            commit_index: 0,
            last_applied: LogId::default(),
            apply_requested: 0,
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId::default(),
            snapshot_last_log_id: None,
            snapshot_in_progress: false,
            epochs: Epochs::default(),
            election_timer: None,
            snapshot_timer: None,
            sm,
            sm_handle: Some(sm_handle),
            tx_notify,
            rx_notify,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main())
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        let res = self.do_main().await;

        tracing::info!(res = ?res.as_ref().err(), "node has shutdown");

        self.target_state = State::Shutdown;
        self.election_timer = None;
        self.snapshot_timer = None;
        self.report_metrics();

        // Let the state machine worker drain what it has been given, then stop it.
        self.sm.close();
        if let Some(h) = self.sm_handle.take() {
            let _ = h.await;
        }

        res
    }

    async fn do_main(&mut self) -> RaftResult<()> {
        self.recover().await?;
        self.arm_snapshot_timer();
        self.report_metrics();

        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(self).run().await?,
                State::Candidate => CandidateState::new(self).run().await?,
                State::Follower => FollowerState::new(self).run().await?,
                State::Shutdown => return Ok(()),
            }
        }
    }

    /// Load the persisted state and decide the initial role.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn recover(&mut self) -> RaftResult<()> {
        self.current_term = self.storage.stable.get_term().await.map_err(|err| self.map_fatal_storage_error(err))?;
        let vote = self.storage.stable.get_vote().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.voted_for = vote.filter(|v| v.term == self.current_term).map(|v| v.voted_for);

        // Restore the state machine from the newest snapshot.
        let latest = read_latest_snapshot(self.storage.snapshot.as_ref())
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        if let Some((meta, data)) = latest {

            tracing::info!(snapshot = %meta.summary(), "restore state machine from snapshot");

            let res = self.sm.install(meta.clone(), data, false).await;
            res.map_err(|err| self.map_fatal_storage_error(err))?;

            self.snapshot_last_log_id = Some(meta.last_log_id);
            self.last_log_id = meta.last_log_id;
            self.commit_index = meta.last_log_id.index;
            self.apply_requested = meta.last_log_id.index;
            self.last_applied = meta.last_log_id;
            self.membership = MembershipState::new_committed(meta.membership);
        }

        // Rebuild the config from the entries after the snapshot.
        let last_index = self.storage.log.last_index().await.map_err(|err| self.map_fatal_storage_error(err))?;
        let snapshot_index = self.snapshot_index();

        if last_index > snapshot_index {
            let first_index = self.storage.log.first_index().await.map_err(|err| self.map_fatal_storage_error(err))?;
            let mut start = std::cmp::max(first_index, snapshot_index + 1);

            while start <= last_index {
                let stop = std::cmp::min(last_index + 1, start + self.config.max_append_entries);
                let entries = self
                    .storage
                    .log
                    .get_entries(start, stop)
                    .await
                    .map_err(|err| self.map_fatal_storage_error(err))?;

                let last = match entries.last() {
                    Some(x) => x.log_id,
                    None => {
                        return Err(self.map_fatal_storage_error(anyhow::anyhow!(
                            "log entry {} is missing, last index is {}",
                            start,
                            last_index
                        )));
                    }
                };

                for entry in entries.iter() {
                    if let Some(m) = entry.membership() {
                        self.membership.append(EffectiveMembership::new(entry.index(), m.clone()));
                    }
                }

                self.last_log_id = last;
                start = last.index + 1;
            }
        }

        tracing::info!(
            term = self.current_term,
            last_log_id = %self.last_log_id,
            commit_index = self.commit_index,
            membership = %self.membership.effective().summary(),
            "recovered"
        );

        if self.membership.effective().membership.is_empty() {
            if self.config.enable_single_node {
                tracing::info!("pristine node with single node mode enabled, become leader of itself");
                self.membership = MembershipState::new_committed(EffectiveMembership::new(
                    0,
                    Membership::new_voters([(self.id, "")]),
                ));
                return self.elect_self().await;
            }
        } else if self.is_voter() && !self.has_voter_peers() && self.config.enable_single_node {
            return self.elect_self().await;
        }

        self.set_target_state(State::Follower);
        Ok(())
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self) {
        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied.index,
            commit_index: self.commit_index,
            current_leader: self.current_leader,
            membership: self.membership.effective().membership.clone(),
            snapshot: self.snapshot_last_log_id,
        });

        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Update core's target state, ensuring all invariants are upheld.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        if self.target_state == State::Shutdown {
            return;
        }
        self.target_state = target_state;
    }

    /// Start a new election timer with a fresh random timeout. The previous one is cancelled.
    fn arm_election_timer(&mut self) {
        let epoch = self.epochs.next();
        let after = self.config.new_rand_election_timeout();
        self.election_timer = Some(Timer::start(TimerKind::Election, epoch, after, self.tx_notify.clone()));
    }

    fn arm_snapshot_timer(&mut self) {
        let epoch = self.epochs.next();
        let after = self.config.new_rand_snapshot_interval();
        self.snapshot_timer = Some(Timer::start(TimerKind::SnapshotCheck, epoch, after, self.tx_notify.clone()));
    }

    fn is_current_tick(&self, tick: &Tick) -> bool {
        let timer = match tick.kind {
            TimerKind::Election => &self.election_timer,
            TimerKind::SnapshotCheck => &self.snapshot_timer,
        };
        timer.as_ref().map(|t| t.is_current(tick)).unwrap_or(false)
    }

    /// Update the value of the `current_leader` property.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id);
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Move to a greater term and persist it. The vote of the old term does not carry over.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn update_current_term(&mut self, new_term: u64) -> RaftResult<()> {
        if new_term > self.current_term {
            self.storage.stable.set_term(new_term).await.map_err(|err| self.map_fatal_storage_error(err))?;
            self.current_term = new_term;
            self.voted_for = None;
        }
        Ok(())
    }

    /// Persist the vote cast in the current term.
    async fn save_vote(&mut self, voted_for: NodeId) -> RaftResult<()> {
        let vote = Vote {
            term: self.current_term,
            voted_for,
        };
        self.storage.stable.set_vote(&vote).await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.voted_for = Some(voted_for);
        Ok(())
    }

    /// Start a new term voting for this node, and lead it without asking anyone.
    ///
    /// Only used when this node is the only voter and single node mode is enabled.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn elect_self(&mut self) -> RaftResult<()> {
        self.update_current_term(self.current_term + 1).await?;
        self.save_vote(self.id).await?;
        self.set_target_state(State::Leader);
        Ok(())
    }

    /// Encapsulate the process of updating the current term, as updating the `voted_for` state must also be updated.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn step_down(&mut self, new_term: u64, leader: UpdateCurrentLeader) -> RaftResult<()> {
        self.update_current_term(new_term).await?;
        self.update_current_leader(leader);
        self.set_target_state(State::Follower);
        Ok(())
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the storage layer.
    ///
    /// This method assumes that a storage error observed here is non-recoverable. As such, the
    /// Raft node will be instructed to stop. If such behavior is not needed, then don't use this
    /// interface.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::Storage(err)
    }

    fn snapshot_index(&self) -> u64 {
        self.snapshot_last_log_id.map(|x| x.index).unwrap_or_default()
    }

    fn is_voter(&self) -> bool {
        self.membership.effective().membership.is_voter(&self.id)
    }

    /// Whether any other node votes in a relevant config.
    fn has_voter_peers(&self) -> bool {
        self.membership.voter_ids().iter().any(|id| *id != self.id)
    }

    /// What a non-leader tells a client about where to send its request.
    fn forward_to_leader(&self) -> ForwardToLeader {
        let leader_addr = self.current_leader.and_then(|id| self.membership.addr_of(&id)).map(|x| x.to_string());
        ForwardToLeader {
            leader_id: self.current_leader,
            leader_addr,
        }
    }

    /// Hand newly committed entries to the state machine worker.
    fn apply_committed(&mut self, responders: Vec<(u64, Responder<C::Response>)>) -> RaftResult<()> {
        if self.commit_index <= self.apply_requested && responders.is_empty() {
            return Ok(());
        }
        let res = self.sm.apply(self.commit_index, responders);
        res.map_err(|err| self.map_fatal_storage_error(err))?;
        self.apply_requested = self.commit_index;
        Ok(())
    }

    /// The commit index advanced on a non-leader.
    async fn on_commit_advanced(&mut self) -> RaftResult<()> {
        self.apply_committed(vec![])?;

        let prev_committed = self.membership.committed().clone();
        if self.membership.commit(self.commit_index) {
            self.check_self_removal(&prev_committed).await?;
        }
        Ok(())
    }

    /// Handle an API message on a node which is not the leader.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(state=?self.target_state))]
    async fn handle_api_msg(&mut self, msg: RaftMsg<C>) -> RaftResult<()> {
        tracing::debug!("recv from rx_api: {}", msg.summary());

        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.handle_append_entries_request(rpc).await);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let _ = tx.send(self.handle_vote_request(rpc).await);
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.handle_install_snapshot_request(rpc).await);
            }
            RaftMsg::ClientWrite { tx, .. } => {
                let _ = tx.send(Err(ClientWriteError::ForwardToLeader(self.forward_to_leader())));
            }
            RaftMsg::Initialize { members, tx } => {
                let _ = tx.send(self.handle_initialize(members).await);
            }
            RaftMsg::ChangeMembership { tx, .. } => {
                let _ = tx.send(Err(self.forward_to_leader().into()));
            }
            RaftMsg::TriggerSnapshot { tx } => {
                let _ = tx.send(self.trigger_snapshot());
            }
        }
        Ok(())
    }

    /// Handle the internal events which every role deals with in the same way.
    #[tracing::instrument(level = "debug", skip(self, notify), fields(notify=%notify.summary()))]
    async fn handle_notify(&mut self, notify: Notify) -> RaftResult<()> {
        match notify {
            Notify::Tick(tick) => {
                if !self.is_current_tick(&tick) {
                    tracing::debug!(?tick, "ignore stale tick");
                    return Ok(());
                }
                match tick.kind {
                    TimerKind::Election => {
                        // Roles which care about it handle it before reaching here.
                    }
                    TimerKind::SnapshotCheck => {
                        self.handle_snapshot_check()?;
                    }
                }
            }
            Notify::VoteResponse { .. } => {
                // Only a candidate waits for votes.
            }
            Notify::Replica(_) => {
                // Only a leader has replication streams.
            }
            Notify::Applied { last_applied } => {
                if last_applied > self.last_applied {
                    self.last_applied = last_applied;
                }
                self.report_metrics();
            }
            Notify::SnapshotBuilt(meta) => {
                self.handle_snapshot_built(meta).await?;
            }
            Notify::Fatal(err) => {
                return Err(self.map_fatal_storage_error(err));
            }
        }
        Ok(())
    }

    /// Whether an election timer tick is current and should be acted upon.
    fn is_election_timeout(&self, notify: &Notify) -> bool {
        match notify {
            Notify::Tick(tick) => tick.kind == TimerKind::Election && self.is_current_tick(tick),
            _ => false,
        }
    }

    /// The election timer expired on a follower or a candidate.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn on_election_timeout(&mut self) -> RaftResult<()> {
        if !self.is_voter() {
            tracing::debug!("not a voter, do not campaign");
            self.set_target_state(State::Follower);
            self.arm_election_timer();
            return Ok(());
        }

        if !self.has_voter_peers() {
            if self.config.enable_single_node {
                return self.elect_self().await;
            }
            tracing::debug!("no voter peers and single node mode disabled, do not campaign");
            self.set_target_state(State::Follower);
            self.arm_election_timer();
            return Ok(());
        }

        self.set_target_state(State::Candidate);
        Ok(())
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The Raft node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The replication state of a target node, on the leader.
struct ReplicationState {
    stream: ReplicationStream,

    /// Once the target is matched up to this index, stop replicating to it.
    ///
    /// Set when a config without the target is committed before the target received it.
    remove_after_commit: Option<u64>,
}

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, C: RaftTypeConfig> {
    pub(super) core: &'a mut RaftCore<C>,
    /// The term this leader leads. A leader removed from its cluster may start leading a new one
    /// of its own in a greater term.
    term: u64,
    /// A mapping of node IDs the replication state of the target node.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState>,
    /// Match indexes of all targets and of the leader itself.
    pub(super) tracker: CommitTracker,
    /// Requests appended to the log which wait for their entry to be committed, by log index.
    pub(super) awaiting_committed: BTreeMap<u64, Responder<C::Response>>,
    /// A bool indicating if this node will be stepping down after committing the current config change.
    pub(super) is_stepping_down: bool,
}

impl<'a, C: RaftTypeConfig> LeaderState<'a, C> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<C>) -> Self {
        let tracker = CommitTracker::new(core.last_log_id.index + 1);
        let term = core.current_term;
        Self {
            core,
            term,
            nodes: BTreeMap::new(),
            tracker,
            awaiting_committed: BTreeMap::new(),
            is_stepping_down: false,
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        tracing::info!(term = self.core.current_term, "become leader");

        self.core.election_timer = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);

        self.update_replication_targets();
        self.core.report_metrics();

        self.commit_initial_leader_entry().await?;

        loop {
            if !self.core.target_state.is_leader() || self.core.current_term != self.term {
                self.step_down_cleanup();
                return Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    self.handle_msg(msg).instrument(span).await?;
                },
                Some(notify) = self.core.rx_notify.recv() => {
                    match notify {
                        Notify::Replica(event) => self.handle_replica_event(event).await?,
                        _ => self.core.handle_notify(notify).await?,
                    }
                },
                _ = &mut self.core.rx_shutdown => {
                    tracing::info!("leader recv from rx_shutdown");
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    /// Stop replication and reject the requests which will not be answered by this node.
    fn step_down_cleanup(&mut self) {
        let nodes = std::mem::take(&mut self.nodes);

        // A leader which removed itself lets the followers learn the commit of that config.
        if self.is_stepping_down {
            for node in nodes.values() {
                node.stream.send(RaftEvent::Terminate);
            }
        }

        let forward = self.core.forward_to_leader();
        let awaiting = std::mem::take(&mut self.awaiting_committed);
        for (_, responder) in awaiting.into_iter() {
            responder.forward(forward.clone());
        }
    }

    /// Start replication to every node of a relevant config without a stream yet.
    pub(super) fn update_replication_targets(&mut self) {
        let targets: BTreeSet<NodeId> = self.core.membership.node_ids();

        for target in targets {
            if target == self.core.id || self.nodes.contains_key(&target) {
                continue;
            }

            let addr = self.core.membership.addr_of(&target).unwrap_or_default().to_string();
            tracing::info!(target, %addr, "start replication");

            let stream = ReplicationStream::new::<C>(
                self.core.id,
                target,
                addr,
                self.core.current_term,
                self.core.config.clone(),
                self.core.last_log_id.index,
                self.core.commit_index,
                self.core.network.clone(),
                self.core.storage.log.clone(),
                self.core.storage.snapshot.clone(),
                self.core.tx_notify.clone(),
            );

            self.nodes.insert(target, ReplicationState {
                stream,
                remove_after_commit: None,
            });
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, C: RaftTypeConfig> {
    core: &'a mut RaftCore<C>,
    /// The nodes which granted their vote in the current term, this node included.
    granted: BTreeSet<NodeId>,
}

impl<'a, C: RaftTypeConfig> CandidateState<'a, C> {
    pub(self) fn new(core: &'a mut RaftCore<C>) -> Self {
        Self {
            core,
            granted: BTreeSet::new(),
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }

            // Setup new term.
            self.core.arm_election_timer();
            self.core.update_current_term(self.core.current_term + 1).await?;
            self.core.save_vote(self.core.id).await?;
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.report_metrics();

            self.granted = BTreeSet::new();
            self.granted.insert(self.core.id);

            tracing::info!(term = self.core.current_term, "start election");

            // Send RPCs to all voters in parallel.
            self.spawn_parallel_vote_requests();

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }

                tokio::select! {
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        self.core.handle_api_msg(msg).instrument(span).await?;
                    },
                    Some(notify) = self.core.rx_notify.recv() => {
                        if self.core.is_election_timeout(&notify) {
                            self.core.on_election_timeout().await?;
                            // Begin a new term, or leave the candidate state.
                            break;
                        }
                        match notify {
                            Notify::VoteResponse { target, term, resp } => {
                                self.handle_vote_response(target, term, resp).await?;
                            }
                            _ => self.core.handle_notify(notify).await?,
                        }
                    },
                    _ = &mut self.core.rx_shutdown => {
                        self.core.set_target_state(State::Shutdown);
                    }
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
struct FollowerState<'a, C: RaftTypeConfig> {
    core: &'a mut RaftCore<C>,
}

impl<'a, C: RaftTypeConfig> FollowerState<'a, C> {
    pub(self) fn new(core: &'a mut RaftCore<C>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.arm_election_timer();
        self.core.report_metrics();

        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    self.core.handle_api_msg(msg).instrument(span).await?;
                },
                Some(notify) = self.core.rx_notify.recv() => {
                    if self.core.is_election_timeout(&notify) {
                        self.core.on_election_timeout().await?;
                    } else {
                        self.core.handle_notify(notify).await?;
                    }
                },
                _ = &mut self.core.rx_shutdown => {
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }
}
