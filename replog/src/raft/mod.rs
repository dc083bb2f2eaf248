//! Public Raft interface and data types.

mod message;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

pub use message::*;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ChangeMembershipError;
use crate::error::ClientWriteError;
use crate::error::InitializeError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::membership::MembershipChange;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::storage::Storage;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftTypeConfig;

struct RaftInner<C: RaftTypeConfig> {
    tx_api: mpsc::UnboundedSender<(RaftMsg<C>, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The Raft API.
///
/// This type is the interface to a running Raft node. Applications use it to spawn a Raft task
/// and interact with the spawned task.
///
/// For more information on the Raft protocol, see
/// [the Raft paper](https://raft.github.io/raft.pdf) (**pdf warning**).
///
/// ### clone
/// This type implements `Clone`, and should be cloned liberally. The clone itself is very cheap
/// and helps to facilitate use with async workflows.
///
/// ### shutting down
/// If any of the interfaces returns a `RaftError::ShuttingDown`, this indicates that the Raft node
/// is shutting down (potentially for data safety reasons due to a storage error), and the `shutdown`
/// method should be called on this type to await the shutdown of the node. If the parent
/// application needs to shutdown the Raft node for any reason, calling `shutdown` will do the trick.
pub struct Raft<C: RaftTypeConfig> {
    inner: Arc<RaftInner<C>>,
}

impl<C: RaftTypeConfig> Raft<C> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself within the cluster.
    /// Applications must guarantee that the ID provided to this function is stable, and should be
    /// persisted in a well known location, probably alongside the Raft log and the application's
    /// state machine. This ensures that restarts of the node will yield the same ID every time.
    ///
    /// ### `config`
    /// Raft's runtime config. See the docs on the `Config` object for more details.
    ///
    /// ### `network`
    /// The outbound transport, used for sending RPCs to peer nodes within the cluster.
    ///
    /// ### `storage`
    /// The durable log, the term and vote record, and the snapshots. The node recovers from them
    /// on startup.
    ///
    /// ### `state_machine`
    /// The application state machine. It is moved into a task of its own.
    #[tracing::instrument(level="debug", skip(config, network, storage, state_machine), fields(cluster=%config.cluster_name))]
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<C::Network>,
        storage: Storage<C>,
        state_machine: C::StateMachine,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::<C>::spawn(
            id,
            config,
            network,
            storage,
            state_machine,
            rx_api,
            tx_metrics,
            rx_shutdown,
        );
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
        };
        Self { inner: Arc::new(inner) }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries (§5.3), and are also
    /// used as heartbeats (§5.2).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::AppendEntries { rpc, tx }, rx).await
    }

    /// Submit a VoteRequest (RequestVote in the Raft paper) RPC to this Raft node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state attempting to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::RequestVote { rpc, tx }, rx).await
    }

    /// Submit an InstallSnapshot RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader in order to bring a new node or a slow node up-to-speed
    /// with the leader (§7).
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(snapshot=%rpc.meta.last_log_id))]
    pub async fn install_snapshot(&self, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::InstallSnapshot { rpc, tx }, rx).await
    }

    /// Handle any inbound RPC.
    ///
    /// A transport registers this as the single handler of the RPCs it receives.
    pub async fn handle_rpc(&self, rpc: RaftRpc) -> Result<RaftRpcResponse, RaftError> {
        let resp = match rpc {
            RaftRpc::AppendEntries(rpc) => RaftRpcResponse::AppendEntries(self.append_entries(rpc).await?),
            RaftRpc::RequestVote(rpc) => RaftRpcResponse::RequestVote(self.vote(rpc).await?),
            RaftRpc::InstallSnapshot(rpc) => RaftRpcResponse::InstallSnapshot(self.install_snapshot(rpc).await?),
        };
        Ok(resp)
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This method is based on the Raft metrics system which does a good job at staying
    /// up-to-date. It is perfect for making decisions on where to route client requests.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn current_leader(&self) -> Option<NodeId> {
        self.metrics().borrow().current_leader
    }

    /// Submit a mutating client request to Raft to update the state of the system (§5.1).
    ///
    /// It will be appended to the log, committed to the cluster, and then applied to the
    /// application state machine. The result of applying the request to the state machine will
    /// be returned as the response from this method.
    ///
    /// Our goal for Raft is to implement linearizable semantics. If the leader crashes after committing
    /// a log entry but before responding to the client, the client may retry the command with a new
    /// leader, causing it to be executed a second time. As such, clients should assign unique serial
    /// numbers to every command. Then, the state machine should track the latest serial number
    /// processed for each client, along with the associated response. If it receives a command whose
    /// serial number has already been executed, it responds immediately without reexecuting the
    /// request (§8). The `StateMachine::apply` method is the perfect place to implement this.
    ///
    /// A node which is not the leader answers with `ClientWriteError::ForwardToLeader`.
    #[tracing::instrument(level = "debug", skip(self, data), fields(len=data.len()))]
    pub async fn client_write(&self, data: Vec<u8>) -> Result<ClientWriteResponse<C::Response>, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::ClientWrite { data, tx }, rx).await
    }

    /// Initialize a pristine Raft node with the given config.
    ///
    /// `members` maps the ID of every initial voter, this node included, to its address.
    ///
    /// This command should be called on pristine nodes, where the log index is 0 and the node is
    /// in Follower state. If called on a node which is not in this state, an error is returned.
    /// The node adopts the config in memory; the first leader of the cluster writes it to the
    /// log as its first entry. It is safe to call this on every node of the new cluster.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: BTreeMap<NodeId, String>) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::Initialize { members, tx }, rx).await
    }

    /// Add a voter to the cluster, or promote a non-voter to a voter.
    ///
    /// Resolves once the new config is committed and applied.
    pub async fn add_voter(
        &self,
        id: NodeId,
        addr: impl ToString,
    ) -> Result<ChangeMembershipResponse, ChangeMembershipError> {
        self.change_membership(MembershipChange::AddVoter {
            id,
            addr: addr.to_string(),
        })
        .await
    }

    /// Add a server which receives replication but does not vote.
    pub async fn add_non_voter(
        &self,
        id: NodeId,
        addr: impl ToString,
    ) -> Result<ChangeMembershipResponse, ChangeMembershipError> {
        self.change_membership(MembershipChange::AddNonVoter {
            id,
            addr: addr.to_string(),
        })
        .await
    }

    /// Remove a server from the cluster. It may be this node, the leader.
    pub async fn remove_server(&self, id: NodeId) -> Result<ChangeMembershipResponse, ChangeMembershipError> {
        self.change_membership(MembershipChange::RemoveServer { id }).await
    }

    /// Propose a single-server config change.
    ///
    /// Only one change may be in flight at a time: a change proposed before the previous one is
    /// committed is rejected with `ChangeMembershipError::InProgress`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_membership(
        &self,
        change: MembershipChange,
    ) -> Result<ChangeMembershipResponse, ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        let res = self.call_core(RaftMsg::ChangeMembership { change, tx }, rx).await?;

        tracing::info!(log_id = %res.log_id, membership = %res.membership.summary(), "config change applied");
        Ok(res)
    }

    /// Build a snapshot now, regardless of the snapshot threshold.
    ///
    /// Returns once the request is accepted: the snapshot is built in the background, and shows up
    /// in the `snapshot` field of the metrics when done.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn trigger_snapshot(&self) -> Result<(), RaftError> {
        let (tx, rx) = oneshot::channel();
        self.call_core(RaftMsg::TriggerSnapshot { tx }, rx).await
    }

    /// Invoke RaftCore by sending a RaftMsg and blocks waiting for response.
    #[tracing::instrument(level = "debug", skip(self, mes, rx), fields(mes=%mes.summary()))]
    pub(crate) async fn call_core<T, E>(&self, mes: RaftMsg<C>, rx: RaftRespRx<T, E>) -> Result<T, E>
    where E: From<RaftError> {
        let span = tracing::debug_span!("CH_call_core");

        let sum = mes.summary();

        let send_res = self.inner.tx_api.send((mes, span));
        if let Err(send_err) = send_res {
            tracing::error!(%send_err, mes=%sum, "error send tx to RaftCore");
            return Err(RaftError::ShuttingDown.into());
        }

        match rx.await {
            Ok(x) => x,
            Err(e) => {
                tracing::error!(%e, mes=%sum, "error recv rx from RaftCore");
                Err(RaftError::ShuttingDown.into())
            }
        }
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// # use std::time::Duration;
    /// # use replog::{State, Raft};
    ///
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for raft log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log").await?;
    ///
    /// // wait for raft node's current leader to become 3:
    /// r.wait(None).current_leader(3, "leader").await?;
    ///
    /// // wait for raft state to become a follower
    /// r.wait(None).state(State::Follower, "follower").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node, and wait for it to stop.
    ///
    /// Returns the error the node stopped on, if it stopped on its own because of one.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            handle.await??;
        }
        Ok(())
    }
}

impl<C: RaftTypeConfig> Clone for Raft<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) type RaftRespTx<T, E> = oneshot::Sender<Result<T, E>>;
pub(crate) type RaftRespRx<T, E> = oneshot::Receiver<Result<T, E>>;

pub(crate) type ClientWriteTx<R> = RaftRespTx<ClientWriteResponse<R>, ClientWriteError>;
pub(crate) type ChangeMembershipTx = RaftRespTx<ChangeMembershipResponse, ChangeMembershipError>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg<C: RaftTypeConfig> {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: RaftRespTx<AppendEntriesResponse, RaftError>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: RaftRespTx<VoteResponse, RaftError>,
    },
    InstallSnapshot {
        rpc: InstallSnapshotRequest,
        tx: RaftRespTx<InstallSnapshotResponse, RaftError>,
    },
    ClientWrite {
        data: Vec<u8>,
        tx: ClientWriteTx<C::Response>,
    },
    Initialize {
        members: BTreeMap<NodeId, String>,
        tx: RaftRespTx<(), InitializeError>,
    },
    ChangeMembership {
        change: MembershipChange,
        tx: ChangeMembershipTx,
    },
    TriggerSnapshot {
        tx: RaftRespTx<(), RaftError>,
    },
}

impl<C: RaftTypeConfig> MessageSummary for RaftMsg<C> {
    fn summary(&self) -> String {
        match self {
            RaftMsg::AppendEntries { rpc, .. } => {
                format!("AppendEntries: {}", rpc.summary())
            }
            RaftMsg::RequestVote { rpc, .. } => {
                format!("RequestVote: {}", rpc.summary())
            }
            RaftMsg::InstallSnapshot { rpc, .. } => {
                format!("InstallSnapshot: {}", rpc.summary())
            }
            RaftMsg::ClientWrite { data, .. } => {
                format!("ClientWrite: len: {}", data.len())
            }
            RaftMsg::Initialize { members, .. } => {
                format!("Initialize: {:?}", members)
            }
            RaftMsg::ChangeMembership { change, .. } => {
                format!("ChangeMembership: {:?}", change)
            }
            RaftMsg::TriggerSnapshot { .. } => "TriggerSnapshot".to_string(),
        }
    }
}
