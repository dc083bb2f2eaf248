//! Fixtures for testing Raft.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Once;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use memstore::ClientRequest;
use memstore::ClientResponse;
use memstore::MemLogStore;
use memstore::MemSnapshotStore;
use memstore::MemStableStore;
use memstore::MemStateMachine;
use replog::async_trait::async_trait;
use replog::metrics::Wait;
use replog::raft::ClientWriteResponse;
use replog::raft::RaftRpc;
use replog::raft::RaftRpcResponse;
use replog::ClientWriteError;
use replog::Config;
use replog::Entry;
use replog::LogStore;
use replog::NodeId;
use replog::Raft;
use replog::RaftMetrics;
use replog::RaftNetwork;
use replog::RaftTypeConfig;
use replog::State;
use replog::Storage;

/// The collaborator types of a node under test.
pub struct MemConfig;

impl RaftTypeConfig for MemConfig {
    type Response = ClientResponse;
    type Network = RaftRouter;
    type LogStore = MemLogStore;
    type StableStore = MemStableStore;
    type SnapshotStore = MemSnapshotStore;
    type StateMachine = MemStateMachine;
}

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<MemConfig>;

pub fn init_tracing() {
    static START: Once = Once::new();

    START.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .with_ansi(false)
            .init();
    });
}

pub fn timeout() -> Option<Duration> {
    Some(Duration::from_millis(5000))
}

pub fn addr(id: NodeId) -> String {
    format!("node-{}", id)
}

/// A config with timing suitable for tests, with the given overrides applied.
pub fn test_config(args: &[&str]) -> Result<Arc<Config>> {
    let mut all = vec!["test", "--election-timeout=150", "--heartbeat-interval=30", "--commit-timeout=5"];
    all.extend_from_slice(args);
    Ok(Arc::new(Config::build(&all)?))
}

/// A node registered with the router.
struct NodeHandle {
    raft: MemRaft,
    storage: Storage<MemConfig>,
    sm: MemStateMachine,
}

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
#[derive(Clone)]
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: Arc<Mutex<BTreeMap<NodeId, NodeHandle>>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: Arc<Mutex<HashSet<NodeId>>>,
    /// The number of RPCs delivered, by sender and RPC kind.
    rpc_count: Arc<Mutex<BTreeMap<(NodeId, &'static str), u64>>>,
}

impl RaftRouter {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
            rpc_count: Default::default(),
        }
    }

    pub fn new_storage() -> Storage<MemConfig> {
        Storage::new(
            Arc::new(MemLogStore::new()),
            Arc::new(MemStableStore::new()),
            Arc::new(MemSnapshotStore::default()),
        )
    }

    /// Create and register a new Raft node bearing the given ID.
    pub fn new_raft_node(&self, id: NodeId) {
        self.new_raft_node_with_storage(id, Self::new_storage())
    }

    /// Create a Raft node on existing storage, as a restarted process would.
    ///
    /// The state machine is always new: it is rebuilt from the snapshot and the log.
    #[tracing::instrument(level = "debug", skip(self, storage))]
    pub fn new_raft_node_with_storage(&self, id: NodeId, storage: Storage<MemConfig>) {
        self.new_raft_node_with_config(id, storage, self.config.clone())
    }

    /// Create a Raft node on existing storage, running with its own config.
    #[tracing::instrument(level = "debug", skip(self, storage, config))]
    pub fn new_raft_node_with_config(&self, id: NodeId, storage: Storage<MemConfig>, config: Arc<Config>) {
        let sm = MemStateMachine::new();
        let raft = Raft::new(id, config, Arc::new(self.clone()), storage.clone(), sm.clone());
        let mut rt = self.routing_table.lock().unwrap();
        rt.insert(id, NodeHandle { raft, storage, sm });
    }

    /// Remove the target node from the routing table & isolation.
    ///
    /// Returns the Raft handle and its storage.
    pub fn remove_node(&self, id: NodeId) -> Option<(MemRaft, Storage<MemConfig>)> {
        let node = {
            let mut rt = self.routing_table.lock().unwrap();
            rt.remove(&id)
        };

        self.isolated_nodes.lock().unwrap().remove(&id);

        node.map(|n| (n.raft, n.storage))
    }

    /// Shut a node down and start it again on the same storage, with `config` if given.
    pub async fn restart_node(&self, id: NodeId, config: Option<Arc<Config>>) -> Result<()> {
        let (raft, storage) = self.remove_node(id).ok_or_else(|| anyhow!("node {} not found", id))?;
        raft.shutdown().await?;

        let config = config.unwrap_or_else(|| self.config.clone());
        self.new_raft_node_with_config(id, storage, config);
        Ok(())
    }

    /// Create a cluster of `voters` led by node 0, then add `non_voters`.
    ///
    /// Only node 0 is initialized, so it is the only one to campaign. Returns the index of the
    /// last log entry.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn new_cluster(&self, voters: BTreeSet<NodeId>, non_voters: BTreeSet<NodeId>) -> Result<u64> {
        assert!(voters.contains(&0));

        for id in voters.iter() {
            self.new_raft_node(*id);
        }

        tracing::info!("--- initializing cluster of {:?}", voters);
        self.initialize_with(0, voters.clone()).await?;

        // log 1: the initial config written by the first leader
        let mut log_index = 1;

        self.wait(&0, timeout())?.state(State::Leader, "node 0 becomes leader").await?;
        self.wait_for_log(&voters, log_index, timeout(), "initial config").await?;

        for id in non_voters.iter() {
            tracing::info!("--- add non-voter: {}", id);
            self.new_raft_node(*id);
            self.get_raft_handle(&0)?.add_non_voter(*id, addr(*id)).await?;
            log_index += 1;
        }

        let all = voters.union(&non_voters).copied().collect::<BTreeSet<_>>();
        self.wait_for_log(&all, log_index, timeout(), "cluster is ready").await?;

        Ok(log_index)
    }

    /// Initialize a node with the given voters.
    pub async fn initialize_with(&self, node_id: NodeId, members: BTreeSet<NodeId>) -> Result<()> {
        tracing::info!({ node_id }, "initializing cluster");
        let members = members.into_iter().map(|id| (id, addr(id))).collect::<BTreeMap<_, _>>();
        self.get_raft_handle(&node_id)?.initialize(members).await?;
        Ok(())
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.lock().unwrap().insert(id);
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn restore_node(&self, id: NodeId) {
        self.isolated_nodes.lock().unwrap().remove(&id);
    }

    pub fn get_raft_handle(&self, node_id: &NodeId) -> Result<MemRaft> {
        let rt = self.routing_table.lock().unwrap();
        let node = rt.get(node_id).ok_or_else(|| anyhow!("node {} not found", node_id))?;
        Ok(node.raft.clone())
    }

    pub fn get_storage_handle(&self, node_id: &NodeId) -> Result<Storage<MemConfig>> {
        let rt = self.routing_table.lock().unwrap();
        let node = rt.get(node_id).ok_or_else(|| anyhow!("node {} not found", node_id))?;
        Ok(node.storage.clone())
    }

    pub fn get_state_machine(&self, node_id: &NodeId) -> Result<MemStateMachine> {
        let rt = self.routing_table.lock().unwrap();
        let node = rt.get(node_id).ok_or_else(|| anyhow!("node {} not found", node_id))?;
        Ok(node.sm.clone())
    }

    /// All entries in the log of a node.
    pub async fn get_logs(&self, node_id: &NodeId) -> Result<Vec<Entry>> {
        let storage = self.get_storage_handle(node_id)?;
        storage.log.entries().await
    }

    pub async fn first_log_index(&self, node_id: &NodeId) -> Result<u64> {
        let storage = self.get_storage_handle(node_id)?;
        storage.log.first_index().await
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.lock().unwrap();
        rt.values().map(|node| node.raft.metrics().borrow().clone()).collect()
    }

    pub fn get_metrics(&self, node_id: &NodeId) -> Result<RaftMetrics> {
        let node = self.get_raft_handle(node_id)?;
        let metrics = node.metrics().borrow().clone();
        Ok(metrics)
    }

    pub fn wait(&self, node_id: &NodeId, timeout: Option<Duration>) -> Result<Wait> {
        let node = self.get_raft_handle(node_id)?;
        Ok(node.wait(timeout))
    }

    /// Wait for specified nodes until they applied upto `want_log`(inclusive) logs.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn wait_for_log(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_log: u64,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout)?.log(want_log, msg).await?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their state becomes `want_state`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn wait_for_state(
        &self,
        node_ids: &BTreeSet<NodeId>,
        want_state: State,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout)?.state(want_state, msg).await?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their membership becomes `members`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn wait_for_members(
        &self,
        node_ids: &BTreeSet<NodeId>,
        members: BTreeSet<NodeId>,
        timeout: Option<Duration>,
        msg: &str,
    ) -> Result<()> {
        for id in node_ids.iter() {
            self.wait(id, timeout)?.members(members.clone(), msg).await?;
        }
        Ok(())
    }

    /// Get the ID of the current leader.
    pub fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.lock().unwrap().clone();
        self.latest_metrics().into_iter().find_map(|node| {
            if node.current_leader == Some(node.id) && !isolated.contains(&node.id) {
                Some(node.id)
            } else {
                None
            }
        })
    }

    /// Send a client request to the target node.
    pub async fn client_request(
        &self,
        target: NodeId,
        client_id: &str,
        serial: u64,
    ) -> std::result::Result<ClientWriteResponse<ClientResponse>, ClientWriteError> {
        let node = self.get_raft_handle(&target).map_err(|_| replog::RaftError::ShuttingDown)?;
        let req = ClientRequest::make_request(client_id, serial);
        node.client_write(req.to_bytes()).await
    }

    /// Send multiple client requests to the target node, panicking on any failure.
    pub async fn client_request_many(&self, target: NodeId, client_id: &str, count: usize) {
        for serial in 0..count {
            if let Err(err) = self.client_request(target, client_id, serial as u64).await {
                panic!("client request {} to {} failed: {}", serial, target, err);
            }
        }
    }

    /// The number of RPCs of `kind` sent by `sender`.
    pub fn rpc_count(&self, sender: NodeId, kind: &'static str) -> u64 {
        let counts = self.rpc_count.lock().unwrap();
        counts.get(&(sender, kind)).copied().unwrap_or_default()
    }

    /// Assert that the cluster has an elected leader, and is in a stable state with all nodes uniform.
    ///
    /// If `expected_term` is `Some`, then all nodes will be tested to ensure that they are in the
    /// given term. Else, the leader's current term will be used for the assertion.
    ///
    /// If `expected_last_log` is `Some`, then all nodes will be tested to ensure that their last
    /// log index and last applied log match the given value. Else, the leader's last_log_index
    /// will be used for the assertion.
    pub fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.lock().unwrap().clone();
        let nodes = self.latest_metrics();

        let non_isolated_nodes: Vec<_> = nodes.iter().filter(|node| !isolated.contains(&node.id)).collect();
        let leader = nodes
            .iter()
            .filter(|node| !isolated.contains(&node.id))
            .find(|node| node.state == State::Leader)
            .expect("expected to find a cluster leader");
        let followers: Vec<_> = nodes
            .iter()
            .filter(|node| !isolated.contains(&node.id))
            .filter(|node| node.state == State::Follower)
            .collect();

        assert_eq!(
            followers.len() + 1,
            non_isolated_nodes.len(),
            "expected all nodes to be followers with one leader, got 1 leader and {} followers, expected {} followers",
            followers.len(),
            non_isolated_nodes.len() - 1,
        );
        let expected_term = match expected_term {
            Some(term) => term,
            None => leader.current_term,
        };
        let expected_last_log = match expected_last_log {
            Some(idx) => idx,
            None => leader.last_log_index,
        };

        for node in non_isolated_nodes.iter() {
            assert_eq!(
                node.current_leader,
                Some(leader.id),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader.id
            );
            assert_eq!(
                node.current_term, expected_term,
                "node {} has term {}, expected {}",
                node.id, node.current_term, expected_term
            );
            assert_eq!(
                node.last_log_index, expected_last_log,
                "node {} has last_log_index {}, expected {}",
                node.id, node.last_log_index, expected_last_log
            );
            assert_eq!(
                node.last_applied, expected_last_log,
                "node {} has last_applied {}, expected {}",
                node.id, node.last_applied, expected_last_log
            );
        }
    }

    fn check_reachable(&self, id: NodeId, target: NodeId) -> Result<()> {
        let isolated = self.isolated_nodes.lock().unwrap();
        if isolated.contains(&target) || isolated.contains(&id) {
            return Err(anyhow!("isolated: {} -> {}", id, target));
        }
        Ok(())
    }
}

#[async_trait]
impl RaftNetwork for RaftRouter {
    async fn send(&self, target: NodeId, addr: &str, rpc: RaftRpc) -> Result<RaftRpcResponse> {
        let sender = rpc.sender();
        self.check_reachable(sender, target)?;

        if addr != self::addr(target) {
            return Err(anyhow!("node {} is not at {}", target, addr));
        }

        let kind = match &rpc {
            RaftRpc::AppendEntries(_) => "AppendEntries",
            RaftRpc::RequestVote(_) => "RequestVote",
            RaftRpc::InstallSnapshot(_) => "InstallSnapshot",
        };
        *self.rpc_count.lock().unwrap().entry((sender, kind)).or_default() += 1;

        let node = self.get_raft_handle(&target)?;
        let resp = node.handle_rpc(rpc).await?;
        Ok(resp)
    }
}
