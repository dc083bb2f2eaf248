//! The Raft network interface.

use anyhow::anyhow;
use anyhow::Result;
use async_trait::async_trait;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::RaftRpc;
use crate::raft::RaftRpcResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::NodeId;

/// A trait defining the interface for a Raft network between cluster members.
///
/// A transport only has to deliver an RPC to the node at `addr` and hand back its response. On the
/// receiving side it passes the RPC to `Raft::handle_rpc`.
///
/// A failed send is never fatal: a replication stream retries on its next heartbeat and a
/// candidate on its next election.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send an RPC to the target Raft node.
    async fn send(&self, target: NodeId, addr: &str, rpc: RaftRpc) -> Result<RaftRpcResponse>;

    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn append_entries(&self, target: NodeId, addr: &str, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        match self.send(target, addr, RaftRpc::AppendEntries(rpc)).await? {
            RaftRpcResponse::AppendEntries(resp) => Ok(resp),
            other => Err(anyhow!("unexpected response to AppendEntries from {}: {:?}", target, other)),
        }
    }

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn install_snapshot(
        &self,
        target: NodeId,
        addr: &str,
        rpc: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        match self.send(target, addr, RaftRpc::InstallSnapshot(rpc)).await? {
            RaftRpcResponse::InstallSnapshot(resp) => Ok(resp),
            other => Err(anyhow!("unexpected response to InstallSnapshot from {}: {:?}", target, other)),
        }
    }

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn vote(&self, target: NodeId, addr: &str, rpc: VoteRequest) -> Result<VoteResponse> {
        match self.send(target, addr, RaftRpc::RequestVote(rpc)).await? {
            RaftRpcResponse::RequestVote(resp) => Ok(resp),
            other => Err(anyhow!("unexpected response to RequestVote from {}: {:?}", target, other)),
        }
    }
}
