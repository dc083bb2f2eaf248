use crate::core::LeaderState;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftTypeConfig;

impl<'a, C: RaftTypeConfig> LeaderState<'a, C> {
    /// Handle a replication event coming from one of the replication streams.
    #[tracing::instrument(level = "debug", skip(self, event), fields(event=%event.summary()))]
    pub(super) async fn handle_replica_event(&mut self, event: ReplicaEvent) -> RaftResult<()> {
        match event {
            ReplicaEvent::UpdateMatchIndex { target, term, matched } => {
                if term != self.core.current_term {
                    tracing::debug!(term, current_term = self.core.current_term, "ignore event of a former term");
                    return Ok(());
                }
                self.handle_update_match_index(target, matched).await
            }
            ReplicaEvent::RevertToFollower { target, term } => self.handle_revert_to_follower(target, term).await,
        }
    }

    /// Handle events from replication streams for when this node needs to revert to follower state.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_revert_to_follower(&mut self, target: NodeId, term: u64) -> RaftResult<()> {
        if term > self.core.current_term {
            tracing::info!(target, term, "a greater term is seen, step down");
            self.core.step_down(term, UpdateCurrentLeader::Unknown).await?;
            self.core.report_metrics();
        }
        Ok(())
    }

    /// Handle events from a replication stream which updates the target node's match index.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_update_match_index(&mut self, target: NodeId, matched: u64) -> RaftResult<()> {
        let needs_removal = match self.nodes.get(&target) {
            Some(node) => matches!(node.remove_after_commit, Some(idx) if matched >= idx),
            None => return Ok(()),
        };

        self.tracker.update_matched(target, matched);

        if needs_removal {
            self.remove_replication(target);
        }

        self.try_commit().await
    }

    /// Stop replicating to a node.
    pub(super) fn remove_replication(&mut self, target: NodeId) {
        tracing::info!(target, "stop replication");
        if let Some(node) = self.nodes.remove(&target) {
            node.stream.send(RaftEvent::Terminate);
        }
        self.tracker.remove(&target);
    }

    /// Advance the commit index if the match indexes allow it, and act on what became committed.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn try_commit(&mut self) -> RaftResult<()> {
        let commit_index = match self.tracker.new_commit_index(&self.core.membership, self.core.commit_index) {
            Some(x) => x,
            None => return Ok(()),
        };

        tracing::debug!(commit_index, "commit index advanced");
        self.core.commit_index = commit_index;

        for node in self.nodes.values() {
            node.stream.send(RaftEvent::UpdateCommitIndex { commit_index });
        }

        // Hand the committed entries, and the requests waiting for them, to the state machine.
        let rest = self.awaiting_committed.split_off(&(commit_index + 1));
        let ready = std::mem::replace(&mut self.awaiting_committed, rest);
        self.core.apply_committed(ready.into_iter().collect())?;

        let prev_committed = self.core.membership.committed().clone();
        if self.core.membership.commit(commit_index) {
            self.handle_membership_committed().await?;
            self.core.check_self_removal(&prev_committed).await?;
        }

        self.core.report_metrics();
        Ok(())
    }

    /// A config change is committed: stop replicating to the nodes it removed.
    ///
    /// A removed node which has not yet received the config is replicated to until it does, so
    /// that it learns about its removal.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn handle_membership_committed(&mut self) -> RaftResult<()> {
        let committed = self.core.membership.committed().clone();
        tracing::info!(membership = %committed.summary(), "config committed");

        let removed = self
            .nodes
            .keys()
            .filter(|id| !committed.membership.contains(id))
            .copied()
            .collect::<Vec<_>>();

        for target in removed {
            if self.tracker.matched(&target) >= committed.log_index {
                self.remove_replication(target);
            } else if let Some(node) = self.nodes.get_mut(&target) {
                tracing::debug!(target, "remove replication once it receives the config");
                node.remove_after_commit = Some(committed.log_index);
            }
        }

        Ok(())
    }
}
