use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::membership::MembershipState;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::LogStore;
use crate::MessageSummary;
use crate::RaftTypeConfig;

impl<C: RaftTypeConfig> RaftCore<C> {
    /// Invoked by leader to send a snapshot to a follower (§7).
    ///
    /// The snapshot replaces the state machine and the whole log, unless this node has already
    /// committed what it covers.
    #[tracing::instrument(level = "debug", skip(self, req), fields(req=%req.summary()))]
    pub(super) async fn handle_install_snapshot_request(
        &mut self,
        req: InstallSnapshotRequest,
    ) -> RaftResult<InstallSnapshotResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if req.term < self.current_term {
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                success: false,
            });
        }

        self.arm_election_timer();

        self.update_current_term(req.term).await?;

        if self.current_leader != Some(req.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(req.leader_id));
        }

        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }

        let snapshot_last = req.meta.last_log_id;

        if snapshot_last.index <= self.commit_index {
            tracing::info!(
                snapshot = %snapshot_last,
                commit_index = self.commit_index,
                "snapshot is already covered by committed entries, skip"
            );
            self.report_metrics();
            return Ok(InstallSnapshotResponse {
                term: self.current_term,
                success: true,
            });
        }

        tracing::info!(meta = %req.meta.summary(), "install snapshot");

        let membership = req.meta.membership.clone();

        // Persisted and restored into the state machine after every entry queued for it has been applied.
        let res = self.sm.install(req.meta, req.data, true).await;
        res.map_err(|err| self.map_fatal_storage_error(err))?;

        self.delete_whole_log().await?;

        self.last_log_id = snapshot_last;
        self.snapshot_last_log_id = Some(snapshot_last);
        self.commit_index = snapshot_last.index;
        self.apply_requested = snapshot_last.index;
        self.last_applied = snapshot_last;

        let prev_committed = self.membership.committed().clone();
        self.membership = MembershipState::new_committed(membership);
        self.check_self_removal(&prev_committed).await?;

        self.report_metrics();

        Ok(InstallSnapshotResponse {
            term: self.current_term,
            success: true,
        })
    }

    async fn delete_whole_log(&mut self) -> RaftResult<()> {
        let first = self.storage.log.first_index().await.map_err(|err| self.map_fatal_storage_error(err))?;
        let last = self.storage.log.last_index().await.map_err(|err| self.map_fatal_storage_error(err))?;

        if first == 0 || last < first {
            return Ok(());
        }

        self.storage.log.delete_range(first, last).await.map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(())
    }
}
