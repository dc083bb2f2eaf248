use std::collections::BTreeMap;

use crate::core::client::Responder;
use crate::core::LeaderState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::entry::EntryPayload;
use crate::error::ChangeMembershipError;
use crate::error::ForwardToLeader;
use crate::error::InitializeError;
use crate::error::RaftResult;
use crate::membership::EffectiveMembership;
use crate::membership::Membership;
use crate::membership::MembershipChange;
use crate::membership::MembershipState;
use crate::raft::ChangeMembershipTx;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftTypeConfig;

impl<C: RaftTypeConfig> RaftCore<C> {
    /// Handle the admin `initialize` command.
    ///
    /// The given voters become the config in memory only: the first leader writes it to the log.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_initialize(&mut self, members: BTreeMap<NodeId, String>) -> Result<(), InitializeError> {
        let is_pristine = self.last_log_id.index == 0
            && self.current_term == 0
            && self.membership.effective().membership.is_empty();

        if !is_pristine {
            tracing::error!(
                {last_log_id=%self.last_log_id, self.current_term},
                "rejecting initialize request as this node is not pristine"
            );
            return Err(InitializeError::NotAllowed);
        }

        if !members.contains_key(&self.id) {
            tracing::error!(?members, "rejecting initialize request without this node");
            return Err(InitializeError::NotAllowed);
        }

        let membership = Membership::new_voters(members);
        tracing::info!(membership = %membership.summary(), "initialize");

        self.membership = MembershipState::new_committed(EffectiveMembership::new(0, membership));

        if !self.has_voter_peers() && self.config.enable_single_node {
            self.elect_self().await?;
        }

        self.report_metrics();
        Ok(())
    }

    /// The config committed at `self.membership` may have removed this node.
    ///
    /// `prev_committed` is the config committed before.
    #[tracing::instrument(level = "debug", skip(self, prev_committed))]
    pub(super) async fn check_self_removal(&mut self, prev_committed: &EffectiveMembership) -> RaftResult<()> {
        let committed = &self.membership.committed().membership;
        if committed.is_empty() || committed.contains(&self.id) {
            return Ok(());
        }

        // A joining node commits the configs from before it was added.
        if !prev_committed.membership.contains(&self.id) {
            return Ok(());
        }

        tracing::info!(membership = %committed.summary(), "this node is removed from the cluster");

        if self.config.shutdown_on_remove {
            self.set_target_state(State::Shutdown);
            return Ok(());
        }

        // Go on alone, as the only voter of a cluster nobody else knows about.
        let addr = prev_committed.membership.get(&self.id).map(|x| x.addr.clone()).unwrap_or_default();
        self.membership =
            MembershipState::new_committed(EffectiveMembership::new(0, Membership::new_voters([(self.id, addr)])));
        self.update_current_leader(UpdateCurrentLeader::Unknown);

        if self.config.enable_single_node {
            self.elect_self().await?;
        } else {
            self.set_target_state(State::Follower);
        }

        self.report_metrics();
        Ok(())
    }
}

impl<'a, C: RaftTypeConfig> LeaderState<'a, C> {
    /// Propose a config change. See §6.
    ///
    /// The caller is answered once the new config entry is committed and applied.
    #[tracing::instrument(level = "debug", skip(self, tx))]
    pub(super) async fn change_membership(&mut self, change: MembershipChange, tx: ChangeMembershipTx) -> RaftResult<()> {
        if self.is_stepping_down {
            let _ = tx.send(Err(ForwardToLeader::default().into()));
            return Ok(());
        }

        // Only one change at a time; and not before this leader knows which config is committed.
        let membership = &self.core.membership;
        if membership.is_pending() || self.core.commit_index < self.tracker.start_index() {
            let _ = tx.send(Err(ChangeMembershipError::InProgress {
                committed: membership.committed().log_index,
                pending: membership.effective().log_index,
            }));
            return Ok(());
        }

        let new_membership = match membership.effective().membership.apply_change(&change) {
            Ok(x) => x,
            Err(err) => {
                tracing::info!(error = %err, "reject config change");
                let _ = tx.send(Err(err));
                return Ok(());
            }
        };

        if !new_membership.contains(&self.core.id) {
            tracing::info!("this leader is removed by the config change, stop accepting writes");
            self.is_stepping_down = true;
        }

        let entry = self.append_payload_to_log(EntryPayload::Membership(new_membership)).await?;
        self.awaiting_committed.insert(entry.index(), Responder::Membership(tx));

        self.replicate().await
    }
}
