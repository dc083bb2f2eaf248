use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::Notify;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::RaftTypeConfig;

impl<C: RaftTypeConfig> RaftCore<C> {
    /// An RPC invoked by candidates to gather votes (§5.2).
    #[tracing::instrument(level = "debug", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_vote_request(&mut self, msg: VoteRequest) -> RaftResult<VoteResponse> {
        // If candidate's current term is less than this nodes current term, reject.
        if msg.term < self.current_term {
            tracing::debug!({candidate=msg.candidate_id, self.current_term, rpc_term=msg.term}, "RequestVote RPC term is less than current term");
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // A greater term makes this node a follower of that term, before the vote is considered.
        if msg.term > self.current_term {
            self.step_down(msg.term, UpdateCurrentLeader::Unknown).await?;
            self.arm_election_timer();
            self.report_metrics();
        }

        // Check if candidate's log is at least as up-to-date as this node's.
        // If candidate's log is not at least as up-to-date as this node, then reject.
        if msg.last_log_id() < self.last_log_id {
            tracing::debug!(
                {candidate=msg.candidate_id, last_log_id=%self.last_log_id, candidate_last_log_id=%msg.last_log_id()},
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        match &self.voted_for {
            // This node has already voted for the candidate.
            Some(candidate_id) if candidate_id == &msg.candidate_id => {}
            // This node has already voted for a different candidate.
            Some(_) => {
                return Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                });
            }
            None => {
                self.save_vote(msg.candidate_id).await?;
                tracing::info!({candidate=msg.candidate_id, term=msg.term}, "voted for candidate");
            }
        }

        // Granting a vote defers this node's own candidacy.
        self.arm_election_timer();
        if !self.target_state.is_follower() {
            self.set_target_state(State::Follower);
        }
        self.report_metrics();

        Ok(VoteResponse {
            term: self.current_term,
            vote_granted: true,
        })
    }
}

impl<'a, C: RaftTypeConfig> CandidateState<'a, C> {
    /// Handle response from a vote request sent to a peer in `term`.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn handle_vote_response(&mut self, target: NodeId, term: u64, res: VoteResponse) -> RaftResult<()> {
        // If peer's term is greater than current term, revert to follower state.
        if res.term > self.core.current_term {
            tracing::info!(target, term = res.term, "reverting to follower state due to greater term observed in RequestVote RPC response");
            self.core.step_down(res.term, UpdateCurrentLeader::Unknown).await?;
            self.core.report_metrics();
            return Ok(());
        }

        if term != self.core.current_term {
            tracing::debug!(target, term, "ignore vote response of a former election");
            return Ok(());
        }

        if res.vote_granted {
            self.granted.insert(target);

            if self.core.membership.is_quorum(&self.granted) {
                tracing::info!(granted = ?self.granted, "transitioning to leader state as a quorum of votes have been received");
                self.core.set_target_state(State::Leader);
            }
        }

        // Otherwise, we just return and let the candidate loop wait for more votes to come in.
        Ok(())
    }

    /// Spawn parallel vote requests to all voters of every relevant config.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) {
        let term = self.core.current_term;
        let rpc = VoteRequest::new(term, self.core.id, self.core.last_log_id.index, self.core.last_log_id.term);

        for target in self.core.membership.voter_ids() {
            if target == self.core.id {
                continue;
            }

            let addr = self.core.membership.addr_of(&target).unwrap_or_default().to_string();
            let (network, tx, rpc) = (self.core.network.clone(), self.core.tx_notify.clone(), rpc.clone());

            tokio::spawn(
                async move {
                    match network.vote(target, &addr, rpc).await {
                        Ok(resp) => {
                            let _ = tx.send(Notify::VoteResponse { target, term, resp });
                        }
                        Err(err) => tracing::warn!({error=%err, target}, "error while requesting vote from peer"),
                    }
                }
                .instrument(tracing::debug_span!("requesting vote from peer", target)),
            );
        }
    }
}
