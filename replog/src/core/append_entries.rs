use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::entry::Entry;
use crate::error::RaftResult;
use crate::membership::EffectiveMembership;
use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::LogId;
use crate::LogStore;
use crate::MessageSummary;
use crate::RaftTypeConfig;

impl<C: RaftTypeConfig> RaftCore<C> {
    /// An RPC invoked by the leader to replicate log entries (§5.3); also used as heartbeat (§5.2).
    #[tracing::instrument(level = "debug", skip(self, msg), fields(msg=%msg.summary()))]
    pub(super) async fn handle_append_entries_request(
        &mut self,
        msg: AppendEntriesRequest,
    ) -> RaftResult<AppendEntriesResponse> {
        // If message's term is less than most recent term, then we do not honor the request.
        if msg.term < self.current_term {
            tracing::debug!({self.current_term, rpc_term=msg.term}, "AppendEntries RPC term is less than current term");
            return Ok(AppendEntriesResponse::stale_term(self.current_term));
        }

        // A valid leader of the current term is alive.
        self.arm_election_timer();

        self.update_current_term(msg.term).await?;

        if self.current_leader != Some(msg.leader_id) {
            self.update_current_leader(UpdateCurrentLeader::OtherNode(msg.leader_id));
        }

        if !self.target_state.is_follower() {
            tracing::info!(leader = msg.leader_id, term = msg.term, "a leader of the current term is seen, become follower");
            self.set_target_state(State::Follower);
        }

        let resp = self.append_entries(msg).await?;
        self.report_metrics();
        Ok(resp)
    }

    async fn append_entries(&mut self, msg: AppendEntriesRequest) -> RaftResult<AppendEntriesResponse> {
        let last_index_in_msg = msg.last_index();
        let snapshot_index = self.snapshot_index();

        // Entries at or before the snapshot are committed and match the leader's.
        if msg.prev_log_index > snapshot_index {
            match self.log_term_at(msg.prev_log_index).await? {
                None => {
                    let conflict_index = std::cmp::min(self.last_log_id.index + 1, msg.prev_log_index);
                    tracing::debug!(conflict_index, "log does not reach prev_log_index");
                    return Ok(AppendEntriesResponse::conflict(self.current_term, conflict_index, None));
                }
                Some(term) if term != msg.prev_log_term => {
                    let conflict_index = self.first_index_of_term(term, msg.prev_log_index).await?;
                    tracing::debug!(conflict_index, conflict_term = term, "log conflicts at prev_log_index");
                    return Ok(AppendEntriesResponse::conflict(
                        self.current_term,
                        conflict_index,
                        Some(term),
                    ));
                }
                Some(_) => {}
            }
        }

        let mut entries = msg.entries;
        entries.retain(|e| e.index() > snapshot_index);

        // Skip what is already in the log, and delete the first conflicting entry and everything after it.
        let mut skip = 0;
        for entry in entries.iter() {
            if entry.index() > self.last_log_id.index {
                break;
            }

            match self.log_term_at(entry.index()).await? {
                Some(term) if term == entry.term() => {
                    skip += 1;
                }
                _ => {
                    self.truncate_log_since(entry.index()).await?;
                    break;
                }
            }
        }

        let new_entries = &entries[skip..];
        if !new_entries.is_empty() {
            self.append_log_entries(new_entries).await?;
        }

        // Only entries verified to match the leader's log are committed.
        let commit_index = std::cmp::min(msg.leader_commit, last_index_in_msg);
        if commit_index > self.commit_index {
            tracing::debug!(commit_index, "commit index advanced");
            self.commit_index = commit_index;
            self.on_commit_advanced().await?;
        }

        Ok(AppendEntriesResponse::success(self.current_term))
    }

    /// The term of the local entry at `index`, or `None` if there is no such entry.
    pub(super) async fn log_term_at(&mut self, index: u64) -> RaftResult<Option<u64>> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.last_log_id.index {
            return Ok(Some(self.last_log_id.term));
        }
        if let Some(snapshot) = self.snapshot_last_log_id {
            if snapshot.index == index {
                return Ok(Some(snapshot.term));
            }
        }
        if index > self.last_log_id.index {
            return Ok(None);
        }

        let entry = self.storage.log.get_entry(index).await.map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(entry.map(|x| x.term()))
    }

    /// The first index of the run of entries of `term` which ends at `index`.
    async fn first_index_of_term(&mut self, term: u64, index: u64) -> RaftResult<u64> {
        let mut first = index;
        while first > 1 {
            match self.log_term_at(first - 1).await? {
                Some(t) if t == term => first -= 1,
                _ => break,
            }
        }
        Ok(first)
    }

    /// Delete the entries since `index`, and the config they carry.
    #[tracing::instrument(level = "debug", skip(self))]
    async fn truncate_log_since(&mut self, index: u64) -> RaftResult<()> {
        if index <= self.commit_index {
            let err = anyhow::anyhow!(
                "can not delete committed entries since {}, commit index is {}",
                index,
                self.commit_index
            );
            return Err(self.map_fatal_storage_error(err));
        }

        let prev_term = self.log_term_at(index - 1).await?.unwrap_or_default();

        tracing::info!(index, last_log_id = %self.last_log_id, "delete conflicting entries");

        let last_index = self.last_log_id.index;
        self.storage
            .log
            .delete_range(index, last_index)
            .await
            .map_err(|err| self.map_fatal_storage_error(err))?;

        self.membership.truncate(index);
        self.last_log_id = LogId::new(prev_term, index - 1);
        Ok(())
    }

    /// Append the given entries to the log.
    ///
    /// A config carried by an entry takes effect at once.
    #[tracing::instrument(level = "debug", skip(self, entries), fields(entries=%entries.summary()))]
    async fn append_log_entries(&mut self, entries: &[Entry]) -> RaftResult<()> {
        self.storage.log.append_entries(entries).await.map_err(|err| self.map_fatal_storage_error(err))?;

        for entry in entries.iter() {
            if let Some(m) = entry.membership() {
                tracing::debug!(membership = %m.summary(), index = entry.index(), "config received from leader");
                self.membership.append(EffectiveMembership::new(entry.index(), m.clone()));
            }
        }

        if let Some(last) = entries.last() {
            self.last_log_id = last.log_id;
        }
        Ok(())
    }
}
