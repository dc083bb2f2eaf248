use crate::core::LeaderState;
use crate::entry::Entry;
use crate::entry::EntryPayload;
use crate::error::ForwardToLeader;
use crate::error::InitializeError;
use crate::error::RaftResult;
use crate::membership::EffectiveMembership;
use crate::raft::ChangeMembershipResponse;
use crate::raft::ChangeMembershipTx;
use crate::raft::ClientWriteResponse;
use crate::raft::ClientWriteTx;
use crate::raft::RaftMsg;
use crate::replication::RaftEvent;
use crate::AppDataResponse;
use crate::LogId;
use crate::LogStore;
use crate::MessageSummary;
use crate::RaftTypeConfig;

/// The channel to answer a request through, once its entry is committed and applied.
pub(crate) enum Responder<R: AppDataResponse> {
    Client(ClientWriteTx<R>),
    Membership(ChangeMembershipTx),
}

impl<R: AppDataResponse> Responder<R> {
    /// Answer with the outcome of applying the entry at `log_id`.
    ///
    /// `data` is what the state machine returned for a command entry. `membership` is the config
    /// in effect on the state machine after the entry.
    pub(crate) fn applied(self, log_id: LogId, data: Option<R>, membership: &EffectiveMembership) {
        match self {
            Responder::Client(tx) => match data {
                Some(data) => {
                    let _ = tx.send(Ok(ClientWriteResponse { log_id, data }));
                }
                None => {
                    tracing::error!(%log_id, "a client write is answered by an entry which is not a command");
                }
            },
            Responder::Membership(tx) => {
                let _ = tx.send(Ok(ChangeMembershipResponse {
                    log_id,
                    membership: membership.membership.clone(),
                }));
            }
        }
    }

    /// This node is no longer the leader and will not answer.
    pub(crate) fn forward(self, forward: ForwardToLeader) {
        match self {
            Responder::Client(tx) => {
                let _ = tx.send(Err(forward.into()));
            }
            Responder::Membership(tx) => {
                let _ = tx.send(Err(forward.into()));
            }
        }
    }
}

impl<'a, C: RaftTypeConfig> LeaderState<'a, C> {
    /// Handle an API message on the leader.
    #[tracing::instrument(level = "debug", skip(self, msg), fields(id=self.core.id))]
    pub(super) async fn handle_msg(&mut self, msg: RaftMsg<C>) -> RaftResult<()> {
        tracing::debug!("leader recv from rx_api: {}", msg.summary());

        match msg {
            RaftMsg::AppendEntries { rpc, tx } => {
                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
            }
            RaftMsg::RequestVote { rpc, tx } => {
                let _ = tx.send(self.core.handle_vote_request(rpc).await);
            }
            RaftMsg::InstallSnapshot { rpc, tx } => {
                let _ = tx.send(self.core.handle_install_snapshot_request(rpc).await);
            }
            RaftMsg::ClientWrite { data, tx } => {
                self.handle_client_write(data, tx).await?;
            }
            RaftMsg::Initialize { tx, .. } => {
                let _ = tx.send(Err(InitializeError::NotAllowed));
            }
            RaftMsg::ChangeMembership { change, tx } => {
                self.change_membership(change, tx).await?;
            }
            RaftMsg::TriggerSnapshot { tx } => {
                let _ = tx.send(self.core.trigger_snapshot());
            }
        }
        Ok(())
    }

    /// Commit the initial entry which new leaders are obligated to create when first coming to power, per §8.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn commit_initial_leader_entry(&mut self) -> RaftResult<()> {
        // A config which was never written to the log is committed as the first entry of the
        // cluster, else a blank entry is enough.
        let effective = self.core.membership.effective();
        let payload = if effective.log_index == 0 {
            EntryPayload::Membership(effective.membership.clone())
        } else {
            EntryPayload::Blank
        };

        self.append_payload_to_log(payload).await?;
        self.replicate().await
    }

    /// Handle a client write: append it and start replicating it.
    #[tracing::instrument(level = "debug", skip(self, data, tx), fields(len=data.len()))]
    pub(super) async fn handle_client_write(
        &mut self,
        data: Vec<u8>,
        tx: ClientWriteTx<C::Response>,
    ) -> RaftResult<()> {
        if self.is_stepping_down {
            let _ = tx.send(Err(ForwardToLeader::default().into()));
            return Ok(());
        }

        let entry = self.append_payload_to_log(EntryPayload::Normal(data)).await?;
        self.awaiting_committed.insert(entry.index(), Responder::Client(tx));
        self.replicate().await
    }

    /// Transform the given payload into an entry, assign an index and term, and append the entry to the log.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub(super) async fn append_payload_to_log(&mut self, payload: EntryPayload) -> RaftResult<Entry> {
        let log_id = LogId::new(self.core.current_term, self.core.last_log_id.index + 1);
        let entry = Entry { log_id, payload };

        self.core
            .storage
            .log
            .append_entries(std::slice::from_ref(&entry))
            .await
            .map_err(|err| self.core.map_fatal_storage_error(err))?;

        self.core.last_log_id = log_id;
        self.tracker.update_matched(self.core.id, log_id.index);

        if let Some(m) = entry.membership() {
            self.core.membership.append(EffectiveMembership::new(log_id.index, m.clone()));
            self.update_replication_targets();
        }

        self.core.report_metrics();
        Ok(entry)
    }

    /// Tell every replication stream about the new last log, then see whether anything can be committed.
    ///
    /// The answers to requests are sent once their entries are committed and applied.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) async fn replicate(&mut self) -> RaftResult<()> {
        for node in self.nodes.values() {
            node.stream.send(RaftEvent::Replicate {
                last_log_index: self.core.last_log_id.index,
                commit_index: self.core.commit_index,
            });
        }

        self.try_commit().await
    }
}
