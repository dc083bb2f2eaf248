use crate::core::RaftCore;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::storage::SnapshotMeta;
use crate::LogStore;
use crate::MessageSummary;
use crate::RaftTypeConfig;

impl<C: RaftTypeConfig> RaftCore<C> {
    /// The snapshot check timer expired: re-arm it and build a snapshot if the log grew enough.
    #[tracing::instrument(level = "trace", skip(self))]
    pub(super) fn handle_snapshot_check(&mut self) -> RaftResult<()> {
        self.arm_snapshot_timer();

        let outstanding = self.last_applied.index.saturating_sub(self.snapshot_index());
        if outstanding < self.config.snapshot_threshold {
            return Ok(());
        }

        tracing::debug!(outstanding, threshold = self.config.snapshot_threshold, "log reached snapshot threshold");
        self.build_snapshot()
    }

    /// Build a snapshot now, regardless of the threshold.
    ///
    /// Does nothing if a snapshot is being built, or nothing was applied since the last one.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn trigger_snapshot(&mut self) -> Result<(), RaftError> {
        if self.last_applied.index <= self.snapshot_index() {
            tracing::debug!(last_applied = %self.last_applied, "nothing new to snapshot");
            return Ok(());
        }
        self.build_snapshot()
    }

    fn build_snapshot(&mut self) -> RaftResult<()> {
        if self.snapshot_in_progress {
            return Ok(());
        }

        tracing::info!(last_applied = %self.last_applied, "start building snapshot");

        let res = self.sm.build_snapshot();
        res.map_err(|err| self.map_fatal_storage_error(err))?;
        self.snapshot_in_progress = true;
        Ok(())
    }

    /// A snapshot is built: compact the log it covers, keeping `trailing_logs` entries before it.
    #[tracing::instrument(level = "debug", skip(self, meta), fields(meta=%meta.summary()))]
    pub(super) async fn handle_snapshot_built(&mut self, meta: Option<SnapshotMeta>) -> RaftResult<()> {
        self.snapshot_in_progress = false;

        let meta = match meta {
            Some(x) => x,
            None => return Ok(()),
        };

        // A snapshot installed from the leader in the meantime may be newer.
        if self.snapshot_last_log_id.map(|x| x >= meta.last_log_id).unwrap_or(false) {
            return Ok(());
        }

        self.snapshot_last_log_id = Some(meta.last_log_id);
        self.compact_log(meta.last_log_id.index).await?;

        self.report_metrics();
        Ok(())
    }

    async fn compact_log(&mut self, snapshot_index: u64) -> RaftResult<()> {
        let first = self.storage.log.first_index().await.map_err(|err| self.map_fatal_storage_error(err))?;
        if first == 0 {
            return Ok(());
        }

        let upto = std::cmp::min(snapshot_index, self.last_log_id.index);
        let max = match upto.checked_sub(self.config.trailing_logs) {
            Some(x) if x >= first => x,
            _ => return Ok(()),
        };

        tracing::info!(first, max, "compact log");

        self.storage.log.delete_range(first, max).await.map_err(|err| self.map_fatal_storage_error(err))?;
        Ok(())
    }
}
