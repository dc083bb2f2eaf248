use std::sync::Arc;

use anyhow::Result;
use pretty_assertions::assert_eq;
use replog::raft::AppendEntriesRequest;
use replog::raft::AppendEntriesResponse;
use replog::Entry;
use replog::LogId;

use crate::fixtures;
use crate::fixtures::test_config;
use crate::fixtures::timeout;
use crate::fixtures::RaftRouter;

fn blank(term: u64, index: u64) -> Entry {
    Entry::new_blank(LogId::new(term, index))
}

fn req(term: u64, leader_id: u64, prev: (u64, u64), entries: Vec<Entry>, leader_commit: u64) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term,
        leader_id,
        prev_log_term: prev.0,
        prev_log_index: prev.1,
        entries,
        leader_commit,
    }
}

/// AppendEntries sent straight to a node.
///
/// - A stale term is rejected.
/// - A mismatch at `prev_log_index` is rejected with a hint of where to retry.
/// - Conflicting entries are replaced, matching ones are kept.
/// - The commit index does not go beyond what the request verified.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn append_entries_consistency_check() -> Result<()> {
    fixtures::init_tracing();

    let config = test_config(&[])?;
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0);

    let raft = router.get_raft_handle(&0)?;

    tracing::info!("--- leader 1 of term 2 writes entries of term 1 and 2");
    {
        let entries = vec![blank(1, 1), blank(1, 2), blank(2, 3), blank(2, 4), blank(2, 5)];
        let resp = raft.append_entries(req(2, 1, (0, 0), entries, 2)).await?;
        assert!(resp.success);

        let m = router.wait(&0, timeout())?.metrics(|x| x.last_applied == 2, "entries 1, 2 applied").await?;
        assert_eq!(5, m.last_log_index);
        assert_eq!(2, m.commit_index);
        assert_eq!(Some(1), m.current_leader);
        assert_eq!(2, m.current_term);
    }

    tracing::info!("--- the log does not reach prev_log_index");
    {
        let resp = raft.append_entries(req(2, 1, (2, 8), vec![blank(2, 9)], 2)).await?;
        assert_eq!(
            AppendEntriesResponse {
                term: 2,
                success: false,
                conflict_index: 6,
                conflict_term: None,
            },
            resp
        );
    }

    tracing::info!("--- the term at prev_log_index differs: hint at the first entry of the local term");
    {
        let resp = raft.append_entries(req(3, 2, (3, 4), vec![blank(3, 5)], 2)).await?;
        assert_eq!(
            AppendEntriesResponse {
                term: 3,
                success: false,
                conflict_index: 3,
                conflict_term: Some(2),
            },
            resp
        );
        assert_eq!(Some(2), router.get_metrics(&0)?.current_leader);
    }

    tracing::info!("--- conflicting entries are deleted, and replaced");
    {
        let resp = raft.append_entries(req(3, 2, (1, 2), vec![blank(3, 3), blank(3, 4)], 2)).await?;
        assert!(resp.success);

        let logs = router.get_logs(&0).await?;
        let got = logs.iter().map(|e| e.log_id).collect::<Vec<_>>();
        assert_eq!(
            vec![LogId::new(1, 1), LogId::new(1, 2), LogId::new(3, 3), LogId::new(3, 4)],
            got
        );
        assert_eq!(4, router.get_metrics(&0)?.last_log_index);
    }

    tracing::info!("--- resending the same entries changes nothing");
    {
        let resp = raft.append_entries(req(3, 2, (1, 2), vec![blank(3, 3)], 2)).await?;
        assert!(resp.success);
        assert_eq!(4, router.get_logs(&0).await?.len());
    }

    tracing::info!("--- the commit index is bounded by the last entry the request covers");
    {
        let resp = raft.append_entries(req(3, 2, (3, 3), vec![], 10)).await?;
        assert!(resp.success);

        let m = router.wait(&0, timeout())?.metrics(|x| x.last_applied == 3, "entry 3 applied").await?;
        assert_eq!(3, m.commit_index);
        assert_eq!(4, m.last_log_index);
    }

    tracing::info!("--- a stale term is rejected without a hint");
    {
        let resp = raft.append_entries(req(2, 1, (3, 4), vec![], 4)).await?;
        assert_eq!(
            AppendEntriesResponse {
                term: 3,
                success: false,
                conflict_index: 0,
                conflict_term: None,
            },
            resp
        );
        assert_eq!(Some(2), router.get_metrics(&0)?.current_leader);
    }

    Ok(())
}
