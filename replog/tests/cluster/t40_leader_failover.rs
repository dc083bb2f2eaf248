use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use maplit::btreeset;
use memstore::ClientRequest;
use pretty_assertions::assert_eq;
use replog::ClientWriteError;
use replog::EntryPayload;
use replog::State;

use crate::fixtures;
use crate::fixtures::test_config;
use crate::fixtures::timeout;
use crate::fixtures::RaftRouter;

/// The leader is cut off with an uncommitted entry.
///
/// - One of the other two is elected in a greater term and commits new entries.
/// - Once back, the old leader steps down, its uncommitted entry is replaced by the new leader's,
///   and the client which wrote it is told to go to the new leader.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_leader_is_replaced() -> Result<()> {
    fixtures::init_tracing();

    let config = test_config(&[])?;
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut log_index = router.new_cluster(btreeset! {0,1,2}, btreeset! {}).await?;

    router.client_request(0, "foo", 1).await?;
    log_index += 1;
    router.wait_for_log(&btreeset! {0,1,2}, log_index, timeout(), "first command").await?;

    tracing::info!("--- isolate the leader, and write to it");
    let handle = {
        router.isolate_node(0);

        let raft = router.get_raft_handle(&0)?;
        let req = ClientRequest::make_request("foo", 2).to_bytes();
        let handle = tokio::spawn(async move { raft.client_write(req).await });

        router.wait(&0, timeout())?.metrics(|x| x.last_log_index == log_index + 1, "appended on node 0").await?;
        handle
    };

    tracing::info!("--- a new leader is elected among 1 and 2");
    let leader = {
        let m = router
            .wait(&1, timeout())?
            .metrics(
                |x| x.current_term > 1 && x.current_leader.is_some() && x.current_leader != Some(0),
                "new leader",
            )
            .await?;
        m.current_leader.ok_or_else(|| anyhow!("no leader"))?
    };
    assert!(leader == 1 || leader == 2);

    tracing::info!("--- the new leader commits a command");
    {
        let resp = router.client_request(leader, "bar", 1).await?;
        // a blank entry of the new term, then the command
        log_index += 2;
        assert_eq!(log_index, resp.log_id.index);

        router.wait_for_log(&btreeset! {1,2}, log_index, timeout(), "committed by the new leader").await?;
    }

    tracing::info!("--- restore node 0, it steps down and its uncommitted entry is replaced");
    {
        router.restore_node(0);

        let res = handle.await?;
        assert!(
            matches!(res, Err(ClientWriteError::ForwardToLeader(_))),
            "the stale write is not committed, got {:?}",
            res
        );

        router.wait(&0, timeout())?.state(State::Follower, "old leader steps down").await?;
        router.wait(&0, timeout())?.current_leader(leader, "old leader follows").await?;
        router.wait(&0, timeout())?.log(log_index, "old leader repaired").await?;

        let want = router.get_logs(&leader).await?;
        let got = router.get_logs(&0).await?;
        assert_eq!(want, got);
        assert_eq!(EntryPayload::Blank, got[2].payload, "entry 3 is the blank entry of the new leader");

        let sm = router.get_state_machine(&0)?.get_state_machine().await;
        assert_eq!(Some(&"request-1".to_string()), sm.client_status.get("foo"));
        assert_eq!(Some(&"request-1".to_string()), sm.client_status.get("bar"));
    }

    router.assert_stable_cluster(None, Some(log_index));

    Ok(())
}
