use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use memstore::ClientRequest;
use memstore::ClientResponse;
use pretty_assertions::assert_eq;
use replog::ClientWriteError;
use replog::EntryPayload;
use replog::ForwardToLeader;
use replog::LogId;
use replog::State;

use crate::fixtures;
use crate::fixtures::test_config;
use crate::fixtures::timeout;
use crate::fixtures::RaftRouter;

/// A command written to the leader is appended on every node, committed once a majority has it,
/// and applied once on every state machine.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn replicate_commit_and_apply() -> Result<()> {
    fixtures::init_tracing();

    let config = test_config(&[])?;
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut log_index = router.new_cluster(btreeset! {0,1,2}, btreeset! {}).await?;

    tracing::info!("--- write one command");
    {
        let resp = router.client_request(0, "foo", 1).await?;
        log_index += 1;

        assert_eq!(LogId::new(1, log_index), resp.log_id);
        assert_eq!(ClientResponse(None), resp.data);

        router.wait_for_log(&btreeset! {0,1,2}, log_index, timeout(), "command applied everywhere").await?;

        let want = ClientRequest::make_request("foo", 1).to_bytes();
        for id in 0..3 {
            let logs = router.get_logs(&id).await?;
            assert_eq!(log_index, logs.len() as u64, "node {}", id);

            let last = &logs[logs.len() - 1];
            assert_eq!(LogId::new(1, log_index), last.log_id);
            assert_eq!(EntryPayload::Normal(want.clone()), last.payload);

            let sm = router.get_state_machine(&id)?.get_state_machine().await;
            assert_eq!(Some(&"request-1".to_string()), sm.client_status.get("foo"));
            assert_eq!(LogId::new(1, log_index), sm.last_applied_log);
        }
    }

    tracing::info!("--- the response carries what the state machine returned");
    {
        let resp = router.client_request(0, "foo", 2).await?;
        log_index += 1;
        assert_eq!(ClientResponse(Some("request-1".to_string())), resp.data);
    }

    tracing::info!("--- write many");
    {
        router.client_request_many(0, "bar", 100).await;
        log_index += 100;

        router.wait_for_log(&btreeset! {0,1,2}, log_index, timeout(), "100 commands applied").await?;

        let want = router.get_state_machine(&0)?.get_state_machine().await;
        for id in [1, 2] {
            let got = router.get_state_machine(&id)?.get_state_machine().await;
            assert_eq!(want, got, "state machine of node {}", id);
        }
    }

    router.assert_stable_cluster(Some(1), Some(log_index));

    Ok(())
}

/// A write commits with 2 of 3 nodes, and not with 1 of 3.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn commit_needs_a_majority() -> Result<()> {
    fixtures::init_tracing();

    let config = test_config(&[])?;
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut log_index = router.new_cluster(btreeset! {0,1,2}, btreeset! {}).await?;

    tracing::info!("--- isolate node 2, a write still commits");
    {
        router.isolate_node(2);

        router.client_request(0, "foo", 1).await?;
        log_index += 1;

        router.wait_for_log(&btreeset! {0,1}, log_index, timeout(), "committed by 0 and 1").await?;
        assert_eq!(log_index - 1, router.get_metrics(&2)?.last_log_index);
    }

    tracing::info!("--- isolate node 1 too, a write does not commit");
    {
        router.isolate_node(1);

        let raft = router.get_raft_handle(&0)?;
        let req = ClientRequest::make_request("foo", 2).to_bytes();
        let handle = tokio::spawn(async move { raft.client_write(req).await });

        router.wait(&0, timeout())?.metrics(|x| x.last_log_index == log_index + 1, "appended on leader").await?;

        tokio::time::sleep(Duration::from_millis(500)).await;
        let m = router.get_metrics(&0)?;
        assert_eq!(log_index, m.commit_index, "not committed without a majority");
        assert!(!handle.is_finished());

        tracing::info!("--- restore node 1: it campaigned while isolated, the leader steps down");
        router.restore_node(1);

        let res = handle.await?;
        assert!(
            matches!(res, Err(ClientWriteError::ForwardToLeader(_))),
            "a leader which stepped down does not answer, got {:?}",
            res
        );
    }

    tracing::info!("--- node 0 has the longest log and leads again, its entry of term 1 commits with the new term");
    {
        router
            .wait(&0, timeout())?
            .metrics(|x| x.state == State::Leader && x.current_term > 1, "node 0 leads again")
            .await?;

        // the pending entry and the blank entry of the new term
        log_index += 2;
        router.wait(&0, timeout())?.log_at_least(log_index, "pending entry applied").await?;
        router.wait(&1, timeout())?.log_at_least(log_index, "pending entry applied").await?;

        let sm = router.get_state_machine(&0)?.get_state_machine().await;
        assert_eq!(Some(&"request-2".to_string()), sm.client_status.get("foo"));
    }

    tracing::info!("--- restore node 2, it catches up");
    {
        router.restore_node(2);
        router.wait(&2, timeout())?.log_at_least(log_index, "node 2 catches up").await?;
    }

    Ok(())
}

/// A follower refuses a write, telling where the leader is.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn write_to_follower_is_forwarded() -> Result<()> {
    fixtures::init_tracing();

    let config = test_config(&[])?;
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_cluster(btreeset! {0,1,2}, btreeset! {}).await?;

    let res = router.client_request(1, "foo", 1).await;
    match res {
        Err(ClientWriteError::ForwardToLeader(fwd)) => {
            assert_eq!(
                ForwardToLeader {
                    leader_id: Some(0),
                    leader_addr: Some(fixtures::addr(0)),
                },
                fwd
            );
        }
        other => panic!("expect ForwardToLeader, got {:?}", other),
    }

    Ok(())
}
