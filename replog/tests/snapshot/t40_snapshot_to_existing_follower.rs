use std::sync::Arc;

use anyhow::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;

use crate::fixtures;
use crate::fixtures::test_config;
use crate::fixtures::timeout;
use crate::fixtures::RaftRouter;

/// A follower cut off from the cluster while the others compact their logs has its next entry
/// compacted away on every possible leader. Once reconnected it is sent a snapshot instead of
/// the entries it lacks, then replication goes on with the log after it.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn existing_follower_receives_snapshot() -> Result<()> {
    fixtures::init_tracing();

    let config = test_config(&["--snapshot-threshold=50", "--snapshot-interval=50", "--trailing-logs=5"])?;
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut log_index = router.new_cluster(btreeset! {0,1,2}, btreeset! {}).await?;
    let lagging_at = log_index;

    tracing::info!("--- isolate node 2, write past the threshold");
    {
        router.isolate_node(2);

        router.client_request_many(0, "foo", 100).await;
        log_index += 100;
        router.wait_for_log(&btreeset! {0,1}, log_index, timeout(), "written without node 2").await?;

        for id in [0, 1] {
            router
                .wait(&id, timeout())?
                .metrics(|x| x.snapshot.map(|s| s.index >= 50).unwrap_or(false), "snapshot built")
                .await?;

            let first = router.first_log_index(&id).await?;
            assert!(
                first > lagging_at + 1,
                "node {} compacted the entries node 2 lacks, first index: {}",
                id,
                first
            );
        }
        assert_eq!(0, router.rpc_count(0, "InstallSnapshot") + router.rpc_count(1, "InstallSnapshot"));
    }

    tracing::info!("--- reconnect node 2, it catches up through a snapshot");
    {
        router.restore_node(2);

        // Node 2 may have raised its term while cut off, and the cluster may elect again.
        router.wait(&2, timeout())?.log_at_least(log_index, "node 2 caught up").await?;

        assert!(router.rpc_count(0, "InstallSnapshot") + router.rpc_count(1, "InstallSnapshot") >= 1);

        let m = router.get_metrics(&2)?;
        assert!(m.snapshot.is_some());
        assert!(m.snapshot.map(|s| s.index > lagging_at).unwrap_or(false));

        let got = router.get_state_machine(&2)?.get_state_machine().await;
        assert_eq!(Some(&"request-99".to_string()), got.client_status.get("foo"));
    }

    tracing::info!("--- node 2 receives new entries after the snapshot");
    {
        let m = router
            .wait(&2, timeout())?
            .metrics(|x| x.current_leader.is_some(), "node 2 knows the leader")
            .await?;
        let leader = m.current_leader.ok_or_else(|| anyhow::anyhow!("no leader"))?;
        router.client_request(leader, "bar", 1).await?;

        let applied = router.get_metrics(&leader)?.last_applied;
        assert!(applied > log_index);
        router.wait(&2, timeout())?.log_at_least(applied, "node 2 applied the new entry").await?;

        let got = router.get_state_machine(&2)?.get_state_machine().await;
        assert_eq!(Some(&"request-1".to_string()), got.client_status.get("bar"));
        assert_eq!(Some(&"request-99".to_string()), got.client_status.get("foo"));
    }

    Ok(())
}
