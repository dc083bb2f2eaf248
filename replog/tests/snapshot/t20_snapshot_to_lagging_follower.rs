use std::sync::Arc;

use anyhow::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;

use crate::fixtures;
use crate::fixtures::test_config;
use crate::fixtures::timeout;
use crate::fixtures::RaftRouter;

/// Snapshots are built once the log grows past the threshold. A node added afterwards finds the
/// log it needs compacted away on the leader, and receives a snapshot first.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn new_node_receives_snapshot() -> Result<()> {
    fixtures::init_tracing();

    let config = test_config(&["--snapshot-threshold=50", "--snapshot-interval=50", "--trailing-logs=5"])?;
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut log_index = router.new_cluster(btreeset! {0,1,2}, btreeset! {}).await?;

    tracing::info!("--- write past the threshold");
    {
        router.client_request_many(0, "foo", 100).await;
        log_index += 100;
        router.wait_for_log(&btreeset! {0,1,2}, log_index, timeout(), "written").await?;

        router
            .wait(&0, timeout())?
            .metrics(|x| x.snapshot.map(|s| s.index >= 50).unwrap_or(false), "leader built a snapshot")
            .await?;

        let first = router.first_log_index(&0).await?;
        assert!(first > 1, "log is compacted, first index: {}", first);
    }

    tracing::info!("--- add node 3, it is sent a snapshot");
    {
        router.new_raft_node(3);
        router.get_raft_handle(&0)?.add_non_voter(3, fixtures::addr(3)).await?;
        log_index += 1;

        router.wait_for_log(&btreeset! {0,1,2,3}, log_index, timeout(), "node 3 caught up").await?;

        assert!(router.rpc_count(0, "InstallSnapshot") >= 1);

        let m = router.get_metrics(&3)?;
        assert!(m.snapshot.is_some());
        assert!(m.membership.contains(&3));

        let want = router.get_state_machine(&0)?.get_state_machine().await;
        let got = router.get_state_machine(&3)?.get_state_machine().await;
        assert_eq!(want.client_status, got.client_status);
        assert_eq!(Some(&"request-99".to_string()), got.client_status.get("foo"));
    }

    Ok(())
}
