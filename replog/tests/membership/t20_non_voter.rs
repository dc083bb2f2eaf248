use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;
use replog::ChangeMembershipError;
use replog::State;
use tokio::time::sleep;

use crate::fixtures;
use crate::fixtures::test_config;
use crate::fixtures::timeout;
use crate::fixtures::RaftRouter;

/// A non-voter receives the log but never campaigns; promoted, it becomes a voter.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_voter_replicates_and_is_promoted() -> Result<()> {
    fixtures::init_tracing();

    let config = test_config(&[])?;
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut log_index = router.new_cluster(btreeset! {0,1,2}, btreeset! {3}).await?;

    tracing::info!("--- the non-voter receives writes");
    {
        let m = router.get_metrics(&3)?;
        assert!(m.membership.contains(&3));
        assert!(!m.membership.is_voter(&3));

        router.client_request_many(0, "foo", 10).await;
        log_index += 10;

        router.wait_for_log(&btreeset! {0,1,2,3}, log_index, timeout(), "written to all").await?;
    }

    tracing::info!("--- a non-voter cut off from the leader does not campaign");
    {
        router.isolate_node(3);
        sleep(Duration::from_millis(config.election_timeout * 3)).await;

        let m = router.get_metrics(&3)?;
        assert_eq!(State::Follower, m.state);
        assert_eq!(1, m.current_term);
        assert_eq!(0, router.rpc_count(3, "RequestVote"));

        router.restore_node(3);
        router.assert_stable_cluster(Some(1), Some(log_index));
    }

    tracing::info!("--- adding it again as non-voter is refused");
    {
        let res = router.get_raft_handle(&0)?.add_non_voter(3, fixtures::addr(3)).await;
        assert!(matches!(res, Err(ChangeMembershipError::AlreadyMember(3))), "got {:?}", res);
    }

    tracing::info!("--- promote it to voter");
    {
        let resp = router.get_raft_handle(&0)?.add_voter(3, fixtures::addr(3)).await?;
        log_index += 1;
        assert!(resp.membership.is_voter(&3));

        router.wait_for_log(&btreeset! {0,1,2,3}, log_index, timeout(), "promotion replicated").await?;
        router
            .wait(&3, timeout())?
            .metrics(|x| x.membership.is_voter(&3), "node 3 knows it is a voter")
            .await?;
    }

    Ok(())
}
