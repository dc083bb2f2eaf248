use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;
use replog::State;
use tokio::time::sleep;

use crate::fixtures;
use crate::fixtures::test_config;
use crate::fixtures::timeout;
use crate::fixtures::RaftRouter;

/// With single node mode, a pristine node leads a cluster of itself at once, without an election.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_leads_without_election() -> Result<()> {
    fixtures::init_tracing();

    let config = test_config(&["--enable-single-node"])?;
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0);

    let m = router.wait(&0, timeout())?.state(State::Leader, "leads at once").await?;
    assert_eq!(1, m.current_term);
    assert_eq!(Some(0), router.get_raft_handle(&0)?.current_leader());

    let m = router.wait(&0, timeout())?.log(1, "config of itself committed").await?;
    assert_eq!(vec![0], m.membership.voter_ids().copied().collect::<Vec<_>>());
    assert_eq!(1, m.commit_index);

    tracing::info!("--- writes commit with a single node");
    {
        let resp = router.client_request(0, "foo", 1).await?;
        assert_eq!(2, resp.log_id.index);
        router.wait(&0, timeout())?.log(2, "write applied").await?;
    }

    assert_eq!(0, router.rpc_count(0, "RequestVote"));

    Ok(())
}

/// Without single node mode, a node initialized as the only voter does not lead.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sole_voter_waits_without_single_node_mode() -> Result<()> {
    fixtures::init_tracing();

    let config = test_config(&[])?;
    let router = Arc::new(RaftRouter::new(config.clone()));
    router.new_raft_node(0);

    router.initialize_with(0, btreeset! {0}).await?;
    sleep(Duration::from_millis(config.election_timeout * 3)).await;

    let m = router.get_metrics(&0)?;
    assert_eq!(State::Follower, m.state);
    assert_eq!(0, m.current_term);
    assert!(m.membership.is_voter(&0));
    assert_eq!(0, router.rpc_count(0, "RequestVote"));

    Ok(())
}
