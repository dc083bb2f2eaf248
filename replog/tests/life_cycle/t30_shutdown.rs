use std::sync::Arc;

use anyhow::anyhow;
use anyhow::Result;
use maplit::btreeset;
use replog::raft::VoteRequest;
use replog::ClientWriteError;
use replog::InitializeError;
use replog::RaftError;
use replog::State;

use crate::fixtures;
use crate::fixtures::test_config;
use crate::fixtures::timeout;
use crate::fixtures::RaftRouter;

/// A node which is shut down answers every call with `ShuttingDown`; the rest of the cluster
/// elects a new leader.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_leader() -> Result<()> {
    fixtures::init_tracing();

    let config = test_config(&[])?;
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_cluster(btreeset! {0,1,2}, btreeset! {}).await?;

    let raft = router.get_raft_handle(&0)?;

    tracing::info!("--- shutdown node 0");
    {
        raft.shutdown().await?;
        router.wait(&0, timeout())?.state(State::Shutdown, "node 0 is shut down").await?;

        // again
        raft.shutdown().await?;
    }

    tracing::info!("--- every call fails");
    {
        let res = raft.client_write(b"foo".to_vec()).await;
        assert!(
            matches!(res, Err(ClientWriteError::RaftError(RaftError::ShuttingDown))),
            "got {:?}",
            res
        );

        let res = raft.initialize(Default::default()).await;
        assert!(
            matches!(res, Err(InitializeError::RaftError(RaftError::ShuttingDown))),
            "got {:?}",
            res
        );

        let res = raft.trigger_snapshot().await;
        assert!(matches!(res, Err(RaftError::ShuttingDown)), "got {:?}", res);

        let res = raft.vote(VoteRequest::new(10, 1, 100, 10)).await;
        assert!(matches!(res, Err(RaftError::ShuttingDown)), "got {:?}", res);
    }

    tracing::info!("--- 1 and 2 elect a new leader");
    {
        let m = router
            .wait(&1, timeout())?
            .metrics(
                |x| x.current_term > 1 && x.current_leader.is_some() && x.current_leader != Some(0),
                "new leader",
            )
            .await?;
        let leader = m.current_leader.ok_or_else(|| anyhow!("no leader"))?;

        router.client_request(leader, "foo", 1).await?;
    }

    Ok(())
}
