use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
use replica_core::replica::AppendEntriesRequest;
use replica_core::replica::VoteRequest;
use replica_core::Config;
use replica_core::LogId;
use replica_core::NodeKind;
use replica_core::ReadConsistency;
use replica_core::ReplicaError;
use replica_core::RoleKind;

use fixtures::ClusterRouter;

#[macro_use]
mod fixtures;

fn timeout() -> Option<Duration> {
    Some(Duration::from_millis(3000))
}

/// Passive learner behaviour.
///
/// What does this test do?
///
/// - brings up two active nodes and one passive learner.
/// - asserts the learner replicates and applies committed entries.
/// - asserts it never campaigns (role and term stay put with no leader traffic
///   needed to suppress it) and never grants a vote.
///
/// RUST_LOG=replica_core,memlog,passive_remote=trace cargo test -p replica-core --test passive_remote
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn passive_node_replicates_without_campaigning() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let members = btreeset![0, 1];
    let learners = btreeset![2];
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(ClusterRouter::new(config.clone()));
    router.new_node(0, NodeKind::Active, members.clone(), learners.clone()).await;
    router.new_node(1, NodeKind::Active, members.clone(), learners.clone()).await;
    router.new_node(2, NodeKind::Passive, members.clone(), learners.clone()).await;
    router.open_all().await?;
    let leader = router.wait_for_leader(Duration::from_secs(3), "initial election").await?;

    tracing::info!("--- a committed write reaches the learner");

    router.write(leader, b"k", b"v").await?;
    let committed = router.replica(leader).await?.metrics().borrow().commit_index;
    router.wait(2, timeout()).await?.applied(committed, "learner applies").await?;
    assert_eq!(router.kv(2).await?.get(b"k"), Some(b"v".to_vec()));

    tracing::info!("--- the learner stays passive");

    let leader_term = router.replica(leader).await?.metrics().borrow().current_term;
    // Give a hypothetical election timer ample time to have fired.
    tokio::time::sleep(Duration::from_millis(3 * config.election_timeout)).await;
    let metrics = router.replica(2).await?.metrics().borrow().clone();
    assert_eq!(metrics.role, RoleKind::Passive);
    assert_eq!(metrics.current_term, leader_term, "a passive node must not start elections");

    tracing::info!("--- the learner never grants votes");

    let res = router.vote(2, VoteRequest::new(leader_term + 10, 1, 1000, 1000)).await?;
    assert!(!res.vote_granted, "a passive node must not vote");
    assert_eq!(res.term, leader_term + 10);

    Ok(())
}

/// Remote observer behaviour.
///
/// What does this test do?
///
/// - brings up two active nodes plus a remote observer.
/// - asserts the remote fails with `NoLeader` before any advertisement reaches it.
/// - relays a leader advertisement; asserts client writes and reads route through
///   the remote to the leader while the remote's own log stays empty.
///
/// RUST_LOG=replica_core,memlog,passive_remote=trace cargo test -p replica-core --test passive_remote
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn remote_node_forwards_to_leader() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let members = btreeset![0, 1];
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(ClusterRouter::new(config.clone()));
    router.new_node(0, NodeKind::Active, members.clone(), btreeset![]).await;
    router.new_node(1, NodeKind::Active, members.clone(), btreeset![]).await;
    router.new_node(3, NodeKind::Remote, members.clone(), btreeset![]).await;
    router.open_nodes(&[0, 1]).await?;
    router.open_detached(3).await?;
    let leader = router.wait_for_leader(Duration::from_secs(3), "initial election").await?;
    router.wait(3, timeout()).await?.role(RoleKind::Remote, "opens as remote").await?;

    tracing::info!("--- no routing before a leader is known");

    let err = router.write(3, b"k", b"v").await.unwrap_err();
    assert!(matches!(err, ReplicaError::NoLeader), "got {:?}", err);

    tracing::info!("--- the membership layer relays a leader advertisement");

    let term = router.replica(leader).await?.metrics().borrow().current_term;
    let res = router
        .append_entries(3, AppendEntriesRequest {
            term,
            leader_id: leader,
            prev_log_id: LogId::new(0, 0),
            entries: vec![],
            leader_commit: 0,
        })
        .await?;
    assert!(res.success);
    router.wait(3, timeout()).await?.current_leader(leader, "remote learns the leader").await?;

    tracing::info!("--- client operations route through the remote");

    let echoed = router.write(3, b"k", b"v").await?;
    assert_eq!(echoed, b"v".to_vec());
    assert_eq!(router.read(3, b"k", ReadConsistency::Linearizable).await?, b"v".to_vec());

    // The remote itself holds no log.
    assert!(router.storage(3).await?.read_log().await.is_empty());
    assert_eq!(router.replica(3).await?.metrics().borrow().last_log_index, 0);

    Ok(())
}
