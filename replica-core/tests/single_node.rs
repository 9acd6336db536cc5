use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
use replica_core::Config;
use replica_core::NodeKind;
use replica_core::ReadConsistency;
use replica_core::RoleKind;

use fixtures::ClusterRouter;

#[macro_use]
mod fixtures;

fn timeout() -> Option<Duration> {
    Some(Duration::from_millis(2000))
}

/// Single-node cluster election.
///
/// What does this test do?
///
/// - brings one active node online in a cluster of one.
/// - asserts that it elects itself leader within the election timeout window.
/// - asserts that the initial blank entry of its term commits immediately.
/// - runs a write and a linearizable read against it.
///
/// RUST_LOG=replica_core,memlog,single_node=trace cargo test -p replica-core --test single_node
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_election() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(ClusterRouter::new(config.clone()));
    router.new_node(0, NodeKind::Active, btreeset![0], btreeset![]).await;

    // Opening resolves once the node has elected itself.
    router.open(0).await?;

    let metrics = router
        .wait(0, Some(Duration::from_millis(2 * config.election_timeout * 2)))
        .await?
        .role(RoleKind::Leader, "single node becomes leader")
        .await?;
    assert!(metrics.current_term >= 1, "term must have advanced, got {}", metrics.current_term);
    assert_eq!(metrics.current_leader, Some(0));

    // The blank entry of the new term is committed without any peers.
    router.wait(0, timeout()).await?.committed(1, "initial blank entry").await?;

    let echoed = router.write(0, b"k", b"v").await?;
    assert_eq!(echoed, b"v".to_vec());
    let value = router.read(0, b"k", ReadConsistency::Linearizable).await?;
    assert_eq!(value, b"v".to_vec());

    Ok(())
}
