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
    Some(Duration::from_millis(3000))
}

/// Recovery across a restart.
///
/// What does this test do?
///
/// - runs a single-node cluster, commits a few writes, then shuts the replica down.
/// - boots a fresh replica on the same store with an empty state machine.
/// - asserts the node re-elects itself, replays its durable log through the commit
///   handler, and flags recovery complete exactly once the first commit index
///   observed after the restart has been applied.
///
/// RUST_LOG=replica_core,memlog,recovery=trace cargo test -p replica-core --test recovery
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn recovery_replays_the_log() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(ClusterRouter::new(config.clone()));
    router.new_node(0, NodeKind::Active, btreeset![0], btreeset![]).await;
    router.open(0).await?;
    router.wait(0, timeout()).await?.role(RoleKind::Leader, "initial election").await?;

    tracing::info!("--- committing writes before the restart");

    router.write(0, b"alpha", b"1").await?;
    router.write(0, b"beta", b"2").await?;
    assert_eq!(router.kv(0).await?.get(b"alpha"), Some(b"1".to_vec()));
    let term_before = router.replica(0).await?.metrics().borrow().current_term;
    // Blank entry of the first term plus two writes.
    let log_before = router.replica(0).await?.metrics().borrow().last_log_index;
    assert_eq!(log_before, 3);

    tracing::info!("--- restarting the replica on the same store");

    let storage = router.storage(0).await?;
    router.shutdown(0).await?;
    router.remove_node(0).await;
    router.new_node_with_storage(0, NodeKind::Active, btreeset![0], btreeset![], storage).await;

    // The fresh replica starts out recovering with an empty state machine.
    let metrics = router.replica(0).await?.metrics().borrow().clone();
    assert!(metrics.recovering);
    assert!(router.kv(0).await?.is_empty());

    router.open(0).await?;

    // The new term's blank entry lands at index 4; committing it is the first
    // commit observed after the restart, and applying it replays the older log.
    let metrics = router
        .wait(0, timeout())
        .await?
        .metrics(|m| m.last_applied >= 4 && !m.recovering, "recovery completes after replay")
        .await?;
    assert!(metrics.current_term > term_before, "restart must elect in a later term");
    assert_eq!(metrics.commit_index, 4);
    assert_eq!(metrics.last_log_index, 4);

    // The durable log was replayed into the fresh state machine.
    let kv = router.kv(0).await?;
    assert_eq!(kv.get(b"alpha"), Some(b"1".to_vec()));
    assert_eq!(kv.get(b"beta"), Some(b"2".to_vec()));

    // And the node serves reads and writes as usual.
    assert_eq!(router.read(0, b"beta", ReadConsistency::Linearizable).await?, b"2".to_vec());
    router.write(0, b"gamma", b"3").await?;
    assert_eq!(router.kv(0).await?.get(b"gamma"), Some(b"3".to_vec()));

    Ok(())
}
