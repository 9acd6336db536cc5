use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
use replica_core::Config;
use replica_core::NodeKind;
use replica_core::ReadConsistency;

use fixtures::ClusterRouter;

#[macro_use]
mod fixtures;

fn timeout() -> Option<Duration> {
    Some(Duration::from_millis(3000))
}

/// Three-node steady-state client operations.
///
/// What does this test do?
///
/// - brings three active nodes online and waits for a leader.
/// - writes through the leader; asserts the future resolves with the commit
///   handler's output and that all three replicas converge on the commit index.
/// - reads the value back at both consistency levels.
/// - writes and reads through a follower, exercising the forwarding path.
/// - deletes the key and asserts it clears on every replica.
///
/// RUST_LOG=replica_core,memlog,client_rw=trace cargo test -p replica-core --test client_rw
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn three_node_commit_and_read() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let members = btreeset![0, 1, 2];
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(ClusterRouter::new(config.clone()));
    for id in [0, 1, 2] {
        router.new_node(id, NodeKind::Active, members.clone(), btreeset![]).await;
    }
    router.open_all().await?;
    let leader = router.wait_for_leader(Duration::from_secs(3), "initial election").await?;

    tracing::info!("--- write through the leader");

    let echoed = router.write(leader, b"k1", b"v1").await?;
    assert_eq!(echoed, b"v1".to_vec());

    let committed = router.replica(leader).await?.metrics().borrow().commit_index;
    router.wait_for_commit(&members, committed, timeout(), "commit propagates").await?;
    router.wait_for_applied(&members, committed, timeout(), "apply propagates").await?;
    for id in [0, 1, 2] {
        assert_eq!(router.kv(id).await?.get(b"k1"), Some(b"v1".to_vec()), "node {} missing k1", id);
    }

    tracing::info!("--- read back through the leader");

    assert_eq!(router.read(leader, b"k1", ReadConsistency::Sequential).await?, b"v1".to_vec());
    assert_eq!(router.read(leader, b"k1", ReadConsistency::Linearizable).await?, b"v1".to_vec());

    tracing::info!("--- write and read through a follower");

    let follower = members.iter().copied().find(|id| *id != leader).unwrap();
    let echoed = router.write(follower, b"k2", b"v2").await?;
    assert_eq!(echoed, b"v2".to_vec());
    assert_eq!(router.read(follower, b"k2", ReadConsistency::Linearizable).await?, b"v2".to_vec());

    tracing::info!("--- delete clears the key everywhere");

    let removed = router.delete(leader, b"k1").await?;
    assert_eq!(removed, b"v1".to_vec());

    let committed = router.replica(leader).await?.metrics().borrow().commit_index;
    router.wait_for_applied(&members, committed, timeout(), "delete propagates").await?;
    for id in [0, 1, 2] {
        assert_eq!(router.kv(id).await?.get(b"k1"), None, "node {} still has k1", id);
    }

    Ok(())
}
