use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
use replica_core::Config;
use replica_core::NodeKind;
use replica_core::TermProvider;

use fixtures::ClusterRouter;

#[macro_use]
mod fixtures;

/// Term advertisement for upstream consumers.
///
/// What does this test do?
///
/// - creates a three-node cluster and a term provider over one of its replicas,
///   registering a listener before the election runs.
/// - asserts `get_term` maps the election outcome: the epoch, the elected primary,
///   and the ordered candidate list with the primary excluded.
/// - asserts the listener observed the same descriptor, and that removal by
///   handle works exactly once.
/// - asserts `join` resolves once elected and `leave` is accepted.
///
/// RUST_LOG=replica_core,memlog,term_provider=trace cargo test -p replica-core --test term_provider
#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn term_provider_maps_election_outcome() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let members = btreeset![0, 1, 2];
    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(ClusterRouter::new(config.clone()));
    for id in [0, 1, 2] {
        router.new_node(id, NodeKind::Active, members.clone(), btreeset![]).await;
    }

    // Provider and listener exist before the election produces anything.
    let replica = router.replica(0).await?;
    let provider = TermProvider::new(&replica, &config, &members);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let listener_id = provider.add_listener(move |term| {
        let _ = tx.send(term.clone());
    });

    router.open_all().await?;
    let leader = router.wait_for_leader(Duration::from_secs(3), "initial election").await?;

    tracing::info!("--- get_term maps the election outcome");

    let term = provider.get_term().await?;
    assert_eq!(term.leader, leader);
    assert!(term.term >= 1);
    let expected: Vec<_> = members.iter().copied().filter(|id| *id != leader).collect();
    assert_eq!(term.followers, expected, "followers are the candidates minus the primary, in order");

    tracing::info!("--- the listener observed the election");

    let observed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("listener was not invoked within the deadline")
        .expect("listener channel closed");
    assert_eq!(observed.leader, term.leader);
    assert_eq!(observed.followers, term.followers);

    tracing::info!("--- join resolves and leave is a no-op");

    provider.join().await?;
    provider.leave().await?;

    tracing::info!("--- listener removal by handle is O(1) and idempotent");

    assert!(provider.remove_listener(listener_id));
    assert!(!provider.remove_listener(listener_id));

    Ok(())
}
