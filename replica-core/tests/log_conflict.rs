use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;
#[allow(unused_imports)]
use pretty_assertions::assert_eq;
use replica_core::replica::AppendEntriesRequest;
use replica_core::replica::Entry;
use replica_core::replica::EntryNormal;
use replica_core::replica::EntryPayload;
use replica_core::Config;
use replica_core::LogId;
use replica_core::NodeKind;
use replica_core::RoleKind;

use fixtures::ClusterRouter;

#[macro_use]
mod fixtures;

fn timeout() -> Option<Duration> {
    Some(Duration::from_millis(2000))
}

fn normal_entry(term: u64, index: u64) -> Entry {
    Entry {
        log_id: LogId::new(term, index),
        payload: EntryPayload::Normal(EntryNormal {
            key: vec![index as u8],
            data: vec![term as u8],
        }),
    }
}

/// Log conflict reconciliation, driven through direct RPCs against a passive node.
///
/// What does this test do?
///
/// - seeds a passive replica with three entries from a term-1 leader.
/// - probes it as a term-2 leader whose previous entry conflicts; asserts the
///   rejection carries a conflict hint pointing below the conflicting term run.
/// - resends the term-2 log from that hint; asserts the conflicting suffix is
///   overwritten, committed and applied.
///
/// RUST_LOG=replica_core,memlog,log_conflict=trace cargo test -p replica-core --test log_conflict
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn log_conflict_reconciliation() -> Result<()> {
    let (_log_guard, ut_span) = init_ut!();
    let _ent = ut_span.enter();

    let config = Arc::new(Config::build("test".into()).validate()?);
    let router = Arc::new(ClusterRouter::new(config.clone()));
    // A passive node: accepts replication, never campaigns, which makes it a
    // deterministic target for hand-crafted RPC sequences.
    router.new_node(0, NodeKind::Passive, btreeset![99], btreeset![0]).await;
    router.open_detached(0).await?;
    router.wait(0, timeout()).await?.role(RoleKind::Passive, "opens as passive").await?;

    tracing::info!("--- seeding three entries from a term-1 leader");

    let res = router
        .append_entries(0, AppendEntriesRequest {
            term: 1,
            leader_id: 99,
            prev_log_id: LogId::new(0, 0),
            entries: vec![normal_entry(1, 1), normal_entry(1, 2), normal_entry(1, 3)],
            leader_commit: 0,
        })
        .await?;
    assert!(res.success, "seed append must succeed");

    tracing::info!("--- probing with a conflicting previous entry from a term-2 leader");

    let res = router
        .append_entries(0, AppendEntriesRequest {
            term: 2,
            leader_id: 98,
            prev_log_id: LogId::new(2, 2),
            entries: vec![],
            leader_commit: 0,
        })
        .await?;
    assert!(!res.success, "conflicting probe must be rejected");
    let conflict = res.conflict_opt.expect("rejection must carry a conflict hint");
    // The whole local log is one term-1 run, so nothing before it can match.
    assert_eq!(conflict.log_id, LogId::new(0, 0));

    tracing::info!("--- resending the term-2 log from the hint");

    let res = router
        .append_entries(0, AppendEntriesRequest {
            term: 2,
            leader_id: 98,
            prev_log_id: LogId::new(0, 0),
            entries: vec![
                normal_entry(2, 1),
                normal_entry(2, 2),
                normal_entry(2, 3),
                normal_entry(2, 4),
            ],
            leader_commit: 4,
        })
        .await?;
    assert!(res.success, "reconciliation append must succeed");

    // The conflicting suffix was overwritten in place.
    let log = router.storage(0).await?.read_log().await;
    assert_eq!(log.len(), 4);
    for (index, entry) in log.iter() {
        assert_eq!(entry.log_id.term, 2, "entry {} still carries the stale term", index);
    }

    // The leader's commit frontier was adopted and applied.
    router.wait(0, timeout()).await?.applied(4, "reconciled entries applied").await?;
    let kv = router.kv(0).await?;
    for index in 1u8..=4 {
        assert_eq!(kv.get(&[index]), Some(vec![2u8]), "key {} not applied from term 2", index);
    }

    Ok(())
}
