//! Integration tests for the reconciliation manager
//!
//! Every test runs against in-memory ensembles: one `MemoryEnsemble` per
//! configured target, cache servers modelled as separate sessions holding
//! ephemeral nodes.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cachelist_sync::client::memory::{MemoryEnsemble, MemorySession};
use cachelist_sync::client::ChildWatch;
use cachelist_sync::error::ClientResult;
use cachelist_sync::{
    CoordinationClient, EnsembleTarget, EnsembleView, NodeMeta, PassOutcome, ReadRetryPolicy,
    ReconciliationManager, SyncConfig, Trigger,
};

const PATH: &str = "/arcus/cache_list/cloud_1";

fn fast_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.read_retry = ReadRetryPolicy {
        delay: Duration::from_millis(5),
        max_attempts: None,
    };
    config
}

fn target(index: usize) -> EnsembleTarget {
    EnsembleTarget::parse(&format!("zk{index}:2181{PATH}")).unwrap()
}

/// `count` independent ensembles plus a manager wired to all of them.
fn setup_with(count: usize, config: SyncConfig) -> (Vec<MemoryEnsemble>, ReconciliationManager) {
    let mut manager = ReconciliationManager::new(&config);
    let mut ensembles = Vec::new();
    for i in 0..count {
        let ensemble = MemoryEnsemble::new();
        ensemble.ensure_path(PATH);
        manager.append(EnsembleView::new(
            target(i),
            Arc::new(ensemble.session()),
            config.read_retry,
        ));
        ensembles.push(ensemble);
    }
    (ensembles, manager)
}

fn setup(count: usize) -> (Vec<MemoryEnsemble>, ReconciliationManager) {
    setup_with(count, fast_config())
}

/// A cache server announcing `name` on `ensemble`. Closing the session withdraws it.
async fn announce(ensemble: &MemoryEnsemble, name: &str) -> MemorySession {
    let session = ensemble.session();
    session
        .create(&format!("{PATH}/{name}"), true)
        .await
        .expect("announce peer");
    session
}

fn set(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// Session that lets a peer announce `node` right after its next plain
/// listing, i.e. between a pass's read phase and its re-arm phase.
struct AnnounceAfterRead {
    inner: MemorySession,
    peer: MemorySession,
    node: &'static str,
    pending: AtomicBool,
}

impl AnnounceAfterRead {
    fn new(ensemble: &MemoryEnsemble, node: &'static str) -> Self {
        Self {
            inner: ensemble.session(),
            peer: ensemble.session(),
            node,
            pending: AtomicBool::new(false),
        }
    }

    fn announce_after_next_read(&self) {
        self.pending.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CoordinationClient for AnnounceAfterRead {
    async fn list_children(&self, path: &str) -> ClientResult<Vec<String>> {
        let children = self.inner.list_children(path).await?;
        if self.pending.swap(false, Ordering::SeqCst) {
            self.peer
                .create(&format!("{path}/{}", self.node), true)
                .await?;
        }
        Ok(children)
    }

    async fn list_and_watch_children(&self, path: &str) -> ClientResult<(Vec<String>, ChildWatch)> {
        self.inner.list_and_watch_children(path).await
    }

    async fn node_meta(&self, path: &str) -> ClientResult<NodeMeta> {
        self.inner.node_meta(path).await
    }

    async fn create(&self, path: &str, ephemeral: bool) -> ClientResult<()> {
        self.inner.create(path, ephemeral).await
    }

    async fn delete(&self, path: &str) -> ClientResult<()> {
        self.inner.delete(path).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Test: two ensembles mirror each other, then a departed peer's mirror is removed
#[tokio::test]
async fn test_two_ensemble_join_and_leave() {
    let (zk, manager) = setup(2);
    let _x = announce(&zk[0], "x").await;
    let y = announce(&zk[1], "y").await;

    let report = manager.sync(Trigger::Manual).await;
    assert!(report.is_completed());
    assert_eq!(report.created, 2);
    assert_eq!(zk[0].persistent_children(PATH), set(&["y"]));
    assert_eq!(zk[1].persistent_children(PATH), set(&["x"]));

    y.close().await;
    let report = manager.sync(Trigger::Manual).await;
    assert_eq!(report.deleted, 1);
    assert!(zk[0].persistent_children(PATH).is_empty());
    assert_eq!(zk[1].persistent_children(PATH), set(&["x"]));
    assert!(zk[1].ephemeral_children(PATH).is_empty());
}

/// Test: a second pass without external change writes nothing
#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let (zk, manager) = setup(3);
    let _a = announce(&zk[0], "a").await;
    let _b = announce(&zk[1], "b").await;

    let first = manager.sync(Trigger::Manual).await;
    assert_eq!(first.created, 4);

    let before: Vec<_> = zk.iter().map(|e| e.operation_counts()).collect();
    let second = manager.sync(Trigger::Manual).await;
    let after: Vec<_> = zk.iter().map(|e| e.operation_counts()).collect();

    assert_eq!(second.writes(), 0);
    assert_eq!(second.already_present + second.already_absent, 0);
    assert_eq!(before, after);
}

/// Test: disjoint ephemeral sets converge in one pass
#[tokio::test]
async fn test_single_pass_convergence() {
    let (zk, manager) = setup(4);
    let mut peers = Vec::new();
    for (i, names) in [&["a1", "a2"][..], &["b1"][..], &[][..], &["d1", "d2", "d3"][..]]
        .iter()
        .enumerate()
    {
        for name in names.iter() {
            peers.push(announce(&zk[i], name).await);
        }
    }

    manager.sync(Trigger::Manual).await;

    for (i, ensemble) in zk.iter().enumerate() {
        let expected: BTreeSet<String> = zk
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .flat_map(|(_, other)| other.ephemeral_children(PATH))
            .collect();
        assert_eq!(ensemble.persistent_children(PATH), expected, "ensemble {i}");
    }
}

/// Test: the same identity live on two ensembles is logged and never mirrored
#[tokio::test]
async fn test_conflicting_announcements_are_skipped() {
    let (zk, manager) = setup(3);
    let _n0 = announce(&zk[0], "n").await;
    let _n1 = announce(&zk[1], "n").await;
    let _x = announce(&zk[0], "x").await;
    // Mirror of n left on the third ensemble by an earlier pass
    zk[2].session()
        .create(&format!("{PATH}/n"), false)
        .await
        .unwrap();

    let report = manager.sync(Trigger::Manual).await;

    assert_eq!(report.conflicts.len(), 2, "one per ordered pair");
    assert!(report.conflicts.iter().all(|c| c.node == "n"));
    assert_eq!(zk[0].persistent_children(PATH), set(&[]));
    assert_eq!(zk[1].persistent_children(PATH), set(&["x"]));
    assert_eq!(zk[2].persistent_children(PATH), set(&["n", "x"]));
    assert_eq!(report.deleted, 0);
}

/// Test: once one side withdraws, the conflict resolves on the next pass
#[tokio::test]
async fn test_conflict_resolves_after_withdrawal() {
    let (zk, manager) = setup(2);
    let _n0 = announce(&zk[0], "n").await;
    let n1 = announce(&zk[1], "n").await;
    assert_eq!(manager.sync(Trigger::Manual).await.conflicts.len(), 2);

    n1.close().await;
    let report = manager.sync(Trigger::Manual).await;
    assert!(report.conflicts.is_empty());
    assert_eq!(zk[1].persistent_children(PATH), set(&["n"]));
}

/// Test: a durable node nobody announces is removed
#[tokio::test]
async fn test_stale_mirror_is_deleted() {
    let (zk, manager) = setup(2);
    let _x = announce(&zk[1], "x").await;
    let leftover = zk[0].session();
    leftover.create(&format!("{PATH}/ghost"), false).await.unwrap();
    leftover.create(&format!("{PATH}/x"), false).await.unwrap();

    let report = manager.sync(Trigger::Manual).await;
    assert_eq!(report.deleted, 1);
    assert_eq!(zk[0].persistent_children(PATH), set(&["x"]));
}

/// Test: mirrors are never read back as live members
#[tokio::test]
async fn test_mirrors_are_not_promoted() {
    let (zk, manager) = setup(2);
    let _x = announce(&zk[0], "x").await;
    let _y = announce(&zk[1], "y").await;

    manager.sync(Trigger::Manual).await;
    manager.sync(Trigger::Manual).await;

    let snapshots = manager.snapshots().await;
    assert_eq!(snapshots[0].1.ephemeral, set(&["x"]));
    assert_eq!(snapshots[0].1.nonephemeral, set(&["y"]));
    assert_eq!(snapshots[1].1.ephemeral, set(&["y"]));
    assert_eq!(snapshots[1].1.nonephemeral, set(&["x"]));
    assert!(snapshots.iter().all(|(_, s)| s.is_consistent()));
}

/// Test: each pass leaves one armed watch per ensemble
#[tokio::test]
async fn test_pass_rearms_watches() {
    let (zk, manager) = setup(2);
    manager.sync(Trigger::Manual).await;
    manager.sync(Trigger::Manual).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    for (i, ensemble) in zk.iter().enumerate() {
        assert_eq!(ensemble.armed_watches(PATH), 1, "ensemble {i}");
    }
}

/// Test: a quiet ensemble does not pile up watches while others churn
#[tokio::test]
async fn test_watches_stay_bounded_on_quiet_ensemble() {
    let (zk, manager) = setup(3);
    for round in 0..6 {
        // Announced on two ensembles at once, so never mirrored onto the third.
        let name = format!("p{round}");
        let first = announce(&zk[0], &name).await;
        let second = announce(&zk[1], &name).await;
        manager.sync(Trigger::Manual).await;
        first.close().await;
        second.close().await;
        manager.sync(Trigger::Manual).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(zk[2].operation_counts().creates, 0);
    for (i, ensemble) in zk.iter().enumerate() {
        assert_eq!(ensemble.armed_watches(PATH), 1, "ensemble {i}");
    }
}

/// Test: a node vanishing mid-read is retried inside the pass
#[tokio::test]
async fn test_transient_read_anomaly_is_retried() {
    let (zk, manager) = setup(2);
    let _x = announce(&zk[0], "x").await;
    zk[0].inject_missing_reads(3);

    let report = manager.sync(Trigger::Manual).await;
    assert!(report.is_completed());
    assert_eq!(zk[1].persistent_children(PATH), set(&["x"]));
}

/// Test: a read that exhausts its attempts aborts the pass before any write
#[tokio::test]
async fn test_read_failure_aborts_without_writes() {
    let mut config = fast_config();
    config.read_retry.max_attempts = Some(2);
    let (zk, manager) = setup_with(2, config);
    let _x = announce(&zk[0], "x").await;
    zk[1].session()
        .create(&format!("{PATH}/stale"), false)
        .await
        .unwrap();
    zk[1].inject_missing_reads(10);

    let report = manager.sync(Trigger::Manual).await;
    assert!(matches!(report.outcome, PassOutcome::ReadFailed { .. }));
    assert_eq!(report.writes(), 0);
    assert_eq!(zk[1].persistent_children(PATH), set(&["stale"]));
}

/// Test: concurrent sync calls run one after the other
#[tokio::test]
async fn test_concurrent_passes_are_serialized() {
    let (zk, manager) = setup(2);
    let _x = announce(&zk[0], "x").await;
    let _y = announce(&zk[1], "y").await;

    let (first, second) = tokio::join!(
        manager.sync(Trigger::Manual),
        manager.sync(Trigger::Manual)
    );

    assert_eq!(first.writes() + second.writes(), 2);
    assert_eq!(first.already_present + second.already_present, 0);
    assert_ne!(first.pass, second.pass);
}

/// Test: the worker loop follows membership changes through watches alone
#[tokio::test]
async fn test_watch_driven_resync() {
    let (zk, manager) = setup(2);
    let manager = manager.shared();
    let worker = tokio::spawn(manager.clone().run());

    let mirror_on_1 = zk[1].clone();
    let watched = zk.clone();
    eventually("startup pass to arm watches", || {
        manager.pass_count() >= 1 && watched.iter().all(|e| e.armed_watches(PATH) >= 1)
    })
    .await;

    let z = announce(&zk[0], "z").await;
    eventually("mirror of z on ensemble 1", || {
        mirror_on_1.persistent_children(PATH).contains("z")
    })
    .await;

    z.close().await;
    eventually("mirror of z removed", || {
        mirror_on_1.persistent_children(PATH).is_empty()
    })
    .await;

    manager.shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("worker should stop after shutdown")
        .unwrap();
}

/// Test: an announcement landing mid-pass is picked up by a follow-up pass
#[tokio::test]
async fn test_change_during_pass_is_followed_up() {
    let config = fast_config();
    let mut manager = ReconciliationManager::new(&config);
    let quiet = MemoryEnsemble::new();
    let busy = MemoryEnsemble::new();
    quiet.ensure_path(PATH);
    busy.ensure_path(PATH);
    let late = Arc::new(AnnounceAfterRead::new(&busy, "late"));
    manager.append(EnsembleView::new(
        target(0),
        Arc::new(quiet.session()),
        config.read_retry,
    ));
    manager.append(EnsembleView::new(target(1), late.clone(), config.read_retry));

    let manager = manager.shared();
    let worker = tokio::spawn(manager.clone().run());
    eventually("startup pass to arm watches", || {
        manager.pass_count() >= 1
            && quiet.armed_watches(PATH) >= 1
            && busy.armed_watches(PATH) >= 1
    })
    .await;

    late.announce_after_next_read();
    let report = manager.sync(Trigger::Manual).await;
    assert!(report.is_completed());
    assert_eq!(report.created, 0, "read phase ran before the announcement");
    assert_eq!(busy.ephemeral_children(PATH), set(&["late"]));

    eventually("mirror of late on the quiet ensemble", || {
        quiet.persistent_children(PATH).contains("late")
    })
    .await;
    assert!(manager.pass_count() >= 3);

    manager.shutdown().await;
    tokio::time::timeout(Duration::from_secs(2), worker)
        .await
        .expect("worker should stop after shutdown")
        .unwrap();
}

/// Test: after shutdown, passes are skipped and mirrors stay in place
#[tokio::test]
async fn test_shutdown_keeps_durable_mirrors() {
    let (zk, manager) = setup(2);
    let _x = announce(&zk[0], "x").await;
    manager.sync(Trigger::Manual).await;

    manager.shutdown().await;
    assert!(!manager.request_resync(Trigger::Manual));

    let report = manager.sync(Trigger::Manual).await;
    assert_eq!(report.outcome, PassOutcome::Skipped);
    assert_eq!(zk[1].persistent_children(PATH), set(&["x"]));
}
