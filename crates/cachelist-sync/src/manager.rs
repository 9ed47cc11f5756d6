//! Reconciliation manager - runs synchronization passes over all ensembles.
//!
//! # Pass
//!
//! ```text
//! lock ─► read every view ─► plan diff ─► create mirrors ─► delete stale ─► re-arm watches ─► unlock
//! ```
//!
//! A single async mutex around the view list serialises passes. Watches armed
//! in the last phase do not call back into [`ReconciliationManager::sync`];
//! they enqueue a [`Trigger`], and [`ReconciliationManager::run`] drains the
//! queue one pass at a time. Requests that pile up while a pass runs are
//! folded into the next pass, which re-reads everything anyway.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::client::WatchEvent;
use crate::config::SyncConfig;
use crate::reconcile::{self, MirrorOp};
use crate::view::{EnsembleView, MembershipSnapshot, WatchCallback, WriteOutcome};

/// Shared reference to ReconciliationManager
pub type SharedReconciliationManager = Arc<ReconciliationManager>;

/// Why a pass was started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Trigger {
    /// First pass after startup.
    Startup,
    /// A child watch fired on `ensemble`.
    Watch { ensemble: String, event: WatchEvent },
    /// Follow-up after a pass that could not read or re-arm `ensemble`.
    Retry { ensemble: String },
    /// Requested by the embedding application.
    Manual,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Startup => write!(f, "startup"),
            Self::Watch { ensemble, event } => write!(f, "watch({ensemble}: {event})"),
            Self::Retry { ensemble } => write!(f, "retry({ensemble})"),
            Self::Manual => write!(f, "manual"),
        }
    }
}

/// How a pass ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PassOutcome {
    Completed,
    /// Reading `ensemble` failed; nothing was written.
    ReadFailed { ensemble: String, reason: String },
    /// Writes were applied but the watch on `ensemble` could not be re-armed.
    RearmFailed { ensemble: String, reason: String },
    /// The manager is shutting down.
    Skipped,
}

/// A conflict as logged: `node` is ephemeral on both ensembles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictRecord {
    pub node: String,
    pub announced_on: String,
    pub also_on: String,
}

/// Summary of one pass.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub pass: u64,
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: PassOutcome,
    pub created: usize,
    pub deleted: usize,
    pub already_present: usize,
    pub already_absent: usize,
    pub write_failures: usize,
    pub conflicts: Vec<ConflictRecord>,
}

impl PassReport {
    fn new(pass: u64, trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            pass,
            trigger,
            started_at: now,
            finished_at: now,
            outcome: PassOutcome::Completed,
            created: 0,
            deleted: 0,
            already_present: 0,
            already_absent: 0,
            write_failures: 0,
            conflicts: Vec::new(),
        }
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }

    pub fn is_completed(&self) -> bool {
        self.outcome == PassOutcome::Completed
    }

    /// Creates plus deletes actually applied.
    pub fn writes(&self) -> usize {
        self.created + self.deleted
    }
}

/// Keeps every ensemble's mirror set equal to the other ensembles' live members.
pub struct ReconciliationManager {
    views: Mutex<Vec<EnsembleView>>,
    resync_tx: mpsc::UnboundedSender<Trigger>,
    resync_rx: Mutex<Option<mpsc::UnboundedReceiver<Trigger>>>,
    passes: AtomicU64,
    closed: AtomicBool,
    stop: Notify,
    retry_delay: Duration,
}

impl ReconciliationManager {
    pub fn new(config: &SyncConfig) -> Self {
        let (resync_tx, resync_rx) = mpsc::unbounded_channel();
        Self {
            views: Mutex::new(Vec::new()),
            resync_tx,
            resync_rx: Mutex::new(Some(resync_rx)),
            passes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            stop: Notify::new(),
            retry_delay: config.read_retry.delay,
        }
    }

    /// Create a shared reference to this manager
    pub fn shared(self) -> SharedReconciliationManager {
        Arc::new(self)
    }

    /// Add a view. Views are processed in the order they were appended.
    pub fn append(&mut self, view: EnsembleView) {
        self.views.get_mut().push(view);
    }

    /// Number of passes started so far.
    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::SeqCst)
    }

    /// Current snapshot of every view, by name, in configuration order.
    ///
    /// Waits for any in-flight pass.
    pub async fn snapshots(&self) -> Vec<(String, MembershipSnapshot)> {
        self.views
            .lock()
            .await
            .iter()
            .map(|view| (view.name().to_string(), view.snapshot().clone()))
            .collect()
    }

    /// Queue a pass. Returns false once the manager has shut down.
    pub fn request_resync(&self, trigger: Trigger) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.resync_tx.send(trigger).is_ok()
    }

    /// Run one full synchronization pass.
    ///
    /// Holds the pass lock from the first read to the last re-armed watch.
    /// Per-node problems are logged and counted; only a failed read stops the
    /// pass early, before anything is written.
    pub async fn sync(&self, trigger: Trigger) -> PassReport {
        let mut views = self.views.lock().await;
        let pass = self.passes.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = PassReport::new(pass, trigger);

        if self.closed.load(Ordering::SeqCst) {
            debug!(pass, "Manager closed, skipping pass");
            report.outcome = PassOutcome::Skipped;
            return report.finish();
        }

        info!(pass, trigger = %report.trigger, ensembles = views.len(), "Sync start");

        // Read phase
        for view in views.iter_mut() {
            if let Err(e) = view.refresh(None).await.map(|_| ()) {
                error!(pass, ensemble = view.name(), error = %e, "Read failed, pass aborted");
                report.outcome = PassOutcome::ReadFailed {
                    ensemble: view.name().to_string(),
                    reason: e.to_string(),
                };
                self.schedule_retry(view.name());
                return report.finish();
            }
        }

        let names: Vec<String> = views.iter().map(|v| v.name().to_string()).collect();
        let plan = {
            let snapshots: Vec<&MembershipSnapshot> = views.iter().map(|v| v.snapshot()).collect();
            reconcile::plan(&snapshots)
        };

        for conflict in &plan.conflicts {
            error!(
                pass,
                node = %conflict.node,
                announced_on = %names[conflict.announced_on],
                also_on = %names[conflict.also_on],
                "Duplicated ephemeral node"
            );
            report.conflicts.push(ConflictRecord {
                node: conflict.node.clone(),
                announced_on: names[conflict.announced_on].clone(),
                also_on: names[conflict.also_on].clone(),
            });
        }

        // Create phase
        for MirrorOp { ensemble, node } in &plan.creates {
            let view = &views[*ensemble];
            match view.create(node).await {
                Ok(WriteOutcome::Applied) => {
                    info!(pass, ensemble = view.name(), node = %node, "Create mirror");
                    report.created += 1;
                }
                Ok(WriteOutcome::AlreadyPresent) => report.already_present += 1,
                Ok(WriteOutcome::AlreadyAbsent) => {}
                Err(e) => {
                    warn!(pass, ensemble = view.name(), node = %node, error = %e, "Create failed");
                    report.write_failures += 1;
                }
            }
        }

        // Delete phase, strictly after every create
        for MirrorOp { ensemble, node } in &plan.deletes {
            let view = &views[*ensemble];
            match view.delete(node).await {
                Ok(WriteOutcome::Applied) => {
                    info!(pass, ensemble = view.name(), node = %node, "Delete stale mirror");
                    report.deleted += 1;
                }
                Ok(WriteOutcome::AlreadyAbsent) => report.already_absent += 1,
                Ok(WriteOutcome::AlreadyPresent) => {}
                Err(e) => {
                    warn!(pass, ensemble = view.name(), node = %node, error = %e, "Delete failed");
                    report.write_failures += 1;
                }
            }
        }

        // Re-arm phase
        for view in views.iter_mut() {
            let callback = self.watch_callback(view.name());
            if let Err(e) = view.refresh(Some(callback)).await.map(|_| ()) {
                error!(pass, ensemble = view.name(), error = %e, "Could not re-arm watch");
                if report.is_completed() {
                    report.outcome = PassOutcome::RearmFailed {
                        ensemble: view.name().to_string(),
                        reason: e.to_string(),
                    };
                }
                self.schedule_retry(view.name());
            }
        }

        let report = report.finish();
        info!(
            pass,
            created = report.created,
            deleted = report.deleted,
            conflicts = report.conflicts.len(),
            write_failures = report.write_failures,
            "Sync done"
        );
        if let Ok(json) = serde_json::to_string(&report) {
            debug!(pass, report = %json, "Pass report");
        }
        report
    }

    fn watch_callback(&self, ensemble: &str) -> WatchCallback {
        let tx = self.resync_tx.clone();
        let ensemble = ensemble.to_string();
        Box::new(move |event| {
            info!(ensemble = %ensemble, %event, "Watch children called");
            let _ = tx.send(Trigger::Watch { ensemble, event });
        })
    }

    fn schedule_retry(&self, ensemble: &str) {
        let tx = self.resync_tx.clone();
        let ensemble = ensemble.to_string();
        let delay = self.retry_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Trigger::Retry { ensemble });
        });
    }

    /// Initial pass, then one pass per dequeued batch of resync requests,
    /// until [`ReconciliationManager::shutdown`].
    pub async fn run(self: Arc<Self>) {
        let Some(mut rx) = self.resync_rx.lock().await.take() else {
            warn!("Reconciliation loop already running");
            return;
        };

        self.sync(Trigger::Startup).await;

        loop {
            let trigger = tokio::select! {
                _ = self.stop.notified() => break,
                next = rx.recv() => match next {
                    Some(trigger) => trigger,
                    None => break,
                },
            };

            let mut coalesced = 0usize;
            while rx.try_recv().is_ok() {
                coalesced += 1;
            }
            if coalesced > 0 {
                debug!(coalesced, "Folded pending resync requests into one pass");
            }

            self.sync(trigger).await;
        }

        info!("Reconciliation loop stopped");
    }

    /// Stop the loop, wait for any in-flight pass, and close every session.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.stop.notify_one();

        let mut views = self.views.lock().await;
        for view in views.iter_mut() {
            view.close().await;
        }
        info!(ensembles = views.len(), "Sync manager done");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_display() {
        assert_eq!(Trigger::Startup.to_string(), "startup");
        assert_eq!(
            Trigger::Retry {
                ensemble: "zk1:2181/arcus/cache_list/a".into()
            }
            .to_string(),
            "retry(zk1:2181/arcus/cache_list/a)"
        );
    }

    #[test]
    fn report_serializes_with_tagged_outcome() {
        let mut report = PassReport::new(3, Trigger::Manual);
        report.outcome = PassOutcome::ReadFailed {
            ensemble: "zk1".into(),
            reason: "boom".into(),
        };
        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["pass"], 3);
        assert_eq!(json["trigger"]["source"], "manual");
        assert_eq!(json["outcome"]["status"], "read_failed");
        assert_eq!(json["outcome"]["ensemble"], "zk1");
    }
}
