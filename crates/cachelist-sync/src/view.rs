//! Per-ensemble membership view.
//!
//! An [`EnsembleView`] owns one coordination session and the last snapshot
//! read from its cache-list path. Children are partitioned by ownership:
//!
//! ```text
//! /arcus/cache_list/<cluster>
//!   ├─ 10.0.0.1:11211   ephemeral     a cache server announcing itself here
//!   └─ 10.0.1.7:11211   nonephemeral  a mirror of a server announced elsewhere
//! ```
//!
//! Snapshots are replaced wholesale by [`EnsembleView::refresh`]; nothing
//! patches them incrementally.

use std::collections::BTreeSet;

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::{ChildWatch, SharedClient, WatchEvent};
use crate::config::{EnsembleTarget, ReadRetryPolicy};
use crate::error::{ClientError, ClientResult, SyncError, SyncResult};

/// Children of one ensemble path at a single point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MembershipSnapshot {
    /// All children, in the order the service listed them.
    pub children: Vec<String>,
    /// Children owned by a live session.
    pub ephemeral: BTreeSet<String>,
    /// Durable children (mirrors).
    pub nonephemeral: BTreeSet<String>,
}

impl MembershipSnapshot {
    /// `children` is exactly the disjoint union of the two partitions.
    pub fn is_consistent(&self) -> bool {
        let all: BTreeSet<&String> = self.children.iter().collect();
        self.ephemeral.is_disjoint(&self.nonephemeral)
            && all.len() == self.children.len()
            && all.len() == self.ephemeral.len() + self.nonephemeral.len()
            && self
                .ephemeral
                .iter()
                .chain(&self.nonephemeral)
                .all(|name| all.contains(name))
    }
}

/// Result of a create or delete that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Applied,
    /// Create found the node already there.
    AlreadyPresent,
    /// Delete found the node already gone.
    AlreadyAbsent,
}

/// Invoked once, from a spawned task, when an armed watch fires.
pub type WatchCallback = Box<dyn FnOnce(WatchEvent) + Send + 'static>;

/// Task waiting on a view's current watch.
///
/// Dropping `_release` retires the task. A watch that has already fired still
/// runs its callback; one that has not is dropped.
struct ArmedWatch {
    task: JoinHandle<()>,
    _release: oneshot::Sender<()>,
}

/// One configured ensemble and its latest membership snapshot.
pub struct EnsembleView {
    name: String,
    target: EnsembleTarget,
    client: SharedClient,
    retry: ReadRetryPolicy,
    snapshot: MembershipSnapshot,
    watch: Option<ArmedWatch>,
}

impl EnsembleView {
    pub fn new(target: EnsembleTarget, client: SharedClient, retry: ReadRetryPolicy) -> Self {
        Self {
            name: target.to_string(),
            target,
            client,
            retry,
            snapshot: MembershipSnapshot::default(),
            watch: None,
        }
    }

    /// `address/path`, used in every log line about this ensemble.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &EnsembleTarget {
        &self.target
    }

    /// The snapshot from the last successful refresh.
    pub fn snapshot(&self) -> &MembershipSnapshot {
        &self.snapshot
    }

    /// Whether a watch armed by a previous refresh is still waiting to fire.
    pub fn has_armed_watch(&self) -> bool {
        self.watch
            .as_ref()
            .is_some_and(|armed| !armed.task.is_finished())
    }

    /// Re-read the children of the target path and replace the snapshot.
    ///
    /// With `on_change`, a one-shot child watch is armed from the same listing
    /// and `on_change` runs once when it fires. A watch armed by an earlier
    /// refresh is retired: if its event already arrived, its callback still
    /// runs, otherwise it never fires.
    ///
    /// A node vanishing mid-read restarts the whole read after
    /// `retry.delay`, indefinitely unless `retry.max_attempts` is set.
    pub async fn refresh(
        &mut self,
        on_change: Option<WatchCallback>,
    ) -> SyncResult<&MembershipSnapshot> {
        let arm = on_change.is_some();
        let mut attempt: u32 = 0;

        let (snapshot, watch) = loop {
            attempt += 1;
            match self.read_once(arm).await {
                Ok(read) => break read,
                Err(e) if e.is_transient() => {
                    warn!(
                        ensemble = %self.name,
                        attempt,
                        error = %e,
                        previous_children = self.snapshot.children.len(),
                        "Node vanished during read, retrying"
                    );
                    if self.retry.max_attempts.is_some_and(|cap| attempt >= cap) {
                        return Err(SyncError::ReadExhausted {
                            ensemble: self.name.clone(),
                            attempts: attempt,
                        });
                    }
                    tokio::time::sleep(self.retry.delay).await;
                }
                Err(e) => return Err(SyncError::client(&self.name, e)),
            }
        };

        self.snapshot = snapshot;
        info!(
            ensemble = %self.name,
            children = self.snapshot.children.len(),
            ephemeral = self.snapshot.ephemeral.len(),
            nonephemeral = self.snapshot.nonephemeral.len(),
            watch = arm,
            "Read ensemble"
        );
        debug!(
            ensemble = %self.name,
            ephemeral = ?self.snapshot.ephemeral,
            nonephemeral = ?self.snapshot.nonephemeral,
            "Snapshot"
        );

        if let (Some(callback), Some(watch)) = (on_change, watch) {
            self.arm(watch, callback);
        }

        Ok(&self.snapshot)
    }

    async fn read_once(&self, arm: bool) -> ClientResult<(MembershipSnapshot, Option<ChildWatch>)> {
        let path = &self.target.path;
        let (children, watch) = if arm {
            let (children, watch) = self.client.list_and_watch_children(path).await?;
            (children, Some(watch))
        } else {
            (self.client.list_children(path).await?, None)
        };

        let mut snapshot = MembershipSnapshot {
            children,
            ..Default::default()
        };
        for child in &snapshot.children {
            let meta = self.client.node_meta(&self.target.child_path(child)).await?;
            if meta.is_ephemeral() {
                snapshot.ephemeral.insert(child.clone());
            } else {
                snapshot.nonephemeral.insert(child.clone());
            }
        }

        Ok((snapshot, watch))
    }

    fn arm(&mut self, watch: ChildWatch, callback: WatchCallback) {
        // Dropping the previous `_release` lets its task finish on its own.
        self.watch.take();

        let (release, released) = oneshot::channel::<()>();
        let name = self.name.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                biased;
                event = watch => {
                    debug!(ensemble = %name, %event, "Watch fired");
                    callback(event);
                }
                _ = released => {
                    debug!(ensemble = %name, "Watch retired unfired");
                }
            }
        });
        self.watch = Some(ArmedWatch {
            task,
            _release: release,
        });
    }

    /// Whether `child` is owned by a live session rather than being a mirror.
    pub async fn is_ephemeral(&self, child: &str) -> SyncResult<bool> {
        self.client
            .node_meta(&self.target.child_path(child))
            .await
            .map(|meta| meta.is_ephemeral())
            .map_err(|e| SyncError::client(&self.name, e))
    }

    /// Create a durable mirror node named `name`.
    pub async fn create(&self, name: &str) -> SyncResult<WriteOutcome> {
        match self.client.create(&self.target.child_path(name), false).await {
            Ok(()) => Ok(WriteOutcome::Applied),
            Err(ClientError::NodeExists(_)) => {
                info!(ensemble = %self.name, node = name, "Mirror already present");
                Ok(WriteOutcome::AlreadyPresent)
            }
            Err(e) => Err(SyncError::client(&self.name, e)),
        }
    }

    /// Delete the child named `name`.
    pub async fn delete(&self, name: &str) -> SyncResult<WriteOutcome> {
        match self.client.delete(&self.target.child_path(name)).await {
            Ok(()) => Ok(WriteOutcome::Applied),
            Err(ClientError::NoNode(_)) => {
                info!(ensemble = %self.name, node = name, "Node already absent");
                Ok(WriteOutcome::AlreadyAbsent)
            }
            Err(e) => Err(SyncError::client(&self.name, e)),
        }
    }

    /// Drop any armed watch and close the session.
    pub async fn close(&mut self) {
        if let Some(armed) = self.watch.take() {
            armed.task.abort();
        }
        self.client.close().await;
        info!(ensemble = %self.name, "Session closed");
    }
}

impl Drop for EnsembleView {
    fn drop(&mut self) {
        if let Some(armed) = self.watch.take() {
            armed.task.abort();
        }
    }
}
