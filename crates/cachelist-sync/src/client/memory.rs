//! In-process ensemble with the ZooKeeper semantics the synchronizer relies on.
//!
//! - a node's parent must exist before the node can be created
//! - ephemeral nodes belong to the creating session and vanish when it closes
//! - child watches are one-shot and fire on child create/delete, or with
//!   `NodeDeleted` when the watched node itself goes away
//!
//! Several [`MemorySession`]s can share one [`MemoryEnsemble`], which is how
//! tests model "a cache server announcing itself" next to "the synchronizer".

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::oneshot;
use tracing::trace;

use super::{ChildWatch, CoordinationClient, NodeMeta, WatchEvent, WatchEventKind};
use crate::error::{ClientError, ClientResult};

/// Successful mutations applied to an ensemble, across all sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationCounts {
    pub creates: u64,
    pub deletes: u64,
}

struct PendingWatch {
    session: i64,
    sender: oneshot::Sender<WatchEvent>,
}

#[derive(Default)]
struct TreeState {
    /// path -> owning session (None for persistent nodes)
    nodes: BTreeMap<String, Option<i64>>,
    child_watches: HashMap<String, Vec<PendingWatch>>,
    next_session: i64,
    closed_sessions: BTreeSet<i64>,
    missing_reads: u32,
    counts: OperationCounts,
}

impl TreeState {
    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children_of(&self, path: &str) -> Vec<String> {
        self.nodes
            .keys()
            .filter(|candidate| parent_of(candidate) == Some(path))
            .map(|candidate| node_name(candidate).to_string())
            .collect()
    }

    fn fire(&mut self, watched: &str, kind: WatchEventKind) {
        if let Some(pending) = self.child_watches.remove(watched) {
            trace!(path = watched, count = pending.len(), %kind, "Firing child watches");
            for watch in pending {
                let _ = watch.sender.send(WatchEvent::new(watched, kind));
            }
        }
    }

    fn remove_node(&mut self, path: &str) {
        self.nodes.remove(path);
        self.counts.deletes += 1;
        if let Some(parent) = parent_of(path) {
            let parent = parent.to_string();
            self.fire(&parent, WatchEventKind::ChildrenChanged);
        }
        self.fire(path, WatchEventKind::NodeDeleted);
    }
}

fn parent_of(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rsplit_once('/') {
        Some(("", _)) => Some("/"),
        Some((parent, _)) => Some(parent),
        None => None,
    }
}

fn node_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

/// Shared in-memory node tree. Cheap to clone; clones see the same tree.
#[derive(Clone, Default)]
pub struct MemoryEnsemble {
    state: Arc<Mutex<TreeState>>,
}

impl MemoryEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a new session against this ensemble.
    pub fn session(&self) -> MemorySession {
        let mut state = self.lock();
        state.next_session += 1;
        MemorySession {
            ensemble: self.clone(),
            id: 0x1000 + state.next_session,
        }
    }

    /// Create `path` and any missing ancestors as persistent nodes.
    pub fn ensure_path(&self, path: &str) {
        let mut state = self.lock();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            if !state.exists(&current) {
                state.nodes.insert(current.clone(), None);
                if let Some(parent) = parent_of(&current) {
                    let parent = parent.to_string();
                    state.fire(&parent, WatchEventKind::ChildrenChanged);
                }
            }
        }
    }

    /// Make the next `count` metadata reads fail with `NoNode`, as if the
    /// child vanished between listing and classification.
    pub fn inject_missing_reads(&self, count: u32) {
        self.lock().missing_reads = count;
    }

    pub fn operation_counts(&self) -> OperationCounts {
        self.lock().counts
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().exists(path)
    }

    /// Child names of `path` owned by some session.
    pub fn ephemeral_children(&self, path: &str) -> BTreeSet<String> {
        self.children_matching(path, true)
    }

    /// Child names of `path` not owned by any session.
    pub fn persistent_children(&self, path: &str) -> BTreeSet<String> {
        self.children_matching(path, false)
    }

    fn children_matching(&self, path: &str, ephemeral: bool) -> BTreeSet<String> {
        let state = self.lock();
        state
            .children_of(path)
            .into_iter()
            .filter(|name| {
                let child = format!("{}/{}", path.trim_end_matches('/'), name);
                state
                    .nodes
                    .get(&child)
                    .is_some_and(|owner| owner.is_some() == ephemeral)
            })
            .collect()
    }

    /// Number of child watches on `path` that can still be delivered.
    pub fn armed_watches(&self, path: &str) -> usize {
        self.lock().child_watches.get(path).map_or(0, |pending| {
            pending
                .iter()
                .filter(|watch| !watch.sender.is_closed())
                .count()
        })
    }

    /// Watch registrations held for `path`, delivered or not.
    #[cfg(test)]
    fn registered_watches(&self, path: &str) -> usize {
        self.lock().child_watches.get(path).map_or(0, Vec::len)
    }
}

/// One client session on a [`MemoryEnsemble`].
#[derive(Clone)]
pub struct MemorySession {
    ensemble: MemoryEnsemble,
    id: i64,
}

impl MemorySession {
    pub fn id(&self) -> i64 {
        self.id
    }

    fn open_state(&self) -> ClientResult<MutexGuard<'_, TreeState>> {
        let state = self.ensemble.lock();
        if state.closed_sessions.contains(&self.id) {
            return Err(ClientError::SessionClosed);
        }
        Ok(state)
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    async fn list_children(&self, path: &str) -> ClientResult<Vec<String>> {
        let state = self.open_state()?;
        if !state.exists(path) {
            return Err(ClientError::NoNode(path.to_string()));
        }
        Ok(state.children_of(path))
    }

    async fn list_and_watch_children(&self, path: &str) -> ClientResult<(Vec<String>, ChildWatch)> {
        let mut state = self.open_state()?;
        if !state.exists(path) {
            return Err(ClientError::NoNode(path.to_string()));
        }
        let children = state.children_of(path);

        let (sender, receiver) = oneshot::channel();
        let pending = state.child_watches.entry(path.to_string()).or_default();
        // Watches whose receiver is gone can never be delivered.
        pending.retain(|watch| !watch.sender.is_closed());
        pending.push(PendingWatch {
            session: self.id,
            sender,
        });

        let watch = async move {
            match receiver.await {
                Ok(event) => event,
                // Dropped with its session: never fires.
                Err(_) => futures::future::pending().await,
            }
        }
        .boxed();

        Ok((children, watch))
    }

    async fn node_meta(&self, path: &str) -> ClientResult<NodeMeta> {
        let mut state = self.open_state()?;
        if state.missing_reads > 0 {
            state.missing_reads -= 1;
            return Err(ClientError::NoNode(path.to_string()));
        }
        match state.nodes.get(path) {
            Some(owner) => Ok(NodeMeta {
                owner_session: *owner,
            }),
            None if path == "/" => Ok(NodeMeta::default()),
            None => Err(ClientError::NoNode(path.to_string())),
        }
    }

    async fn create(&self, path: &str, ephemeral: bool) -> ClientResult<()> {
        let mut state = self.open_state()?;
        if state.exists(path) {
            return Err(ClientError::NodeExists(path.to_string()));
        }
        let parent = parent_of(path)
            .ok_or_else(|| ClientError::Backend(format!("Bad path: {path}")))?
            .to_string();
        if !state.exists(&parent) {
            return Err(ClientError::NoNode(parent));
        }
        if state.nodes.get(&parent).is_some_and(Option::is_some) {
            return Err(ClientError::Backend(format!(
                "Ephemeral nodes may not have children: {parent}"
            )));
        }

        state
            .nodes
            .insert(path.to_string(), ephemeral.then_some(self.id));
        state.counts.creates += 1;
        state.fire(&parent, WatchEventKind::ChildrenChanged);
        Ok(())
    }

    async fn delete(&self, path: &str) -> ClientResult<()> {
        let mut state = self.open_state()?;
        if !state.nodes.contains_key(path) {
            return Err(ClientError::NoNode(path.to_string()));
        }
        if !state.children_of(path).is_empty() {
            return Err(ClientError::Backend(format!("Directory not empty: {path}")));
        }
        state.remove_node(path);
        Ok(())
    }

    async fn close(&self) {
        let mut state = self.ensemble.lock();
        if !state.closed_sessions.insert(self.id) {
            return;
        }

        let owned: Vec<String> = state
            .nodes
            .iter()
            .filter(|(_, owner)| **owner == Some(self.id))
            .map(|(path, _)| path.clone())
            .collect();
        for path in owned {
            state.remove_node(&path);
        }

        for pending in state.child_watches.values_mut() {
            pending.retain(|watch| watch.session != self.id);
        }
        state.child_watches.retain(|_, pending| !pending.is_empty());
    }
}
