//! Coordination-service client seam.
//!
//! The synchronizer only needs a handful of calls against one ensemble:
//! list children (optionally arming a one-shot child watch), read a node's
//! owner session, create and delete nodes. [`CoordinationClient`] captures
//! exactly that, so the reconciliation logic never touches a wire protocol.
//!
//! Implementations:
//! - [`memory::MemoryEnsemble`]: in-process tree with ZooKeeper semantics
//! - `zookeeper::ZkClient`: real ensembles via `zookeeper-client`
//!   (behind the `zookeeper` feature)

pub mod memory;
#[cfg(any(feature = "zookeeper", test))]
pub(crate) mod session;
#[cfg(feature = "zookeeper")]
pub mod zookeeper;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;

use crate::error::ClientResult;

/// Node metadata the synchronizer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeMeta {
    /// Session owning the node. `Some` only for ephemeral nodes.
    pub owner_session: Option<i64>,
}

impl NodeMeta {
    pub fn is_ephemeral(&self) -> bool {
        self.owner_session.is_some()
    }
}

/// What a fired watch observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    ChildrenChanged,
    NodeCreated,
    NodeDeleted,
    DataChanged,
    /// Session state change (disconnect, expiry) delivered instead of a node event.
    Session,
}

impl fmt::Display for WatchEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChildrenChanged => write!(f, "children_changed"),
            Self::NodeCreated => write!(f, "node_created"),
            Self::NodeDeleted => write!(f, "node_deleted"),
            Self::DataChanged => write!(f, "data_changed"),
            Self::Session => write!(f, "session"),
        }
    }
}

/// Opaque event handed to a watch callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

impl WatchEvent {
    pub fn new(path: impl Into<String>, kind: WatchEventKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

impl fmt::Display for WatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.path)
    }
}

/// One-shot child watch: resolves once, on the next change.
pub type ChildWatch = BoxFuture<'static, WatchEvent>;

/// Shared reference to a client session
pub type SharedClient = Arc<dyn CoordinationClient>;

/// The calls the synchronizer makes against one ensemble session.
///
/// All paths are absolute. Errors use [`crate::error::ClientError`] so callers
/// can tell a vanished node apart from a dead session.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Child names of `path`, in the order the service returns them.
    async fn list_children(&self, path: &str) -> ClientResult<Vec<String>>;

    /// Child names of `path`, plus a watch that fires on the next child-set change.
    async fn list_and_watch_children(&self, path: &str) -> ClientResult<(Vec<String>, ChildWatch)>;

    /// Metadata of the node at `path`.
    async fn node_meta(&self, path: &str) -> ClientResult<NodeMeta>;

    /// Create an empty node. `ephemeral` binds it to this session.
    async fn create(&self, path: &str, ephemeral: bool) -> ClientResult<()>;

    /// Delete the node at `path`, any version.
    async fn delete(&self, path: &str) -> ClientResult<()>;

    /// Close the session. Ephemeral nodes it owns go away.
    async fn close(&self);
}
