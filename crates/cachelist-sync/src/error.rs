//! Error taxonomy for cache-list synchronization.
//!
//! | Type          | Raised by                  | Handling                          |
//! |---------------|----------------------------|-----------------------------------|
//! | `ClientError` | coordination client calls  | `NoNode` retried, rest propagated |
//! | `ConfigError` | target / env parsing       | fatal, process exits              |
//! | `SyncError`   | `EnsembleView` operations  | logged by the manager, pass aborts|
//!
//! Per-node anomalies during a pass (conflicts, create-on-existing,
//! delete-on-missing) are not errors at all; they are reported through
//! [`crate::view::WriteOutcome`] and [`crate::manager::PassReport`].

use thiserror::Error;

/// Errors surfaced by a [`crate::client::CoordinationClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    /// The node (or its parent, for creates) does not exist.
    #[error("No node: {0}")]
    NoNode(String),

    /// The node already exists.
    #[error("Node exists: {0}")]
    NodeExists(String),

    /// The ensemble could not be reached.
    #[error("Connection failure: {0}")]
    Connection(String),

    /// The session was closed or expired.
    #[error("Session closed")]
    SessionClosed,

    /// Any other backend-specific failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl ClientError {
    /// Whether a read that hit this error should be retried from scratch.
    ///
    /// A missing node while listing or classifying children means the tree
    /// changed underneath the read; re-reading resolves it.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NoNode(_))
    }
}

/// Fatal configuration errors. Any of these aborts startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Target '{0}' is missing a node path (expected ADDR:PORT/PATH)")]
    MissingPath(String),

    #[error("Target '{0}' has an empty ensemble address")]
    EmptyAddress(String),

    #[error("Invalid zk node path '{0}' (should include {namespace})", namespace = crate::config::CACHE_LIST_NAMESPACE)]
    OutsideNamespace(String),

    #[error("Node path '{0}' does not name a cache cluster")]
    MissingClusterName(String),

    #[error("At least two targets are required, got {0}")]
    TooFewTargets(usize),

    #[error("Invalid value for {var}: '{value}'")]
    InvalidEnv { var: &'static str, value: String },
}

/// Errors surfaced by [`crate::view::EnsembleView`] operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A client call failed for a reason other than a transient read anomaly.
    #[error("Ensemble {ensemble}: {source}")]
    Client {
        ensemble: String,
        #[source]
        source: ClientError,
    },

    /// The configured read-attempt cap was reached while the path kept vanishing.
    #[error("Ensemble {ensemble}: read still failing after {attempts} attempts")]
    ReadExhausted { ensemble: String, attempts: u32 },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    pub(crate) fn client(ensemble: impl Into<String>, source: ClientError) -> Self {
        Self::Client {
            ensemble: ensemble.into(),
            source,
        }
    }

    /// Name of the ensemble the error originated from, if any.
    pub fn ensemble(&self) -> Option<&str> {
        match self {
            Self::Client { ensemble, .. } | Self::ReadExhausted { ensemble, .. } => Some(ensemble),
            Self::Config(_) => None,
        }
    }
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Result type for view and manager operations
pub type SyncResult<T> = Result<T, SyncError>;
