//! Cache-list membership synchronizer
//!
//! Several independent ZooKeeper ensembles each host a cache-list path such
//! as `/arcus/cache_list/<cluster>`. Cache servers announce themselves there
//! with ephemeral nodes. This crate keeps, on every ensemble, a durable
//! mirror node for each server announced on any *other* ensemble, and removes
//! mirrors whose announcement is gone.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │               ReconciliationManager                  │
//! │  • one pass at a time (async mutex)                  │
//! │  • read → plan → create → delete → re-arm            │
//! │  • watch events queue the next pass                  │
//! └──────────────┬──────────────┬──────────────┬─────────┘
//!                ▼              ▼              ▼
//!          EnsembleView   EnsembleView   EnsembleView
//!                │              │              │
//!         CoordinationClient (ZooKeeper / in-memory)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use cachelist_sync::{EnsembleView, ReconciliationManager, SyncConfig, Trigger};
//! use cachelist_sync::client::memory::MemoryEnsemble;
//!
//! let config = SyncConfig::from_env()?.with_targets([
//!     "zk1:2181/arcus/cache_list/cloud_1",
//!     "zk2:2181/arcus/cache_list/cloud_1",
//! ])?;
//!
//! let mut manager = ReconciliationManager::new(&config);
//! for target in &config.targets {
//!     let ensemble = MemoryEnsemble::new();
//!     ensemble.ensure_path(&target.path);
//!     manager.append(EnsembleView::new(
//!         target.clone(),
//!         Arc::new(ensemble.session()),
//!         config.read_retry,
//!     ));
//! }
//!
//! let manager = manager.shared();
//! tokio::spawn(manager.clone().run());
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod reconcile;
pub mod view;

pub use client::{CoordinationClient, NodeMeta, SharedClient, WatchEvent, WatchEventKind};
pub use config::{EnsembleTarget, ReadRetryPolicy, SyncConfig, CACHE_LIST_NAMESPACE};
pub use error::{ClientError, ConfigError, SyncError};
pub use manager::{
    PassOutcome, PassReport, ReconciliationManager, SharedReconciliationManager, Trigger,
};
pub use reconcile::{plan, ReconcilePlan};
pub use view::{EnsembleView, MembershipSnapshot, WriteOutcome};
