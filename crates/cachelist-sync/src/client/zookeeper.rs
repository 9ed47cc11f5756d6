//! ZooKeeper sessions via the `zookeeper-client` crate.
//!
//! An expired session is replaced on the next call, so a pass that failed on
//! the dead session is followed by one that reads through a fresh session.

use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, info, warn};
use zookeeper_client as zk;

use super::session::{Session, SessionSlot};
use super::{ChildWatch, CoordinationClient, NodeMeta, WatchEvent, WatchEventKind};
use crate::error::{ClientError, ClientResult};

/// One logical ZooKeeper session, reconnected after expiry.
pub struct ZkClient {
    address: String,
    session: Arc<SessionSlot<zk::Client>>,
}

async fn open_session(address: &str) -> ClientResult<zk::Client> {
    let client = zk::Client::connect(address)
        .await
        .map_err(|e| ClientError::Connection(format!("{address}: {e}")))?;
    info!(ensemble = address, "ZooKeeper session established");
    Ok(client)
}

impl ZkClient {
    /// Connect to `address` (`host:port[,host:port]`).
    pub async fn connect(address: &str) -> ClientResult<Self> {
        let client = open_session(address).await?;
        Ok(Self {
            address: address.to_string(),
            session: Arc::new(SessionSlot::new(client)),
        })
    }

    async fn client(&self) -> ClientResult<Session<zk::Client>> {
        self.session.get(|| open_session(&self.address)).await
    }

    /// Map a call result, retiring the session if the server dropped it.
    async fn settle<T>(
        &self,
        session: &Session<zk::Client>,
        path: &str,
        result: Result<T, zk::Error>,
    ) -> ClientResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                if is_session_loss(&err) && self.session.expire(session.generation).await {
                    warn!(
                        ensemble = %self.address,
                        error = %err,
                        "ZooKeeper session lost, reconnecting on next call"
                    );
                }
                Err(map_error(path, err))
            }
        }
    }
}

fn is_session_loss(err: &zk::Error) -> bool {
    matches!(err, zk::Error::SessionExpired | zk::Error::ClientClosed)
}

fn map_error(path: &str, err: zk::Error) -> ClientError {
    match err {
        zk::Error::NoNode => ClientError::NoNode(path.to_string()),
        zk::Error::NodeExists => ClientError::NodeExists(path.to_string()),
        zk::Error::ConnectionLoss => ClientError::Connection(err.to_string()),
        zk::Error::SessionExpired | zk::Error::ClientClosed => ClientError::SessionClosed,
        other => ClientError::Backend(other.to_string()),
    }
}

fn map_event(event: zk::WatchedEvent) -> WatchEvent {
    let kind = match event.event_type {
        zk::EventType::NodeChildrenChanged => WatchEventKind::ChildrenChanged,
        zk::EventType::NodeCreated => WatchEventKind::NodeCreated,
        zk::EventType::NodeDeleted => WatchEventKind::NodeDeleted,
        zk::EventType::NodeDataChanged => WatchEventKind::DataChanged,
        _ => WatchEventKind::Session,
    };
    WatchEvent::new(event.path, kind)
}

#[async_trait]
impl CoordinationClient for ZkClient {
    async fn list_children(&self, path: &str) -> ClientResult<Vec<String>> {
        let session = self.client().await?;
        let result = session.client.list_children(path).await;
        self.settle(&session, path, result).await
    }

    async fn list_and_watch_children(&self, path: &str) -> ClientResult<(Vec<String>, ChildWatch)> {
        let session = self.client().await?;
        let result = session.client.list_and_watch_children(path).await;
        let (children, watcher) = self.settle(&session, path, result).await?;

        // A session-level event means the watch died with its session: retire
        // it so the pass this event triggers reconnects first.
        let slot = self.session.clone();
        let generation = session.generation;
        let watch = async move {
            let event = watcher.changed().await;
            if matches!(
                event.session_state,
                zk::SessionState::Expired | zk::SessionState::Closed
            ) {
                slot.expire(generation).await;
            }
            map_event(event)
        }
        .boxed();
        Ok((children, watch))
    }

    async fn node_meta(&self, path: &str) -> ClientResult<NodeMeta> {
        let session = self.client().await?;
        let result = session.client.check_stat(path).await;
        let stat = self
            .settle(&session, path, result)
            .await?
            .ok_or_else(|| ClientError::NoNode(path.to_string()))?;
        Ok(NodeMeta {
            owner_session: (stat.ephemeral_owner != 0).then_some(stat.ephemeral_owner),
        })
    }

    async fn create(&self, path: &str, ephemeral: bool) -> ClientResult<()> {
        let mode = if ephemeral {
            zk::CreateMode::Ephemeral
        } else {
            zk::CreateMode::Persistent
        };
        let options = mode.with_acls(zk::Acls::anyone_all());
        let session = self.client().await?;
        let result = session.client.create(path, &[], &options).await;
        self.settle(&session, path, result).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> ClientResult<()> {
        let session = self.client().await?;
        let result = session.client.delete(path, None).await;
        self.settle(&session, path, result).await
    }

    async fn close(&self) {
        if self.session.close().await.is_some() {
            debug!(ensemble = %self.address, "Closing ZooKeeper session");
        }
    }
}
