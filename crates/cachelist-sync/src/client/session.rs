//! Reconnecting session holder for network backends.
//!
//! A [`SessionSlot`] hands out the current session and replaces it once a
//! caller reports it expired. Every session carries a generation so a late
//! expiry report for an old session never drops its replacement.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Mutex;

use crate::error::{ClientError, ClientResult};

/// A session handed out by [`SessionSlot::get`].
#[derive(Debug, Clone)]
pub(crate) struct Session<C> {
    pub generation: u64,
    pub client: C,
}

struct SlotState<C> {
    current: Option<C>,
    generation: u64,
}

pub(crate) struct SessionSlot<C> {
    state: Mutex<SlotState<C>>,
    closed: AtomicBool,
}

impl<C: Clone> SessionSlot<C> {
    pub fn new(client: C) -> Self {
        Self {
            state: Mutex::new(SlotState {
                current: Some(client),
                generation: 1,
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// The live session, connecting a new one through `connect` if the last
    /// one expired. Fails with `SessionClosed` after [`SessionSlot::close`].
    pub async fn get<F, Fut>(&self, connect: F) -> ClientResult<Session<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ClientResult<C>>,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ClientError::SessionClosed);
        }
        let mut state = self.state.lock().await;
        if state.current.is_none() {
            state.current = Some(connect().await?);
            state.generation += 1;
        }
        match &state.current {
            Some(client) => Ok(Session {
                generation: state.generation,
                client: client.clone(),
            }),
            None => Err(ClientError::SessionClosed),
        }
    }

    /// Drop session `generation` so the next [`SessionSlot::get`] reconnects.
    /// Returns false if that session was already replaced.
    pub async fn expire(&self, generation: u64) -> bool {
        let mut state = self.state.lock().await;
        if state.generation != generation || state.current.is_none() {
            return false;
        }
        state.current = None;
        true
    }

    /// Close for good; no further reconnects.
    pub async fn close(&self) -> Option<C> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.lock().await.current.take()
    }
}
