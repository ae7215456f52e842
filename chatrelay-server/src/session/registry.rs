//! Live connection to session mapping.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{Mutex, MutexGuard, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use shared::models::OutboundEvent;

use super::state::Session;

/// Opaque handle identifying one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A registered session: its state, its outbound queue and the token that
/// cancels whatever turn it is running.
#[derive(Debug)]
pub struct SessionHandle {
    id: ConnectionId,
    state: Mutex<Session>,
    cancel: CancellationToken,
    outbound: mpsc::Sender<OutboundEvent>,
}

impl SessionHandle {
    fn new(outbound: mpsc::Sender<OutboundEvent>) -> Self {
        Self {
            id: ConnectionId::new(),
            state: Mutex::new(Session::new()),
            cancel: CancellationToken::new(),
            outbound,
        }
    }

    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn state(&self) -> MutexGuard<'_, Session> {
        self.state.lock().await
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }

    /// Queues an event for the client. Returns `false` once the connection
    /// is gone.
    pub async fn send(&self, event: OutboundEvent) -> bool {
        if self.cancel.is_cancelled() {
            return false;
        }
        self.outbound.send(event).await.is_ok()
    }
}

/// Process-wide registry of live sessions.
///
/// None of the operations await; the lock is never held across a suspension
/// point.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, outbound: mpsc::Sender<OutboundEvent>) -> Arc<SessionHandle> {
        let handle = Arc::new(SessionHandle::new(outbound));
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(handle.id, Arc::clone(&handle));
        metrics::gauge!("chatrelay_active_sessions").set(sessions.len() as f64);
        debug!(connection = %handle.id, "session created");
        handle
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<Arc<SessionHandle>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Removes a session and cancels its in-flight work. Safe to call more
    /// than once; returns whether this call removed it.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            let removed = sessions.remove(&id);
            metrics::gauge!("chatrelay_active_sessions").set(sessions.len() as f64);
            removed
        };

        match removed {
            Some(handle) => {
                handle.cancel.cancel();
                debug!(connection = %id, "session removed");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
