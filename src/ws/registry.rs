use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::connctx::{ConnCtx, ConnectionId, ConnectionMode, Outbound};
use super::docsession::{DocumentSession, DocumentUpdate};

pub const MAX_DOCUMENT_ID_LEN: usize = 256;

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("invalid document id {0:?}")]
    InvalidDocumentId(String),
    #[error("session registry is shut down")]
    ShutDown,
}

/// Reject ids that are empty, oversized or carry control characters.
pub fn validate_document_id(document_id: &str) -> Result<(), RegistryError> {
    if document_id.trim().is_empty()
        || document_id.len() > MAX_DOCUMENT_ID_LEN
        || document_id.chars().any(char::is_control)
    {
        return Err(RegistryError::InvalidDocumentId(document_id.chars().take(64).collect()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sessions: usize,
    pub collab_connections: usize,
    pub legacy_connections: usize,
    pub pending_destruction: usize,
    pub awareness_clients: usize,
}

/// Maps document ids to live sessions and owns their lifecycle.
///
/// Construct one per process and hand the `Arc` to every connection handler.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<DocumentSession>>>,
    memberships: Mutex<HashMap<ConnectionId, String>>,
    grace_period: Duration,
    awareness_timeout: Duration,
    updates: broadcast::Sender<DocumentUpdate>,
    shut_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new(grace_period: Duration, awareness_timeout: Duration) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            memberships: Mutex::new(HashMap::new()),
            grace_period,
            awareness_timeout,
            updates,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Stream of merged document changes, for an external persistence collaborator.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<DocumentUpdate> {
        self.updates.subscribe()
    }

    /// Existing session for `document_id`, or a fresh empty one.
    ///
    /// The map is only written under its write lock, so concurrent first calls
    /// for the same id all receive the same session.
    pub async fn get_or_create_session(&self, document_id: &str) -> Result<Arc<DocumentSession>, RegistryError> {
        validate_document_id(document_id)?;
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown);
        }

        if let Some(session) = self.sessions.read().await.get(document_id) {
            return Ok(session.clone());
        }

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(document_id.to_string())
            .or_insert_with(|| {
                info!("Creating session for document {}", document_id);
                Arc::new(DocumentSession::new(document_id, self.awareness_timeout, self.updates.clone()))
            })
            .clone();
        Ok(session)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub async fn session(&self, document_id: &str) -> Option<Arc<DocumentSession>> {
        self.sessions.read().await.get(document_id).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Document the connection is currently joined to.
    pub async fn membership(&self, conn_id: ConnectionId) -> Option<String> {
        self.memberships.lock().await.get(&conn_id).cloned()
    }

    /// Add `conn` to the session for `document_id`, leaving any other session first.
    ///
    /// A session that is being torn down when the join arrives is replaced by a
    /// fresh one instead of rejecting the join.
    pub async fn join_session(self: &Arc<Self>, document_id: &str, conn: &ConnCtx) -> Result<Arc<DocumentSession>, RegistryError> {
        validate_document_id(document_id)?;

        let previous = self.memberships.lock().await.insert(conn.id, document_id.to_string());
        if let Some(previous) = previous.filter(|p| p != document_id) {
            debug!("Connection {} moves from {} to {}", conn.id, previous, document_id);
            self.detach_from(&previous, conn.id).await;
        }

        loop {
            let session = match self.get_or_create_session(document_id).await {
                Ok(session) => session,
                Err(e) => {
                    self.memberships.lock().await.remove(&conn.id);
                    return Err(e);
                }
            };

            let mut state = session.lock().await;
            if state.is_closed() {
                drop(state);
                debug!("Session {} closed during join, recreating", document_id);
                self.evict(&session).await;
                continue;
            }
            state.add_connection(conn.clone());
            info!(
                "Connection {} (user {}) joined document {} ({} connected)",
                conn.id,
                conn.user_id,
                document_id,
                state.connection_count()
            );
            drop(state);
            return Ok(session);
        }
    }

    /// Remove the connection from the session. An empty session is destroyed
    /// after the grace period unless someone joins before then.
    pub async fn leave_session(self: &Arc<Self>, document_id: &str, conn_id: ConnectionId) -> bool {
        {
            let mut memberships = self.memberships.lock().await;
            if memberships.get(&conn_id).map(String::as_str) == Some(document_id) {
                memberships.remove(&conn_id);
            }
        }
        self.detach_from(document_id, conn_id).await
    }

    /// Send `payload` to every member of the session except `exclude`.
    /// Returns how many connections it was queued for.
    pub async fn broadcast(&self, document_id: &str, payload: Outbound, exclude: Option<ConnectionId>) -> usize {
        match self.session(document_id).await {
            Some(session) => session.lock().await.broadcast(payload, exclude),
            None => {
                debug!("Broadcast to unknown document {} dropped", document_id);
                0
            }
        }
    }

    pub async fn stats(&self) -> RegistryStats {
        let sessions: Vec<Arc<DocumentSession>> = self.sessions.read().await.values().cloned().collect();
        let mut stats = RegistryStats { sessions: sessions.len(), ..RegistryStats::default() };
        for session in sessions {
            let state = session.lock().await;
            for conn in state.connections() {
                match conn.mode {
                    ConnectionMode::Collab => stats.collab_connections += 1,
                    ConnectionMode::Legacy => stats.legacy_connections += 1,
                }
            }
            if state.pending_destroy() {
                stats.pending_destruction += 1;
            }
            stats.awareness_clients += state.awareness.len();
        }
        stats
    }

    /// Close every session, cancel pending timers and disconnect all clients.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        let sessions: Vec<Arc<DocumentSession>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &sessions {
            let mut state = session.lock().await;
            if let Some(task) = state.mark_closed() {
                task.abort();
            }
            for conn in state.connections() {
                conn.kick();
            }
        }
        self.memberships.lock().await.clear();
        info!("Session registry shut down ({} sessions closed)", sessions.len());
    }

    async fn detach_from(self: &Arc<Self>, document_id: &str, conn_id: ConnectionId) -> bool {
        let Some(session) = self.session(document_id).await else {
            return false;
        };

        let mut state = session.lock().await;
        let removed = state.remove_connection(conn_id).is_some();
        if state.connection_count() == 0 && !state.is_closed() && !state.pending_destroy() {
            debug!("Session {} is empty, destroying in {:?}", document_id, self.grace_period);
            let task = self.schedule_destroy(session.clone());
            state.set_destroy_task(task);
        }
        removed
    }

    fn schedule_destroy(self: &Arc<Self>, session: Arc<DocumentSession>) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            tokio::time::sleep(grace_period).await;
            if let Some(registry) = registry.upgrade() {
                registry.destroy_if_idle(&session).await;
            }
        })
    }

    async fn destroy_if_idle(&self, session: &Arc<DocumentSession>) {
        let mut state = session.lock().await;
        if state.connection_count() > 0 || state.is_closed() {
            return;
        }
        // This runs inside the timer task, so its handle is dropped, not aborted.
        drop(state.mark_closed());
        drop(state);
        self.evict(session).await;
    }

    async fn evict(&self, session: &Arc<DocumentSession>) {
        let mut sessions = self.sessions.write().await;
        let is_current = sessions
            .get(&session.document_id)
            .map(|current| Arc::ptr_eq(current, session))
            .unwrap_or(false);
        if is_current {
            sessions.remove(&session.document_id);
            info!("Destroyed session for document {}", session.document_id);
        } else {
            warn!("Session for {} was already replaced", session.document_id);
        }
    }
}
