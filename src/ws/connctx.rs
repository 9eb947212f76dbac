use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// Identity of one transport-level socket.
pub type ConnectionId = Uuid;

/// User label applied when the handshake carries no `userId`.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Which protocol a connection speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Binary CRDT sync + awareness frames.
    Collab,
    /// JSON `join_document` / `cursor_position` messages.
    Legacy,
}

/// A frame queued for a connection's writer task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Text(String),
}

impl Outbound {
    /// Binary frames only reach collab connections, text frames only legacy ones.
    pub fn is_for(&self, mode: ConnectionMode) -> bool {
        matches!(
            (self, mode),
            (Outbound::Binary(_), ConnectionMode::Collab) | (Outbound::Text(_), ConnectionMode::Legacy)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendFault {
    #[error("outbound queue is full")]
    Full,
    #[error("connection is closed")]
    Closed,
}

/// Handle to one connected client, cloned into every session it joins.
#[derive(Clone, Debug)]
pub struct ConnCtx {
    pub id: ConnectionId,
    pub user_id: String,
    pub mode: ConnectionMode,
    tx: mpsc::Sender<Outbound>,
    kick: Arc<Notify>,
}

impl ConnCtx {
    /// Create a handle together with the receiving end its writer task drains.
    pub fn new(user_id: Option<String>, mode: ConnectionMode, buffer: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let user_id = user_id
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| ANONYMOUS_USER.to_string());
        let ctx = Self {
            id: Uuid::new_v4(),
            user_id,
            mode,
            tx,
            kick: Arc::new(Notify::new()),
        };
        (ctx, rx)
    }

    /// Same socket, relabelled with another user id.
    pub fn with_user(&self, user_id: Option<String>) -> Self {
        let mut ctx = self.clone();
        if let Some(user_id) = user_id.filter(|u| !u.trim().is_empty()) {
            ctx.user_id = user_id;
        }
        ctx
    }

    /// Queue a frame without waiting for the socket.
    pub fn try_send(&self, msg: Outbound) -> Result<(), SendFault> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendFault::Full,
            mpsc::error::TrySendError::Closed(_) => SendFault::Closed,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Ask the owning handler to close this connection.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Resolves once `kick` has been called.
    pub async fn kicked(&self) {
        self.kick.notified().await
    }
}
