use std::collections::{HashMap, HashSet};
use std::time::Duration;
use loro::VersionVector;
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::models::SendMessage;
use super::awareness::{AwarenessStore, AwarenessUpdate, PresenceChange};
use super::connctx::{ConnCtx, ConnectionId, ConnectionMode, Outbound, SendFault};
use super::crdt::{CrdtDocument, MergeError};
use super::protocol::{encode_awareness, encode_step1, encode_step2, encode_update};

/// A merged change, published for collaborators outside the session (e.g. persistence).
#[derive(Clone, Debug)]
pub struct DocumentUpdate {
    pub document_id: String,
    pub update: Vec<u8>,
    pub origin: ConnectionId,
}

/// In-memory collaboration context for one document.
#[derive(Debug)]
pub struct DocumentSession {
    pub document_id: String,
    state: Mutex<SessionState>,
}

impl DocumentSession {
    pub(crate) fn new(document_id: &str, awareness_timeout: Duration, updates: broadcast::Sender<DocumentUpdate>) -> Self {
        Self {
            document_id: document_id.to_string(),
            state: Mutex::new(SessionState {
                document_id: document_id.to_string(),
                doc: CrdtDocument::new(),
                awareness: AwarenessStore::new(),
                connections: HashMap::new(),
                awareness_clients: HashMap::new(),
                destroy_task: None,
                closed: false,
                awareness_timeout,
                updates,
            }),
        }
    }

    /// All mutation of a session goes through this lock, which serializes
    /// merges and fan-out for the document.
    pub async fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().await
    }
}

#[derive(Debug)]
pub struct SessionState {
    document_id: String,
    pub doc: CrdtDocument,
    pub awareness: AwarenessStore,
    connections: HashMap<ConnectionId, ConnCtx>,
    /// Awareness client ids announced over each connection.
    awareness_clients: HashMap<ConnectionId, HashSet<u64>>,
    destroy_task: Option<JoinHandle<()>>,
    closed: bool,
    awareness_timeout: Duration,
    updates: broadcast::Sender<DocumentUpdate>,
}

impl SessionState {
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn connections(&self) -> impl Iterator<Item = &ConnCtx> {
        self.connections.values()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_destroy(&self) -> bool {
        self.destroy_task.is_some()
    }

    pub(crate) fn add_connection(&mut self, conn: ConnCtx) {
        if let Some(task) = self.destroy_task.take() {
            debug!("Cancelling scheduled destruction of session {}", self.document_id);
            task.abort();
        }
        self.connections.insert(conn.id, conn);
    }

    pub(crate) fn set_destroy_task(&mut self, task: JoinHandle<()>) {
        if let Some(previous) = self.destroy_task.replace(task) {
            previous.abort();
        }
    }

    /// Mark the session dead. The pending destroy timer, if any, is handed back
    /// so the caller decides whether to abort it.
    pub(crate) fn mark_closed(&mut self) -> Option<JoinHandle<()>> {
        self.closed = true;
        self.destroy_task.take()
    }

    /// Remove a connection and tell the remaining peers it is gone.
    pub(crate) fn remove_connection(&mut self, id: ConnectionId) -> Option<ConnCtx> {
        let (conn, departures) = self.detach(id)?;
        for frame in departures {
            self.broadcast(frame, None);
        }
        Some(conn)
    }

    /// Drop a connection and its presence, returning the frames that announce the departure.
    fn detach(&mut self, id: ConnectionId) -> Option<(ConnCtx, Vec<Outbound>)> {
        let conn = self.connections.remove(&id)?;
        let mut departures = Vec::new();

        if let Some(clients) = self.awareness_clients.remove(&id) {
            let removed = self.awareness.remove_clients(clients, Instant::now());
            if !removed.is_empty() {
                departures.push(Outbound::Binary(encode_awareness(&removed)));
            }
        }
        if conn.mode == ConnectionMode::Legacy {
            departures.push(Outbound::Text(SendMessage::user_left(&self.document_id, &conn.user_id).to_json()));
        }

        info!(
            "Connection {} (user {}) left document {} ({} remaining)",
            id,
            conn.user_id,
            self.document_id,
            self.connections.len()
        );
        Some((conn, departures))
    }

    /// Send `payload` to every matching connection except `exclude`.
    ///
    /// Closed connections are removed silently. Connections whose queue is full
    /// are removed and kicked rather than stalling the session. Returns the
    /// number of connections the payload was queued for.
    pub fn broadcast(&mut self, payload: Outbound, exclude: Option<ConnectionId>) -> usize {
        let mut delivered = 0;
        let mut pending = vec![(payload, exclude)];

        while let Some((payload, exclude)) = pending.pop() {
            let mut faulty = Vec::new();
            for conn in self.connections.values() {
                if Some(conn.id) == exclude || !payload.is_for(conn.mode) {
                    continue;
                }
                match conn.try_send(payload.clone()) {
                    Ok(()) => delivered += 1,
                    Err(SendFault::Closed) => {
                        debug!("Skipping closed connection {} on document {}", conn.id, self.document_id);
                        faulty.push(conn.id);
                    }
                    Err(SendFault::Full) => {
                        warn!("Dropping unresponsive connection {} from document {}", conn.id, self.document_id);
                        conn.kick();
                        faulty.push(conn.id);
                    }
                }
            }
            for id in faulty {
                if let Some((_, departures)) = self.detach(id) {
                    pending.extend(departures.into_iter().map(|frame| (frame, None)));
                }
            }
        }
        delivered
    }

    /// Frames a collab connection receives right after joining: our state
    /// vector, and the presence of everyone already here.
    pub fn welcome_frames(&self) -> Vec<Outbound> {
        let mut frames = vec![Outbound::Binary(encode_step1(&self.doc.encode_state_vector()))];
        let states = self.awareness.states();
        if !states.is_empty() {
            frames.push(Outbound::Binary(encode_awareness(&states)));
        }
        frames
    }

    /// Step 2 frame answering a peer's state vector.
    pub fn answer_step1(&self, peer_version: &VersionVector) -> Result<Outbound, MergeError> {
        let missing = self.doc.diff_since(peer_version)?;
        Ok(Outbound::Binary(encode_step2(&missing)))
    }

    /// Merge an update from `origin` and fan the new part out to everyone else.
    /// Returns whether the document changed.
    pub fn apply_update(&mut self, origin: ConnectionId, update: &[u8]) -> Result<bool, MergeError> {
        let Some(diff) = self.doc.apply_update(update)? else {
            return Ok(false);
        };

        let peers = self.broadcast(Outbound::Binary(encode_update(&diff)), Some(origin));
        debug!("Merged {} byte update into {}, relayed to {} peer(s)", diff.len(), self.document_id, peers);

        // No subscribers is the normal case.
        let _ = self.updates.send(DocumentUpdate {
            document_id: self.document_id.clone(),
            update: diff,
            origin,
        });
        Ok(true)
    }

    /// Merge presence from `origin`, relay what was accepted, then sweep stale entries.
    /// Returns the number of accepted entries.
    pub fn apply_awareness(&mut self, origin: ConnectionId, update: &AwarenessUpdate) -> usize {
        let now = Instant::now();
        let (applied, changes) = self.awareness.apply_update(update, now);

        for (client_id, change) in &changes {
            match change {
                PresenceChange::Added | PresenceChange::Updated => {
                    self.awareness_clients.entry(origin).or_default().insert(*client_id);
                }
                PresenceChange::Removed => {
                    if let Some(clients) = self.awareness_clients.get_mut(&origin) {
                        clients.remove(client_id);
                    }
                }
            }
        }
        if !applied.is_empty() {
            self.broadcast(Outbound::Binary(encode_awareness(&applied)), Some(origin));
        }

        let outdated = self.awareness.remove_outdated(now, self.awareness_timeout);
        if !outdated.is_empty() {
            debug!("Expired {} stale presence entries on {}", outdated.clients.len(), self.document_id);
            for clients in self.awareness_clients.values_mut() {
                for entry in &outdated.clients {
                    clients.remove(&entry.client_id);
                }
            }
            self.broadcast(Outbound::Binary(encode_awareness(&outdated)), None);
        }

        applied.clients.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::awareness::AwarenessEntry;
    use crate::ws::protocol::{CollabMessage, SyncMessage};
    use loro::{ExportMode, LoroDoc};
    use serde_json::json;
    use tokio::sync::mpsc;

    fn session() -> DocumentSession {
        let (tx, _) = broadcast::channel(16);
        DocumentSession::new("doc-1", Duration::from_secs(30), tx)
    }

    fn member(mode: ConnectionMode, buffer: usize) -> (ConnCtx, mpsc::Receiver<Outbound>) {
        ConnCtx::new(Some("u".to_string()), mode, buffer)
    }

    fn edit(text: &str) -> Vec<u8> {
        let doc = LoroDoc::new();
        doc.get_text("text").insert(0, text).unwrap();
        doc.commit();
        doc.export(ExportMode::all_updates()).unwrap()
    }

    fn presence(client_id: u64, clock: u32) -> AwarenessUpdate {
        AwarenessUpdate {
            clients: vec![AwarenessEntry { client_id, clock, state: Some(json!({"cursor": clock})) }],
        }
    }

    #[tokio::test]
    async fn update_is_relayed_without_echo() {
        let session = session();
        let (x, mut rx_x) = member(ConnectionMode::Collab, 8);
        let (y, mut rx_y) = member(ConnectionMode::Collab, 8);
        let mut state = session.lock().await;
        state.add_connection(x.clone());
        state.add_connection(y.clone());

        assert!(state.apply_update(x.id, &edit("hi")).unwrap());

        match rx_y.try_recv().unwrap() {
            Outbound::Binary(frame) => assert!(matches!(
                CollabMessage::decode(&frame).unwrap(),
                CollabMessage::Sync(SyncMessage::Update(_))
            )),
            other => panic!("unexpected {:?}", other),
        }
        assert!(rx_x.try_recv().is_err());
    }

    #[tokio::test]
    async fn bad_update_is_not_relayed() {
        let session = session();
        let (x, _rx_x) = member(ConnectionMode::Collab, 8);
        let (y, mut rx_y) = member(ConnectionMode::Collab, 8);
        let mut state = session.lock().await;
        state.add_connection(x.clone());
        state.add_connection(y);

        assert!(state.apply_update(x.id, b"garbage").is_err());
        assert!(rx_y.try_recv().is_err());
        assert!(state.doc.is_empty());
    }

    #[tokio::test]
    async fn full_queue_drops_connection() {
        let session = session();
        let (x, _rx_x) = member(ConnectionMode::Collab, 8);
        let (slow, _rx_slow) = member(ConnectionMode::Collab, 1);
        let mut state = session.lock().await;
        state.add_connection(x.clone());
        state.add_connection(slow.clone());

        state.apply_update(x.id, &edit("a")).unwrap();
        state.apply_update(x.id, &edit("b")).unwrap();

        assert!(!state.contains(slow.id));
        assert!(state.contains(x.id));
        // The slow connection was told to go away.
        slow.kicked().await;
    }

    #[tokio::test]
    async fn closed_connection_is_skipped() {
        let session = session();
        let (x, _rx_x) = member(ConnectionMode::Collab, 8);
        let (gone, rx_gone) = member(ConnectionMode::Collab, 8);
        drop(rx_gone);
        let mut state = session.lock().await;
        state.add_connection(x.clone());
        state.add_connection(gone.clone());

        assert_eq!(state.broadcast(Outbound::Binary(vec![0]), None), 1);
        assert!(!state.contains(gone.id));
    }

    #[tokio::test]
    async fn binary_and_text_frames_are_routed_by_mode() {
        let session = session();
        let (collab, mut rx_collab) = member(ConnectionMode::Collab, 8);
        let (legacy, mut rx_legacy) = member(ConnectionMode::Legacy, 8);
        let mut state = session.lock().await;
        state.add_connection(collab);
        state.add_connection(legacy);

        assert_eq!(state.broadcast(Outbound::Text("{}".into()), None), 1);
        assert_eq!(state.broadcast(Outbound::Binary(vec![1]), None), 1);
        assert_eq!(rx_legacy.try_recv().unwrap(), Outbound::Text("{}".into()));
        assert_eq!(rx_collab.try_recv().unwrap(), Outbound::Binary(vec![1]));
    }

    #[tokio::test]
    async fn departure_clears_presence_for_peers() {
        let session = session();
        let (x, _rx_x) = member(ConnectionMode::Collab, 8);
        let (y, mut rx_y) = member(ConnectionMode::Collab, 8);
        let mut state = session.lock().await;
        state.add_connection(x.clone());
        state.add_connection(y);

        assert_eq!(state.apply_awareness(x.id, &presence(42, 1)), 1);
        let _ = rx_y.try_recv().unwrap();

        state.remove_connection(x.id).unwrap();
        assert!(state.awareness.get_state(42).is_none());
        match rx_y.try_recv().unwrap() {
            Outbound::Binary(frame) => match CollabMessage::decode(&frame).unwrap() {
                CollabMessage::Awareness(update) => {
                    assert_eq!(update.clients, vec![AwarenessEntry { client_id: 42, clock: 2, state: None }]);
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn legacy_departure_announces_user_left() {
        let session = session();
        let (x, _rx_x) = member(ConnectionMode::Legacy, 8);
        let (y, mut rx_y) = member(ConnectionMode::Legacy, 8);
        let mut state = session.lock().await;
        state.add_connection(x.clone());
        state.add_connection(y);

        state.remove_connection(x.id).unwrap();
        match rx_y.try_recv().unwrap() {
            Outbound::Text(text) => assert!(text.contains("\"user_left\"")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_presence_is_swept_on_next_update() {
        let session = session();
        let (x, _rx_x) = member(ConnectionMode::Collab, 8);
        let (y, mut rx_y) = member(ConnectionMode::Collab, 8);
        let mut state = session.lock().await;
        state.add_connection(x.clone());
        state.add_connection(y.clone());

        state.apply_awareness(x.id, &presence(1, 1));
        tokio::time::advance(Duration::from_secs(31)).await;
        state.apply_awareness(y.id, &presence(2, 1));

        assert!(state.awareness.get_state(1).is_none());
        assert!(state.awareness.get_state(2).is_some());
        // Presence of client 1, then the sweep removing it.
        assert!(rx_y.try_recv().is_ok());
        assert!(rx_y.try_recv().is_ok());
    }

    #[tokio::test]
    async fn welcome_includes_known_presence() {
        let session = session();
        let (x, _rx_x) = member(ConnectionMode::Collab, 8);
        let mut state = session.lock().await;
        assert_eq!(state.welcome_frames().len(), 1);

        state.add_connection(x.clone());
        state.apply_awareness(x.id, &presence(9, 1));
        assert_eq!(state.welcome_frames().len(), 2);
    }
}
