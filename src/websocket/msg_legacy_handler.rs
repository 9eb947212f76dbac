use std::sync::Arc;
use tracing::{info, warn};

use crate::models::{PresencePayload, ReceivedMessage, SendMessage};
use crate::ws::connctx::{ConnCtx, Outbound};
use crate::ws::registry::SessionRegistry;

/// Handle a legacy JSON presence message
pub async fn handle_legacy_message(text: &str, registry: &Arc<SessionRegistry>, conn: &mut ConnCtx) {
    // Parse the incoming message as JSON
    let json_msg: ReceivedMessage = match serde_json::from_str(text) {
        Ok(json_msg) => json_msg,
        Err(e) => {
            warn!("Failed to parse message from {}: {}", conn.id, e);
            return;
        }
    };

    match json_msg {
        ReceivedMessage::JoinDocument(payload) => handle_join_document(payload, registry, conn).await,
        ReceivedMessage::CursorPosition(payload) => handle_cursor_position(payload, text, registry, conn).await,
    }
}

async fn handle_join_document(payload: PresencePayload, registry: &Arc<SessionRegistry>, conn: &mut ConnCtx) {
    let Some(document_id) = payload.document_id else {
        warn!("join_document without documentId from {} dropped", conn.id);
        return;
    };

    *conn = conn.with_user(payload.user_id);
    let session = match registry.join_session(&document_id, conn).await {
        Ok(session) => session,
        Err(e) => {
            warn!("join_document from {} dropped: {}", conn.id, e);
            return;
        }
    };

    info!("User {} joined document {} (legacy)", conn.user_id, document_id);
    let joined = SendMessage::user_joined(&document_id, &conn.user_id).to_json();
    session.lock().await.broadcast(Outbound::Text(joined), Some(conn.id));
}

async fn handle_cursor_position(payload: PresencePayload, raw: &str, registry: &Arc<SessionRegistry>, conn: &ConnCtx) {
    let Some(document_id) = payload.document_id else {
        warn!("cursor_position without documentId from {} dropped", conn.id);
        return;
    };

    // Only relay into the document this connection actually joined.
    match registry.membership(conn.id).await {
        Some(current) if current == document_id => {
            registry.broadcast(&document_id, Outbound::Text(raw.to_string()), Some(conn.id)).await;
        }
        _ => warn!("cursor_position from {} for unjoined document {} dropped", conn.id, document_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::connctx::ConnectionMode;
    use serde_json::Value;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn legacy() -> (ConnCtx, mpsc::Receiver<Outbound>) {
        ConnCtx::new(None, ConnectionMode::Legacy, 16)
    }

    fn text(frame: Outbound) -> Value {
        match frame {
            Outbound::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn join_announces_user_to_existing_peers() {
        let registry = SessionRegistry::new(Duration::from_secs(30), Duration::from_secs(30));
        let (mut a, mut rx_a) = legacy();
        let (mut b, mut rx_b) = legacy();

        handle_legacy_message(r#"{"type":"join_document","documentId":"doc-1","userId":"alice"}"#, &registry, &mut a).await;
        handle_legacy_message(r#"{"type":"join_document","documentId":"doc-1","userId":"bob"}"#, &registry, &mut b).await;

        assert_eq!(a.user_id, "alice");
        let joined = text(rx_a.try_recv().unwrap());
        assert_eq!(joined["type"], "user_joined");
        assert_eq!(joined["userId"], "bob");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn cursor_position_is_relayed_verbatim() {
        let registry = SessionRegistry::new(Duration::from_secs(30), Duration::from_secs(30));
        let (mut a, _rx_a) = legacy();
        let (mut b, mut rx_b) = legacy();
        handle_legacy_message(r#"{"type":"join_document","documentId":"doc-1","userId":"alice"}"#, &registry, &mut a).await;
        handle_legacy_message(r#"{"type":"join_document","documentId":"doc-1","userId":"bob"}"#, &registry, &mut b).await;

        let cursor = r#"{"type":"cursor_position","documentId":"doc-1","userId":"alice","data":{"x":1},"timestamp":5}"#;
        handle_legacy_message(cursor, &registry, &mut a).await;

        assert_eq!(rx_b.try_recv().unwrap(), Outbound::Text(cursor.to_string()));
    }

    #[tokio::test]
    async fn cursor_for_unjoined_document_is_dropped() {
        let registry = SessionRegistry::new(Duration::from_secs(30), Duration::from_secs(30));
        let (mut a, _rx_a) = legacy();
        let (mut b, mut rx_b) = legacy();
        handle_legacy_message(r#"{"type":"join_document","documentId":"doc-1"}"#, &registry, &mut b).await;

        handle_legacy_message(r#"{"type":"cursor_position","documentId":"doc-1","data":{}}"#, &registry, &mut a).await;
        handle_legacy_message("not json at all", &registry, &mut a).await;

        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn switching_documents_announces_departure() {
        let registry = SessionRegistry::new(Duration::from_secs(30), Duration::from_secs(30));
        let (mut a, _rx_a) = legacy();
        let (mut b, mut rx_b) = legacy();
        handle_legacy_message(r#"{"type":"join_document","documentId":"doc-1","userId":"bob"}"#, &registry, &mut b).await;
        handle_legacy_message(r#"{"type":"join_document","documentId":"doc-1","userId":"alice"}"#, &registry, &mut a).await;
        let _ = rx_b.try_recv().unwrap();

        handle_legacy_message(r#"{"type":"join_document","documentId":"doc-2","userId":"alice"}"#, &registry, &mut a).await;

        let left = text(rx_b.try_recv().unwrap());
        assert_eq!(left["type"], "user_left");
        assert_eq!(left["userId"], "alice");
        assert_eq!(registry.membership(a.id).await.as_deref(), Some("doc-2"));
    }
}
