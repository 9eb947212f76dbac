use std::sync::Arc;
use axum::{
    extract::{Path, Query, State, ws::{Message, WebSocket, WebSocketUpgrade}},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::AppState;
use crate::websocket::msg_awareness_handler::handle_awareness_message;
use crate::websocket::msg_legacy_handler::handle_legacy_message;
use crate::websocket::msg_sync_handler::handle_sync_message;
use crate::ws::connctx::{ConnCtx, ConnectionMode, Outbound};
use crate::ws::docsession::DocumentSession;
use crate::ws::protocol::CollabMessage;
use crate::ws::registry::{validate_document_id, SessionRegistry};

/// Query parameters of the upgrade request. The `userId` is a label only; it is
/// trusted as supplied by the authentication layer in front of us.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeParams {
    pub document_id: Option<String>,
    pub user_id: Option<String>,
}

/// WebSocket handler. Collab mode when the handshake names a document, legacy mode otherwise.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HandshakeParams>,
    State(app_state): State<AppState>,
) -> Response {
    info!("New WebSocket connection attempt");
    upgrade(ws, params.document_id, params.user_id, app_state)
}

/// WebSocket handler with the document in the path, always collab mode.
pub async fn document_websocket_handler(
    Path(document_id): Path<String>,
    ws: WebSocketUpgrade,
    Query(params): Query<HandshakeParams>,
    State(app_state): State<AppState>,
) -> Response {
    info!("New WebSocket connection attempt for document {}", document_id);
    upgrade(ws, Some(document_id), params.user_id, app_state)
}

fn upgrade(ws: WebSocketUpgrade, document_id: Option<String>, user_id: Option<String>, app_state: AppState) -> Response {
    if let Some(document_id) = &document_id {
        if let Err(e) = validate_document_id(document_id) {
            warn!("Rejecting WebSocket handshake: {}", e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    }
    ws.on_upgrade(move |socket| handle_socket(socket, document_id, user_id, app_state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, document_id: Option<String>, user_id: Option<String>, app_state: AppState) {
    let mode = if document_id.is_some() { ConnectionMode::Collab } else { ConnectionMode::Legacy };
    let (conn, mut outbound) = ConnCtx::new(user_id, mode, app_state.config.outbound_buffer);
    info!("WebSocket connection {} established ({:?} mode, user {})", conn.id, mode, conn.user_id);

    // Split the socket into sender and receiver
    let (mut sender, receiver) = socket.split();

    // Writer task: everything destined for this client goes through the bounded queue,
    // so a slow socket never blocks a session.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            let msg = match frame {
                Outbound::Binary(bytes) => Message::Binary(bytes),
                Outbound::Text(text) => Message::Text(text),
            };
            if let Err(e) = sender.send(msg).await {
                debug!("Socket write failed: {}", e);
                break;
            }
        }
        let _ = sender.close().await;
    });

    // Reader task: inbound frames are handled one at a time, in arrival order.
    let registry = app_state.registry.clone();
    let reader_conn = conn.clone();
    let mut recv_task = tokio::spawn(async move {
        match document_id {
            Some(document_id) => run_collab(receiver, registry, reader_conn, document_id).await,
            None => run_legacy(receiver, registry, reader_conn).await,
        }
    });

    // Wait for either task to finish (and finish the other)
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
        _ = conn.kicked() => {
            warn!("Connection {} dropped by its session", conn.id);
            recv_task.abort();
            send_task.abort();
        }
    };

    // Disconnect is an implicit leave.
    if let Some(document_id) = app_state.registry.membership(conn.id).await {
        app_state.registry.leave_session(&document_id, conn.id).await;
    }
    info!("WebSocket connection {} terminated", conn.id);
}

async fn run_collab(mut receiver: SplitStream<WebSocket>, registry: Arc<SessionRegistry>, conn: ConnCtx, document_id: String) {
    let session = match registry.join_session(&document_id, &conn).await {
        Ok(session) => session,
        Err(e) => {
            error!("Connection {} could not join {}: {}", conn.id, document_id, e);
            return;
        }
    };

    // Start the sync handshake with our state vector and the current presence.
    let welcome = session.lock().await.welcome_frames();
    for frame in welcome {
        if let Err(e) = conn.try_send(frame) {
            warn!("Failed to send welcome to {}: {}", conn.id, e);
            return;
        }
    }

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Binary(frame)) => handle_collab_frame(&session, &conn, &frame).await,
            Ok(Message::Text(_)) => {
                warn!("Ignoring text frame on collab connection {} ({})", conn.id, document_id);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Transport error on connection {}: {}", conn.id, e);
                break;
            }
        }
    }
}

async fn handle_collab_frame(session: &DocumentSession, conn: &ConnCtx, frame: &[u8]) {
    let msg = match CollabMessage::decode(frame) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Dropping malformed frame from {} on {}: {}", conn.id, session.document_id, e);
            return;
        }
    };

    match msg {
        CollabMessage::Sync(sync_msg) => handle_sync_message(sync_msg, session, conn).await,
        CollabMessage::Awareness(update) => handle_awareness_message(&update, session, conn).await,
    }
}

async fn run_legacy(mut receiver: SplitStream<WebSocket>, registry: Arc<SessionRegistry>, mut conn: ConnCtx) {
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => handle_legacy_message(&text, &registry, &mut conn).await,
            Ok(Message::Binary(_)) => {
                warn!("Ignoring binary frame on legacy connection {}", conn.id);
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("Transport error on connection {}: {}", conn.id, e);
                break;
            }
        }
    }
}
