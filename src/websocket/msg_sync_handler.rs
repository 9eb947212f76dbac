use tracing::{debug, error, warn};

use crate::ws::connctx::ConnCtx;
use crate::ws::docsession::DocumentSession;
use crate::ws::protocol::SyncMessage;

/// Handle a sync protocol message
pub async fn handle_sync_message(msg: SyncMessage, session: &DocumentSession, conn: &ConnCtx) {
    let mut state = session.lock().await;

    match msg {
        // Peer told us what it has: answer with what it is missing.
        SyncMessage::Step1(peer_version) => {
            debug!("Sync step 1 from {} on {}", conn.id, session.document_id);
            match state.answer_step1(&peer_version) {
                Ok(frame) => {
                    if let Err(e) = conn.try_send(frame) {
                        warn!("Failed to send sync step 2 to {}: {}", conn.id, e);
                    }
                }
                Err(e) => error!("Failed to compute sync step 2 for {} on {}: {}", conn.id, session.document_id, e),
            }
        }
        // Merge, then relay what was new to everyone else.
        SyncMessage::Step2(update) | SyncMessage::Update(update) => match state.apply_update(conn.id, &update) {
            Ok(true) => debug!("Applied update from {} on {}", conn.id, session.document_id),
            Ok(false) => debug!("Update from {} on {} was already known", conn.id, session.document_id),
            Err(e) => error!("Rejected update from {} on {}: {}", conn.id, session.document_id, e),
        },
    }
}
