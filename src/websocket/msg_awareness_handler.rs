use tracing::debug;

use crate::ws::awareness::AwarenessUpdate;
use crate::ws::connctx::ConnCtx;
use crate::ws::docsession::DocumentSession;

/// Handle an awareness (presence) update
pub async fn handle_awareness_message(update: &AwarenessUpdate, session: &DocumentSession, conn: &ConnCtx) {
    let accepted = session.lock().await.apply_awareness(conn.id, update);
    debug!(
        "Awareness from {} on {}: {}/{} entries accepted",
        conn.id,
        session.document_id,
        accepted,
        update.clients.len()
    );
}
