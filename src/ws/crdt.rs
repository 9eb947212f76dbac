use loro::{ExportMode, LoroDoc, ToJson, VersionVector};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("failed to import update: {0}")]
    Import(String),
    #[error("failed to export update: {0}")]
    Export(String),
}

/// Convergent state of one document, owned by its session.
pub struct CrdtDocument {
    doc: LoroDoc,
}

impl std::fmt::Debug for CrdtDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrdtDocument")
            .field("version", &self.doc.oplog_vv())
            .finish()
    }
}

impl Default for CrdtDocument {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtDocument {
    pub fn new() -> Self {
        Self { doc: LoroDoc::new() }
    }

    /// Compact summary of the operations this replica holds.
    pub fn state_vector(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode()
    }

    /// Operations a peer at `since` is missing.
    pub fn diff_since(&self, since: &VersionVector) -> Result<Vec<u8>, MergeError> {
        self.doc
            .export(ExportMode::updates(since))
            .map_err(|e| MergeError::Export(e.to_string()))
    }

    /// Merge a remote update and return the part of it that was new to us.
    ///
    /// Loro checks the blob's header and checksum before touching the oplog, so a
    /// failed import leaves the document as it was. `Ok(None)` means the update
    /// carried nothing we did not already have.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, MergeError> {
        if update.is_empty() {
            return Err(MergeError::Import("empty update".to_string()));
        }

        let before = self.doc.oplog_vv();
        self.doc
            .import(update)
            .map_err(|e| MergeError::Import(e.to_string()))?;
        let after = self.doc.oplog_vv();

        if after == before {
            debug!("Update contained no new operations");
            return Ok(None);
        }
        self.diff_since(&before).map(Some)
    }

    /// Full state, suitable for handing to a persistence collaborator.
    pub fn snapshot(&self) -> Result<Vec<u8>, MergeError> {
        self.doc
            .export(ExportMode::Snapshot)
            .map_err(|e| MergeError::Export(e.to_string()))
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.doc.get_deep_value().to_json_value()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.oplog_vv() == VersionVector::default()
    }
}
