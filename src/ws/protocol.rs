//! Binary framing for collaboration-mode connections.
//!
//! ```text
//! [0][0][version vector]   sync step 1
//! [0][1][update]           sync step 2
//! [0][2][update]           update
//! [1][awareness json]      awareness update
//! ```

use loro::VersionVector;

use super::awareness::AwarenessUpdate;

pub const MSG_SYNC: u8 = 0;
pub const MSG_AWARENESS: u8 = 1;

pub const SYNC_STEP1: u8 = 0;
pub const SYNC_STEP2: u8 = 1;
pub const SYNC_UPDATE: u8 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,
    #[error("unknown message tag {0}")]
    UnknownTag(u8),
    #[error("sync frame is missing its type byte")]
    Truncated,
    #[error("unknown sync message type {0}")]
    UnknownSyncType(u8),
    #[error("invalid state vector: {0}")]
    StateVector(String),
    #[error("invalid awareness payload: {0}")]
    Awareness(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub enum SyncMessage {
    /// The sender's state vector; the receiver answers with what it is missing.
    Step1(VersionVector),
    /// Answer to a step 1.
    Step2(Vec<u8>),
    /// Incremental change.
    Update(Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum CollabMessage {
    Sync(SyncMessage),
    Awareness(AwarenessUpdate),
}

impl CollabMessage {
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&tag, rest) = frame.split_first().ok_or(ProtocolError::Empty)?;
        match tag {
            MSG_SYNC => {
                let (&kind, payload) = rest.split_first().ok_or(ProtocolError::Truncated)?;
                let msg = match kind {
                    SYNC_STEP1 => {
                        let vv = VersionVector::decode(payload)
                            .map_err(|e| ProtocolError::StateVector(e.to_string()))?;
                        SyncMessage::Step1(vv)
                    }
                    SYNC_STEP2 => SyncMessage::Step2(payload.to_vec()),
                    SYNC_UPDATE => SyncMessage::Update(payload.to_vec()),
                    other => return Err(ProtocolError::UnknownSyncType(other)),
                };
                Ok(CollabMessage::Sync(msg))
            }
            MSG_AWARENESS => Ok(CollabMessage::Awareness(AwarenessUpdate::decode(rest)?)),
            other => Err(ProtocolError::UnknownTag(other)),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            CollabMessage::Sync(SyncMessage::Step1(vv)) => sync_frame(SYNC_STEP1, &vv.encode()),
            CollabMessage::Sync(SyncMessage::Step2(update)) => sync_frame(SYNC_STEP2, update),
            CollabMessage::Sync(SyncMessage::Update(update)) => sync_frame(SYNC_UPDATE, update),
            CollabMessage::Awareness(update) => {
                let body = update.encode();
                let mut frame = Vec::with_capacity(body.len() + 1);
                frame.push(MSG_AWARENESS);
                frame.extend_from_slice(&body);
                frame
            }
        }
    }
}

fn sync_frame(kind: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 2);
    frame.push(MSG_SYNC);
    frame.push(kind);
    frame.extend_from_slice(payload);
    frame
}

/// Frame a step 1 directly from encoded state vector bytes.
pub fn encode_step1(state_vector: &[u8]) -> Vec<u8> {
    sync_frame(SYNC_STEP1, state_vector)
}

pub fn encode_step2(update: &[u8]) -> Vec<u8> {
    sync_frame(SYNC_STEP2, update)
}

pub fn encode_update(update: &[u8]) -> Vec<u8> {
    sync_frame(SYNC_UPDATE, update)
}

pub fn encode_awareness(update: &AwarenessUpdate) -> Vec<u8> {
    CollabMessage::Awareness(update.clone()).encode()
}
