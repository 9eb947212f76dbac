use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Fields shared by every legacy presence message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    pub document_id: Option<String>,
    pub user_id: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub timestamp: Option<Value>,
}

/// Messages a legacy-mode client sends.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum ReceivedMessage {
    #[serde(rename = "join_document")]
    JoinDocument(PresencePayload),
    #[serde(rename = "cursor_position")]
    CursorPosition(PresencePayload),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerMessage {
    pub document_id: String,
    pub user_id: String,
    pub timestamp: i64,
}

/// Events the server pushes to legacy-mode clients. Cursor positions are
/// relayed as received and so have no variant here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum SendMessage {
    #[serde(rename = "user_joined")]
    UserJoined(PeerMessage),
    #[serde(rename = "user_left")]
    UserLeft(PeerMessage),
}

impl SendMessage {
    pub fn user_joined(document_id: &str, user_id: &str) -> Self {
        SendMessage::UserJoined(PeerMessage::now(document_id, user_id))
    }

    pub fn user_left(document_id: &str, user_id: &str) -> Self {
        SendMessage::UserLeft(PeerMessage::now(document_id, user_id))
    }

    pub fn to_json(&self) -> String {
        // Only strings and integers inside, serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl PeerMessage {
    fn now(document_id: &str, user_id: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            user_id: user_id.to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}
