use super::message::{Message, MessageKind};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Conversation as seen by the fabric. Participants come from the membership
/// collaborator; the fabric never edits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: Vec<Uuid>,
    /// Zero disables expiry.
    pub auto_delete_after_secs: i64,
}

impl Conversation {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    pub fn auto_delete_after(&self) -> Option<Duration> {
        (self.auto_delete_after_secs > 0).then(|| Duration::seconds(self.auto_delete_after_secs))
    }

    pub fn expiry_for(&self, created_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.auto_delete_after().map(|ttl| created_at + ttl)
    }
}

/// Stored last-message preview. `text` is sealed like the message itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePreview {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub text: Option<String>,
    pub has_media: bool,
    pub sent_at: DateTime<Utc>,
}

impl MessagePreview {
    pub fn of(message: &Message) -> Self {
        Self {
            message_id: message.id,
            sender_id: message.sender_id,
            text: message.text.clone(),
            has_media: !message.media.is_empty(),
            sent_at: message.created_at,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match (self.text.is_some(), self.has_media) {
            (true, false) => MessageKind::Text,
            (false, _) => MessageKind::Media,
            (true, true) => MessageKind::Mixed,
        }
    }
}

/// Store-level summary for one viewer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: Uuid,
    pub last_message: Option<MessagePreview>,
    pub unread_count: i64,
}

/// Client-facing last-message preview with plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LastMessagePreview {
    pub message_id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub preview: String,
    pub sent_at: DateTime<Utc>,
}
