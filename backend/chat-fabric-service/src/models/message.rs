use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Delivered,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "delivered" => MessageStatus::Delivered,
            _ => MessageStatus::Sent,
        }
    }
}

/// Derived from which payload parts a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Media,
    Mixed,
}

/// Reference to an object held by the media store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: String,
    /// Reactor display name at reaction time.
    pub name: String,
}

/// Previous text of an edited message, as stored (sealed).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    pub text: String,
    pub replaced_at: DateTime<Utc>,
}

/// Durable message record. `text` holds the sealed envelope, never plaintext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub receiver_id: Option<Uuid>,
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
    pub status: MessageStatus,
    pub read_by: BTreeMap<Uuid, DateTime<Utc>>,
    pub hidden_for: BTreeSet<Uuid>,
    pub reply_to: Option<Uuid>,
    pub reactions: BTreeMap<Uuid, Reaction>,
    pub edit_history: Vec<EditRecord>,
    pub edited_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub client_temp_id: Option<String>,
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match (self.text.is_some(), self.media.is_empty()) {
            (true, true) => MessageKind::Text,
            (false, _) => MessageKind::Media,
            (true, false) => MessageKind::Mixed,
        }
    }

    pub fn is_hidden_for(&self, viewer: Uuid) -> bool {
        self.hidden_for.contains(&viewer)
    }

    /// Expired messages are invisible even before the sweep removes them.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_visible_to(&self, viewer: Uuid, now: DateTime<Utc>) -> bool {
        !self.is_hidden_for(viewer) && !self.is_expired(now)
    }

    /// Unread for `reader` when someone else sent it and `reader` has no read stamp.
    pub fn is_unread_by(&self, reader: Uuid) -> bool {
        self.sender_id != reader && !self.read_by.contains_key(&reader)
    }
}

/// Denormalized reply target embedded in message views.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub id: Uuid,
    pub sender_id: Uuid,
    pub kind: MessageKind,
    pub preview: String,
}

/// Client-facing rendering of a message with plaintext text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver_id: Option<Uuid>,
    pub kind: MessageKind,
    pub text: Option<String>,
    pub media: Vec<MediaRef>,
    pub status: MessageStatus,
    pub read_by: BTreeMap<Uuid, DateTime<Utc>>,
    pub reply_to: Option<ReplyPreview>,
    pub reactions: BTreeMap<Uuid, Reaction>,
    pub edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_temp_id: Option<String>,
    /// Set when no envelope key could open the stored text.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub decryption_failed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(text: Option<&str>, media: usize) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_id: Uuid::new_v4(),
            receiver_id: None,
            text: text.map(str::to_string),
            media: (0..media)
                .map(|i| MediaRef {
                    key: format!("media/{i}"),
                    url: None,
                    content_type: None,
                })
                .collect(),
            status: MessageStatus::Sent,
            read_by: BTreeMap::new(),
            hidden_for: BTreeSet::new(),
            reply_to: None,
            reactions: BTreeMap::new(),
            edit_history: Vec::new(),
            edited_at: None,
            expires_at: None,
            created_at: Utc::now(),
            client_temp_id: None,
        }
    }

    #[test]
    fn test_kind_is_derived_from_payload() {
        assert_eq!(message(Some("hi"), 0).kind(), MessageKind::Text);
        assert_eq!(message(None, 2).kind(), MessageKind::Media);
        assert_eq!(message(Some("look"), 1).kind(), MessageKind::Mixed);
    }

    #[test]
    fn test_expired_message_is_invisible() {
        let now = Utc::now();
        let mut m = message(Some("bye"), 0);
        m.expires_at = Some(now - chrono::Duration::seconds(1));
        assert!(m.is_expired(now));
        assert!(!m.is_visible_to(m.sender_id, now));
    }

    #[test]
    fn test_unread_excludes_own_messages() {
        let m = message(Some("hi"), 0);
        assert!(!m.is_unread_by(m.sender_id));
        assert!(m.is_unread_by(Uuid::new_v4()));
    }
}
