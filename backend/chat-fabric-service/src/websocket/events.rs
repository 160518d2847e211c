//! Outbound websocket events.
//!
//! Every server-to-client frame is `{"event": <name>, "data": {...}}`.
//! Callback replies to a client-supplied `ackId` use [`AckFrame`] instead.

use crate::models::{ExchangeStatus, MessageView, OnlineUser, Reaction};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    // ============================================================================
    // Message Events
    // ============================================================================
    /// Echo to the sender's session once the message is persisted.
    SendMessageSuccess {
        message: MessageView,
        conversation_id: Uuid,
        client_temp_id: Option<String>,
    },

    SendMessageError {
        client_temp_id: Option<String>,
        reason: String,
        code: &'static str,
        retryable: bool,
    },

    /// New message for every room subscriber, sender's other sessions included.
    ReceiveMessage { message: MessageView },

    EditMessageSuccess { message: MessageView },

    EditMessageError {
        message_id: Uuid,
        reason: String,
        code: &'static str,
    },

    MessageEdited { message: MessageView },

    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
        actor_id: Uuid,
        hard_delete: bool,
    },

    MessagesRead {
        conversation_id: Uuid,
        user_id: Uuid,
        messages: Vec<Uuid>,
    },

    ReactionUpdate {
        conversation_id: Uuid,
        message_id: Uuid,
        reactions: BTreeMap<Uuid, Reaction>,
    },

    // ============================================================================
    // Conversation & Presence Events
    // ============================================================================
    NewConversation {
        conversation_id: Uuid,
        participants: Vec<Uuid>,
    },

    /// Every other online identity, sent to each identity's personal room.
    LoggedUsersUpdate { users: Vec<OnlineUser> },

    // ============================================================================
    // Key Exchange Events
    // ============================================================================
    #[serde(rename = "encryption:key-updated")]
    KeyUpdated {
        conversation_id: Uuid,
        user_id: Uuid,
        public_key: String,
        key_id: String,
        key_version: u32,
        exchange_status: ExchangeStatus,
        rotated: bool,
    },

    // ============================================================================
    // Errors
    // ============================================================================
    /// Failure of an inbound event that carried no `ackId`.
    Error {
        source: String,
        reason: String,
        code: &'static str,
        retryable: bool,
    },
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SendMessageSuccess { .. } => "sendMessageSuccess",
            Self::SendMessageError { .. } => "sendMessageError",
            Self::ReceiveMessage { .. } => "receiveMessage",
            Self::EditMessageSuccess { .. } => "editMessageSuccess",
            Self::EditMessageError { .. } => "editMessageError",
            Self::MessageEdited { .. } => "messageEdited",
            Self::MessageDeleted { .. } => "messageDeleted",
            Self::MessagesRead { .. } => "messagesRead",
            Self::ReactionUpdate { .. } => "reactionUpdate",
            Self::NewConversation { .. } => "newConversation",
            Self::LoggedUsersUpdate { .. } => "loggedUsersUpdate",
            Self::KeyUpdated { .. } => "encryption:key-updated",
            Self::Error { .. } => "error",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Callback reply to an inbound frame that carried an `ackId`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AckFrame {
    event: &'static str,
    ack_id: String,
    data: Value,
}

impl AckFrame {
    pub fn new(ack_id: String, data: Value) -> Self {
        Self {
            event: "ack",
            ack_id,
            data,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_adjacent_tagging_and_camel_case_fields() {
        let conversation_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        let actor_id = Uuid::new_v4();
        let event = ServerEvent::MessageDeleted {
            conversation_id,
            message_id,
            actor_id,
            hard_delete: true,
        };
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "messageDeleted",
                "data": {
                    "conversationId": conversation_id,
                    "messageId": message_id,
                    "actorId": actor_id,
                    "hardDelete": true
                }
            })
        );
    }

    #[test]
    fn test_key_updated_event_name() {
        let event = ServerEvent::KeyUpdated {
            conversation_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            public_key: "PK".into(),
            key_id: "k1".into(),
            key_version: 2,
            exchange_status: ExchangeStatus::Complete,
            rotated: false,
        };
        let value: Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();
        assert_eq!(value["event"], "encryption:key-updated");
        assert_eq!(value["data"]["keyVersion"], 2);
        assert_eq!(value["data"]["exchangeStatus"], "complete");
        assert_eq!(event.event_type(), "encryption:key-updated");
    }

    #[test]
    fn test_ack_frame_shape() {
        let frame = AckFrame::new("a-1".into(), json!({ "success": true }));
        let value: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(value, json!({ "event": "ack", "ackId": "a-1", "data": { "success": true } }));
    }
}
