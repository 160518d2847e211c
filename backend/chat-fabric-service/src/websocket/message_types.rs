use crate::error::AppError;
use crate::services::message_service::SendMessage;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

/// Inbound websocket events from client to server.
#[derive(Debug, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum WsInboundEvent {
    // ============================================================
    // Room membership
    // ============================================================
    JoinRoom { conversation_id: Uuid },
    LeaveRoom { conversation_id: Uuid },
    Resubscribe {},
    FocusRoom { conversation_id: Uuid },
    UnfocusRoom {},

    // ============================================================
    // Messaging
    // ============================================================
    SendMessage(SendMessage),
    EditMessage { message_id: Uuid, text: String },
    DeleteMessage { message_id: Uuid },
    MessageRead {
        conversation_id: Uuid,
        #[serde(default)]
        user_id: Option<Uuid>,
    },
    AddReaction {
        #[serde(default)]
        conversation_id: Option<Uuid>,
        message_id: Uuid,
        emoji: String,
    },
    RemoveReaction {
        #[serde(default)]
        conversation_id: Option<Uuid>,
        message_id: Uuid,
        #[serde(default)]
        emoji: Option<String>,
    },

    // ============================================================
    // Key exchange
    // ============================================================
    #[serde(rename = "encryption:exchange-key")]
    ExchangeKey {
        conversation_id: Uuid,
        public_key: String,
    },
    #[serde(rename = "encryption:rotate-key")]
    RotateKey {
        conversation_id: Uuid,
        public_key: String,
    },
    #[serde(rename = "encryption:fetch-keys")]
    FetchKeys { conversation_id: Uuid },
}

impl WsInboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinRoom { .. } => "joinRoom",
            Self::LeaveRoom { .. } => "leaveRoom",
            Self::Resubscribe {} => "resubscribe",
            Self::FocusRoom { .. } => "focusRoom",
            Self::UnfocusRoom {} => "unfocusRoom",
            Self::SendMessage(_) => "sendMessage",
            Self::EditMessage { .. } => "editMessage",
            Self::DeleteMessage { .. } => "deleteMessage",
            Self::MessageRead { .. } => "messageRead",
            Self::AddReaction { .. } => "addReaction",
            Self::RemoveReaction { .. } => "removeReaction",
            Self::ExchangeKey { .. } => "encryption:exchange-key",
            Self::RotateKey { .. } => "encryption:rotate-key",
            Self::FetchKeys { .. } => "encryption:fetch-keys",
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawFrame {
    event: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    ack_id: Option<String>,
}

/// One parsed client frame: `{event, data, ackId?}`.
#[derive(Debug)]
pub struct InboundFrame {
    pub event: WsInboundEvent,
    pub ack_id: Option<String>,
}

/// Parse failure that still remembers enough to answer the client.
#[derive(Debug)]
pub struct FrameError {
    pub event: Option<String>,
    pub ack_id: Option<String>,
    /// `data.clientTempId` of a rejected `sendMessage`, read before typed parsing.
    pub client_temp_id: Option<String>,
    pub error: AppError,
}

impl InboundFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let raw: RawFrame = serde_json::from_str(text).map_err(|e| FrameError {
            event: None,
            ack_id: None,
            client_temp_id: None,
            error: AppError::BadRequest(format!("malformed frame: {e}")),
        })?;

        let data = if raw.data.is_null() {
            Value::Object(Default::default())
        } else {
            raw.data
        };
        let client_temp_id = if raw.event == "sendMessage" {
            data.get("clientTempId")
                .and_then(Value::as_str)
                .map(str::to_string)
        } else {
            None
        };
        let tagged = serde_json::json!({ "event": raw.event, "data": data });

        match serde_json::from_value::<WsInboundEvent>(tagged) {
            Ok(event) => Ok(Self {
                event,
                ack_id: raw.ack_id,
            }),
            Err(e) => Err(FrameError {
                event: Some(raw.event),
                ack_id: raw.ack_id,
                client_temp_id,
                error: AppError::BadRequest(format!("invalid payload: {e}")),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_send_message_with_ack() {
        let conversation_id = Uuid::new_v4();
        let text = format!(
            r#"{{"event":"sendMessage","data":{{"conversationId":"{conversation_id}","text":"hi","clientTempId":"t-1"}},"ackId":"7"}}"#
        );
        let frame = InboundFrame::parse(&text).unwrap();
        assert_eq!(frame.ack_id.as_deref(), Some("7"));
        match frame.event {
            WsInboundEvent::SendMessage(req) => {
                assert_eq!(req.conversation_id, Some(conversation_id));
                assert_eq!(req.text.as_deref(), Some("hi"));
                assert_eq!(req.client_temp_id.as_deref(), Some("t-1"));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_parse_event_without_data() {
        let frame = InboundFrame::parse(r#"{"event":"resubscribe"}"#).unwrap();
        assert!(matches!(frame.event, WsInboundEvent::Resubscribe {}));
    }

    #[test]
    fn test_parse_namespaced_key_event() {
        let conversation_id = Uuid::new_v4();
        let text = format!(
            r#"{{"event":"encryption:fetch-keys","data":{{"conversationId":"{conversation_id}"}}}}"#
        );
        let frame = InboundFrame::parse(&text).unwrap();
        assert_eq!(frame.event.name(), "encryption:fetch-keys");
    }

    #[test]
    fn test_unknown_event_keeps_ack_id() {
        let err = InboundFrame::parse(r#"{"event":"typing","data":{},"ackId":"9"}"#).unwrap_err();
        assert_eq!(err.event.as_deref(), Some("typing"));
        assert_eq!(err.ack_id.as_deref(), Some("9"));
        assert!(matches!(err.error, AppError::BadRequest(_)));
    }

    #[test]
    fn test_rejected_send_keeps_client_temp_id() {
        let err = InboundFrame::parse(
            r#"{"event":"sendMessage","data":{"conversationId":"not-a-uuid","clientTempId":"tmp-9"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.event.as_deref(), Some("sendMessage"));
        assert_eq!(err.client_temp_id.as_deref(), Some("tmp-9"));
    }
}
