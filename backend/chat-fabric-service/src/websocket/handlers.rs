//! Inbound websocket event handling.
//!
//! Pure with respect to the transport: takes one text frame, calls the
//! fabric, returns the frames owed to the calling session. Room-wide events
//! travel separately through the fanout bus.

use crate::error::{AppError, AppResult};
use crate::services::ChatFabric;
use crate::websocket::events::{AckFrame, ServerEvent};
use crate::websocket::message_types::{FrameError, InboundFrame, WsInboundEvent};
use crate::websocket::registry::SessionId;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

pub async fn handle_text(
    fabric: &ChatFabric,
    session_id: SessionId,
    user_id: Uuid,
    text: &str,
) -> Vec<String> {
    match InboundFrame::parse(text) {
        Ok(frame) => handle_frame(fabric, session_id, user_id, frame).await,
        Err(FrameError {
            event,
            ack_id,
            client_temp_id,
            error,
        }) => {
            tracing::warn!(session_id = %session_id, error = %error, "rejected websocket frame");
            match event.as_deref() {
                // A failed send is always answered against its temp id.
                Some("sendMessage") => send_failure_frames(client_temp_id, ack_id, &error),
                source => error_frames(source.unwrap_or("unknown"), ack_id, &error),
            }
        }
    }
}

pub async fn handle_frame(
    fabric: &ChatFabric,
    session_id: SessionId,
    user_id: Uuid,
    frame: InboundFrame,
) -> Vec<String> {
    let source = frame.event.name();
    let ack_id = frame.ack_id;

    let result: AppResult<Value> = match frame.event {
        WsInboundEvent::SendMessage(req) => {
            return send_message(fabric, user_id, req, ack_id).await;
        }
        WsInboundEvent::EditMessage { message_id, text } => {
            return edit_message(fabric, user_id, message_id, &text, ack_id).await;
        }

        WsInboundEvent::JoinRoom { conversation_id } => fabric
            .rooms
            .join(session_id, user_id, conversation_id)
            .await
            .map(|_| json!({ "success": true, "conversationId": conversation_id })),

        WsInboundEvent::LeaveRoom { conversation_id } => {
            fabric.rooms.leave(session_id, conversation_id);
            Ok(json!({ "success": true, "conversationId": conversation_id }))
        }

        WsInboundEvent::Resubscribe {} => fabric
            .rooms
            .resubscribe(session_id, user_id)
            .await
            .map(|rooms| json!({ "success": true, "rooms": rooms })),

        WsInboundEvent::FocusRoom { conversation_id } => fabric
            .focus(session_id, user_id, conversation_id)
            .await
            .map(|read| json!({ "success": true, "conversationId": conversation_id, "read": read })),

        WsInboundEvent::UnfocusRoom {} => {
            fabric.rooms.unfocus(session_id);
            Ok(json!({ "success": true }))
        }

        WsInboundEvent::DeleteMessage { message_id } => fabric
            .messages
            .delete(user_id, message_id)
            .await
            .and_then(success_with),

        WsInboundEvent::MessageRead {
            conversation_id,
            user_id: claimed,
        } => match claimed {
            Some(claimed) if claimed != user_id => Err(AppError::Forbidden(
                "cannot mark messages read for another user".into(),
            )),
            _ => fabric
                .messages
                .mark_read(user_id, conversation_id)
                .await
                .map(|ids| json!({ "success": true, "conversationId": conversation_id, "messages": ids })),
        },

        WsInboundEvent::AddReaction {
            message_id, emoji, ..
        } => fabric
            .messages
            .set_reaction(user_id, message_id, &emoji)
            .await
            .map(|reactions| json!({ "success": true, "messageId": message_id, "reactions": reactions })),

        WsInboundEvent::RemoveReaction { message_id, .. } => fabric
            .messages
            .remove_reaction(user_id, message_id)
            .await
            .map(|reactions| json!({ "success": true, "messageId": message_id, "reactions": reactions })),

        WsInboundEvent::ExchangeKey {
            conversation_id,
            public_key,
        } => fabric
            .keys
            .exchange_key(conversation_id, user_id, &public_key)
            .await
            .and_then(success_with),

        WsInboundEvent::RotateKey {
            conversation_id,
            public_key,
        } => fabric
            .keys
            .rotate_key(conversation_id, user_id, &public_key)
            .await
            .and_then(success_with),

        WsInboundEvent::FetchKeys { conversation_id } => fabric
            .keys
            .fetch_keys(conversation_id, user_id)
            .await
            .and_then(success_with),
    };

    respond(source, ack_id, result)
}

async fn send_message(
    fabric: &ChatFabric,
    user_id: Uuid,
    req: crate::services::message_service::SendMessage,
    ack_id: Option<String>,
) -> Vec<String> {
    let client_temp_id = req.client_temp_id.clone();

    match fabric.messages.send(user_id, req).await {
        Ok(view) => {
            let mut out = Vec::with_capacity(2);
            if let Some(ack_id) = ack_id {
                push(&mut out, encode_ack(ack_id, json!({ "success": true, "message": &view })));
            }
            push(
                &mut out,
                ServerEvent::SendMessageSuccess {
                    conversation_id: view.conversation_id,
                    client_temp_id,
                    message: view,
                }
                .to_json()
                .ok(),
            );
            out
        }
        Err(e) => {
            log_failure("sendMessage", &e);
            send_failure_frames(client_temp_id, ack_id, &e)
        }
    }
}

fn send_failure_frames(
    client_temp_id: Option<String>,
    ack_id: Option<String>,
    e: &AppError,
) -> Vec<String> {
    let mut out = Vec::with_capacity(2);
    if let Some(ack_id) = ack_id {
        push(&mut out, encode_ack(ack_id, failure_payload(e)));
    }
    push(
        &mut out,
        ServerEvent::SendMessageError {
            client_temp_id,
            reason: e.public_message(),
            code: e.code(),
            retryable: e.is_retryable(),
        }
        .to_json()
        .ok(),
    );
    out
}

async fn edit_message(
    fabric: &ChatFabric,
    user_id: Uuid,
    message_id: Uuid,
    text: &str,
    ack_id: Option<String>,
) -> Vec<String> {
    let mut out = Vec::with_capacity(2);
    match fabric.messages.edit(user_id, message_id, text).await {
        Ok(view) => {
            if let Some(ack_id) = ack_id {
                push(&mut out, encode_ack(ack_id, json!({ "success": true, "message": &view })));
            }
            push(
                &mut out,
                ServerEvent::EditMessageSuccess { message: view }.to_json().ok(),
            );
        }
        Err(e) => {
            log_failure("editMessage", &e);
            if let Some(ack_id) = ack_id {
                push(&mut out, encode_ack(ack_id, failure_payload(&e)));
            }
            push(
                &mut out,
                ServerEvent::EditMessageError {
                    message_id,
                    reason: e.public_message(),
                    code: e.code(),
                }
                .to_json()
                .ok(),
            );
        }
    }
    out
}

fn respond(source: &str, ack_id: Option<String>, result: AppResult<Value>) -> Vec<String> {
    match (result, ack_id) {
        (Ok(data), Some(ack_id)) => encode_ack(ack_id, data).into_iter().collect(),
        (Ok(_), None) => Vec::new(),
        (Err(e), ack_id) => {
            log_failure(source, &e);
            error_frames(source, ack_id, &e)
        }
    }
}

fn error_frames(source: &str, ack_id: Option<String>, e: &AppError) -> Vec<String> {
    let frame = match ack_id {
        Some(ack_id) => encode_ack(ack_id, failure_payload(e)),
        None => ServerEvent::Error {
            source: source.to_string(),
            reason: e.public_message(),
            code: e.code(),
            retryable: e.is_retryable(),
        }
        .to_json()
        .ok(),
    };
    frame.into_iter().collect()
}

fn failure_payload(e: &AppError) -> Value {
    json!({
        "success": false,
        "error": e.public_message(),
        "code": e.code(),
        "retryable": e.is_retryable(),
    })
}

/// `{"success": true, ...fields of value}`.
fn success_with<T: Serialize>(value: T) -> AppResult<Value> {
    let mut data = serde_json::to_value(value)?;
    if let Value::Object(map) = &mut data {
        map.insert("success".into(), Value::Bool(true));
    }
    Ok(data)
}

fn encode_ack(ack_id: String, data: Value) -> Option<String> {
    AckFrame::new(ack_id, data).to_json().ok()
}

fn push(out: &mut Vec<String>, frame: Option<String>) {
    match frame {
        Some(frame) => out.push(frame),
        None => tracing::error!("failed to serialize outbound websocket frame"),
    }
}

fn log_failure(source: &str, e: &AppError) {
    if e.status_code() >= 500 {
        tracing::error!(event = source, error = %e, "websocket event failed");
    } else {
        tracing::debug!(event = source, error = %e, "websocket event rejected");
    }
}
