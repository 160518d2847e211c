//! Shared fixtures: fabrics over one in-memory backend stand in for
//! several server processes sharing Postgres and Redis.

#![allow(dead_code)]

use chat_fabric_service::models::{Conversation, UserDisplay};
use chat_fabric_service::services::{ChatFabric, Collaborators};
use chat_fabric_service::store::memory::MemoryBackend;
use chat_fabric_service::websocket::SessionId;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

pub const WAIT: Duration = Duration::from_secs(2);
pub const QUIET: Duration = Duration::from_millis(150);

/// A fabric instance with its fanout listener running.
pub async fn fabric(backend: &MemoryBackend, instance_id: &str) -> ChatFabric {
    let fabric = ChatFabric::new(Collaborators::from(backend), instance_id);
    fabric
        .bus
        .start_listener()
        .await
        .expect("fanout listener should subscribe");
    fabric
}

pub async fn user(backend: &MemoryBackend, name: &str) -> Uuid {
    let id = Uuid::new_v4();
    backend
        .directory
        .insert_user(
            id,
            UserDisplay {
                name: name.to_string(),
                avatar: None,
            },
        )
        .await;
    id
}

pub async fn conversation(
    backend: &MemoryBackend,
    participants: &[Uuid],
    auto_delete_after_secs: i64,
) -> Uuid {
    let id = Uuid::new_v4();
    backend
        .directory
        .insert_conversation(Conversation {
            id,
            participants: participants.to_vec(),
            auto_delete_after_secs,
        })
        .await;
    id
}

pub struct Client {
    pub session_id: SessionId,
    pub user_id: Uuid,
    pub rx: UnboundedReceiver<String>,
}

pub async fn connect(fabric: &ChatFabric, user_id: Uuid) -> Client {
    let session_id = SessionId::new();
    let rx = fabric
        .connect(session_id, user_id)
        .await
        .expect("connect should succeed");
    Client {
        session_id,
        user_id,
        rx,
    }
}

/// Next frame named `event`, skipping any others. Panics after [`WAIT`].
pub async fn next_event(rx: &mut UnboundedReceiver<String>, event: &str) -> Value {
    let found = tokio::time::timeout(WAIT, async {
        while let Some(frame) = rx.recv().await {
            let value: Value = serde_json::from_str(&frame).expect("frames are json");
            if value["event"] == event {
                return Some(value);
            }
        }
        None
    })
    .await;

    match found {
        Ok(Some(value)) => value,
        Ok(None) => panic!("session closed before {event}"),
        Err(_) => panic!("timed out waiting for {event}"),
    }
}

/// Asserts no frame named `event` arrives within [`QUIET`].
pub async fn assert_no_event(rx: &mut UnboundedReceiver<String>, event: &str) {
    let seen = tokio::time::timeout(QUIET, async {
        while let Some(frame) = rx.recv().await {
            let value: Value = serde_json::from_str(&frame).expect("frames are json");
            if value["event"] == event {
                return value;
            }
        }
        std::future::pending().await
    })
    .await;

    if let Ok(value) = seen {
        panic!("unexpected {event}: {value}");
    }
}

/// Drop everything queued so far.
pub fn drain(rx: &mut UnboundedReceiver<String>) {
    while rx.try_recv().is_ok() {}
}

pub fn parse(frame: &str) -> Value {
    serde_json::from_str(frame).expect("frames are json")
}
