//! Fabric services and the [`ChatFabric`] facade that websocket and HTTP
//! handlers both call into.

pub mod envelope;
pub mod key_exchange;
pub mod message_service;
pub mod presence;
pub mod rooms;

use crate::error::{AppError, AppResult};
use crate::models::Conversation;
use crate::store::memory::MemoryBackend;
use crate::store::{
    ConversationDirectory, KeyLedgerStore, KeyRingStore, MediaStore, MessageStore, PresenceStore,
    UserDirectory,
};
use crate::websocket::fanout::{Broker, FanoutBus};
use crate::websocket::registry::{LocalRoomTable, SessionId};
use envelope::EnvelopeKeyService;
use key_exchange::KeyExchangeService;
use message_service::MessageService;
use presence::{PresenceRegistry, DEFAULT_HEARTBEAT_TTL};
use rooms::RoomMembership;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

/// Load the conversation and check `user_id` participates in it.
pub async fn require_participant(
    conversations: &dyn ConversationDirectory,
    conversation_id: Uuid,
    user_id: Uuid,
) -> AppResult<Conversation> {
    let conversation = conversations
        .get(conversation_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("conversation {conversation_id}")))?;
    if !conversation.is_participant(user_id) {
        return Err(AppError::Forbidden(
            "not a participant of this conversation".into(),
        ));
    }
    Ok(conversation)
}

/// Everything the fabric needs from the outside, injected at startup.
#[derive(Clone)]
pub struct Collaborators {
    pub conversations: Arc<dyn ConversationDirectory>,
    pub users: Arc<dyn UserDirectory>,
    pub messages: Arc<dyn MessageStore>,
    pub media: Arc<dyn MediaStore>,
    pub key_ledger: Arc<dyn KeyLedgerStore>,
    pub key_ring: Arc<dyn KeyRingStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub broker: Arc<dyn Broker>,
}

impl From<&MemoryBackend> for Collaborators {
    fn from(backend: &MemoryBackend) -> Self {
        Self {
            conversations: backend.directory.clone(),
            users: backend.directory.clone(),
            messages: backend.messages.clone(),
            media: backend.media.clone(),
            key_ledger: backend.key_ledger.clone(),
            key_ring: backend.key_ring.clone(),
            presence: backend.presence.clone(),
            broker: backend.broker.clone(),
        }
    }
}

/// One fabric instance: its local session table plus shared-state services.
#[derive(Clone)]
pub struct ChatFabric {
    pub messages: Arc<MessageService>,
    pub keys: Arc<KeyExchangeService>,
    pub presence: Arc<PresenceRegistry>,
    pub rooms: Arc<RoomMembership>,
    pub envelope: Arc<EnvelopeKeyService>,
    pub bus: FanoutBus,
}

impl ChatFabric {
    pub fn new(collaborators: Collaborators, instance_id: &str) -> Self {
        Self::with_presence_ttl(collaborators, instance_id, DEFAULT_HEARTBEAT_TTL)
    }

    /// `presence_ttl` is how long this instance's sessions outlive its last
    /// presence heartbeat.
    pub fn with_presence_ttl(
        collaborators: Collaborators,
        instance_id: &str,
        presence_ttl: Duration,
    ) -> Self {
        let table = LocalRoomTable::new();
        let bus = FanoutBus::new(
            collaborators.broker.clone(),
            table.clone(),
            collaborators.conversations.clone(),
            instance_id,
        );
        let envelope = Arc::new(EnvelopeKeyService::new(collaborators.key_ring.clone()));

        Self {
            messages: Arc::new(MessageService::new(
                collaborators.messages.clone(),
                collaborators.conversations.clone(),
                collaborators.users.clone(),
                collaborators.media.clone(),
                envelope.clone(),
                bus.clone(),
            )),
            keys: Arc::new(KeyExchangeService::new(
                collaborators.key_ledger.clone(),
                collaborators.conversations.clone(),
                bus.clone(),
            )),
            presence: Arc::new(PresenceRegistry::new(
                collaborators.presence.clone(),
                collaborators.users.clone(),
                bus.clone(),
                presence_ttl,
            )),
            rooms: Arc::new(RoomMembership::new(
                collaborators.conversations.clone(),
                table,
            )),
            envelope,
            bus,
        }
    }

    pub fn table(&self) -> &LocalRoomTable {
        self.bus.table()
    }

    /// Register a local session. Frames for it arrive on the receiver.
    pub fn register_session(&self, session_id: SessionId, user_id: Uuid) -> UnboundedReceiver<String> {
        self.table().register(session_id, user_id)
    }

    /// Auto-subscribe then mark the identity online. On failure the local
    /// session is dropped again so nothing half-joined lingers.
    pub async fn attach_session(&self, session_id: SessionId, user_id: Uuid) -> AppResult<()> {
        let result = async {
            self.rooms.auto_subscribe(session_id, user_id).await?;
            self.presence.connect(user_id, session_id.0).await
        }
        .await;

        if let Err(e) = &result {
            tracing::warn!(session_id = %session_id, user_id = %user_id, error = %e, "session attach failed");
            self.table().unregister(session_id);
        }
        result
    }

    /// Convenience for tests and tools: register plus attach.
    pub async fn connect(
        &self,
        session_id: SessionId,
        user_id: Uuid,
    ) -> AppResult<UnboundedReceiver<String>> {
        let rx = self.register_session(session_id, user_id);
        self.attach_session(session_id, user_id).await?;
        Ok(rx)
    }

    /// Local teardown happens before this returns; the returned future
    /// updates shared presence. If that update fails, the next presence
    /// maintenance pass removes the session.
    pub fn disconnect(
        &self,
        session_id: SessionId,
        user_id: Uuid,
    ) -> impl Future<Output = AppResult<()>> + Send + 'static {
        self.table().unregister(session_id);
        let presence = self.presence.clone();
        async move { presence.disconnect(user_id, session_id.0).await }
    }

    /// Heartbeat this instance and reconcile shared presence with the local
    /// session table, reaping instances that stopped heartbeating.
    pub async fn maintain_presence(&self) -> AppResult<()> {
        let local: Vec<(Uuid, Uuid)> = self
            .table()
            .sessions()
            .into_iter()
            .map(|(session_id, user_id)| (user_id, session_id.0))
            .collect();
        self.presence.maintain(&local).await
    }

    /// Focus the conversation and mark it read on the viewer's behalf.
    pub async fn focus(
        &self,
        session_id: SessionId,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> AppResult<Vec<Uuid>> {
        self.rooms.focus(session_id, user_id, conversation_id).await?;
        self.messages.mark_read(user_id, conversation_id).await
    }
}
