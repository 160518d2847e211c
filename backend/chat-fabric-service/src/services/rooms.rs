use super::require_participant;
use crate::error::{AppError, AppResult};
use crate::models::Conversation;
use crate::store::ConversationDirectory;
use crate::websocket::registry::{LocalRoomTable, RoomKey, SessionId};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

/// Binds sessions to conversation rooms and personal rooms.
pub struct RoomMembership {
    conversations: Arc<dyn ConversationDirectory>,
    table: LocalRoomTable,
}

impl RoomMembership {
    pub fn new(conversations: Arc<dyn ConversationDirectory>, table: LocalRoomTable) -> Self {
        Self {
            conversations,
            table,
        }
    }

    /// Join the personal room plus one room per conversation of `user_id`.
    /// Idempotent. Returns the number of conversation rooms joined.
    pub async fn auto_subscribe(&self, session_id: SessionId, user_id: Uuid) -> AppResult<usize> {
        Ok(self.subscribe_all(session_id, user_id).await?.len())
    }

    /// Re-run the auto-subscription and drop conversation rooms the identity
    /// no longer participates in.
    pub async fn resubscribe(&self, session_id: SessionId, user_id: Uuid) -> AppResult<usize> {
        let current = self.subscribe_all(session_id, user_id).await?;
        for room in self.table.rooms_of(session_id) {
            if let RoomKey::Conversation(id) = room {
                if !current.contains(&id) {
                    self.table.leave(session_id, room);
                }
            }
        }
        Ok(current.len())
    }

    async fn subscribe_all(&self, session_id: SessionId, user_id: Uuid) -> AppResult<HashSet<Uuid>> {
        let conversation_ids = self.conversations.conversations_of(user_id).await?;

        if !self.table.join(session_id, RoomKey::User(user_id)) {
            return Err(AppError::NotFound(format!("session {session_id}")));
        }
        for id in &conversation_ids {
            self.table.join(session_id, RoomKey::Conversation(*id));
        }

        tracing::debug!(
            session_id = %session_id,
            user_id = %user_id,
            rooms = conversation_ids.len(),
            "subscribed session to its rooms"
        );
        Ok(conversation_ids.into_iter().collect())
    }

    pub async fn join(
        &self,
        session_id: SessionId,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> AppResult<Conversation> {
        let conversation =
            require_participant(self.conversations.as_ref(), conversation_id, user_id).await?;
        if !self
            .table
            .join(session_id, RoomKey::Conversation(conversation_id))
        {
            return Err(AppError::NotFound(format!("session {session_id}")));
        }
        Ok(conversation)
    }

    pub fn leave(&self, session_id: SessionId, conversation_id: Uuid) -> bool {
        self.table
            .leave(session_id, RoomKey::Conversation(conversation_id))
    }

    /// Advisory viewing hint. Also joins the room, since viewing implies
    /// wanting its events.
    pub async fn focus(
        &self,
        session_id: SessionId,
        user_id: Uuid,
        conversation_id: Uuid,
    ) -> AppResult<Conversation> {
        let conversation = self.join(session_id, user_id, conversation_id).await?;
        self.table.set_focus(session_id, Some(conversation_id));
        Ok(conversation)
    }

    pub fn unfocus(&self, session_id: SessionId) {
        self.table.set_focus(session_id, None);
    }
}
