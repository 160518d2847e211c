use super::require_participant;
use crate::error::{AppError, AppResult};
use crate::metrics::EXPIRY_SWEEP_DELETED_TOTAL;
use crate::models::{
    Conversation, LastMessagePreview, MediaRef, Message, MessagePreview, MessageStatus,
    MessageView, Reaction, ReplyPreview, UserDisplay,
};
use crate::services::envelope::EnvelopeKeyService;
use crate::store::{ConversationDirectory, MediaStore, MessageStore, UserDirectory};
use crate::websocket::events::ServerEvent;
use crate::websocket::fanout::FanoutBus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const MAX_TEXT_LEN: usize = 4000;
pub const REPLY_PREVIEW_LEN: usize = 100;
pub const MAX_EMOJI_LEN: usize = 32;
pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 200;
pub const SWEEP_BATCH_SIZE: usize = 500;
/// How long an expired message whose purge failed is left out of sweeps.
pub const SWEEP_RETRY_BACKOFF_SECS: i64 = 600;

/// Inbound send request, shared by the websocket and HTTP surfaces.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessage {
    #[serde(default)]
    pub conversation_id: Option<Uuid>,
    #[serde(default)]
    pub receiver_id: Option<Uuid>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub reply_to: Option<Uuid>,
    #[serde(default)]
    pub client_temp_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteOutcome {
    pub conversation_id: Uuid,
    pub message_id: Uuid,
    pub hard_delete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryView {
    pub conversation_id: Uuid,
    pub last_message: Option<LastMessagePreview>,
    pub unread_count: i64,
}

/// Message lifecycle: send, edit, delete, read, react, expire.
pub struct MessageService {
    messages: Arc<dyn MessageStore>,
    conversations: Arc<dyn ConversationDirectory>,
    users: Arc<dyn UserDirectory>,
    media: Arc<dyn MediaStore>,
    envelope: Arc<EnvelopeKeyService>,
    bus: FanoutBus,
    /// Failed purges and the time they become due again.
    sweep_backoff: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl MessageService {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        conversations: Arc<dyn ConversationDirectory>,
        users: Arc<dyn UserDirectory>,
        media: Arc<dyn MediaStore>,
        envelope: Arc<EnvelopeKeyService>,
        bus: FanoutBus,
    ) -> Self {
        Self {
            messages,
            conversations,
            users,
            media,
            envelope,
            bus,
            sweep_backoff: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // Send / edit
    // ========================================================================

    pub async fn send(&self, sender_id: Uuid, req: SendMessage) -> AppResult<MessageView> {
        let text = normalize_text(req.text)?;
        if text.is_none() && req.media.is_empty() {
            return Err(AppError::BadRequest(
                "message must carry text or media".into(),
            ));
        }
        if req.media.iter().any(|m| m.key.trim().is_empty()) {
            return Err(AppError::BadRequest("media key is required".into()));
        }

        let (conversation, created) = self
            .resolve_conversation(sender_id, req.conversation_id, req.receiver_id)
            .await?;
        let now = Utc::now();

        let reply = match req.reply_to {
            Some(reply_id) => {
                let target = self
                    .messages
                    .get(reply_id)
                    .await?
                    .filter(|m| m.conversation_id == conversation.id)
                    .filter(|m| m.is_visible_to(sender_id, now))
                    .ok_or_else(|| AppError::NotFound(format!("reply target {reply_id}")))?;
                Some(self.reply_preview(&target).await)
            }
            None => None,
        };

        let sealed = match &text {
            Some(plain) => Some(self.envelope.encrypt(plain).await?),
            None => None,
        };

        let receiver_id = req.receiver_id.or_else(|| {
            (conversation.participants.len() == 2)
                .then(|| conversation.participants.iter().copied().find(|p| *p != sender_id))
                .flatten()
        });

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.id,
            sender_id,
            receiver_id,
            text: sealed,
            media: req.media,
            status: MessageStatus::Sent,
            read_by: BTreeMap::new(),
            hidden_for: BTreeSet::new(),
            reply_to: req.reply_to,
            reactions: BTreeMap::new(),
            edit_history: Vec::new(),
            edited_at: None,
            expires_at: conversation.expiry_for(now),
            created_at: now,
            client_temp_id: req.client_temp_id,
        };

        self.messages
            .create(&message, &conversation.participants, &MessagePreview::of(&message))
            .await?;

        let view = render(&message, text, reply, false);
        tracing::info!(
            conversation_id = %conversation.id,
            message_id = %message.id,
            sender_id = %sender_id,
            kind = ?message.kind(),
            "message persisted"
        );

        let event = ServerEvent::ReceiveMessage {
            message: view.clone(),
        };
        if created {
            // Nobody is subscribed to a room that did not exist a moment ago.
            for participant in &conversation.participants {
                self.emit_to_user(*participant, event.clone()).await;
            }
        } else {
            self.emit(conversation.id, event).await;
        }
        Ok(view)
    }

    async fn resolve_conversation(
        &self,
        sender_id: Uuid,
        conversation_id: Option<Uuid>,
        receiver_id: Option<Uuid>,
    ) -> AppResult<(Conversation, bool)> {
        match (conversation_id, receiver_id) {
            (Some(id), _) => Ok((
                require_participant(self.conversations.as_ref(), id, sender_id).await?,
                false,
            )),
            (None, Some(receiver_id)) => {
                if receiver_id == sender_id {
                    return Err(AppError::BadRequest("cannot message yourself".into()));
                }
                let (conversation, created) = self
                    .conversations
                    .find_or_create_direct(sender_id, receiver_id)
                    .await?;
                if created {
                    tracing::info!(
                        conversation_id = %conversation.id,
                        "created direct conversation on first message"
                    );
                    for participant in &conversation.participants {
                        self.emit_to_user(
                            *participant,
                            ServerEvent::NewConversation {
                                conversation_id: conversation.id,
                                participants: conversation.participants.clone(),
                            },
                        )
                        .await;
                    }
                }
                Ok((conversation, created))
            }
            (None, None) => Err(AppError::BadRequest(
                "conversationId or receiverId is required".into(),
            )),
        }
    }

    /// Sender-only, text-bearing messages only. The previous text is archived.
    pub async fn edit(&self, actor: Uuid, message_id: Uuid, text: &str) -> AppResult<MessageView> {
        let text = normalize_text(Some(text.to_string()))?
            .ok_or_else(|| AppError::BadRequest("text is required".into()))?;

        let message = self.load_visible(actor, message_id).await?;
        require_participant(self.conversations.as_ref(), message.conversation_id, actor).await?;
        if message.sender_id != actor {
            return Err(AppError::Forbidden(
                "only the sender can edit a message".into(),
            ));
        }
        if message.text.is_none() {
            return Err(AppError::BadRequest(
                "only text messages can be edited".into(),
            ));
        }

        let sealed = self.envelope.encrypt(&text).await?;
        let updated = self
            .messages
            .update_text(message_id, &sealed, Utc::now())
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;

        let reply = self.reply_for(&updated).await?;
        let view = render(&updated, Some(text), reply, false);
        self.emit(
            updated.conversation_id,
            ServerEvent::MessageEdited {
                message: view.clone(),
            },
        )
        .await;
        Ok(view)
    }

    // ========================================================================
    // Delete / expire
    // ========================================================================

    /// The sender deletes for everyone; anyone else hides it for themselves.
    pub async fn delete(&self, actor: Uuid, message_id: Uuid) -> AppResult<DeleteOutcome> {
        let message = self
            .messages
            .get(message_id)
            .await?
            .filter(|m| !m.is_expired(Utc::now()))
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))?;
        require_participant(self.conversations.as_ref(), message.conversation_id, actor).await?;

        let hard_delete = message.sender_id == actor;
        if hard_delete {
            self.purge(&message).await?;
        } else {
            self.messages.hide_for(message_id, actor).await?;
        }

        tracing::info!(
            conversation_id = %message.conversation_id,
            message_id = %message_id,
            actor_id = %actor,
            hard_delete,
            "message deleted"
        );
        self.emit(
            message.conversation_id,
            ServerEvent::MessageDeleted {
                conversation_id: message.conversation_id,
                message_id,
                actor_id: actor,
                hard_delete,
            },
        )
        .await;

        Ok(DeleteOutcome {
            conversation_id: message.conversation_id,
            message_id,
            hard_delete,
        })
    }

    /// Media first, then the record, so a media failure leaves the record
    /// for a retry. Returns false when the record was already gone.
    async fn purge(&self, message: &Message) -> AppResult<bool> {
        if !message.media.is_empty() {
            self.media.remove(&message.media).await?;
        }
        self.messages.hard_delete(message.id).await
    }

    /// Hard-delete every message whose expiry has passed. Each deletion is
    /// announced with the original sender as actor. A message whose purge
    /// fails is skipped for `SWEEP_RETRY_BACKOFF_SECS` so failing rows cannot
    /// fill every batch.
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> AppResult<usize> {
        let deferred: Vec<Uuid> = {
            let mut backoff = self.sweep_backoff.lock().await;
            backoff.retain(|_, retry_at| *retry_at > now);
            backoff.keys().copied().collect()
        };
        let due = self
            .messages
            .expired(now, SWEEP_BATCH_SIZE, &deferred)
            .await?;
        let mut deleted = 0usize;

        for message in due {
            match self.purge(&message).await {
                Ok(true) => {
                    deleted += 1;
                    self.emit(
                        message.conversation_id,
                        ServerEvent::MessageDeleted {
                            conversation_id: message.conversation_id,
                            message_id: message.id,
                            actor_id: message.sender_id,
                            hard_delete: true,
                        },
                    )
                    .await;
                }
                // Another instance's sweep got there first.
                Ok(false) => {}
                Err(e) => {
                    let retry_at = now + chrono::Duration::seconds(SWEEP_RETRY_BACKOFF_SECS);
                    tracing::warn!(
                        message_id = %message.id,
                        error = %e,
                        retry_at = %retry_at,
                        "expired message purge failed, deferring"
                    );
                    self.sweep_backoff.lock().await.insert(message.id, retry_at);
                }
            }
        }

        EXPIRY_SWEEP_DELETED_TOTAL.inc_by(deleted as u64);
        Ok(deleted)
    }

    // ========================================================================
    // Read receipts / reactions
    // ========================================================================

    pub async fn mark_read(&self, actor: Uuid, conversation_id: Uuid) -> AppResult<Vec<Uuid>> {
        require_participant(self.conversations.as_ref(), conversation_id, actor).await?;
        let ids = self
            .messages
            .mark_read(conversation_id, actor, Utc::now())
            .await?;

        if !ids.is_empty() {
            self.emit(
                conversation_id,
                ServerEvent::MessagesRead {
                    conversation_id,
                    user_id: actor,
                    messages: ids.clone(),
                },
            )
            .await;
        }
        Ok(ids)
    }

    pub async fn set_reaction(
        &self,
        actor: Uuid,
        message_id: Uuid,
        emoji: &str,
    ) -> AppResult<BTreeMap<Uuid, Reaction>> {
        let emoji = emoji.trim();
        if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_LEN {
            return Err(AppError::BadRequest(format!(
                "emoji must be 1 to {MAX_EMOJI_LEN} characters"
            )));
        }

        let message = self.load_visible(actor, message_id).await?;
        require_participant(self.conversations.as_ref(), message.conversation_id, actor).await?;

        let name = self
            .users
            .display(actor)
            .await?
            .unwrap_or_else(UserDisplay::unknown)
            .name;
        let reaction = Reaction {
            emoji: emoji.to_string(),
            name,
        };
        self.apply_reaction(&message, actor, Some(reaction)).await
    }

    pub async fn remove_reaction(
        &self,
        actor: Uuid,
        message_id: Uuid,
    ) -> AppResult<BTreeMap<Uuid, Reaction>> {
        let message = self.load_visible(actor, message_id).await?;
        require_participant(self.conversations.as_ref(), message.conversation_id, actor).await?;
        self.apply_reaction(&message, actor, None).await
    }

    async fn apply_reaction(
        &self,
        message: &Message,
        actor: Uuid,
        reaction: Option<Reaction>,
    ) -> AppResult<BTreeMap<Uuid, Reaction>> {
        let reactions = self
            .messages
            .set_reaction(message.id, actor, reaction)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("message {}", message.id)))?;

        self.emit(
            message.conversation_id,
            ServerEvent::ReactionUpdate {
                conversation_id: message.conversation_id,
                message_id: message.id,
                reactions: reactions.clone(),
            },
        )
        .await;
        Ok(reactions)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// One page of the conversation as `actor` sees it, oldest first.
    /// Undecryptable texts come back flagged rather than failing the page.
    pub async fn list(
        &self,
        actor: Uuid,
        conversation_id: Uuid,
        before: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> AppResult<Vec<MessageView>> {
        require_participant(self.conversations.as_ref(), conversation_id, actor).await?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);

        let page = self
            .messages
            .list(conversation_id, actor, Utc::now(), before, limit)
            .await?;

        let reply_ids: Vec<Uuid> = page.iter().filter_map(|m| m.reply_to).collect();
        let mut replies = HashMap::new();
        if !reply_ids.is_empty() {
            for target in self.messages.get_many(&reply_ids).await? {
                let preview = self.reply_preview(&target).await;
                replies.insert(target.id, preview);
            }
        }

        let mut views = Vec::with_capacity(page.len());
        for message in &page {
            let reply = message.reply_to.and_then(|id| replies.get(&id).cloned());
            let view = match self.open_optional(message.text.as_deref()).await {
                Ok(text) => render(message, text, reply, false),
                Err(e) => {
                    tracing::warn!(
                        message_id = %message.id,
                        error = %e,
                        "message text could not be decrypted"
                    );
                    render(message, None, reply, true)
                }
            };
            views.push(view);
        }
        Ok(views)
    }

    pub async fn get(&self, actor: Uuid, message_id: Uuid) -> AppResult<MessageView> {
        let message = self.load_visible(actor, message_id).await?;
        require_participant(self.conversations.as_ref(), message.conversation_id, actor).await?;
        let text = self.open_optional(message.text.as_deref()).await?;
        let reply = self.reply_for(&message).await?;
        Ok(render(&message, text, reply, false))
    }

    pub async fn summary(&self, actor: Uuid, conversation_id: Uuid) -> AppResult<SummaryView> {
        require_participant(self.conversations.as_ref(), conversation_id, actor).await?;
        let summary = self.messages.summary(conversation_id, actor).await?;

        let last_message = match summary.last_message {
            Some(preview) => {
                let text = match self.open_optional(preview.text.as_deref()).await {
                    Ok(text) => text.unwrap_or_default(),
                    Err(e) => {
                        tracing::warn!(
                            conversation_id = %conversation_id,
                            error = %e,
                            "preview text could not be decrypted"
                        );
                        String::new()
                    }
                };
                Some(LastMessagePreview {
                    message_id: preview.message_id,
                    sender_id: preview.sender_id,
                    kind: preview.kind(),
                    preview: truncate_chars(&text, REPLY_PREVIEW_LEN),
                    sent_at: preview.sent_at,
                })
            }
            None => None,
        };

        Ok(SummaryView {
            conversation_id,
            last_message,
            unread_count: summary.unread_count,
        })
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    async fn load_visible(&self, viewer: Uuid, message_id: Uuid) -> AppResult<Message> {
        self.messages
            .get(message_id)
            .await?
            .filter(|m| m.is_visible_to(viewer, Utc::now()))
            .ok_or_else(|| AppError::NotFound(format!("message {message_id}")))
    }

    /// Envelope payloads are opened; anything else is pre-encryption plaintext.
    async fn open_optional(&self, stored: Option<&str>) -> AppResult<Option<String>> {
        match stored {
            Some(s) if EnvelopeKeyService::is_envelope(s) => {
                Ok(Some(self.envelope.decrypt(s).await?))
            }
            Some(s) => Ok(Some(s.to_string())),
            None => Ok(None),
        }
    }

    async fn reply_for(&self, message: &Message) -> AppResult<Option<ReplyPreview>> {
        let Some(reply_id) = message.reply_to else {
            return Ok(None);
        };
        Ok(match self.messages.get(reply_id).await? {
            Some(target) => Some(self.reply_preview(&target).await),
            None => None,
        })
    }

    async fn reply_preview(&self, target: &Message) -> ReplyPreview {
        let preview = match self.open_optional(target.text.as_deref()).await {
            Ok(text) => truncate_chars(&text.unwrap_or_default(), REPLY_PREVIEW_LEN),
            Err(e) => {
                tracing::warn!(message_id = %target.id, error = %e, "reply preview undecryptable");
                String::new()
            }
        };
        ReplyPreview {
            id: target.id,
            sender_id: target.sender_id,
            kind: target.kind(),
            preview,
        }
    }

    async fn emit(&self, conversation_id: Uuid, event: ServerEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.bus.to_room(conversation_id, event).await {
            tracing::warn!(
                conversation_id = %conversation_id,
                event = event_type,
                error = %e,
                "fanout failed after commit"
            );
        }
    }

    async fn emit_to_user(&self, user_id: Uuid, event: ServerEvent) {
        let event_type = event.event_type();
        if let Err(e) = self.bus.to_user(user_id, event).await {
            tracing::warn!(user_id = %user_id, event = event_type, error = %e, "fanout failed after commit");
        }
    }
}

fn normalize_text(text: Option<String>) -> AppResult<Option<String>> {
    let Some(text) = text else {
        return Ok(None);
    };
    if text.trim().is_empty() {
        return Ok(None);
    }
    if text.chars().count() > MAX_TEXT_LEN {
        return Err(AppError::BadRequest(format!(
            "text exceeds {MAX_TEXT_LEN} characters"
        )));
    }
    Ok(Some(text))
}

fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

fn render(
    message: &Message,
    text: Option<String>,
    reply_to: Option<ReplyPreview>,
    decryption_failed: bool,
) -> MessageView {
    MessageView {
        id: message.id,
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        receiver_id: message.receiver_id,
        kind: message.kind(),
        text,
        media: message.media.clone(),
        status: message.status,
        read_by: message.read_by.clone(),
        reply_to,
        reactions: message.reactions.clone(),
        edited: message.edited_at.is_some(),
        edited_at: message.edited_at,
        expires_at: message.expires_at,
        created_at: message.created_at,
        client_temp_id: message.client_temp_id.clone(),
        decryption_failed,
    }
}
