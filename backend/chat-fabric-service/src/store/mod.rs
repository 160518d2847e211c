//! Storage seams of the fabric.
//!
//! Membership, user identity, durable messages and media are owned by the
//! wider platform; the fabric reaches them only through these traits. Presence,
//! the key ledger and the envelope key ring are fabric-owned but shared across
//! instances, so they sit behind traits as well.

pub mod memory;
pub mod postgres;
pub mod redis;
pub mod s3;

use crate::error::AppResult;
use crate::models::{
    Conversation, ConversationSummary, MediaRef, Message, MessagePreview, PresenceEntry,
    Reaction, RingKey, StoredKeyRecord, UserDisplay,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn get(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>>;

    /// Every conversation `user_id` currently participates in.
    async fn conversations_of(&self, user_id: Uuid) -> AppResult<Vec<Uuid>>;

    /// Direct conversation between two identities, created when missing.
    /// The flag is true when this call created it.
    async fn find_or_create_direct(&self, a: Uuid, b: Uuid) -> AppResult<(Conversation, bool)>;
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn display(&self, user_id: Uuid) -> AppResult<Option<UserDisplay>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist `message` and, in the same unit, set the conversation preview
    /// and bump the unread count of every participant except the sender.
    async fn create(
        &self,
        message: &Message,
        participants: &[Uuid],
        preview: &MessagePreview,
    ) -> AppResult<()>;

    async fn get(&self, message_id: Uuid) -> AppResult<Option<Message>>;

    async fn get_many(&self, message_ids: &[Uuid]) -> AppResult<Vec<Message>>;

    /// Messages visible to `viewer` at `now`, oldest first, at most `limit`,
    /// all strictly older than `before` when given.
    async fn list(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
        now: DateTime<Utc>,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> AppResult<Vec<Message>>;

    /// Replace the text, archiving the current one in the edit history.
    async fn update_text(
        &self,
        message_id: Uuid,
        sealed_text: &str,
        edited_at: DateTime<Utc>,
    ) -> AppResult<Option<Message>>;

    /// Idempotent. Returns true when the viewer was newly added.
    async fn hide_for(&self, message_id: Uuid, viewer: Uuid) -> AppResult<bool>;

    /// Returns true when this call removed the record.
    async fn hard_delete(&self, message_id: Uuid) -> AppResult<bool>;

    /// Stamp every unread message not sent by and not hidden for `reader`,
    /// reset the reader's unread count, return the stamped ids.
    async fn mark_read(
        &self,
        conversation_id: Uuid,
        reader: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>>;

    /// Upsert (`Some`) or remove (`None`) the reaction of `user_id`.
    /// Returns the resulting reaction map, or None when the message is gone.
    async fn set_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        reaction: Option<Reaction>,
    ) -> AppResult<Option<BTreeMap<Uuid, Reaction>>>;

    /// Messages whose expiry is at or before `now`, oldest first, leaving
    /// out the ids in `skip`.
    async fn expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        skip: &[Uuid],
    ) -> AppResult<Vec<Message>>;

    async fn summary(&self, conversation_id: Uuid, viewer: Uuid) -> AppResult<ConversationSummary>;
}

#[async_trait]
pub trait MediaStore: Send + Sync {
    async fn remove(&self, media: &[MediaRef]) -> AppResult<()>;
}

#[async_trait]
pub trait KeyLedgerStore: Send + Sync {
    async fn load(&self, conversation_id: Uuid) -> AppResult<Option<StoredKeyRecord>>;

    /// Write `record` only if the stored revision still equals
    /// `expected_revision` (0 = absent). Returns false on conflict.
    async fn compare_and_swap(
        &self,
        conversation_id: Uuid,
        expected_revision: i64,
        record: &StoredKeyRecord,
    ) -> AppResult<bool>;
}

#[async_trait]
pub trait KeyRingStore: Send + Sync {
    /// Whole ring in one read, newest first.
    async fn keys(&self) -> AppResult<Vec<RingKey>>;

    /// Seed the ring with `key` if it does not exist. True when seeded.
    async fn init_if_absent(&self, key: &RingKey) -> AppResult<bool>;

    /// Prepend `key` and drop everything past `capacity`, atomically.
    async fn prepend_and_trim(&self, key: &RingKey, capacity: usize) -> AppResult<()>;

    /// Claim rotation period `slot` across all instances. Only the first
    /// claimant of a slot gets true; the claim is kept for at least `ttl`.
    async fn claim_rotation(&self, slot: u64, owner: &str, ttl: Duration) -> AppResult<bool>;
}

/// Shared presence. Every session is recorded under the instance that owns
/// it, and each instance keeps an expiring heartbeat, so the sessions of an
/// instance that died without disconnecting can be reaped by the others.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn add_session(&self, instance_id: &str, user_id: Uuid, session_id: Uuid) -> AppResult<()>;

    /// Returns true when this removal emptied the identity's session set and
    /// the entry was deleted.
    async fn remove_session(
        &self,
        instance_id: &str,
        user_id: Uuid,
        session_id: Uuid,
    ) -> AppResult<bool>;

    /// Mark `instance_id` alive for `ttl`.
    async fn heartbeat(&self, instance_id: &str, ttl: Duration) -> AppResult<()>;

    /// `(user, session)` pairs recorded under `instance_id`.
    async fn instance_sessions(&self, instance_id: &str) -> AppResult<Vec<(Uuid, Uuid)>>;

    /// Instances that have heartbeated before and whose heartbeat has lapsed.
    async fn lapsed_instances(&self) -> AppResult<Vec<String>>;

    /// Drop a reaped instance from the heartbeat registry.
    async fn forget_instance(&self, instance_id: &str) -> AppResult<()>;

    async fn cached_display(&self, user_id: Uuid) -> AppResult<Option<UserDisplay>>;

    async fn cache_display(&self, user_id: Uuid, display: &UserDisplay) -> AppResult<()>;

    async fn online(&self) -> AppResult<Vec<PresenceEntry>>;
}
