//! In-process implementations of every store seam.
//!
//! Used by `STORE_BACKEND=memory` and by the test suite. Each store keeps its
//! state behind one lock, which gives the same atomicity the Postgres and
//! Redis implementations get from transactions and scripts.

use super::{
    ConversationDirectory, KeyLedgerStore, KeyRingStore, MediaStore, MessageStore, PresenceStore,
    UserDirectory,
};
use crate::error::{AppError, AppResult};
use crate::models::{
    Conversation, ConversationSummary, EditRecord, MediaRef, Message, MessagePreview,
    MessageStatus, PresenceEntry, Reaction, RingKey, StoredKeyRecord, UserDisplay,
};
use crate::websocket::fanout::MemoryBroker;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

// ============================================================================
// Directories
// ============================================================================

#[derive(Default)]
pub struct MemoryDirectory {
    conversations: RwLock<HashMap<Uuid, Conversation>>,
    direct: Mutex<HashMap<(Uuid, Uuid), Uuid>>,
    users: RwLock<HashMap<Uuid, UserDisplay>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_conversation(&self, conversation: Conversation) {
        self.conversations
            .write()
            .await
            .insert(conversation.id, conversation);
    }

    /// Replace the participant list, as the membership owner would.
    pub async fn set_participants(&self, conversation_id: Uuid, participants: Vec<Uuid>) {
        if let Some(c) = self.conversations.write().await.get_mut(&conversation_id) {
            c.participants = participants;
        }
    }

    pub async fn insert_user(&self, user_id: Uuid, display: UserDisplay) {
        self.users.write().await.insert(user_id, display);
    }
}

fn direct_key(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

#[async_trait]
impl ConversationDirectory for MemoryDirectory {
    async fn get(&self, conversation_id: Uuid) -> AppResult<Option<Conversation>> {
        Ok(self.conversations.read().await.get(&conversation_id).cloned())
    }

    async fn conversations_of(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        let mut ids: Vec<Uuid> = self
            .conversations
            .read()
            .await
            .values()
            .filter(|c| c.is_participant(user_id))
            .map(|c| c.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn find_or_create_direct(&self, a: Uuid, b: Uuid) -> AppResult<(Conversation, bool)> {
        let key = direct_key(a, b);
        let mut direct = self.direct.lock().await;

        if let Some(id) = direct.get(&key) {
            if let Some(existing) = self.conversations.read().await.get(id) {
                return Ok((existing.clone(), false));
            }
        }

        let conversation = Conversation {
            id: Uuid::new_v4(),
            participants: vec![a, b],
            auto_delete_after_secs: 0,
        };
        direct.insert(key, conversation.id);
        self.insert_conversation(conversation.clone()).await;
        Ok((conversation, true))
    }
}

#[async_trait]
impl UserDirectory for MemoryDirectory {
    async fn display(&self, user_id: Uuid) -> AppResult<Option<UserDisplay>> {
        Ok(self.users.read().await.get(&user_id).cloned())
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Default)]
struct MessageState {
    messages: HashMap<Uuid, Message>,
    previews: HashMap<Uuid, MessagePreview>,
    unread: HashMap<(Uuid, Uuid), i64>,
}

impl MessageState {
    fn newest_in(&self, conversation_id: Uuid) -> Option<&Message> {
        self.messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .max_by_key(|m| m.created_at)
    }
}

#[derive(Default)]
pub struct MemoryMessageStore {
    state: Mutex<MessageState>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Overwrite a stored record, e.g. to plant legacy or undecryptable text.
    pub async fn put_raw(&self, message: Message) {
        self.state.lock().await.messages.insert(message.id, message);
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn create(
        &self,
        message: &Message,
        participants: &[Uuid],
        preview: &MessagePreview,
    ) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.messages.contains_key(&message.id) {
            return Err(AppError::Internal(format!(
                "duplicate message id {}",
                message.id
            )));
        }
        state.messages.insert(message.id, message.clone());
        state
            .previews
            .insert(message.conversation_id, preview.clone());
        for participant in participants.iter().filter(|p| **p != message.sender_id) {
            *state
                .unread
                .entry((message.conversation_id, *participant))
                .or_insert(0) += 1;
        }
        Ok(())
    }

    async fn get(&self, message_id: Uuid) -> AppResult<Option<Message>> {
        Ok(self.state.lock().await.messages.get(&message_id).cloned())
    }

    async fn get_many(&self, message_ids: &[Uuid]) -> AppResult<Vec<Message>> {
        let state = self.state.lock().await;
        Ok(message_ids
            .iter()
            .filter_map(|id| state.messages.get(id).cloned())
            .collect())
    }

    async fn list(
        &self,
        conversation_id: Uuid,
        viewer: Uuid,
        now: DateTime<Utc>,
        before: Option<DateTime<Utc>>,
        limit: usize,
    ) -> AppResult<Vec<Message>> {
        let state = self.state.lock().await;
        let mut page: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| m.is_visible_to(viewer, now))
            .filter(|m| before.map_or(true, |b| m.created_at < b))
            .cloned()
            .collect();

        page.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        page.truncate(limit);
        page.reverse();
        Ok(page)
    }

    async fn update_text(
        &self,
        message_id: Uuid,
        sealed_text: &str,
        edited_at: DateTime<Utc>,
    ) -> AppResult<Option<Message>> {
        let mut state = self.state.lock().await;
        let Some(message) = state.messages.get_mut(&message_id) else {
            return Ok(None);
        };

        if let Some(previous) = message.text.replace(sealed_text.to_string()) {
            message.edit_history.push(EditRecord {
                text: previous,
                replaced_at: edited_at,
            });
        }
        message.edited_at = Some(edited_at);
        let updated = message.clone();

        if let Some(preview) = state.previews.get_mut(&updated.conversation_id) {
            if preview.message_id == message_id {
                preview.text = updated.text.clone();
            }
        }
        Ok(Some(updated))
    }

    async fn hide_for(&self, message_id: Uuid, viewer: Uuid) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        Ok(state
            .messages
            .get_mut(&message_id)
            .map(|m| m.hidden_for.insert(viewer))
            .unwrap_or(false))
    }

    async fn hard_delete(&self, message_id: Uuid) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        let Some(removed) = state.messages.remove(&message_id) else {
            return Ok(false);
        };

        let conversation_id = removed.conversation_id;
        let was_preview = state
            .previews
            .get(&conversation_id)
            .is_some_and(|p| p.message_id == message_id);
        if was_preview {
            let next = state.newest_in(conversation_id).map(MessagePreview::of);
            match next {
                Some(next) => {
                    state.previews.insert(conversation_id, next);
                }
                None => {
                    state.previews.remove(&conversation_id);
                }
            }
        }
        Ok(true)
    }

    async fn mark_read(
        &self,
        conversation_id: Uuid,
        reader: Uuid,
        at: DateTime<Utc>,
    ) -> AppResult<Vec<Uuid>> {
        let mut state = self.state.lock().await;
        let mut stamped: Vec<(DateTime<Utc>, Uuid)> = Vec::new();

        for message in state.messages.values_mut() {
            if message.conversation_id != conversation_id
                || !message.is_unread_by(reader)
                || !message.is_visible_to(reader, at)
            {
                continue;
            }
            message.read_by.insert(reader, at);
            message.status = MessageStatus::Delivered;
            stamped.push((message.created_at, message.id));
        }

        state.unread.insert((conversation_id, reader), 0);
        stamped.sort();
        Ok(stamped.into_iter().map(|(_, id)| id).collect())
    }

    async fn set_reaction(
        &self,
        message_id: Uuid,
        user_id: Uuid,
        reaction: Option<Reaction>,
    ) -> AppResult<Option<BTreeMap<Uuid, Reaction>>> {
        let mut state = self.state.lock().await;
        let Some(message) = state.messages.get_mut(&message_id) else {
            return Ok(None);
        };
        match reaction {
            Some(r) => {
                message.reactions.insert(user_id, r);
            }
            None => {
                message.reactions.remove(&user_id);
            }
        }
        Ok(Some(message.reactions.clone()))
    }

    async fn expired(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        skip: &[Uuid],
    ) -> AppResult<Vec<Message>> {
        let state = self.state.lock().await;
        let mut due: Vec<Message> = state
            .messages
            .values()
            .filter(|m| m.is_expired(now) && !skip.contains(&m.id))
            .cloned()
            .collect();
        due.sort_by_key(|m| m.expires_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn summary(&self, conversation_id: Uuid, viewer: Uuid) -> AppResult<ConversationSummary> {
        let state = self.state.lock().await;
        Ok(ConversationSummary {
            conversation_id,
            last_message: state.previews.get(&conversation_id).cloned(),
            unread_count: state
                .unread
                .get(&(conversation_id, viewer))
                .copied()
                .unwrap_or(0),
        })
    }
}

// ============================================================================
// Media
// ============================================================================

/// Records removals instead of deleting objects.
#[derive(Default)]
pub struct MemoryMediaStore {
    removed: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl MemoryMediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn removed(&self) -> Vec<String> {
        self.removed.lock().await.clone()
    }

    /// Make every subsequent removal fail with a transient error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaStore for MemoryMediaStore {
    async fn remove(&self, media: &[MediaRef]) -> AppResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::TransientStore("media store unavailable".into()));
        }
        self.removed
            .lock()
            .await
            .extend(media.iter().map(|m| m.key.clone()));
        Ok(())
    }
}

// ============================================================================
// Key ledger and envelope key ring
// ============================================================================

#[derive(Default)]
pub struct MemoryKeyLedger {
    records: Mutex<HashMap<Uuid, StoredKeyRecord>>,
}

impl MemoryKeyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plant a record as-is, bypassing revision checks.
    pub async fn put_raw(&self, conversation_id: Uuid, record: StoredKeyRecord) {
        self.records.lock().await.insert(conversation_id, record);
    }
}

#[async_trait]
impl KeyLedgerStore for MemoryKeyLedger {
    async fn load(&self, conversation_id: Uuid) -> AppResult<Option<StoredKeyRecord>> {
        Ok(self.records.lock().await.get(&conversation_id).cloned())
    }

    async fn compare_and_swap(
        &self,
        conversation_id: Uuid,
        expected_revision: i64,
        record: &StoredKeyRecord,
    ) -> AppResult<bool> {
        let mut records = self.records.lock().await;
        let current = records.get(&conversation_id).map_or(0, |r| r.revision);
        if current != expected_revision {
            return Ok(false);
        }
        records.insert(conversation_id, record.clone());
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryKeyRing {
    ring: Mutex<Vec<RingKey>>,
    last_claimed_slot: Mutex<Option<u64>>,
}

impl MemoryKeyRing {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyRingStore for MemoryKeyRing {
    async fn keys(&self) -> AppResult<Vec<RingKey>> {
        Ok(self.ring.lock().await.clone())
    }

    async fn init_if_absent(&self, key: &RingKey) -> AppResult<bool> {
        let mut ring = self.ring.lock().await;
        if !ring.is_empty() {
            return Ok(false);
        }
        ring.push(key.clone());
        Ok(true)
    }

    async fn prepend_and_trim(&self, key: &RingKey, capacity: usize) -> AppResult<()> {
        let mut ring = self.ring.lock().await;
        ring.insert(0, key.clone());
        ring.truncate(capacity);
        Ok(())
    }

    async fn claim_rotation(&self, slot: u64, _owner: &str, _ttl: Duration) -> AppResult<bool> {
        let mut last = self.last_claimed_slot.lock().await;
        if last.is_some_and(|claimed| claimed >= slot) {
            return Ok(false);
        }
        *last = Some(slot);
        Ok(true)
    }
}

// ============================================================================
// Presence
// ============================================================================

#[derive(Default)]
struct PresenceState {
    sessions: HashMap<Uuid, BTreeSet<Uuid>>,
    display: HashMap<Uuid, UserDisplay>,
    /// Heartbeat deadline per instance.
    instances: HashMap<String, Instant>,
    owned: HashMap<String, BTreeSet<(Uuid, Uuid)>>,
}

#[derive(Default)]
pub struct MemoryPresenceStore {
    state: Mutex<PresenceState>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire the heartbeat of `instance_id` now, as if the process died.
    pub async fn lapse_instance(&self, instance_id: &str) {
        if let Some(deadline) = self.state.lock().await.instances.get_mut(instance_id) {
            *deadline = Instant::now();
        }
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn add_session(&self, instance_id: &str, user_id: Uuid, session_id: Uuid) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.sessions.entry(user_id).or_default().insert(session_id);
        state
            .owned
            .entry(instance_id.to_string())
            .or_default()
            .insert((user_id, session_id));
        Ok(())
    }

    async fn remove_session(
        &self,
        instance_id: &str,
        user_id: Uuid,
        session_id: Uuid,
    ) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        if let Some(owned) = state.owned.get_mut(instance_id) {
            owned.remove(&(user_id, session_id));
            if owned.is_empty() {
                state.owned.remove(instance_id);
            }
        }
        let Some(sessions) = state.sessions.get_mut(&user_id) else {
            return Ok(false);
        };
        sessions.remove(&session_id);
        if sessions.is_empty() {
            state.sessions.remove(&user_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn heartbeat(&self, instance_id: &str, ttl: Duration) -> AppResult<()> {
        self.state
            .lock()
            .await
            .instances
            .insert(instance_id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn instance_sessions(&self, instance_id: &str) -> AppResult<Vec<(Uuid, Uuid)>> {
        Ok(self
            .state
            .lock()
            .await
            .owned
            .get(instance_id)
            .map(|owned| owned.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn lapsed_instances(&self) -> AppResult<Vec<String>> {
        let now = Instant::now();
        let mut lapsed: Vec<String> = self
            .state
            .lock()
            .await
            .instances
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        lapsed.sort();
        Ok(lapsed)
    }

    async fn forget_instance(&self, instance_id: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.instances.remove(instance_id);
        state.owned.remove(instance_id);
        Ok(())
    }

    async fn cached_display(&self, user_id: Uuid) -> AppResult<Option<UserDisplay>> {
        Ok(self.state.lock().await.display.get(&user_id).cloned())
    }

    async fn cache_display(&self, user_id: Uuid, display: &UserDisplay) -> AppResult<()> {
        self.state
            .lock()
            .await
            .display
            .insert(user_id, display.clone());
        Ok(())
    }

    async fn online(&self) -> AppResult<Vec<PresenceEntry>> {
        let state = self.state.lock().await;
        let mut entries: Vec<PresenceEntry> = state
            .sessions
            .iter()
            .map(|(user_id, sessions)| PresenceEntry {
                user_id: *user_id,
                display: state.display.get(user_id).cloned(),
                sessions: sessions.clone(),
            })
            .collect();
        entries.sort_by_key(|e| e.user_id);
        Ok(entries)
    }
}

// ============================================================================
// Bundle
// ============================================================================

/// Every in-memory store plus the in-process broker. Sharing one backend
/// between several fabrics stands in for several server processes sharing
/// Postgres and Redis.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub directory: Arc<MemoryDirectory>,
    pub messages: Arc<MemoryMessageStore>,
    pub media: Arc<MemoryMediaStore>,
    pub key_ledger: Arc<MemoryKeyLedger>,
    pub key_ring: Arc<MemoryKeyRing>,
    pub presence: Arc<MemoryPresenceStore>,
    pub broker: Arc<MemoryBroker>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(conversation_id: Uuid, sender_id: Uuid, at: DateTime<Utc>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            receiver_id: None,
            text: Some("sealed".into()),
            media: vec![],
            status: MessageStatus::Sent,
            read_by: BTreeMap::new(),
            hidden_for: BTreeSet::new(),
            reply_to: None,
            reactions: BTreeMap::new(),
            edit_history: vec![],
            edited_at: None,
            expires_at: None,
            created_at: at,
            client_temp_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_updates_preview_and_unread() {
        let store = MemoryMessageStore::new();
        let (conv, a, b) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let m = message(conv, a, Utc::now());
        store
            .create(&m, &[a, b], &MessagePreview::of(&m))
            .await
            .unwrap();

        let for_b = store.summary(conv, b).await.unwrap();
        assert_eq!(for_b.unread_count, 1);
        assert_eq!(for_b.last_message.unwrap().message_id, m.id);
        assert_eq!(store.summary(conv, a).await.unwrap().unread_count, 0);
    }

    #[tokio::test]
    async fn test_hard_delete_moves_preview_back() {
        let store = MemoryMessageStore::new();
        let (conv, a) = (Uuid::new_v4(), Uuid::new_v4());
        let first = message(conv, a, Utc::now() - chrono::Duration::seconds(5));
        let second = message(conv, a, Utc::now());
        for m in [&first, &second] {
            store.create(m, &[a], &MessagePreview::of(m)).await.unwrap();
        }

        assert!(store.hard_delete(second.id).await.unwrap());
        assert!(!store.hard_delete(second.id).await.unwrap());
        let summary = store.summary(conv, a).await.unwrap();
        assert_eq!(summary.last_message.unwrap().message_id, first.id);
    }

    #[tokio::test]
    async fn test_compare_and_swap_rejects_stale_revision() {
        let ledger = MemoryKeyLedger::new();
        let conv = Uuid::new_v4();
        let record = StoredKeyRecord {
            status: Default::default(),
            participants: BTreeMap::new(),
            revision: 1,
        };
        assert!(ledger.compare_and_swap(conv, 0, &record).await.unwrap());
        assert!(!ledger.compare_and_swap(conv, 0, &record).await.unwrap());
    }

    #[tokio::test]
    async fn test_presence_entry_removed_with_last_session() {
        let store = MemoryPresenceStore::new();
        let (user, s1, s2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        store.add_session("a", user, s1).await.unwrap();
        store.add_session("b", user, s2).await.unwrap();

        assert!(!store.remove_session("a", user, s1).await.unwrap());
        assert_eq!(store.online().await.unwrap().len(), 1);
        assert!(store.remove_session("b", user, s2).await.unwrap());
        assert!(store.online().await.unwrap().is_empty());
        assert!(store.instance_sessions("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lapsed_heartbeat_is_reported() {
        let store = MemoryPresenceStore::new();
        store.heartbeat("alive", Duration::from_secs(60)).await.unwrap();
        store.heartbeat("dead", Duration::from_secs(60)).await.unwrap();
        assert!(store.lapsed_instances().await.unwrap().is_empty());

        store.lapse_instance("dead").await;
        assert_eq!(store.lapsed_instances().await.unwrap(), vec!["dead".to_string()]);

        store.forget_instance("dead").await.unwrap();
        assert!(store.lapsed_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rotation_claim_is_exclusive_per_slot() {
        let ring = MemoryKeyRing::new();
        let ttl = Duration::from_secs(60);
        assert!(ring.claim_rotation(7, "a", ttl).await.unwrap());
        assert!(!ring.claim_rotation(7, "b", ttl).await.unwrap());
        assert!(ring.claim_rotation(8, "b", ttl).await.unwrap());
    }
}
