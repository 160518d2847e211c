use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

/// Unique identifier for one websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Named broadcast group: one per conversation plus one personal room per identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum RoomKey {
    Conversation(Uuid),
    User(Uuid),
}

impl fmt::Display for RoomKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoomKey::Conversation(id) => write!(f, "conversation:{id}"),
            RoomKey::User(id) => write!(f, "user:{id}"),
        }
    }
}

struct SessionSlot {
    user_id: Uuid,
    sender: UnboundedSender<String>,
    rooms: HashSet<RoomKey>,
    focused: Option<Uuid>,
}

#[derive(Default)]
struct Tables {
    sessions: HashMap<SessionId, SessionSlot>,
    rooms: HashMap<RoomKey, HashSet<SessionId>>,
}

/// This instance's sessions and the rooms each one is subscribed to.
///
/// Only local state lives here. Shared presence is in the presence store and
/// cross-instance delivery goes through the fanout broker. The lock is a
/// `std` one so an actor's `stopped()` can unregister synchronously.
#[derive(Default, Clone)]
pub struct LocalRoomTable {
    inner: Arc<RwLock<Tables>>,
}

impl LocalRoomTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Tables> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Tables> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a session; frames for it arrive on the returned receiver.
    pub fn register(&self, session_id: SessionId, user_id: Uuid) -> UnboundedReceiver<String> {
        let (tx, rx) = unbounded_channel();
        let mut tables = self.write();
        tables.sessions.insert(
            session_id,
            SessionSlot {
                user_id,
                sender: tx,
                rooms: HashSet::new(),
                focused: None,
            },
        );
        tracing::debug!(
            session_id = %session_id,
            user_id = %user_id,
            sessions = tables.sessions.len(),
            "registered local session"
        );
        rx
    }

    /// Drop a session and all its room memberships. Returns its identity.
    pub fn unregister(&self, session_id: SessionId) -> Option<Uuid> {
        let mut tables = self.write();
        let slot = tables.sessions.remove(&session_id)?;
        for room in &slot.rooms {
            remove_member(&mut tables.rooms, room, session_id);
        }
        tracing::debug!(session_id = %session_id, "unregistered local session");
        Some(slot.user_id)
    }

    /// Returns false when the session is unknown (already disconnected).
    pub fn join(&self, session_id: SessionId, room: RoomKey) -> bool {
        let mut tables = self.write();
        let Some(slot) = tables.sessions.get_mut(&session_id) else {
            return false;
        };
        slot.rooms.insert(room);
        tables.rooms.entry(room).or_default().insert(session_id);
        true
    }

    pub fn leave(&self, session_id: SessionId, room: RoomKey) -> bool {
        let mut tables = self.write();
        let Some(slot) = tables.sessions.get_mut(&session_id) else {
            return false;
        };
        let was_member = slot.rooms.remove(&room);
        if slot.focused.is_some_and(|c| room == RoomKey::Conversation(c)) {
            slot.focused = None;
        }
        remove_member(&mut tables.rooms, &room, session_id);
        was_member
    }

    pub fn set_focus(&self, session_id: SessionId, conversation_id: Option<Uuid>) -> bool {
        let mut tables = self.write();
        match tables.sessions.get_mut(&session_id) {
            Some(slot) => {
                slot.focused = conversation_id;
                true
            }
            None => false,
        }
    }

    pub fn focused(&self, session_id: SessionId) -> Option<Uuid> {
        self.read()
            .sessions
            .get(&session_id)
            .and_then(|slot| slot.focused)
    }

    pub fn rooms_of(&self, session_id: SessionId) -> Vec<RoomKey> {
        self.read()
            .sessions
            .get(&session_id)
            .map(|slot| slot.rooms.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_registered(&self, session_id: SessionId) -> bool {
        self.read().sessions.contains_key(&session_id)
    }

    /// Write `payload` to every local member of `room`, skipping sessions
    /// owned by `skip_user`. Sessions whose receiver is gone are dropped.
    /// Returns the number of frames written.
    pub fn deliver(&self, room: &RoomKey, skip_user: Option<Uuid>, payload: &str) -> usize {
        let mut dead = Vec::new();
        let mut delivered = 0;
        {
            let tables = self.read();
            let Some(members) = tables.rooms.get(room) else {
                return 0;
            };
            for session_id in members {
                let Some(slot) = tables.sessions.get(session_id) else {
                    continue;
                };
                if skip_user == Some(slot.user_id) {
                    continue;
                }
                if slot.sender.send(payload.to_string()).is_ok() {
                    delivered += 1;
                } else {
                    dead.push(*session_id);
                }
            }
        }

        if !dead.is_empty() {
            tracing::debug!(room = %room, dead = dead.len(), "cleaning up dead sessions");
            for session_id in dead {
                self.unregister(session_id);
            }
        }
        delivered
    }

    /// Remove `room` from every local session whose identity fails `keep`.
    /// Returns the number of sessions unsubscribed.
    pub fn retain_members(&self, room: &RoomKey, keep: impl Fn(Uuid) -> bool) -> usize {
        let mut tables = self.write();
        let Some(members) = tables.rooms.get(room) else {
            return 0;
        };
        let departed: Vec<SessionId> = members
            .iter()
            .filter(|session_id| {
                tables
                    .sessions
                    .get(session_id)
                    .is_some_and(|slot| !keep(slot.user_id))
            })
            .copied()
            .collect();

        for session_id in &departed {
            if let Some(slot) = tables.sessions.get_mut(session_id) {
                slot.rooms.remove(room);
                if slot.focused.is_some_and(|c| *room == RoomKey::Conversation(c)) {
                    slot.focused = None;
                }
            }
            remove_member(&mut tables.rooms, room, *session_id);
        }
        departed.len()
    }

    /// Every local session with its identity.
    pub fn sessions(&self) -> Vec<(SessionId, Uuid)> {
        self.read()
            .sessions
            .iter()
            .map(|(session_id, slot)| (*session_id, slot.user_id))
            .collect()
    }

    pub fn subscriber_count(&self, room: &RoomKey) -> usize {
        self.read().rooms.get(room).map_or(0, HashSet::len)
    }

    pub fn session_count(&self) -> usize {
        self.read().sessions.len()
    }
}

fn remove_member(
    rooms: &mut HashMap<RoomKey, HashSet<SessionId>>,
    room: &RoomKey,
    session_id: SessionId,
) {
    if let Some(members) = rooms.get_mut(room) {
        members.remove(&session_id);
        if members.is_empty() {
            rooms.remove(room);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deliver_reaches_room_members_only() {
        let table = LocalRoomTable::new();
        let conv = RoomKey::Conversation(Uuid::new_v4());
        let (a, b) = (SessionId::new(), SessionId::new());
        let mut rx_a = table.register(a, Uuid::new_v4());
        let mut rx_b = table.register(b, Uuid::new_v4());
        table.join(a, conv);

        assert_eq!(table.deliver(&conv, None, "hello"), 1);
        assert_eq!(rx_a.try_recv().unwrap(), "hello");
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn test_skip_user_covers_all_their_sessions() {
        let table = LocalRoomTable::new();
        let conv = RoomKey::Conversation(Uuid::new_v4());
        let actor = Uuid::new_v4();
        let (s1, s2, s3) = (SessionId::new(), SessionId::new(), SessionId::new());
        let _rx1 = table.register(s1, actor);
        let _rx2 = table.register(s2, actor);
        let _rx3 = table.register(s3, Uuid::new_v4());
        for s in [s1, s2, s3] {
            table.join(s, conv);
        }

        assert_eq!(table.deliver(&conv, Some(actor), "key"), 1);
    }

    #[test]
    fn test_unregister_cleans_rooms() {
        let table = LocalRoomTable::new();
        let conv = RoomKey::Conversation(Uuid::new_v4());
        let s = SessionId::new();
        let _rx = table.register(s, Uuid::new_v4());
        table.join(s, conv);
        assert_eq!(table.subscriber_count(&conv), 1);

        table.unregister(s);
        assert_eq!(table.subscriber_count(&conv), 0);
        assert!(!table.join(s, conv));
    }

    #[test]
    fn test_dead_receiver_is_dropped_on_deliver() {
        let table = LocalRoomTable::new();
        let room = RoomKey::User(Uuid::new_v4());
        let s = SessionId::new();
        drop(table.register(s, Uuid::new_v4()));
        table.join(s, room);

        assert_eq!(table.deliver(&room, None, "x"), 0);
        assert!(!table.is_registered(s));
    }

    #[test]
    fn test_retain_members_unsubscribes_rejected_identities() {
        let table = LocalRoomTable::new();
        let conv_id = Uuid::new_v4();
        let room = RoomKey::Conversation(conv_id);
        let (kept, dropped) = (Uuid::new_v4(), Uuid::new_v4());
        let (s1, s2) = (SessionId::new(), SessionId::new());
        let _rx1 = table.register(s1, kept);
        let _rx2 = table.register(s2, dropped);
        table.join(s1, room);
        table.join(s2, room);
        table.set_focus(s2, Some(conv_id));

        assert_eq!(table.retain_members(&room, |user| user == kept), 1);
        assert_eq!(table.subscriber_count(&room), 1);
        assert_eq!(table.focused(s2), None);
        assert!(table.is_registered(s2));
    }

    #[test]
    fn test_leave_clears_focus_on_that_room() {
        let table = LocalRoomTable::new();
        let conv_id = Uuid::new_v4();
        let s = SessionId::new();
        let _rx = table.register(s, Uuid::new_v4());
        table.join(s, RoomKey::Conversation(conv_id));
        table.set_focus(s, Some(conv_id));

        table.leave(s, RoomKey::Conversation(conv_id));
        assert_eq!(table.focused(s), None);
    }
}
