//! Cross-instance fanout.
//!
//! Every event for a room is published once on the shared [`Broker`]. Each
//! instance runs one listener that feeds broker messages into its
//! [`LocalRoomTable`]. Local sessions are reached only through that path, so
//! an instance never delivers the same event twice.
//!
//! Conversation membership can change behind the fabric's back, so the
//! listener re-reads the participant list before each conversation-room
//! delivery and unsubscribes sessions of identities that left.

use crate::error::AppResult;
use crate::metrics::{FANOUT_DELIVERED_TOTAL, FANOUT_PUBLISHED_TOTAL};
use crate::redis_client::RedisClient;
use crate::store::ConversationDirectory;
use crate::websocket::events::ServerEvent;
use crate::websocket::registry::{LocalRoomTable, RoomKey};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

const CHANNEL_PREFIX: &str = "fabric:";
const MEMORY_BROKER_CAPACITY: usize = 4096;
const RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub channel: String,
    pub payload: String,
}

pub fn channel_for(room: &RoomKey) -> String {
    format!("{CHANNEL_PREFIX}{room}")
}

/// Shared publish/subscribe transport between fabric instances.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> AppResult<()>;

    /// Subscribe to every fabric channel. The subscription is live when this
    /// returns, so nothing published afterwards is missed.
    async fn subscribe(&self) -> AppResult<BoxStream<'static, BrokerMessage>>;
}

// ============================================================================
// Brokers
// ============================================================================

/// In-process broker. All fabrics holding the same instance see each other's
/// publishes, which is how tests model several server processes.
#[derive(Clone)]
pub struct MemoryBroker {
    tx: broadcast::Sender<BrokerMessage>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(MEMORY_BROKER_CAPACITY);
        Self { tx }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> AppResult<()> {
        // No receivers just means no instance is listening yet.
        let _ = self.tx.send(BrokerMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    async fn subscribe(&self) -> AppResult<BoxStream<'static, BrokerMessage>> {
        let stream = BroadcastStream::new(self.tx.subscribe()).filter_map(|item| async move {
            match item {
                Ok(msg) => Some(msg),
                Err(e) => {
                    tracing::warn!(error = %e, "in-process broker lagged, frames dropped");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Redis pub/sub broker. Publishes go through the shared connection manager;
/// the subscription needs its own dedicated connection.
#[derive(Clone)]
pub struct RedisBroker {
    redis: RedisClient,
}

impl RedisBroker {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, channel: &str, payload: String) -> AppResult<()> {
        let mut conn = self.redis.connection();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self) -> AppResult<BoxStream<'static, BrokerMessage>> {
        let mut pubsub = self.redis.pubsub().await?;
        pubsub.psubscribe(format!("{CHANNEL_PREFIX}*")).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BrokerMessage { channel, payload }),
                Err(e) => {
                    tracing::warn!(channel = %channel, error = %e, "dropping non-text broker payload");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ============================================================================
// Bus
// ============================================================================

/// What travels over the broker for one event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FanoutEnvelope {
    pub room: RoomKey,
    /// Sessions of this identity are skipped on every instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_user: Option<Uuid>,
    pub origin: String,
    pub event: Value,
}

#[derive(Clone)]
pub struct FanoutBus {
    broker: Arc<dyn Broker>,
    table: LocalRoomTable,
    conversations: Arc<dyn ConversationDirectory>,
    instance_id: Arc<str>,
}

impl FanoutBus {
    pub fn new(
        broker: Arc<dyn Broker>,
        table: LocalRoomTable,
        conversations: Arc<dyn ConversationDirectory>,
        instance_id: &str,
    ) -> Self {
        Self {
            broker,
            table,
            conversations,
            instance_id: Arc::from(instance_id),
        }
    }

    pub fn table(&self) -> &LocalRoomTable {
        &self.table
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub async fn to_room(&self, conversation_id: Uuid, event: ServerEvent) -> AppResult<()> {
        self.publish(RoomKey::Conversation(conversation_id), None, event)
            .await
    }

    /// Room delivery that skips every session of `skip_user`.
    pub async fn to_room_except(
        &self,
        conversation_id: Uuid,
        skip_user: Uuid,
        event: ServerEvent,
    ) -> AppResult<()> {
        self.publish(RoomKey::Conversation(conversation_id), Some(skip_user), event)
            .await
    }

    /// Personal room: every session of `user_id` on any instance.
    pub async fn to_user(&self, user_id: Uuid, event: ServerEvent) -> AppResult<()> {
        self.publish(RoomKey::User(user_id), None, event).await
    }

    async fn publish(
        &self,
        room: RoomKey,
        skip_user: Option<Uuid>,
        event: ServerEvent,
    ) -> AppResult<()> {
        let event_type = event.event_type();
        let envelope = FanoutEnvelope {
            room,
            skip_user,
            origin: self.instance_id.to_string(),
            event: serde_json::to_value(&event)?,
        };
        let payload = serde_json::to_string(&envelope)?;

        self.broker.publish(&channel_for(&room), payload).await?;
        FANOUT_PUBLISHED_TOTAL
            .with_label_values(&[event_type])
            .inc();
        tracing::debug!(room = %room, event = event_type, "published fanout event");
        Ok(())
    }

    /// Deliver one broker message to local sessions. Returns frames written.
    pub async fn dispatch(&self, msg: &BrokerMessage) -> usize {
        if !msg.channel.starts_with(CHANNEL_PREFIX) {
            return 0;
        }
        let envelope: FanoutEnvelope = match serde_json::from_str(&msg.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(channel = %msg.channel, error = %e, "malformed fanout envelope");
                return 0;
            }
        };
        let frame = match serde_json::to_string(&envelope.event) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(error = %e, "unserializable fanout event");
                return 0;
            }
        };

        if let RoomKey::Conversation(conversation_id) = envelope.room {
            if self.table.subscriber_count(&envelope.room) == 0 {
                return 0;
            }
            if !self.revoke_departed(conversation_id).await {
                return 0;
            }
        }

        let delivered = self.table.deliver(&envelope.room, envelope.skip_user, &frame);
        FANOUT_DELIVERED_TOTAL.inc_by(delivered as u64);
        delivered
    }

    /// Unsubscribe local sessions whose identity is no longer a participant.
    /// Returns false when the room event must be withheld: the conversation
    /// is gone or its membership could not be read.
    async fn revoke_departed(&self, conversation_id: Uuid) -> bool {
        let room = RoomKey::Conversation(conversation_id);
        let (conversation, deliver) = match self.conversations.get(conversation_id).await {
            Ok(Some(conversation)) => (Some(conversation), true),
            Ok(None) => (None, false),
            Err(e) => {
                tracing::error!(
                    conversation_id = %conversation_id,
                    error = %e,
                    "membership check failed, withholding room event"
                );
                return false;
            }
        };

        let revoked = self.table.retain_members(&room, |user_id| {
            conversation
                .as_ref()
                .is_some_and(|c| c.is_participant(user_id))
        });
        if revoked > 0 {
            tracing::info!(
                conversation_id = %conversation_id,
                revoked,
                "revoked room subscriptions of departed participants"
            );
        }
        deliver
    }

    /// Subscribe, then spawn the delivery loop. Once this returns, every
    /// later publish on any instance reaches this instance's sessions.
    pub async fn start_listener(&self) -> AppResult<JoinHandle<()>> {
        let stream = self.broker.subscribe().await?;
        let bus = self.clone();
        tracing::info!(instance = %self.instance_id, "fanout listener subscribed");
        Ok(tokio::spawn(async move { bus.listen(stream).await }))
    }

    async fn listen(self, mut stream: BoxStream<'static, BrokerMessage>) {
        loop {
            while let Some(msg) = stream.next().await {
                self.dispatch(&msg).await;
            }

            tracing::warn!(instance = %self.instance_id, "broker subscription ended, resubscribing");
            stream = loop {
                tokio::time::sleep(RESUBSCRIBE_BACKOFF).await;
                match self.broker.subscribe().await {
                    Ok(stream) => break stream,
                    Err(e) => {
                        tracing::error!(error = %e, "broker resubscribe failed");
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Conversation;
    use crate::store::memory::MemoryDirectory;
    use crate::websocket::registry::SessionId;

    fn bus_over(table: LocalRoomTable, directory: Arc<MemoryDirectory>) -> FanoutBus {
        FanoutBus::new(Arc::new(MemoryBroker::new()), table, directory, "test")
    }

    #[tokio::test]
    async fn test_publish_reaches_local_session_through_broker() {
        let table = LocalRoomTable::new();
        let bus = bus_over(table.clone(), Arc::new(MemoryDirectory::new()));
        let _listener = bus.start_listener().await.unwrap();

        let user = Uuid::new_v4();
        let session = SessionId::new();
        let mut rx = table.register(session, user);
        table.join(session, RoomKey::User(user));

        bus.to_user(
            user,
            ServerEvent::LoggedUsersUpdate { users: Vec::new() },
        )
        .await
        .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "loggedUsersUpdate");
    }

    #[tokio::test]
    async fn test_dispatch_ignores_foreign_channels() {
        let bus = bus_over(LocalRoomTable::new(), Arc::new(MemoryDirectory::new()));
        let msg = BrokerMessage {
            channel: "conversation:abc".into(),
            payload: "{}".into(),
        };
        assert_eq!(bus.dispatch(&msg).await, 0);
    }

    #[tokio::test]
    async fn test_dispatch_drops_departed_participant_from_room() {
        let table = LocalRoomTable::new();
        let directory = Arc::new(MemoryDirectory::new());
        let bus = bus_over(table.clone(), directory.clone());

        let (stays, leaves) = (Uuid::new_v4(), Uuid::new_v4());
        let conversation_id = Uuid::new_v4();
        directory
            .insert_conversation(Conversation {
                id: conversation_id,
                participants: vec![stays],
                auto_delete_after_secs: 0,
            })
            .await;

        let room = RoomKey::Conversation(conversation_id);
        let (s_stays, s_leaves) = (SessionId::new(), SessionId::new());
        let mut rx_stays = table.register(s_stays, stays);
        let mut rx_leaves = table.register(s_leaves, leaves);
        table.join(s_stays, room);
        table.join(s_leaves, room);

        let envelope = FanoutEnvelope {
            room,
            skip_user: None,
            origin: "other".into(),
            event: serde_json::json!({ "event": "messageEdited", "data": {} }),
        };
        let msg = BrokerMessage {
            channel: channel_for(&room),
            payload: serde_json::to_string(&envelope).unwrap(),
        };

        assert_eq!(bus.dispatch(&msg).await, 1);
        assert!(rx_stays.try_recv().is_ok());
        assert!(rx_leaves.try_recv().is_err());
        assert!(!table.rooms_of(s_leaves).contains(&room));
    }

    #[test]
    fn test_channel_naming() {
        let id = Uuid::nil();
        assert_eq!(
            channel_for(&RoomKey::Conversation(id)),
            format!("fabric:conversation:{id}")
        );
    }
}
