use redis::aio::{ConnectionManager, PubSub};
use redis::{Client, RedisResult};

/// Shared Redis handle: a multiplexed, auto-reconnecting manager for commands
/// plus the client for dedicated pub/sub connections.
#[derive(Clone)]
pub struct RedisClient {
    client: Client,
    manager: ConnectionManager,
}

impl RedisClient {
    pub async fn from_url(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, manager })
    }

    /// Cheap clone of the shared manager; safe to use concurrently.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// PubSub requires a dedicated connection, not the multiplexed one.
    #[allow(deprecated)]
    pub async fn pubsub(&self) -> RedisResult<PubSub> {
        let conn = self.client.get_async_connection().await?;
        Ok(conn.into_pubsub())
    }
}
