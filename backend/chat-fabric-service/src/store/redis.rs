//! Redis-backed presence registry and envelope key ring.
//!
//! Presence keys share the `{presence}` hash tag so the multi-key script
//! stays valid on a cluster. Each session is also recorded under its owning
//! instance, whose liveness is an expiring heartbeat key.

use super::{KeyRingStore, PresenceStore};
use crate::error::{AppError, AppResult};
use crate::models::{PresenceEntry, RingKey, UserDisplay};
use crate::redis_client::RedisClient;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::Script;
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

const PRESENCE_ONLINE_KEY: &str = "{presence}:online";
const PRESENCE_DISPLAY_KEY: &str = "{presence}:display";
const PRESENCE_INSTANCES_KEY: &str = "{presence}:instances";

const KEY_RING_KEY: &str = "envelope:keyring";
const ROTATION_CLAIM_PREFIX: &str = "envelope:keyring:rotation:";

fn sessions_key(user_id: Uuid) -> String {
    format!("{{presence}}:sessions:{user_id}")
}

fn instance_alive_key(instance_id: &str) -> String {
    format!("{{presence}}:instance:{instance_id}")
}

fn instance_sessions_key(instance_id: &str) -> String {
    format!("{{presence}}:instance:{instance_id}:sessions")
}

/// `user:session`, the member stored in an instance's session set.
fn owned_member(user_id: Uuid, session_id: Uuid) -> String {
    format!("{user_id}:{session_id}")
}

fn parse_owned_member(raw: &str) -> Option<(Uuid, Uuid)> {
    let (user, session) = raw.split_once(':')?;
    Some((parse_uuid(user, "user")?, parse_uuid(session, "session")?))
}

/// Remove one session from its instance and its identity; when the identity
/// has none left, drop it from the online set. Returns 1 only for the
/// removal that emptied the set.
static REMOVE_SESSION_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        redis.call('SREM', KEYS[3], ARGV[3])
        redis.call('SREM', KEYS[1], ARGV[1])
        if redis.call('SCARD', KEYS[1]) == 0 then
            redis.call('DEL', KEYS[1])
            return redis.call('SREM', KEYS[2], ARGV[2])
        end
        return 0
        "#,
    )
});

static INIT_RING_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        if redis.call('EXISTS', KEYS[1]) == 0 then
            redis.call('RPUSH', KEYS[1], ARGV[1])
            return 1
        end
        return 0
        "#,
    )
});

fn parse_uuid(raw: &str, what: &str) -> Option<Uuid> {
    match Uuid::parse_str(raw) {
        Ok(id) => Some(id),
        Err(_) => {
            tracing::warn!(value = raw, what, "skipping malformed presence member");
            None
        }
    }
}

// ============================================================================
// Presence
// ============================================================================

#[derive(Clone)]
pub struct RedisPresenceStore {
    redis: RedisClient,
}

impl RedisPresenceStore {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn add_session(&self, instance_id: &str, user_id: Uuid, session_id: Uuid) -> AppResult<()> {
        let mut conn = self.redis.connection();
        let _: () = redis::pipe()
            .atomic()
            .sadd(sessions_key(user_id), session_id.to_string())
            .ignore()
            .sadd(PRESENCE_ONLINE_KEY, user_id.to_string())
            .ignore()
            .sadd(
                instance_sessions_key(instance_id),
                owned_member(user_id, session_id),
            )
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove_session(
        &self,
        instance_id: &str,
        user_id: Uuid,
        session_id: Uuid,
    ) -> AppResult<bool> {
        let mut conn = self.redis.connection();
        let removed: i64 = REMOVE_SESSION_SCRIPT
            .key(sessions_key(user_id))
            .key(PRESENCE_ONLINE_KEY)
            .key(instance_sessions_key(instance_id))
            .arg(session_id.to_string())
            .arg(user_id.to_string())
            .arg(owned_member(user_id, session_id))
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn heartbeat(&self, instance_id: &str, ttl: Duration) -> AppResult<()> {
        let mut conn = self.redis.connection();
        let _: () = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(instance_alive_key(instance_id))
            .arg(1)
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .ignore()
            .sadd(PRESENCE_INSTANCES_KEY, instance_id)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn instance_sessions(&self, instance_id: &str) -> AppResult<Vec<(Uuid, Uuid)>> {
        let mut conn = self.redis.connection();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(instance_sessions_key(instance_id))
            .query_async(&mut conn)
            .await?;
        Ok(members
            .iter()
            .filter_map(|m| parse_owned_member(m))
            .collect())
    }

    async fn lapsed_instances(&self) -> AppResult<Vec<String>> {
        let mut conn = self.redis.connection();
        let mut instances: Vec<String> = redis::cmd("SMEMBERS")
            .arg(PRESENCE_INSTANCES_KEY)
            .query_async(&mut conn)
            .await?;
        if instances.is_empty() {
            return Ok(Vec::new());
        }
        instances.sort();

        let mut pipe = redis::pipe();
        for instance in &instances {
            pipe.exists(instance_alive_key(instance));
        }
        let alive: Vec<bool> = pipe.query_async(&mut conn).await?;

        Ok(instances
            .into_iter()
            .zip(alive)
            .filter(|(_, alive)| !alive)
            .map(|(instance, _)| instance)
            .collect())
    }

    async fn forget_instance(&self, instance_id: &str) -> AppResult<()> {
        let mut conn = self.redis.connection();
        let _: () = redis::pipe()
            .atomic()
            .srem(PRESENCE_INSTANCES_KEY, instance_id)
            .ignore()
            .del(instance_sessions_key(instance_id))
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn cached_display(&self, user_id: Uuid) -> AppResult<Option<UserDisplay>> {
        let mut conn = self.redis.connection();
        let raw: Option<String> = redis::cmd("HGET")
            .arg(PRESENCE_DISPLAY_KEY)
            .arg(user_id.to_string())
            .query_async(&mut conn)
            .await?;
        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(AppError::from)
    }

    async fn cache_display(&self, user_id: Uuid, display: &UserDisplay) -> AppResult<()> {
        let mut conn = self.redis.connection();
        let _: () = redis::cmd("HSET")
            .arg(PRESENCE_DISPLAY_KEY)
            .arg(user_id.to_string())
            .arg(serde_json::to_string(display)?)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn online(&self) -> AppResult<Vec<PresenceEntry>> {
        let mut conn = self.redis.connection();
        let members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(PRESENCE_ONLINE_KEY)
            .query_async(&mut conn)
            .await?;
        let mut users: Vec<Uuid> = members
            .iter()
            .filter_map(|m| parse_uuid(m, "user"))
            .collect();
        users.sort();
        if users.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for user in &users {
            pipe.smembers(sessions_key(*user));
        }
        let sessions: Vec<Vec<String>> = pipe.query_async(&mut conn).await?;

        let fields: Vec<String> = users.iter().map(Uuid::to_string).collect();
        let displays: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(PRESENCE_DISPLAY_KEY)
            .arg(&fields)
            .query_async(&mut conn)
            .await?;

        let entries = users
            .into_iter()
            .zip(sessions)
            .zip(displays)
            .filter_map(|((user_id, sessions), display)| {
                let sessions: BTreeSet<Uuid> = sessions
                    .iter()
                    .filter_map(|s| parse_uuid(s, "session"))
                    .collect();
                // Raced with the last disconnect.
                if sessions.is_empty() {
                    return None;
                }
                let display = display.and_then(|raw| serde_json::from_str(&raw).ok());
                Some(PresenceEntry {
                    user_id,
                    display,
                    sessions,
                })
            })
            .collect();
        Ok(entries)
    }
}

// ============================================================================
// Envelope key ring
// ============================================================================

#[derive(Clone)]
pub struct RedisKeyRing {
    redis: RedisClient,
}

impl RedisKeyRing {
    pub fn new(redis: RedisClient) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl KeyRingStore for RedisKeyRing {
    async fn keys(&self) -> AppResult<Vec<RingKey>> {
        let mut conn = self.redis.connection();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(KEY_RING_KEY)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        raw.iter()
            .map(|s| serde_json::from_str(s).map_err(AppError::from))
            .collect()
    }

    async fn init_if_absent(&self, key: &RingKey) -> AppResult<bool> {
        let mut conn = self.redis.connection();
        let seeded: i64 = INIT_RING_SCRIPT
            .key(KEY_RING_KEY)
            .arg(serde_json::to_string(key)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(seeded == 1)
    }

    async fn prepend_and_trim(&self, key: &RingKey, capacity: usize) -> AppResult<()> {
        let mut conn = self.redis.connection();
        let last = capacity.saturating_sub(1) as isize;
        let _: () = redis::pipe()
            .atomic()
            .lpush(KEY_RING_KEY, serde_json::to_string(key)?)
            .ignore()
            .ltrim(KEY_RING_KEY, 0, last)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn claim_rotation(&self, slot: u64, owner: &str, ttl: Duration) -> AppResult<bool> {
        let mut conn = self.redis.connection();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(format!("{ROTATION_CLAIM_PREFIX}{slot}"))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;
        Ok(claimed.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presence_keys_share_hash_tag() {
        let key = sessions_key(Uuid::nil());
        assert!(key.starts_with("{presence}"));
        assert!(PRESENCE_ONLINE_KEY.starts_with("{presence}"));
        assert!(PRESENCE_DISPLAY_KEY.starts_with("{presence}"));
        assert!(PRESENCE_INSTANCES_KEY.starts_with("{presence}"));
        assert!(instance_alive_key("node-a").starts_with("{presence}"));
        assert!(instance_sessions_key("node-a").starts_with("{presence}"));
    }

    #[test]
    fn test_owned_member_parses_back() {
        let (user, session) = (Uuid::new_v4(), Uuid::new_v4());
        let member = owned_member(user, session);
        assert_eq!(parse_owned_member(&member), Some((user, session)));
        assert_eq!(parse_owned_member("garbage"), None);
    }
}
