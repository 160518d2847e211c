use crate::error::AppResult;
use crate::metrics::{PRESENCE_ONLINE_IDENTITIES, PRESENCE_REAPED_SESSIONS_TOTAL};
use crate::models::{OnlineUser, UserDisplay};
use crate::store::{PresenceStore, UserDirectory};
use crate::websocket::events::ServerEvent;
use crate::websocket::fanout::FanoutBus;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// How long an instance counts as alive after its last heartbeat.
pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(30);

/// Shared online registry. An identity is online while it has at least one
/// session on any live instance.
pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
    users: Arc<dyn UserDirectory>,
    bus: FanoutBus,
    heartbeat_ttl: Duration,
}

impl PresenceRegistry {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        users: Arc<dyn UserDirectory>,
        bus: FanoutBus,
        heartbeat_ttl: Duration,
    ) -> Self {
        Self {
            store,
            users,
            bus,
            heartbeat_ttl,
        }
    }

    fn instance_id(&self) -> &str {
        self.bus.instance_id()
    }

    pub fn heartbeat_ttl(&self) -> Duration {
        self.heartbeat_ttl
    }

    pub async fn connect(&self, user_id: Uuid, session_id: Uuid) -> AppResult<()> {
        // Snapshot once per identity; later connects reuse it.
        if self.store.cached_display(user_id).await?.is_none() {
            let display = self
                .users
                .display(user_id)
                .await?
                .unwrap_or_else(UserDisplay::unknown);
            self.store.cache_display(user_id, &display).await?;
        }

        // The owning instance must be known alive before it owns sessions.
        self.store
            .heartbeat(self.instance_id(), self.heartbeat_ttl)
            .await?;
        self.store
            .add_session(self.instance_id(), user_id, session_id)
            .await?;
        tracing::debug!(user_id = %user_id, session_id = %session_id, "presence connect");
        self.broadcast().await
    }

    pub async fn disconnect(&self, user_id: Uuid, session_id: Uuid) -> AppResult<()> {
        let went_offline = self
            .store
            .remove_session(self.instance_id(), user_id, session_id)
            .await?;
        tracing::debug!(
            user_id = %user_id,
            session_id = %session_id,
            went_offline,
            "presence disconnect"
        );
        self.broadcast().await
    }

    /// Refresh this instance's heartbeat, make its recorded sessions match
    /// the `(user, session)` pairs live in the local table, then reap the
    /// sessions of instances whose heartbeat lapsed. Broadcasts when
    /// anything changed.
    pub async fn maintain(&self, local: &[(Uuid, Uuid)]) -> AppResult<()> {
        self.store
            .heartbeat(self.instance_id(), self.heartbeat_ttl)
            .await?;

        let recorded: HashSet<(Uuid, Uuid)> = self
            .store
            .instance_sessions(self.instance_id())
            .await?
            .into_iter()
            .collect();
        let live: HashSet<(Uuid, Uuid)> = local.iter().copied().collect();

        let mut changed = 0;
        for (user_id, session_id) in recorded.difference(&live) {
            // A disconnect whose presence update never landed.
            self.store
                .remove_session(self.instance_id(), *user_id, *session_id)
                .await?;
            changed += 1;
        }
        for (user_id, session_id) in live.difference(&recorded) {
            self.store
                .add_session(self.instance_id(), *user_id, *session_id)
                .await?;
            changed += 1;
        }
        if changed > 0 {
            tracing::info!(changed, "reconciled local presence sessions");
        }

        changed += self.reap_lapsed().await?;
        if changed > 0 {
            self.broadcast().await?;
        }
        Ok(())
    }

    /// Remove every session owned by an instance whose heartbeat lapsed.
    /// Returns the number of sessions removed.
    pub async fn reap_lapsed(&self) -> AppResult<usize> {
        let mut reaped = 0;
        for instance in self.store.lapsed_instances().await? {
            if instance == self.instance_id() {
                continue;
            }
            let sessions = self.store.instance_sessions(&instance).await?;
            for (user_id, session_id) in &sessions {
                self.store
                    .remove_session(&instance, *user_id, *session_id)
                    .await?;
            }
            self.store.forget_instance(&instance).await?;

            tracing::warn!(
                instance = %instance,
                sessions = sessions.len(),
                "reaped presence of lapsed instance"
            );
            PRESENCE_REAPED_SESSIONS_TOTAL.inc_by(sessions.len() as u64);
            reaped += sessions.len();
        }
        Ok(reaped)
    }

    pub async fn online(&self) -> AppResult<Vec<OnlineUser>> {
        Ok(self
            .store
            .online()
            .await?
            .iter()
            .map(OnlineUser::from)
            .collect())
    }

    /// Push each online identity the list of every *other* online identity.
    async fn broadcast(&self) -> AppResult<()> {
        let online = self.online().await?;
        PRESENCE_ONLINE_IDENTITIES.set(online.len() as i64);

        for recipient in &online {
            let users: Vec<OnlineUser> = online
                .iter()
                .filter(|u| u.user_id != recipient.user_id)
                .cloned()
                .collect();
            self.bus
                .to_user(recipient.user_id, ServerEvent::LoggedUsersUpdate { users })
                .await?;
        }
        Ok(())
    }
}
