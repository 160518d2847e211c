use crate::error::AppResult;
use crate::services::ChatFabric;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Keeps this instance's presence heartbeat alive and reaps the sessions of
/// instances that stopped heartbeating.
pub struct PresenceHeartbeatJob {
    fabric: ChatFabric,
    every: Duration,
}

impl PresenceHeartbeatJob {
    /// Ticks three times per TTL so one missed tick never lapses the instance.
    pub fn new(fabric: ChatFabric) -> Self {
        let every = fabric.presence.heartbeat_ttl() / 3;
        Self { fabric, every }
    }

    pub async fn run_once(&self) -> AppResult<()> {
        self.fabric.maintain_presence().await
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(every_ms = self.every.as_millis() as u64, "presence heartbeat job started");

            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    tracing::error!(error = %e, "presence heartbeat failed");
                }
            }
        })
    }
}
