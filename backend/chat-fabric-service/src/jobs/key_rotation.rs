use crate::error::AppResult;
use crate::services::envelope::{until_next_slot, EnvelopeKeyService};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Rotates the envelope key ring once per period across the whole fleet.
/// Ticks fall on period boundaries, so every instance competes for the same
/// period slot and at most one of them rotates in it.
pub struct KeyRotationJob {
    envelope: Arc<EnvelopeKeyService>,
    period: Duration,
    owner: String,
}

impl KeyRotationJob {
    pub fn new(envelope: Arc<EnvelopeKeyService>, period: Duration, owner: impl Into<String>) -> Self {
        Self {
            envelope,
            period,
            owner: owner.into(),
        }
    }

    /// Returns true when this instance performed the rotation.
    pub async fn run_once(&self) -> AppResult<bool> {
        self.envelope
            .rotate_if_unclaimed(&self.owner, self.period)
            .await
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let first = Instant::now() + until_next_slot(Utc::now(), self.period);
            let mut ticker = interval_at(first, self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(period_secs = self.period.as_secs(), "envelope key rotation job started");

            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(true) => tracing::info!("envelope key rotation completed"),
                    Ok(false) => {}
                    Err(e) => tracing::error!(error = %e, "envelope key rotation failed"),
                }
            }
        })
    }
}
