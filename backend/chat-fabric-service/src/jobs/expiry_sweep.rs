use crate::error::AppResult;
use crate::services::message_service::MessageService;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// Hard-deletes messages whose conversation auto-delete window has passed.
pub struct ExpirySweepJob {
    messages: Arc<MessageService>,
    every: Duration,
}

impl ExpirySweepJob {
    pub fn new(messages: Arc<MessageService>, every: Duration) -> Self {
        Self { messages, every }
    }

    pub async fn run_once(&self) -> AppResult<usize> {
        self.messages.sweep_expired(Utc::now()).await
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!(every_secs = self.every.as_secs(), "expiry sweep job started");

            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(0) => {}
                    Ok(deleted) => tracing::info!(deleted, "expiry sweep removed messages"),
                    Err(e) => tracing::error!(error = %e, "expiry sweep failed"),
                }
            }
        })
    }
}
