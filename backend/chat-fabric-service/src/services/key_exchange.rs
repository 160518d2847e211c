//! Per-conversation ledger of participants' public keys.
//!
//! The ledger stores and redistributes opaque key material. It never looks
//! at what the key or any message payload contains.

use super::require_participant;
use crate::error::{AppError, AppResult};
use crate::models::{ExchangeStatus, KeyEntry, KeyExchangeRecord};
use crate::store::{ConversationDirectory, KeyLedgerStore};
use crate::websocket::events::ServerEvent;
use crate::websocket::fanout::FanoutBus;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Attempts per write before contention is reported as transient.
pub const KEY_LEDGER_CAS_RETRIES: usize = 5;
pub const MAX_PUBLIC_KEY_LEN: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySubmission {
    pub key_id: String,
    pub key_version: u32,
    pub exchange_status: ExchangeStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantKeys {
    pub user_id: Uuid,
    pub active_key: KeyEntry,
    /// Retained entries, newest first, active one included.
    pub history: Vec<KeyEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKeys {
    pub conversation_id: Uuid,
    pub exchange_status: ExchangeStatus,
    pub keys: Vec<ParticipantKeys>,
}

pub struct KeyExchangeService {
    ledger: Arc<dyn KeyLedgerStore>,
    conversations: Arc<dyn ConversationDirectory>,
    bus: FanoutBus,
}

impl KeyExchangeService {
    pub fn new(
        ledger: Arc<dyn KeyLedgerStore>,
        conversations: Arc<dyn ConversationDirectory>,
        bus: FanoutBus,
    ) -> Self {
        Self {
            ledger,
            conversations,
            bus,
        }
    }

    pub async fn exchange_key(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        public_key: &str,
    ) -> AppResult<KeySubmission> {
        self.submit(conversation_id, user_id, public_key, false).await
    }

    /// Same ledger effect as [`Self::exchange_key`], recorded as a rotation.
    pub async fn rotate_key(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        public_key: &str,
    ) -> AppResult<KeySubmission> {
        let submission = self.submit(conversation_id, user_id, public_key, true).await?;
        tracing::info!(
            audit = "key_rotation",
            conversation_id = %conversation_id,
            user_id = %user_id,
            key_id = %submission.key_id,
            key_version = submission.key_version,
            "participant rotated conversation key"
        );
        Ok(submission)
    }

    async fn submit(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        public_key: &str,
        rotated: bool,
    ) -> AppResult<KeySubmission> {
        let public_key = public_key.trim();
        if public_key.is_empty() {
            return Err(AppError::BadRequest("publicKey is required".into()));
        }
        if public_key.len() > MAX_PUBLIC_KEY_LEN {
            return Err(AppError::BadRequest(format!(
                "publicKey exceeds {MAX_PUBLIC_KEY_LEN} bytes"
            )));
        }

        let conversation =
            require_participant(self.conversations.as_ref(), conversation_id, user_id).await?;

        let mut committed = None;
        for attempt in 1..=KEY_LEDGER_CAS_RETRIES {
            let stored = self.ledger.load(conversation_id).await?;
            let mut record = KeyExchangeRecord::from_stored(conversation_id, stored);
            record.prune(&conversation.participants);
            let entry = record.push_key(user_id, public_key.to_string(), Utc::now());
            record.recompute_status(&conversation.participants);

            if self
                .ledger
                .compare_and_swap(conversation_id, record.revision, &record.to_stored_next())
                .await?
            {
                committed = Some((entry, record.status));
                break;
            }
            tracing::debug!(
                conversation_id = %conversation_id,
                attempt,
                "key ledger revision conflict, retrying"
            );
        }

        let Some((entry, status)) = committed else {
            tracing::warn!(conversation_id = %conversation_id, "key ledger contention exhausted retries");
            return Err(AppError::TransientStore("key ledger contention".into()));
        };

        let event = ServerEvent::KeyUpdated {
            conversation_id,
            user_id,
            public_key: entry.public_key.clone(),
            key_id: entry.key_id.clone(),
            key_version: entry.version,
            exchange_status: status,
            rotated,
        };
        if let Err(e) = self.bus.to_room_except(conversation_id, user_id, event).await {
            // The key is committed; peers will pick it up on their next fetch.
            tracing::warn!(conversation_id = %conversation_id, error = %e, "key update fanout failed");
        }

        Ok(KeySubmission {
            key_id: entry.key_id,
            key_version: entry.version,
            exchange_status: status,
        })
    }

    /// Every other participant's active key plus retained history.
    pub async fn fetch_keys(
        &self,
        conversation_id: Uuid,
        requester: Uuid,
    ) -> AppResult<ConversationKeys> {
        let conversation =
            require_participant(self.conversations.as_ref(), conversation_id, requester).await?;
        let record = self.load_normalized(conversation_id, &conversation.participants).await?;

        let keys = conversation
            .participants
            .iter()
            .filter(|p| **p != requester)
            .filter_map(|p| {
                record.active_key(*p).map(|active| ParticipantKeys {
                    user_id: *p,
                    active_key: active.clone(),
                    history: record.history(*p).to_vec(),
                })
            })
            .collect();

        Ok(ConversationKeys {
            conversation_id,
            exchange_status: record.status,
            keys,
        })
    }

    pub async fn status(&self, conversation_id: Uuid, requester: Uuid) -> AppResult<ExchangeStatus> {
        let conversation =
            require_participant(self.conversations.as_ref(), conversation_id, requester).await?;
        Ok(self
            .load_normalized(conversation_id, &conversation.participants)
            .await?
            .status)
    }

    /// Read, normalize and prune against current membership. Records still
    /// holding legacy single-object entries are written back in array form.
    async fn load_normalized(
        &self,
        conversation_id: Uuid,
        participants: &[Uuid],
    ) -> AppResult<KeyExchangeRecord> {
        let stored = self.ledger.load(conversation_id).await?;
        let migrate = stored.as_ref().is_some_and(|s| s.has_legacy_entries());

        let mut record = KeyExchangeRecord::from_stored(conversation_id, stored);
        record.prune(participants);
        record.recompute_status(participants);

        if migrate {
            match self
                .ledger
                .compare_and_swap(conversation_id, record.revision, &record.to_stored_next())
                .await
            {
                Ok(true) => {
                    record.revision += 1;
                    tracing::info!(conversation_id = %conversation_id, "migrated legacy key ledger entries");
                }
                // A concurrent writer already stored the array form.
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(conversation_id = %conversation_id, error = %e, "legacy key migration failed");
                }
            }
        }
        Ok(record)
    }
}
