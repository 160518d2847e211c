//! Key exchange ledger records and the server-side envelope key ring.
//!
//! Participant key data reaches us in two stored shapes: the current array of
//! versioned entries and an older single-object form. Both deserialize into
//! [`StoredParticipantKeys`] and are normalized to the array form by
//! [`KeyExchangeRecord::from_stored`], so nothing past this module ever sees
//! the legacy shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Entries retained per participant, newest first.
pub const MAX_KEY_HISTORY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeStatus {
    #[default]
    None,
    Partial,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyEntry {
    pub public_key: String,
    pub key_id: String,
    pub version: u32,
    pub exchanged_at: DateTime<Utc>,
    pub is_active: bool,
}

/// Pre-versioning participant key object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyKey {
    pub public_key: String,
    #[serde(default)]
    pub key_id: Option<String>,
    #[serde(default)]
    pub exchanged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredParticipantKeys {
    History(Vec<KeyEntry>),
    Legacy(LegacyKey),
}

impl StoredParticipantKeys {
    fn into_history(self) -> Vec<KeyEntry> {
        match self {
            StoredParticipantKeys::History(mut entries) => {
                entries.sort_by(|a, b| b.version.cmp(&a.version));
                entries.truncate(MAX_KEY_HISTORY);
                entries
            }
            StoredParticipantKeys::Legacy(legacy) => vec![KeyEntry {
                key_id: legacy
                    .key_id
                    .unwrap_or_else(|| format!("legacy-{}", Uuid::new_v4().simple())),
                public_key: legacy.public_key,
                version: 1,
                exchanged_at: legacy.exchanged_at.unwrap_or_default(),
                is_active: true,
            }],
        }
    }

    pub fn is_legacy(&self) -> bool {
        matches!(self, StoredParticipantKeys::Legacy(_))
    }
}

/// Persisted form, as read from and written to the ledger store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeyRecord {
    #[serde(default)]
    pub status: ExchangeStatus,
    #[serde(default)]
    pub participants: BTreeMap<Uuid, StoredParticipantKeys>,
    /// Compare-and-swap token; 0 means never written.
    #[serde(default)]
    pub revision: i64,
}

impl StoredKeyRecord {
    pub fn has_legacy_entries(&self) -> bool {
        self.participants.values().any(StoredParticipantKeys::is_legacy)
    }
}

/// Normalized in-memory ledger record for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangeRecord {
    pub conversation_id: Uuid,
    pub status: ExchangeStatus,
    pub participants: BTreeMap<Uuid, Vec<KeyEntry>>,
    pub revision: i64,
}

impl KeyExchangeRecord {
    pub fn from_stored(conversation_id: Uuid, stored: Option<StoredKeyRecord>) -> Self {
        let Some(stored) = stored else {
            return Self {
                conversation_id,
                status: ExchangeStatus::None,
                participants: BTreeMap::new(),
                revision: 0,
            };
        };

        Self {
            conversation_id,
            status: stored.status,
            participants: stored
                .participants
                .into_iter()
                .map(|(user, keys)| (user, keys.into_history()))
                .collect(),
            revision: stored.revision,
        }
    }

    /// Stored form for the next revision.
    pub fn to_stored_next(&self) -> StoredKeyRecord {
        StoredKeyRecord {
            status: self.status,
            participants: self
                .participants
                .iter()
                .map(|(user, entries)| (*user, StoredParticipantKeys::History(entries.clone())))
                .collect(),
            revision: self.revision + 1,
        }
    }

    /// Drop histories of identities that are no longer participants.
    pub fn prune(&mut self, participants: &[Uuid]) {
        self.participants
            .retain(|user, entries| participants.contains(user) && !entries.is_empty());
    }

    /// Append a new active version for `user`, deactivating older ones and
    /// evicting beyond [`MAX_KEY_HISTORY`].
    pub fn push_key(&mut self, user: Uuid, public_key: String, now: DateTime<Utc>) -> KeyEntry {
        let history = self.participants.entry(user).or_default();
        let version = history.iter().map(|e| e.version).max().unwrap_or(0) + 1;

        for entry in history.iter_mut() {
            entry.is_active = false;
        }

        let entry = KeyEntry {
            public_key,
            key_id: Uuid::new_v4().to_string(),
            version,
            exchanged_at: now,
            is_active: true,
        };
        history.insert(0, entry.clone());
        history.truncate(MAX_KEY_HISTORY);
        entry
    }

    pub fn recompute_status(&mut self, participants: &[Uuid]) {
        let with_keys = participants
            .iter()
            .filter(|p| self.participants.get(p).is_some_and(|h| !h.is_empty()))
            .count();

        self.status = if with_keys == 0 {
            ExchangeStatus::None
        } else if with_keys == participants.len() {
            ExchangeStatus::Complete
        } else {
            ExchangeStatus::Partial
        };
    }

    pub fn active_key(&self, user: Uuid) -> Option<&KeyEntry> {
        self.participants
            .get(&user)
            .and_then(|h| h.iter().find(|e| e.is_active))
    }

    pub fn history(&self, user: Uuid) -> &[KeyEntry] {
        self.participants.get(&user).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// One server-held envelope key. The ring is an ordered list of these,
/// newest first.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingKey {
    pub id: Uuid,
    #[serde(with = "hex_bytes")]
    pub secret: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl RingKey {
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4(),
            secret: crypto_core::generate_key().to_vec(),
            created_at: Utc::now(),
        }
    }
}

impl std::fmt::Debug for RingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingKey")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        hex::decode(raw).map_err(serde::de::Error::custom)
    }
}
