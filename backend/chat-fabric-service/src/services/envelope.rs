//! Server-held envelope keys for payloads the fabric persists.
//!
//! The ring holds up to [`KEY_RING_CAPACITY`] keys, newest first. New payloads
//! are sealed with the newest key; opening tries every ring key in order, so
//! anything sealed within the last five rotations stays readable. Older
//! payloads fail with [`AppError::DecryptionExhausted`].

use crate::error::{AppError, AppResult};
use crate::metrics::{ENVELOPE_DECRYPT_FAILURES_TOTAL, ENVELOPE_KEY_ROTATIONS_TOTAL};
use crate::models::RingKey;
use crate::store::KeyRingStore;
use chrono::{DateTime, Utc};
use crypto_core::Envelope;
use std::sync::Arc;
use std::time::Duration;

pub const KEY_RING_CAPACITY: usize = 5;

fn period_millis(period: Duration) -> u64 {
    (period.as_millis() as u64).max(1)
}

/// Index of the rotation period containing `at`, counted from the Unix epoch.
/// Every instance derives the same index from its wall clock.
pub fn rotation_slot(at: DateTime<Utc>, period: Duration) -> u64 {
    at.timestamp_millis().max(0) as u64 / period_millis(period)
}

/// Time from `at` until the next rotation period begins.
pub fn until_next_slot(at: DateTime<Utc>, period: Duration) -> Duration {
    let period_ms = period_millis(period);
    let elapsed = at.timestamp_millis().max(0) as u64 % period_ms;
    Duration::from_millis(period_ms - elapsed)
}

pub struct EnvelopeKeyService {
    ring: Arc<dyn KeyRingStore>,
}

impl EnvelopeKeyService {
    pub fn new(ring: Arc<dyn KeyRingStore>) -> Self {
        Self { ring }
    }

    /// Seed the ring on first boot. Safe to call from every instance.
    pub async fn ensure_ring(&self) -> AppResult<()> {
        let seed = RingKey::generate();
        if self.ring.init_if_absent(&seed).await? {
            tracing::info!(key_id = %seed.id, "created envelope key ring");
        }
        Ok(())
    }

    /// Format detection only; says nothing about which key sealed it.
    pub fn is_envelope(value: &str) -> bool {
        crypto_core::looks_like_envelope(value)
    }

    pub async fn encrypt(&self, plaintext: &str) -> AppResult<String> {
        let mut keys = self.ring.keys().await?;
        if keys.is_empty() {
            self.ensure_ring().await?;
            keys = self.ring.keys().await?;
        }
        let newest = keys
            .first()
            .ok_or_else(|| AppError::Internal("envelope key ring is empty".into()))?;

        let envelope = crypto_core::seal(&newest.secret, plaintext.as_bytes())
            .map_err(|e| AppError::Internal(format!("seal: {e}")))?;
        Ok(envelope.encode())
    }

    pub async fn decrypt(&self, payload: &str) -> AppResult<String> {
        let envelope = Envelope::parse(payload)
            .map_err(|e| AppError::BadRequest(format!("not an envelope: {e}")))?;

        for key in self.ring.keys().await? {
            let Ok(plaintext) = crypto_core::open(&key.secret, &envelope) else {
                continue;
            };
            return String::from_utf8(plaintext)
                .map_err(|_| AppError::Internal("envelope plaintext is not utf-8".into()));
        }

        ENVELOPE_DECRYPT_FAILURES_TOTAL.inc();
        Err(AppError::DecryptionExhausted)
    }

    /// Prepend a fresh key and evict past capacity, in one atomic step.
    pub async fn rotate(&self) -> AppResult<RingKey> {
        let key = RingKey::generate();
        self.ring.prepend_and_trim(&key, KEY_RING_CAPACITY).await?;
        ENVELOPE_KEY_ROTATIONS_TOTAL.inc();
        tracing::info!(key_id = %key.id, "rotated envelope key ring");
        Ok(key)
    }

    /// Rotate unless another instance already claimed the current period.
    /// Returns true when this call rotated.
    pub async fn rotate_if_unclaimed(&self, owner: &str, period: Duration) -> AppResult<bool> {
        self.rotate_in_slot(rotation_slot(Utc::now(), period), owner, period)
            .await
    }

    pub async fn rotate_in_slot(&self, slot: u64, owner: &str, period: Duration) -> AppResult<bool> {
        // Outlives the slot so a late tick from a skewed clock still sees it.
        let ttl = period.saturating_mul(2);
        if !self.ring.claim_rotation(slot, owner, ttl).await? {
            tracing::debug!(owner, slot, "envelope rotation already claimed for this period");
            return Ok(false);
        }
        self.rotate().await?;
        Ok(true)
    }

    pub async fn ring_len(&self) -> AppResult<usize> {
        Ok(self.ring.keys().await?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryKeyRing;

    fn service() -> EnvelopeKeyService {
        EnvelopeKeyService::new(Arc::new(MemoryKeyRing::new()))
    }

    #[tokio::test]
    async fn test_encrypt_creates_ring_lazily() {
        let svc = service();
        let sealed = svc.encrypt("hello").await.unwrap();
        assert!(EnvelopeKeyService::is_envelope(&sealed));
        assert_eq!(svc.decrypt(&sealed).await.unwrap(), "hello");
        assert_eq!(svc.ring_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_ring_never_exceeds_capacity() {
        let svc = service();
        svc.ensure_ring().await.unwrap();
        for _ in 0..8 {
            svc.rotate().await.unwrap();
        }
        assert_eq!(svc.ring_len().await.unwrap(), KEY_RING_CAPACITY);
    }

    #[tokio::test]
    async fn test_plaintext_is_rejected_as_non_envelope() {
        let err = service().decrypt("plain words").await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_rotation_claim_limits_to_one_per_period() {
        let svc = service();
        svc.ensure_ring().await.unwrap();
        let period = Duration::from_secs(3600);
        assert!(svc.rotate_in_slot(100, "a", period).await.unwrap());
        assert!(!svc.rotate_in_slot(100, "b", period).await.unwrap());
        assert_eq!(svc.ring_len().await.unwrap(), 2);

        assert!(svc.rotate_in_slot(101, "b", period).await.unwrap());
        assert_eq!(svc.ring_len().await.unwrap(), 3);
    }

    #[test]
    fn test_slots_are_aligned_to_period_boundaries() {
        let period = Duration::from_secs(3600);
        let boundary = DateTime::<Utc>::from_timestamp(10 * 3600, 0).unwrap();
        let just_before = boundary - chrono::Duration::milliseconds(1);

        assert_eq!(rotation_slot(boundary, period), 10);
        assert_eq!(rotation_slot(just_before, period), 9);
        assert_eq!(until_next_slot(just_before, period), Duration::from_millis(1));
        assert_eq!(until_next_slot(boundary, period), period);
    }
}
