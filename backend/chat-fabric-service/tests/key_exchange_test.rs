mod common;

use chat_fabric_service::error::AppError;
use chat_fabric_service::models::{ExchangeStatus, LegacyKey, StoredKeyRecord, StoredParticipantKeys};
use chat_fabric_service::store::memory::MemoryBackend;
use chat_fabric_service::store::KeyLedgerStore;
use common::{connect, conversation, fabric, next_event, user};
use std::collections::BTreeMap;

#[tokio::test]
async fn test_status_goes_partial_then_complete() {
    let backend = MemoryBackend::new();
    let node = fabric(&backend, "node").await;
    let alice = user(&backend, "Alice").await;
    let bob = user(&backend, "Bob").await;
    let conv = conversation(&backend, &[alice, bob], 0).await;

    assert_eq!(node.keys.status(conv, alice).await.unwrap(), ExchangeStatus::None);

    let first = node.keys.exchange_key(conv, alice, "PK-A1").await.unwrap();
    assert_eq!(first.exchange_status, ExchangeStatus::Partial);
    assert_eq!(first.key_version, 1);

    let second = node.keys.exchange_key(conv, bob, "PK-B1").await.unwrap();
    assert_eq!(second.exchange_status, ExchangeStatus::Complete);
    assert_eq!(node.keys.status(conv, bob).await.unwrap(), ExchangeStatus::Complete);
}

#[tokio::test]
async fn test_history_keeps_three_with_one_active() {
    let backend = MemoryBackend::new();
    let node = fabric(&backend, "node").await;
    let alice = user(&backend, "Alice").await;
    let bob = user(&backend, "Bob").await;
    let conv = conversation(&backend, &[alice, bob], 0).await;

    node.keys.exchange_key(conv, alice, "PK-1").await.unwrap();
    for key in ["PK-2", "PK-3", "PK-4"] {
        node.keys.rotate_key(conv, alice, key).await.unwrap();
    }

    let fetched = node.keys.fetch_keys(conv, bob).await.unwrap();
    assert_eq!(fetched.keys.len(), 1);
    let alice_keys = &fetched.keys[0];
    assert_eq!(alice_keys.user_id, alice);
    assert_eq!(alice_keys.active_key.public_key, "PK-4");
    assert_eq!(alice_keys.active_key.version, 4);
    assert_eq!(alice_keys.history.len(), 3);
    assert_eq!(alice_keys.history.iter().filter(|k| k.is_active).count(), 1);
    assert!(alice_keys.history.iter().all(|k| k.public_key != "PK-1"));
}

#[tokio::test]
async fn test_fetch_excludes_requester_and_keyless_peers() {
    let backend = MemoryBackend::new();
    let node = fabric(&backend, "node").await;
    let alice = user(&backend, "Alice").await;
    let bob = user(&backend, "Bob").await;
    let carol = user(&backend, "Carol").await;
    let conv = conversation(&backend, &[alice, bob, carol], 0).await;

    node.keys.exchange_key(conv, alice, "PK-A").await.unwrap();
    node.keys.exchange_key(conv, bob, "PK-B").await.unwrap();

    let fetched = node.keys.fetch_keys(conv, alice).await.unwrap();
    assert_eq!(fetched.exchange_status, ExchangeStatus::Partial);
    let owners: Vec<_> = fetched.keys.iter().map(|k| k.user_id).collect();
    assert_eq!(owners, vec![bob]);
}

#[tokio::test]
async fn test_non_participant_is_forbidden() {
    let backend = MemoryBackend::new();
    let node = fabric(&backend, "node").await;
    let alice = user(&backend, "Alice").await;
    let bob = user(&backend, "Bob").await;
    let mallory = user(&backend, "Mallory").await;
    let conv = conversation(&backend, &[alice, bob], 0).await;

    let err = node.keys.exchange_key(conv, mallory, "PK-M").await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
    let err = node.keys.fetch_keys(conv, mallory).await.unwrap_err();
    assert!(matches!(err, AppError::Forbidden(_)));
}

#[tokio::test]
async fn test_blank_key_rejected() {
    let backend = MemoryBackend::new();
    let node = fabric(&backend, "node").await;
    let alice = user(&backend, "Alice").await;
    let conv = conversation(&backend, &[alice], 0).await;

    let err = node.keys.exchange_key(conv, alice, "  ").await.unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn test_legacy_entry_is_migrated_on_read() {
    let backend = MemoryBackend::new();
    let node = fabric(&backend, "node").await;
    let alice = user(&backend, "Alice").await;
    let bob = user(&backend, "Bob").await;
    let conv = conversation(&backend, &[alice, bob], 0).await;

    let mut participants = BTreeMap::new();
    participants.insert(
        alice,
        StoredParticipantKeys::Legacy(LegacyKey {
            public_key: "PK-OLD".into(),
            key_id: Some("legacy-key".into()),
            exchanged_at: None,
        }),
    );
    backend
        .key_ledger
        .put_raw(
            conv,
            StoredKeyRecord {
                status: ExchangeStatus::Partial,
                participants,
                revision: 3,
            },
        )
        .await;

    let fetched = node.keys.fetch_keys(conv, bob).await.unwrap();
    assert_eq!(fetched.keys.len(), 1);
    let active = &fetched.keys[0].active_key;
    assert_eq!(active.public_key, "PK-OLD");
    assert_eq!(active.key_id, "legacy-key");
    assert_eq!(active.version, 1);
    assert!(active.is_active);

    let stored = backend.key_ledger.load(conv).await.unwrap().unwrap();
    assert!(!stored.has_legacy_entries());
    assert_eq!(stored.revision, 4);

    // Rotation continues from the migrated version.
    let next = node.keys.rotate_key(conv, alice, "PK-NEW").await.unwrap();
    assert_eq!(next.key_version, 2);
}

#[tokio::test]
async fn test_departed_participant_is_pruned() {
    let backend = MemoryBackend::new();
    let node = fabric(&backend, "node").await;
    let alice = user(&backend, "Alice").await;
    let bob = user(&backend, "Bob").await;
    let carol = user(&backend, "Carol").await;
    let conv = conversation(&backend, &[alice, bob, carol], 0).await;

    node.keys.exchange_key(conv, bob, "PK-B").await.unwrap();
    node.keys.exchange_key(conv, carol, "PK-C").await.unwrap();

    backend.directory.set_participants(conv, vec![alice, bob]).await;

    let fetched = node.keys.fetch_keys(conv, alice).await.unwrap();
    let owners: Vec<_> = fetched.keys.iter().map(|k| k.user_id).collect();
    assert_eq!(owners, vec![bob]);

    let submitted = node.keys.exchange_key(conv, alice, "PK-A").await.unwrap();
    assert_eq!(submitted.exchange_status, ExchangeStatus::Complete);
    let stored = backend.key_ledger.load(conv).await.unwrap().unwrap();
    assert!(!stored.participants.contains_key(&carol));
}

#[tokio::test]
async fn test_key_update_carries_rotation_flag() {
    let backend = MemoryBackend::new();
    let node = fabric(&backend, "node").await;
    let alice = user(&backend, "Alice").await;
    let bob = user(&backend, "Bob").await;
    let conv = conversation(&backend, &[alice, bob], 0).await;
    let mut bob_client = connect(&node, bob).await;

    let first = node.keys.exchange_key(conv, alice, "PK-1").await.unwrap();
    let frame = next_event(&mut bob_client.rx, "encryption:key-updated").await;
    assert_eq!(frame["data"]["keyId"], first.key_id);
    assert_eq!(frame["data"]["rotated"], false);
    assert_eq!(frame["data"]["exchangeStatus"], "partial");

    node.keys.rotate_key(conv, alice, "PK-2").await.unwrap();
    let frame = next_event(&mut bob_client.rx, "encryption:key-updated").await;
    assert_eq!(frame["data"]["rotated"], true);
    assert_eq!(frame["data"]["keyVersion"], 2);
    assert_eq!(frame["data"]["publicKey"], "PK-2");
}
