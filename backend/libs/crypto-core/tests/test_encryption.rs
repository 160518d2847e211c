use crypto_core::{generate_key, looks_like_envelope, open, seal, CryptoError, Envelope};

#[test]
fn roundtrip_through_wire_encoding() {
    let key = generate_key();
    let encoded = seal(&key, "bonjour 👋".as_bytes()).expect("seal").encode();

    assert!(looks_like_envelope(&encoded));
    let parsed = Envelope::parse(&encoded).expect("parse");
    let plaintext = open(&key, &parsed).expect("open");
    assert_eq!(plaintext, "bonjour 👋".as_bytes());
}

#[test]
fn same_plaintext_seals_differently() {
    let key = generate_key();
    let a = seal(&key, b"same").unwrap();
    let b = seal(&key, b"same").unwrap();
    assert_ne!(a.salt, b.salt);
    assert_ne!(a.encode(), b.encode());
}

#[test]
fn empty_plaintext_is_supported() {
    let key = generate_key();
    let encoded = seal(&key, b"").unwrap().encode();
    assert!(encoded.ends_with(':'));
    let parsed = Envelope::parse(&encoded).unwrap();
    assert!(open(&key, &parsed).unwrap().is_empty());
}

#[test]
fn malformed_parts_are_rejected() {
    let encoded = seal(&generate_key(), b"x").unwrap().encode();
    let truncated = encoded.rsplit_once(':').unwrap().0;
    assert!(matches!(
        Envelope::parse(truncated),
        Err(CryptoError::Malformed(_))
    ));
    assert!(matches!(
        Envelope::parse(&format!("{encoded}:extra")),
        Err(CryptoError::Malformed(_))
    ));
}
