/// Integration tests for crypto-core credential validation
use chrono::Duration;
use crypto_core::jwt::{Claims, JwtKeys};
use uuid::Uuid;

const SECRET: &str = "integration-secret-0123456789abcdef-xyz";

#[test]
fn test_token_roundtrip_preserves_subject() {
    let keys = JwtKeys::from_secret(SECRET).unwrap();
    let user_id = Uuid::new_v4();
    let token = keys
        .issue_access_token(user_id, Some("ada"), Duration::minutes(5))
        .unwrap();

    assert_eq!(token.matches('.').count(), 2);
    assert_eq!(keys.user_id_from_token(&token).unwrap(), user_id);
}

#[test]
fn test_missing_exp_rejected() {
    let keys = JwtKeys::from_secret(SECRET).unwrap();
    let header = jsonwebtoken::Header::new(jsonwebtoken::Algorithm::HS256);
    let token = jsonwebtoken::encode(
        &header,
        &serde_json::json!({ "sub": Uuid::new_v4().to_string() }),
        &jsonwebtoken::EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap();

    assert!(keys.validate_token(&token).is_err());
}

#[test]
fn test_token_type_defaults_to_access() {
    let keys = JwtKeys::from_secret(SECRET).unwrap();
    let token = keys
        .issue_access_token(Uuid::new_v4(), None, Duration::minutes(1))
        .unwrap();
    let claims: Claims = keys.validate_token(&token).unwrap().claims;
    assert_eq!(claims.token_type, "access");
}

#[test]
fn test_garbage_token_rejected() {
    let keys = JwtKeys::from_secret(SECRET).unwrap();
    assert!(keys.validate_token("invalid.token.here").is_err());
    assert!(keys.validate_token("").is_err());
}
