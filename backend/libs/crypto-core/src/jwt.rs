/// Session credential validation for the chat fabric
///
/// Credentials are HS256 JWTs signed with a secret shared between the
/// issuing platform and every fabric instance. The fabric only validates;
/// [`JwtKeys::issue_access_token`] exists for tests and local tooling.
///
/// ## Security Design
///
/// - **HS256 only**: the validation algorithm is pinned, tokens with any other
///   `alg` header are rejected
/// - **No leeway**: an expired token fails immediately, there is no retry
/// - **Required claims**: `sub` and `exp` must be present
use anyhow::{anyhow, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// Constants
// ============================================================================

const JWT_ALGORITHM: Algorithm = Algorithm::HS256;

/// Shorter secrets make HS256 brute-forceable.
pub const MIN_SECRET_LEN: usize = 32;

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (user ID as UUID string)
    pub sub: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub username: Option<String>,
}

fn default_token_type() -> String {
    "access".to_string()
}

// ============================================================================
// Key Storage
// ============================================================================

/// Encoding/decoding keys derived from the shared secret.
///
/// Built once at startup and shared behind an `Arc`.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtKeys").finish_non_exhaustive()
    }
}

impl JwtKeys {
    pub fn from_secret(secret: &str) -> Result<Self> {
        if secret.len() < MIN_SECRET_LEN {
            return Err(anyhow!(
                "JWT secret must be at least {MIN_SECRET_LEN} bytes"
            ));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        })
    }

    // ========================================================================
    // Token Generation
    // ========================================================================

    pub fn issue_access_token(
        &self,
        user_id: Uuid,
        username: Option<&str>,
        ttl: Duration,
    ) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            token_type: default_token_type(),
            username: username.map(str::to_string),
        };
        self.encode_claims(&claims)
    }

    pub fn encode_claims(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(JWT_ALGORITHM), claims, &self.encoding)
            .map_err(|e| anyhow!("Failed to generate token: {e}"))
    }

    // ========================================================================
    // Token Validation
    // ========================================================================

    /// Verify signature and expiry, returning the decoded claims.
    pub fn validate_token(&self, token: &str) -> Result<TokenData<Claims>> {
        let mut validation = Validation::new(JWT_ALGORITHM);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| anyhow!("Token validation failed: {e}"))
    }

    /// Validate and extract the user ID.
    ///
    /// Never trust user IDs from unvalidated sources.
    pub fn user_id_from_token(&self, token: &str) -> Result<Uuid> {
        let token_data = self.validate_token(token)?;
        Uuid::parse_str(&token_data.claims.sub)
            .map_err(|e| anyhow!("Invalid user ID format in token: {e}"))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &str = "test-secret-that-is-long-enough-for-hs256";

    fn keys() -> JwtKeys {
        JwtKeys::from_secret(TEST_SECRET).expect("test secret")
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(JwtKeys::from_secret("short").is_err());
    }

    #[test]
    fn test_validate_valid_token() {
        let keys = keys();
        let user_id = Uuid::new_v4();
        let token = keys
            .issue_access_token(user_id, Some("ada"), Duration::hours(1))
            .unwrap();

        let data = keys.validate_token(&token).unwrap();
        assert_eq!(data.claims.sub, user_id.to_string());
        assert_eq!(data.claims.username.as_deref(), Some("ada"));
        assert_eq!(keys.user_id_from_token(&token).unwrap(), user_id);
    }

    #[test]
    fn test_expired_token_rejected() {
        let keys = keys();
        let token = keys
            .issue_access_token(Uuid::new_v4(), None, Duration::seconds(-30))
            .unwrap();
        assert!(keys.validate_token(&token).is_err());
    }

    #[test]
    fn test_tampered_token_rejected() {
        let keys = keys();
        let token = keys
            .issue_access_token(Uuid::new_v4(), None, Duration::hours(1))
            .unwrap();
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        parts[2] = parts[2].chars().rev().collect();
        assert!(keys.validate_token(&parts.join(".")).is_err());
    }

    #[test]
    fn test_foreign_secret_rejected() {
        let other = JwtKeys::from_secret("another-secret-that-is-also-long-enough").unwrap();
        let token = other
            .issue_access_token(Uuid::new_v4(), None, Duration::hours(1))
            .unwrap();
        assert!(keys().validate_token(&token).is_err());
    }

    #[test]
    fn test_non_uuid_subject_rejected() {
        let keys = keys();
        let now = Utc::now().timestamp();
        let token = keys
            .encode_claims(&Claims {
                sub: "not-a-uuid".into(),
                iat: now,
                exp: now + 60,
                token_type: "access".into(),
                username: None,
            })
            .unwrap();
        assert!(keys.validate_token(&token).is_ok());
        assert!(keys.user_id_from_token(&token).is_err());
    }
}
