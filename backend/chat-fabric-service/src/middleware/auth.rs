//! Connection credential validation.
//!
//! A credential is looked up in the `token` cookie, then the `token` query
//! parameter, then an `Authorization: Bearer` header. Validation is a single
//! attempt; any failure is [`AppError::Unauthorized`].

use crate::error::{AppError, AppResult};
use actix_web::{http::header, HttpRequest};
use crypto_core::jwt::JwtKeys;
use std::collections::HashMap;
use uuid::Uuid;

pub const TOKEN_COOKIE: &str = "token";
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Identity proven by a valid credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: Uuid,
    pub username: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CredentialValidator {
    keys: JwtKeys,
}

impl CredentialValidator {
    pub fn new(keys: JwtKeys) -> Self {
        Self { keys }
    }

    pub fn from_secret(secret: &str) -> AppResult<Self> {
        JwtKeys::from_secret(secret)
            .map(Self::new)
            .map_err(|e| AppError::Config(format!("JWT_SECRET: {e}")))
    }

    pub fn validate(&self, token: &str) -> AppResult<AuthenticatedUser> {
        let data = self.keys.validate_token(token).map_err(|e| {
            tracing::debug!(error = %e, "credential rejected");
            AppError::Unauthorized
        })?;
        let user_id = Uuid::parse_str(&data.claims.sub).map_err(|_| {
            tracing::debug!("credential subject is not a uuid");
            AppError::Unauthorized
        })?;

        Ok(AuthenticatedUser {
            user_id,
            username: data.claims.username,
        })
    }

    pub fn authenticate(&self, req: &HttpRequest) -> AppResult<AuthenticatedUser> {
        let token = extract_token(req).ok_or(AppError::Unauthorized)?;
        self.validate(&token)
    }
}

pub fn extract_token(req: &HttpRequest) -> Option<String> {
    if let Some(cookie) = req.cookie(TOKEN_COOKIE) {
        if !cookie.value().is_empty() {
            return Some(cookie.value().to_string());
        }
    }

    if let Ok(query) =
        actix_web::web::Query::<HashMap<String, String>>::from_query(req.query_string())
    {
        if let Some(token) = query.get(TOKEN_QUERY_PARAM).filter(|t| !t.is_empty()) {
            return Some(token.clone());
        }
    }

    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
