//! Shared cryptographic helpers for the chat fabric.
//!
//! - [`jwt`]: HS256 session credential issuing/validation
//! - [`envelope`]: AES-256-GCM envelope sealing with per-message HKDF salt

pub mod envelope;
pub mod jwt;

pub use envelope::{generate_key, looks_like_envelope, open, seal, CryptoError, Envelope};
