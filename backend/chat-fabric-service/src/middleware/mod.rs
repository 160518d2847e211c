pub mod auth;
pub mod error_handling;
pub mod guards;
pub mod request_id;

pub use auth::{AuthenticatedUser, CredentialValidator};
pub use guards::User;
pub use request_id::RequestIdMiddleware;
