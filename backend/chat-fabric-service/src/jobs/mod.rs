//! Periodic background jobs. Each receives its collaborators at construction,
//! exposes `run_once` for tests, and `spawn`s a tokio interval loop that logs
//! failures and keeps going.

pub mod expiry_sweep;
pub mod key_rotation;
pub mod presence_heartbeat;

pub use expiry_sweep::ExpirySweepJob;
pub use key_rotation::KeyRotationJob;
pub use presence_heartbeat::PresenceHeartbeatJob;
