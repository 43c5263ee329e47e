//! Outbound HTTP sync
//!
//! Sweeps locally persisted results and uploads them to the configured
//! remote endpoint, in realtime, daily-scheduled, or cron-driven mode.
//! Transport failures back off exponentially; records stay local until
//! the remote confirms acceptance.

pub mod auth;
pub mod engine;
pub mod schedule;

pub use auth::Authenticator;
pub use engine::{EngineState, SyncEngine, SyncOutcome};
