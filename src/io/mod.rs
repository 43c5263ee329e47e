//! TCP transport layer
//!
//! One listener per configured analyzer port; every accepted socket is
//! driven by its own session task feeding bytes into that listener's
//! protocol parser.

pub mod listener;
pub mod session;

pub use listener::ListenerManager;
pub use session::Session;
