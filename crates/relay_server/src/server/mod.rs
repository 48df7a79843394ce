//! HTTP endpoint and server lifecycle.
//!
//! Contains the main [`RelayServer`] implementation and the upgrade
//! handler that authenticates clients before handing the stream to a
//! connection actor.

pub mod core;
mod handlers;

pub use self::core::RelayServer;
pub use handlers::{ConnectionGuard, ConnectionTracker};
