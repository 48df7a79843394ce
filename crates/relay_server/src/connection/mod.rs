//! Per-connection actors.
//!
//! Each accepted stream is driven by one [`ConnectionActor`]: a reader
//! loop that decodes and dispatches requests, a writer task draining the
//! bounded [`Outbound`] queue, and (once the client subscribes to
//! something) a pub/sub listener. The three share a cancellation signal so
//! the group always stops together.

pub mod actor;
pub mod outbound;
pub mod transport;

pub use actor::{ConnectionActor, ConnectionSettings};
pub use outbound::{Outbound, OutboundError, OverflowPolicy};
pub use transport::Frame;

use tokio::sync::watch;

/// Type alias for connection identifiers.
///
/// Connection IDs are random so they stay unique across restarts and
/// across relay instances sharing one store.
pub type ConnectionId = uuid::Uuid;

/// Resolves once `rx` reads `true` or its sender is gone.
pub(crate) async fn cancelled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}
