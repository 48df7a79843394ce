//! Bounded outbound queue shared by the reader loop and the pub/sub listener.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// What a producer does when the queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for the writer to make room.
    #[default]
    Block,
    /// Treat the client as too slow and tear the connection down.
    Disconnect,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundError {
    /// The writer has stopped; nothing more will be delivered.
    #[error("outbound queue closed")]
    Closed,
    /// The queue was full under [`OverflowPolicy::Disconnect`].
    #[error("outbound queue full")]
    Overflow,
}

/// Producer handle to one connection's outbound queue.
#[derive(Clone)]
pub struct Outbound {
    tx: mpsc::Sender<Bytes>,
    policy: OverflowPolicy,
    cancel: Arc<watch::Sender<bool>>,
}

impl Outbound {
    /// Creates the queue. `cancel` is fired when a full queue evicts the
    /// connection.
    pub fn channel(
        capacity: usize,
        policy: OverflowPolicy,
        cancel: Arc<watch::Sender<bool>>,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, policy, cancel }, rx)
    }

    /// Queues one frame payload according to the overflow policy.
    pub async fn push(&self, frame: Bytes) -> Result<(), OutboundError> {
        match self.policy {
            OverflowPolicy::Block => self.tx.send(frame).await.map_err(|_| OutboundError::Closed),
            OverflowPolicy::Disconnect => match self.tx.try_send(frame) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Closed(_)) => Err(OutboundError::Closed),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Outbound queue full, disconnecting slow client");
                    self.cancel.send_replace(true);
                    Err(OutboundError::Overflow)
                }
            },
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
