//! Per-connection pub/sub bridge.
//!
//! The bridge owns this connection's exclusive store subscriber. It is
//! opened on the first `subscribe` and relays every message on the attached
//! channels to the connection's outbound queue exactly as published.

use crate::connection::{cancelled, ConnectionId, Outbound};
use crate::store::{MessageStream, SharedStore, StoreError, SubscriptionControl};
use futures::StreamExt;
use std::collections::BTreeSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct ActiveSubscription {
    control: Box<dyn SubscriptionControl>,
    channels: BTreeSet<String>,
    listener: JoinHandle<()>,
}

pub struct PubSubBridge {
    connection: ConnectionId,
    store: SharedStore,
    outbound: Outbound,
    cancel: watch::Receiver<bool>,
    active: Option<ActiveSubscription>,
}

impl PubSubBridge {
    pub fn new(
        connection: ConnectionId,
        store: SharedStore,
        outbound: Outbound,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            connection,
            store,
            outbound,
            cancel,
            active: None,
        }
    }

    /// Attaches `channel`, opening the subscriber and starting the
    /// listener on first use.
    ///
    /// A subscriber whose stream has ended (for example after the store
    /// connection dropped) is replaced, and its channels are attached again.
    pub async fn subscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        let mut restore = Vec::new();
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.listener.is_finished())
            && !*self.cancel.borrow()
        {
            warn!(connection = %self.connection, "Pub/sub stream ended, reopening subscriber");
            restore = self.channels();
            self.shutdown().await;
        }

        if self.active.is_none() {
            let (control, stream) = self.store.subscriber().await?;
            let listener = tokio::spawn(listen(
                self.connection,
                stream,
                self.outbound.clone(),
                self.cancel.clone(),
            ));
            debug!(connection = %self.connection, "Opened pub/sub subscriber");
            self.active = Some(ActiveSubscription {
                control,
                channels: BTreeSet::new(),
                listener,
            });
        }

        if let Some(active) = self.active.as_mut() {
            for previous in restore {
                active.control.subscribe(&previous).await?;
                active.channels.insert(previous);
            }
            active.control.subscribe(channel).await?;
            active.channels.insert(channel.to_string());
        }
        Ok(())
    }

    /// Detaches `channel`. Returns `false` when no subscriber was open.
    pub async fn unsubscribe(&mut self, channel: &str) -> Result<bool, StoreError> {
        let Some(active) = self.active.as_mut() else {
            return Ok(false);
        };
        active.control.unsubscribe(channel).await?;
        active.channels.remove(channel);
        Ok(true)
    }

    /// Channels currently attached.
    pub fn channels(&self) -> Vec<String> {
        self.active
            .as_ref()
            .map(|a| a.channels.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Closes the subscriber and waits for the listener to finish.
    pub async fn shutdown(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        if let Err(e) = active.control.close().await {
            warn!(connection = %self.connection, "Failed to release subscriber: {}", e);
        }
        // The stream may not end on its own if the store connection died.
        active.listener.abort();
        let _ = active.listener.await;
        debug!(connection = %self.connection, "Closed pub/sub subscriber");
    }
}

impl Drop for PubSubBridge {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.listener.abort();
        }
    }
}

async fn listen(
    connection: ConnectionId,
    mut stream: MessageStream,
    outbound: Outbound,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = cancelled(&mut cancel) => break,
            message = stream.next() => match message {
                Some(message) => {
                    if let Err(e) = outbound.push(message.payload).await {
                        debug!(%connection, channel = %message.channel, "Dropping relay: {}", e);
                        break;
                    }
                }
                None => {
                    if !*cancel.borrow() {
                        warn!(%connection, "Pub/sub stream ended");
                    }
                    break;
                }
            },
        }
    }
    debug!(%connection, "Pub/sub listener stopped");
}
