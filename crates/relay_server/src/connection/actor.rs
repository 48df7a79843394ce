//! The per-connection task group.

use super::outbound::{Outbound, OverflowPolicy};
use super::transport::Frame;
use super::{cancelled, ConnectionId};
use crate::auth::Identity;
use crate::config::ServerConfig;
use crate::messaging::{ActionRouter, ClientEnvelope, RouteContext};
use crate::pubsub::PubSubBridge;
use crate::store::SharedStore;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Queue and write limits applied to every connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub outbound_capacity: usize,
    pub write_timeout: Duration,
    pub overflow_policy: OverflowPolicy,
}

impl From<&ServerConfig> for ConnectionSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            outbound_capacity: config.outbound_capacity,
            write_timeout: config.write_timeout,
            overflow_policy: config.overflow_policy,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// Drives one authenticated client stream until either side ends it.
pub struct ConnectionActor {
    id: ConnectionId,
    identity: Identity,
    router: Arc<ActionRouter>,
    store: SharedStore,
    settings: ConnectionSettings,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionActor {
    /// Creates an actor for `identity`.
    ///
    /// # Arguments
    ///
    /// * `router` - Dispatcher shared by all connections
    /// * `store` - Store used to open this connection's pub/sub subscriber
    /// * `shutdown` - Server-wide signal; when it fires the connection drains
    pub fn new(
        identity: Identity,
        router: Arc<ActionRouter>,
        store: SharedStore,
        settings: ConnectionSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            router,
            store,
            settings,
            shutdown,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Runs the connection to completion.
    ///
    /// The calling task becomes the reader; the writer (and, after the first
    /// subscription, the pub/sub listener) run as separate tasks. Returns
    /// once all of them have stopped and the subscriber is released.
    pub async fn run<S, R, E>(self, sink: S, mut stream: R)
    where
        S: Sink<Frame> + Unpin + Send + 'static,
        S::Error: Display + Send,
        R: Stream<Item = Result<Frame, E>> + Unpin,
        E: Display,
    {
        let id = self.id;
        info!(connection = %id, user = self.identity.id, name = %self.identity.display_name, "🔗 Connection opened");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let cancel_tx = Arc::new(cancel_tx);
        let (outbound, queue) = Outbound::channel(
            self.settings.outbound_capacity,
            self.settings.overflow_policy,
            cancel_tx.clone(),
        );

        let writer = tokio::spawn(write_loop(
            id,
            sink,
            queue,
            cancel_rx.clone(),
            cancel_tx.clone(),
            self.settings.write_timeout,
        ));

        let mut bridge = PubSubBridge::new(id, self.store.clone(), outbound.clone(), cancel_rx.clone());
        let mut cancel = cancel_rx;
        let mut shutdown = self.shutdown.clone();

        loop {
            let next = tokio::select! {
                _ = cancelled(&mut cancel) => break,
                _ = cancelled(&mut shutdown) => {
                    debug!(connection = %id, "Server shutting down, draining connection");
                    break;
                }
                next = stream.next() => next,
            };

            let frame = match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    debug!(connection = %id, "Read failed: {}", e);
                    break;
                }
                None => break,
            };
            let Some(payload) = frame.payload() else {
                break;
            };

            let envelope = match ClientEnvelope::decode(payload) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(connection = %id, "Dropping malformed frame: {}", e);
                    continue;
                }
            };

            let response = {
                let mut ctx = RouteContext {
                    connection: id,
                    identity: &self.identity,
                    bridge: &mut bridge,
                };
                self.router.dispatch(&envelope, &mut ctx).await
            };

            let encoded = match response.encode() {
                Ok(encoded) => encoded,
                Err(e) => {
                    error!(connection = %id, action = %envelope.action, "Failed to encode response: {}", e);
                    continue;
                }
            };
            if let Err(e) = outbound.push(Bytes::from(encoded)).await {
                debug!(connection = %id, "Stopping reader: {}", e);
                break;
            }
        }

        cancel_tx.send_replace(true);
        bridge.shutdown().await;
        drop(bridge);
        drop(outbound);

        if let Err(e) = writer.await {
            error!(connection = %id, "Writer task failed: {}", e);
        }
        info!(connection = %id, user = self.identity.id, "🔌 Connection closed");
    }
}

/// Writes queued payloads until the queue closes, a write fails, or the
/// group is cancelled. On cancellation whatever is already queued is still
/// written before the close frame.
async fn write_loop<S>(
    id: ConnectionId,
    mut sink: S,
    mut queue: mpsc::Receiver<Bytes>,
    mut cancel: watch::Receiver<bool>,
    cancel_tx: Arc<watch::Sender<bool>>,
    write_timeout: Duration,
) where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    let mut healthy = true;
    loop {
        tokio::select! {
            payload = queue.recv() => match payload {
                Some(payload) => {
                    if !write(id, &mut sink, Frame::from_payload(payload), write_timeout).await {
                        healthy = false;
                        break;
                    }
                }
                None => break,
            },
            _ = cancelled(&mut cancel) => {
                queue.close();
                while let Some(payload) = queue.recv().await {
                    if !write(id, &mut sink, Frame::from_payload(payload), write_timeout).await {
                        healthy = false;
                        break;
                    }
                }
                break;
            }
        }
    }

    // Producers blocked on a full queue must not wait for a dead writer.
    queue.close();
    cancel_tx.send_replace(true);

    if healthy {
        let _ = write(id, &mut sink, Frame::Close, write_timeout).await;
    }
    if let Ok(Err(e)) = tokio::time::timeout(write_timeout, sink.close()).await {
        debug!(connection = %id, "Closing transport failed: {}", e);
    }
}

async fn write<S>(id: ConnectionId, sink: &mut S, frame: Frame, limit: Duration) -> bool
where
    S: Sink<Frame> + Unpin,
    S::Error: Display,
{
    match tokio::time::timeout(limit, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(connection = %id, "Write failed: {}", e);
            false
        }
        Err(_) => {
            warn!(connection = %id, "Write timed out after {:?}", limit);
            false
        }
    }
}
