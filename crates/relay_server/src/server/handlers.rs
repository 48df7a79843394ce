//! Stream upgrade handling.

use crate::auth::{Identity, IdentityResolver};
use crate::connection::{ConnectionActor, ConnectionSettings, Frame};
use crate::messaging::ActionRouter;
use crate::store::SharedStore;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Everything the upgrade handler shares across requests.
pub(crate) struct RelayState {
    pub router: Arc<ActionRouter>,
    pub store: SharedStore,
    pub resolver: Arc<dyn IdentityResolver>,
    pub settings: ConnectionSettings,
    pub tracker: ConnectionTracker,
    pub shutdown: watch::Receiver<bool>,
}

/// Counts live connections against a fixed limit.
pub struct ConnectionTracker {
    active: Arc<AtomicUsize>,
    max_connections: usize,
}

impl ConnectionTracker {
    pub fn new(max_connections: usize) -> Self {
        Self {
            active: Arc::new(AtomicUsize::new(0)),
            max_connections,
        }
    }

    /// Reserves a slot, or `None` when the limit is reached.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let prev = self.active.fetch_add(1, Ordering::SeqCst);
        if prev >= self.max_connections {
            self.active.fetch_sub(1, Ordering::SeqCst);
            return None;
        }
        Some(ConnectionGuard {
            active: self.active.clone(),
        })
    }

    /// Current number of live connections.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

/// Releases its slot when dropped.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectParams {
    #[serde(default)]
    token: Option<String>,
}

/// `GET /ws?token=...`
///
/// The token is resolved before the upgrade so an unauthenticated client
/// never gets a stream.
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(params): Query<ConnectParams>,
) -> Response {
    let Some(token) = params.token.filter(|t| !t.is_empty()) else {
        debug!(%addr, "Rejected connection without token");
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    let identity = match state.resolver.resolve(&token).await {
        Ok(identity) => identity,
        Err(e) => {
            warn!(%addr, "Rejected connection: {}", e);
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    };

    if *state.shutdown.borrow() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }
    let Some(guard) = state.tracker.try_acquire() else {
        warn!(%addr, "Connection limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, identity, guard))
        .into_response()
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<RelayState>,
    identity: Identity,
    _guard: ConnectionGuard,
) {
    let actor = ConnectionActor::new(
        identity,
        state.router.clone(),
        state.store.clone(),
        state.settings,
        state.shutdown.clone(),
    );

    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(into_message(frame))));
    let stream = stream.filter_map(|message| future::ready(from_message(message)));

    actor.run(sink, stream).await;
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Binary(bytes) => Message::Binary(bytes.to_vec()),
        Frame::Close => Message::Close(None),
    }
}

/// Ping and pong are answered by the socket itself and never reach the actor.
fn from_message(message: Result<Message, axum::Error>) -> Option<Result<Frame, axum::Error>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
        Ok(Message::Binary(bytes)) => Some(Ok(Frame::Binary(Bytes::from(bytes)))),
        Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => Some(Err(e)),
    }
}
