//! Shared store abstraction.
//!
//! The relay executes actions as scripts inside an external key/value store
//! and uses the same store's channels for fan-out. The [`Store`] trait is the
//! whole surface the core needs:
//!
//! * **Script registration** - upload source once, get back a content handle
//! * **Script execution** - run a handle against keys and arguments
//! * **Pub/sub** - publish to a channel, or open a private subscriber
//! * **Key probing** - used by the identity resolver for guest records
//!
//! Two backends ship with the crate: [`RedisStore`] for deployments and
//! [`MemoryStore`] for tests and local development.

pub mod memory;
pub mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::messaging::Value;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Content handle returned by the store when a script is registered.
///
/// The store can execute a handle without the source being uploaded again,
/// unless it has evicted its script cache (see [`StoreError::UnknownScript`]).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptHandle(String);

impl ScriptHandle {
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone)]
pub struct PubMessage {
    /// The channel the message was published to.
    pub channel: Arc<str>,
    /// The raw payload, relayed to clients untouched.
    pub payload: Bytes,
}

/// Stream of messages for every channel a subscriber is attached to.
///
/// Ends when the subscription is closed.
pub type MessageStream = BoxStream<'static, PubMessage>;

/// Shared, read-only handle to the store used for script calls.
pub type SharedStore = Arc<dyn Store>;

/// Errors reported by a store backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The store no longer knows this handle (script cache flushed).
    #[error("unknown script handle {0}")]
    UnknownScript(String),

    /// The store refused to compile or execute a script.
    #[error("script error: {0}")]
    Script(String),

    /// Transport or protocol failure talking to the store.
    #[error("store connection error: {0}")]
    Connection(String),
}

/// Operations the relay core needs from the shared store.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Registers script source and returns its content handle.
    async fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError>;

    /// Executes a previously registered script.
    async fn eval_script(
        &self,
        handle: &ScriptHandle,
        keys: &[String],
        args: &[Value],
    ) -> Result<Value, StoreError>;

    /// Publishes `payload` on `channel`; returns how many subscribers got it.
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError>;

    /// Whether `key` currently exists.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Opens a new, exclusive subscriber.
    ///
    /// The control half adds and removes channels; the stream yields every
    /// message for the channels currently attached. Subscribers are never
    /// shared between connections.
    async fn subscriber(&self) -> Result<(Box<dyn SubscriptionControl>, MessageStream), StoreError>;
}

/// Control half of an exclusive subscriber.
#[async_trait]
pub trait SubscriptionControl: Send {
    /// Attaches a channel. Attaching an already attached channel is a no-op.
    async fn subscribe(&mut self, channel: &str) -> Result<(), StoreError>;

    /// Detaches a channel, leaving the others untouched.
    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError>;

    /// Detaches everything and releases the subscriber. The message stream
    /// ends once this returns.
    async fn close(self: Box<Self>) -> Result<(), StoreError>;
}
