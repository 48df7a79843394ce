//! In-process store for tests and local development.
//!
//! Pub/sub follows the usual broker layout: one `broadcast` sender per
//! channel in a `DashMap`, created on first subscribe and dropped when the
//! last subscriber leaves.
//!
//! There is no script interpreter here. A script source is a JSON template:
//! loading parses it (a parse failure is a rejected script, like a compile
//! error in a real store) and evaluation returns the template with string
//! leaves `"$KEYS[n]"` and `"$ARGV[n]"` (1-based) replaced by the call's
//! keys and arguments. An object of the form `{"$error": "message"}`
//! evaluates to an execution error.

use super::{MessageStream, PubMessage, ScriptHandle, Store, StoreError, SubscriptionControl};
use crate::messaging::Value;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

/// Messages buffered per channel before a lagging subscriber starts
/// missing them.
const CHANNEL_CAPACITY: usize = 256;

/// Messages buffered per subscriber across all of its channels.
const SUBSCRIBER_BUFFER: usize = 256;

type ChannelMap = DashMap<String, broadcast::Sender<PubMessage>>;

/// A store that lives entirely inside the process.
#[derive(Default)]
pub struct MemoryStore {
    /// Registered templates keyed by handle.
    scripts: DashMap<String, serde_json::Value>,
    /// Plain keys, only probed through [`Store::exists`].
    keys: DashMap<String, String>,
    /// Channel name to broadcast sender.
    channels: Arc<ChannelMap>,
    /// Number of script evaluations attempted.
    evaluations: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a plain key.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.keys.insert(key.into(), value.into());
    }

    /// Deletes a plain key.
    pub fn remove(&self, key: &str) -> bool {
        self.keys.remove(key).is_some()
    }

    /// Drops every registered script, as a script cache flush would.
    pub fn flush_scripts(&self) {
        self.scripts.clear();
    }

    /// Number of `eval_script` calls made so far.
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }

    /// Number of live subscribers attached to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

fn digest(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

/// Parses `$KEYS[n]` / `$ARGV[n]` into the list name and zero-based index.
fn placeholder(s: &str) -> Option<(&str, usize)> {
    let rest = s.strip_prefix('$')?;
    let (list, tail) = rest.split_once('[')?;
    let n: usize = tail.strip_suffix(']')?.parse().ok()?;
    match list {
        "KEYS" | "ARGV" if n > 0 => Some((list, n - 1)),
        _ => None,
    }
}

fn render(
    template: &serde_json::Value,
    keys: &[String],
    args: &[Value],
) -> Result<Value, StoreError> {
    match template {
        serde_json::Value::String(s) => Ok(match placeholder(s) {
            Some(("KEYS", i)) => keys.get(i).cloned().map(Value::Str).unwrap_or_default(),
            Some((_, i)) => args.get(i).cloned().unwrap_or_default(),
            None => Value::Str(s.clone()),
        }),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| render(item, keys, args))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::List),
        serde_json::Value::Object(map) => {
            if let (1, Some(message)) = (map.len(), map.get("$error")) {
                let message = match render(message, keys, args)? {
                    Value::Str(s) => s,
                    other => other.to_string(),
                };
                return Err(StoreError::Script(message));
            }
            let mut out = std::collections::BTreeMap::new();
            for (k, v) in map {
                out.insert(k.clone(), render(v, keys, args)?);
            }
            Ok(Value::Map(out))
        }
        scalar => Ok(Value::from(scalar.clone())),
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError> {
        let template: serde_json::Value = serde_json::from_str(source)
            .map_err(|e| StoreError::Script(format!("compile error: {e}")))?;
        let handle = digest(source);
        self.scripts.insert(handle.clone(), template);
        Ok(ScriptHandle::new(handle))
    }

    async fn eval_script(
        &self,
        handle: &ScriptHandle,
        keys: &[String],
        args: &[Value],
    ) -> Result<Value, StoreError> {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let template = self
            .scripts
            .get(handle.as_str())
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StoreError::UnknownScript(handle.to_string()))?;
        render(&template, keys, args)
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError> {
        let Some(tx) = self.channels.get(channel) else {
            return Ok(0);
        };
        let msg = PubMessage {
            channel: Arc::from(channel),
            payload,
        };
        Ok(tx.send(msg).unwrap_or(0))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.keys.contains_key(key))
    }

    async fn subscriber(
        &self,
    ) -> Result<(Box<dyn SubscriptionControl>, MessageStream), StoreError> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let control = MemorySubscription {
            channels: self.channels.clone(),
            forwarders: HashMap::new(),
            tx,
        };
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        })
        .boxed();
        Ok((Box::new(control), stream))
    }
}

/// Subscriber over [`MemoryStore`] channels.
///
/// Each attached channel gets a forwarding task copying its broadcast
/// receiver into the subscriber's single queue, so messages from one
/// channel keep their publish order.
struct MemorySubscription {
    channels: Arc<ChannelMap>,
    forwarders: HashMap<String, JoinHandle<()>>,
    tx: mpsc::Sender<PubMessage>,
}

impl MemorySubscription {
    fn detach(&mut self, channel: &str) {
        let Some(task) = self.forwarders.remove(channel) else {
            return;
        };
        let ours = usize::from(!task.is_finished());
        task.abort();
        // The aborted task drops its receiver asynchronously; remove the
        // channel only when nobody else is listening.
        self.channels
            .remove_if(channel, |_, tx| tx.receiver_count() <= ours);
    }
}

#[async_trait]
impl SubscriptionControl for MemorySubscription {
    async fn subscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        if self.forwarders.contains_key(channel) {
            return Ok(());
        }
        let mut rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        let tx = self.tx.clone();
        let name = channel.to_string();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => {
                        if tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Subscriber lagging on {}, skipped {} messages", name, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        self.forwarders.insert(channel.to_string(), task);
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        self.detach(channel);
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), StoreError> {
        let names: Vec<String> = self.forwarders.keys().cloned().collect();
        for name in names {
            self.detach(&name);
        }
        Ok(())
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        for (_, task) in self.forwarders.drain() {
            task.abort();
        }
    }
}
