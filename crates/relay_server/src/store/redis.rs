//! Redis backend.
//!
//! Script calls share one auto-reconnecting [`ConnectionManager`]; every
//! subscriber gets its own pub/sub connection because subscription state
//! belongs to the connection it was issued on.

use super::{MessageStream, PubMessage, ScriptHandle, Store, StoreError, SubscriptionControl};
use crate::messaging::Value;
use ::redis::aio::{ConnectionManager, PubSubSink};
use ::redis::{Client, ErrorKind, IntoConnectionInfo, Msg, RedisError, Value as RedisValue};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Store backed by a Redis server.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connects to `target`: a URL such as `redis://127.0.0.1:6379/0` or a
    /// prepared [`ConnectionInfo`](::redis::ConnectionInfo).
    ///
    /// Fails if the server cannot be reached, so a misconfigured store is
    /// caught at startup rather than on the first action.
    pub async fn connect<T: IntoConnectionInfo>(target: T) -> Result<Self, StoreError> {
        let client = Client::open(target).map_err(map_error)?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(map_error)?;
        info!("🗄️ Connected to Redis store");
        Ok(Self { client, conn })
    }
}

fn map_error(e: RedisError) -> StoreError {
    match e.kind() {
        ErrorKind::NoScriptError => StoreError::UnknownScript(e.to_string()),
        ErrorKind::ResponseError | ErrorKind::ExtensionError => StoreError::Script(e.to_string()),
        _ => StoreError::Connection(e.to_string()),
    }
}

fn bytes_to_string(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}

/// Folds a Redis reply into a [`Value`].
fn from_reply(reply: RedisValue) -> Value {
    match reply {
        RedisValue::Nil => Value::Nil,
        RedisValue::Int(i) => Value::Int(i),
        RedisValue::Double(f) => Value::Float(f),
        RedisValue::Boolean(b) => Value::Bool(b),
        RedisValue::Okay => Value::Str("OK".to_string()),
        RedisValue::SimpleString(s) => Value::Str(s),
        RedisValue::BulkString(bytes) => Value::Str(bytes_to_string(bytes)),
        RedisValue::VerbatimString { text, .. } => Value::Str(text),
        RedisValue::Array(items) | RedisValue::Set(items) => {
            Value::List(items.into_iter().map(from_reply).collect())
        }
        RedisValue::Map(pairs) => {
            let mut out = BTreeMap::new();
            for (k, v) in pairs {
                let key = match from_reply(k) {
                    Value::Str(s) => s,
                    other => other.to_string(),
                };
                out.insert(key, from_reply(v));
            }
            Value::Map(out)
        }
        other => Value::Str(format!("{other:?}")),
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError> {
        let mut conn = self.conn.clone();
        let sha: String = ::redis::cmd("SCRIPT")
            .arg("LOAD")
            .arg(source)
            .query_async(&mut conn)
            .await
            .map_err(map_error)?;
        Ok(ScriptHandle::new(sha))
    }

    async fn eval_script(
        &self,
        handle: &ScriptHandle,
        keys: &[String],
        args: &[Value],
    ) -> Result<Value, StoreError> {
        let mut cmd = ::redis::cmd("EVALSHA");
        cmd.arg(handle.as_str()).arg(keys.len());
        for key in keys {
            cmd.arg(key.as_str());
        }
        for arg in args {
            cmd.arg(arg.to_arg_string());
        }

        let mut conn = self.conn.clone();
        let reply: RedisValue = cmd.query_async(&mut conn).await.map_err(map_error)?;
        Ok(from_reply(reply))
    }

    async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload.as_ref())
            .query_async(&mut conn)
            .await
            .map_err(map_error)?;
        Ok(receivers.max(0) as usize)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let count: i64 = ::redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_error)?;
        Ok(count > 0)
    }

    async fn subscriber(
        &self,
    ) -> Result<(Box<dyn SubscriptionControl>, MessageStream), StoreError> {
        let pubsub = self.client.get_async_pubsub().await.map_err(map_error)?;
        let (sink, stream) = pubsub.split();
        let stream = stream
            .map(|msg: Msg| PubMessage {
                channel: Arc::from(msg.get_channel_name()),
                payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
            })
            .boxed();
        let control = RedisSubscription {
            sink,
            channels: HashSet::new(),
        };
        Ok((Box::new(control), stream))
    }
}

/// Control half of a dedicated Redis pub/sub connection.
struct RedisSubscription {
    sink: PubSubSink,
    channels: HashSet<String>,
}

#[async_trait]
impl SubscriptionControl for RedisSubscription {
    async fn subscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        if self.channels.contains(channel) {
            return Ok(());
        }
        self.sink.subscribe(channel).await.map_err(map_error)?;
        self.channels.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<(), StoreError> {
        if self.channels.remove(channel) {
            self.sink.unsubscribe(channel).await.map_err(map_error)?;
        }
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), StoreError> {
        for channel in std::mem::take(&mut self.channels) {
            self.sink.unsubscribe(&channel).await.map_err(map_error)?;
        }
        debug!("Redis subscriber released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_folding() {
        let reply = RedisValue::Array(vec![
            RedisValue::BulkString(b"lobby:AB12".to_vec()),
            RedisValue::Int(2),
            RedisValue::Nil,
        ]);
        assert_eq!(
            from_reply(reply),
            Value::List(vec![Value::from("lobby:AB12"), Value::Int(2), Value::Nil])
        );

        let map = RedisValue::Map(vec![(
            RedisValue::SimpleString("players".into()),
            RedisValue::Int(3),
        )]);
        assert_eq!(from_reply(map).get("players"), Some(&Value::Int(3)));
        assert_eq!(from_reply(RedisValue::Okay), Value::from("OK"));
    }
}
