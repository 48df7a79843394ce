//! Action routing for decoded client requests.
//!
//! This module maps one [`ClientEnvelope`] to exactly one [`ServerEnvelope`].
//! Built-in control actions are handled here; every other action name is a
//! script invocation through the [`ScriptRegistry`].

use super::types::{ActionError, ClientEnvelope, ServerEnvelope};
use super::value::Value;
use crate::auth::Identity;
use crate::connection::ConnectionId;
use crate::pubsub::PubSubBridge;
use crate::scripts::{RegistryError, ScriptRegistry};
use crate::store::StoreError;
use rand::rngs::OsRng;
use rand::TryRngCore;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Alphabet for lobby ids: upper-case letters and digits without the
/// look-alikes `I`, `O`, `0` and `1`. Exactly 32 symbols so `byte % 32`
/// is unbiased.
const LOBBY_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Per-connection state a dispatch may touch.
pub struct RouteContext<'a> {
    pub connection: ConnectionId,
    pub identity: &'a Identity,
    pub bridge: &'a mut PubSubBridge,
}

/// Stateless dispatcher shared by every connection.
pub struct ActionRouter {
    registry: Arc<ScriptRegistry>,
    lobby_prefix: String,
    lobby_id_length: usize,
}

impl ActionRouter {
    pub fn new(
        registry: Arc<ScriptRegistry>,
        lobby_prefix: impl Into<String>,
        lobby_id_length: usize,
    ) -> Self {
        Self {
            registry,
            lobby_prefix: lobby_prefix.into(),
            lobby_id_length,
        }
    }

    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    /// Handles one request and produces its response.
    ///
    /// Every failure is turned into an error envelope; nothing here ends
    /// the connection.
    pub async fn dispatch(
        &self,
        envelope: &ClientEnvelope,
        ctx: &mut RouteContext<'_>,
    ) -> ServerEnvelope {
        match self.route(envelope, ctx).await {
            Ok(result) => ServerEnvelope::ok(envelope.id.clone(), result),
            Err(e) => {
                debug!(
                    connection = %ctx.connection,
                    user = ctx.identity.id,
                    action = %envelope.action,
                    "Action failed: {}", e
                );
                ServerEnvelope::error(envelope.id.clone(), &e)
            }
        }
    }

    async fn route(
        &self,
        envelope: &ClientEnvelope,
        ctx: &mut RouteContext<'_>,
    ) -> Result<Value, ActionError> {
        match envelope.action.as_str() {
            "ping" => Ok(Value::map([("message", Value::from("pong"))])),
            "subscribe" => {
                let channel = envelope.string_arg(0).ok_or_else(|| {
                    ActionError::InvalidArgs("subscribe requires a channel name".to_string())
                })?;
                ctx.bridge
                    .subscribe(channel)
                    .await
                    .map_err(|e| internal(ctx, "subscribe", e))?;
                Ok(Value::map([("subscribed", Value::from(channel))]))
            }
            "unsubscribe" => {
                let channel = envelope.string_arg(0).ok_or_else(|| {
                    ActionError::InvalidArgs("unsubscribe requires a channel name".to_string())
                })?;
                ctx.bridge
                    .unsubscribe(channel)
                    .await
                    .map_err(|e| internal(ctx, "unsubscribe", e))?;
                Ok(Value::map([("unsubscribed", Value::from(channel))]))
            }
            "create_lobby" => self.create_lobby(ctx).await,
            "join_lobby" => self.join_lobby(envelope, ctx).await,
            action => {
                let keys = envelope
                    .keys
                    .as_deref()
                    .filter(|keys| !keys.is_empty())
                    .ok_or_else(|| ActionError::InvalidKeys("keys are required".to_string()))?;
                if keys.iter().any(String::is_empty) {
                    return Err(ActionError::InvalidKeys(
                        "keys must be non-empty strings".to_string(),
                    ));
                }
                self.registry
                    .invoke(action, keys, &envelope.args)
                    .await
                    .map_err(|e| script_error(ctx, e))
            }
        }
    }

    async fn create_lobby(&self, ctx: &mut RouteContext<'_>) -> Result<Value, ActionError> {
        let lobby_id = generate_lobby_id(self.lobby_id_length).map_err(|e| {
            error!(connection = %ctx.connection, "Lobby id generation failed: {}", e);
            ActionError::Internal
        })?;
        let key = format!("{}:{}", self.lobby_prefix, lobby_id);

        self.registry
            .invoke("create_lobby", &[key], &[Value::from(lobby_id.as_str())])
            .await
            .map_err(|e| {
                error!(connection = %ctx.connection, lobby = %lobby_id, "Lobby creation failed: {}", e);
                ActionError::Internal
            })?;

        debug!(connection = %ctx.connection, lobby = %lobby_id, "Lobby created");
        Ok(Value::map([("lobby_id", Value::from(lobby_id))]))
    }

    async fn join_lobby(
        &self,
        envelope: &ClientEnvelope,
        ctx: &mut RouteContext<'_>,
    ) -> Result<Value, ActionError> {
        let lobby_id = envelope.string_arg(0).ok_or_else(|| {
            ActionError::InvalidArgs("join_lobby requires a lobby id".to_string())
        })?;
        let lobby_key = format!("{}:{}", self.lobby_prefix, lobby_id);
        let keys = [lobby_key.clone(), format!("{lobby_key}:players")];

        let mut args = Vec::with_capacity(envelope.args.len() + 1);
        args.push(Value::from(lobby_id));
        args.push(Value::from(ctx.identity.display_name.as_str()));
        args.extend(envelope.args.iter().skip(1).cloned());

        self.registry
            .invoke("join_lobby", &keys, &args)
            .await
            .map_err(|e| script_error(ctx, e))?;

        let events = format!("{lobby_key}:events");
        ctx.bridge
            .subscribe(&events)
            .await
            .map_err(|e| internal(ctx, "join_lobby", e))?;

        Ok(Value::map([
            ("lobby_id", Value::from(lobby_id)),
            ("joined_as", Value::from(ctx.identity.display_name.as_str())),
        ]))
    }
}

/// Draws a lobby id of `length` symbols from the OS random source.
pub fn generate_lobby_id(length: usize) -> Result<String, rand::rand_core::OsError> {
    let mut bytes = vec![0u8; length];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(bytes
        .iter()
        .map(|b| LOBBY_ALPHABET[usize::from(*b) % LOBBY_ALPHABET.len()] as char)
        .collect())
}

fn internal(ctx: &RouteContext<'_>, action: &str, e: StoreError) -> ActionError {
    error!(connection = %ctx.connection, action, "Subscription failed: {}", e);
    ActionError::Internal
}

fn script_error(ctx: &RouteContext<'_>, e: RegistryError) -> ActionError {
    match e {
        RegistryError::NotLoaded(name) => ActionError::NotLoaded(name),
        RegistryError::Invocation {
            source: StoreError::Script(message),
            ..
        } => ActionError::Invocation(message),
        RegistryError::Invocation {
            source: StoreError::UnknownScript(handle),
            ..
        } => ActionError::Invocation(format!("script {handle} is unavailable")),
        other => {
            warn!(connection = %ctx.connection, "Script call failed: {}", other);
            ActionError::Internal
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Outbound, OverflowPolicy};
    use crate::messaging::Status;
    use crate::store::{
        MemoryStore, MessageStream, ScriptHandle, Store, SubscriptionControl,
    };
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::{mpsc, watch};

    type Call = (Vec<String>, Vec<Value>);

    /// Records every script call before handing it to a [`MemoryStore`].
    #[derive(Default)]
    struct RecordingStore {
        inner: MemoryStore,
        calls: Mutex<Vec<Call>>,
    }

    #[async_trait]
    impl Store for RecordingStore {
        async fn load_script(&self, source: &str) -> Result<ScriptHandle, StoreError> {
            self.inner.load_script(source).await
        }

        async fn eval_script(
            &self,
            handle: &ScriptHandle,
            keys: &[String],
            args: &[Value],
        ) -> Result<Value, StoreError> {
            self.calls
                .lock()
                .unwrap()
                .push((keys.to_vec(), args.to_vec()));
            self.inner.eval_script(handle, keys, args).await
        }

        async fn publish(&self, channel: &str, payload: Bytes) -> Result<usize, StoreError> {
            self.inner.publish(channel, payload).await
        }

        async fn exists(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.exists(key).await
        }

        async fn subscriber(
            &self,
        ) -> Result<(Box<dyn SubscriptionControl>, MessageStream), StoreError> {
            self.inner.subscriber().await
        }
    }

    struct Harness {
        _dir: TempDir,
        store: Arc<RecordingStore>,
        router: ActionRouter,
        bridge: PubSubBridge,
        identity: Identity,
        frames: mpsc::Receiver<Bytes>,
        _cancel: Arc<watch::Sender<bool>>,
    }

    impl Harness {
        async fn new(scripts: &[(&str, &str)]) -> Self {
            let dir = TempDir::new().unwrap();
            for (name, body) in scripts {
                std::fs::write(dir.path().join(format!("{name}.lua")), body).unwrap();
            }
            let store = Arc::new(RecordingStore::default());
            let registry = Arc::new(ScriptRegistry::new(store.clone(), "lua"));
            registry.load_directory(dir.path()).await.unwrap();

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let cancel_tx = Arc::new(cancel_tx);
            let (outbound, frames) = Outbound::channel(16, OverflowPolicy::Block, cancel_tx.clone());
            let connection = uuid::Uuid::new_v4();
            let bridge = PubSubBridge::new(connection, store.clone(), outbound, cancel_rx);

            Self {
                _dir: dir,
                store,
                router: ActionRouter::new(registry, "lobby", 6),
                bridge,
                identity: Identity {
                    id: 42,
                    display_name: "alice".to_string(),
                    is_guest: false,
                },
                frames,
                _cancel: cancel_tx,
            }
        }

        async fn send(&mut self, json: &str) -> ServerEnvelope {
            let envelope = ClientEnvelope::decode(json.as_bytes()).unwrap();
            let mut ctx = RouteContext {
                connection: uuid::Uuid::nil(),
                identity: &self.identity,
                bridge: &mut self.bridge,
            };
            self.router.dispatch(&envelope, &mut ctx).await
        }

        fn calls(&self) -> Vec<Call> {
            self.store.calls.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn test_ping_echoes_id() {
        let mut h = Harness::new(&[]).await;
        let response = h.send(r#"{"id":"p-1","type":"request","action":"ping"}"#).await;
        assert_eq!(response.id, "p-1");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(
            response.result,
            Some(Value::map([("message", Value::from("pong"))]))
        );
    }

    #[tokio::test]
    async fn test_script_action_requires_keys() {
        let mut h = Harness::new(&[("move", r#""moved""#)]).await;

        let missing = h.send(r#"{"id":"1","action":"move","args":[1]}"#).await;
        assert_eq!(missing.error.as_deref(), Some("invalid_keys: keys are required"));

        let empty_list = h.send(r#"{"id":"2","action":"move","keys":[]}"#).await;
        assert_eq!(empty_list.status, Status::Error);

        let blank = h.send(r#"{"id":"3","action":"move","keys":["game:1",""]}"#).await;
        assert_eq!(
            blank.error.as_deref(),
            Some("invalid_keys: keys must be non-empty strings")
        );
        assert!(h.calls().is_empty());
    }

    #[tokio::test]
    async fn test_script_action_passes_keys_and_args_verbatim() {
        let mut h = Harness::new(&[("move", r#"{"at": "$KEYS[1]", "to": "$ARGV[2]"}"#)]).await;
        let response = h
            .send(r#"{"id":"m","action":"move","keys":["game:1"],"args":["e2","e4"]}"#)
            .await;
        assert_eq!(response.status, Status::Ok);
        let result = response.result.unwrap();
        assert_eq!(result.get("at"), Some(&Value::from("game:1")));
        assert_eq!(result.get("to"), Some(&Value::from("e4")));
        assert_eq!(
            h.calls(),
            vec![(
                vec!["game:1".to_string()],
                vec![Value::from("e2"), Value::from("e4")]
            )]
        );
    }

    #[tokio::test]
    async fn test_unknown_action_and_script_failure() {
        let mut h = Harness::new(&[("explode", r#"{"$error": "kaboom"}"#)]).await;
        let missing = h.send(r#"{"id":"x","action":"nope","keys":["k"]}"#).await;
        assert_eq!(
            missing.error.as_deref(),
            Some("script_error: script nope is not loaded")
        );

        let failed = h.send(r#"{"id":"y","action":"explode","keys":["k"]}"#).await;
        assert_eq!(failed.error.as_deref(), Some("script_error: kaboom"));
        assert!(failed.result.is_none());
    }

    #[tokio::test]
    async fn test_subscribe_validates_and_delivers() {
        let mut h = Harness::new(&[]).await;
        let bad = h.send(r#"{"id":"s0","action":"subscribe","args":[]}"#).await;
        assert_eq!(
            bad.error.as_deref(),
            Some("invalid_args: subscribe requires a channel name")
        );

        let ok = h.send(r#"{"id":"s1","action":"subscribe","args":["room:1:events"]}"#).await;
        assert_eq!(
            ok.result,
            Some(Value::map([("subscribed", Value::from("room:1:events"))]))
        );

        h.store
            .publish("room:1:events", Bytes::from_static(b"{\"hello\":1}"))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), h.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Bytes::from_static(b"{\"hello\":1}"));
    }

    #[tokio::test]
    async fn test_unsubscribe_without_subscription_is_ok() {
        let mut h = Harness::new(&[]).await;
        let response = h.send(r#"{"id":"u","action":"unsubscribe","args":["room:9"]}"#).await;
        assert_eq!(response.status, Status::Ok);
        assert!(!h.bridge.is_active());
    }

    #[tokio::test]
    async fn test_create_lobby() {
        let mut h = Harness::new(&[("create_lobby", r#""created""#)]).await;
        let response = h.send(r#"{"id":"c","action":"create_lobby"}"#).await;
        assert_eq!(response.status, Status::Ok);

        let lobby_id = response.result.unwrap().get("lobby_id").unwrap().as_str().unwrap().to_string();
        assert_eq!(lobby_id.len(), 6);
        assert_eq!(
            h.calls(),
            vec![(
                vec![format!("lobby:{lobby_id}")],
                vec![Value::from(lobby_id.as_str())]
            )]
        );
    }

    #[tokio::test]
    async fn test_create_lobby_failure_is_internal() {
        let mut h = Harness::new(&[]).await;
        let response = h.send(r#"{"id":"c","action":"create_lobby"}"#).await;
        assert_eq!(
            response.error.as_deref(),
            Some("internal_error: internal server error")
        );
    }

    #[tokio::test]
    async fn test_join_lobby_subscribes_to_events() {
        let mut h = Harness::new(&[("join_lobby", r#""joined""#)]).await;
        let response = h
            .send(r#"{"id":"j","action":"join_lobby","args":["L1",{"x":1}]}"#)
            .await;
        assert_eq!(
            response.result,
            Some(Value::map([
                ("lobby_id", Value::from("L1")),
                ("joined_as", Value::from("alice")),
            ]))
        );
        assert_eq!(
            h.calls(),
            vec![(
                vec!["lobby:L1".to_string(), "lobby:L1:players".to_string()],
                vec![
                    Value::from("L1"),
                    Value::from("alice"),
                    Value::map([("x", Value::Int(1))]),
                ]
            )]
        );
        assert_eq!(h.bridge.channels(), vec!["lobby:L1:events".to_string()]);

        h.store
            .publish("lobby:L1:events", Bytes::from_static(b"started"))
            .await
            .unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(1), h.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, Bytes::from_static(b"started"));
    }

    #[tokio::test]
    async fn test_join_lobby_failure_does_not_subscribe() {
        let mut h = Harness::new(&[("join_lobby", r#"{"$error": "lobby full"}"#)]).await;
        let response = h.send(r#"{"id":"j","action":"join_lobby","args":["L1"]}"#).await;
        assert_eq!(response.error.as_deref(), Some("script_error: lobby full"));
        assert!(!h.bridge.is_active());

        let missing = h.send(r#"{"id":"j2","action":"join_lobby"}"#).await;
        assert_eq!(
            missing.error.as_deref(),
            Some("invalid_args: join_lobby requires a lobby id")
        );
    }

    #[test]
    fn test_lobby_ids_use_alphabet() {
        for _ in 0..100 {
            let id = generate_lobby_id(8).unwrap();
            assert_eq!(id.len(), 8);
            assert!(id.bytes().all(|b| LOBBY_ALPHABET.contains(&b)));
        }
    }
}
