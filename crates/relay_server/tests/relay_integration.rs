//! End-to-end tests for the relay endpoint
//!
//! These tests start the real HTTP endpoint on an ephemeral port, backed by
//! the in-process store, and talk to it with a WebSocket client.

use futures::{SinkExt, StreamExt};
use relay_server::auth::sign_token;
use relay_server::store::{MemoryStore, Store};
use relay_server::{create_server_with_config, RelayServer, ServerConfig, ServerError};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const SECRET: &str = "integration-secret";

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    server: Arc<RelayServer>,
    store: Arc<MemoryStore>,
    scripts: TempDir,
    task: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start(max_connections: usize) -> Self {
        let scripts = TempDir::new().unwrap();
        std::fs::write(
            scripts.path().join("join_lobby.lua"),
            r#"{"lobby": "$KEYS[1]", "player": "$ARGV[2]"}"#,
        )
        .unwrap();
        std::fs::write(scripts.path().join("echo.lua"), r#"["$KEYS[1]", "$ARGV[1]"]"#).unwrap();

        let config = ServerConfig {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            max_connections,
            script_directory: scripts.path().to_path_buf(),
            shutdown_grace: Duration::from_secs(2),
            ..ServerConfig::default()
        };

        let store = Arc::new(MemoryStore::new());
        let server = Arc::new(create_server_with_config(config, store.clone(), SECRET));
        let watcher = server.load_scripts().await.unwrap();
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();

        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve(listener, watcher).await });

        Self {
            addr,
            server,
            store,
            scripts,
            task,
        }
    }

    fn url(&self, token: Option<&str>) -> String {
        match token {
            Some(token) => format!("ws://{}/ws?token={}", self.addr, token),
            None => format!("ws://{}/ws", self.addr),
        }
    }

    async fn connect(&self, user_id: i64, name: &str) -> Client {
        let (client, _) = connect_async(self.url(Some(&token(user_id, name))))
            .await
            .unwrap();
        client
    }
}

fn token(user_id: i64, name: &str) -> String {
    let exp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 600;
    sign_token(
        SECRET.as_bytes(),
        &json!({"user_id": user_id, "name": name, "exp": exp}),
    )
}

async fn request(client: &mut Client, body: Value) {
    client.send(Message::text(body.to_string())).await.unwrap();
}

async fn next_json(client: &mut Client) -> Value {
    loop {
        let message = timeout(Duration::from_secs(2), client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .unwrap();
        match message {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message {other:?}"),
        }
    }
}

fn rejected_status(result: Result<(Client, impl Sized), WsError>) -> u16 {
    match result {
        Err(WsError::Http(response)) => response.status().as_u16(),
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("connection was accepted"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unauthenticated_clients_are_rejected() {
    let server = TestServer::start(10).await;

    assert_eq!(rejected_status(connect_async(server.url(None)).await), 401);
    assert_eq!(
        rejected_status(connect_async(server.url(Some("not-a-token"))).await),
        401
    );

    let forged = sign_token(b"wrong", &json!({"user_id": 1, "exp": 9_999_999_999u64}));
    assert_eq!(
        rejected_status(connect_async(server.url(Some(&forged))).await),
        401
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_ping_round_trip_in_order() {
    let server = TestServer::start(10).await;
    let mut client = server.connect(7, "alice").await;

    request(&mut client, json!({"id": "a", "type": "request", "action": "ping"})).await;
    request(&mut client, json!({"id": "b", "type": "request", "action": "ping"})).await;

    let first = next_json(&mut client).await;
    let second = next_json(&mut client).await;
    assert_eq!(first["id"], "a");
    assert_eq!(second["id"], "b");
    assert_eq!(first["status"], "ok");
    assert_eq!(first["result"]["message"], "pong");
    assert!(first.get("error").is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_action_and_errors() {
    let server = TestServer::start(10).await;
    let mut client = server.connect(7, "alice").await;

    client.send(Message::text("{broken")).await.unwrap();
    request(
        &mut client,
        json!({"id": "e", "action": "echo", "keys": ["room:1"], "args": ["hi"]}),
    )
    .await;
    let echoed = next_json(&mut client).await;
    assert_eq!(echoed["id"], "e");
    assert_eq!(echoed["result"], json!(["room:1", "hi"]));

    request(&mut client, json!({"id": "k", "action": "echo", "args": ["hi"]})).await;
    let missing_keys = next_json(&mut client).await;
    assert_eq!(missing_keys["status"], "error");
    assert_eq!(missing_keys["error"], "invalid_keys: keys are required");

    request(&mut client, json!({"id": "n", "action": "nope", "keys": ["x"]})).await;
    let not_loaded = next_json(&mut client).await;
    assert_eq!(not_loaded["error"], "script_error: script nope is not loaded");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_lobby_receives_lobby_events() {
    let server = TestServer::start(10).await;
    let mut client = server.connect(7, "alice").await;

    request(
        &mut client,
        json!({"id": "j", "action": "join_lobby", "args": ["L1", {"ready": false}]}),
    )
    .await;
    let joined = next_json(&mut client).await;
    assert_eq!(joined["result"], json!({"lobby_id": "L1", "joined_as": "alice"}));

    let delivered = server
        .store
        .publish(
            "lobby:L1:events",
            bytes::Bytes::from_static(br#"{"event":"player_joined","name":"bob"}"#),
        )
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let event = next_json(&mut client).await;
    assert_eq!(event, json!({"event": "player_joined", "name": "bob"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hot_reloaded_script_is_served() {
    let server = TestServer::start(10).await;
    let mut client = server.connect(7, "alice").await;

    std::fs::write(server.scripts.path().join("score.lua"), r#"{"score": 10}"#).unwrap();

    let mut attempt = 0;
    loop {
        request(&mut client, json!({"id": attempt.to_string(), "action": "score", "keys": ["s"]})).await;
        let response = next_json(&mut client).await;
        if response["status"] == "ok" {
            assert_eq!(response["result"]["score"], 10);
            break;
        }
        attempt += 1;
        assert!(attempt < 100, "script was never picked up");
        sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connection_limit_and_shutdown() {
    let server = TestServer::start(1).await;
    let mut first = server.connect(1, "one").await;

    assert_eq!(
        rejected_status(connect_async(server.url(Some(&token(2, "two")))).await),
        503
    );

    request(&mut first, json!({"id": "p", "action": "ping"})).await;
    assert_eq!(next_json(&mut first).await["id"], "p");

    server.server.shutdown();
    let closed = timeout(Duration::from_secs(2), async {
        loop {
            match first.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    let result = timeout(Duration::from_secs(5), server.task).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(server.server.active_connections(), 0);
}
