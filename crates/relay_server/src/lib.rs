//! # Relay Server - Script-Driven Real-Time Relay
//!
//! A WebSocket relay that keeps one long-lived stream per client, answers a
//! small RPC envelope, and executes every non-built-in action as a script
//! inside a shared key/value store. Events published on the store's
//! channels are relayed back to the clients that subscribed to them.
//!
//! ## Architecture Overview
//!
//! ### Core Components
//!
//! * **Connection Actor** - One per client: reader loop, writer task and an
//!   optional pub/sub listener sharing a bounded outbound queue
//! * **Action Router** - Maps a request to a built-in action (`ping`,
//!   `subscribe`, `unsubscribe`, `create_lobby`, `join_lobby`) or a script
//! * **Script Registry** - Named catalog of store-side scripts, loaded from a
//!   directory and hot-reloaded when files change
//! * **Pub/Sub Bridge** - Per-connection store subscriber relaying channel
//!   messages untouched
//!
//! ### Message Flow
//!
//! 1. Client opens `GET /ws?token=...`; the token is resolved before upgrade
//! 2. Each text frame is decoded as `{id, type, action, keys, args}`
//! 3. The router dispatches it and the response is queued for the writer
//! 4. Responses leave in request order; channel events interleave freely
//!
//! ```json
//! {"id": "1", "type": "request", "action": "join_lobby", "args": ["K7QX2M", {"ready": false}]}
//! {"id": "1", "type": "response", "status": "ok", "result": {"lobby_id": "K7QX2M", "joined_as": "alice"}}
//! ```
//!
//! ## Error Handling
//!
//! * [`ServerError`] - startup and lifecycle failures
//! * [`messaging::ActionError`] - per-request failures, always answered
//!   with an error envelope and never fatal to the connection
//! * [`auth::AuthError`] - refused before the stream exists
//!
//! ## Stores
//!
//! [`store::RedisStore`] runs scripts as Lua via `EVALSHA`;
//! [`store::MemoryStore`] is an in-process stand-in used by tests.

// Re-export core types and functions for easy access
pub use config::ServerConfig;
pub use error::ServerError;
pub use server::RelayServer;
pub use utils::{create_server, create_server_with_config};

// Public module declarations
pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod messaging;
pub mod pubsub;
pub mod scripts;
pub mod server;
pub mod store;
pub mod utils;
