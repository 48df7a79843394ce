//! Server configuration types and defaults.
//!
//! This module contains the configuration the relay core is started with.
//! File parsing and validation live in the binary; by the time a
//! [`ServerConfig`] reaches the library every field is already checked.

use crate::connection::OverflowPolicy;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration structure for the relay server.
///
/// Contains network settings, per-connection queue behaviour, the script
/// directory and the conventions used by the built-in lobby actions.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// The socket address to bind the server to
    pub bind_address: SocketAddr,

    /// Whether to set SO_REUSEPORT on the listening socket
    pub use_reuse_port: bool,

    /// Maximum number of concurrent connections allowed
    pub max_connections: usize,

    /// Directory holding one script file per action
    pub script_directory: PathBuf,

    /// Extension (without the dot) that marks a script file
    pub script_extension: String,

    /// Frames buffered per connection before the overflow policy applies
    pub outbound_capacity: usize,

    /// Upper bound for a single frame write
    pub write_timeout: Duration,

    /// What happens when a connection's outbound queue is full
    pub overflow_policy: OverflowPolicy,

    /// Key prefix of the lobby actions (`<prefix>:<id>`)
    pub lobby_prefix: String,

    /// Length of generated lobby ids
    pub lobby_id_length: usize,

    /// How long shutdown waits for connections to drain
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            use_reuse_port: false,
            max_connections: 1000,
            script_directory: PathBuf::from("lua_scripts"),
            script_extension: "lua".to_string(),
            outbound_capacity: 16,
            write_timeout: Duration::from_secs(5),
            overflow_policy: OverflowPolicy::Block,
            lobby_prefix: "lobby".to_string(),
            lobby_id_length: 6,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}
