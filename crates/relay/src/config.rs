//! Configuration management for the relay.
//!
//! This module handles loading, validation, and conversion of relay
//! configuration from TOML files, environment variables and command-line
//! arguments.

use anyhow::{anyhow, Context};
use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use relay_server::connection::OverflowPolicy;
use relay_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Application configuration loaded from a TOML file.
///
/// Every section has defaults, so a file only needs the values it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Network and lifecycle settings
    pub server: ServerSettings,
    /// Per-connection queue settings
    pub connection: ConnectionSettings,
    /// Script directory settings
    pub scripts: ScriptSettings,
    /// Shared store settings
    pub store: StoreSettings,
    /// Token verification settings
    pub auth: AuthSettings,
    /// Built-in lobby action settings
    pub lobby: LobbySettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

/// Server-specific configuration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Network address to bind to (e.g., "127.0.0.1:8080" or ":8080")
    pub bind_address: String,
    /// Maximum number of concurrent client connections
    pub max_connections: usize,
    /// Whether to set SO_REUSEPORT on the listener
    pub use_reuse_port: bool,
    /// Seconds to wait for connections to drain on shutdown
    pub shutdown_grace_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            max_connections: 1000,
            use_reuse_port: false,
            shutdown_grace_secs: 10,
        }
    }
}

/// Outbound queue behaviour for every connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Frames buffered per connection
    pub outbound_capacity: usize,
    /// Upper bound for one frame write, in milliseconds
    pub write_timeout_ms: u64,
    /// `block` waits for room, `disconnect` drops the slow client
    pub overflow_policy: OverflowPolicy,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 16,
            write_timeout_ms: 5000,
            overflow_policy: OverflowPolicy::Block,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    /// Directory holding one script file per action
    pub directory: String,
    /// Script file extension, without the dot
    pub extension: String,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        Self {
            directory: "./lua_scripts".to_string(),
            extension: "lua".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// `redis` or `memory`
    pub backend: String,
    /// Redis address (`host:port`, or `:port` for localhost)
    pub address: String,
    /// Redis password, if any
    pub password: Option<String>,
    /// Redis logical database
    pub database: i64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: "redis".to_string(),
            address: "127.0.0.1:6379".to_string(),
            password: None,
            database: 0,
        }
    }
}

impl StoreSettings {
    /// Connection settings for the Redis client.
    ///
    /// The password is passed through as-is, so it may contain any
    /// character, including ones that are reserved in URLs.
    pub fn redis_connection_info(&self) -> anyhow::Result<ConnectionInfo> {
        let address = normalize_address(&self.address, "127.0.0.1");
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("Redis address {address} has no port"))?;
        let port: u16 = port
            .parse()
            .map_err(|e| anyhow!("invalid Redis port in {address}: {e}"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(anyhow!("Redis address {address} has no host"));
        }

        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(host.to_string(), port),
            redis: RedisConnectionInfo {
                db: self.database,
                password: self.password.clone().filter(|p| !p.is_empty()),
                ..RedisConnectionInfo::default()
            },
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// HS256 secret shared with the token issuer
    pub jwt_secret: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LobbySettings {
    /// Key prefix for lobby records and channels
    pub key_prefix: String,
    /// Length of generated lobby ids
    pub id_length: usize,
}

impl Default for LobbySettings {
    fn default() -> Self {
        Self {
            key_prefix: "lobby".to_string(),
            id_length: 6,
        }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

/// Turns `:8080` into `<host>:8080`; other addresses pass through.
fn normalize_address(address: &str, host: &str) -> String {
    match address.strip_prefix(':') {
        Some(port) => format!("{host}:{port}"),
        None => address.to_string(),
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at
    /// the specified path and returns the default configuration.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    pub async fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let content = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let config: AppConfig = toml::from_str(&content)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Applies `APP_*` environment overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_env(|key| std::env::var(key).ok());
    }

    /// Applies `APP_*` overrides read through `lookup`. Empty values are
    /// ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(addr) = get("APP_WS_ADDR") {
            self.server.bind_address = addr;
        }
        if let Some(addr) = get("APP_REDIS_ADDR") {
            self.store.address = addr;
        }
        if let Some(password) = get("APP_REDIS_PASSWORD") {
            self.store.password = Some(password);
        }
        if let Some(dir) = get("APP_REDIS_LUA_SCRIPT") {
            self.scripts.directory = dir;
        }
        if let Some(secret) = get("APP_JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        let bind = normalize_address(&self.server.bind_address, "0.0.0.0");
        if bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.server.bind_address));
        }

        if self.scripts.directory.is_empty() {
            return Err("Script directory cannot be empty".to_string());
        }
        if self.scripts.extension.trim_start_matches('.').is_empty() {
            return Err("Script extension cannot be empty".to_string());
        }

        if self.connection.outbound_capacity == 0 {
            return Err("Outbound capacity must be at least 1".to_string());
        }
        if self.connection.write_timeout_ms == 0 {
            return Err("Write timeout must be greater than zero".to_string());
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        let valid_backends = ["redis", "memory"];
        if !valid_backends.contains(&self.store.backend.as_str()) {
            return Err(format!(
                "Invalid store backend: {}. Must be one of: {valid_backends:?}",
                &self.store.backend
            ));
        }

        if self.auth.jwt_secret.is_empty() {
            return Err("JWT secret cannot be empty".to_string());
        }

        if !(4..=32).contains(&self.lobby.id_length) {
            return Err(format!(
                "Lobby id length must be between 4 and 32, got {}",
                self.lobby.id_length
            ));
        }
        Ok(())
    }

    /// Converts the application configuration into the relay core's
    /// [`ServerConfig`].
    pub fn to_server_config(&self) -> anyhow::Result<ServerConfig> {
        let bind = normalize_address(&self.server.bind_address, "0.0.0.0");
        Ok(ServerConfig {
            bind_address: bind
                .parse()
                .map_err(|e| anyhow!("invalid bind address {bind}: {e}"))?,
            use_reuse_port: self.server.use_reuse_port,
            max_connections: self.server.max_connections,
            script_directory: PathBuf::from(&self.scripts.directory),
            script_extension: self.scripts.extension.trim_start_matches('.').to_string(),
            outbound_capacity: self.connection.outbound_capacity,
            write_timeout: Duration::from_millis(self.connection.write_timeout_ms),
            overflow_policy: self.connection.overflow_policy,
            lobby_prefix: self.lobby.key_prefix.clone(),
            lobby_id_length: self.lobby.id_length,
            shutdown_grace: Duration::from_secs(self.server.shutdown_grace_secs),
        })
    }
}
