//! Convenience constructors.

use crate::auth::TokenVerifier;
use crate::config::ServerConfig;
use crate::server::RelayServer;
use crate::store::SharedStore;
use std::sync::Arc;

/// Creates a server with default configuration and HS256 token auth.
pub fn create_server(store: SharedStore, jwt_secret: &str) -> RelayServer {
    create_server_with_config(ServerConfig::default(), store, jwt_secret)
}

/// Creates a server with `config` and HS256 token auth backed by `store`.
pub fn create_server_with_config(
    config: ServerConfig,
    store: SharedStore,
    jwt_secret: &str,
) -> RelayServer {
    let resolver = Arc::new(TokenVerifier::new(jwt_secret, store.clone()));
    RelayServer::new(config, store, resolver)
}
