//! Core relay server implementation.
//!
//! This module contains the main `RelayServer` struct, which wires the
//! script registry, the action router and the upgrade endpoint together and
//! runs the startup and shutdown sequences.

use super::handlers::{ws_handler, ConnectionTracker, RelayState};
use crate::auth::IdentityResolver;
use crate::config::ServerConfig;
use crate::connection::ConnectionSettings;
use crate::error::ServerError;
use crate::messaging::ActionRouter;
use crate::scripts::{ScriptRegistry, ScriptWatcher};
use crate::store::SharedStore;
use axum::routing::get;
use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Duration};
use tracing::{error, info, warn};

/// The relay server.
///
/// `RelayServer` owns everything shared between connections: the script
/// registry, the router, the identity resolver and the shared store handle.
/// Per-connection state lives in the connection actors it spawns.
///
/// # Lifecycle
///
/// 1. [`load_scripts`](Self::load_scripts) starts the directory watcher and
///    loads the script directory
/// 2. [`bind`](Self::bind) opens the listening socket
/// 3. [`serve`](Self::serve) accepts connections until
///    [`shutdown`](Self::shutdown) is called, then drains them
///
/// [`start`](Self::start) runs all three in order.
pub struct RelayServer {
    /// Server configuration settings
    config: ServerConfig,

    /// Catalog of script actions
    registry: Arc<ScriptRegistry>,

    /// State handed to the upgrade handler
    state: Arc<RelayState>,

    /// Channel for coordinating server shutdown
    shutdown_sender: watch::Sender<bool>,
}

impl RelayServer {
    /// Creates a new relay server.
    ///
    /// # Arguments
    ///
    /// * `config` - Configuration parameters for server behavior
    /// * `store` - Shared store used for scripts, pub/sub and guest records
    /// * `resolver` - Resolves connection tokens into identities
    pub fn new(
        config: ServerConfig,
        store: SharedStore,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Self {
        let registry = Arc::new(ScriptRegistry::new(
            store.clone(),
            config.script_extension.clone(),
        ));
        let router = Arc::new(ActionRouter::new(
            registry.clone(),
            config.lobby_prefix.clone(),
            config.lobby_id_length,
        ));
        let (shutdown_sender, shutdown_receiver) = watch::channel(false);

        let state = Arc::new(RelayState {
            router,
            store,
            resolver,
            settings: ConnectionSettings::from(&config),
            tracker: ConnectionTracker::new(config.max_connections),
            shutdown: shutdown_receiver,
        });

        Self {
            config,
            registry,
            state,
            shutdown_sender,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ScriptRegistry> {
        &self.registry
    }

    /// Number of connections currently open.
    pub fn active_connections(&self) -> usize {
        self.state.tracker.active()
    }

    /// Builds the HTTP router: `GET /ws` upgrades to a relay connection.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .with_state(self.state.clone())
    }

    /// Runs the full startup sequence and serves until shutdown.
    ///
    /// # Returns
    ///
    /// `Ok(())` after a clean shutdown, or a `ServerError` if the scripts
    /// could not be watched or the socket could not be bound.
    pub async fn start(&self) -> Result<(), ServerError> {
        info!("🚀 Starting relay server on {}", self.config.bind_address);
        let watcher = self.load_scripts().await?;
        let listener = match self.bind() {
            Ok(listener) => listener,
            Err(e) => {
                watcher.abort();
                return Err(e);
            }
        };
        self.serve(listener, watcher).await
    }

    /// Starts watching the script directory, then loads it.
    ///
    /// The watch is established first so a file written while the directory
    /// is being read is still picked up. Individual files that fail to load
    /// are skipped. An unreadable directory or a watch that cannot be
    /// established is fatal.
    pub async fn load_scripts(&self) -> Result<ScriptWatcher, ServerError> {
        let directory = &self.config.script_directory;
        let watcher = ScriptWatcher::spawn(
            self.registry.clone(),
            directory.clone(),
            self.shutdown_sender.subscribe(),
        )?;

        info!("📜 Loading scripts from: {}", directory.display());
        let report = match self.registry.load_directory(directory).await {
            Ok(report) => report,
            Err(e) => {
                watcher.abort();
                return Err(e.into());
            }
        };
        if report.loaded.is_empty() {
            info!("📭 No scripts loaded");
        } else {
            info!("🎉 Loaded {} script(s): {:?}", report.loaded.len(), report.loaded);
        }
        for (path, reason) in &report.failed {
            warn!("Script {} was skipped: {}", path.display(), reason);
        }
        Ok(watcher)
    }

    /// Creates the listening socket with `socket2` so address and port
    /// reuse can be configured before binding.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr: SocketAddr = self.config.bind_address;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| ServerError::Network(format!("Socket creation failed: {e}")))?;
        if let Err(e) = socket.set_reuse_address(true) {
            warn!("Failed to set SO_REUSEADDR: {}", e);
        }

        if self.config.use_reuse_port {
            #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin"))))]
            match socket.set_reuse_port(true) {
                Ok(()) => info!("SO_REUSEPORT enabled"),
                Err(e) => warn!("Failed to set SO_REUSEPORT: {}", e),
            }
            #[cfg(not(all(unix, not(any(target_os = "solaris", target_os = "illumos", target_os = "cygwin")))))]
            warn!("SO_REUSEPORT is not supported on this platform");
        }

        socket
            .bind(&addr.into())
            .map_err(|e| ServerError::Network(format!("Bind failed: {e}")))?;
        socket
            .listen(1024)
            .map_err(|e| ServerError::Network(format!("Listen failed: {e}")))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| ServerError::Network(format!("Failed to set non-blocking: {e}")))?;

        let std_listener: StdTcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)
            .map_err(|e| ServerError::Network(format!("Tokio listener creation failed: {e}")))?;

        match listener.local_addr() {
            Ok(local) => info!("✅ Listening on {}", local),
            Err(_) => info!("✅ Listening on {}", addr),
        }
        Ok(listener)
    }

    /// Serves connections on `listener` until shutdown is requested.
    ///
    /// After the signal no new streams are accepted, every connection is
    /// told to drain, and the call waits up to the configured grace period
    /// for them to finish before stopping the watcher.
    pub async fn serve(
        &self,
        listener: TcpListener,
        watcher: ScriptWatcher,
    ) -> Result<(), ServerError> {
        let mut shutdown = self.shutdown_sender.subscribe();
        let app = self.router();

        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow_and_update() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        // Make sure connections drain even if serving failed on its own.
        self.shutdown_sender.send_replace(true);
        info!("🧹 Draining {} connection(s)...", self.active_connections());
        let drained = timeout(self.config.shutdown_grace, async {
            while self.active_connections() > 0 {
                sleep(Duration::from_millis(25)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                "{} connection(s) still open after {:?}",
                self.active_connections(),
                self.config.shutdown_grace
            );
        }

        watcher.join().await;

        if let Err(e) = served {
            error!("Server error: {}", e);
            return Err(ServerError::Network(e.to_string()));
        }
        info!("Server stopped");
        Ok(())
    }

    /// Signals the server and every connection to shut down.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown_sender.send_replace(true);
    }
}
