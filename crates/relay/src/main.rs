//! Relay application entry point.
//!
//! Loads configuration (file, then `APP_*` environment, then command line),
//! sets up logging, connects the shared store and runs the relay server until
//! a termination signal arrives.

mod cli;
mod config;
mod logging;
mod signals;

use anyhow::{anyhow, Context};
use cli::CliArgs;
use config::AppConfig;
use relay_server::store::{MemoryStore, RedisStore, SharedStore};
use relay_server::{create_server_with_config, RelayServer};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Main application struct: the validated configuration plus the server and
/// the store it runs against.
pub struct Application {
    config: AppConfig,
    server: Arc<RelayServer>,
    store: SharedStore,
}

impl Application {
    /// Builds the application from command-line arguments.
    ///
    /// # Returns
    ///
    /// The ready-to-run application, or an error if configuration loading,
    /// validation, logging setup or the store connection failed.
    pub async fn new(args: CliArgs) -> anyhow::Result<Self> {
        // Load configuration first (before logging setup)
        let mut config = AppConfig::load_from_file(&args.config_path).await?;
        config.apply_env_overrides();

        // Apply CLI overrides
        if let Some(script_dir) = args.script_dir {
            config.scripts.directory = script_dir.to_string_lossy().to_string();
        }
        if let Some(bind_address) = args.bind_address {
            config.server.bind_address = bind_address;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }
        if args.memory_store {
            config.store.backend = "memory".to_string();
        }

        config
            .validate()
            .map_err(|e| anyhow!("Configuration validation failed: {e}"))?;

        logging::setup_logging(&config.logging)?;
        display_banner();

        let store: SharedStore = match config.store.backend.as_str() {
            "memory" => {
                warn!("Using the in-process store; state is lost on exit");
                Arc::new(MemoryStore::new())
            }
            _ => {
                let store = RedisStore::connect(config.store.redis_connection_info()?)
                    .await
                    .with_context(|| format!("connecting to Redis at {}", config.store.address))?;
                info!("🔌 Connected to Redis at {}", config.store.address);
                Arc::new(store)
            }
        };

        let server_config = config.to_server_config()?;
        let server = Arc::new(create_server_with_config(
            server_config,
            store.clone(),
            &config.auth.jwt_secret,
        ));

        info!("📂 Config: {}", args.config_path.display());
        Ok(Self {
            config,
            server,
            store,
        })
    }

    /// Runs the server until it stops on its own or a signal asks it to.
    pub async fn run(self) -> anyhow::Result<()> {
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!(
            "  📜 Scripts: {} (*.{})",
            self.config.scripts.directory, self.config.scripts.extension
        );
        info!("  🗄️ Store backend: {}", self.config.store.backend);
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!(
            "  📮 Outbound queue: {} frames, {:?} on overflow",
            self.config.connection.outbound_capacity, self.config.connection.overflow_policy
        );

        let server_handle = {
            let server = self.server.clone();
            tokio::spawn(async move { server.start().await })
        };
        tokio::pin!(server_handle);

        let outcome = tokio::select! {
            joined = &mut server_handle => Some(joined),
            signal = signals::wait_for_shutdown_signal() => {
                if let Err(e) = signal {
                    error!("Signal handling failed: {}", e);
                }
                None
            }
        };

        let joined = match outcome {
            Some(joined) => joined,
            None => {
                info!("🛑 Shutting down...");
                self.server.shutdown();
                server_handle.await
            }
        };

        let result = match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow!(e).context("relay server failed")),
            Err(e) => Err(anyhow!(e).context("relay server task panicked")),
        };

        // The store outlives every connection.
        drop(self.server);
        drop(self.store);
        info!("✅ Relay stopped");
        result
    }
}

/// Display startup banner using proper logging
fn display_banner() {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("UNK");
    info!("╔══════════════════════════════════════════╗");
    info!("║              📡 RELAY SERVER              ║");
    info!("║                  v{:<8}               ║", version);
    info!("║                                          ║");
    info!("║  Script-driven WebSocket relay           ║");
    info!("║  🔁 Hot-reloaded store scripts           ║");
    info!("║  📣 Pub/Sub event fan-out                ║");
    info!("╚══════════════════════════════════════════╝");
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();

    let app = match Application::new(args).await {
        Ok(app) => app,
        Err(e) => {
            // Logging may not be installed yet.
            eprintln!("❌ Failed to start relay: {e:#}");
            error!("❌ Failed to start relay: {:#}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = app.run().await {
        error!("❌ {:#}", e);
        std::process::exit(1);
    }
}
