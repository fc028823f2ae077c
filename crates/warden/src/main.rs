//! # Warden - Charon circuit orchestration engine
//!
//! Drives a local Tor daemon through its control port and keeps a set of
//! circuit slots healthy, exposing them over a small admin API.
//!
//! ## Architecture
//! ```text
//! Admin API → Warden ──control port──→ Tor
//!               │  └────SOCKS probes──→ Tor → reference host
//!               ↓
//!           Redis (trust table, optional)
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use warden::config::{AppConfig, ConfigOverrides};
use warden::control::{TorAuth, TorControlPort};
use warden::engine::{Engine, EngineParts};
use warden::health::ReferencePayload;
use warden::persist::{TrustStore, restore_trust, trust_persist_worker};
use warden::pool::FileRelayPool;
use warden::probe::SocksProber;
use warden::routes;
use warden::state::AppState;

/// Charon Warden - circuit orchestration and health engine
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/warden.toml")]
    config: String,

    /// Tor control port address (overrides config)
    #[arg(long, env = "TOR_CONTROL_ADDR")]
    control: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Relay pool JSON file (overrides config)
    #[arg(long, env = "RELAY_POOL")]
    relay_pool: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    info!("🛶 Starting Charon Warden v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let overrides = ConfigOverrides {
        control_addr: args.control.clone(),
        listen_addr: args.listen.clone(),
        relay_pool_path: args.relay_pool.clone(),
    };
    let config = AppConfig::load(&args.config, &overrides)?;
    info!("📋 Configuration loaded from {}", args.config);

    let reference = ReferencePayload::from_hex(&config.probe.reference_sha256)
        .context("probe.reference_sha256 must be the SHA-256 hex digest of the reference document")?;

    // Connect to the control port
    let auth = match (&config.control_password, &config.control_cookie_path) {
        (Some(password), _) => TorAuth::Password(password.clone()),
        (None, Some(cookie)) => TorAuth::Cookie(PathBuf::from(cookie)),
        (None, None) => TorAuth::None,
    };
    let control = TorControlPort::connect(config.control_addr.clone(), auth)
        .await
        .with_context(|| format!("Failed to open control port {}", config.control_addr))?;
    info!("✅ Control port connected: {}", config.control_addr);

    let engine = Engine::launch(
        config.engine(),
        EngineParts {
            channel: Arc::new(control),
            pool: Arc::new(FileRelayPool::new(&config.relay_pool_path)),
            prober: Arc::new(SocksProber::new(config.socks_addr.clone(), config.probe.clone())),
            reference,
        },
    )
    .await?;

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Optional trust persistence
    let (store, persist_task) = match &config.redis_url {
        Some(url) => {
            let store = TrustStore::connect(url).await?;
            info!("✅ Redis connected: {}", url);
            restore_trust(&store, &engine.trust()).await;
            let task = tokio::spawn(trust_persist_worker(
                store.clone(),
                engine.trust(),
                config.trust_persist(),
                shutdown_tx.subscribe(),
            ));
            (Some(store), Some(task))
        }
        None => (None, None),
    };

    for _ in 0..config.initial_slots {
        match engine.start(config.policy.clone()).await {
            Ok(slot) => info!(slot = %slot, "Initial slot ready"),
            Err(e) => tracing::warn!(error = %e, "Initial slot failed to start"),
        }
    }

    // Build router
    let app = routes::create_router(AppState::new(config.clone(), engine.clone(), store));

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("🚀 Warden listening on {}", config.listen_addr);

    // Handle graceful shutdown
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("🛑 Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error")?;

    engine.shutdown().await;
    if let Some(task) = persist_task {
        let _ = task.await;
    }
    info!("👋 Warden shutdown complete");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
