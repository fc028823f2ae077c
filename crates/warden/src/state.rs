//! Application state shared by the HTTP handlers.

use std::sync::Arc;

use tokio::time::Instant;

use crate::config::AppConfig;
use crate::engine::Engine;
use crate::persist::TrustStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// The orchestration engine
    pub engine: Engine,

    /// Trust persistence, when Redis is configured
    pub store: Option<TrustStore>,

    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig, engine: Engine, store: Option<TrustStore>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            store,
            started_at: Instant::now(),
        }
    }
}
