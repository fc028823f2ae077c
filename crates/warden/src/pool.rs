//! Relay pool feeds and the cached snapshot the selector reads.
//!
//! The engine never parses a consensus itself: an integrating layer hands
//! it relay descriptors through [`RelayPool`]. [`PoolCache`] keeps the last
//! good snapshot so a failing feed never empties the pool.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use charon_common::{CharonError, RelayDescriptor, Result};
use serde::Deserialize;

/// Source of relay descriptors
#[async_trait]
pub trait RelayPool: Send + Sync {
    async fn snapshot(&self) -> Result<Vec<RelayDescriptor>>;
}

/// Fixed in-memory pool
pub struct StaticRelayPool {
    relays: RwLock<Vec<RelayDescriptor>>,
}

impl StaticRelayPool {
    pub fn new(relays: Vec<RelayDescriptor>) -> Self {
        Self {
            relays: RwLock::new(relays),
        }
    }

    /// Swap the served relays (picked up on the next refresh)
    pub fn replace(&self, relays: Vec<RelayDescriptor>) {
        *self.relays.write().unwrap_or_else(PoisonError::into_inner) = relays;
    }
}

#[async_trait]
impl RelayPool for StaticRelayPool {
    async fn snapshot(&self) -> Result<Vec<RelayDescriptor>> {
        Ok(self
            .relays
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}

/// Pool file layout: either a bare array or `{ "relays": [...] }`
#[derive(Deserialize)]
#[serde(untagged)]
enum PoolFile {
    Wrapped { relays: Vec<RelayDescriptor> },
    Bare(Vec<RelayDescriptor>),
}

/// JSON file re-read on every refresh
pub struct FileRelayPool {
    path: PathBuf,
}

impl FileRelayPool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RelayPool for FileRelayPool {
    async fn snapshot(&self) -> Result<Vec<RelayDescriptor>> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|e| CharonError::Pool(format!("{}: {e}", self.path.display())))?;

        let parsed: PoolFile = serde_json::from_slice(&raw)
            .map_err(|e| CharonError::Pool(format!("{}: {e}", self.path.display())))?;

        Ok(match parsed {
            PoolFile::Wrapped { relays } | PoolFile::Bare(relays) => relays,
        })
    }
}

/// Last good relay snapshot
pub struct PoolCache {
    source: Arc<dyn RelayPool>,
    current: RwLock<Arc<Vec<RelayDescriptor>>>,
    refreshed_at: RwLock<Option<DateTime<Utc>>>,
}

impl PoolCache {
    pub fn new(source: Arc<dyn RelayPool>) -> Self {
        Self {
            source,
            current: RwLock::new(Arc::new(Vec::new())),
            refreshed_at: RwLock::new(None),
        }
    }

    pub fn snapshot(&self) -> Arc<Vec<RelayDescriptor>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        *self.refreshed_at.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pull a new snapshot. On failure the previous one stays in place.
    pub async fn refresh(&self) -> Result<usize> {
        let mut relays = self.source.snapshot().await?;

        // Duplicate fingerprints would let one relay fill two hops
        relays.sort_by(|a, b| a.id.cmp(&b.id));
        relays.dedup_by(|a, b| a.id == b.id);

        let count = relays.len();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(relays);
        *self.refreshed_at.write().unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
        Ok(count)
    }
}

/// Background worker refreshing the pool on a fixed cadence
pub async fn pool_refresh_worker(
    cache: Arc<PoolCache>,
    every: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tracing::info!(every = ?every, "Relay pool worker started");

    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately; the engine already loaded the pool
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match cache.refresh().await {
                    Ok(count) => tracing::debug!(relays = count, "Relay pool refreshed"),
                    Err(e) => tracing::warn!(error = %e, "Relay pool refresh failed, keeping previous snapshot"),
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Relay pool worker shutting down...");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::relay;

    struct FlakyPool {
        fail: std::sync::atomic::AtomicBool,
        inner: StaticRelayPool,
    }

    #[async_trait]
    impl RelayPool for FlakyPool {
        async fn snapshot(&self) -> Result<Vec<RelayDescriptor>> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CharonError::Pool("feed unreachable".into()));
            }
            self.inner.snapshot().await
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let source = Arc::new(FlakyPool {
            fail: std::sync::atomic::AtomicBool::new(false),
            inner: StaticRelayPool::new(vec![relay("A1", "US", 10), relay("B2", "DE", 20)]),
        });
        let cache = PoolCache::new(source.clone());

        assert_eq!(cache.refresh().await.unwrap(), 2);
        source.fail.store(true, std::sync::atomic::Ordering::SeqCst);

        assert!(cache.refresh().await.is_err());
        assert_eq!(cache.len(), 2);
        assert!(cache.refreshed_at().is_some());
    }

    #[tokio::test]
    async fn test_refresh_drops_duplicate_fingerprints() {
        let mut dup = relay("A1", "US", 99);
        dup.nickname = "copy".into();
        let source = Arc::new(StaticRelayPool::new(vec![relay("A1", "US", 10), dup]));
        let cache = PoolCache::new(source);

        assert_eq!(cache.refresh().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_file_pool_accepts_both_layouts() {
        let dir = std::env::temp_dir().join(format!("warden-pool-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let bare = dir.join("bare.json");
        let relays = vec![relay("C3", "NL", 5_000)];
        tokio::fs::write(&bare, serde_json::to_vec(&relays).unwrap())
            .await
            .unwrap();

        let wrapped = dir.join("wrapped.json");
        let body = serde_json::json!({ "relays": relays });
        tokio::fs::write(&wrapped, body.to_string()).await.unwrap();

        assert_eq!(FileRelayPool::new(&bare).snapshot().await.unwrap().len(), 1);
        assert_eq!(FileRelayPool::new(&wrapped).snapshot().await.unwrap().len(), 1);

        let missing = FileRelayPool::new(dir.join("missing.json"));
        assert!(matches!(missing.snapshot().await, Err(CharonError::Pool(_))));

        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
