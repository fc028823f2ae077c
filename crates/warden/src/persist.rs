//! Redis persistence for the trust table.
//!
//! The snapshot is stored as one JSON document; blacklisted fingerprints
//! are also kept in a set so other tooling can read them without parsing.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use charon_common::RelayId;
use charon_common::constants::redis_keys;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::trust::{TrustRecord, TrustSnapshot, TrustTable};

/// Trust snapshot storage backed by Redis
#[derive(Clone)]
pub struct TrustStore {
    /// Redis connection manager (auto-reconnecting)
    redis: ConnectionManager,
}

impl TrustStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Failed to create Redis client")?;
        let redis = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        Ok(Self { redis })
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.redis.clone();
        let result: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
        result.is_ok()
    }

    pub async fn save(&self, snapshot: &TrustSnapshot) -> Result<()> {
        let json = serde_json::to_string(snapshot).context("Failed to encode trust snapshot")?;
        let blacklisted: Vec<String> = snapshot
            .relays
            .iter()
            .filter(|r| r.blacklisted)
            .map(|r| r.relay.to_string())
            .collect();

        let mut conn = self.redis.clone();
        let _: () = conn
            .set(redis_keys::TRUST_SNAPSHOT, json)
            .await
            .context("Failed to store trust snapshot")?;
        if !blacklisted.is_empty() {
            let _: () = conn
                .sadd(redis_keys::BLACKLIST, blacklisted)
                .await
                .context("Failed to store blacklist")?;
        }
        Ok(())
    }

    /// Stored snapshot merged with the blacklist set, if anything was stored
    pub async fn load(&self) -> Result<Option<TrustSnapshot>> {
        let mut conn = self.redis.clone();
        let json: Option<String> = conn
            .get(redis_keys::TRUST_SNAPSHOT)
            .await
            .context("Failed to read trust snapshot")?;
        let members: Vec<String> = conn
            .smembers(redis_keys::BLACKLIST)
            .await
            .context("Failed to read blacklist")?;

        let snapshot = json
            .map(|json| serde_json::from_str::<TrustSnapshot>(&json))
            .transpose()
            .context("Stored trust snapshot is corrupt")?;
        Ok(merge_blacklist(snapshot, members))
    }
}

/// Fold blacklist set members that the snapshot does not know about into it
fn merge_blacklist(snapshot: Option<TrustSnapshot>, members: Vec<String>) -> Option<TrustSnapshot> {
    if snapshot.is_none() && members.is_empty() {
        return None;
    }
    let mut snapshot = snapshot.unwrap_or_else(|| TrustSnapshot {
        taken_at: chrono::Utc::now(),
        relays: Vec::new(),
    });

    for member in members {
        let relay = RelayId::new(&member);
        match snapshot.relays.iter_mut().find(|r| r.relay == relay) {
            Some(record) => record.blacklisted = true,
            None => snapshot.relays.push(TrustRecord {
                relay,
                score: 0.0,
                blacklisted: true,
                reason: Some("restored from blacklist set".to_string()),
                violations: 0,
            }),
        }
    }
    Some(snapshot)
}

/// Restore the table from Redis; failures are logged and otherwise ignored
pub async fn restore_trust(store: &TrustStore, trust: &TrustTable) {
    match store.load().await {
        Ok(Some(snapshot)) => {
            let restored = trust.restore(&snapshot);
            tracing::info!(
                relays = restored,
                blacklisted = trust.blacklisted().len(),
                taken_at = %snapshot.taken_at,
                "Trust table restored"
            );
        }
        Ok(None) => tracing::info!("No stored trust table"),
        Err(e) => tracing::warn!(error = %e, "Failed to restore trust table"),
    }
}

/// Background worker that saves the trust table periodically and once more on shutdown
pub async fn trust_persist_worker(
    store: TrustStore,
    trust: Arc<TrustTable>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = store.save(&trust.snapshot()).await {
                    tracing::warn!(error = %e, "Failed to persist trust table");
                }
            }
            _ = shutdown.recv() => {
                tracing::info!("Trust persistence worker shutting down...");
                if let Err(e) = store.save(&trust.snapshot()).await {
                    tracing::warn!(error = %e, "Final trust table save failed");
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, blacklisted: bool) -> TrustRecord {
        TrustRecord {
            relay: RelayId::new(id),
            score: 0.4,
            blacklisted,
            reason: None,
            violations: 1,
        }
    }

    #[test]
    fn test_merge_nothing_stored() {
        assert!(merge_blacklist(None, Vec::new()).is_none());
    }

    #[test]
    fn test_merge_adds_set_members() {
        let snapshot = TrustSnapshot {
            taken_at: chrono::Utc::now(),
            relays: vec![record("AAAA", false), record("BBBB", true)],
        };
        let merged = merge_blacklist(Some(snapshot), vec!["AAAA".into(), "CCCC".into()]).unwrap();

        assert_eq!(merged.relays.len(), 3);
        assert!(merged.relays.iter().all(|r| r.blacklisted));
    }

    #[test]
    fn test_snapshot_json_restores_blacklist() {
        let trust = TrustTable::new(Duration::from_secs(3600));
        trust.blacklist(&RelayId::new("DDDD"), "tampering");
        trust.penalize(&RelayId::new("EEEE"), 0.2);

        let json = serde_json::to_string(&trust.snapshot()).unwrap();
        let decoded: TrustSnapshot = serde_json::from_str(&json).unwrap();

        let fresh = TrustTable::new(Duration::from_secs(3600));
        assert_eq!(fresh.restore(&decoded), 2);
        assert!(fresh.is_blacklisted(&RelayId::new("DDDD")));
        assert!(fresh.score(&RelayId::new("EEEE")) < 0.5);
    }
}
