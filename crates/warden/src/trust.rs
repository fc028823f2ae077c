//! Relay trust table and pluggable score contributors.
//!
//! The table is owned explicitly by the engine and shared by the selector
//! and the detector; separate engines never see each other's verdicts.
//! Scores live in [0, 1], decay toward neutral and only ever go down on
//! integrity violations. Blacklisting is monotonic for the process lifetime.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use charon_common::constants::{TRUST_CEILING, TRUST_FLOOR, TRUST_NEUTRAL};
use charon_common::{RelayDescriptor, RelayId};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct TrustEntry {
    /// Score as of `updated`
    score: f64,
    updated: Instant,
    blacklisted: bool,
    reason: Option<String>,
    /// Integrity violations attributed over the process lifetime
    violations: u64,
}

impl TrustEntry {
    fn neutral(now: Instant) -> Self {
        Self {
            score: TRUST_NEUTRAL,
            updated: now,
            blacklisted: false,
            reason: None,
            violations: 0,
        }
    }

    fn decayed(&self, now: Instant, half_life: Duration) -> f64 {
        if self.blacklisted {
            return TRUST_FLOOR;
        }
        if half_life.is_zero() {
            return self.score;
        }
        let elapsed = now.saturating_duration_since(self.updated).as_secs_f64();
        let factor = 0.5_f64.powf(elapsed / half_life.as_secs_f64());
        TRUST_NEUTRAL + (self.score - TRUST_NEUTRAL) * factor
    }
}

/// Per-relay trust scores and blacklist
pub struct TrustTable {
    entries: RwLock<HashMap<RelayId, TrustEntry>>,
    half_life: Duration,
}

impl TrustTable {
    pub fn new(half_life: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            half_life,
        }
    }

    /// Current score (neutral for relays never seen)
    pub fn score(&self, relay: &RelayId) -> f64 {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(relay)
            .map(|e| e.decayed(Instant::now(), self.half_life))
            .unwrap_or(TRUST_NEUTRAL)
    }

    pub fn is_blacklisted(&self, relay: &RelayId) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(relay).is_some_and(|e| e.blacklisted)
    }

    /// Lower a relay's score after an integrity violation; returns the new score
    pub fn penalize(&self, relay: &RelayId, amount: f64) -> f64 {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(relay.clone())
            .or_insert_with(|| TrustEntry::neutral(now));

        entry.score = (entry.decayed(now, self.half_life) - amount).clamp(TRUST_FLOOR, TRUST_CEILING);
        entry.updated = now;
        entry.violations += 1;
        entry.score
    }

    /// Blacklist a relay. Returns true only the first time.
    pub fn blacklist(&self, relay: &RelayId, reason: &str) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let entry = entries
            .entry(relay.clone())
            .or_insert_with(|| TrustEntry::neutral(now));

        if entry.blacklisted {
            return false;
        }
        entry.blacklisted = true;
        entry.score = TRUST_FLOOR;
        entry.updated = now;
        entry.reason = Some(reason.to_string());
        true
    }

    /// All blacklisted relays, sorted
    pub fn blacklisted(&self) -> Vec<RelayId> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = entries
            .iter()
            .filter(|(_, e)| e.blacklisted)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Serializable view for an integrating layer to persist
    pub fn snapshot(&self) -> TrustSnapshot {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut relays: Vec<_> = entries
            .iter()
            .map(|(id, e)| TrustRecord {
                relay: id.clone(),
                score: e.decayed(now, self.half_life),
                blacklisted: e.blacklisted,
                reason: e.reason.clone(),
                violations: e.violations,
            })
            .collect();
        relays.sort_by(|a, b| a.relay.cmp(&b.relay));

        TrustSnapshot {
            taken_at: chrono::Utc::now(),
            relays,
        }
    }

    /// Merge a persisted snapshot. Blacklist flags are only ever added.
    pub fn restore(&self, snapshot: &TrustSnapshot) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        for record in &snapshot.relays {
            let entry = entries
                .entry(record.relay.clone())
                .or_insert_with(|| TrustEntry::neutral(now));
            entry.score = record.score.clamp(TRUST_FLOOR, TRUST_CEILING);
            entry.updated = now;
            entry.violations = entry.violations.max(record.violations);
            if record.blacklisted {
                entry.blacklisted = true;
                entry.score = TRUST_FLOOR;
                entry.reason = record.reason.clone();
            }
        }
        snapshot.relays.len()
    }
}

/// Persisted form of one relay's trust
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustRecord {
    pub relay: RelayId,
    pub score: f64,
    pub blacklisted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub violations: u64,
}

/// Persisted form of the whole table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustSnapshot {
    pub taken_at: chrono::DateTime<chrono::Utc>,
    pub relays: Vec<TrustRecord>,
}

/// Extra scoring input for relay selection.
///
/// Contributions are added to the relay's trust score before ranking, so a
/// contributor can favour relays but never resurrect a blacklisted one.
pub trait TrustContributor: Send + Sync {
    fn name(&self) -> &'static str;

    fn contribution(&self, relay: &RelayDescriptor) -> f64;
}

/// Rewards exits that have been fast in past probes.
///
/// Keeps an exponentially weighted moving average of probe latency per exit
/// relay; an exit at zero latency earns `weight`, one at or above `ceiling`
/// earns nothing.
pub struct ExitLatencyContributor {
    weight: f64,
    ceiling_ms: f64,
    alpha: f64,
    averages: RwLock<HashMap<RelayId, f64>>,
}

impl ExitLatencyContributor {
    pub fn new(weight: f64, ceiling_ms: u64) -> Self {
        Self {
            weight,
            ceiling_ms: ceiling_ms.max(1) as f64,
            alpha: 0.3,
            averages: RwLock::new(HashMap::new()),
        }
    }

    pub fn observe(&self, exit: &RelayId, latency_ms: u64) {
        let mut averages = self.averages.write().unwrap_or_else(PoisonError::into_inner);
        let sample = latency_ms as f64;
        averages
            .entry(exit.clone())
            .and_modify(|avg| *avg = self.alpha * sample + (1.0 - self.alpha) * *avg)
            .or_insert(sample);
    }

    pub fn average_ms(&self, relay: &RelayId) -> Option<f64> {
        let averages = self.averages.read().unwrap_or_else(PoisonError::into_inner);
        averages.get(relay).copied()
    }
}

impl TrustContributor for ExitLatencyContributor {
    fn name(&self) -> &'static str {
        "exit-latency"
    }

    fn contribution(&self, relay: &RelayDescriptor) -> f64 {
        match self.average_ms(&relay.id) {
            Some(avg) => self.weight * (1.0 - (avg / self.ceiling_ms).min(1.0)),
            None => 0.0,
        }
    }
}
