//! Circuit health probing and degradation accounting.
//!
//! Every live circuit gets its own probe task. Results flow over one channel
//! into the engine's consumer loop, where [`HealthMonitor`] turns them into
//! advisories. Timeouts count as integrity failures here but are never
//! attributed to a relay.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use charon_common::{
    CircuitHandle, CircuitId, IdentityToken, IntegrityOutcome, ProbeResult, RelayId, SlotId,
};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::HealthConfig;

/// What a probe needs to know about the circuit under test
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub slot: SlotId,
    pub circuit: CircuitId,
    pub handle: Option<CircuitHandle>,
    pub hops: Vec<RelayId>,
    /// Stream isolation key; requests sharing it share the circuit
    pub identity: IdentityToken,
}

/// Raw measurement returned by a [`Prober`]
#[derive(Debug, Clone)]
pub struct ProbeSample {
    /// Time to the first response byte
    pub latency: Duration,
    pub throughput_bps: u64,
    /// Response body as received
    pub payload: Vec<u8>,
}

/// Fetches the reference payload through a circuit
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, target: &ProbeTarget) -> anyhow::Result<ProbeSample>;
}

/// Expected SHA-256 of the reference payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferencePayload {
    digest: [u8; 32],
}

impl ReferencePayload {
    pub fn from_bytes(payload: &[u8]) -> Self {
        Self {
            digest: Sha256::digest(payload).into(),
        }
    }

    pub fn from_hex(digest: &str) -> Option<Self> {
        let bytes = hex::decode(digest.trim()).ok()?;
        Some(Self {
            digest: bytes.try_into().ok()?,
        })
    }

    pub fn matches(&self, payload: &[u8]) -> bool {
        let digest: [u8; 32] = Sha256::digest(payload).into();
        digest == self.digest
    }
}

/// Run one probe and classify it. Never fails: errors become `Timeout`.
pub async fn run_probe(
    prober: &dyn Prober,
    reference: &ReferencePayload,
    target: &ProbeTarget,
    timeout: Duration,
) -> ProbeResult {
    let started = Instant::now();

    let (latency_ms, throughput_bps, integrity) =
        match tokio::time::timeout(timeout, prober.probe(target)).await {
            Ok(Ok(sample)) => {
                let integrity = if reference.matches(&sample.payload) {
                    IntegrityOutcome::Ok
                } else {
                    IntegrityOutcome::Mismatch
                };
                (sample.latency.as_millis() as u64, sample.throughput_bps, integrity)
            }
            Ok(Err(e)) => {
                tracing::debug!(circuit = %target.circuit, error = %e, "Probe failed");
                (started.elapsed().as_millis() as u64, 0, IntegrityOutcome::Timeout)
            }
            Err(_) => (timeout.as_millis() as u64, 0, IntegrityOutcome::Timeout),
        };

    ProbeResult {
        slot: target.slot,
        circuit: target.circuit,
        hops: target.hops.clone(),
        observed_at: chrono::Utc::now(),
        latency_ms,
        throughput_bps,
        integrity,
    }
}

/// Probe `target` every `interval` until aborted or the consumer goes away
pub fn spawn_probe_task(
    prober: Arc<dyn Prober>,
    reference: ReferencePayload,
    target: ProbeTarget,
    config: &HealthConfig,
    results: mpsc::Sender<ProbeResult>,
) -> JoinHandle<()> {
    let interval = config.probe_interval();
    let timeout = config.probe_timeout();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let result = run_probe(prober.as_ref(), &reference, &target, timeout).await;
            if results.send(result).await.is_err() {
                break;
            }
        }
    })
}

/// Why a circuit was marked degraded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradeReason {
    LowThroughput { readings: u32, floor: u64 },
    IntegrityFailures { consecutive: u32 },
}

impl std::fmt::Display for DegradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LowThroughput { readings, floor } => {
                write!(f, "{readings} consecutive readings below {floor} B/s")
            }
            Self::IntegrityFailures { consecutive } => {
                write!(f, "{consecutive} consecutive failed probes")
            }
        }
    }
}

/// Outcome of feeding one probe result to the monitor
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAdvisory {
    Degrade(DegradeReason),
    /// Payload was altered; hand the result to the detector
    IntegrityAlert { exit: Option<RelayId> },
}

#[derive(Debug, Default)]
struct CircuitHealth {
    low_readings: u32,
    failures: u32,
    probes: u64,
}

/// Per-circuit consecutive-failure accounting
pub struct HealthMonitor {
    config: HealthConfig,
    circuits: HashMap<CircuitId, CircuitHealth>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            circuits: HashMap::new(),
        }
    }

    /// Account one result. `min_bandwidth` of 0 disables the throughput check.
    pub fn observe(&mut self, result: &ProbeResult, min_bandwidth: u64) -> Vec<HealthAdvisory> {
        let threshold = self.config.degraded_after;
        let entry = self.circuits.entry(result.circuit).or_default();
        entry.probes += 1;

        let mut advisories = Vec::new();

        match result.integrity {
            IntegrityOutcome::Ok => entry.failures = 0,
            IntegrityOutcome::Mismatch => {
                entry.failures += 1;
                advisories.push(HealthAdvisory::IntegrityAlert {
                    exit: result.exit().cloned(),
                });
            }
            IntegrityOutcome::Timeout => entry.failures += 1,
        }

        // Throughput is only meaningful when something was transferred
        if min_bandwidth > 0 && result.integrity != IntegrityOutcome::Timeout {
            if result.throughput_bps < min_bandwidth {
                entry.low_readings += 1;
            } else {
                entry.low_readings = 0;
            }
            if entry.low_readings == threshold {
                advisories.push(HealthAdvisory::Degrade(DegradeReason::LowThroughput {
                    readings: entry.low_readings,
                    floor: min_bandwidth,
                }));
            }
        }

        if entry.failures == threshold {
            advisories.push(HealthAdvisory::Degrade(DegradeReason::IntegrityFailures {
                consecutive: entry.failures,
            }));
        }

        advisories
    }

    pub fn forget(&mut self, circuit: CircuitId) {
        self.circuits.remove(&circuit);
    }

    /// Drop accounting for circuits no longer in `live`
    pub fn retain_live(&mut self, live: &HashSet<CircuitId>) {
        self.circuits.retain(|id, _| live.contains(id));
    }

    /// Probes accounted for a circuit
    pub fn probes(&self, circuit: CircuitId) -> u64 {
        self.circuits.get(&circuit).map(|h| h.probes).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedProber, REFERENCE_BODY};

    fn result(circuit: u64, throughput: u64, integrity: IntegrityOutcome) -> ProbeResult {
        ProbeResult {
            slot: SlotId(1),
            circuit: CircuitId(circuit),
            hops: vec![RelayId::new("E"), RelayId::new("M"), RelayId::new("X")],
            observed_at: chrono::Utc::now(),
            latency_ms: 120,
            throughput_bps: throughput,
            integrity,
        }
    }

    fn target() -> ProbeTarget {
        ProbeTarget {
            slot: SlotId(1),
            circuit: CircuitId(7),
            handle: Some(CircuitHandle("7".into())),
            hops: vec![RelayId::new("E"), RelayId::new("M"), RelayId::new("X")],
            identity: IdentityToken("slot-1-7".into()),
        }
    }

    #[test]
    fn test_three_low_readings_degrade_once() {
        let mut monitor = HealthMonitor::new(HealthConfig::default());
        let low = result(1, 10, IntegrityOutcome::Ok);

        assert!(monitor.observe(&low, 1_000).is_empty());
        assert!(monitor.observe(&low, 1_000).is_empty());
        assert_eq!(
            monitor.observe(&low, 1_000),
            vec![HealthAdvisory::Degrade(DegradeReason::LowThroughput {
                readings: 3,
                floor: 1_000
            })]
        );
        // Already reported
        assert!(monitor.observe(&low, 1_000).is_empty());
    }

    #[test]
    fn test_good_reading_resets_streak() {
        let mut monitor = HealthMonitor::new(HealthConfig::default());
        let low = result(1, 10, IntegrityOutcome::Ok);
        let good = result(1, 5_000, IntegrityOutcome::Ok);

        monitor.observe(&low, 1_000);
        monitor.observe(&low, 1_000);
        monitor.observe(&good, 1_000);
        assert!(monitor.observe(&low, 1_000).is_empty());
        assert_eq!(monitor.probes(CircuitId(1)), 4);
    }

    #[test]
    fn test_timeouts_degrade_without_alert() {
        let mut monitor = HealthMonitor::new(HealthConfig::default());
        let timeout = result(2, 0, IntegrityOutcome::Timeout);

        assert!(monitor.observe(&timeout, 1_000).is_empty());
        assert!(monitor.observe(&timeout, 1_000).is_empty());
        assert_eq!(
            monitor.observe(&timeout, 1_000),
            vec![HealthAdvisory::Degrade(DegradeReason::IntegrityFailures { consecutive: 3 })]
        );
    }

    #[test]
    fn test_mismatch_raises_alert_immediately() {
        let mut monitor = HealthMonitor::new(HealthConfig::default());
        let advisories = monitor.observe(&result(3, 5_000, IntegrityOutcome::Mismatch), 0);
        assert_eq!(
            advisories,
            vec![HealthAdvisory::IntegrityAlert {
                exit: Some(RelayId::new("X"))
            }]
        );
    }

    #[tokio::test]
    async fn test_run_probe_classifies_payloads() {
        let reference = ReferencePayload::from_bytes(REFERENCE_BODY);
        let prober = ScriptedProber::new();

        let ok = run_probe(&prober, &reference, &target(), Duration::from_secs(5)).await;
        assert_eq!(ok.integrity, IntegrityOutcome::Ok);

        prober.tamper_with(RelayId::new("X"));
        let bad = run_probe(&prober, &reference, &target(), Duration::from_secs(5)).await;
        assert_eq!(bad.integrity, IntegrityOutcome::Mismatch);

        prober.set_silent(true);
        let lost = run_probe(&prober, &reference, &target(), Duration::from_secs(5)).await;
        assert_eq!(lost.integrity, IntegrityOutcome::Timeout);
        assert_eq!(lost.throughput_bps, 0);
    }

    #[test]
    fn test_reference_from_hex() {
        let hex_digest = hex::encode(Sha256::digest(b"hello"));
        let reference = ReferencePayload::from_hex(&hex_digest).unwrap();
        assert!(reference.matches(b"hello"));
        assert!(!reference.matches(b"hell0"));
        assert!(ReferencePayload::from_hex("abcd").is_none());
    }
}
