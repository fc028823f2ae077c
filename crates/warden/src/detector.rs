//! Malicious relay detection.
//!
//! A mismatch cannot be pinned on one hop, so it is attributed to every hop
//! of the probed circuit. Each relay keeps a sliding window of the probes it
//! took part in; crossing the window threshold (or the stricter exit
//! threshold) blacklists it. Only mismatches are attributed: timeouts and
//! clean probes merely fill the window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use charon_common::{CharonError, HopRole, IntegrityOutcome, ProbeResult, RelayId};

use crate::config::DetectorConfig;
use crate::trust::TrustTable;

#[derive(Debug, Clone, Copy)]
struct Observation {
    mismatch: bool,
    as_exit: bool,
}

/// A relay the detector just blacklisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub relay: RelayId,
    /// Mismatches in the window when the threshold was crossed
    pub mismatches: u32,
    /// Crossed through the exit threshold
    pub as_exit: bool,
}

/// Sliding-window integrity accounting per relay.
///
/// Owned by the single probe consumer loop, so verdicts are serialized.
pub struct MaliciousNodeDetector {
    config: DetectorConfig,
    trust: Arc<TrustTable>,
    windows: HashMap<RelayId, VecDeque<Observation>>,
}

impl MaliciousNodeDetector {
    pub fn new(config: DetectorConfig, trust: Arc<TrustTable>) -> Self {
        Self {
            config,
            trust,
            windows: HashMap::new(),
        }
    }

    /// Account one probe result; returns the relays it got blacklisted
    pub fn record(&mut self, result: &ProbeResult) -> Vec<Verdict> {
        let mismatch = result.integrity == IntegrityOutcome::Mismatch;
        let len = result.hops.len();
        let mut verdicts = Vec::new();

        for (index, relay) in result.hops.iter().enumerate() {
            if self.trust.is_blacklisted(relay) {
                continue;
            }
            let as_exit = HopRole::for_position(index, len) == HopRole::Exit;

            let window = self.windows.entry(relay.clone()).or_default();
            window.push_back(Observation { mismatch, as_exit });
            while window.len() > self.config.window {
                window.pop_front();
            }

            if !mismatch {
                continue;
            }

            let mismatches = window.iter().filter(|o| o.mismatch).count() as u32;
            let exit_mismatches = window.iter().filter(|o| o.mismatch && o.as_exit).count() as u32;

            let score = self.trust.penalize(relay, self.config.mismatch_penalty);
            tracing::debug!(
                relay = %relay,
                error = %CharonError::IntegrityViolation(relay.clone()),
                mismatches,
                exit_mismatches,
                score,
                "Mismatch attributed"
            );

            let exit_crossed = exit_mismatches >= self.config.exit_mismatch_threshold;
            if mismatches < self.config.mismatch_threshold && !exit_crossed {
                continue;
            }

            let reason = format!(
                "{mismatches} mismatches ({exit_mismatches} as exit) in last {} probes",
                self.config.window
            );
            if self.trust.blacklist(relay, &reason) {
                tracing::warn!(
                    relay = %relay,
                    error = %CharonError::RelayBlacklisted(relay.clone()),
                    %reason,
                    "Relay blacklisted"
                );
                self.windows.remove(relay);
                verdicts.push(Verdict {
                    relay: relay.clone(),
                    mismatches,
                    as_exit: exit_crossed,
                });
            }
        }

        verdicts
    }

    /// Mismatches currently in a relay's window
    pub fn mismatches(&self, relay: &RelayId) -> u32 {
        self.windows
            .get(relay)
            .map(|w| w.iter().filter(|o| o.mismatch).count() as u32)
            .unwrap_or(0)
    }
}
