//! Core types shared across Charon components.

use std::collections::BTreeSet;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_COOLDOWN_ROTATIONS, DEFAULT_COOLDOWN_WINDOW_SECS, DEFAULT_HOP_COUNT,
    DEFAULT_ROTATION_SECS, MAX_HOP_COUNT, MIN_HOP_COUNT,
};
use crate::error::{CharonError, Result};

/// Stable relay fingerprint (uppercase hex, no `$` prefix)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayId(String);

impl RelayId {
    pub fn new(fingerprint: impl AsRef<str>) -> Self {
        let raw = fingerprint.as_ref().trim();
        Self(raw.trim_start_matches('$').to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RelayId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Logical client identity owning at most one active circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot-{}", self.0)
    }
}

/// Engine-local circuit identifier (never reused)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircuitId(pub u64);

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circ-{}", self.0)
    }
}

/// Circuit identifier assigned by the relay daemon
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CircuitHandle(pub String);

impl fmt::Display for CircuitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque correlation id grouping requests that share a circuit
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityToken(pub String);

impl fmt::Display for IdentityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Relay metadata as supplied by the relay pool feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    /// Stable fingerprint
    pub id: RelayId,

    /// Human-readable nickname
    #[serde(default)]
    pub nickname: String,

    /// OR address (`ip:port`)
    pub address: String,

    /// Two-letter country code
    pub country: String,

    /// Declared bandwidth in bytes per second
    pub bandwidth: u64,

    /// Family/operator tag; relays sharing a tag never share a circuit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,

    /// Consensus flags (Guard, Exit, Stable, ...)
    #[serde(default)]
    pub flags: BTreeSet<String>,
}

impl RelayDescriptor {
    /// Returns true if both relays carry the same family tag
    pub fn shares_family(&self, other: &RelayDescriptor) -> bool {
        match (&self.family, &other.family) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }

    /// Network prefix used for subnet diversity (/16 for IPv4, /32 for IPv6)
    pub fn subnet_key(&self) -> Option<String> {
        let ip = self
            .address
            .parse::<SocketAddr>()
            .map(|s| s.ip())
            .or_else(|_| self.address.parse::<IpAddr>())
            .ok()?;

        Some(match ip {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                format!("{}.{}", o[0], o[1])
            }
            IpAddr::V6(v6) => {
                let s = v6.segments();
                format!("{:x}:{:x}", s[0], s[1])
            }
        })
    }
}

/// Position of a relay inside a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HopRole {
    Entry,
    Middle,
    Exit,
}

impl HopRole {
    /// Role of hop `index` in a circuit of `len` hops
    pub fn for_position(index: usize, len: usize) -> Self {
        if index == 0 {
            Self::Entry
        } else if index + 1 == len {
            Self::Exit
        } else {
            Self::Middle
        }
    }
}

/// Lifecycle state of a circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CircuitState {
    /// Chain selected, build issued, not yet acknowledged
    Building,
    /// Acknowledged and carrying traffic
    Live,
    /// Usable but underperforming; preferred rotation candidate
    Degraded,
    /// Contains a blacklisted relay; queued for teardown
    Tainted,
    /// Close issued
    Closing,
    /// Terminal
    Closed,
    /// Build gave up (terminal)
    Failed,
}

impl CircuitState {
    /// Legal transitions of the circuit state machine
    pub fn can_transition_to(self, next: CircuitState) -> bool {
        use CircuitState::*;
        matches!(
            (self, next),
            (Building, Live)
                | (Building, Failed)
                | (Building, Closing)
                | (Live, Degraded)
                | (Live, Tainted)
                | (Degraded, Tainted)
                | (Live, Closing)
                | (Degraded, Closing)
                | (Tainted, Closing)
                | (Closing, Closed)
        )
    }

    /// Circuit may carry traffic and is probed
    pub fn is_usable(self) -> bool {
        matches!(self, Self::Live | Self::Degraded)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Failed)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Building => "building",
            Self::Live => "live",
            Self::Degraded => "degraded",
            Self::Tainted => "tainted",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Circuit state as reported by the relay daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteCircuitState {
    Launched,
    Extended,
    Built,
    Failed,
    Closed,
    Unknown,
}

/// Integrity verdict of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntegrityOutcome {
    /// Reference payload arrived intact
    Ok,
    /// Payload arrived altered (active tampering)
    Mismatch,
    /// No answer within the probe timeout
    Timeout,
}

impl IntegrityOutcome {
    /// Timeouts count as integrity failures for health accounting
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Ok)
    }
}

/// Result of a single health probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResult {
    pub slot: SlotId,
    pub circuit: CircuitId,
    /// Hops of the probed circuit, entry first
    pub hops: Vec<RelayId>,
    pub observed_at: DateTime<Utc>,
    pub latency_ms: u64,
    /// Achieved throughput in bytes per second
    pub throughput_bps: u64,
    pub integrity: IntegrityOutcome,
}

impl ProbeResult {
    pub fn exit(&self) -> Option<&RelayId> {
        self.hops.last()
    }
}

/// Cool-down rules for relay reuse across rotations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CooldownPolicy {
    /// Relays used within this many seconds are avoided
    #[serde(default = "default_cooldown_window")]
    pub window_secs: u64,

    /// Relays used in the last N rotations are avoided
    #[serde(default = "default_cooldown_rotations")]
    pub rotations: u32,

    /// Exclude cooled relays outright instead of ranking them last
    #[serde(default)]
    pub strict: bool,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            window_secs: default_cooldown_window(),
            rotations: default_cooldown_rotations(),
            strict: false,
        }
    }
}

/// Relay selection and rotation policy for one slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    /// Number of hops (>= 2)
    #[serde(default = "default_hop_count")]
    pub hop_count: usize,

    /// Allowed countries (two-letter codes); `None` allows all
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countries: Option<BTreeSet<String>>,

    /// Minimum declared and probed bandwidth, bytes per second
    #[serde(default)]
    pub min_bandwidth: u64,

    /// Seconds between planned rotations; 0 disables timed rotation
    #[serde(default = "default_rotation_secs")]
    pub rotation_interval_secs: u64,

    #[serde(default)]
    pub cooldown: CooldownPolicy,

    /// Rotate before each logical request
    #[serde(default)]
    pub rotate_per_request: bool,

    /// No two hops in the same /16 (IPv4) or /32 (IPv6)
    #[serde(default = "default_true")]
    pub distinct_subnets: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            hop_count: default_hop_count(),
            countries: None,
            min_bandwidth: 0,
            rotation_interval_secs: default_rotation_secs(),
            cooldown: CooldownPolicy::default(),
            rotate_per_request: false,
            distinct_subnets: true,
        }
    }
}

impl Policy {
    /// Reject policies that can never be satisfied or are malformed
    pub fn validate(&self) -> Result<()> {
        if !(MIN_HOP_COUNT..=MAX_HOP_COUNT).contains(&self.hop_count) {
            return Err(CharonError::ConfigInvalid(format!(
                "hop_count must be between {MIN_HOP_COUNT} and {MAX_HOP_COUNT}, got {}",
                self.hop_count
            )));
        }

        if let Some(countries) = &self.countries {
            if countries.is_empty() {
                return Err(CharonError::ConfigInvalid(
                    "countries allow-list is empty".to_string(),
                ));
            }
            if let Some(bad) = countries
                .iter()
                .find(|c| c.len() != 2 || !c.chars().all(|ch| ch.is_ascii_alphabetic()))
            {
                return Err(CharonError::ConfigInvalid(format!(
                    "invalid country code '{bad}'"
                )));
            }
        }

        Ok(())
    }

    pub fn allows_country(&self, country: &str) -> bool {
        match &self.countries {
            Some(allowed) => allowed.iter().any(|c| c.eq_ignore_ascii_case(country)),
            None => true,
        }
    }

    pub fn rotation_interval(&self) -> Option<Duration> {
        (self.rotation_interval_secs > 0).then(|| Duration::from_secs(self.rotation_interval_secs))
    }

    pub fn cooldown_window(&self) -> Duration {
        Duration::from_secs(self.cooldown.window_secs)
    }
}

/// Snapshot of a slot returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotStatus {
    pub slot: SlotId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<CircuitState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitId>,
    pub relays: Vec<RelayId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe: Option<ProbeResult>,
    pub rotations: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn default_hop_count() -> usize {
    DEFAULT_HOP_COUNT
}
fn default_rotation_secs() -> u64 {
    DEFAULT_ROTATION_SECS
}
fn default_cooldown_window() -> u64 {
    DEFAULT_COOLDOWN_WINDOW_SECS
}
fn default_cooldown_rotations() -> u32 {
    DEFAULT_COOLDOWN_ROTATIONS
}
fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relay_id_normalization() {
        assert_eq!(RelayId::new("$abcdef").as_str(), "ABCDEF");
        assert_eq!(RelayId::from(" 0a1B "), RelayId::new("0A1B"));
    }

    #[test]
    fn test_state_machine_transitions() {
        use CircuitState::*;
        assert!(Building.can_transition_to(Live));
        assert!(Building.can_transition_to(Failed));
        assert!(Live.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Tainted));
        assert!(Tainted.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        assert!(!Closed.can_transition_to(Live));
        assert!(!Failed.can_transition_to(Building));
        assert!(!Tainted.can_transition_to(Live));
        assert!(!Degraded.can_transition_to(Live));
        assert!(!Live.can_transition_to(Closed));
    }

    #[test]
    fn test_hop_roles() {
        assert_eq!(HopRole::for_position(0, 3), HopRole::Entry);
        assert_eq!(HopRole::for_position(1, 3), HopRole::Middle);
        assert_eq!(HopRole::for_position(2, 3), HopRole::Exit);
        assert_eq!(HopRole::for_position(1, 2), HopRole::Exit);
    }

    #[test]
    fn test_subnet_key() {
        let mut relay = RelayDescriptor {
            id: RelayId::new("AA"),
            nickname: "a".into(),
            address: "198.51.100.7:9001".into(),
            country: "US".into(),
            bandwidth: 1,
            family: None,
            flags: BTreeSet::new(),
        };
        assert_eq!(relay.subnet_key().as_deref(), Some("198.51"));

        relay.address = "[2001:db8::1]:443".into();
        assert_eq!(relay.subnet_key().as_deref(), Some("2001:db8"));

        relay.address = "not-an-ip".into();
        assert!(relay.subnet_key().is_none());
    }

    #[test]
    fn test_policy_validation() {
        assert!(Policy::default().validate().is_ok());

        let short = Policy {
            hop_count: 1,
            ..Default::default()
        };
        assert!(matches!(short.validate(), Err(CharonError::ConfigInvalid(_))));

        let bad_country = Policy {
            countries: Some(["USA".to_string()].into_iter().collect()),
            ..Default::default()
        };
        assert!(bad_country.validate().is_err());

        let us = Policy {
            countries: Some(["us".to_string()].into_iter().collect()),
            ..Default::default()
        };
        assert!(us.validate().is_ok());
        assert!(us.allows_country("US"));
        assert!(!us.allows_country("DE"));
    }

    #[test]
    fn test_policy_deserialize_defaults() {
        let policy: Policy = serde_json::from_str(r#"{"hop_count": 4}"#).unwrap();
        assert_eq!(policy.hop_count, 4);
        assert_eq!(policy.rotation_interval(), Some(Duration::from_secs(600)));
        assert!(policy.distinct_subnets);
        assert_eq!(policy.cooldown.rotations, 1);
    }
}
