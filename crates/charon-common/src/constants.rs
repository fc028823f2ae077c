//! Shared constants for Charon components.

/// Default Tor control port address
pub const DEFAULT_CONTROL_ADDR: &str = "127.0.0.1:9051";

/// Default Tor SOCKS port address
pub const DEFAULT_SOCKS_ADDR: &str = "127.0.0.1:9050";

/// Default admin API listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8899";

/// Default number of hops in a circuit
pub const DEFAULT_HOP_COUNT: usize = 3;

/// Minimum hops a policy may request
pub const MIN_HOP_COUNT: usize = 2;

/// Maximum hops a policy may request (Tor refuses longer EXTENDCIRCUIT paths)
pub const MAX_HOP_COUNT: usize = 8;

/// Default identity rotation interval (10 minutes)
pub const DEFAULT_ROTATION_SECS: u64 = 600;

/// Default cool-down: relays of the previous circuit are avoided for one rotation
pub const DEFAULT_COOLDOWN_ROTATIONS: u32 = 1;

/// Default cool-down window in seconds (30 minutes)
pub const DEFAULT_COOLDOWN_WINDOW_SECS: u64 = 1800;

/// Timeout for a single control command
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 10;

/// Timeout for a circuit build to be acknowledged
pub const DEFAULT_BUILD_TIMEOUT_SECS: u64 = 60;

/// Build attempts before `CircuitBuildExhausted`
pub const DEFAULT_BUILD_ATTEMPTS: u32 = 4;

/// Initial backoff between build attempts (milliseconds)
pub const DEFAULT_BUILD_BACKOFF_MS: u64 = 500;

/// Interval between health probes on a live circuit
pub const DEFAULT_PROBE_INTERVAL_SECS: u64 = 30;

/// Timeout for a single health probe
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 20;

/// Consecutive low-throughput readings before a circuit is degraded
pub const DEGRADED_AFTER_LOW_READINGS: u32 = 3;

/// Per-relay sliding window of probes considered by the detector
pub const DETECTOR_WINDOW: usize = 10;

/// Mismatches within the window that blacklist a non-exit relay
pub const MISMATCH_THRESHOLD: u32 = 2;

/// Mismatches within the window that blacklist a relay seen as exit
pub const EXIT_MISMATCH_THRESHOLD: u32 = 1;

/// Neutral trust score
pub const TRUST_NEUTRAL: f64 = 0.5;

/// Lowest trust score (blacklisted relays sit here)
pub const TRUST_FLOOR: f64 = 0.0;

/// Highest trust score
pub const TRUST_CEILING: f64 = 1.0;

/// Half-life of trust decay toward neutral (6 hours)
pub const TRUST_HALF_LIFE_SECS: u64 = 21_600;

/// Supervisor heartbeat interval
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// Reconnect attempts before `ControlChannelUnavailable`
pub const RECONNECT_ATTEMPTS: u32 = 5;

/// Relay pool refresh cadence (1 hour, roughly the consensus interval)
pub const POOL_REFRESH_SECS: u64 = 3600;

/// Redis key prefixes
pub mod redis_keys {
    /// Persisted trust table snapshot
    pub const TRUST_SNAPSHOT: &str = "charon:trust:snapshot";

    /// Persisted blacklist set (fingerprints)
    pub const BLACKLIST: &str = "charon:trust:blacklist";
}
