//! Configuration management for Warden.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use charon_common::constants::{
    DEFAULT_BUILD_ATTEMPTS, DEFAULT_BUILD_BACKOFF_MS, DEFAULT_BUILD_TIMEOUT_SECS,
    DEFAULT_COMMAND_TIMEOUT_SECS, DEFAULT_CONTROL_ADDR, DEFAULT_LISTEN_ADDR,
    DEFAULT_PROBE_INTERVAL_SECS, DEFAULT_PROBE_TIMEOUT_SECS, DEFAULT_SOCKS_ADDR,
    DEGRADED_AFTER_LOW_READINGS, DETECTOR_WINDOW, EXIT_MISMATCH_THRESHOLD,
    HEARTBEAT_INTERVAL_SECS, MISMATCH_THRESHOLD, POOL_REFRESH_SECS, RECONNECT_ATTEMPTS,
    TRUST_HALF_LIFE_SECS,
};
use charon_common::{CharonError, Policy};

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Tor control port address
    #[serde(default = "default_control_addr")]
    pub control_addr: String,

    /// Control port password (HashedControlPassword)
    #[serde(default)]
    pub control_password: Option<String>,

    /// Control auth cookie file (CookieAuthentication)
    #[serde(default)]
    pub control_cookie_path: Option<String>,

    /// Tor SOCKS port used by the prober
    #[serde(default = "default_socks_addr")]
    pub socks_addr: String,

    /// Admin API listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// JSON relay pool file
    #[serde(default = "default_relay_pool_path")]
    pub relay_pool_path: String,

    /// Slots started with the default policy at boot
    #[serde(default = "default_initial_slots")]
    pub initial_slots: usize,

    /// Optional Redis URL for trust table persistence
    #[serde(default)]
    pub redis_url: Option<String>,

    /// How often the trust table is written to Redis
    #[serde(default = "default_trust_persist")]
    pub trust_persist_secs: u64,

    /// Default policy for new slots
    #[serde(default)]
    pub policy: Policy,

    #[serde(default)]
    pub builder: BuilderConfig,

    #[serde(default)]
    pub health: HealthConfig,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub selector: SelectorConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub supervisor: SupervisorConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub probe: ProbeConfig,
}

/// Circuit build configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BuilderConfig {
    /// Bounded wait for a build acknowledgment
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Timeout of a single control command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// Attempts before `CircuitBuildExhausted`
    #[serde(default = "default_build_attempts")]
    pub max_attempts: u32,

    /// First retry delay
    #[serde(default = "default_build_backoff")]
    pub backoff_initial_ms: u64,

    /// Retry delay cap
    #[serde(default = "default_build_backoff_max")]
    pub backoff_max_ms: u64,

    /// Interval between status polls while awaiting the acknowledgment
    #[serde(default = "default_ack_poll")]
    pub ack_poll_ms: u64,

    /// Build the entry hop first and extend hop by hop
    #[serde(default)]
    pub incremental_extend: bool,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            build_timeout_secs: default_build_timeout(),
            command_timeout_secs: default_command_timeout(),
            max_attempts: default_build_attempts(),
            backoff_initial_ms: default_build_backoff(),
            backoff_max_ms: default_build_backoff_max(),
            ack_poll_ms: default_ack_poll(),
            incremental_extend: false,
        }
    }
}

impl BuilderConfig {
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn ack_poll(&self) -> Duration {
        Duration::from_millis(self.ack_poll_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }
}

/// Health probing configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Consecutive low readings before Degraded
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_secs: default_probe_interval(),
            probe_timeout_secs: default_probe_timeout(),
            degraded_after: default_degraded_after(),
        }
    }
}

impl HealthConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

/// Malicious relay detection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Probes remembered per relay
    #[serde(default = "default_window")]
    pub window: usize,

    /// Mismatches in the window that blacklist a relay
    #[serde(default = "default_mismatch_threshold")]
    pub mismatch_threshold: u32,

    /// Mismatches as exit hop in the window that blacklist a relay
    #[serde(default = "default_exit_threshold")]
    pub exit_mismatch_threshold: u32,

    /// Trust decrement per attributed mismatch
    #[serde(default = "default_mismatch_penalty")]
    pub mismatch_penalty: f64,

    /// Half-life of trust decay toward neutral
    #[serde(default = "default_half_life")]
    pub trust_half_life_secs: u64,
}

impl DetectorConfig {
    pub fn trust_half_life(&self) -> Duration {
        Duration::from_secs(self.trust_half_life_secs)
    }
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            mismatch_threshold: default_mismatch_threshold(),
            exit_mismatch_threshold: default_exit_threshold(),
            mismatch_penalty: default_mismatch_penalty(),
            trust_half_life_secs: default_half_life(),
        }
    }
}

/// Relay scoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SelectorConfig {
    /// Weight of the exit latency contributor (0 disables it)
    #[serde(default)]
    pub exit_latency_weight: f64,

    /// Latency at or above which an exit earns no bonus
    #[serde(default = "default_latency_ceiling")]
    pub latency_ceiling_ms: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            exit_latency_weight: 0.0,
            latency_ceiling_ms: default_latency_ceiling(),
        }
    }
}

/// Identity rotation scheduler configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// How often rotation deadlines are checked
    #[serde(default = "default_scheduler_tick")]
    pub tick_secs: u64,

    /// Degraded circuits are rotated after this long, even before the interval
    #[serde(default = "default_degraded_rotate")]
    pub degraded_rotate_after_secs: u64,

    /// Slots left without a circuit by a failed build are retried after this long
    #[serde(default = "default_retry_failed")]
    pub retry_failed_after_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_scheduler_tick(),
            degraded_rotate_after_secs: default_degraded_rotate(),
            retry_failed_after_secs: default_retry_failed(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn degraded_rotate_after(&self) -> Duration {
        Duration::from_secs(self.degraded_rotate_after_secs)
    }

    pub fn retry_failed_after(&self) -> Duration {
        Duration::from_secs(self.retry_failed_after_secs)
    }
}

/// Auto-restart supervisor configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,

    #[serde(default = "default_reconnect_backoff_max")]
    pub reconnect_backoff_max_ms: u64,

    /// Query circuit status on each heartbeat to catch remote closures
    #[serde(default = "default_true")]
    pub status_sweep: bool,
}

impl SupervisorConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn reconnect_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_max_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            reconnect_backoff_max_ms: default_reconnect_backoff_max(),
            status_sweep: true,
        }
    }
}

/// Relay pool feed configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_refresh")]
    pub refresh_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_pool_refresh(),
        }
    }
}

impl PoolConfig {
    pub fn refresh(&self) -> Duration {
        Duration::from_secs(self.refresh_secs)
    }
}

/// Reference payload fetched by the SOCKS prober
#[derive(Debug, Clone, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_host")]
    pub reference_host: String,

    #[serde(default = "default_probe_port")]
    pub reference_port: u16,

    #[serde(default = "default_probe_path")]
    pub reference_path: String,

    /// Hex SHA-256 of the expected response body
    #[serde(default)]
    pub reference_sha256: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            reference_host: default_probe_host(),
            reference_port: default_probe_port(),
            reference_path: default_probe_path(),
            reference_sha256: String::new(),
        }
    }
}

// Default value functions
fn default_control_addr() -> String { DEFAULT_CONTROL_ADDR.to_string() }
fn default_socks_addr() -> String { DEFAULT_SOCKS_ADDR.to_string() }
fn default_listen_addr() -> String { DEFAULT_LISTEN_ADDR.to_string() }
fn default_relay_pool_path() -> String { "config/relays.json".to_string() }
fn default_initial_slots() -> usize { 1 }
fn default_build_timeout() -> u64 { DEFAULT_BUILD_TIMEOUT_SECS }
fn default_command_timeout() -> u64 { DEFAULT_COMMAND_TIMEOUT_SECS }
fn default_build_attempts() -> u32 { DEFAULT_BUILD_ATTEMPTS }
fn default_build_backoff() -> u64 { DEFAULT_BUILD_BACKOFF_MS }
fn default_build_backoff_max() -> u64 { 10_000 }
fn default_ack_poll() -> u64 { 250 }
fn default_probe_interval() -> u64 { DEFAULT_PROBE_INTERVAL_SECS }
fn default_probe_timeout() -> u64 { DEFAULT_PROBE_TIMEOUT_SECS }
fn default_degraded_after() -> u32 { DEGRADED_AFTER_LOW_READINGS }
fn default_window() -> usize { DETECTOR_WINDOW }
fn default_mismatch_threshold() -> u32 { MISMATCH_THRESHOLD }
fn default_exit_threshold() -> u32 { EXIT_MISMATCH_THRESHOLD }
fn default_mismatch_penalty() -> f64 { 0.2 }
fn default_half_life() -> u64 { TRUST_HALF_LIFE_SECS }
fn default_latency_ceiling() -> u64 { 2_000 }
fn default_scheduler_tick() -> u64 { 5 }
fn default_degraded_rotate() -> u64 { 60 }
fn default_retry_failed() -> u64 { 30 }
fn default_heartbeat() -> u64 { HEARTBEAT_INTERVAL_SECS }
fn default_reconnect_attempts() -> u32 { RECONNECT_ATTEMPTS }
fn default_reconnect_backoff() -> u64 { 1_000 }
fn default_reconnect_backoff_max() -> u64 { 30_000 }
fn default_pool_refresh() -> u64 { POOL_REFRESH_SECS }
fn default_probe_host() -> String { "check.torproject.org".to_string() }
fn default_probe_port() -> u16 { 80 }
fn default_probe_path() -> String { "/".to_string() }
fn default_trust_persist() -> u64 { 60 }
fn default_true() -> bool { true }

/// Values supplied on the command line that win over the file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub control_addr: Option<String>,
    pub listen_addr: Option<String>,
    pub relay_pool_path: Option<String>,
}

impl AppConfig {
    /// Load configuration from file and `WARDEN__*` environment, with CLI overrides
    pub fn load(config_path: &str, overrides: &ConfigOverrides) -> Result<Self> {
        let mut builder = config::Config::builder();
        if Path::new(config_path).exists() {
            builder = builder.add_source(config::File::with_name(config_path));
        } else {
            tracing::warn!(path = %config_path, "Config file not found, using defaults");
        }

        let settings = builder
            .add_source(config::Environment::with_prefix("WARDEN").separator("__"))
            .build()
            .context("Failed to load config")?;

        let mut config: AppConfig = settings
            .try_deserialize()
            .context("Failed to parse config")?;

        // Apply CLI overrides
        if let Some(ref addr) = overrides.control_addr {
            config.control_addr = addr.clone();
        }
        if let Some(ref listen) = overrides.listen_addr {
            config.listen_addr = listen.clone();
        }
        if let Some(ref path) = overrides.relay_pool_path {
            config.relay_pool_path = path.clone();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject the whole configuration if any part is unusable
    pub fn validate(&self) -> charon_common::Result<()> {
        self.policy.validate()?;

        let invalid = |msg: &str| Err(CharonError::ConfigInvalid(msg.to_string()));

        if self.builder.max_attempts == 0 {
            return invalid("builder.max_attempts must be at least 1");
        }
        if self.builder.build_timeout_secs == 0 || self.builder.command_timeout_secs == 0 {
            return invalid("builder timeouts must be non-zero");
        }
        if self.health.probe_interval_secs == 0 || self.health.probe_timeout_secs == 0 {
            return invalid("health probe interval and timeout must be non-zero");
        }
        if self.health.degraded_after == 0 {
            return invalid("health.degraded_after must be at least 1");
        }
        if self.detector.window == 0
            || self.detector.mismatch_threshold == 0
            || self.detector.exit_mismatch_threshold == 0
        {
            return invalid("detector window and thresholds must be at least 1");
        }
        if self.detector.mismatch_threshold as usize > self.detector.window {
            return invalid("detector.mismatch_threshold cannot exceed detector.window");
        }
        if !(0.0..=1.0).contains(&self.detector.mismatch_penalty) {
            return invalid("detector.mismatch_penalty must be within [0, 1]");
        }
        if self.selector.exit_latency_weight < 0.0 {
            return invalid("selector.exit_latency_weight must not be negative");
        }
        if self.supervisor.reconnect_attempts == 0 || self.supervisor.heartbeat_secs == 0 {
            return invalid("supervisor heartbeat and reconnect attempts must be non-zero");
        }
        if self.scheduler.tick_secs == 0 || self.pool.refresh_secs == 0 || self.trust_persist_secs == 0 {
            return invalid("scheduler tick, pool refresh and trust persistence intervals must be non-zero");
        }
        if !self.probe.reference_sha256.is_empty()
            && !matches!(hex::decode(&self.probe.reference_sha256), Ok(d) if d.len() == 32)
        {
            return invalid("probe.reference_sha256 must be 64 hex characters");
        }

        Ok(())
    }
}

impl AppConfig {
    pub fn trust_persist(&self) -> Duration {
        Duration::from_secs(self.trust_persist_secs)
    }
}

/// The parts of the configuration the engine itself consumes
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub builder: BuilderConfig,
    pub health: HealthConfig,
    pub detector: DetectorConfig,
    pub selector: SelectorConfig,
    pub scheduler: SchedulerConfig,
    pub supervisor: SupervisorConfig,
    pub pool: PoolConfig,
}

impl AppConfig {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            builder: self.builder.clone(),
            health: self.health.clone(),
            detector: self.detector.clone(),
            selector: self.selector.clone(),
            scheduler: self.scheduler.clone(),
            supervisor: self.supervisor.clone(),
            pool: self.pool.clone(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            control_addr: default_control_addr(),
            control_password: None,
            control_cookie_path: None,
            socks_addr: default_socks_addr(),
            listen_addr: default_listen_addr(),
            relay_pool_path: default_relay_pool_path(),
            initial_slots: default_initial_slots(),
            redis_url: None,
            trust_persist_secs: default_trust_persist(),
            policy: Policy::default(),
            builder: BuilderConfig::default(),
            health: HealthConfig::default(),
            detector: DetectorConfig::default(),
            selector: SelectorConfig::default(),
            scheduler: SchedulerConfig::default(),
            supervisor: SupervisorConfig::default(),
            pool: PoolConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_validate() {
        assert_ok!(AppConfig::default().validate());
    }

    #[test]
    fn test_rejects_bad_detector() {
        let mut config = AppConfig::default();
        config.detector.mismatch_threshold = 20;
        assert!(matches!(config.validate(), Err(CharonError::ConfigInvalid(_))));
    }

    #[test]
    fn test_rejects_bad_digest() {
        let mut config = AppConfig::default();
        config.probe.reference_sha256 = "abc".to_string();
        assert_err!(config.validate());

        config.probe.reference_sha256 = "ab".repeat(32);
        assert_ok!(config.validate());
    }

    #[test]
    fn test_missing_file_uses_defaults_and_overrides() {
        let overrides = ConfigOverrides {
            control_addr: Some("127.0.0.1:19051".to_string()),
            ..Default::default()
        };
        let config = AppConfig::load("does/not/exist.toml", &overrides).unwrap();
        assert_eq!(config.control_addr, "127.0.0.1:19051");
        assert_eq!(config.policy.hop_count, 3);
    }
}
