//! Common error types for Charon components.

use std::time::Duration;

use thiserror::Error;

use crate::types::{CircuitState, RelayId, SlotId};

/// Result alias used across the engine
pub type Result<T> = std::result::Result<T, CharonError>;

/// Errors surfaced by the circuit engine
#[derive(Debug, Clone, Error)]
pub enum CharonError {
    /// Policy cannot be satisfied by the current relay pool
    #[error("Selection exhausted: need {needed} relays, {eligible} eligible")]
    SelectionExhausted { needed: usize, eligible: usize },

    /// A build was not acknowledged in time (retried internally)
    #[error("Circuit build timed out after {0:?}")]
    CircuitBuildTimeout(Duration),

    /// The build retry budget ran out
    #[error("Circuit build exhausted after {attempts} attempts: {last_error}")]
    CircuitBuildExhausted { attempts: u32, last_error: String },

    /// A probe observed tampered traffic through this relay
    #[error("Integrity violation attributed to relay {0}")]
    IntegrityViolation(RelayId),

    /// A relay was blacklisted
    #[error("Relay blacklisted: {0}")]
    RelayBlacklisted(RelayId),

    /// The control channel could not be recovered
    #[error("Control channel unavailable: {0}")]
    ControlChannelUnavailable(String),

    /// Configuration or policy rejected at load time
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The relay daemon rejected a command
    #[error("Control command failed: {0}")]
    Control(String),

    /// The control connection dropped while a command was pending
    #[error("Control channel lost")]
    ChannelLost,

    /// Illegal circuit state transition
    #[error("Invalid circuit transition {from} -> {to}")]
    InvalidTransition { from: CircuitState, to: CircuitState },

    /// No such identity slot
    #[error("Unknown slot: {0}")]
    UnknownSlot(SlotId),

    /// The slot was stopped while an operation was running
    #[error("Slot stopped: {0}")]
    SlotStopped(SlotId),

    /// The slot has no usable circuit right now
    #[error("No usable circuit for {0}")]
    NoCircuit(SlotId),

    /// Relay pool feed failure
    #[error("Relay pool error: {0}")]
    Pool(String),

    /// Generic timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl CharonError {
    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> u16 {
        match self {
            Self::SelectionExhausted { .. } => 409,
            Self::CircuitBuildTimeout(_) => 504,
            Self::CircuitBuildExhausted { .. } => 502,
            Self::IntegrityViolation(_) => 500,
            Self::RelayBlacklisted(_) => 409,
            Self::ControlChannelUnavailable(_) => 503,
            Self::ConfigInvalid(_) => 400,
            Self::Control(_) => 502,
            Self::ChannelLost => 503,
            Self::InvalidTransition { .. } => 409,
            Self::UnknownSlot(_) => 404,
            Self::SlotStopped(_) => 410,
            Self::NoCircuit(_) => 503,
            Self::Pool(_) => 503,
            Self::Timeout(_) => 504,
        }
    }

    /// Returns true if this error is transient and bounded retry makes sense
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CircuitBuildTimeout(_) | Self::Control(_) | Self::Timeout(_)
        )
    }

    /// Returns true if the error means the control connection itself is gone
    pub fn is_channel_failure(&self) -> bool {
        matches!(self, Self::ChannelLost | Self::ControlChannelUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(CharonError::CircuitBuildTimeout(Duration::from_secs(1)).is_retryable());
        assert!(CharonError::Control("552 No such router".into()).is_retryable());
        assert!(!CharonError::SelectionExhausted { needed: 3, eligible: 2 }.is_retryable());
        assert!(!CharonError::ChannelLost.is_retryable());
        assert!(CharonError::ChannelLost.is_channel_failure());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(CharonError::UnknownSlot(SlotId(7)).status_code(), 404);
        assert_eq!(
            CharonError::ControlChannelUnavailable("gone".into()).status_code(),
            503
        );
        assert_eq!(CharonError::ConfigInvalid("hops".into()).status_code(), 400);
    }
}
