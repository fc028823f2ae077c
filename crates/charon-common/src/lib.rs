//! # Charon Common
//!
//! Shared types, errors, and defaults used across Charon components.
//!
//! ## Modules
//! - `types` - Core data structures (Relay, CircuitState, Policy, etc.)
//! - `error` - Engine error taxonomy
//! - `constants` - Shared configuration defaults

pub mod constants;
pub mod error;
pub mod types;

pub use error::{CharonError, Result};
pub use types::*;
