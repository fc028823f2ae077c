//! # Warden - Charon circuit orchestration and health engine
//!
//! Keeps a set of anonymity circuits ("slots") healthy on behalf of callers:
//! picks relays, builds and tears down circuits through the relay daemon's
//! control port, probes every live circuit, blacklists relays that tamper
//! with traffic, rotates identities and recovers from control channel loss.
//!
//! ## Architecture
//! ```text
//! caller → Engine ─┬─ NodeSelector ← TrustTable ← MaliciousNodeDetector
//!                  ├─ CircuitBuilder → ControlLink → relay daemon
//!                  ├─ probe tasks → HealthMonitor
//!                  ├─ rotation scheduler
//!                  └─ supervisor (heartbeat, reconnect, restart)
//! ```

pub mod backoff;
pub mod builder;
pub mod circuit;
pub mod config;
pub mod control;
pub mod cooldown;
pub mod detector;
pub mod engine;
pub mod events;
pub mod health;
pub mod persist;
pub mod pool;
pub mod probe;
pub mod rotation;
pub mod routes;
pub mod selector;
pub mod state;
pub mod supervisor;
pub mod trust;

#[cfg(test)]
mod testing;

pub use engine::{Command, CommandReply, Engine, EngineParts, RotationOutcome};
pub use events::EngineEvent;
