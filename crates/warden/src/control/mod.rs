//! Control channel to the relay daemon.
//!
//! The daemon is reached through exactly one connection. [`ControlChannel`]
//! is the command contract, [`ControlLink`] serializes every command onto
//! that connection and publishes its health, and [`TorControlPort`] speaks
//! the Tor control protocol.

mod link;
mod tor;

pub use link::{ChannelHealth, ControlLink};
pub use tor::{TorAuth, TorControlPort};

use async_trait::async_trait;
use charon_common::{CircuitHandle, RelayId, RemoteCircuitState, Result};

/// Commands accepted by the relay daemon.
///
/// Implementations report transport failures as `CharonError::ChannelLost`
/// and command rejections as `CharonError::Control`.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Authenticate the current connection
    async fn authenticate(&self) -> Result<()>;

    /// Launch a circuit through `hops`, entry first
    async fn build(&self, hops: &[RelayId]) -> Result<CircuitHandle>;

    /// Append one hop to an existing circuit
    async fn extend(&self, circuit: &CircuitHandle, hop: &RelayId) -> Result<()>;

    /// Tear a circuit down
    async fn close(&self, circuit: &CircuitHandle) -> Result<()>;

    /// Ask the daemon to switch to clean circuits for new streams
    async fn signal_new_identity(&self) -> Result<()>;

    /// Current daemon-side state of a circuit
    async fn status(&self, circuit: &CircuitHandle) -> Result<RemoteCircuitState>;

    /// Cheap liveness check
    async fn heartbeat(&self) -> Result<()>;

    /// Drop and re-open the underlying connection (authentication included)
    async fn reconnect(&self) -> Result<()>;
}
