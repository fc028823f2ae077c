//! Serialized access to the single control connection.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use charon_common::{CharonError, CircuitHandle, RelayId, RemoteCircuitState, Result};
use serde::Serialize;
use tokio::sync::{Mutex, Notify, watch};

use super::ControlChannel;

/// Health of the control connection as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelHealth {
    /// Commands are accepted
    Up,
    /// Connection lost, recovery not started yet
    Down,
    /// Supervisor is reconnecting
    Reconnecting,
    /// Reconnect budget exhausted; nothing will be retried
    Unavailable,
}

impl ChannelHealth {
    pub fn is_up(self) -> bool {
        matches!(self, Self::Up)
    }
}

/// The one path to the relay daemon.
///
/// At most one command is in flight at a time; other callers queue on the
/// gate. Queued and in-flight commands are abandoned with `ChannelLost` as
/// soon as health leaves [`ChannelHealth::Up`].
pub struct ControlLink {
    channel: Arc<dyn ControlChannel>,
    /// Held for the duration of one command
    gate: Mutex<()>,
    command_timeout: Duration,
    health: watch::Sender<ChannelHealth>,
    /// Wakes the supervisor on transport failures
    failures: Notify,
}

impl ControlLink {
    pub fn new(channel: Arc<dyn ControlChannel>, command_timeout: Duration) -> Self {
        let (health, _) = watch::channel(ChannelHealth::Up);
        Self {
            channel,
            gate: Mutex::new(()),
            command_timeout,
            health,
            failures: Notify::new(),
        }
    }

    pub fn health(&self) -> ChannelHealth {
        *self.health.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelHealth> {
        self.health.subscribe()
    }

    pub fn set_health(&self, health: ChannelHealth) {
        let previous = self.health.send_replace(health);
        if previous != health {
            tracing::debug!(from = ?previous, to = ?health, "Control channel health changed");
        }
    }

    /// Resolves when a command reported a transport failure
    pub async fn failure_signal(&self) {
        self.failures.notified().await
    }

    pub async fn authenticate(&self) -> Result<()> {
        self.execute("authenticate", self.channel.authenticate()).await
    }

    pub async fn build(&self, hops: &[RelayId]) -> Result<CircuitHandle> {
        self.execute("build", self.channel.build(hops)).await
    }

    pub async fn extend(&self, circuit: &CircuitHandle, hop: &RelayId) -> Result<()> {
        self.execute("extend", self.channel.extend(circuit, hop)).await
    }

    pub async fn close(&self, circuit: &CircuitHandle) -> Result<()> {
        self.execute("close", self.channel.close(circuit)).await
    }

    pub async fn signal_new_identity(&self) -> Result<()> {
        self.execute("signal", self.channel.signal_new_identity()).await
    }

    pub async fn status(&self, circuit: &CircuitHandle) -> Result<RemoteCircuitState> {
        self.execute("status", self.channel.status(circuit)).await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.execute("heartbeat", self.channel.heartbeat()).await
    }

    /// Re-open the connection. Bypasses the health check but still holds the gate.
    pub async fn reconnect(&self) -> Result<()> {
        let _permit = self.gate.lock().await;
        match tokio::time::timeout(self.command_timeout, self.channel.reconnect()).await {
            Ok(result) => result,
            Err(_) => Err(CharonError::Timeout("control reconnect".to_string())),
        }
    }

    async fn execute<T, F>(&self, op: &'static str, command: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let mut health = self.health.subscribe();
        if !health.borrow_and_update().is_up() {
            return Err(CharonError::ChannelLost);
        }

        let _permit = tokio::select! {
            permit = self.gate.lock() => permit,
            _ = wait_until_down(&mut health) => return Err(CharonError::ChannelLost),
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.command_timeout, command) => result,
            _ = wait_until_down(&mut health) => {
                tracing::debug!(op, "Control command abandoned, channel went down");
                return Err(CharonError::ChannelLost);
            }
        };

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                if e.is_channel_failure() {
                    tracing::warn!(op, error = %e, "Control channel failure");
                    self.set_health(ChannelHealth::Down);
                    self.failures.notify_one();
                }
                Err(e)
            }
            Err(_) => {
                tracing::warn!(op, timeout = ?self.command_timeout, "Control command timed out");
                self.failures.notify_one();
                Err(CharonError::Timeout(format!("control command '{op}'")))
            }
        }
    }
}

async fn wait_until_down(health: &mut watch::Receiver<ChannelHealth>) {
    loop {
        if !health.borrow_and_update().is_up() {
            return;
        }
        if health.changed().await.is_err() {
            // Sender gone: the link is being dropped, nothing will change again
            std::future::pending::<()>().await;
        }
    }
}
