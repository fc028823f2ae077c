//! Auto-restart supervisor for the control channel.
//!
//! Heartbeats the daemon on a fixed cadence (and immediately whenever a
//! command reports a transport failure). On loss every circuit is written
//! off, the channel is re-opened under a bounded backoff, and each active
//! slot is rebuilt. An exhausted budget halts the engine with a single
//! `ControlChannelUnavailable` until someone calls restart.

use charon_common::{CharonError, RemoteCircuitState};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::backoff::Backoff;
use crate::config::SupervisorConfig;
use crate::control::ChannelHealth;
use crate::engine::Engine;
use crate::events::EngineEvent;
use crate::rotation::RebuildReason;

pub async fn run_supervisor(engine: Engine, mut shutdown: broadcast::Receiver<()>) {
    let config = engine.config().supervisor.clone();
    let link = engine.link();
    tracing::info!(heartbeat = ?config.heartbeat(), "Supervisor started");

    let mut ticker = tokio::time::interval(config.heartbeat());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = link.failure_signal() => {
                tracing::debug!("Supervisor woken by control failure");
            }
            _ = engine.restart_requested() => {
                tracing::info!("Supervisor restart requested");
            }
            _ = shutdown.recv() => {
                tracing::info!("Supervisor shutting down...");
                break;
            }
        }

        if engine.is_halted() {
            continue;
        }

        let healthy = link.health().is_up() && link.heartbeat().await.is_ok();
        if healthy {
            if config.status_sweep {
                sweep(&engine).await;
            }
            continue;
        }

        recover(&engine, &config).await;
    }
}

/// Catch circuits the daemon closed behind our back
async fn sweep(engine: &Engine) {
    let link = engine.link();
    for (slot, circuit, handle) in engine.sweep_targets() {
        match link.status(&handle).await {
            Ok(RemoteCircuitState::Closed | RemoteCircuitState::Failed) => {
                tracing::warn!(slot = %slot, circuit = %circuit, handle = %handle, "Circuit closed by daemon");
                if engine.mark_remote_closed(slot, circuit) {
                    engine.spawn_drive(slot, RebuildReason::Recovery);
                }
            }
            Ok(_) => {}
            Err(e) if e.is_channel_failure() => return,
            Err(e) => tracing::debug!(slot = %slot, error = %e, "Status sweep query failed"),
        }
    }
}

/// Reconnect under a bounded budget, then rebuild every active slot
async fn recover(engine: &Engine, config: &SupervisorConfig) {
    let link = engine.link();
    link.set_health(ChannelHealth::Down);

    let affected = engine.abandon_circuits();
    tracing::warn!(slots = affected.len(), "Control channel lost, circuits abandoned");
    engine.emit(EngineEvent::ChannelLost);

    let mut backoff = Backoff::new(
        config.reconnect_attempts,
        config.reconnect_backoff(),
        config.reconnect_backoff_max(),
    );

    while backoff.begin() {
        link.set_health(ChannelHealth::Reconnecting);
        match link.reconnect().await {
            Ok(()) => {
                link.set_health(ChannelHealth::Up);
                tracing::info!(attempt = backoff.attempt(), "✅ Control channel restored");
                engine.emit(EngineEvent::ChannelRestored);
                for slot in engine.active_slots() {
                    engine.spawn_drive(slot, RebuildReason::Recovery);
                }
                return;
            }
            Err(e) => {
                tracing::warn!(attempt = backoff.attempt(), error = %e, "Reconnect failed");
                match backoff.next_delay() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => break,
                }
            }
        }
    }

    link.set_health(ChannelHealth::Unavailable);
    engine.halt(CharonError::ControlChannelUnavailable(format!(
        "reconnect failed after {} attempts",
        backoff.attempt()
    )));
}
