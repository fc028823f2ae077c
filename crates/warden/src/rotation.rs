//! Identity rotation: when a slot's circuit is replaced, and how concurrent
//! replacement requests for one slot are folded into a single operation.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use charon_common::{CircuitState, Policy, SlotId};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::circuit::Circuit;
use crate::config::SchedulerConfig;
use crate::engine::Engine;

/// Why a slot's circuit is being replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildReason {
    /// First circuit of a new slot
    Initial,
    /// A previous build failed and the slot has no circuit
    Retry,
    /// Rotation interval elapsed
    Interval,
    /// Circuit stayed degraded too long
    Degraded,
    /// Rotation before a logical request
    PerRequest,
    /// Caller asked for a rotation
    Manual,
    /// Caller asked for a fresh identity
    NewIdentity,
    /// Control channel came back; old circuits are gone
    Recovery,
    /// Circuit contains a blacklisted relay
    Tainted,
}

impl RebuildReason {
    /// Re-checked right before the old circuit is torn down, since another
    /// rotation may have already dealt with the cause
    pub fn still_applies(
        self,
        circuit: Option<&Circuit>,
        policy: &Policy,
        config: &SchedulerConfig,
        now: Instant,
    ) -> bool {
        match self {
            Self::Initial | Self::Retry => circuit.is_none(),
            Self::Manual | Self::NewIdentity | Self::PerRequest => true,
            Self::Tainted => circuit.is_none_or(|c| c.state() == CircuitState::Tainted),
            Self::Recovery => circuit.is_none_or(|c| !c.state().is_usable()),
            Self::Degraded | Self::Interval => {
                circuit.is_some_and(|c| due_rotation(c, policy, config, now) == Some(self))
            }
        }
    }
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::Retry => "retry",
            Self::Interval => "interval",
            Self::Degraded => "degraded",
            Self::PerRequest => "per_request",
            Self::Manual => "manual",
            Self::NewIdentity => "new_identity",
            Self::Recovery => "recovery",
            Self::Tainted => "tainted",
        };
        f.write_str(s)
    }
}

/// Planned rotation due for a circuit, if any
pub fn due_rotation(
    circuit: &Circuit,
    policy: &Policy,
    config: &SchedulerConfig,
    now: Instant,
) -> Option<RebuildReason> {
    match circuit.state() {
        CircuitState::Degraded => {
            let since = circuit.degraded_since?;
            if now.saturating_duration_since(since) >= config.degraded_rotate_after() {
                return Some(RebuildReason::Degraded);
            }
        }
        CircuitState::Live => {}
        _ => return None,
    }

    let interval = policy.rotation_interval()?;
    let live_since = circuit.live_since?;
    (now.saturating_duration_since(live_since) >= interval).then_some(RebuildReason::Interval)
}

/// What the caller of [`SlotOps::begin`] should do
pub enum Begin {
    /// Caller owns the slot and must run the rotation, then call `finish`
    Drive,
    /// Another rotation is running; it will also serve this request
    Coalesced(watch::Receiver<u64>),
}

struct OpState {
    driving: bool,
    pending: Option<RebuildReason>,
    /// Bumped whenever the slot goes idle
    done: watch::Sender<u64>,
}

/// At most one rotation per slot at a time.
///
/// A request arriving while one runs is folded into a single pending
/// follow-up (highest-priority reason wins) and its caller waits for the
/// slot to go idle.
#[derive(Default)]
pub struct SlotOps {
    ops: Mutex<HashMap<SlotId, OpState>>,
}

impl SlotOps {
    pub fn begin(&self, slot: SlotId, reason: RebuildReason) -> Begin {
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        let op = ops.entry(slot).or_insert_with(|| OpState {
            driving: false,
            pending: None,
            done: watch::channel(0).0,
        });

        if !op.driving {
            op.driving = true;
            return Begin::Drive;
        }

        op.pending = Some(op.pending.map_or(reason, |p| p.max(reason)));
        Begin::Coalesced(op.done.subscribe())
    }

    /// Hand back the next coalesced reason, or mark the slot idle
    pub fn finish(&self, slot: SlotId) -> Option<RebuildReason> {
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        let op = ops.get_mut(&slot)?;

        if let Some(next) = op.pending.take() {
            return Some(next);
        }
        op.driving = false;
        op.done.send_modify(|generation| *generation += 1);
        None
    }

    pub fn is_busy(&self, slot: SlotId) -> bool {
        let ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        ops.get(&slot).is_some_and(|op| op.driving)
    }

    /// Drop bookkeeping for a removed slot once it is idle
    pub fn forget(&self, slot: SlotId) {
        let mut ops = self.ops.lock().unwrap_or_else(PoisonError::into_inner);
        if ops.get(&slot).is_some_and(|op| !op.driving) {
            ops.remove(&slot);
        }
    }
}

/// Rotation scheduler loop: checks every slot each tick
pub async fn run_scheduler(engine: Engine, mut shutdown: broadcast::Receiver<()>) {
    let config = engine.config().scheduler.clone();
    tracing::info!(tick = ?config.tick(), "Rotation scheduler started");

    let mut ticker = tokio::time::interval(config.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.recv() => {
                tracing::info!("Rotation scheduler shutting down...");
                break;
            }
        }

        if engine.is_halted() || !engine.link().health().is_up() {
            continue;
        }

        for (slot, reason) in engine.due_slots(Instant::now()) {
            let engine = engine.clone();
            tokio::spawn(async move {
                if let Err(e) = engine.drive(slot, reason).await {
                    tracing::warn!(slot = %slot, %reason, error = %e, "Scheduled rotation failed");
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::relay;
    use charon_common::CircuitId;
    use std::time::Duration;

    fn live_circuit() -> Circuit {
        let mut c = Circuit::new(
            CircuitId(1),
            SlotId(1),
            vec![relay("A", "US", 1), relay("B", "US", 1), relay("C", "US", 1)],
        );
        c.advance(CircuitState::Live).unwrap();
        c
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_rotation_due() {
        let policy = Policy {
            rotation_interval_secs: 60,
            ..Default::default()
        };
        let config = SchedulerConfig::default();
        let circuit = live_circuit();

        assert_eq!(due_rotation(&circuit, &policy, &config, Instant::now()), None);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(
            due_rotation(&circuit, &policy, &config, Instant::now()),
            Some(RebuildReason::Interval)
        );

        let never = Policy {
            rotation_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(due_rotation(&circuit, &never, &config, Instant::now()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_rotates_early() {
        let policy = Policy {
            rotation_interval_secs: 3600,
            ..Default::default()
        };
        let config = SchedulerConfig {
            degraded_rotate_after_secs: 30,
            ..Default::default()
        };
        let mut circuit = live_circuit();
        circuit.advance(CircuitState::Degraded).unwrap();

        assert_eq!(due_rotation(&circuit, &policy, &config, Instant::now()), None);
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(
            due_rotation(&circuit, &policy, &config, Instant::now()),
            Some(RebuildReason::Degraded)
        );
    }

    #[test]
    fn test_still_applies() {
        let policy = Policy::default();
        let config = SchedulerConfig::default();
        let now = Instant::now();
        let live = live_circuit();

        assert!(RebuildReason::Initial.still_applies(None, &policy, &config, now));
        assert!(!RebuildReason::Initial.still_applies(Some(&live), &policy, &config, now));
        assert!(!RebuildReason::Tainted.still_applies(Some(&live), &policy, &config, now));
        assert!(!RebuildReason::Recovery.still_applies(Some(&live), &policy, &config, now));
        assert!(RebuildReason::Manual.still_applies(Some(&live), &policy, &config, now));
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce() {
        let ops = SlotOps::default();
        let slot = SlotId(3);

        assert!(matches!(ops.begin(slot, RebuildReason::Interval), Begin::Drive));
        let Begin::Coalesced(mut waiter) = ops.begin(slot, RebuildReason::Manual) else {
            panic!("second request should coalesce");
        };
        let Begin::Coalesced(_) = ops.begin(slot, RebuildReason::Degraded) else {
            panic!("third request should coalesce");
        };
        assert!(ops.is_busy(slot));

        // Both queued requests fold into one follow-up with the stronger reason
        assert_eq!(ops.finish(slot), Some(RebuildReason::Manual));
        assert_eq!(ops.finish(slot), None);
        assert!(!ops.is_busy(slot));

        waiter.changed().await.unwrap();
        assert_eq!(*waiter.borrow(), 1);

        ops.forget(slot);
        assert!(matches!(ops.begin(slot, RebuildReason::Initial), Begin::Drive));
    }
}
