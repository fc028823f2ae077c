//! Circuit construction, acknowledgment and teardown.
//!
//! A build is a selection followed by a bounded wait for the daemon to
//! report the circuit as built. Failed attempts are retried with backoff,
//! each retry excluding the chain that just failed. A lost control channel
//! aborts the build immediately; recovery belongs to the supervisor.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use charon_common::{
    CharonError, CircuitHandle, CircuitId, CircuitState, Policy, RemoteCircuitState, Result,
    SlotId,
};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::circuit::Circuit;
use crate::config::BuilderConfig;
use crate::control::ControlLink;
use crate::cooldown::CooldownTracker;
use crate::events::EngineEvent;
use crate::pool::PoolCache;
use crate::selector::{NodeSelector, SelectionRequest};

pub struct CircuitBuilder {
    link: Arc<ControlLink>,
    selector: Arc<NodeSelector>,
    pool: Arc<PoolCache>,
    config: BuilderConfig,
    next_id: AtomicU64,
    events: broadcast::Sender<EngineEvent>,
}

impl CircuitBuilder {
    pub fn new(
        link: Arc<ControlLink>,
        selector: Arc<NodeSelector>,
        pool: Arc<PoolCache>,
        config: BuilderConfig,
        events: broadcast::Sender<EngineEvent>,
    ) -> Self {
        Self {
            link,
            selector,
            pool,
            config,
            next_id: AtomicU64::new(1),
            events,
        }
    }

    /// Build a circuit for `slot` and wait until the daemon acknowledges it.
    ///
    /// Returns a Live circuit. Selection failures are returned as-is since no
    /// retry can change the pool; everything else is retried up to
    /// `max_attempts` before `CircuitBuildExhausted`.
    pub async fn build(
        &self,
        slot: SlotId,
        policy: &Policy,
        cooldown: &CooldownTracker,
    ) -> Result<Circuit> {
        policy.validate()?;

        let mut request = SelectionRequest::from_cooldown(cooldown);
        let mut backoff = Backoff::new(
            self.config.max_attempts,
            self.config.backoff_initial(),
            self.config.backoff_max(),
        );
        let mut last_error = CharonError::CircuitBuildExhausted {
            attempts: 0,
            last_error: "no attempt made".to_string(),
        };

        while backoff.begin() {
            let pool = self.pool.snapshot();
            let hops = self.selector.select(&pool, policy, &request)?;
            let id = CircuitId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let mut circuit = Circuit::new(id, slot, hops);

            tracing::info!(
                slot = %slot,
                circuit = %id,
                attempt = backoff.attempt(),
                hops = ?circuit.relay_ids(),
                "Building circuit"
            );

            match self.launch(&mut circuit).await {
                Ok(()) => {
                    self.transition(&mut circuit, CircuitState::Live)?;
                    tracing::info!(slot = %slot, circuit = %id, handle = ?circuit.handle, "Circuit live");
                    return Ok(circuit);
                }
                Err(e) => {
                    let _ = self.transition(&mut circuit, CircuitState::Failed);
                    if e.is_channel_failure() || !e.is_retryable() {
                        return Err(e);
                    }

                    tracing::warn!(
                        slot = %slot,
                        circuit = %id,
                        attempt = backoff.attempt(),
                        error = %e,
                        "Circuit build attempt failed"
                    );
                    request.exclude_failed(circuit.relay_ids(), Instant::now());
                    last_error = e;

                    match backoff.next_delay() {
                        Some(delay) => tokio::time::sleep(delay).await,
                        None => break,
                    }
                }
            }
        }

        Err(CharonError::CircuitBuildExhausted {
            attempts: backoff.attempt(),
            last_error: last_error.to_string(),
        })
    }

    /// Issue the build and wait for the acknowledgment within the build timeout
    async fn launch(&self, circuit: &mut Circuit) -> Result<()> {
        let deadline = self.config.build_timeout();
        let ids = circuit.relay_ids();

        let outcome = tokio::time::timeout(deadline, async {
            let handle = if self.config.incremental_extend {
                let handle = self.link.build(&ids[..1]).await?;
                circuit.handle = Some(handle.clone());
                for hop in &ids[1..] {
                    self.link.extend(&handle, hop).await?;
                }
                handle
            } else {
                let handle = self.link.build(&ids).await?;
                circuit.handle = Some(handle.clone());
                handle
            };
            self.await_built(&handle).await
        })
        .await;

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(CharonError::CircuitBuildTimeout(deadline)),
        };

        if result.is_err() {
            self.discard(circuit).await;
        }
        result
    }

    /// Poll the daemon until it reports the circuit built
    async fn await_built(&self, handle: &CircuitHandle) -> Result<()> {
        loop {
            match self.link.status(handle).await? {
                RemoteCircuitState::Built => return Ok(()),
                RemoteCircuitState::Failed | RemoteCircuitState::Closed => {
                    return Err(CharonError::Control(format!(
                        "circuit {handle} failed during build"
                    )));
                }
                _ => tokio::time::sleep(self.config.ack_poll()).await,
            }
        }
    }

    /// Best-effort close of a half-built circuit
    async fn discard(&self, circuit: &Circuit) {
        let Some(handle) = &circuit.handle else {
            return;
        };
        if !self.link.health().is_up() {
            return;
        }
        if let Err(e) = self.link.close(handle).await {
            tracing::debug!(circuit = %circuit.id, error = %e, "Discarding half-built circuit failed");
        }
    }

    /// Tear a circuit down through the daemon. Always ends Closed.
    pub async fn close(&self, circuit: &mut Circuit) {
        if circuit.state().is_terminal() {
            return;
        }
        if circuit.state() != CircuitState::Closing {
            let _ = self.transition(circuit, CircuitState::Closing);
        }

        if let Some(handle) = circuit.handle.clone() {
            if self.link.health().is_up() {
                if let Err(e) = self.link.close(&handle).await {
                    tracing::warn!(circuit = %circuit.id, error = %e, "Close command failed");
                }
            }
        }

        let _ = self.transition(circuit, CircuitState::Closed);
    }

    /// Mark a circuit closed without talking to the daemon (it is already gone)
    pub fn abandon(&self, circuit: &mut Circuit) {
        if circuit.state().is_terminal() {
            return;
        }
        if circuit.state() != CircuitState::Closing {
            let _ = self.transition(circuit, CircuitState::Closing);
        }
        let _ = self.transition(circuit, CircuitState::Closed);
    }

    /// Apply a state transition and publish it
    pub fn transition(&self, circuit: &mut Circuit, to: CircuitState) -> Result<()> {
        let from = circuit.advance(to)?;
        tracing::debug!(slot = %circuit.slot, circuit = %circuit.id, %from, %to, "Circuit transition");

        let _ = self.events.send(EngineEvent::CircuitTransition {
            slot: circuit.slot,
            circuit: circuit.id,
            from,
            to,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ChannelHealth;
    use crate::pool::StaticRelayPool;
    use crate::testing::{ChannelEvent, FakeChannel, relay};
    use crate::trust::TrustTable;
    use std::time::Duration;

    struct Harness {
        fake: Arc<FakeChannel>,
        link: Arc<ControlLink>,
        builder: CircuitBuilder,
        events: broadcast::Receiver<EngineEvent>,
    }

    async fn harness(config: BuilderConfig) -> Harness {
        let fake = Arc::new(FakeChannel::new());
        let link = Arc::new(ControlLink::new(fake.clone(), config.command_timeout()));
        let trust = Arc::new(TrustTable::new(Duration::from_secs(3600)));
        let relays = (0..6).map(|i| relay(&format!("R{i}"), "US", 1_000 + i)).collect();
        let pool = Arc::new(PoolCache::new(Arc::new(StaticRelayPool::new(relays))));
        pool.refresh().await.unwrap();

        let (tx, events) = broadcast::channel(64);
        let builder = CircuitBuilder::new(
            link.clone(),
            Arc::new(NodeSelector::new(trust)),
            pool,
            config,
            tx,
        );
        Harness {
            fake,
            link,
            builder,
            events,
        }
    }

    fn fast_config() -> BuilderConfig {
        BuilderConfig {
            build_timeout_secs: 2,
            command_timeout_secs: 5,
            max_attempts: 3,
            backoff_initial_ms: 10,
            backoff_max_ms: 50,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_reaches_live() {
        let mut h = harness(fast_config()).await;
        let circuit = h
            .builder
            .build(SlotId(1), &Policy::default(), &CooldownTracker::new())
            .await
            .unwrap();

        assert_eq!(circuit.state(), CircuitState::Live);
        assert!(circuit.handle.is_some());
        assert_eq!(circuit.hops.len(), 3);
        assert_eq!(h.fake.builds_issued(), 1);

        match h.events.recv().await.unwrap() {
            EngineEvent::CircuitTransition { from, to, .. } => {
                assert_eq!((from, to), (CircuitState::Building, CircuitState::Live));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_excludes_failed_chain() {
        let h = harness(fast_config()).await;
        h.fake.reject_builds(2);

        let circuit = h
            .builder
            .build(SlotId(1), &Policy::default(), &CooldownTracker::new())
            .await
            .unwrap();

        let builds = h.fake.builds();
        assert_eq!(builds.len(), 3);
        assert_ne!(builds[0], builds[1]);
        assert_ne!(builds[0], builds[2]);
        assert_ne!(builds[1], builds[2]);
        assert_eq!(circuit.relay_ids(), builds[2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_after_budget() {
        let h = harness(fast_config()).await;
        h.fake.reject_builds(100);

        let err = h
            .builder
            .build(SlotId(1), &Policy::default(), &CooldownTracker::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CharonError::CircuitBuildExhausted { attempts: 3, .. }));
        assert_eq!(h.fake.builds_issued(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_build_times_out() {
        let config = BuilderConfig {
            max_attempts: 1,
            ..fast_config()
        };
        let h = harness(config).await;
        h.fake.hang_builds(true);

        let err = h
            .builder
            .build(SlotId(1), &Policy::default(), &CooldownTracker::new())
            .await
            .unwrap_err();
        match err {
            CharonError::CircuitBuildExhausted { attempts, last_error } => {
                assert_eq!(attempts, 1);
                assert!(last_error.contains("timed out"), "{last_error}");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_loss_aborts_without_retry() {
        let h = harness(fast_config()).await;
        h.link.set_health(ChannelHealth::Down);

        let err = h
            .builder
            .build(SlotId(1), &Policy::default(), &CooldownTracker::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CharonError::ChannelLost));
        assert_eq!(h.fake.builds_issued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_issues_command_and_ends_closed() {
        let h = harness(fast_config()).await;
        let mut circuit = h
            .builder
            .build(SlotId(1), &Policy::default(), &CooldownTracker::new())
            .await
            .unwrap();
        let handle = circuit.handle.clone().unwrap();

        h.builder.close(&mut circuit).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
        assert_eq!(h.fake.events().last(), Some(&ChannelEvent::Closed(handle)));

        // Closing twice is a no-op
        h.builder.close(&mut circuit).await;
        assert_eq!(circuit.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incremental_extend() {
        let config = BuilderConfig {
            incremental_extend: true,
            ..fast_config()
        };
        let h = harness(config).await;
        let circuit = h
            .builder
            .build(SlotId(1), &Policy::default(), &CooldownTracker::new())
            .await
            .unwrap();

        assert_eq!(circuit.state(), CircuitState::Live);
        // Only the entry hop goes into the initial build
        assert_eq!(h.fake.builds()[0].len(), 1);
    }
}
