//! The circuit orchestration engine.
//!
//! [`Engine`] owns every slot and the background loops that keep their
//! circuits healthy: one probe task per live circuit, a single probe
//! consumer (health accounting and malicious relay detection), the
//! rotation scheduler, the supervisor and the relay pool worker.
//!
//! Circuit replacement for a slot always tears the old circuit down before
//! the new one goes live, and at most one replacement per slot runs at a
//! time (see [`SlotOps`]).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use charon_common::{
    CharonError, CircuitHandle, CircuitId, CircuitState, IdentityToken, IntegrityOutcome, Policy,
    ProbeResult, RelayId, Result, SlotId, SlotStatus,
};
use serde::Serialize;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::builder::CircuitBuilder;
use crate::circuit::Circuit;
use crate::config::EngineConfig;
use crate::control::{ControlChannel, ControlLink};
use crate::cooldown::CooldownTracker;
use crate::detector::MaliciousNodeDetector;
use crate::events::EngineEvent;
use crate::health::{
    HealthAdvisory, HealthMonitor, ProbeTarget, Prober, ReferencePayload, spawn_probe_task,
};
use crate::pool::{PoolCache, RelayPool, pool_refresh_worker};
use crate::rotation::{Begin, RebuildReason, SlotOps, due_rotation, run_scheduler};
use crate::selector::NodeSelector;
use crate::supervisor::run_supervisor;
use crate::trust::{ExitLatencyContributor, TrustTable};

/// External collaborators the engine is wired to
pub struct EngineParts {
    pub channel: Arc<dyn ControlChannel>,
    pub pool: Arc<dyn RelayPool>,
    pub prober: Arc<dyn Prober>,
    pub reference: ReferencePayload,
}

/// What a rotation request ended up doing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RotationOutcome {
    /// A new circuit is live
    Rotated {
        circuit: CircuitId,
        identity: IdentityToken,
    },
    /// Folded into a rotation that was already running
    Coalesced,
    /// The cause was already dealt with
    Skipped,
}

/// Caller-facing commands, for integrations that prefer one entry point
#[derive(Debug, Clone)]
pub enum Command {
    Start(Policy),
    Rotate(SlotId),
    NewIdentity(SlotId),
    Status(SlotId),
    Stop(SlotId),
}

#[derive(Debug, Clone)]
pub enum CommandReply {
    Started(SlotId),
    Rotated(RotationOutcome),
    Status(Box<SlotStatus>),
    Stopped(SlotId),
}

struct Slot {
    policy: Policy,
    circuit: Option<Circuit>,
    probe_task: Option<JoinHandle<()>>,
    last_probe: Option<ProbeResult>,
    cooldown: CooldownTracker,
    rotations: u64,
    last_error: Option<String>,
    /// Last failed build, for retry pacing
    failed_at: Option<Instant>,
}

impl Slot {
    fn new(policy: Policy) -> Self {
        Self {
            policy,
            circuit: None,
            probe_task: None,
            last_probe: None,
            cooldown: CooldownTracker::new(),
            rotations: 0,
            last_error: None,
            failed_at: None,
        }
    }

    fn status(&self, slot: SlotId) -> SlotStatus {
        SlotStatus {
            slot,
            state: self.circuit.as_ref().map(Circuit::state),
            circuit: self.circuit.as_ref().map(|c| c.id),
            relays: self
                .circuit
                .as_ref()
                .map(Circuit::relay_ids)
                .unwrap_or_default(),
            identity: self.circuit.as_ref().map(|c| c.identity.clone()),
            last_probe: self.last_probe.clone(),
            rotations: self.rotations,
            last_error: self.last_error.clone(),
        }
    }

    fn stop_probing(&mut self) {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
    }
}

struct Inner {
    config: EngineConfig,
    link: Arc<ControlLink>,
    pool: Arc<PoolCache>,
    trust: Arc<TrustTable>,
    latency: Option<Arc<ExitLatencyContributor>>,
    builder: CircuitBuilder,
    prober: Arc<dyn Prober>,
    reference: ReferencePayload,
    slots: Mutex<HashMap<SlotId, Slot>>,
    ops: SlotOps,
    next_slot: AtomicU64,
    /// Bumped each time circuits are written off after a channel loss
    epoch: AtomicU64,
    probe_tx: mpsc::Sender<ProbeResult>,
    events: broadcast::Sender<EngineEvent>,
    halted: AtomicBool,
    fatal: Mutex<Option<CharonError>>,
    restart: Notify,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running engine (cheap to clone)
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Wire the engine, load the relay pool and start the background loops
    pub async fn launch(config: EngineConfig, parts: EngineParts) -> Result<Self> {
        let trust = Arc::new(TrustTable::new(config.detector.trust_half_life()));

        let latency = (config.selector.exit_latency_weight > 0.0).then(|| {
            Arc::new(ExitLatencyContributor::new(
                config.selector.exit_latency_weight,
                config.selector.latency_ceiling_ms,
            ))
        });
        let mut selector = NodeSelector::new(trust.clone());
        if let Some(latency) = &latency {
            selector = selector.with_contributor(latency.clone());
        }

        let link = Arc::new(ControlLink::new(parts.channel, config.builder.command_timeout()));
        let pool = Arc::new(PoolCache::new(parts.pool));
        match pool.refresh().await {
            Ok(count) => tracing::info!(relays = count, "Relay pool loaded"),
            Err(e) => tracing::warn!(error = %e, "Initial relay pool load failed"),
        }

        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = broadcast::channel(1);
        let (probe_tx, probe_rx) = mpsc::channel(256);

        let builder = CircuitBuilder::new(
            link.clone(),
            Arc::new(selector),
            pool.clone(),
            config.builder.clone(),
            events.clone(),
        );

        let engine = Self {
            inner: Arc::new(Inner {
                config,
                link,
                pool,
                trust,
                latency,
                builder,
                prober: parts.prober,
                reference: parts.reference,
                slots: Mutex::new(HashMap::new()),
                ops: SlotOps::default(),
                next_slot: AtomicU64::new(1),
                epoch: AtomicU64::new(0),
                probe_tx,
                events,
                halted: AtomicBool::new(false),
                fatal: Mutex::new(None),
                restart: Notify::new(),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        };
        engine.spawn_background(probe_rx);
        Ok(engine)
    }

    fn spawn_background(&self, probe_rx: mpsc::Receiver<ProbeResult>) {
        let shutdown = &self.inner.shutdown;
        let handles = vec![
            tokio::spawn(run_probe_consumer(self.clone(), probe_rx, shutdown.subscribe())),
            tokio::spawn(run_scheduler(self.clone(), shutdown.subscribe())),
            tokio::spawn(run_supervisor(self.clone(), shutdown.subscribe())),
            tokio::spawn(pool_refresh_worker(
                self.inner.pool.clone(),
                self.inner.config.pool.refresh(),
                shutdown.subscribe(),
            )),
        ];
        self.lock_tasks().extend(handles);
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn link(&self) -> Arc<ControlLink> {
        self.inner.link.clone()
    }

    pub fn trust(&self) -> Arc<TrustTable> {
        self.inner.trust.clone()
    }

    pub fn pool(&self) -> Arc<PoolCache> {
        self.inner.pool.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn emit(&self, event: EngineEvent) {
        let _ = self.inner.events.send(event);
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<SlotId, Slot>> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- Lifecycle ---------------------------------------------------

    /// True once the reconnect budget ran out
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    /// The error that halted the engine, if any
    pub fn fatal_error(&self) -> Option<CharonError> {
        self.inner
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Engine can serve requests: channel up, not halted, relays known
    pub fn is_ready(&self) -> bool {
        !self.is_halted() && self.inner.link.health().is_up() && !self.inner.pool.is_empty()
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.is_halted() {
            return Ok(());
        }
        Err(self.fatal_error().unwrap_or_else(|| {
            CharonError::ControlChannelUnavailable("engine halted".to_string())
        }))
    }

    /// Stop all rebuilds and surface `error` exactly once
    pub(crate) fn halt(&self, error: CharonError) {
        if self.inner.halted.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(error = %error, "🛑 Engine halted, no further rebuilds until restart");
        *self.inner.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.clone());
        self.emit(EngineEvent::Fatal(error));
    }

    /// Clear a halt and let the supervisor try again with a fresh budget
    pub fn restart(&self) {
        if !self.inner.halted.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.inner.fatal.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.inner.link.set_health(crate::control::ChannelHealth::Down);
        self.inner.restart.notify_one();
        tracing::info!("Engine restart requested");
    }

    pub(crate) async fn restart_requested(&self) {
        self.inner.restart.notified().await
    }

    /// Close every circuit and stop the background loops
    pub async fn shutdown(&self) {
        tracing::info!("Engine shutting down...");

        let slots: Vec<SlotId> = self.lock_slots().keys().copied().collect();
        for slot in slots {
            if let Err(e) = self.stop(slot).await {
                tracing::debug!(slot = %slot, error = %e, "Stop during shutdown failed");
            }
        }

        let _ = self.inner.shutdown.send(());
        let tasks = std::mem::take(&mut *self.lock_tasks());
        if tokio::time::timeout(Duration::from_secs(5), futures::future::join_all(tasks))
            .await
            .is_err()
        {
            tracing::warn!("Background tasks did not stop in time");
        }
    }

    // ---- Slot API ----------------------------------------------------

    /// Create a slot and build its first circuit
    pub async fn start(&self, policy: Policy) -> Result<SlotId> {
        policy.validate()?;
        self.ensure_running()?;

        let slot = SlotId(self.inner.next_slot.fetch_add(1, Ordering::Relaxed));
        self.lock_slots().insert(slot, Slot::new(policy));
        tracing::info!(slot = %slot, "Slot created");

        match self.drive_detached(slot, RebuildReason::Initial).await {
            Ok(_) => Ok(slot),
            Err(e) => {
                if let Some(mut entry) = self.lock_slots().remove(&slot) {
                    entry.stop_probing();
                }
                self.inner.ops.forget(slot);
                Err(e)
            }
        }
    }

    /// Replace the slot's circuit now
    pub async fn rotate(&self, slot: SlotId) -> Result<RotationOutcome> {
        self.drive_detached(slot, RebuildReason::Manual).await
    }

    /// Rotate and ask the daemon to switch to clean circuits
    pub async fn new_identity(&self, slot: SlotId) -> Result<RotationOutcome> {
        self.drive_detached(slot, RebuildReason::NewIdentity).await
    }

    /// Called before each logical request; returns the identity to use
    pub async fn before_request(&self, slot: SlotId) -> Result<IdentityToken> {
        let per_request = self
            .lock_slots()
            .get(&slot)
            .map(|s| s.policy.rotate_per_request)
            .ok_or(CharonError::UnknownSlot(slot))?;

        if per_request {
            self.drive_detached(slot, RebuildReason::PerRequest).await?;
        }

        let slots = self.lock_slots();
        let entry = slots.get(&slot).ok_or(CharonError::UnknownSlot(slot))?;
        entry
            .circuit
            .as_ref()
            .filter(|c| c.state().is_usable())
            .map(|c| c.identity.clone())
            .ok_or(CharonError::NoCircuit(slot))
    }

    pub fn status(&self, slot: SlotId) -> Result<SlotStatus> {
        self.lock_slots()
            .get(&slot)
            .map(|entry| entry.status(slot))
            .ok_or(CharonError::UnknownSlot(slot))
    }

    /// Status of every slot, ordered by id
    pub fn slots(&self) -> Vec<SlotStatus> {
        let slots = self.lock_slots();
        let mut all: Vec<_> = slots.iter().map(|(id, s)| s.status(*id)).collect();
        all.sort_by_key(|s| s.slot);
        all
    }

    /// Swap the policy used from the next rotation on
    pub fn reconfigure(&self, slot: SlotId, policy: Policy) -> Result<()> {
        policy.validate()?;
        let mut slots = self.lock_slots();
        let entry = slots.get_mut(&slot).ok_or(CharonError::UnknownSlot(slot))?;
        entry.policy = policy;
        tracing::info!(slot = %slot, "Slot policy updated");
        Ok(())
    }

    /// Close the slot's circuit and forget the slot
    pub async fn stop(&self, slot: SlotId) -> Result<()> {
        let mut entry = self
            .lock_slots()
            .remove(&slot)
            .ok_or(CharonError::UnknownSlot(slot))?;
        entry.stop_probing();
        self.inner.ops.forget(slot);

        if let Some(mut circuit) = entry.circuit.take() {
            self.inner.builder.close(&mut circuit).await;
        }
        tracing::info!(slot = %slot, "Slot stopped");
        Ok(())
    }

    /// Single entry point mirroring the slot API
    pub async fn dispatch(&self, command: Command) -> Result<CommandReply> {
        match command {
            Command::Start(policy) => self.start(policy).await.map(CommandReply::Started),
            Command::Rotate(slot) => self.rotate(slot).await.map(CommandReply::Rotated),
            Command::NewIdentity(slot) => self.new_identity(slot).await.map(CommandReply::Rotated),
            Command::Status(slot) => self
                .status(slot)
                .map(|status| CommandReply::Status(Box::new(status))),
            Command::Stop(slot) => self.stop(slot).await.map(|()| CommandReply::Stopped(slot)),
        }
    }

    // ---- Relays ------------------------------------------------------

    pub async fn refresh_pool(&self) -> Result<usize> {
        self.inner.pool.refresh().await
    }

    /// Blacklist a relay by hand; circuits through it are replaced
    pub fn blacklist(&self, relay: &RelayId, reason: &str) -> bool {
        if !self.inner.trust.blacklist(relay, reason) {
            return false;
        }
        tracing::warn!(relay = %relay, %reason, "Relay blacklisted by operator");
        self.emit(EngineEvent::RelayBlacklisted {
            relay: relay.clone(),
            mismatches: 0,
            as_exit: false,
        });
        self.taint_relay(relay);
        true
    }

    pub fn blacklisted(&self) -> Vec<RelayId> {
        self.inner.trust.blacklisted()
    }

    // ---- Rotation ----------------------------------------------------

    /// Run a rotation on its own task so a dropped caller cannot wedge the slot
    async fn drive_detached(&self, slot: SlotId, reason: RebuildReason) -> Result<RotationOutcome> {
        let engine = self.clone();
        tokio::spawn(async move { engine.drive(slot, reason).await })
            .await
            .map_err(|e| CharonError::Control(format!("rotation task failed: {e}")))?
    }

    /// Fire-and-forget rotation used by the background loops
    pub(crate) fn spawn_drive(&self, slot: SlotId, reason: RebuildReason) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.drive(slot, reason).await {
                tracing::warn!(slot = %slot, %reason, error = %e, "Background rotation failed");
            }
        });
    }

    /// Replace the slot's circuit, coalescing with any rotation already running
    pub(crate) async fn drive(&self, slot: SlotId, reason: RebuildReason) -> Result<RotationOutcome> {
        match self.inner.ops.begin(slot, reason) {
            Begin::Drive => {}
            Begin::Coalesced(mut idle) => {
                tracing::debug!(slot = %slot, %reason, "Rotation coalesced");
                let _ = idle.changed().await;
                return Ok(RotationOutcome::Coalesced);
            }
        }

        let mut reason = reason;
        loop {
            let result = self.replace_circuit(slot, reason).await;
            match self.inner.ops.finish(slot) {
                Some(next) => {
                    if let Err(e) = &result {
                        tracing::debug!(slot = %slot, %reason, error = %e, "Rotation failed, running queued one");
                    }
                    reason = next;
                }
                None => return result,
            }
        }
    }

    async fn replace_circuit(&self, slot: SlotId, reason: RebuildReason) -> Result<RotationOutcome> {
        self.ensure_running()?;
        let inner = &self.inner;
        let epoch = inner.epoch.load(Ordering::SeqCst);

        let (old, policy) = {
            let mut slots = self.lock_slots();
            let entry = slots.get_mut(&slot).ok_or(CharonError::UnknownSlot(slot))?;
            let applies = reason.still_applies(
                entry.circuit.as_ref(),
                &entry.policy,
                &inner.config.scheduler,
                Instant::now(),
            );
            if !applies {
                tracing::debug!(slot = %slot, %reason, "Rotation no longer needed");
                return Ok(RotationOutcome::Skipped);
            }
            entry.stop_probing();
            (entry.circuit.take(), entry.policy.clone())
        };

        // Old circuit is fully closed before anything new is built
        if let Some(mut old) = old {
            inner.builder.close(&mut old).await;
            if let Some(entry) = self.lock_slots().get_mut(&slot) {
                entry.cooldown.record(old.relay_ids(), Instant::now());
            }
        }

        if reason == RebuildReason::NewIdentity {
            if let Err(e) = inner.link.signal_new_identity().await {
                tracing::warn!(slot = %slot, error = %e, "NEWNYM signal failed");
                if e.is_channel_failure() {
                    return Err(e);
                }
            }
        }

        let cooldown = {
            let mut slots = self.lock_slots();
            let entry = slots.get_mut(&slot).ok_or(CharonError::SlotStopped(slot))?;
            entry.cooldown.prune(&policy, Instant::now());
            entry.cooldown.clone()
        };

        let mut circuit = match inner.builder.build(slot, &policy, &cooldown).await {
            Ok(circuit) => circuit,
            Err(e) => {
                tracing::warn!(slot = %slot, %reason, error = %e, "Circuit build failed");
                if let Some(entry) = self.lock_slots().get_mut(&slot) {
                    entry.last_error = Some(e.to_string());
                    entry.failed_at = Some(Instant::now());
                }
                self.emit(EngineEvent::BuildFailed {
                    slot,
                    error: e.clone(),
                });
                return Err(e);
            }
        };

        if inner.epoch.load(Ordering::SeqCst) != epoch {
            // Built on a connection that has since been written off
            inner.builder.abandon(&mut circuit);
            return Err(CharonError::ChannelLost);
        }

        let installed = {
            let mut slots = self.lock_slots();
            match slots.get_mut(&slot) {
                Some(entry) => {
                    let outcome = RotationOutcome::Rotated {
                        circuit: circuit.id,
                        identity: circuit.identity.clone(),
                    };
                    entry.probe_task = Some(self.spawn_probe(&circuit));
                    if reason != RebuildReason::Initial {
                        entry.rotations += 1;
                    }
                    entry.last_error = None;
                    entry.failed_at = None;
                    entry.circuit = Some(circuit);
                    Ok(outcome)
                }
                None => Err(circuit),
            }
        };

        match installed {
            Ok(outcome) => {
                tracing::info!(slot = %slot, %reason, outcome = ?outcome, "🔄 Slot circuit replaced");
                Ok(outcome)
            }
            Err(mut orphan) => {
                inner.builder.close(&mut orphan).await;
                Err(CharonError::SlotStopped(slot))
            }
        }
    }

    fn spawn_probe(&self, circuit: &Circuit) -> JoinHandle<()> {
        let target = ProbeTarget {
            slot: circuit.slot,
            circuit: circuit.id,
            handle: circuit.handle.clone(),
            hops: circuit.relay_ids(),
            identity: circuit.identity.clone(),
        };
        spawn_probe_task(
            self.inner.prober.clone(),
            self.inner.reference,
            target,
            &self.inner.config.health,
            self.inner.probe_tx.clone(),
        )
    }

    /// Slots whose circuit is due for a planned rotation or a retry
    pub(crate) fn due_slots(&self, now: Instant) -> Vec<(SlotId, RebuildReason)> {
        let scheduler = &self.inner.config.scheduler;
        let slots = self.lock_slots();

        slots
            .iter()
            .filter(|(id, _)| !self.inner.ops.is_busy(**id))
            .filter_map(|(id, entry)| {
                let reason = match &entry.circuit {
                    Some(circuit) => due_rotation(circuit, &entry.policy, scheduler, now)?,
                    None => {
                        let failed_at = entry.failed_at?;
                        if now.saturating_duration_since(failed_at) < scheduler.retry_failed_after() {
                            return None;
                        }
                        RebuildReason::Retry
                    }
                };
                Some((*id, reason))
            })
            .collect()
    }

    // ---- Supervisor hooks --------------------------------------------

    /// Write off every circuit after a channel loss; returns the affected slots
    pub(crate) fn abandon_circuits(&self) -> Vec<SlotId> {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let mut slots = self.lock_slots();
        for entry in slots.values_mut() {
            entry.stop_probing();
            if let Some(circuit) = entry.circuit.as_mut() {
                self.inner.builder.abandon(circuit);
            }
        }
        slots.keys().copied().collect()
    }

    pub(crate) fn active_slots(&self) -> Vec<SlotId> {
        self.lock_slots().keys().copied().collect()
    }

    /// Usable circuits with a daemon handle, for status sweeps
    pub(crate) fn sweep_targets(&self) -> Vec<(SlotId, CircuitId, CircuitHandle)> {
        self.lock_slots()
            .iter()
            .filter_map(|(id, entry)| {
                let circuit = entry.circuit.as_ref().filter(|c| c.state().is_usable())?;
                Some((*id, circuit.id, circuit.handle.clone()?))
            })
            .collect()
    }

    /// The daemon dropped a circuit; returns true if it was the slot's current one
    pub(crate) fn mark_remote_closed(&self, slot: SlotId, circuit: CircuitId) -> bool {
        let mut slots = self.lock_slots();
        let Some(entry) = slots.get_mut(&slot) else {
            return false;
        };
        if !entry.circuit.as_ref().is_some_and(|c| c.id == circuit) {
            return false;
        }
        entry.stop_probing();
        if let Some(current) = entry.circuit.as_mut() {
            self.inner.builder.abandon(current);
        }
        true
    }

    // ---- Probe consumer ----------------------------------------------

    fn live_circuits(&self) -> HashSet<CircuitId> {
        self.lock_slots()
            .values()
            .filter_map(|entry| entry.circuit.as_ref().map(|c| c.id))
            .collect()
    }

    fn handle_probe(
        &self,
        health: &mut HealthMonitor,
        detector: &mut MaliciousNodeDetector,
        result: ProbeResult,
    ) {
        let min_bandwidth = {
            let mut slots = self.lock_slots();
            let current = slots.get_mut(&result.slot).filter(|entry| {
                entry
                    .circuit
                    .as_ref()
                    .is_some_and(|c| c.id == result.circuit && c.state().is_usable())
            });
            let Some(entry) = current else {
                // Stale result for a circuit that is gone or being replaced
                health.forget(result.circuit);
                return;
            };
            entry.last_probe = Some(result.clone());
            entry.policy.min_bandwidth
        };

        if result.integrity == IntegrityOutcome::Ok {
            if let (Some(latency), Some(exit)) = (&self.inner.latency, result.exit()) {
                latency.observe(exit, result.latency_ms);
            }
        }

        for advisory in health.observe(&result, min_bandwidth) {
            match advisory {
                HealthAdvisory::Degrade(reason) => {
                    self.mark_degraded(result.slot, result.circuit, &reason.to_string());
                }
                HealthAdvisory::IntegrityAlert { exit } => {
                    tracing::warn!(
                        slot = %result.slot,
                        circuit = %result.circuit,
                        exit = ?exit,
                        "Probe payload altered"
                    );
                }
            }
        }

        for verdict in detector.record(&result) {
            self.emit(EngineEvent::RelayBlacklisted {
                relay: verdict.relay.clone(),
                mismatches: verdict.mismatches,
                as_exit: verdict.as_exit,
            });
            self.taint_relay(&verdict.relay);
        }
    }

    fn mark_degraded(&self, slot: SlotId, circuit: CircuitId, reason: &str) {
        let mut slots = self.lock_slots();
        let Some(current) = slots
            .get_mut(&slot)
            .and_then(|entry| entry.circuit.as_mut())
            .filter(|c| c.id == circuit && c.state() == CircuitState::Live)
        else {
            return;
        };
        if self.inner.builder.transition(current, CircuitState::Degraded).is_ok() {
            tracing::warn!(slot = %slot, circuit = %circuit, %reason, "Circuit degraded");
        }
    }

    /// Mark every usable circuit through `relay` Tainted and queue its replacement
    fn taint_relay(&self, relay: &RelayId) {
        let affected: Vec<SlotId> = {
            let mut slots = self.lock_slots();
            slots
                .iter_mut()
                .filter_map(|(id, entry)| {
                    let circuit = entry
                        .circuit
                        .as_mut()
                        .filter(|c| c.state().is_usable() && c.contains(relay))?;
                    self.inner
                        .builder
                        .transition(circuit, CircuitState::Tainted)
                        .ok()?;
                    entry.stop_probing();
                    Some(*id)
                })
                .collect()
        };

        for slot in affected {
            tracing::warn!(slot = %slot, relay = %relay, "Circuit tainted, replacing");
            self.spawn_drive(slot, RebuildReason::Tainted);
        }
    }
}

/// Single consumer of every probe result, so detector verdicts are serialized
async fn run_probe_consumer(
    engine: Engine,
    mut results: mpsc::Receiver<ProbeResult>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut health = HealthMonitor::new(engine.config().health.clone());
    let mut detector = MaliciousNodeDetector::new(engine.config().detector.clone(), engine.trust());
    let mut prune = tokio::time::interval(engine.config().health.probe_interval() * 10);
    prune.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            Some(result) = results.recv() => {
                engine.handle_probe(&mut health, &mut detector, result);
            }
            _ = prune.tick() => {
                health.retain_live(&engine.live_circuits());
            }
            _ = shutdown.recv() => {
                tracing::info!("Probe consumer shutting down...");
                break;
            }
        }
    }
}
