//! In-memory doubles shared by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use charon_common::{
    CharonError, CircuitHandle, CircuitId, RelayDescriptor, RelayId, RemoteCircuitState, Result,
};
use tokio::sync::watch;

use crate::control::ControlChannel;
use crate::health::{ProbeSample, ProbeTarget, Prober};

/// Body served by [`ScriptedProber`] when nobody tampers with it
pub const REFERENCE_BODY: &[u8] = b"charon reference payload v1";

static NEXT_ADDRESS: AtomicU32 = AtomicU32::new(0);

/// Relay in its own /16 with no family
pub fn relay(name: &str, country: &str, bandwidth: u64) -> RelayDescriptor {
    let n = NEXT_ADDRESS.fetch_add(1, Ordering::Relaxed);
    RelayDescriptor {
        id: RelayId::new(name),
        nickname: name.to_lowercase(),
        address: format!("{}.{}.0.1:9001", 10 + (n / 250) % 90, n % 250),
        country: country.to_string(),
        bandwidth,
        family: None,
        flags: ["Fast", "Running", "Valid"].iter().map(|f| f.to_string()).collect(),
    }
}

pub fn with_family(mut relay: RelayDescriptor, family: &str) -> RelayDescriptor {
    relay.family = Some(family.to_string());
    relay
}

/// Control channel traffic as observed by the fake daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Built(CircuitHandle),
    Closed(CircuitHandle),
}

/// Scriptable stand-in for the relay daemon
pub struct FakeChannel {
    connected: AtomicBool,
    reconnect_ok: AtomicBool,
    hang_builds: AtomicBool,
    reject_builds: AtomicU32,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_handle: AtomicU64,
    builds: Mutex<Vec<Vec<RelayId>>>,
    remote: Mutex<HashMap<CircuitHandle, RemoteCircuitState>>,
    events: Mutex<Vec<ChannelEvent>>,
    new_identity: AtomicUsize,
    reconnects: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeChannel {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            reconnect_ok: AtomicBool::new(true),
            hang_builds: AtomicBool::new(false),
            reject_builds: AtomicU32::new(0),
            delay: Mutex::new(Duration::ZERO),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            next_handle: AtomicU64::new(1),
            builds: Mutex::new(Vec::new()),
            remote: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
            new_identity: AtomicUsize::new(0),
            reconnects: AtomicUsize::new(0),
        }
    }

    pub fn set_command_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn hang_builds(&self, hang: bool) {
        self.hang_builds.store(hang, Ordering::SeqCst);
    }

    /// Reject the next `count` builds with a control error
    pub fn reject_builds(&self, count: u32) {
        self.reject_builds.store(count, Ordering::SeqCst);
    }

    /// Dropping the connection also loses every daemon-side circuit
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if !connected {
            for state in self.remote.lock().unwrap().values_mut() {
                *state = RemoteCircuitState::Closed;
            }
        }
    }

    pub fn set_reconnect_ok(&self, ok: bool) {
        self.reconnect_ok.store(ok, Ordering::SeqCst);
    }

    /// Close a circuit from the daemon side
    pub fn kill_circuit(&self, handle: &CircuitHandle) {
        self.remote
            .lock()
            .unwrap()
            .insert(handle.clone(), RemoteCircuitState::Closed);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn builds_issued(&self) -> usize {
        self.builds.lock().unwrap().len()
    }

    pub fn builds(&self) -> Vec<Vec<RelayId>> {
        self.builds.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<ChannelEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn new_identity_signals(&self) -> usize {
        self.new_identity.load(Ordering::SeqCst)
    }

    pub fn reconnects(&self) -> usize {
        self.reconnects.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> Result<InFlight<'_>> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(CharonError::ChannelLost);
        }
        Ok(guard)
    }
}

#[async_trait]
impl ControlChannel for FakeChannel {
    async fn authenticate(&self) -> Result<()> {
        self.enter().await.map(|_| ())
    }

    async fn build(&self, hops: &[RelayId]) -> Result<CircuitHandle> {
        let _guard = self.enter().await?;
        if self.hang_builds.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self
            .reject_builds
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.builds.lock().unwrap().push(hops.to_vec());
            return Err(CharonError::Control("552 fake rejection".into()));
        }

        let handle = CircuitHandle(self.next_handle.fetch_add(1, Ordering::SeqCst).to_string());
        self.builds.lock().unwrap().push(hops.to_vec());
        self.remote
            .lock()
            .unwrap()
            .insert(handle.clone(), RemoteCircuitState::Built);
        self.events
            .lock()
            .unwrap()
            .push(ChannelEvent::Built(handle.clone()));
        Ok(handle)
    }

    async fn extend(&self, _circuit: &CircuitHandle, _hop: &RelayId) -> Result<()> {
        self.enter().await.map(|_| ())
    }

    async fn close(&self, circuit: &CircuitHandle) -> Result<()> {
        let _guard = self.enter().await?;
        self.remote
            .lock()
            .unwrap()
            .insert(circuit.clone(), RemoteCircuitState::Closed);
        self.events
            .lock()
            .unwrap()
            .push(ChannelEvent::Closed(circuit.clone()));
        Ok(())
    }

    async fn signal_new_identity(&self) -> Result<()> {
        let _guard = self.enter().await?;
        self.new_identity.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn status(&self, circuit: &CircuitHandle) -> Result<RemoteCircuitState> {
        let _guard = self.enter().await?;
        Ok(self
            .remote
            .lock()
            .unwrap()
            .get(circuit)
            .copied()
            .unwrap_or(RemoteCircuitState::Closed))
    }

    async fn heartbeat(&self) -> Result<()> {
        self.enter().await.map(|_| ())
    }

    async fn reconnect(&self) -> Result<()> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if self.reconnect_ok.load(Ordering::SeqCst) {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(CharonError::ChannelLost)
        }
    }
}

/// Prober serving [`REFERENCE_BODY`], altered when a tampering relay is on the path
pub struct ScriptedProber {
    tampering: Mutex<HashSet<RelayId>>,
    silent: AtomicBool,
    /// While true, probes wait without answering
    held: watch::Sender<bool>,
    throughput: AtomicU64,
    probes: AtomicUsize,
    /// Probes dropped before they answered
    abandoned: AtomicUsize,
    answered: Mutex<Vec<CircuitId>>,
}

/// Counts a probe as abandoned unless it got to answer
struct Unanswered<'a>(Option<&'a AtomicUsize>);

impl Drop for Unanswered<'_> {
    fn drop(&mut self) {
        if let Some(counter) = self.0 {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self {
            tampering: Mutex::new(HashSet::new()),
            silent: AtomicBool::new(false),
            held: watch::channel(false).0,
            throughput: AtomicU64::new(1_000_000),
            probes: AtomicUsize::new(0),
            abandoned: AtomicUsize::new(0),
            answered: Mutex::new(Vec::new()),
        }
    }

    pub fn tamper_with(&self, relay: RelayId) {
        self.tampering.lock().unwrap().insert(relay);
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, Ordering::SeqCst);
    }

    pub fn set_throughput(&self, bps: u64) {
        self.throughput.store(bps, Ordering::SeqCst);
    }

    /// Hold every probe until released; held probes answer once released
    pub fn hold(&self, held: bool) {
        self.held.send_replace(held);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Circuits that got an answer, in order
    pub fn answered(&self) -> Vec<CircuitId> {
        self.answered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, target: &ProbeTarget) -> anyhow::Result<ProbeSample> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let mut pending = Unanswered(Some(&self.abandoned));
        let mut held = self.held.subscribe();
        // The sender lives as long as the prober
        let _ = held.wait_for(|held| !*held).await;
        pending.0 = None;

        if self.silent.load(Ordering::SeqCst) {
            anyhow::bail!("no response");
        }
        self.answered.lock().unwrap().push(target.circuit);

        let tampered = {
            let tampering = self.tampering.lock().unwrap();
            target.hops.iter().any(|hop| tampering.contains(hop))
        };
        let mut payload = REFERENCE_BODY.to_vec();
        if tampered {
            payload.extend_from_slice(b"<script>injected</script>");
        }

        Ok(ProbeSample {
            latency: Duration::from_millis(80),
            throughput_bps: self.throughput.load(Ordering::SeqCst),
            payload,
        })
    }
}
