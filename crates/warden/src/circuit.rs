//! One circuit and its lifecycle state.

use charon_common::{
    CharonError, CircuitHandle, CircuitId, CircuitState, IdentityToken, RelayDescriptor, RelayId,
    Result, SlotId,
};
use rand::Rng;
use tokio::time::Instant;

/// An ordered relay chain owned by exactly one slot.
///
/// State only moves through [`Circuit::advance`], which the builder and the
/// engine call; a Closed or Failed circuit is never reused.
#[derive(Debug, Clone)]
pub struct Circuit {
    pub id: CircuitId,
    pub slot: SlotId,
    /// Assigned by the daemon once the build is issued
    pub handle: Option<CircuitHandle>,
    /// Entry first, exit last
    pub hops: Vec<RelayDescriptor>,
    pub identity: IdentityToken,
    pub created_at: Instant,
    /// When the circuit went live
    pub live_since: Option<Instant>,
    pub degraded_since: Option<Instant>,
    state: CircuitState,
}

/// Random correlation id carrying nothing about the slot or the circuit
fn fresh_identity() -> IdentityToken {
    let bytes: [u8; 16] = rand::rng().random();
    IdentityToken(hex::encode(bytes))
}

impl Circuit {
    pub fn new(id: CircuitId, slot: SlotId, hops: Vec<RelayDescriptor>) -> Self {
        Self {
            id,
            slot,
            handle: None,
            identity: fresh_identity(),
            hops,
            created_at: Instant::now(),
            live_since: None,
            degraded_since: None,
            state: CircuitState::Building,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn relay_ids(&self) -> Vec<RelayId> {
        self.hops.iter().map(|h| h.id.clone()).collect()
    }

    pub fn contains(&self, relay: &RelayId) -> bool {
        self.hops.iter().any(|h| &h.id == relay)
    }

    pub fn exit(&self) -> Option<&RelayDescriptor> {
        self.hops.last()
    }

    /// Move to `next`, rejecting transitions the state machine does not allow
    pub(crate) fn advance(&mut self, next: CircuitState) -> Result<CircuitState> {
        let from = self.state;
        if !from.can_transition_to(next) {
            return Err(CharonError::InvalidTransition { from, to: next });
        }
        self.state = next;

        let now = Instant::now();
        match next {
            CircuitState::Live => self.live_since = Some(now),
            CircuitState::Degraded => self.degraded_since = Some(now),
            _ => {}
        }
        Ok(from)
    }
}
