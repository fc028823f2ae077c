//! Engine notifications for integrating layers.

use charon_common::{CharonError, CircuitId, CircuitState, RelayId, SlotId};

/// Broadcast on every observable engine change
#[derive(Debug, Clone)]
pub enum EngineEvent {
    CircuitTransition {
        slot: SlotId,
        circuit: CircuitId,
        from: CircuitState,
        to: CircuitState,
    },
    BuildFailed {
        slot: SlotId,
        error: CharonError,
    },
    RelayBlacklisted {
        relay: RelayId,
        mismatches: u32,
        as_exit: bool,
    },
    ChannelLost,
    ChannelRestored,
    /// Reconnect budget exhausted; emitted once until restart
    Fatal(CharonError),
}
