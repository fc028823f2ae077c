//! Per-slot memory of recently used relay chains.

use std::collections::{HashMap, HashSet, VecDeque};

use charon_common::{Policy, RelayId};
use tokio::time::Instant;

/// Hard cap on remembered chains per slot
const MAX_REMEMBERED: usize = 64;

#[derive(Debug, Clone)]
struct UsedChain {
    relays: Vec<RelayId>,
    released_at: Instant,
}

/// Chains a slot used recently, newest last.
///
/// A chain stays remembered while it is inside the policy's cool-down
/// window or among the last `cooldown.rotations` chains.
#[derive(Debug, Clone, Default)]
pub struct CooldownTracker {
    history: VecDeque<UsedChain>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a chain the slot just stopped using
    pub fn record(&mut self, relays: Vec<RelayId>, now: Instant) {
        self.history.push_back(UsedChain {
            relays,
            released_at: now,
        });
        while self.history.len() > MAX_REMEMBERED {
            self.history.pop_front();
        }
    }

    /// Forget chains that left both the time window and the rotation window
    pub fn prune(&mut self, policy: &Policy, now: Instant) {
        let window = policy.cooldown_window();
        let keep_last = policy.cooldown.rotations as usize;
        let len = self.history.len();

        let mut index = 0;
        self.history.retain(|chain| {
            let recent_rotation = index + keep_last >= len;
            let in_window = now.saturating_duration_since(chain.released_at) < window;
            index += 1;
            recent_rotation || in_window
        });
    }

    /// Relays still cooling down
    pub fn avoid_set(&self) -> HashSet<RelayId> {
        self.history
            .iter()
            .flat_map(|c| c.relays.iter().cloned())
            .collect()
    }

    /// Most recent release time per relay
    pub fn last_used(&self) -> HashMap<RelayId, Instant> {
        let mut map = HashMap::new();
        for chain in &self.history {
            for relay in &chain.relays {
                map.insert(relay.clone(), chain.released_at);
            }
        }
        map
    }

    /// Ordered tuples that must not be repeated
    pub fn recent_tuples(&self) -> Vec<Vec<RelayId>> {
        self.history.iter().map(|c| c.relays.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}
