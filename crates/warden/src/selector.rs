//! Relay chain selection.
//!
//! Hard filters (country, bandwidth, blacklist, family, subnet) are never
//! relaxed. Cool-down is soft unless the policy makes it strict: cooled
//! relays are ranked last and least-recently-used first, and the chosen
//! ordered tuple must differ from every tuple the slot used recently.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use charon_common::{CharonError, Policy, RelayDescriptor, RelayId, Result};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::cooldown::CooldownTracker;
use crate::trust::{TrustContributor, TrustTable};

/// Per-build selection inputs beyond the policy
#[derive(Debug, Default, Clone)]
pub struct SelectionRequest {
    /// Relays still cooling down for this slot
    pub avoid: HashSet<RelayId>,
    /// Last release time of each avoided relay
    pub last_used: HashMap<RelayId, Instant>,
    /// Ordered tuples that must not be produced again
    pub forbidden: Vec<Vec<RelayId>>,
}

impl SelectionRequest {
    pub fn from_cooldown(tracker: &CooldownTracker) -> Self {
        Self {
            avoid: tracker.avoid_set(),
            last_used: tracker.last_used(),
            forbidden: tracker.recent_tuples(),
        }
    }

    /// Treat a chain that failed to build like a freshly released one
    pub fn exclude_failed(&mut self, chain: Vec<RelayId>, now: Instant) {
        for id in &chain {
            self.avoid.insert(id.clone());
            self.last_used.insert(id.clone(), now);
        }
        self.forbidden.push(chain);
    }

    fn is_forbidden(&self, chain: &[&RelayDescriptor]) -> bool {
        self.forbidden.iter().any(|tuple| {
            tuple.len() == chain.len() && tuple.iter().zip(chain).all(|(a, b)| *a == b.id)
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate<'a> {
    relay: &'a RelayDescriptor,
    score: f64,
    tiebreak: u64,
}

/// Picks ordered relay chains for circuits
pub struct NodeSelector {
    trust: Arc<TrustTable>,
    contributors: Vec<Arc<dyn TrustContributor>>,
}

impl NodeSelector {
    pub fn new(trust: Arc<TrustTable>) -> Self {
        Self {
            trust,
            contributors: Vec::new(),
        }
    }

    pub fn with_contributor(mut self, contributor: Arc<dyn TrustContributor>) -> Self {
        tracing::debug!(contributor = contributor.name(), "Trust contributor registered");
        self.contributors.push(contributor);
        self
    }

    /// Score used for ranking: trust plus every contribution
    pub fn effective_score(&self, relay: &RelayDescriptor) -> f64 {
        let base = self.trust.score(&relay.id);
        base + self
            .contributors
            .iter()
            .map(|c| c.contribution(relay))
            .sum::<f64>()
    }

    /// Relays passing every hard filter, best first
    fn ranked<'a>(&self, pool: &'a [RelayDescriptor], policy: &Policy) -> Vec<Candidate<'a>> {
        let mut seen = HashSet::new();
        let mut candidates: Vec<_> = pool
            .iter()
            .filter(|r| seen.insert(r.id.clone()))
            .filter(|r| policy.allows_country(&r.country))
            .filter(|r| r.bandwidth >= policy.min_bandwidth)
            .filter(|r| !self.trust.is_blacklisted(&r.id))
            .map(|relay| Candidate {
                relay,
                score: self.effective_score(relay),
                tiebreak: tiebreak(&relay.id),
            })
            .collect();

        candidates.sort_by(compare_rank);
        candidates
    }

    /// Number of relays passing the hard filters
    pub fn eligible_count(&self, pool: &[RelayDescriptor], policy: &Policy) -> usize {
        self.ranked(pool, policy).len()
    }

    /// Choose an ordered chain of `policy.hop_count` relays, entry first.
    ///
    /// Pure with respect to the trust table: nothing is recorded here.
    pub fn select(
        &self,
        pool: &[RelayDescriptor],
        policy: &Policy,
        request: &SelectionRequest,
    ) -> Result<Vec<RelayDescriptor>> {
        let needed = policy.hop_count;
        let ranked = self.ranked(pool, policy);
        let exhausted = || CharonError::SelectionExhausted {
            needed,
            eligible: ranked.len(),
        };

        let (fresh, cooled): (Vec<_>, Vec<_>) = ranked
            .iter()
            .copied()
            .partition(|c| !request.avoid.contains(&c.relay.id));

        if let Some(chain) = search_chain(&fresh, policy, |c| !request.is_forbidden(c)) {
            return Ok(chain.into_iter().cloned().collect());
        }

        if policy.cooldown.strict {
            return Err(CharonError::SelectionExhausted {
                needed,
                eligible: fresh.len(),
            });
        }

        // Soft cool-down: fall back to cooled relays, least recently used first
        let mut cooled = cooled;
        cooled.sort_by(|a, b| {
            let ta = request.last_used.get(&a.relay.id);
            let tb = request.last_used.get(&b.relay.id);
            ta.cmp(&tb).then_with(|| compare_rank(a, b))
        });
        let order: Vec<_> = fresh.iter().chain(cooled.iter()).copied().collect();

        let chain = relaxed_chain(&order, policy, request).ok_or_else(exhausted)?;
        tracing::warn!(
            hops = needed,
            fresh = fresh.len(),
            eligible = ranked.len(),
            "Cool-down relaxed, reusing recently used relays"
        );
        Ok(chain.into_iter().cloned().collect())
    }
}

/// Highest score first, then bandwidth, then a stable hash of the fingerprint
fn compare_rank(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.relay.bandwidth.cmp(&a.relay.bandwidth))
        .then_with(|| a.tiebreak.cmp(&b.tiebreak))
}

fn tiebreak(id: &RelayId) -> u64 {
    let digest = Sha256::digest(id.as_str().as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

fn conflicts(candidate: &RelayDescriptor, chosen: &[&RelayDescriptor], policy: &Policy) -> bool {
    chosen.iter().any(|other| {
        other.id == candidate.id
            || other.shares_family(candidate)
            || (policy.distinct_subnets
                && matches!(
                    (other.subnet_key(), candidate.subnet_key()),
                    (Some(a), Some(b)) if a == b
                ))
    })
}

/// Upper bound on candidate visits in one chain search
const SEARCH_STEPS: usize = 8192;

/// First compatible chain over `order`, in ranking order, that `accept` takes.
///
/// Depth-first with backtracking, so a pick that blocks every completion is
/// undone instead of failing the whole selection. When the first greedy walk
/// succeeds it is the result.
fn search_chain<'a, F>(order: &[Candidate<'a>], policy: &Policy, accept: F) -> Option<Vec<&'a RelayDescriptor>>
where
    F: Fn(&[&RelayDescriptor]) -> bool,
{
    let mut chain = Vec::with_capacity(policy.hop_count);
    let mut steps = SEARCH_STEPS;
    let found = extend_chain(order, 0, policy, &mut chain, &mut steps, &accept);
    if !found && steps == 0 {
        tracing::debug!(candidates = order.len(), "Chain search step limit reached");
    }
    found.then_some(chain)
}

fn extend_chain<'a, F>(
    order: &[Candidate<'a>],
    from: usize,
    policy: &Policy,
    chain: &mut Vec<&'a RelayDescriptor>,
    steps: &mut usize,
    accept: &F,
) -> bool
where
    F: Fn(&[&RelayDescriptor]) -> bool,
{
    let missing = policy.hop_count - chain.len();
    if missing == 0 {
        return accept(chain.as_slice());
    }
    if order.len().saturating_sub(from) < missing {
        return false;
    }

    for (index, candidate) in order.iter().enumerate().skip(from) {
        if *steps == 0 {
            return false;
        }
        *steps -= 1;
        if conflicts(candidate.relay, chain.as_slice(), policy) {
            continue;
        }
        chain.push(candidate.relay);
        if extend_chain(order, index + 1, policy, chain, steps, accept) {
            return true;
        }
        chain.pop();
    }
    false
}

/// Chain over `order` with some rotation that is not a forbidden tuple
fn relaxed_chain<'a>(
    order: &[Candidate<'a>],
    policy: &Policy,
    request: &SelectionRequest,
) -> Option<Vec<&'a RelayDescriptor>> {
    let chain = search_chain(order, policy, |c| first_allowed_rotation(c, request).is_some())?;
    first_allowed_rotation(&chain, request)
}

fn first_allowed_rotation<'a>(
    chain: &[&'a RelayDescriptor],
    request: &SelectionRequest,
) -> Option<Vec<&'a RelayDescriptor>> {
    (0..chain.len()).find_map(|shift| {
        let mut rotated = chain.to_vec();
        rotated.rotate_left(shift);
        (!request.is_forbidden(&rotated)).then_some(rotated)
    })
}
