//! Placement of allocation requests onto agents.
//!
//! Fitting is a pure function of a request and a snapshot of agent states.
//! It never mutates the agents; the caller reserves devices on the chosen
//! candidates afterwards.
//!
//! - A *shared* fit places the whole request on one agent that may already
//!   run other containers.
//! - A *dedicated* fit spreads a multi-slot request over agents that run
//!   nothing else, each contributing all of its empty slots.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use berth_id::AgentId;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::agent::AgentState;
use crate::scheduler::SchedulerError;
use crate::tasklist::AllocateRequest;

// =============================================================================
// Fitting policy
// =============================================================================

/// Soft constraint used to rank viable agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FittingPolicy {
    /// Prefer the fullest agent, packing work together.
    #[default]
    Best,
    /// Prefer the emptiest agent, spreading work out.
    Worst,
}

impl FittingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Best => "best",
            Self::Worst => "worst",
        }
    }

    /// Score in `[0, 1]`; higher is better.
    pub fn score(&self, request: &AllocateRequest, agent: &AgentState) -> f64 {
        match self {
            Self::Best => best_fit(request, agent),
            Self::Worst => worst_fit(request, agent),
        }
    }
}

impl fmt::Display for FittingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FittingPolicy {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "best" => Ok(Self::Best),
            "worst" => Ok(Self::Worst),
            other => Err(SchedulerError::UnknownFittingPolicy(other.to_string())),
        }
    }
}

fn best_fit(request: &AllocateRequest, agent: &AgentState) -> f64 {
    if request.is_zero_slot() {
        if agent.num_zero_slots() > 0 {
            return 1.0 / (1.0 + agent.num_empty_zero_slots() as f64);
        }
        return 0.0;
    }
    1.0 / (1.0 + agent.num_empty_slots() as f64)
}

fn worst_fit(request: &AllocateRequest, agent: &AgentState) -> f64 {
    if request.is_zero_slot() {
        if agent.num_zero_slots() == 0 {
            return 0.0;
        }
        return agent.num_empty_zero_slots() as f64 / agent.num_zero_slots() as f64;
    }
    if agent.num_slots() == 0 {
        return 0.0;
    }
    agent.num_empty_slots() as f64 / agent.num_slots() as f64
}

// =============================================================================
// Candidates
// =============================================================================

/// One placement candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct FittingState {
    pub agent_id: AgentId,
    pub score: f64,
    /// Distance between the request's and the agent's hashes; breaks score
    /// ties so zero-slot work spreads instead of piling onto one agent.
    pub hash_distance: u64,
    /// Slots to take from this agent.
    pub slots: usize,
}

impl FittingState {
    fn new(request: &AllocateRequest, agent: &AgentState, policy: FittingPolicy, slots: usize) -> Self {
        Self {
            agent_id: agent.id().clone(),
            score: policy.score(request, agent),
            hash_distance: hash_distance(request.allocation_id.as_str(), agent.id().as_str()),
            slots,
        }
    }
}

/// Higher score first, then closer hash, then agent ID.
fn compare_candidates(a: &FittingState, b: &FittingState) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.hash_distance.cmp(&b.hash_distance))
        .then_with(|| a.agent_id.cmp(&b.agent_id))
}

fn hash_u64(value: &str) -> u64 {
    let digest = Sha256::digest(value.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

pub fn hash_distance(allocation_id: &str, agent_id: &str) -> u64 {
    hash_u64(allocation_id).abs_diff(hash_u64(agent_id))
}

// =============================================================================
// Hard constraints
// =============================================================================

/// Whether the agent has room for the request.
pub fn slots_satisfied(request: &AllocateRequest, agent: &AgentState) -> bool {
    if request.is_zero_slot() {
        agent.num_empty_zero_slots() > 0
    } else {
        agent.num_empty_slots() >= request.slots_needed
    }
}

/// Whether the request may be placed on the agent at all.
pub fn is_allowed(request: &AllocateRequest, agent: &AgentState) -> bool {
    !request.blocked_nodes.contains(agent.id())
}

pub fn is_viable(request: &AllocateRequest, agent: &AgentState) -> bool {
    is_allowed(request, agent) && slots_satisfied(request, agent)
}

// =============================================================================
// Fitting
// =============================================================================

/// Finds where to place the request, or nothing if it cannot be placed now.
///
/// A non-empty result always covers exactly `slots_needed` slots.
pub fn find_fits<'a, I>(
    request: &AllocateRequest,
    agents: I,
    policy: FittingPolicy,
    allow_heterogeneous: bool,
) -> Vec<FittingState>
where
    I: IntoIterator<Item = &'a AgentState> + Clone,
{
    if let Some(fit) = find_shared_agent_fit(request, agents.clone(), policy) {
        return vec![fit];
    }
    if request.slots_needed <= 1 || request.single_agent {
        return Vec::new();
    }
    find_dedicated_agent_fits(request, agents, policy, allow_heterogeneous)
}

/// Best single agent with room for the whole request.
pub fn find_shared_agent_fit<'a, I>(
    request: &AllocateRequest,
    agents: I,
    policy: FittingPolicy,
) -> Option<FittingState>
where
    I: IntoIterator<Item = &'a AgentState>,
{
    agents
        .into_iter()
        .filter(|agent| is_viable(request, agent))
        .map(|agent| FittingState::new(request, agent, policy, request.slots_needed))
        .min_by(compare_candidates)
}

/// Spreads the request over otherwise idle agents.
///
/// Agents are grouped by their empty slot count. The largest group whose
/// capacity evenly divides the request wins, using the fewest agents. When
/// no such group exists and `allow_heterogeneous` is set, groups are
/// consumed greedily from largest to smallest; a partial match yields
/// nothing.
pub fn find_dedicated_agent_fits<'a, I>(
    request: &AllocateRequest,
    agents: I,
    policy: FittingPolicy,
    allow_heterogeneous: bool,
) -> Vec<FittingState>
where
    I: IntoIterator<Item = &'a AgentState>,
{
    if request.slots_needed == 0 {
        return Vec::new();
    }

    let mut by_capacity: BTreeMap<usize, Vec<FittingState>> = BTreeMap::new();
    for agent in agents {
        let empty = agent.num_empty_slots();
        if agent.num_used_slots() != 0 || empty == 0 || !is_allowed(request, agent) {
            continue;
        }
        by_capacity
            .entry(empty)
            .or_default()
            .push(FittingState::new(request, agent, policy, empty));
    }
    for candidates in by_capacity.values_mut() {
        candidates.sort_by(compare_candidates);
    }

    for (&capacity, candidates) in by_capacity.iter().rev() {
        if request.slots_needed % capacity != 0 {
            continue;
        }
        let needed = request.slots_needed / capacity;
        if candidates.len() >= needed {
            return candidates[..needed].to_vec();
        }
    }

    if !allow_heterogeneous {
        return Vec::new();
    }

    let mut remaining = request.slots_needed;
    let mut fits = Vec::new();
    for (&capacity, candidates) in by_capacity.iter().rev() {
        for candidate in candidates {
            if capacity > remaining {
                break;
            }
            fits.push(candidate.clone());
            remaining -= capacity;
        }
        if remaining == 0 {
            return fits;
        }
    }
    Vec::new()
}

/// Convenience for callers holding agents in a map.
pub fn find_fits_in(
    request: &AllocateRequest,
    agents: &HashMap<AgentId, AgentState>,
    policy: FittingPolicy,
    allow_heterogeneous: bool,
) -> Vec<FittingState> {
    find_fits(request, agents.values(), policy, allow_heterogeneous)
}
