//! Max-min fair sharing of slots between groups.
//!
//! Each pass offers every group a slot budget by progressive filling, then
//! starts pending requests that fit inside their group's offer and releases
//! allocations from groups holding more than theirs.

use std::collections::HashMap;
use std::time::Duration;

use berth_id::{AgentId, AllocationId, JobId};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Decisions, Scheduler, SchedulerConfig, SchedulerKind, SchedulingInput};
use crate::agent::AgentState;
use crate::fitting::{find_fits, FittingPolicy};
use crate::tasklist::{
    reduce_to_job_q_info, AllocateRequest, Group, JobQueueInfo, JobSortState, TaskList,
};

#[derive(Debug)]
pub struct FairShareScheduler {
    allocation_timeout: Option<Duration>,
    allow_heterogeneous_fits: bool,
    /// When each request was first seen pending.
    first_seen: HashMap<AllocationId, Instant>,
}

/// Per-group bookkeeping for one pass.
#[derive(Debug, Clone)]
pub(crate) struct GroupState {
    pub job_id: JobId,
    pub weight: f64,
    pub registered_seq: u64,
    pub disabled: bool,
    /// Slots needed to run every request of the group, capped at max slots.
    pub slot_demand: usize,
    /// Slots held by allocated requests.
    pub active_slots: usize,
    /// Slots held by allocated requests that cannot be preempted.
    pub presubscribed_slots: usize,
    pub offered: usize,
    pub pending: Vec<AllocationId>,
    pub pending_slots: Vec<usize>,
    pub allocated: Vec<AllocationId>,
}

impl GroupState {
    fn new(group: &Group) -> Self {
        Self {
            job_id: group.job_id.clone(),
            weight: group.weight,
            registered_seq: group.registered_seq,
            disabled: false,
            slot_demand: 0,
            active_slots: 0,
            presubscribed_slots: 0,
            offered: 0,
            pending: Vec::new(),
            pending_slots: Vec::new(),
            allocated: Vec::new(),
        }
    }

    fn is_satisfied(&self) -> bool {
        self.offered >= self.slot_demand
    }

    fn is_open(&self) -> bool {
        !self.disabled && !self.is_satisfied()
    }

    /// Caps demand at the group's max slots. Non-preemptible slots beyond the
    /// cap are not preoffered, so the group never gets more than the cap.
    fn apply_max_slots(&mut self, max_slots: Option<usize>) {
        if let Some(max_slots) = max_slots {
            self.slot_demand = self.slot_demand.min(max_slots);
            self.presubscribed_slots = self.presubscribed_slots.min(self.slot_demand);
        }
    }
}

impl FairShareScheduler {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            allocation_timeout: config.allocation_timeout(),
            allow_heterogeneous_fits: config.allow_heterogeneous_fits,
            first_seen: HashMap::new(),
        }
    }

    fn fits(&self, req: &AllocateRequest, agents: &HashMap<AgentId, AgentState>, policy: FittingPolicy) -> bool {
        !find_fits(req, agents.values(), policy, self.allow_heterogeneous_fits).is_empty()
    }

    /// An allocation whose containers never started within the timeout.
    fn timed_out(&self, task_list: &TaskList, id: &AllocationId, now: Instant) -> bool {
        let Some(timeout) = self.allocation_timeout else {
            return false;
        };
        let Some(allocated) = task_list.allocation(id) else {
            return false;
        };
        if allocated.any_started() {
            return false;
        }
        self.first_seen
            .get(id)
            .is_some_and(|seen| now.saturating_duration_since(*seen) > timeout)
    }

    fn calculate_group_states(
        &mut self,
        task_list: &TaskList,
        groups: &HashMap<JobId, Group>,
        capacity: usize,
        now: Instant,
    ) -> Vec<GroupState> {
        let mut states: Vec<GroupState> = Vec::new();
        let mut index: HashMap<JobId, usize> = HashMap::new();

        for req in task_list.iter() {
            if req.slots_needed == 0 || req.slots_needed > capacity {
                continue;
            }
            let Some(group) = groups.get(&req.job_id) else {
                warn!(allocation_id = %req.allocation_id, job_id = %req.job_id, "request has no group");
                continue;
            };
            let i = *index.entry(req.job_id.clone()).or_insert_with(|| {
                states.push(GroupState::new(group));
                states.len() - 1
            });
            let state = &mut states[i];

            state.slot_demand += req.slots_needed;
            if task_list.is_scheduled(&req.allocation_id) {
                if !req.preemptible {
                    state.presubscribed_slots += req.slots_needed;
                }
                state.active_slots += req.slots_needed;
                state.allocated.push(req.allocation_id.clone());
            } else {
                self.first_seen.entry(req.allocation_id.clone()).or_insert(now);
                state.pending.push(req.allocation_id.clone());
                state.pending_slots.push(req.slots_needed);
            }
        }

        for state in &mut states {
            state.apply_max_slots(groups.get(&state.job_id).and_then(|g| g.max_slots));
        }
        states
    }

    fn assign_tasks(
        &mut self,
        input: &SchedulingInput<'_>,
        states: &mut [GroupState],
        decisions: &mut Decisions,
    ) {
        for state in states.iter_mut() {
            if state.active_slots > state.offered {
                for id in &state.allocated {
                    let releasable = input
                        .task_list
                        .task_by_id(id)
                        .is_some_and(|req| req.preemptible)
                        || self.timed_out(input.task_list, id, input.now);
                    if !releasable {
                        continue;
                    }
                    let slots = input.task_list.task_by_id(id).map_or(0, |req| req.slots_needed);
                    decisions.to_release.push(id.clone());
                    self.first_seen.remove(id);
                    state.active_slots = state.active_slots.saturating_sub(slots);
                    if state.active_slots <= state.offered {
                        break;
                    }
                }
            } else if state.active_slots < state.offered {
                // Released slots are not free until the next pass, so a group
                // never starts and stops work in the same pass.
                state.offered -= state.active_slots;
                for id in &state.pending {
                    let Some(req) = input.task_list.task_by_id(id) else {
                        continue;
                    };
                    if req.slots_needed > state.offered {
                        continue;
                    }
                    if !self.fits(req, input.agents, input.fitting_policy) {
                        continue;
                    }
                    decisions.to_allocate.push(req.clone());
                    state.offered -= req.slots_needed;
                }
            }
        }
    }
}

fn total_capacity(agents: &HashMap<AgentId, AgentState>) -> usize {
    agents.values().map(AgentState::num_slots).sum()
}

fn open_weight(states: &[GroupState]) -> f64 {
    states.iter().filter(|s| s.is_open()).map(|s| s.weight).sum()
}

/// Consumes outstanding preoffers from a fresh offer.
fn account_for_preoffers(preoffers: usize, offer: usize) -> (usize, usize) {
    if preoffers >= offer {
        (preoffers - offer, 0)
    } else {
        (0, offer - preoffers)
    }
}

/// Progressive filling over the groups' slot demands.
///
/// Groups are sorted by ascending demand, then seniority. Every round each
/// open group receives its weighted share of the capacity left at the start
/// of the round, at least one slot. When capacity runs out while some group
/// cannot afford its smallest pending request, the newest such group is
/// disabled and its offer returned.
pub(crate) fn allocate_slot_offers(states: &mut [GroupState], mut capacity: usize) {
    let mut preoffers = vec![0usize; states.len()];

    states.sort_by(|a, b| {
        a.slot_demand
            .cmp(&b.slot_demand)
            .then(a.registered_seq.cmp(&b.registered_seq))
    });

    for (i, state) in states.iter_mut().enumerate() {
        if state.presubscribed_slots == 0 {
            continue;
        }
        state.offered = state.presubscribed_slots;
        preoffers[i] = state.presubscribed_slots;
        capacity = capacity.saturating_sub(state.presubscribed_slots);
        debug!(job_id = %state.job_id, slots = state.presubscribed_slots, "preoffering slots");
    }

    let mut newest_first: Vec<usize> = (0..states.len()).collect();
    newest_first.sort_by(|&a, &b| states[b].registered_seq.cmp(&states[a].registered_seq));

    let mut total_weight = open_weight(states);

    while states.iter().any(GroupState::is_open) {
        let mut progress = false;
        let start_capacity = capacity;

        for i in 0..states.len() {
            if !states[i].is_open() {
                continue;
            }
            let share = if total_weight > 0.0 {
                ((start_capacity as f64 * states[i].weight / total_weight) as usize).max(1)
            } else {
                1
            };
            let state = &mut states[i];
            let offer = share
                .min(capacity)
                .min(state.slot_demand - state.offered);
            let (remaining, offer) = account_for_preoffers(preoffers[i], offer);
            preoffers[i] = remaining;
            state.offered += offer;
            capacity -= offer;
            progress = true;

            if state.is_satisfied() {
                total_weight = open_weight(states);
            }
        }

        if capacity == 0 {
            let starved = newest_first.iter().copied().find(|&i| {
                let state = &states[i];
                state.is_open() && smallest_pending(state).is_some_and(|slots| slots > state.offered)
            });
            let Some(i) = starved else {
                return;
            };
            debug!(job_id = %states[i].job_id, offered = states[i].offered, "disabling group to break deadlock");
            capacity += states[i].offered;
            states[i].offered = 0;
            states[i].disabled = true;
            total_weight = open_weight(states);
        } else if !progress {
            return;
        }
    }
}

fn smallest_pending(state: &GroupState) -> Option<usize> {
    state.pending_slots.iter().copied().min()
}

impl Scheduler for FairShareScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::FairShare
    }

    fn schedule(&mut self, input: SchedulingInput<'_>) -> Decisions {
        debug!(
            tasks = input.task_list.len(),
            groups = input.groups.len(),
            agents = input.agents.len(),
            "fair share pass"
        );
        let mut decisions = Decisions::default();

        for req in input.task_list.iter() {
            if req.slots_needed == 0
                && !input.task_list.is_scheduled(&req.allocation_id)
                && self.fits(req, input.agents, input.fitting_policy)
            {
                decisions.to_allocate.push(req.clone());
            }
        }

        self.first_seen
            .retain(|id, _| input.task_list.task_by_id(id).is_some());

        let capacity = total_capacity(input.agents);
        let mut states = self.calculate_group_states(input.task_list, input.groups, capacity, input.now);
        allocate_slot_offers(&mut states, capacity);
        self.assign_tasks(&input, &mut states, &mut decisions);
        decisions
    }

    fn job_q_info(
        &self,
        task_list: &TaskList,
        _groups: &HashMap<JobId, Group>,
        _positions: &JobSortState,
    ) -> HashMap<JobId, JobQueueInfo> {
        let mut jobs = reduce_to_job_q_info(task_list.iter());
        for info in jobs.values_mut() {
            info.jobs_ahead = -1;
        }
        jobs
    }
}
