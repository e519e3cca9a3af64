//! Strict priority scheduling with optional preemption and backfilling.
//!
//! Requests are tried in order of priority (lower number first), then queue
//! position, then arrival. Each pass works on a scratch copy of the agents:
//!
//! 1. Pending requests of a priority are placed wherever they fit.
//! 2. With preemption enabled, a request that does not fit may evict
//!    preemptible work of lower priority, or of equal priority queued
//!    behind it.
//! 3. Once some request could not be placed, lower priorities are only
//!    backfilled, and only with preemptible work that can be evicted again.
//!
//! Zero-slot and slot-consuming requests are scheduled independently.

use std::collections::{BTreeMap, HashMap, HashSet};

use berth_id::{AgentId, AllocationId, JobId};
use tracing::{debug, error, instrument};

use super::{
    add_task_to_agents, remove_task_from_agents, Decisions, Scheduler, SchedulerConfig,
    SchedulerError, SchedulerKind, SchedulerResult, SchedulingInput,
};
use crate::agent::AgentState;
use crate::fitting::{find_fits, FittingPolicy};
use crate::tasklist::{
    reduce_to_job_q_info, sort_tasks_with_position, AllocateRequest, Group, JobQueueInfo,
    JobSortState, SchedulingState, TaskList, TaskListError, TaskListResult,
    MAX_USER_SCHEDULING_PRIORITY, MIN_USER_SCHEDULING_PRIORITY,
};

type ByPriority<'a> = BTreeMap<i32, Vec<&'a AllocateRequest>>;

/// Which half of the requests a pass considers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotFilter {
    Slots,
    ZeroSlot,
}

impl SlotFilter {
    fn matches(self, req: &AllocateRequest) -> bool {
        req.is_zero_slot() == (self == Self::ZeroSlot)
    }
}

#[derive(Debug)]
pub struct PriorityScheduler {
    preemption: bool,
    allow_heterogeneous_fits: bool,
    default_priority: i32,
}

impl PriorityScheduler {
    pub fn new(config: &SchedulerConfig) -> SchedulerResult<Self> {
        let default_priority = config
            .default_priority
            .ok_or(SchedulerError::MissingDefaultPriority)?;
        if !(MIN_USER_SCHEDULING_PRIORITY..=MAX_USER_SCHEDULING_PRIORITY).contains(&default_priority) {
            return Err(SchedulerError::PriorityOutOfRange(default_priority));
        }
        Ok(Self {
            preemption: config.preemption,
            allow_heterogeneous_fits: config.allow_heterogeneous_fits,
            default_priority,
        })
    }

    pub fn default_priority(&self) -> i32 {
        self.default_priority
    }

    /// Groups with unset priorities resolved to the default.
    fn effective_groups(&self, groups: &HashMap<JobId, Group>) -> HashMap<JobId, Group> {
        groups
            .iter()
            .map(|(job_id, group)| {
                let mut group = group.clone();
                group.priority.get_or_insert(self.default_priority);
                (job_id.clone(), group)
            })
            .collect()
    }

    fn find_fits(
        &self,
        req: &AllocateRequest,
        agents: &HashMap<AgentId, AgentState>,
        policy: FittingPolicy,
    ) -> Vec<crate::fitting::FittingState> {
        find_fits(req, agents.values(), policy, self.allow_heterogeneous_fits)
    }

    fn schedule_with_filter(
        &self,
        input: &SchedulingInput<'_>,
        groups: &HashMap<JobId, Group>,
        filter: SlotFilter,
    ) -> TaskListResult<Decisions> {
        let (pending, scheduled) = split_by_priority(input.task_list, groups, input.positions, filter)?;
        let mut local = input.agents.clone();
        let mut decisions = Decisions::default();
        let mut released: HashSet<AllocationId> = HashSet::new();
        let mut backfilling = false;

        for (&priority, requests) in &pending {
            debug!(priority, pending = requests.len(), backfilling, "processing priority");
            let (placed, unplaced) = self.try_pending(requests, &mut local, input.fitting_policy);

            // Nothing starts while higher priority work is being evicted for.
            if released.is_empty() {
                if !backfilling {
                    decisions.to_allocate.extend(placed.iter().map(|req| (*req).clone()));
                } else if self.preemption {
                    for req in placed.iter().filter(|req| req.preemptible) {
                        debug!(allocation_id = %req.allocation_id, "backfilling");
                        let mut req = (*req).clone();
                        req.state = SchedulingState::ScheduledBackfilled;
                        decisions.to_allocate.push(req);
                    }
                }
            }

            if !unplaced.is_empty() {
                backfilling = true;
            }
            if !self.preemption {
                continue;
            }

            for req in unplaced {
                // Room freed by evictions already decided may suffice.
                let fits = self.find_fits(req, &local, input.fitting_policy);
                if !fits.is_empty() {
                    add_task_to_agents(&mut local, &fits);
                    continue;
                }

                let Some((updated, evicted)) = self.try_preemption(
                    input,
                    req,
                    priority,
                    &local,
                    &scheduled,
                    &released,
                    filter,
                ) else {
                    continue;
                };
                local = updated;
                for id in evicted {
                    debug!(victim = %id, allocation_id = %req.allocation_id, "preempting");
                    if released.insert(id.clone()) {
                        decisions.to_release.push(id);
                    }
                }
            }
        }

        Ok(decisions)
    }

    /// Places requests in order, occupying the scratch agents as it goes.
    fn try_pending<'a>(
        &self,
        requests: &[&'a AllocateRequest],
        agents: &mut HashMap<AgentId, AgentState>,
        policy: FittingPolicy,
    ) -> (Vec<&'a AllocateRequest>, Vec<&'a AllocateRequest>) {
        let mut placed = Vec::new();
        let mut unplaced = Vec::new();
        for &req in requests {
            let fits = self.find_fits(req, agents, policy);
            if fits.is_empty() {
                unplaced.push(req);
            } else {
                add_task_to_agents(agents, &fits);
                placed.push(req);
            }
        }
        (placed, unplaced)
    }

    /// Evicts scheduled work from the least important end until `req` fits.
    ///
    /// Candidates are walked from the lowest priority up to `priority`, and
    /// within a priority from the back of the queue. At `priority` itself
    /// only jobs queued behind `req` are eligible. Returns the new scratch
    /// state and the evicted allocations, or `None` if evicting every
    /// eligible candidate is still not enough.
    #[allow(clippy::too_many_arguments)]
    fn try_preemption(
        &self,
        input: &SchedulingInput<'_>,
        req: &AllocateRequest,
        priority: i32,
        agents: &HashMap<AgentId, AgentState>,
        scheduled: &ByPriority<'_>,
        already_released: &HashSet<AllocationId>,
        filter: SlotFilter,
    ) -> Option<(HashMap<AgentId, AgentState>, Vec<AllocationId>)> {
        let mut local = agents.clone();
        let mut evicted = Vec::new();
        let req_position = input.positions.position_or_head(&req.job_id);

        for (&candidate_priority, candidates) in scheduled.range(priority..).rev() {
            for candidate in candidates.iter().rev() {
                if candidate_priority == priority
                    && req_position >= input.positions.position_or_head(&candidate.job_id)
                {
                    break;
                }
                if !candidate.preemptible
                    || !filter.matches(candidate)
                    || already_released.contains(&candidate.allocation_id)
                {
                    continue;
                }
                let Some(allocated) = input.task_list.allocation(&candidate.allocation_id) else {
                    continue;
                };

                remove_task_from_agents(&mut local, allocated);
                evicted.push(candidate.allocation_id.clone());

                let fits = self.find_fits(req, &local, input.fitting_policy);
                if !fits.is_empty() {
                    add_task_to_agents(&mut local, &fits);
                    return Some((local, evicted));
                }
            }
        }
        None
    }
}

/// Splits matching requests into pending and scheduled lists per priority,
/// each in queue order.
pub(crate) fn split_by_priority<'a>(
    task_list: &'a TaskList,
    groups: &HashMap<JobId, Group>,
    positions: &JobSortState,
    filter: SlotFilter,
) -> TaskListResult<(ByPriority<'a>, ByPriority<'a>)> {
    let mut pending = ByPriority::new();
    let mut scheduled = ByPriority::new();

    for req in sort_tasks_with_position(task_list, groups, positions)? {
        if !filter.matches(req) {
            continue;
        }
        let priority = groups
            .get(&req.job_id)
            .and_then(|g| g.priority)
            .ok_or_else(|| TaskListError::MissingPriority(req.job_id.clone()))?;
        let lane = if task_list.is_scheduled(&req.allocation_id) {
            &mut scheduled
        } else {
            &mut pending
        };
        lane.entry(priority).or_default().push(req);
    }
    Ok((pending, scheduled))
}

impl Scheduler for PriorityScheduler {
    fn kind(&self) -> SchedulerKind {
        SchedulerKind::Priority
    }

    #[instrument(skip_all, fields(tasks = input.task_list.len(), agents = input.agents.len()))]
    fn schedule(&mut self, input: SchedulingInput<'_>) -> Decisions {
        let groups = self.effective_groups(input.groups);
        let mut decisions = Decisions::default();

        for filter in [SlotFilter::Slots, SlotFilter::ZeroSlot] {
            match self.schedule_with_filter(&input, &groups, filter) {
                Ok(pass) => {
                    decisions.to_allocate.extend(pass.to_allocate);
                    decisions.to_release.extend(pass.to_release);
                }
                Err(err) => {
                    error!(error = %err, "priority scheduling pass failed");
                    return Decisions::default();
                }
            }
        }
        decisions
    }

    fn job_q_info(
        &self,
        task_list: &TaskList,
        groups: &HashMap<JobId, Group>,
        positions: &JobSortState,
    ) -> HashMap<JobId, JobQueueInfo> {
        let groups = self.effective_groups(groups);
        match sort_tasks_with_position(task_list, &groups, positions) {
            Ok(sorted) => reduce_to_job_q_info(sorted),
            Err(err) => {
                error!(error = %err, "failed to order the job queue");
                HashMap::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::*;
    use crate::tasklist::{job_stats, QueuePosition};
    use chrono::{Duration as ChronoDuration, Utc};
    use tokio::time::Instant;

    const LOWEST: i32 = 55;
    const LOWER: i32 = 50;
    const MEDIUM: i32 = 45;
    const HIGHER: i32 = 40;

    fn scheduler(preemption: bool) -> PriorityScheduler {
        PriorityScheduler::new(&SchedulerConfig {
            preemption,
            ..SchedulerConfig::priority(42)
        })
        .unwrap()
    }

    fn run(p: &mut PriorityScheduler, states: &SchedulerStates, positions: &JobSortState) -> Decisions {
        p.schedule(SchedulingInput {
            task_list: &states.task_list,
            groups: &states.groups,
            positions,
            agents: &states.agents,
            fitting_policy: FittingPolicy::Best,
            now: Instant::now(),
        })
    }

    fn run_unpositioned(p: &mut PriorityScheduler, states: &SchedulerStates) -> Decisions {
        run(p, states, &JobSortState::new())
    }

    fn two_lanes() -> Vec<MockGroup> {
        vec![
            MockGroup::new("group1").priority(LOWER),
            MockGroup::new("group2").priority(HIGHER),
        ]
    }

    fn ids(reqs: &[&AllocateRequest]) -> Vec<String> {
        reqs.iter().map(|r| r.allocation_id.to_string()).collect()
    }

    fn assert_agents_untouched(states: &SchedulerStates, slots: usize) {
        for agent in states.agents.values() {
            assert_eq!(agent.num_empty_slots(), slots);
        }
    }

    #[test]
    fn test_split_by_priority_and_submission_time() {
        let now = Utc::now();
        let older = now - ChronoDuration::minutes(15);
        let groups = two_lanes();
        let tasks = [
            MockTask::new("task1", 4).group(0).submitted(now),
            MockTask::new("task2", 1).group(0).submitted(older),
            MockTask::new("task3", 0).group(1).submitted(now),
            MockTask::new("task4", 0).group(1).submitted(older),
            MockTask::new("task5", 4).group(1).submitted(now),
            MockTask::new("task6", 4).group(1).submitted(older),
        ];
        let mut states = setup_scheduler_states(&tasks, &groups, &[]);
        let positions = JobSortState::new();

        let (zero, _) = split_by_priority(&states.task_list, &states.groups, &positions, SlotFilter::ZeroSlot).unwrap();
        assert!(!zero.contains_key(&LOWER));
        assert_eq!(ids(&zero[&HIGHER]), ["task4", "task3"]);

        let (slots, _) = split_by_priority(&states.task_list, &states.groups, &positions, SlotFilter::Slots).unwrap();
        assert_eq!(ids(&slots[&LOWER]), ["task2", "task1"]);
        assert_eq!(ids(&slots[&HIGHER]), ["task6", "task5"]);

        force_set_task_allocation(&mut states.task_list, &AllocationId::from("task5"), "agent1");
        let (_, scheduled) = split_by_priority(&states.task_list, &states.groups, &positions, SlotFilter::Slots).unwrap();
        assert!(!scheduled.contains_key(&LOWER));
        assert_eq!(ids(&scheduled[&HIGHER]), ["task5"]);
    }

    #[test]
    fn test_max_zero_slot_containers_respected() {
        let agents = [MockAgent::new("agent1", 4)];
        let groups = two_lanes();
        let tasks = [MockTask::new("task1", 4).group(1), MockTask::new("task6", 0).group(0)];
        let states = setup_scheduler_states(&tasks, &groups, &agents);

        let decisions = run_unpositioned(&mut scheduler(true), &states);
        assert_to_allocate(&decisions.to_allocate, &[&tasks[0]]);
    }

    #[test]
    fn test_preemption_disabled() {
        let agents = [
            MockAgent::new("agent1", 4).max_zero(100),
            MockAgent::new("agent2", 4).max_zero(100),
        ];
        let groups = two_lanes();
        let tasks = [
            MockTask::new("task1", 4).group(0),
            MockTask::new("task2", 1).group(0),
            MockTask::new("task3", 1).group(1),
            MockTask::new("task4", 0).group(1),
            MockTask::new("task5", 4).group(1),
            MockTask::new("task6", 0).group(0),
        ];
        let states = setup_scheduler_states(&tasks, &groups, &agents);

        let decisions = run_unpositioned(&mut scheduler(false), &states);
        assert_to_allocate(&decisions.to_allocate, &[&tasks[1], &tasks[2], &tasks[3], &tasks[4], &tasks[5]]);
        assert_agents_untouched(&states, 4);
    }

    #[test]
    fn test_preemption_disabled_higher_priority_blocks_lower_priority() {
        let agents = [MockAgent::new("agent1", 4), MockAgent::new("agent2", 4)];
        let groups = two_lanes();
        let tasks = [
            MockTask::new("task1", 4).group(0),
            MockTask::new("task2", 1).group(0),
            MockTask::new("task3", 12).group(1),
        ];
        let states = setup_scheduler_states(&tasks, &groups, &agents);

        let decisions = run_unpositioned(&mut scheduler(false), &states);
        assert_to_allocate(&decisions.to_allocate, &[]);
        assert_agents_untouched(&states, 4);
    }

    #[test]
    fn test_preemption_disabled_add_tasks() {
        let agents = [
            MockAgent::new("agent1", 4).max_zero(100),
            MockAgent::new("agent2", 4).max_zero(100),
        ];
        let groups = two_lanes();
        let tasks = [
            MockTask::new("task1", 4).group(0),
            MockTask::new("task2", 1).group(0),
            MockTask::new("task3", 1).group(1),
            MockTask::new("task4", 0).group(1),
            MockTask::new("task5", 4).group(1),
            MockTask::new("task6", 0).group(0),
        ];
        let mut states = setup_scheduler_states(&tasks, &groups, &agents);
        let mut p = scheduler(false);

        let decisions = run_unpositioned(&mut p, &states);
        assert_to_allocate(&decisions.to_allocate, &[&tasks[1], &tasks[2], &tasks[3], &tasks[4], &tasks[5]]);
        assert_agents_untouched(&states, 4);
        allocate_tasks(&decisions.to_allocate, &mut states.agents, &mut states.task_list);

        let new_tasks = [
            MockTask::new("task7", 1).group(0),
            MockTask::new("task8", 1).group(0),
            MockTask::new("task9", 1).group(0),
        ];
        add_unallocated_tasks(&new_tasks, &groups, &mut states.task_list);

        let decisions = run_unpositioned(&mut p, &states);
        assert_to_allocate(&decisions.to_allocate, &[&new_tasks[0], &new_tasks[1]]);
    }

    #[test]
    fn test_preemption_disabled_all_slots_allocated() {
        let agents = [MockAgent::new("agent1", 4), MockAgent::new("agent2", 4)];
        let groups = two_lanes();
        let tasks = [
            MockTask::new("task1", 4).group(0),
            MockTask::new("task2", 1).group(0),
            MockTask::new("task3", 1).group(1),
            MockTask::new("task4", 1).group(1),
            MockTask::new("task5", 4).group(1),
            MockTask::new("task6", 1).group(0),
        ];
        let mut states = setup_scheduler_states(&tasks, &groups, &agents);
        let mut p = scheduler(false);

        let decisions = run_unpositioned(&mut p, &states);
        assert_to_allocate(&decisions.to_allocate, &[&tasks[1], &tasks[2], &tasks[3], &tasks[4], &tasks[5]]);
        assert_agents_untouched(&states, 4);
        allocate_tasks(&decisions.to_allocate, &mut states.agents, &mut states.task_list);

        let new_tasks = [MockTask::new("task7", 1).group(1), MockTask::new("task8", 1).group(1)];
        add_unallocated_tasks(&new_tasks, &groups, &mut states.task_list);

        let decisions = run_unpositioned(&mut p, &states);
        assert_to_allocate(&decisions.to_allocate, &[]);
    }

    #[test]
    fn test_preemption_disabled_lower_priority_must_wait() {
        let agents = [MockAgent::new("agent1", 4)];
        let groups = two_lanes();
        let tasks = [
            MockTask::new("task1", 1).group(0),
            MockTask::new("task2", 1).group(1),
            MockTask::new("task3", 1).group(1),
            MockTask::new("task4", 1).group(1),
            MockTask::new("task5", 2).group(1),
        ];
        let mut states = setup_scheduler_states(&tasks, &groups, &agents);
        let mut p = scheduler(false);

        let first = run_unpositioned(&mut p, &states);
        assert_to_allocate(&first.to_allocate, &[&tasks[1], &tasks[2], &tasks[3]]);
        assert_agents_untouched(&states, 4);
        allocate_tasks(&first.to_allocate, &mut states.agents, &mut states.task_list);

        let second = run_unpositioned(&mut p, &states);
        assert_to_allocate(&second.to_allocate, &[]);

        for req in &first.to_allocate {
            remove_task(&req.allocation_id, &mut states.agents, &mut states.task_list, true);
        }
        let third = run_unpositioned(&mut p, &states);
        assert_to_allocate(&third.to_allocate, &[&tasks[0], &tasks[4]]);
    }

    #[test]
    fn test_preemption_disabled_task_finished() {
        let agents = [MockAgent::new("agent1", 4).max_zero(100)];
        let groups = [MockGroup::new("group1").priority(HIGHER)];
        let tasks = [MockTask::new("task1", 4).group(0)];
        let mut states = setup_scheduler_states(&tasks, &groups, &agents);
        let mut p = scheduler(false);

        let decisions = run_unpositioned(&mut p, &states);
        assert_agents_untouched(&states, 4);
        allocate_tasks(&decisions.to_allocate, &mut states.agents, &mut states.task_list);
        remove_task(&decisions.to_allocate[0].allocation_id, &mut states.agents, &mut states.task_list, true);

        let new_tasks = [
            MockTask::new("task7", 1).group(0),
            MockTask::new("task8", 1).group(0),
            MockTask::new("task9", 0).group(0),
        ];
        add_unallocated_tasks(&new_tasks, &groups, &mut states.task_list);

        let decisions = run_unpositioned(&mut p, &states);
        assert_to_allocate(&decisions.to_allocate, &[&new_tasks[0], &new_tasks[1], &new_tasks[2]]);
    }

    #[test]
    fn test_preemption_disabled_all_tasks_finished() {
        let agents = [MockAgent::new("agent1", 4), MockAgent::new("agent2", 4)];
        let groups = two_lanes();
        let tasks = [
            MockTask::new("task1", 4).group(0),
            MockTask::new("task2", 1).group(0),
            MockTask::new("task3", 1).group(1),
            MockTask::new("task4", 1).group(1),
            MockTask::new("task5", 4).group(1),
            MockTask::new("task6", 1).group(0),
        ];
        let mut states = setup_scheduler_states(&tasks, &groups, &agents);
        let mut p = scheduler(false);

        let decisions = run_unpositioned(&mut p, &states);
        assert_to_allocate(&decisions.to_allocate, &[&tasks[1], &tasks[2], &tasks[3], &tasks[4], &tasks[5]]);
        allocate_tasks(&decisions.to_allocate, &mut states.agents, &mut states.task_list);

        let new_tasks = [MockTask::new("task7", 4).group(1)];
        add_unallocated_tasks(&new_tasks, &groups, &mut states.task_list);
        for req in &decisions.to_allocate {
            remove_task(&req.allocation_id, &mut states.agents, &mut states.task_list, true);
        }

        let decisions = run_unpositioned(&mut p, &states);
        assert_to_allocate(&decisions.to_allocate, &[&tasks[0], &new_tasks[0]]);
    }

    #[test]
    fn test_preemption_disabled_zero_slot_task() {
        let agents = [MockAgent::new("agent1", 4).max_zero(1)];
        let groups = two_lanes();
        let tasks = [MockTask::new("task1", 0).group(0), MockTask::new("task2", 0).group(0)];
        let mut states = setup_scheduler_states(&tasks, &groups, &agents);
        let mut p = scheduler(false);

        let decisions = run_unpositioned(&mut p, &states);
        assert_to_allocate(&decisions.to_allocate, &[&tasks[0]]);
        allocate_tasks(&decisions.to_allocate, &mut states.agents, &mut states.task_list);

        let new_tasks = [MockTask::new("task3", 0).group(1)];
        add_unallocated_tasks(&new_tasks, &groups, &mut states.task_list);

        let decisions = run_unpositioned(&mut p, &states);
        assert_to_allocate(&decisions.to_allocate, &[]);
        assert_to_release(&states.task_list, &decisions.to_release, &[]);
    }

    #[test]
    fn test_preemption() {
        let agents = [MockAgent::new("agent1", 4), MockAgent::new("agent2", 4)];
        let groups = [
            MockGroup::new("group1").priority(LOWER),
            MockGroup::new("group2").priority(MEDIUM),
            MockGroup::new("group3").priority(HIGHER),
        ];
        let tasks = [
            // Cannot be backfilled while preemption is underway.
            MockTask::new("low", 1).group(0),
            MockTask::new("medium-running", 4).group(1).on_agent(0).started(),
            MockTask::new("high-running", 4).group(2).on_agent(1).started(),
            MockTask::new("high-pending", 4).group(2),
            MockTask::new("high-oversized", 8).group(2),
        ];
        let states = setup_scheduler_states(&tasks, &groups, &agents);

        let decisions = run_unpositioned(&mut scheduler(true), &states);
        assert_to_allocate(&decisions.to_allocate, &[]);
        assert_to_release(&states.task_list, &decisions.to_release, &[&tasks[1]]);
    }

    #[test]
    fn test_backfilling() {
        let agents = [MockAgent::new("agent1", 4), MockAgent::new("agent2", 4)];
        let groups = [
            MockGroup::new("group1").priority(LOWEST),
            MockGroup::new("group2").priority(LOWER),
            MockGroup::new("group3").priority(MEDIUM),
            MockGroup::new("group4").priority(HIGHER),
        ];
        let tasks = [
            MockTask::new("lowest-running", 1).group(0).on_agent(0).started(),
            MockTask::new("lower-pending", 1).group(1),
            MockTask::new("medium-pending", 1).group(2),
            MockTask::new("high-running", 4).group(3).on_agent(1).started(),
            MockTask::new("high-pending", 2).group(3),
            MockTask::new("high-oversized", 8).group(3),
        ];
        let states = setup_scheduler_states(&tasks, &groups, &agents);

        let decisions = run_unpositioned(&mut scheduler(true), &states);
        assert_to_allocate(&decisions.to_allocate, &[&tasks[2], &tasks[4]]);
        assert_to_release(&states.task_list, &decisions.to_release, &[&tasks[0]]);

        let backfilled: Vec<_> = decisions
            .to_allocate
            .iter()
            .filter(|req| req.state == SchedulingState::ScheduledBackfilled)
            .map(|req| req.allocation_id.as_str())
            .collect();
        assert_eq!(backfilled, ["medium-pending"]);
    }

    #[test]
    fn test_preemption_zero_slot_task() {
        let agents = [MockAgent::new("agent1", 0).max_zero(1), MockAgent::new("agent2", 0).max_zero(1)];
        let groups = [
            MockGroup::new("group1").priority(LOWER),
            MockGroup::new("group2").priority(MEDIUM),
            MockGroup::new("group3").priority(HIGHER),
        ];
        let tasks = [
            MockTask::new("low", 0).group(0),
            MockTask::new("medium-running", 0).group(1).on_agent(0).started(),
            MockTask::new("high-running", 0).group(2).on_agent(1).started(),
            MockTask::new("high-pending", 0).group(2),
        ];
        let states = setup_scheduler_states(&tasks, &groups, &agents);

        let decisions = run_unpositioned(&mut scheduler(true), &states);
        assert_to_allocate(&decisions.to_allocate, &[]);
        assert_to_release(&states.task_list, &decisions.to_release, &[&tasks[1]]);
    }

    #[test]
    fn test_backfilling_zero_slot_task() {
        let agents = [MockAgent::new("agent1", 0).max_zero(4), MockAgent::new("agent2", 0).max_zero(1)];
        let groups = [
            MockGroup::new("group1").priority(LOWEST),
            MockGroup::new("group2").priority(LOWER),
            MockGroup::new("group3").priority(MEDIUM),
            MockGroup::new("group4").priority(HIGHER),
        ];
        let tasks = [
            MockTask::new("lowest-pending", 0).group(0),
            MockTask::new("lower-running", 0).group(1).on_agent(0).started(),
            MockTask::new("medium-running", 0).group(2).on_agent(1).started(),
            MockTask::new("medium-pending", 0).group(2),
        ];
        let states = setup_scheduler_states(&tasks, &groups, &agents);

        let decisions = run_unpositioned(&mut scheduler(true), &states);
        assert_to_allocate(&decisions.to_allocate, &[&tasks[0], &tasks[3]]);
        assert_to_release(&states.task_list, &decisions.to_release, &[]);
    }

    fn positions(entries: &[(&str, &str)]) -> JobSortState {
        entries
            .iter()
            .map(|(job, pos)| (JobId::from(*job), pos.parse::<QueuePosition>().unwrap()))
            .collect()
    }

    fn same_priority_jobs(pending_slots: usize) -> (Vec<MockTask>, Vec<MockGroup>, Vec<MockAgent>) {
        let agents = vec![MockAgent::new("agent1", 4), MockAgent::new("agent2", 4)];
        let groups = vec![
            MockGroup::new("1").priority(42),
            MockGroup::new("2").priority(42),
            MockGroup::new("3").priority(42),
        ];
        let tasks = vec![
            MockTask::new("1", 1).job("1").group(0).on_agent(0).started(),
            MockTask::new("2", 4).job("2").group(1).on_agent(1).started(),
            MockTask::new("3", pending_slots).job("3").group(2),
        ];
        (tasks, groups, agents)
    }

    #[test]
    fn test_preempts_one_job_queued_behind() {
        let (tasks, groups, agents) = same_priority_jobs(4);
        let states = setup_scheduler_states(&tasks, &groups, &agents);
        let mut p = scheduler(true);

        let decisions = run(&mut p, &states, &positions(&[("1", "1"), ("2", "2"), ("3", "1.5")]));
        assert_to_allocate(&decisions.to_allocate, &[]);
        assert_to_release(&states.task_list, &decisions.to_release, &[&tasks[1]]);

        // Even when queued ahead of both, only one job is evicted.
        let decisions = run(&mut p, &states, &positions(&[("1", "1"), ("2", "1"), ("3", "0.999")]));
        assert_to_allocate(&decisions.to_allocate, &[]);
        assert_to_release(&states.task_list, &decisions.to_release, &[&tasks[1]]);
    }

    #[test]
    fn test_no_preemption_of_jobs_queued_ahead() {
        let (tasks, groups, agents) = same_priority_jobs(8);
        let states = setup_scheduler_states(&tasks, &groups, &agents);

        let decisions = run(
            &mut scheduler(true),
            &states,
            &positions(&[("1", "1"), ("2", "2"), ("3", "1.5")]),
        );
        assert_to_allocate(&decisions.to_allocate, &[]);
        assert_to_release(&states.task_list, &decisions.to_release, &[]);
    }

    #[test]
    fn test_groups_without_priority_use_default() {
        let agents = [MockAgent::new("agent1", 1)];
        let groups = [MockGroup::new("urgent").priority(10), MockGroup::new("plain")];
        let tasks = [MockTask::new("plain-task", 1).group(1), MockTask::new("urgent-task", 1).group(0)];
        let states = setup_scheduler_states(&tasks, &groups, &agents);

        let decisions = run_unpositioned(&mut scheduler(false), &states);
        assert_to_allocate(&decisions.to_allocate, &[&tasks[1]]);
    }

    fn stats_fixture() -> (Vec<MockGroup>, Vec<MockAgent>) {
        let agents = vec![MockAgent::new("agent1", 1).max_zero(1)];
        let groups = vec![
            MockGroup::new("job1").priority(LOWER).weight(0.5),
            MockGroup::new("job2").priority(HIGHER).weight(1.0),
            MockGroup::new("job3").priority(LOWER).weight(0.0),
            MockGroup::new("job4").priority(LOWER).weight(0.0),
        ];
        (groups, agents)
    }

    fn schedule_allocate_twice(tasks: &[MockTask], groups: &[MockGroup], agents: &[MockAgent]) -> TaskList {
        let mut states = setup_scheduler_states(tasks, groups, agents);
        let mut p = scheduler(false);
        let decisions = run_unpositioned(&mut p, &states);
        allocate_tasks(&decisions.to_allocate, &mut states.agents, &mut states.task_list);
        run_unpositioned(&mut p, &states);
        states.task_list
    }

    #[test]
    fn test_job_stats() {
        let (groups, agents) = stats_fixture();
        let tasks = [
            MockTask::new("task1", 1).job("job1"),
            MockTask::new("task2", 1).job("job2"),
            MockTask::new("task3", 0).job("job3"),
            MockTask::new("task4", 0).job("job4"),
        ];
        let stats = job_stats(&schedule_allocate_twice(&tasks, &groups, &agents));
        assert_eq!((stats.queued_count, stats.scheduled_count), (2, 2));

        let tasks = [
            MockTask::new("task1.1", 2).job("job1"),
            MockTask::new("task1.2", 2).job("job1"),
            MockTask::new("task1.3", 2).job("job1"),
            MockTask::new("task2", 2).job("job2"),
            MockTask::new("task3", 2).job("job3"),
            MockTask::new("task4", 2).job("job4"),
        ];
        let stats = job_stats(&schedule_allocate_twice(&tasks, &groups, &agents));
        assert_eq!((stats.queued_count, stats.scheduled_count), (4, 0));
    }

    #[test]
    fn test_job_order() {
        let (groups, agents) = stats_fixture();
        let tasks = [
            MockTask::new("task1", 1).job("job1"),
            MockTask::new("task1.1", 1).job("job1"),
            MockTask::new("task2", 1).job("job2"),
            MockTask::new("task3", 1).job("job3"),
            MockTask::new("task4", 1).job("job4"),
            MockTask::new("task4.1", 0).job("job4"),
        ];
        let mut states = setup_scheduler_states(&tasks, &groups, &agents);
        let mut p = scheduler(false);
        let decisions = run_unpositioned(&mut p, &states);
        allocate_tasks(&decisions.to_allocate, &mut states.agents, &mut states.task_list);

        let info = p.job_q_info(&states.task_list, &states.groups, &JobSortState::new());
        assert_eq!(info.len(), 4);
        let job2 = &info[&JobId::from("job2")];
        assert_eq!(job2.state, SchedulingState::Scheduled);
        assert_eq!((job2.jobs_ahead, job2.allocated_slots, job2.requested_slots), (0, 1, 1));
        let job1 = &info[&JobId::from("job1")];
        assert_eq!(job1.state, SchedulingState::Queued);
        assert_eq!((job1.jobs_ahead, job1.allocated_slots), (1, 0));
        assert_eq!(info[&JobId::from("job3")].jobs_ahead, 2);
        assert_eq!(info[&JobId::from("job4")].jobs_ahead, 3);
    }

    #[test]
    fn test_job_order_follows_priority() {
        let agents = [MockAgent::new("agent1", 1).max_zero(1)];
        let groups = [
            MockGroup::new("job1").priority(LOWER).weight(0.5),
            MockGroup::new("job2").priority(HIGHER),
        ];
        let tasks = [MockTask::new("task1", 1).job("job1"), MockTask::new("task1.1", 1).job("job1")];
        let mut states = setup_scheduler_states(&tasks, &groups, &agents);
        let mut p = scheduler(false);

        let decisions = run_unpositioned(&mut p, &states);
        allocate_tasks(&decisions.to_allocate, &mut states.agents, &mut states.task_list);
        let info = p.job_q_info(&states.task_list, &states.groups, &JobSortState::new());
        assert_eq!(info.len(), 1);
        let job1 = &info[&JobId::from("job1")];
        assert_eq!((job1.state, job1.allocated_slots, job1.jobs_ahead), (SchedulingState::Scheduled, 1, 0));

        add_unallocated_tasks(&[MockTask::new("task2", 1).job("job2")], &groups, &mut states.task_list);
        let decisions = run_unpositioned(&mut p, &states);
        assert!(decisions.to_release.is_empty());
        allocate_tasks(&decisions.to_allocate, &mut states.agents, &mut states.task_list);

        let info = p.job_q_info(&states.task_list, &states.groups, &JobSortState::new());
        assert_eq!(info.len(), 2);
        let job1 = &info[&JobId::from("job1")];
        assert_eq!((job1.state, job1.allocated_slots, job1.jobs_ahead), (SchedulingState::Scheduled, 1, 1));
        let job2 = &info[&JobId::from("job2")];
        assert_eq!((job2.state, job2.allocated_slots, job2.jobs_ahead), (SchedulingState::Queued, 0, 0));
    }

    #[test]
    fn test_new_rejects_bad_default_priority() {
        assert_eq!(
            PriorityScheduler::new(&SchedulerConfig::priority(0)).unwrap_err(),
            SchedulerError::PriorityOutOfRange(0)
        );
        assert_eq!(scheduler(false).default_priority(), 42);
    }
}
