//! Scheduler test fixtures: mock agents, groups and tasks turned into a
//! task list, a group map and agent states.

use std::collections::{HashMap, HashSet};

use berth_events::{Device, DeviceType, ResourceGrant, ResourcesAllocated};
use berth_id::{AgentId, AllocationId, ContainerId, JobId, ResourcesId};
use chrono::{DateTime, Utc};

use crate::agent::AgentState;
use crate::fitting::{find_fits, FittingPolicy};
use crate::tasklist::{AllocateRequest, Group, TaskList};

#[derive(Debug, Clone)]
pub(crate) struct MockAgent {
    pub id: &'static str,
    pub slots: usize,
    pub max_zero: usize,
}

impl MockAgent {
    pub fn new(id: &'static str, slots: usize) -> Self {
        Self { id, slots, max_zero: 0 }
    }

    pub fn max_zero(mut self, max_zero: usize) -> Self {
        self.max_zero = max_zero;
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockGroup {
    pub id: &'static str,
    pub priority: Option<i32>,
    pub weight: f64,
    pub max_slots: Option<usize>,
}

impl MockGroup {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            priority: None,
            weight: 1.0,
            max_slots: None,
        }
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn max_slots(mut self, max_slots: usize) -> Self {
        self.max_slots = Some(max_slots);
        self
    }
}

#[derive(Debug, Clone)]
pub(crate) struct MockTask {
    pub id: &'static str,
    pub job_id: Option<&'static str>,
    /// Index into the mock groups.
    pub group: Option<usize>,
    pub slots: usize,
    /// Index into the mock agents.
    pub allocated_agent: Option<usize>,
    pub container_started: bool,
    pub non_preemptible: bool,
    pub submitted: Option<DateTime<Utc>>,
}

impl MockTask {
    pub fn new(id: &'static str, slots: usize) -> Self {
        Self {
            id,
            job_id: None,
            group: None,
            slots,
            allocated_agent: None,
            container_started: false,
            non_preemptible: false,
            submitted: None,
        }
    }

    pub fn job(mut self, job_id: &'static str) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn group(mut self, index: usize) -> Self {
        self.group = Some(index);
        self
    }

    pub fn on_agent(mut self, index: usize) -> Self {
        self.allocated_agent = Some(index);
        self
    }

    pub fn started(mut self) -> Self {
        self.container_started = true;
        self
    }

    pub fn non_preemptible(mut self) -> Self {
        self.non_preemptible = true;
        self
    }

    pub fn submitted(mut self, at: DateTime<Utc>) -> Self {
        self.submitted = Some(at);
        self
    }
}

pub(crate) struct SchedulerStates {
    pub task_list: TaskList,
    pub groups: HashMap<JobId, Group>,
    pub agents: HashMap<AgentId, AgentState>,
}

pub(crate) fn agent_state(agent: &MockAgent) -> AgentState {
    let devices: Vec<Device> = (0..agent.slots as u32)
        .map(|i| Device::new(i, DeviceType::Cuda, format!("GPU-{}-{i}", agent.id)))
        .collect();
    AgentState::with_devices(AgentId::from(agent.id), "default", agent.max_zero, &devices)
}

fn job_of(task: &MockTask, groups: &[MockGroup]) -> JobId {
    match (task.job_id, task.group) {
        (Some(job), _) => JobId::from(job),
        (None, Some(group)) => JobId::from(groups[group].id),
        (None, None) => JobId::from(task.id),
    }
}

pub(crate) fn to_request(task: &MockTask, groups: &[MockGroup]) -> AllocateRequest {
    let mut req = AllocateRequest::new(AllocationId::from(task.id), job_of(task, groups), task.slots)
        .with_name(task.id);
    if let Some(at) = task.submitted {
        req = req.with_submission_time(at);
    }
    if task.non_preemptible {
        req = req.non_preemptible();
    }
    req
}

/// Builds scheduler inputs. Tasks with an allocated agent get an allocation;
/// if their container started, its slots are taken on the agent.
pub(crate) fn setup_scheduler_states(
    tasks: &[MockTask],
    groups: &[MockGroup],
    agents: &[MockAgent],
) -> SchedulerStates {
    let mut agent_states: HashMap<AgentId, AgentState> = agents
        .iter()
        .map(|a| (AgentId::from(a.id), agent_state(a)))
        .collect();

    let mut group_map: HashMap<JobId, Group> = HashMap::new();
    for (seq, mock) in groups.iter().enumerate() {
        let job_id = JobId::from(mock.id);
        let mut group = Group::new(job_id.clone(), seq as u64);
        group.priority = mock.priority;
        group.weight = mock.weight;
        group.max_slots = mock.max_slots;
        group_map.insert(job_id, group);
    }

    let mut task_list = TaskList::new();
    for task in tasks {
        let req = to_request(task, groups);
        let job_id = req.job_id.clone();
        if !group_map.contains_key(&job_id) {
            let seq = group_map.len() as u64;
            group_map.insert(job_id.clone(), Group::new(job_id, seq));
        }
        let allocation_id = req.allocation_id.clone();
        let submitted = req.job_submission_time;
        task_list.add_task(req);

        let Some(agent_index) = task.allocated_agent else {
            continue;
        };
        let agent_id = AgentId::from(agents[agent_index].id);
        let container_id = ContainerId::new();
        let devices = if task.container_started {
            agent_states
                .get_mut(&agent_id)
                .expect("allocated agent is mocked")
                .allocate_free_devices(task.slots, container_id.clone())
                .expect("over allocated to agent")
        } else {
            Vec::new()
        };
        let allocated = ResourcesAllocated {
            allocation_id: allocation_id.clone(),
            resource_pool: "default".to_string(),
            resources: vec![ResourceGrant {
                resources_id: ResourcesId::from(container_id.as_str()),
                agent_id,
                container_id,
                devices,
                started: task.container_started,
            }],
            job_submission_time: submitted,
            allocated_at: Utc::now(),
            recovered: false,
        };
        task_list.add_allocation(&allocation_id, Some(allocated));
    }

    SchedulerStates {
        task_list,
        groups: group_map,
        agents: agent_states,
    }
}

/// Places each request for real, the way a pool would.
pub(crate) fn allocate_tasks(
    to_allocate: &[AllocateRequest],
    agents: &mut HashMap<AgentId, AgentState>,
    task_list: &mut TaskList,
) {
    for req in to_allocate {
        let fits = find_fits(req, agents.values(), FittingPolicy::Best, false);
        if fits.is_empty() {
            continue;
        }
        let mut resources = Vec::new();
        for fit in fits {
            let container_id = ContainerId::new();
            let devices = agents
                .get_mut(&fit.agent_id)
                .expect("fit agent exists")
                .allocate_free_devices(fit.slots, container_id.clone())
                .expect("fit has room");
            resources.push(ResourceGrant {
                resources_id: ResourcesId::from(container_id.as_str()),
                agent_id: fit.agent_id,
                container_id,
                devices,
                started: false,
            });
        }
        let allocated = ResourcesAllocated {
            allocation_id: req.allocation_id.clone(),
            resource_pool: "default".to_string(),
            resources,
            job_submission_time: req.job_submission_time,
            allocated_at: Utc::now(),
            recovered: false,
        };
        task_list.add_allocation(&req.allocation_id, Some(allocated));
    }
}

pub(crate) fn add_unallocated_tasks(tasks: &[MockTask], groups: &[MockGroup], task_list: &mut TaskList) {
    for task in tasks {
        assert!(task_list.add_task(to_request(task, groups)));
    }
}

/// Frees a task's devices and drops it (or only its allocation).
pub(crate) fn remove_task(
    allocation_id: &AllocationId,
    agents: &mut HashMap<AgentId, AgentState>,
    task_list: &mut TaskList,
    delete: bool,
) {
    if let Some(allocated) = task_list.allocation(allocation_id) {
        for grant in &allocated.resources {
            if let Some(agent) = agents.get_mut(&grant.agent_id) {
                agent.deallocate_container(&grant.container_id);
            }
        }
    }
    if delete {
        task_list.remove_task_by_id(allocation_id);
    } else {
        task_list.remove_allocation(allocation_id);
    }
}

fn id_set<'a>(ids: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    ids.into_iter().map(str::to_string).collect()
}

pub(crate) fn assert_to_allocate(actual: &[AllocateRequest], expected: &[&MockTask]) {
    let actual_ids: Vec<&str> = actual.iter().map(|r| r.allocation_id.as_str()).collect();
    assert_eq!(
        actual.len(),
        expected.len(),
        "allocated {actual_ids:?}, expected {:?}",
        expected.iter().map(|t| t.id).collect::<Vec<_>>()
    );
    assert_eq!(id_set(actual_ids), id_set(expected.iter().map(|t| t.id)));
}

pub(crate) fn assert_to_release(task_list: &TaskList, actual: &[AllocationId], expected: &[&MockTask]) {
    for id in actual {
        assert!(task_list.task_by_id(id).is_some(), "released unknown task {id}");
    }
    assert_eq!(
        actual.len(),
        expected.len(),
        "released {actual:?}, expected {:?}",
        expected.iter().map(|t| t.id).collect::<Vec<_>>()
    );
    assert_eq!(
        id_set(actual.iter().map(|id| id.as_str())),
        id_set(expected.iter().map(|t| t.id))
    );
}

/// Marks a request allocated on `agent` without taking any devices, like an
/// allocation whose containers have not started yet.
pub(crate) fn force_set_task_allocation(task_list: &mut TaskList, allocation_id: &AllocationId, agent: &str) {
    let submitted = task_list
        .task_by_id(allocation_id)
        .map(|req| req.job_submission_time)
        .expect("task is registered");
    let container_id = ContainerId::new();
    let allocated = ResourcesAllocated {
        allocation_id: allocation_id.clone(),
        resource_pool: "default".to_string(),
        resources: vec![ResourceGrant {
            resources_id: ResourcesId::from(container_id.as_str()),
            agent_id: AgentId::from(agent),
            container_id,
            devices: Vec::new(),
            started: false,
        }],
        job_submission_time: submitted,
        allocated_at: Utc::now(),
        recovered: false,
    };
    task_list.add_allocation(allocation_id, Some(allocated));
}
