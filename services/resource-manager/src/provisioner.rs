//! Provisioner feedback.
//!
//! A pool with a provisioner reports how many new instances it wants after
//! each scheduling pass, and asks the provisioner how much capacity it can
//! still bring up when deciding whether queued requests are hopeless.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Mutex;

use berth_events::{AgentIdleState, ScalingInfo};
use berth_id::{AgentId, JobId};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::agent::AgentState;
use crate::tasklist::{Group, TaskList};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProvisionerError {
    #[error("provisioner unavailable: {0}")]
    Unavailable(String),
}

pub type ProvisionerResult<T> = Result<T, ProvisionerError>;

/// The autoscaler behind a pool.
pub trait Provisioner: Send + Sync + Debug {
    /// Slots of one instance.
    fn slots_per_instance(&self) -> usize;

    fn max_instances(&self) -> usize;

    /// Slots of every instance the provisioner currently runs or is launching.
    fn current_slot_count(&self) -> ProvisionerResult<usize>;

    /// Sticky launch failure; `None` while instances launch normally.
    fn launch_error(&self) -> Option<String>;

    fn update_scaling_info(&self, info: &ScalingInfo);
}

// =============================================================================
// Demand
// =============================================================================

/// New instances needed to place every unscheduled request.
///
/// Slot demand is summed per group, capped by the group's max slots, and
/// divided by the slots of one instance. Zero-slot requests are divided by
/// the auxiliary containers one agent can hold. The larger count wins.
pub fn desired_new_instances(
    task_list: &TaskList,
    groups: &HashMap<JobId, Group>,
    slots_per_instance: usize,
    max_zero_slot_containers_per_agent: usize,
) -> usize {
    let mut zero_slot_requests: usize = 0;
    let mut group_demand: HashMap<&JobId, usize> = HashMap::new();
    for req in task_list.iter() {
        if task_list.is_scheduled(&req.allocation_id) {
            continue;
        }
        if req.is_zero_slot() {
            zero_slot_requests += 1;
        } else {
            *group_demand.entry(&req.job_id).or_default() += req.slots_needed;
        }
    }

    let slot_demand: usize = group_demand
        .into_iter()
        .map(|(job_id, demand)| match groups.get(job_id).and_then(|g| g.max_slots) {
            Some(max) => demand.min(max),
            None => demand,
        })
        .sum();

    let by_zero_slot = if zero_slot_requests == 0 || max_zero_slot_containers_per_agent == 0 {
        0
    } else {
        zero_slot_requests.div_ceil(max_zero_slot_containers_per_agent)
    };
    let by_slots = if slots_per_instance == 0 {
        0
    } else {
        slot_demand.div_ceil(slots_per_instance)
    };

    by_zero_slot.max(by_slots)
}

/// Idle flag of every agent, keyed by agent ID.
pub fn agent_idle_states<'a, I>(agents: I) -> BTreeMap<String, AgentIdleState>
where
    I: IntoIterator<Item = (&'a AgentId, &'a AgentState)>,
{
    agents
        .into_iter()
        .map(|(id, state)| {
            (
                id.to_string(),
                AgentIdleState {
                    name: id.to_string(),
                    is_idle: state.idle(),
                },
            )
        })
        .collect()
}

// =============================================================================
// Watch provisioner
// =============================================================================

/// Publishes scaling info on a watch channel for an external autoscaler.
///
/// The autoscaler reports back its slot count and launch failures through
/// [`WatchProvisioner::set_current_slot_count`] and
/// [`WatchProvisioner::set_launch_error`].
#[derive(Debug)]
pub struct WatchProvisioner {
    slots_per_instance: usize,
    max_instances: usize,
    current_slot_count: Mutex<usize>,
    launch_error: Mutex<Option<String>>,
    tx: watch::Sender<ScalingInfo>,
}

impl WatchProvisioner {
    pub fn new(slots_per_instance: usize, max_instances: usize) -> (Self, watch::Receiver<ScalingInfo>) {
        let (tx, rx) = watch::channel(ScalingInfo::default());
        let provisioner = Self {
            slots_per_instance,
            max_instances,
            current_slot_count: Mutex::new(0),
            launch_error: Mutex::new(None),
            tx,
        };
        (provisioner, rx)
    }

    pub fn set_current_slot_count(&self, slots: usize) {
        *self.current_slot_count.lock().unwrap_or_else(|e| e.into_inner()) = slots;
    }

    pub fn set_launch_error(&self, error: Option<String>) {
        *self.launch_error.lock().unwrap_or_else(|e| e.into_inner()) = error;
    }
}

impl Provisioner for WatchProvisioner {
    fn slots_per_instance(&self) -> usize {
        self.slots_per_instance
    }

    fn max_instances(&self) -> usize {
        self.max_instances
    }

    fn current_slot_count(&self) -> ProvisionerResult<usize> {
        Ok(*self.current_slot_count.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn launch_error(&self) -> Option<String> {
        self.launch_error.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn update_scaling_info(&self, info: &ScalingInfo) {
        debug!(desired_new_instances = info.desired_new_instances, "forwarding scaling info");
        self.tx.send_replace(info.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::testing::{setup_scheduler_states, MockAgent, MockGroup, MockTask};
    use rstest::rstest;

    #[test]
    fn test_desired_instances_from_unscheduled_demand() {
        let agents = [MockAgent::new("agent1", 1).max_zero(10), MockAgent::new("agent2", 1).max_zero(10)];
        let tasks = [
            MockTask::new("allocated-cpu-task1", 0).on_agent(0).started(),
            MockTask::new("allocated-cpu-task2", 0).on_agent(1).started(),
            MockTask::new("allocated-gpu-task3", 1).on_agent(1).started(),
            MockTask::new("unallocated-gpu-task4", 1),
            MockTask::new("unallocated-gpu-task5", 5),
        ];
        let states = setup_scheduler_states(&tasks, &[], &agents);

        assert_eq!(desired_new_instances(&states.task_list, &states.groups, 4, 100), 2);
        assert_eq!(desired_new_instances(&states.task_list, &states.groups, 8, 100), 1);
        assert_eq!(desired_new_instances(&states.task_list, &states.groups, 0, 100), 0);
    }

    #[test]
    fn test_desired_instances_respects_max_slots() {
        let groups = [MockGroup::new("group1").max_slots(2)];
        let tasks = [
            MockTask::new("task1", 4).group(0),
            MockTask::new("task2", 4).group(0),
        ];
        let states = setup_scheduler_states(&tasks, &groups, &[]);
        assert_eq!(desired_new_instances(&states.task_list, &states.groups, 1, 100), 2);
    }

    #[rstest]
    #[case(0, 10, 0)]
    #[case(1, 10, 1)]
    #[case(10, 10, 1)]
    #[case(11, 10, 2)]
    #[case(5, 0, 0)]
    fn test_desired_instances_for_zero_slot_work(
        #[case] requests: usize,
        #[case] max_zero: usize,
        #[case] expected: usize,
    ) {
        const NAMES: [&str; 11] = [
            "aux0", "aux1", "aux2", "aux3", "aux4", "aux5", "aux6", "aux7", "aux8", "aux9", "aux10",
        ];
        let tasks: Vec<MockTask> = NAMES[..requests].iter().map(|name| MockTask::new(name, 0)).collect();
        let states = setup_scheduler_states(&tasks, &[], &[]);
        assert_eq!(desired_new_instances(&states.task_list, &states.groups, 4, max_zero), expected);
    }

    #[test]
    fn test_agent_idle_states() {
        let agents = [MockAgent::new("agent1", 2), MockAgent::new("agent2", 2)];
        let tasks = [MockTask::new("task1", 1).on_agent(1).started()];
        let states = setup_scheduler_states(&tasks, &[], &agents);

        let idle = agent_idle_states(&states.agents);
        assert!(idle["agent1"].is_idle);
        assert!(!idle["agent2"].is_idle);
    }

    #[tokio::test]
    async fn test_watch_provisioner_forwards_scaling_info() {
        let (provisioner, mut rx) = WatchProvisioner::new(4, 10);
        provisioner.update_scaling_info(&ScalingInfo {
            desired_new_instances: 3,
            agents: BTreeMap::new(),
        });
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().desired_new_instances, 3);

        assert_eq!(provisioner.launch_error(), None);
        provisioner.set_launch_error(Some("quota exceeded".to_string()));
        provisioner.set_current_slot_count(8);
        assert_eq!(provisioner.launch_error().as_deref(), Some("quota exceeded"));
        assert_eq!(provisioner.current_slot_count().unwrap(), 8);
    }
}
