//! Scheduling policies.
//!
//! A scheduler looks at a pool's task list, groups, queue positions and a
//! snapshot of its agents, and decides which requests to place and which
//! placed allocations to release. It never touches live agents; the pool
//! carries out the decisions.
//!
//! - `fair_share`: max-min fair sharing of slots between groups
//! - `priority`: strict priority order with optional preemption and backfilling

mod fair_share;
mod priority;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use berth_events::ResourcesAllocated;
use berth_id::{AgentId, AllocationId, ContainerId, JobId};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::error;

use crate::agent::AgentState;
use crate::fitting::{FittingPolicy, FittingState};
use crate::tasklist::{
    AllocateRequest, Group, JobQueueInfo, JobSortState, TaskList, TaskListError,
    MAX_USER_SCHEDULING_PRIORITY, MIN_USER_SCHEDULING_PRIORITY,
};

pub use fair_share::FairShareScheduler;
pub use priority::PriorityScheduler;

/// Priority given to groups that never set one.
pub const DEFAULT_SCHEDULING_PRIORITY: i32 = 42;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    #[error(
        "the round robin scheduler has been deprecated; use the priority or fair share scheduler"
    )]
    Deprecated,

    #[error("unknown scheduler type: {0}")]
    UnknownScheduler(String),

    #[error("unknown fitting policy: {0}")]
    UnknownFittingPolicy(String),

    #[error("the priority scheduler requires a default priority")]
    MissingDefaultPriority,

    #[error("priority {0} is outside of [1, 99]")]
    PriorityOutOfRange(i32),

    #[error("operation requires the priority scheduler")]
    NotPriorityScheduler,

    #[error(transparent)]
    TaskList(#[from] TaskListError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    #[default]
    FairShare,
    Priority,
    /// Recognized so configs naming it fail loudly.
    RoundRobin,
}

impl SchedulerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FairShare => "fair_share",
            Self::Priority => "priority",
            Self::RoundRobin => "round_robin",
        }
    }
}

impl std::str::FromStr for SchedulerKind {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fair_share" => Ok(Self::FairShare),
            "priority" => Ok(Self::Priority),
            "round_robin" => Ok(Self::RoundRobin),
            other => Err(SchedulerError::UnknownScheduler(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(rename = "type")]
    pub kind: SchedulerKind,
    pub fitting_policy: FittingPolicy,
    pub allow_heterogeneous_fits: bool,
    /// Priority scheduler only.
    pub preemption: bool,
    /// Priority scheduler only.
    pub default_priority: Option<i32>,
    /// Fair share only: an allocation whose containers have not started
    /// after this long may be released.
    pub allocation_timeout_secs: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            kind: SchedulerKind::FairShare,
            fitting_policy: FittingPolicy::Best,
            allow_heterogeneous_fits: false,
            preemption: false,
            default_priority: None,
            allocation_timeout_secs: None,
        }
    }
}

impl SchedulerConfig {
    pub fn priority(default_priority: i32) -> Self {
        Self {
            kind: SchedulerKind::Priority,
            default_priority: Some(default_priority),
            ..Self::default()
        }
    }

    pub fn allocation_timeout(&self) -> Option<Duration> {
        self.allocation_timeout_secs.map(Duration::from_secs)
    }

    /// Fails on settings that can never work.
    pub fn validate(&self) -> SchedulerResult<()> {
        match self.kind {
            SchedulerKind::RoundRobin => Err(SchedulerError::Deprecated),
            SchedulerKind::Priority => match self.default_priority {
                None => Err(SchedulerError::MissingDefaultPriority),
                Some(p) if !(MIN_USER_SCHEDULING_PRIORITY..=MAX_USER_SCHEDULING_PRIORITY).contains(&p) => {
                    Err(SchedulerError::PriorityOutOfRange(p))
                }
                Some(_) => Ok(()),
            },
            SchedulerKind::FairShare => Ok(()),
        }
    }
}

/// Builds the scheduler a pool is configured with.
pub fn make_scheduler(config: &SchedulerConfig) -> SchedulerResult<Box<dyn Scheduler>> {
    config.validate()?;
    match config.kind {
        SchedulerKind::FairShare => Ok(Box::new(FairShareScheduler::new(config))),
        SchedulerKind::Priority => Ok(Box::new(PriorityScheduler::new(config)?)),
        SchedulerKind::RoundRobin => Err(SchedulerError::Deprecated),
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Everything a scheduling pass reads.
#[derive(Debug, Clone, Copy)]
pub struct SchedulingInput<'a> {
    pub task_list: &'a TaskList,
    pub groups: &'a HashMap<JobId, Group>,
    pub positions: &'a JobSortState,
    pub agents: &'a HashMap<AgentId, AgentState>,
    pub fitting_policy: FittingPolicy,
    pub now: Instant,
}

/// Outcome of a scheduling pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decisions {
    /// Requests to place, in the order they should be tried. A request
    /// placed by backfilling carries `ScheduledBackfilled`.
    pub to_allocate: Vec<AllocateRequest>,
    /// Placed allocations to give back.
    pub to_release: Vec<AllocationId>,
}

impl Decisions {
    pub fn is_empty(&self) -> bool {
        self.to_allocate.is_empty() && self.to_release.is_empty()
    }
}

pub trait Scheduler: Send + Sync + Debug {
    fn kind(&self) -> SchedulerKind;

    /// Runs one scheduling pass.
    fn schedule(&mut self, input: SchedulingInput<'_>) -> Decisions;

    /// Queue standing of every job.
    fn job_q_info(
        &self,
        task_list: &TaskList,
        groups: &HashMap<JobId, Group>,
        positions: &JobSortState,
    ) -> HashMap<JobId, JobQueueInfo>;
}

// =============================================================================
// What-if helpers
// =============================================================================

/// Occupies the candidates' slots in a scratch copy of the agents.
pub(crate) fn add_task_to_agents(agents: &mut HashMap<AgentId, AgentState>, fits: &[FittingState]) {
    for fit in fits {
        let Some(agent) = agents.get_mut(&fit.agent_id) else {
            error!(agent_id = %fit.agent_id, "fit names an agent missing from the snapshot");
            continue;
        };
        if let Err(err) = agent.allocate_free_devices(fit.slots, ContainerId::new()) {
            error!(agent_id = %fit.agent_id, error = %err, "can't add task to agents");
        }
    }
}

/// Frees an allocation's containers in a scratch copy of the agents.
pub(crate) fn remove_task_from_agents(
    agents: &mut HashMap<AgentId, AgentState>,
    allocated: &ResourcesAllocated,
) {
    for grant in &allocated.resources {
        match agents.get_mut(&grant.agent_id) {
            Some(agent) => agent.deallocate_container(&grant.container_id),
            None => error!(
                allocation_id = %allocated.allocation_id,
                container_id = %grant.container_id,
                agent_id = %grant.agent_id,
                "tried to remove an allocation from an agent the scheduler could not find"
            ),
        }
    }
}
