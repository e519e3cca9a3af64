//! Resource pools.
//!
//! A pool owns the request registry, groups and queue positions of one set
//! of agents, and runs its scheduler on a coalesced tick: a tick only does
//! work when something changed since the previous one.
//!
//! - `resource_pool`: `ResourcePool`, the pool state and its operations
//! - `actor`: runs a pool as an actor with the scheduling tick as its timer
//! - `router`: routes agent notifications to the owning pool
//!
//! Pools reach agents only through [`AgentGateway`]; agents reach pools only
//! through the non-blocking [`crate::agent::AgentListener`], so an agent
//! never waits on a pool that is waiting on it.

mod actor;
mod resource_pool;
mod router;

use std::collections::HashMap;
use std::fmt::Debug;

use async_trait::async_trait;
use berth_events::Device;
use berth_id::{AgentId, AllocationId, ContainerId, JobId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actor::ActorError;
use crate::agent::{AgentError, AgentResult, AgentState};
use crate::scheduler::{SchedulerError, SchedulerKind};
use crate::store::StoreError;
use crate::tasklist::{JobQueueInfo, Pagination, TaskListError};

pub use actor::{PoolActor, PoolCommand, PoolHandle};
pub use resource_pool::{PoolDeps, ResourcePool};
pub use router::PoolRouter;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("unable to perform operation on resource pool with {} scheduler", .0.as_str())]
    NotPriorityScheduler(SchedulerKind),

    #[error("unable to move job {0}")]
    UnableToMove(JobId),

    #[error("priority change rejected: {0:#}")]
    PriorityChange(anyhow::Error),

    #[error("failed to restore resources: {0}")]
    Restore(String),

    #[error("resource pool not found: {0}")]
    UnknownPool(String),

    #[error("resource pool stopped")]
    Stopped,

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    TaskList(#[from] TaskListError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error(transparent)]
    Actor(ActorError),
}

pub type PoolResult<T> = Result<T, PoolError>;

// =============================================================================
// Collaborators
// =============================================================================

/// How a pool reaches the agents it schedules onto.
#[async_trait]
pub trait AgentGateway: Send + Sync {
    /// A snapshot of every live agent of the pool. Agents that fail or time
    /// out are left out.
    async fn agent_states(&self, resource_pool: &str) -> HashMap<AgentId, AgentState>;

    async fn agent_state(&self, agent_id: &AgentId) -> AgentResult<AgentState>;

    async fn allocate_free_devices(
        &self,
        agent_id: &AgentId,
        allocation_id: &AllocationId,
        slots: usize,
        container_id: ContainerId,
    ) -> AgentResult<Vec<Device>>;

    async fn deallocate_container(&self, agent_id: &AgentId, container_id: ContainerId) -> AgentResult<()>;
}

/// Told before a job's priority is changed to make room for a queue move.
///
/// An error aborts the move and restores the old priority.
pub trait PriorityChangeHook: Send + Sync + Debug {
    fn priority_changed(&self, job_id: &JobId, priority: i32) -> anyhow::Result<()>;
}

// =============================================================================
// Reports
// =============================================================================

/// Slots and auxiliary capacity of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSummary {
    pub num_agents: usize,
    pub num_total_slots: usize,
    pub num_active_slots: usize,
    pub max_num_aux_containers: usize,
    pub num_active_aux_containers: usize,
}

impl ResourceSummary {
    pub fn from_agent_states<'a, I>(agents: I) -> Self
    where
        I: IntoIterator<Item = &'a AgentState>,
    {
        agents.into_iter().fold(Self::default(), |mut summary, agent| {
            summary.num_agents += 1;
            summary.num_total_slots += agent.num_total_slots();
            summary.num_active_slots += agent.num_used_slots();
            summary.max_num_aux_containers += agent.max_zero_slot_containers();
            summary.num_active_aux_containers += agent.num_used_zero_slots();
            summary
        })
    }
}

/// Whether a request of some size could ever fit the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityCheck {
    pub capacity_exceeded: bool,
    pub slots_available: usize,
}

/// One page of the job queue, ordered by queue standing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobQueuePage {
    pub jobs: Vec<(JobId, JobQueueInfo)>,
    pub pagination: Pagination,
}
