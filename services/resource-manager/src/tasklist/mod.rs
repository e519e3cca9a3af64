//! Request registry and job queue bookkeeping.
//!
//! The `TaskList` holds every pending or placed `AllocateRequest` of a pool
//! together with its `ResourcesAllocated` record, if any. Iteration order is
//! the arrival order every scheduler consumes:
//! - job submission time
//! - then registration order
//! - then allocation ID
//!
//! Submodules cover manual queue ordering (`position`), job queue reporting
//! (`jobq`) and paging of query results (`paginate`).

mod jobq;
mod paginate;
mod position;

use std::collections::{BTreeMap, BTreeSet, HashMap};

use berth_events::{ResourceGrant, ResourcesAllocated};
use berth_id::{AgentId, AllocationId, JobId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use jobq::{job_stats, reduce_to_job_q_info, JobQueueInfo, QueueStats};
pub use paginate::{paginate, Pagination};
pub use position::{
    find_anchor, need_move, sort_tasks_with_position, Anchor, AnchorMatch, JobSortState,
    QueuePosition,
};

/// Most important priority value; lower numbers are scheduled first.
pub const MIN_USER_SCHEDULING_PRIORITY: i32 = 1;

/// Least important priority value.
pub const MAX_USER_SCHEDULING_PRIORITY: i32 = 99;

// =============================================================================
// Errors
// =============================================================================

/// Errors from job queue operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskListError {
    #[error("no group registered for job {0}")]
    MissingGroup(JobId),

    #[error("priority not set for job {0}")]
    MissingPriority(JobId),

    #[error("job {0} is not in the queue")]
    JobNotFound(JobId),

    #[error("no queue position left between {0} and {1}")]
    PositionExhausted(QueuePosition, QueuePosition),

    #[error("invalid queue position {0:?}")]
    InvalidPosition(String),

    #[error("offset {offset} is out of range for {total} entries")]
    OffsetOutOfRange { offset: i64, total: usize },
}

pub type TaskListResult<T> = Result<T, TaskListError>;

// =============================================================================
// Requests
// =============================================================================

/// Scheduling state of a request. Ordered from least to most placed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingState {
    #[default]
    Queued,
    Scheduled,
    ScheduledBackfilled,
}

impl SchedulingState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Scheduled => "scheduled",
            Self::ScheduledBackfilled => "scheduled_backfilled",
        }
    }

    /// True for both scheduled variants.
    pub fn is_scheduled(&self) -> bool {
        !matches!(self, Self::Queued)
    }
}

fn default_true() -> bool {
    true
}

/// One workload's resource ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocateRequest {
    pub allocation_id: AllocationId,
    /// Owning job; also the key of the request's `Group`.
    pub job_id: JobId,
    pub name: String,
    /// Zero means an auxiliary (zero-slot) container.
    pub slots_needed: usize,
    pub preemptible: bool,
    pub job_submission_time: DateTime<Utc>,
    pub resource_pool: String,
    #[serde(default)]
    pub state: SchedulingState,
    /// Agents this request must not be placed on.
    #[serde(default)]
    pub blocked_nodes: Vec<AgentId>,
    /// Multi-slot requests that must land on one agent.
    #[serde(default)]
    pub single_agent: bool,
    /// Rebuild the allocation from persisted grants instead of scheduling it.
    #[serde(default)]
    pub restore: bool,
    /// Hidden requests are placed normally but left out of job queue reports.
    #[serde(default = "default_true")]
    pub is_user_visible: bool,
}

impl AllocateRequest {
    /// A preemptible, user-visible request submitted now.
    pub fn new(allocation_id: AllocationId, job_id: JobId, slots_needed: usize) -> Self {
        Self {
            allocation_id,
            job_id,
            name: String::new(),
            slots_needed,
            preemptible: true,
            job_submission_time: Utc::now(),
            resource_pool: String::new(),
            state: SchedulingState::Queued,
            blocked_nodes: Vec::new(),
            single_agent: false,
            restore: false,
            is_user_visible: true,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.resource_pool = pool.into();
        self
    }

    pub fn with_submission_time(mut self, time: DateTime<Utc>) -> Self {
        self.job_submission_time = time;
        self
    }

    pub fn non_preemptible(mut self) -> Self {
        self.preemptible = false;
        self
    }

    pub fn blocking(mut self, agents: Vec<AgentId>) -> Self {
        self.blocked_nodes = agents;
        self
    }

    /// True for auxiliary requests that consume no slot.
    pub fn is_zero_slot(&self) -> bool {
        self.slots_needed == 0
    }
}

/// Scheduling unit shared by every request of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub job_id: JobId,
    /// Fair-share weight.
    pub weight: f64,
    /// Priority-scheduler priority; lower is more important.
    pub priority: Option<i32>,
    /// Hard cap on the slots the group may hold.
    pub max_slots: Option<usize>,
    /// Registration order within the pool; earlier groups are senior.
    pub registered_seq: u64,
}

impl Group {
    pub fn new(job_id: JobId, registered_seq: u64) -> Self {
        Self {
            job_id,
            weight: 1.0,
            priority: None,
            max_slots: None,
            registered_seq,
        }
    }
}

/// Point-in-time view of a request and its grants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationSummary {
    pub allocation_id: AllocationId,
    pub job_id: JobId,
    pub name: String,
    pub resource_pool: String,
    pub slots_needed: usize,
    pub state: SchedulingState,
    pub priority: Option<i32>,
    pub resources: Vec<ResourceGrant>,
}

// =============================================================================
// TaskList
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TaskKey {
    submitted: DateTime<Utc>,
    seq: u64,
    allocation_id: AllocationId,
}

#[derive(Debug, Clone)]
struct TaskEntry {
    key: TaskKey,
    request: AllocateRequest,
}

/// Ordered registry of a pool's requests and their allocations.
#[derive(Debug, Clone, Default)]
pub struct TaskList {
    order: BTreeSet<TaskKey>,
    tasks: HashMap<AllocationId, TaskEntry>,
    allocations: HashMap<AllocationId, ResourcesAllocated>,
    next_seq: u64,
}

impl TaskList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Registers a request. Returns false if the allocation ID is already known.
    pub fn add_task(&mut self, request: AllocateRequest) -> bool {
        if self.tasks.contains_key(&request.allocation_id) {
            return false;
        }

        let key = TaskKey {
            submitted: request.job_submission_time,
            seq: self.next_seq,
            allocation_id: request.allocation_id.clone(),
        };
        self.next_seq += 1;

        self.order.insert(key.clone());
        self.tasks
            .insert(request.allocation_id.clone(), TaskEntry { key, request });
        true
    }

    /// Removes a request and any allocation it holds.
    pub fn remove_task_by_id(&mut self, id: &AllocationId) -> Option<AllocateRequest> {
        let entry = self.tasks.remove(id)?;
        self.order.remove(&entry.key);
        self.allocations.remove(id);
        Some(entry.request)
    }

    pub fn task_by_id(&self, id: &AllocationId) -> Option<&AllocateRequest> {
        self.tasks.get(id).map(|e| &e.request)
    }

    /// Requests in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &AllocateRequest> + '_ {
        self.order
            .iter()
            .filter_map(move |key| self.tasks.get(&key.allocation_id).map(|e| &e.request))
    }

    pub fn allocation(&self, id: &AllocationId) -> Option<&ResourcesAllocated> {
        self.allocations.get(id)
    }

    pub fn allocation_mut(&mut self, id: &AllocationId) -> Option<&mut ResourcesAllocated> {
        self.allocations.get_mut(id)
    }

    /// All allocations, unordered.
    pub fn allocations(&self) -> impl Iterator<Item = &ResourcesAllocated> + '_ {
        self.allocations.values()
    }

    /// Records the outcome of placing a request.
    ///
    /// `Some` marks the request `Scheduled`, `None` clears any allocation
    /// and marks it `Queued`.
    pub fn add_allocation(&mut self, id: &AllocationId, allocated: Option<ResourcesAllocated>) {
        let state = match allocated {
            Some(allocated) => {
                self.allocations.insert(id.clone(), allocated);
                SchedulingState::Scheduled
            }
            None => {
                self.allocations.remove(id);
                SchedulingState::Queued
            }
        };
        self.set_state(id, state);
    }

    /// Clears the allocation; the request stays registered as `Queued`.
    pub fn remove_allocation(&mut self, id: &AllocationId) -> Option<ResourcesAllocated> {
        let removed = self.allocations.remove(id);
        self.set_state(id, SchedulingState::Queued);
        removed
    }

    pub fn is_scheduled(&self, id: &AllocationId) -> bool {
        self.allocations.contains_key(id)
    }

    pub fn set_state(&mut self, id: &AllocationId, state: SchedulingState) {
        if let Some(entry) = self.tasks.get_mut(id) {
            entry.request.state = state;
        }
    }

    /// Summaries of every request, keyed by allocation ID.
    pub fn task_summaries(
        &self,
        groups: &HashMap<JobId, Group>,
    ) -> BTreeMap<AllocationId, AllocationSummary> {
        self.iter()
            .map(|req| {
                let summary = AllocationSummary {
                    allocation_id: req.allocation_id.clone(),
                    job_id: req.job_id.clone(),
                    name: req.name.clone(),
                    resource_pool: req.resource_pool.clone(),
                    slots_needed: req.slots_needed,
                    state: req.state,
                    priority: groups.get(&req.job_id).and_then(|g| g.priority),
                    resources: self
                        .allocation(&req.allocation_id)
                        .map(|a| a.resources.clone())
                        .unwrap_or_default(),
                };
                (req.allocation_id.clone(), summary)
            })
            .collect()
    }
}
