//! State and operations of one resource pool.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use berth_events::{
    AllocationEvent, ContainerState, FailureKind, InvalidResourcesRequest, ReleaseResources,
    ResourceGrant, ResourcesAllocated, ResourcesFailure, ResourcesReleased, ScalingInfo,
};
use berth_id::{AgentId, AllocationId, ContainerId, JobId, ResourcesId};
use tracing::{debug, error, info, instrument, warn};

use super::{
    AgentGateway, CapacityCheck, JobQueuePage, PoolError, PoolResult, PriorityChangeHook,
    ResourceSummary,
};
use crate::agent::AgentState;
use crate::clock::Clock;
use crate::config::PoolConfig;
use crate::fitting::find_fits;
use crate::provisioner::{agent_idle_states, desired_new_instances, Provisioner};
use crate::publish::AllocationPublisher;
use crate::scheduler::{make_scheduler, Scheduler, SchedulerError, SchedulerKind, SchedulingInput};
use crate::store::{ContainerGrant, Store};
use crate::tasklist::{
    find_anchor, job_stats, need_move, paginate, Anchor, AllocateRequest, AllocationSummary, Group,
    JobQueueInfo, JobSortState, QueuePosition, QueueStats, SchedulingState, TaskList,
    MAX_USER_SCHEDULING_PRIORITY, MIN_USER_SCHEDULING_PRIORITY,
};

const UNNAMED_TASK: &str = "Unnamed Task";
const PREEMPTED: &str = "preempted by the scheduler";

/// Collaborators of a pool.
#[derive(Clone)]
pub struct PoolDeps {
    pub gateway: Arc<dyn AgentGateway>,
    pub publisher: Arc<dyn AllocationPublisher>,
    pub clock: Arc<dyn Clock>,
    pub store: Option<Arc<dyn Store>>,
    pub provisioner: Option<Arc<dyn Provisioner>>,
    pub priority_hook: Option<Arc<dyn PriorityChangeHook>>,
}

/// A pool's requests, groups and queue positions, and the scheduler that
/// places them.
///
/// Every operation that could change a scheduling outcome marks the pool for
/// rescheduling; [`ResourcePool::schedule`] does nothing until then.
pub struct ResourcePool {
    config: PoolConfig,
    scheduler: Box<dyn Scheduler>,
    deps: PoolDeps,

    task_list: TaskList,
    groups: HashMap<JobId, Group>,
    positions: JobSortState,
    /// Positions persisted before a restart, claimed when their job shows up.
    persisted_positions: HashMap<JobId, QueuePosition>,
    next_group_seq: u64,

    scaling_info: ScalingInfo,
    provisioner_error: Option<String>,
    reschedule: bool,
}

impl ResourcePool {
    pub fn new(config: PoolConfig, deps: PoolDeps) -> PoolResult<Self> {
        let scheduler = make_scheduler(&config.scheduler)?;

        let persisted_positions = match &deps.store {
            Some(store) => match store.load_job_positions() {
                Ok(positions) => positions.into_iter().collect(),
                Err(e) => {
                    warn!(resource_pool = %config.name, error = %e, "failed to load job positions");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        Ok(Self {
            config,
            scheduler,
            deps,
            task_list: TaskList::new(),
            groups: HashMap::new(),
            positions: JobSortState::new(),
            persisted_positions,
            next_group_seq: 0,
            scaling_info: ScalingInfo::default(),
            provisioner_error: None,
            reschedule: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn task_list(&self) -> &TaskList {
        &self.task_list
    }

    pub fn group(&self, job_id: &JobId) -> Option<&Group> {
        self.groups.get(job_id)
    }

    pub fn job_position(&self, job_id: &JobId) -> Option<QueuePosition> {
        self.positions.get(job_id)
    }

    fn is_priority(&self) -> bool {
        self.scheduler.kind() == SchedulerKind::Priority
    }

    fn publish(&self, event: AllocationEvent) {
        self.deps.publisher.publish(event);
    }

    fn get_or_create_group(&mut self, job_id: &JobId) -> &mut Group {
        let seq = &mut self.next_group_seq;
        let default_priority = match self.config.scheduler.kind {
            SchedulerKind::Priority => self.config.scheduler.default_priority,
            _ => None,
        };
        self.groups.entry(job_id.clone()).or_insert_with(|| {
            let mut group = Group::new(job_id.clone(), *seq);
            *seq += 1;
            group.priority = default_priority;
            group
        })
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Registers a request, filling in an ID and a name when missing.
    ///
    /// A request flagged `restore` is rebuilt from its persisted grants
    /// instead of being queued; if that fails the owner gets a
    /// `RestoreError` failure and nothing is registered.
    pub async fn allocate(&mut self, mut req: AllocateRequest) -> AllocationId {
        if req.allocation_id.is_empty() {
            req.allocation_id = AllocationId::new();
        }
        if req.name.is_empty() {
            req.name = UNNAMED_TASK.to_string();
        }
        if req.resource_pool.is_empty() {
            req.resource_pool = self.config.name.clone();
        }
        self.reschedule = true;
        self.get_or_create_group(&req.job_id);

        info!(
            resource_pool = %self.config.name,
            allocation_id = %req.allocation_id,
            job_id = %req.job_id,
            name = %req.name,
            slots = req.slots_needed,
            restore = req.restore,
            "resources requested"
        );

        if req.is_user_visible && !self.positions.contains(&req.job_id) {
            let position = self
                .persisted_positions
                .remove(&req.job_id)
                .unwrap_or_else(|| QueuePosition::from_submission_time(req.job_submission_time));
            self.positions.insert(req.job_id.clone(), position);
        }

        let allocation_id = req.allocation_id.clone();
        if req.restore {
            if let Err(e) = self.restore_resources(&req).await {
                error!(allocation_id = %allocation_id, error = %e, "error restoring resources");
                self.publish(AllocationEvent::ResourcesFailure(ResourcesFailure {
                    allocation_id: allocation_id.clone(),
                    kind: FailureKind::RestoreError,
                    message: e.to_string(),
                    exit_code: None,
                }));
            }
            return allocation_id;
        }

        if !self.task_list.add_task(req) {
            warn!(allocation_id = %allocation_id, "ignoring duplicate allocation request");
        }
        allocation_id
    }

    /// Rebuilds an allocation from the grants persisted when it was placed.
    async fn restore_resources(&mut self, req: &AllocateRequest) -> PoolResult<()> {
        let store = self
            .deps
            .store
            .clone()
            .ok_or_else(|| PoolError::Restore("no store configured".to_string()))?;
        let grants = store.load_allocation_grants(&req.allocation_id)?;
        if grants.is_empty() {
            return Err(PoolError::Restore("0 container snapshots".to_string()));
        }

        let agents = self.deps.gateway.agent_states(&self.config.name).await;
        let mut resources = Vec::with_capacity(grants.len());
        for grant in grants {
            let Some(agent) = agents.get(&grant.agent_id) else {
                return Err(PoolError::Restore(format!(
                    "can't find restorable agent {}",
                    grant.agent_id
                )));
            };
            let running = grant.state == ContainerState::Running
                || agent
                    .container_state()
                    .get(&grant.container_id)
                    .is_some_and(|c| c.state == ContainerState::Running);
            resources.push(ResourceGrant {
                resources_id: grant.resources_id,
                agent_id: grant.agent_id,
                container_id: grant.container_id,
                devices: grant.devices,
                started: running,
            });
        }

        let allocated = ResourcesAllocated {
            allocation_id: req.allocation_id.clone(),
            resource_pool: self.config.name.clone(),
            resources,
            job_submission_time: req.job_submission_time,
            allocated_at: self.deps.clock.utc_now(),
            recovered: true,
        };
        self.task_list.add_task(req.clone());
        self.task_list
            .add_allocation(&req.allocation_id, Some(allocated.clone()));
        self.publish(AllocationEvent::ResourcesAllocated(allocated));
        info!(allocation_id = %req.allocation_id, "restored resources");
        Ok(())
    }

    /// Returns an allocation's resources to the pool.
    ///
    /// A request released before it was placed is simply dropped. With a
    /// `resources_id` only that grant is freed and the request stays
    /// registered; otherwise every grant is freed and the request removed.
    pub async fn resources_released(&mut self, allocation_id: &AllocationId, resources_id: Option<ResourcesId>) {
        if self.task_list.task_by_id(allocation_id).is_none() {
            debug!(allocation_id = %allocation_id, "ignoring release for task not in pool");
            return;
        }
        self.reschedule = true;

        let Some(allocated) = self.task_list.allocation(allocation_id) else {
            info!(allocation_id = %allocation_id, "released before allocated");
            self.task_list.remove_task_by_id(allocation_id);
            self.publish_released(allocation_id);
            return;
        };
        let grants = allocated.resources.clone();

        match resources_id {
            Some(resources_id) => {
                info!(allocation_id = %allocation_id, resources_id = %resources_id, "incrementally released resources");
                let Some(grant) = grants.iter().find(|g| g.resources_id == resources_id) else {
                    warn!(allocation_id = %allocation_id, resources_id = %resources_id, "released unknown resources");
                    return;
                };
                self.deallocate(&grant.agent_id, &grant.container_id).await;
                if let Some(allocated) = self.task_list.allocation_mut(allocation_id) {
                    allocated.resources.retain(|g| g.resources_id != resources_id);
                }
            }
            None => {
                info!(allocation_id = %allocation_id, "all resources are released");
                for grant in &grants {
                    self.deallocate(&grant.agent_id, &grant.container_id).await;
                }
                self.task_list.remove_task_by_id(allocation_id);
                if let Some(store) = &self.deps.store {
                    if let Err(e) = store.delete_allocation_grants(allocation_id) {
                        warn!(allocation_id = %allocation_id, error = %e, "failed to delete container grants");
                    }
                }
                self.publish_released(allocation_id);
            }
        }
    }

    fn publish_released(&self, allocation_id: &AllocationId) {
        self.publish(AllocationEvent::ResourcesReleased(ResourcesReleased {
            allocation_id: allocation_id.clone(),
            resource_pool: self.config.name.clone(),
        }));
    }

    async fn deallocate(&self, agent_id: &AgentId, container_id: &ContainerId) {
        if let Err(e) = self
            .deps
            .gateway
            .deallocate_container(agent_id, container_id.clone())
            .await
        {
            error!(
                agent_id = %agent_id,
                container_id = %container_id,
                error = %e,
                "failed to deallocate container"
            );
        }
    }

    // =========================================================================
    // Groups and queue order
    // =========================================================================

    pub fn set_group_weight(&mut self, job_id: &JobId, weight: f64) {
        self.reschedule = true;
        self.get_or_create_group(job_id).weight = weight;
    }

    pub fn set_group_max_slots(&mut self, job_id: &JobId, max_slots: Option<usize>) {
        self.reschedule = true;
        self.get_or_create_group(job_id).max_slots = max_slots;
    }

    /// Changes a job's priority and puts it back at its submission-time
    /// position. Ignored unless the pool runs the priority scheduler.
    pub fn set_group_priority(&mut self, job_id: &JobId, priority: i32) -> PoolResult<()> {
        if !(MIN_USER_SCHEDULING_PRIORITY..=MAX_USER_SCHEDULING_PRIORITY).contains(&priority) {
            return Err(SchedulerError::PriorityOutOfRange(priority).into());
        }
        self.reschedule = true;
        if !self.is_priority() {
            return Ok(());
        }

        let group = self.get_or_create_group(job_id);
        if group.priority == Some(priority) {
            return Ok(());
        }
        group.priority = Some(priority);
        info!(job_id = %job_id, priority, "setting group priority");

        let submitted = self
            .task_list
            .iter()
            .find(|req| &req.job_id == job_id)
            .map(|req| req.job_submission_time);
        match submitted {
            Some(submitted) => {
                self.positions
                    .insert(job_id.clone(), QueuePosition::from_submission_time(submitted));
            }
            None => warn!(job_id = %job_id, "no request to take a submission time from"),
        }
        Ok(())
    }

    /// Moves a job just ahead of or behind `anchor_id` in the queue.
    ///
    /// When the two jobs differ in priority the job first takes the anchor's
    /// priority, and the configured hook is told; a hook error undoes the
    /// priority change.
    pub fn move_job(&mut self, job_id: &JobId, anchor_id: &JobId, ahead: bool) -> PoolResult<()> {
        if job_id == anchor_id {
            return Ok(());
        }
        let kind = self.scheduler.kind();
        if kind != SchedulerKind::Priority {
            return Err(PoolError::NotPriorityScheduler(kind));
        }
        if !self.positions.contains(job_id) || !self.groups.contains_key(job_id) {
            return Err(PoolError::JobNotFound(job_id.clone()));
        }
        if !self.positions.contains(anchor_id) {
            return Err(PoolError::JobNotFound(anchor_id.clone()));
        }
        self.reschedule = true;

        let found = find_anchor(
            job_id,
            anchor_id,
            ahead,
            &self.task_list,
            &self.groups,
            &self.positions,
        )?;
        if found.second_anchor == Anchor::Job(job_id.clone()) {
            return Ok(());
        }

        if found.prio_change {
            let old_priority = self
                .groups
                .get(job_id)
                .and_then(|g| g.priority)
                .ok_or_else(|| PoolError::UnableToMove(job_id.clone()))?;
            self.set_group_priority(job_id, found.anchor_priority)?;

            if let Some(hook) = self.deps.priority_hook.clone() {
                if let Err(e) = hook.priority_changed(job_id, found.anchor_priority) {
                    warn!(job_id = %job_id, error = %e, "priority change rejected, restoring");
                    self.set_group_priority(job_id, old_priority)?;
                    return Err(PoolError::PriorityChange(e));
                }
            }

            let still_needed = need_move(
                self.positions.position_or_head(job_id),
                self.positions.position_or_head(anchor_id),
                self.positions.anchor_position(&found.second_anchor),
                ahead,
            );
            if !still_needed {
                return Ok(());
            }
        }

        let position = self.positions.set_job_position(
            job_id,
            &Anchor::Job(anchor_id.clone()),
            &found.second_anchor,
            ahead,
        )?;
        debug!(job_id = %job_id, anchor_id = %anchor_id, ahead, %position, "moved job");

        if let Some(store) = &self.deps.store {
            if let Err(e) = store.persist_job_position(job_id, position) {
                warn!(job_id = %job_id, error = %e, "failed to persist job position");
            }
        }
        Ok(())
    }

    pub fn recover_job_position(&mut self, job_id: JobId, position: QueuePosition) {
        self.reschedule = true;
        self.positions.recover_job_position(job_id, position);
    }

    /// Forgets a finished job's group and queue position.
    pub fn job_stopped(&mut self, job_id: &JobId) {
        self.reschedule = true;
        self.groups.remove(job_id);
        self.positions.remove(job_id);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn get_job_q(&self) -> HashMap<JobId, JobQueueInfo> {
        self.scheduler
            .job_q_info(&self.task_list, &self.groups, &self.positions)
    }

    /// The job queue in queue order, one page at a time.
    pub fn get_job_q_page(&self, offset: i64, limit: i64) -> PoolResult<JobQueuePage> {
        let mut jobs: Vec<(JobId, JobQueueInfo)> = self.get_job_q().into_iter().collect();
        jobs.sort_by(|a, b| a.1.jobs_ahead.cmp(&b.1.jobs_ahead).then_with(|| a.0.cmp(&b.0)));

        let pagination = paginate(jobs.len(), offset, limit)?;
        let jobs = jobs
            .drain(pagination.start_index..pagination.end_index)
            .collect();
        Ok(JobQueuePage { jobs, pagination })
    }

    pub fn get_job_q_stats(&self) -> QueueStats {
        job_stats(&self.task_list)
    }

    pub fn get_allocation_summaries(&self) -> BTreeMap<AllocationId, AllocationSummary> {
        self.task_list.task_summaries(&self.groups)
    }

    fn slots_per_instance(&self) -> usize {
        self.deps
            .provisioner
            .as_ref()
            .map_or(0, |p| p.slots_per_instance())
    }

    /// Whether a request for `slots` could ever be placed in this pool.
    pub async fn validate_resources(&self, slots: usize) -> bool {
        let slots_per_instance = self.slots_per_instance();
        if slots_per_instance > 0 {
            return slots_per_instance >= slots;
        }
        let agents = self.deps.gateway.agent_states(&self.config.name).await;
        let largest = agents.values().map(AgentState::num_total_slots).max().unwrap_or(0);
        largest >= slots
    }

    /// Slots available to a request that must avoid `blocked` agents.
    ///
    /// Without a provisioner this counts the slots of connected agents;
    /// with one it starts from the most the provisioner could ever run.
    pub async fn capacity_check(&self, slots: usize, blocked: &[AgentId]) -> CapacityCheck {
        let agents = self.deps.gateway.agent_states(&self.config.name).await;
        let blocked: HashSet<&AgentId> = blocked.iter().collect();

        let slots_available = match &self.deps.provisioner {
            None => agents
                .iter()
                .filter(|(id, _)| !blocked.contains(id))
                .map(|(_, a)| a.num_total_slots())
                .sum(),
            Some(provisioner) => {
                let max = provisioner.max_instances() * provisioner.slots_per_instance();
                let blocked_slots: usize = agents
                    .iter()
                    .filter(|(id, _)| blocked.contains(id))
                    .map(|(_, a)| a.num_total_slots())
                    .sum();
                max.saturating_sub(blocked_slots)
            }
        };

        CapacityCheck {
            capacity_exceeded: slots_available < slots,
            slots_available,
        }
    }

    pub async fn resource_summary(&self) -> ResourceSummary {
        let agents = self.deps.gateway.agent_states(&self.config.name).await;
        ResourceSummary::from_agent_states(agents.values())
    }

    /// An agent of the pool changed.
    pub fn agent_updated(&mut self) {
        self.reschedule = true;
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    /// One scheduling tick. Returns false when nothing changed since the
    /// last one and the tick was skipped.
    #[instrument(skip_all, fields(resource_pool = %self.config.name))]
    pub async fn schedule(&mut self) -> bool {
        if let Some(provisioner) = &self.deps.provisioner {
            let launch_error = provisioner.launch_error();
            if launch_error != self.provisioner_error {
                if launch_error.is_some() {
                    self.reschedule = true;
                }
                self.provisioner_error = launch_error;
            }
        }
        if !self.reschedule {
            return false;
        }
        self.reschedule = false;

        let mut agents = self.deps.gateway.agent_states(&self.config.name).await;
        self.mark_started(&agents);
        self.prune_task_list();

        let decisions = self.scheduler.schedule(SchedulingInput {
            task_list: &self.task_list,
            groups: &self.groups,
            positions: &self.positions,
            agents: &agents,
            fitting_policy: self.config.scheduler.fitting_policy,
            now: self.deps.clock.now(),
        });
        if !decisions.is_empty() {
            debug!(
                to_allocate = decisions.to_allocate.len(),
                to_release = decisions.to_release.len(),
                "scheduled"
            );
        }

        for req in &decisions.to_allocate {
            self.allocate_resources(req, &mut agents).await;
        }
        for allocation_id in &decisions.to_release {
            self.release_resources(allocation_id);
        }
        self.send_scaling_info(&agents);

        // Unstarted allocations must be looked at again to time out.
        if self.config.scheduler.allocation_timeout().is_some()
            && self.task_list.allocations().any(|a| !a.any_started())
        {
            self.reschedule = true;
        }
        true
    }

    /// Flags grants whose containers the agents report running.
    fn mark_started(&mut self, agents: &HashMap<AgentId, AgentState>) {
        let ids: Vec<AllocationId> = self
            .task_list
            .allocations()
            .filter(|a| a.resources.iter().any(|g| !g.started))
            .map(|a| a.allocation_id.clone())
            .collect();
        for id in ids {
            let Some(allocated) = self.task_list.allocation_mut(&id) else {
                continue;
            };
            for grant in allocated.resources.iter_mut().filter(|g| !g.started) {
                grant.started = agents
                    .get(&grant.agent_id)
                    .and_then(|a| a.container_state().get(&grant.container_id))
                    .is_some_and(|c| c.state == ContainerState::Running);
            }
        }
    }

    /// Drops queued requests bigger than anything the provisioner can still
    /// bring up while it is failing to launch instances.
    fn prune_task_list(&mut self) {
        let (Some(provisioner), Some(cause)) = (&self.deps.provisioner, &self.provisioner_error) else {
            return;
        };
        let slot_count = match provisioner.current_slot_count() {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "can't read provisioner slot count");
                return;
            }
        };
        error!(error = %cause, slot_count, "provisioner in error state");

        let hopeless: Vec<AllocationId> = self
            .task_list
            .iter()
            .filter(|req| !self.task_list.is_scheduled(&req.allocation_id))
            .filter(|req| req.slots_needed > slot_count)
            .map(|req| req.allocation_id.clone())
            .collect();
        if hopeless.is_empty() {
            return;
        }

        let before = self.task_list.len();
        for allocation_id in hopeless {
            warn!(allocation_id = %allocation_id, error = %cause, "removing task from list");
            self.task_list.remove_task_by_id(&allocation_id);
            self.publish(AllocationEvent::InvalidResourcesRequest(InvalidResourcesRequest {
                allocation_id,
                cause: cause.clone(),
            }));
        }
        warn!(before, after = self.task_list.len(), "pruned task list");
    }

    /// Reserves devices for every fit of `req`, persists the grants and
    /// publishes the allocation. Any failure gives back what was reserved.
    async fn allocate_resources(&mut self, req: &AllocateRequest, agents: &mut HashMap<AgentId, AgentState>) -> bool {
        let fits = find_fits(
            req,
            agents.values(),
            self.config.scheduler.fitting_policy,
            self.config.scheduler.allow_heterogeneous_fits,
        );
        if fits.is_empty() {
            return false;
        }

        let mut reserved: Vec<ResourceGrant> = Vec::with_capacity(fits.len());
        for fit in fits {
            let container_id = ContainerId::new();
            match self
                .deps
                .gateway
                .allocate_free_devices(&fit.agent_id, &req.allocation_id, fit.slots, container_id.clone())
                .await
            {
                Ok(devices) => reserved.push(ResourceGrant {
                    resources_id: ResourcesId::from(container_id.as_str()),
                    agent_id: fit.agent_id,
                    container_id,
                    devices,
                    started: false,
                }),
                Err(e) => {
                    warn!(allocation_id = %req.allocation_id, agent_id = %fit.agent_id, error = %e, "failed to allocate request");
                    self.roll_back(&reserved).await;
                    return false;
                }
            }
        }

        if let Err(e) = self.persist_grants(&req.allocation_id, &reserved) {
            error!(allocation_id = %req.allocation_id, error = %e, "persistence failure");
            self.roll_back(&reserved).await;
            return false;
        }

        let allocated = ResourcesAllocated {
            allocation_id: req.allocation_id.clone(),
            resource_pool: self.config.name.clone(),
            resources: reserved,
            job_submission_time: req.job_submission_time,
            allocated_at: self.deps.clock.utc_now(),
            recovered: false,
        };
        let touched: Vec<AgentId> = allocated
            .resources
            .iter()
            .map(|g| g.agent_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        self.task_list
            .add_allocation(&req.allocation_id, Some(allocated.clone()));
        if req.state == SchedulingState::ScheduledBackfilled {
            self.task_list
                .set_state(&req.allocation_id, SchedulingState::ScheduledBackfilled);
        }
        self.publish(AllocationEvent::ResourcesAllocated(allocated));

        for agent_id in touched {
            match self.deps.gateway.agent_state(&agent_id).await {
                Ok(state) => {
                    agents.insert(agent_id, state);
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "failed to refresh agent state");
                    agents.remove(&agent_id);
                }
            }
        }

        info!(allocation_id = %req.allocation_id, name = %req.name, "allocated resources");
        true
    }

    fn persist_grants(&self, allocation_id: &AllocationId, grants: &[ResourceGrant]) -> PoolResult<()> {
        let Some(store) = &self.deps.store else {
            return Ok(());
        };
        for grant in grants {
            let persisted = store.persist_container_grant(&ContainerGrant {
                resources_id: grant.resources_id.clone(),
                allocation_id: allocation_id.clone(),
                agent_id: grant.agent_id.clone(),
                container_id: grant.container_id.clone(),
                state: ContainerState::Assigned,
                devices: grant.devices.clone(),
            });
            if let Err(e) = persisted {
                if let Err(cleanup) = store.delete_allocation_grants(allocation_id) {
                    warn!(allocation_id = %allocation_id, error = %cleanup, "failed to clean up container grants");
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    async fn roll_back(&self, reserved: &[ResourceGrant]) {
        for grant in reserved {
            self.deallocate(&grant.agent_id, &grant.container_id).await;
        }
    }

    fn release_resources(&self, allocation_id: &AllocationId) {
        info!(allocation_id = %allocation_id, "releasing resources ({PREEMPTED})");
        self.publish(AllocationEvent::ReleaseResources(ReleaseResources {
            allocation_id: allocation_id.clone(),
            reason: PREEMPTED.to_string(),
            force_kill: false,
        }));
    }

    fn send_scaling_info(&mut self, agents: &HashMap<AgentId, AgentState>) {
        let Some(provisioner) = &self.deps.provisioner else {
            return;
        };
        let desired = desired_new_instances(
            &self.task_list,
            &self.groups,
            provisioner.slots_per_instance(),
            self.config.max_aux_containers_per_agent,
        );
        if self.scaling_info.update(desired, agent_idle_states(agents)) {
            provisioner.update_scaling_info(&self.scaling_info);
        }
    }
}
