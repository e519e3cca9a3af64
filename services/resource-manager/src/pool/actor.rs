//! Runs a [`ResourcePool`] as an actor.
//!
//! Requests, releases and queue operations are handled between scheduling
//! ticks; the tick is the actor's timer and only schedules when something
//! changed since the previous one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use berth_id::{AgentId, AllocationId, JobId, ResourcesId};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use super::{CapacityCheck, JobQueuePage, PoolError, PoolResult, ResourcePool, ResourceSummary};
use crate::actor::{self, Actor, ActorContext, ActorError, ActorHandle};
use crate::clock::Clock;
use crate::tasklist::{AllocateRequest, AllocationSummary, JobQueueInfo, QueuePosition, QueueStats};

type Reply<T> = oneshot::Sender<T>;

/// Mailbox message of a pool actor.
#[derive(Debug)]
pub enum PoolCommand {
    Allocate {
        request: AllocateRequest,
        reply: Reply<AllocationId>,
    },
    ResourcesReleased {
        allocation_id: AllocationId,
        resources_id: Option<ResourcesId>,
    },
    SetGroupWeight {
        job_id: JobId,
        weight: f64,
    },
    SetGroupMaxSlots {
        job_id: JobId,
        max_slots: Option<usize>,
    },
    SetGroupPriority {
        job_id: JobId,
        priority: i32,
        reply: Reply<PoolResult<()>>,
    },
    MoveJob {
        job_id: JobId,
        anchor_id: JobId,
        ahead: bool,
        reply: Reply<PoolResult<()>>,
    },
    RecoverJobPosition {
        job_id: JobId,
        position: QueuePosition,
    },
    JobStopped(JobId),
    GetJobQ {
        reply: Reply<HashMap<JobId, JobQueueInfo>>,
    },
    GetJobQPage {
        offset: i64,
        limit: i64,
        reply: Reply<PoolResult<JobQueuePage>>,
    },
    GetJobQStats {
        reply: Reply<QueueStats>,
    },
    GetAllocationSummaries {
        reply: Reply<BTreeMap<AllocationId, AllocationSummary>>,
    },
    ValidateResources {
        slots: usize,
        reply: Reply<bool>,
    },
    CapacityCheck {
        slots: usize,
        blocked: Vec<AgentId>,
        reply: Reply<CapacityCheck>,
    },
    GetResourceSummary {
        reply: Reply<ResourceSummary>,
    },
    AgentUpdated,
}

pub struct PoolActor {
    name: String,
    pool: ResourcePool,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
    next_tick: Instant,
}

impl PoolActor {
    pub fn new(pool: ResourcePool, clock: Arc<dyn Clock>, tick_interval: Duration) -> Self {
        let next_tick = clock.now() + tick_interval;
        Self {
            name: format!("pool-{}", pool.name()),
            pool,
            clock,
            tick_interval,
            next_tick,
        }
    }

    /// Spawns the actor and returns a handle to it.
    pub fn spawn(
        pool: ResourcePool,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
        mailbox_size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (PoolHandle, JoinHandle<()>) {
        let name = pool.name().to_string();
        let actor = Self::new(pool, clock, tick_interval);
        let (inner, task) = actor::spawn(actor, mailbox_size, shutdown);
        (PoolHandle { name, inner }, task)
    }
}

fn reply<T>(tx: oneshot::Sender<T>, value: T) {
    let _ = tx.send(value);
}

#[async_trait]
impl Actor for PoolActor {
    type Message = PoolCommand;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, msg: PoolCommand, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        let pool = &mut self.pool;
        match msg {
            PoolCommand::Allocate { request, reply: tx } => reply(tx, pool.allocate(request).await),
            PoolCommand::ResourcesReleased {
                allocation_id,
                resources_id,
            } => pool.resources_released(&allocation_id, resources_id).await,
            PoolCommand::SetGroupWeight { job_id, weight } => pool.set_group_weight(&job_id, weight),
            PoolCommand::SetGroupMaxSlots { job_id, max_slots } => {
                pool.set_group_max_slots(&job_id, max_slots)
            }
            PoolCommand::SetGroupPriority {
                job_id,
                priority,
                reply: tx,
            } => reply(tx, pool.set_group_priority(&job_id, priority)),
            PoolCommand::MoveJob {
                job_id,
                anchor_id,
                ahead,
                reply: tx,
            } => reply(tx, pool.move_job(&job_id, &anchor_id, ahead)),
            PoolCommand::RecoverJobPosition { job_id, position } => {
                pool.recover_job_position(job_id, position)
            }
            PoolCommand::JobStopped(job_id) => pool.job_stopped(&job_id),
            PoolCommand::GetJobQ { reply: tx } => reply(tx, pool.get_job_q()),
            PoolCommand::GetJobQPage {
                offset,
                limit,
                reply: tx,
            } => reply(tx, pool.get_job_q_page(offset, limit)),
            PoolCommand::GetJobQStats { reply: tx } => reply(tx, pool.get_job_q_stats()),
            PoolCommand::GetAllocationSummaries { reply: tx } => {
                reply(tx, pool.get_allocation_summaries())
            }
            PoolCommand::ValidateResources { slots, reply: tx } => {
                reply(tx, pool.validate_resources(slots).await)
            }
            PoolCommand::CapacityCheck {
                slots,
                blocked,
                reply: tx,
            } => reply(tx, pool.capacity_check(slots, &blocked).await),
            PoolCommand::GetResourceSummary { reply: tx } => reply(tx, pool.resource_summary().await),
            PoolCommand::AgentUpdated => pool.agent_updated(),
        }
        Ok(true)
    }

    fn next_deadline(&self) -> Option<Instant> {
        Some(self.next_tick)
    }

    async fn on_deadline(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        self.pool.schedule().await;
        self.next_tick = self.clock.now() + self.tick_interval;
        Ok(true)
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        debug!(resource_pool = %self.pool.name(), "resource pool stopped");
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Typed handle to a running pool actor.
#[derive(Debug, Clone)]
pub struct PoolHandle {
    name: String,
    inner: ActorHandle<PoolCommand>,
}

fn actor_error(e: ActorError) -> PoolError {
    match e {
        ActorError::ActorStopped => PoolError::Stopped,
        other => PoolError::Actor(other),
    }
}

impl PoolHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    async fn ask<T: Send + 'static>(&self, make: impl FnOnce(Reply<T>) -> PoolCommand) -> PoolResult<T> {
        self.inner.ask(make).await.map_err(actor_error)
    }

    fn tell(&self, msg: PoolCommand) -> PoolResult<()> {
        self.inner.tell(msg).map_err(actor_error)
    }

    pub async fn allocate(&self, request: AllocateRequest) -> PoolResult<AllocationId> {
        self.ask(|reply| PoolCommand::Allocate { request, reply }).await
    }

    pub fn resources_released(&self, allocation_id: AllocationId, resources_id: Option<ResourcesId>) -> PoolResult<()> {
        self.tell(PoolCommand::ResourcesReleased {
            allocation_id,
            resources_id,
        })
    }

    pub fn set_group_weight(&self, job_id: JobId, weight: f64) -> PoolResult<()> {
        self.tell(PoolCommand::SetGroupWeight { job_id, weight })
    }

    pub fn set_group_max_slots(&self, job_id: JobId, max_slots: Option<usize>) -> PoolResult<()> {
        self.tell(PoolCommand::SetGroupMaxSlots { job_id, max_slots })
    }

    pub async fn set_group_priority(&self, job_id: JobId, priority: i32) -> PoolResult<()> {
        self.ask(|reply| PoolCommand::SetGroupPriority {
            job_id,
            priority,
            reply,
        })
        .await?
    }

    pub async fn move_job(&self, job_id: JobId, anchor_id: JobId, ahead: bool) -> PoolResult<()> {
        self.ask(|reply| PoolCommand::MoveJob {
            job_id,
            anchor_id,
            ahead,
            reply,
        })
        .await?
    }

    pub fn recover_job_position(&self, job_id: JobId, position: QueuePosition) -> PoolResult<()> {
        self.tell(PoolCommand::RecoverJobPosition { job_id, position })
    }

    pub fn job_stopped(&self, job_id: JobId) -> PoolResult<()> {
        self.tell(PoolCommand::JobStopped(job_id))
    }

    pub async fn get_job_q(&self) -> PoolResult<HashMap<JobId, JobQueueInfo>> {
        self.ask(|reply| PoolCommand::GetJobQ { reply }).await
    }

    pub async fn get_job_q_page(&self, offset: i64, limit: i64) -> PoolResult<JobQueuePage> {
        self.ask(|reply| PoolCommand::GetJobQPage { offset, limit, reply })
            .await?
    }

    pub async fn get_job_q_stats(&self) -> PoolResult<QueueStats> {
        self.ask(|reply| PoolCommand::GetJobQStats { reply }).await
    }

    pub async fn get_allocation_summaries(&self) -> PoolResult<BTreeMap<AllocationId, AllocationSummary>> {
        self.ask(|reply| PoolCommand::GetAllocationSummaries { reply })
            .await
    }

    pub async fn validate_resources(&self, slots: usize) -> PoolResult<bool> {
        self.ask(|reply| PoolCommand::ValidateResources { slots, reply })
            .await
    }

    pub async fn capacity_check(&self, slots: usize, blocked: Vec<AgentId>) -> PoolResult<CapacityCheck> {
        self.ask(|reply| PoolCommand::CapacityCheck { slots, blocked, reply })
            .await
    }

    pub async fn resource_summary(&self) -> PoolResult<ResourceSummary> {
        self.ask(|reply| PoolCommand::GetResourceSummary { reply })
            .await
    }

    /// Marks the pool for rescheduling. Never blocks.
    pub fn agent_updated(&self) -> PoolResult<()> {
        self.tell(PoolCommand::AgentUpdated)
    }
}

#[cfg(test)]
pub(super) mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;
    use berth_events::{AllocationEvent, Device, DeviceType};
    use berth_id::ContainerId;

    use super::*;
    use crate::agent::{AgentError, AgentResult, AgentState};
    use crate::clock::SystemClock;
    use crate::config::PoolConfig;
    use crate::pool::{AgentGateway, PoolDeps};
    use crate::publish::RecordingPublisher;
    use crate::scheduler::SchedulerConfig;

    /// One agent that never changes behind the pool's back.
    struct SingleAgent(std::sync::Mutex<AgentState>);

    #[async_trait]
    impl AgentGateway for SingleAgent {
        async fn agent_states(&self, _resource_pool: &str) -> HashMap<AgentId, AgentState> {
            let state = self.0.lock().unwrap().clone();
            [(state.id().clone(), state)].into_iter().collect()
        }

        async fn agent_state(&self, _agent_id: &AgentId) -> AgentResult<AgentState> {
            Ok(self.0.lock().unwrap().clone())
        }

        async fn allocate_free_devices(
            &self,
            _agent_id: &AgentId,
            allocation_id: &AllocationId,
            slots: usize,
            container_id: ContainerId,
        ) -> AgentResult<Vec<Device>> {
            self.0
                .lock()
                .unwrap()
                .reserve_devices(allocation_id.clone(), slots, container_id)
        }

        async fn deallocate_container(&self, agent_id: &AgentId, container_id: ContainerId) -> AgentResult<()> {
            let mut state = self.0.lock().unwrap();
            if state.id() != agent_id {
                return Err(AgentError::UnknownAgent(agent_id.clone()));
            }
            state.deallocate_container(&container_id);
            Ok(())
        }
    }

    pub(crate) fn spawn_pool(config: PoolConfig) -> (PoolHandle, Arc<RecordingPublisher>, watch::Sender<bool>) {
        let devices = vec![
            Device::new(0, DeviceType::Cuda, "GPU-0"),
            Device::new(1, DeviceType::Cuda, "GPU-1"),
        ];
        let agent = AgentState::with_devices(AgentId::from("agent1"), "default", 10, &devices);
        let publisher = Arc::new(RecordingPublisher::new());
        let deps = PoolDeps {
            gateway: Arc::new(SingleAgent(std::sync::Mutex::new(agent))),
            publisher: publisher.clone(),
            clock: Arc::new(SystemClock),
            store: None,
            provisioner: None,
            priority_hook: None,
        };
        let pool = ResourcePool::new(config, deps).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _task) = PoolActor::spawn(
            pool,
            Arc::new(SystemClock),
            Duration::from_millis(100),
            64,
            shutdown_rx,
        );
        (handle, publisher, shutdown_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_places_requests() {
        let (handle, publisher, _shutdown) = spawn_pool(PoolConfig::new("default"));
        let id = handle
            .allocate(AllocateRequest::new(AllocationId::from("alloc1"), JobId::from("job1"), 2))
            .await
            .unwrap();
        assert!(publisher.events().is_empty());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(matches!(
            publisher.for_allocation(&id).as_slice(),
            [AllocationEvent::ResourcesAllocated(_)]
        ));

        let summary = handle.resource_summary().await.unwrap();
        assert_eq!(summary.num_active_slots, 2);

        handle.resources_released(id.clone(), None).unwrap();
        let stats = handle.get_job_q_stats().await.unwrap();
        assert_eq!(stats, QueueStats::default());
        assert!(matches!(
            publisher.for_allocation(&id).last(),
            Some(AllocationEvent::ResourcesReleased(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_operations_through_handle() {
        let (handle, _publisher, _shutdown) =
            spawn_pool(PoolConfig::new("default").with_scheduler(SchedulerConfig::priority(42)));
        for job in ["job1", "job2"] {
            handle
                .allocate(AllocateRequest::new(AllocationId::from(job), JobId::from(job), 4))
                .await
                .unwrap();
        }

        handle
            .move_job(JobId::from("job2"), JobId::from("job1"), true)
            .await
            .unwrap();
        let page = handle.get_job_q_page(0, 1).await.unwrap();
        assert_eq!(page.jobs[0].0, JobId::from("job2"));
        assert_eq!(page.pagination.total, 2);

        assert!(matches!(
            handle.set_group_priority(JobId::from("job1"), 100).await,
            Err(PoolError::Scheduler(_))
        ));
        assert!(handle.validate_resources(2).await.unwrap());
        assert!(!handle.validate_resources(3).await.unwrap());
        let check = handle.capacity_check(4, vec![]).await.unwrap();
        assert!(check.capacity_exceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_pool() {
        let (handle, _publisher, shutdown) = spawn_pool(PoolConfig::new("default"));
        shutdown.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(handle.is_stopped());
        assert!(matches!(handle.get_job_q().await, Err(PoolError::Stopped)));
        assert!(matches!(handle.agent_updated(), Err(PoolError::Stopped)));
    }
}
