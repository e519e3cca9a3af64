//! Registry of every agent connected to this manager.
//!
//! The fleet routes incoming connections to the right agent actor, rebuilds
//! agents from their snapshots on startup and serves operator requests.
//! Resource pools reach agents through the [`AgentGateway`] it implements.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use berth_events::{Device, DeviceId, StartContainer};
use berth_id::{AgentId, AllocationId, ContainerId};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::{
    AgentActor, AgentConnection, AgentDeps, AgentError, AgentHandle, AgentResult, AgentSocket, AgentState,
    AgentSummary, ConnectionConfig, SlotPatch, SlotSummary,
};
use crate::pool::AgentGateway;
use crate::store::StoreResult;

/// Agent settings that depend on the agent's resource pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolAgentOptions {
    pub max_zero_slot_containers: usize,
    /// Whether containers survive an agent reconnect or manager restart.
    pub agent_reattach_enabled: bool,
}

impl Default for PoolAgentOptions {
    fn default() -> Self {
        Self {
            max_zero_slot_containers: 100,
            agent_reattach_enabled: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub reconnect_wait: Duration,
    pub mailbox_size: usize,
    /// Upper bound on each per-agent ask during fan-out.
    pub ask_timeout: Duration,
    pub pools: HashMap<String, PoolAgentOptions>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            reconnect_wait: Duration::from_secs(25),
            mailbox_size: 256,
            ask_timeout: Duration::from_secs(5),
            pools: HashMap::new(),
        }
    }
}

impl FleetConfig {
    pub fn pool_options(&self, pool: &str) -> PoolAgentOptions {
        self.pools.get(pool).copied().unwrap_or_default()
    }

    fn connection_config(&self, pool: &str) -> ConnectionConfig {
        ConnectionConfig {
            reconnect_wait: self.reconnect_wait,
            max_zero_slot_containers: self.pool_options(pool).max_zero_slot_containers,
        }
    }
}

pub struct Fleet {
    config: FleetConfig,
    deps: AgentDeps,
    agents: RwLock<HashMap<AgentId, AgentHandle>>,
    shutdown: watch::Receiver<bool>,
}

impl Fleet {
    pub fn new(config: FleetConfig, deps: AgentDeps, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            config,
            deps,
            agents: RwLock::new(HashMap::new()),
            shutdown,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<AgentId, AgentHandle>> {
        self.agents.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<AgentId, AgentHandle>> {
        self.agents.write().unwrap_or_else(|e| e.into_inner())
    }

    /// The handle of a live agent. Handles of stopped agents are pruned.
    pub fn handle(&self, agent_id: &AgentId) -> AgentResult<AgentHandle> {
        let handle = self.read().get(agent_id).cloned();
        match handle {
            Some(handle) if !handle.is_stopped() => Ok(handle),
            Some(_) => {
                self.remove_stopped(agent_id);
                Err(AgentError::UnknownAgent(agent_id.clone()))
            }
            None => Err(AgentError::UnknownAgent(agent_id.clone())),
        }
    }

    fn remove_stopped(&self, agent_id: &AgentId) {
        let mut agents = self.write();
        if agents.get(agent_id).is_some_and(AgentHandle::is_stopped) {
            debug!(agent_id = %agent_id, "pruning stopped agent");
            agents.remove(agent_id);
        }
    }

    fn spawn(&self, conn: AgentConnection) -> AgentHandle {
        let id = conn.id().clone();
        let (handle, _task) = AgentActor::spawn(conn, self.config.mailbox_size, self.shutdown.clone());
        self.write().insert(id, handle.clone());
        handle
    }

    // =========================================================================
    // Connections
    // =========================================================================

    /// Routes a new agent socket.
    ///
    /// - a reconnect for a live agent resumes it
    /// - a reconnect with no live agent restores from its snapshot when the
    ///   pool allows reattach
    /// - a fresh connection for a live agent is rejected
    #[instrument(skip(self, agent_id, socket, version), fields(agent_id = %agent_id))]
    pub async fn handle_connection(
        &self,
        agent_id: AgentId,
        resource_pool: &str,
        reconnect: bool,
        socket: AgentSocket,
        version: &str,
    ) -> AgentResult<AgentHandle> {
        if let Ok(handle) = self.handle(&agent_id) {
            if !reconnect {
                warn!(resource_pool, "fresh connection for agent that is still registered");
                return Err(AgentError::AlreadyConnected);
            }
            if handle.resource_pool() != resource_pool {
                warn!(
                    registered_pool = handle.resource_pool(),
                    resource_pool, "agent reconnected with a different resource pool, keeping the registered one"
                );
            }
            match handle.connect(socket.clone(), version).await {
                Ok(()) => return Ok(handle),
                Err(AgentError::Stopped) => self.remove_stopped(&agent_id),
                Err(e) => return Err(e),
            }
        }

        let config = self.config.connection_config(resource_pool);
        let mut conn = None;
        if reconnect && self.config.pool_options(resource_pool).agent_reattach_enabled {
            if let Some(state) = self.load_state(&agent_id, resource_pool) {
                conn = Some(AgentConnection::restored(config.clone(), self.deps.clone(), state));
            }
        }
        let conn = conn.unwrap_or_else(|| {
            AgentConnection::new(agent_id.clone(), resource_pool, config, self.deps.clone())
        });

        let handle = self.spawn(conn);
        handle.connect(socket, version).await?;
        Ok(handle)
    }

    fn load_state(&self, agent_id: &AgentId, resource_pool: &str) -> Option<AgentState> {
        let store = self.deps.store.as_ref()?;
        let snapshot = match store.load_agent_snapshots(&[resource_pool.to_string()]) {
            Ok(snapshots) => snapshots.into_iter().find(|s| &s.agent_id == agent_id)?,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "failed to load agent snapshot");
                return None;
            }
        };
        let containers = match store.load_containers(&snapshot.containers) {
            Ok(containers) => containers,
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "failed to load agent containers");
                return None;
            }
        };
        match AgentState::from_snapshot(&snapshot, containers) {
            Ok(state) => Some(state),
            Err(e) => {
                warn!(agent_id = %agent_id, error = %e, "discarding agent snapshot");
                None
            }
        }
    }

    /// Spawns every persisted agent of the given pools, each waiting for its
    /// agent to reconnect. Returns how many were restored.
    pub fn restore(&self, pools: &[String]) -> StoreResult<usize> {
        let Some(store) = self.deps.store.clone() else {
            return Ok(0);
        };

        let mut restored = 0;
        for snapshot in store.load_agent_snapshots(pools)? {
            if self.read().contains_key(&snapshot.agent_id) {
                continue;
            }
            let containers = store.load_containers(&snapshot.containers)?;
            let state = match AgentState::from_snapshot(&snapshot, containers) {
                Ok(state) => state,
                Err(e) => {
                    warn!(agent_id = %snapshot.agent_id, error = %e, "discarding agent snapshot");
                    continue;
                }
            };
            let config = self.config.connection_config(state.resource_pool());
            self.spawn(AgentConnection::restored(config, self.deps.clone(), state));
            restored += 1;
        }

        info!(restored, "restored agents from snapshots");
        Ok(restored)
    }

    // =========================================================================
    // Operator requests
    // =========================================================================

    pub async fn get(&self, agent_id: &AgentId) -> AgentResult<AgentSummary> {
        self.handle(agent_id)?.summary().await
    }

    /// Summaries of every agent, optionally restricted to one pool.
    ///
    /// Agents that fail or time out are left out.
    pub async fn list(&self, resource_pool: Option<&str>) -> Vec<AgentSummary> {
        let timeout = self.config.ask_timeout;
        let mut tasks = JoinSet::new();
        for handle in self.handles(resource_pool) {
            tasks.spawn(async move {
                let id = handle.id().clone();
                (id, tokio::time::timeout(timeout, handle.summary()).await)
            });
        }

        let mut summaries = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(Ok(summary)))) => summaries.push(summary),
                Ok((id, Ok(Err(e)))) => debug!(agent_id = %id, error = %e, "skipping agent in list"),
                Ok((id, Err(_))) => warn!(agent_id = %id, "agent summary timed out"),
                Err(e) => warn!(error = %e, "agent summary task failed"),
            }
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    fn handles(&self, resource_pool: Option<&str>) -> Vec<AgentHandle> {
        self.read()
            .values()
            .filter(|h| !h.is_stopped())
            .filter(|h| resource_pool.map_or(true, |pool| h.resource_pool() == pool))
            .cloned()
            .collect()
    }

    pub async fn enable_agent(&self, agent_id: &AgentId) -> AgentResult<AgentSummary> {
        self.handle(agent_id)?.enable().await
    }

    pub async fn disable_agent(&self, agent_id: &AgentId, drain: bool) -> AgentResult<AgentSummary> {
        self.handle(agent_id)?.disable(drain).await
    }

    pub async fn enable_slot(&self, agent_id: &AgentId, device_id: DeviceId) -> AgentResult<SlotSummary> {
        let patch = SlotPatch {
            enabled: Some(true),
            drain: None,
        };
        self.handle(agent_id)?.patch_slot(device_id, patch).await
    }

    pub async fn disable_slot(&self, agent_id: &AgentId, device_id: DeviceId, drain: bool) -> AgentResult<SlotSummary> {
        let patch = SlotPatch {
            enabled: Some(false),
            drain: Some(drain),
        };
        self.handle(agent_id)?.patch_slot(device_id, patch).await
    }

    pub async fn slot(&self, agent_id: &AgentId, device_id: DeviceId) -> AgentResult<SlotSummary> {
        self.handle(agent_id)?.slot(device_id).await
    }

    pub async fn start_container(&self, agent_id: &AgentId, msg: StartContainer) -> AgentResult<()> {
        self.handle(agent_id)?.start_container(msg).await
    }

    pub fn kill_container(&self, agent_id: &AgentId, container_id: ContainerId) -> AgentResult<()> {
        self.handle(agent_id)?.kill_container(container_id)
    }
}

#[async_trait]
impl AgentGateway for Fleet {
    async fn agent_states(&self, resource_pool: &str) -> HashMap<AgentId, AgentState> {
        let timeout = self.config.ask_timeout;
        let mut tasks = JoinSet::new();
        for handle in self.handles(Some(resource_pool)) {
            tasks.spawn(async move { tokio::time::timeout(timeout, handle.state()).await });
        }

        let mut states = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Ok(state))) => {
                    states.insert(state.id().clone(), state);
                }
                // Not started yet, or stopped while we asked.
                Ok(Ok(Err(_))) => {}
                Ok(Err(_)) => warn!(resource_pool, "agent state ask timed out"),
                Err(e) => warn!(error = %e, "agent state task failed"),
            }
        }
        states
    }

    async fn agent_state(&self, agent_id: &AgentId) -> AgentResult<AgentState> {
        self.handle(agent_id)?.state().await
    }

    async fn allocate_free_devices(
        &self,
        agent_id: &AgentId,
        allocation_id: &AllocationId,
        slots: usize,
        container_id: ContainerId,
    ) -> AgentResult<Vec<Device>> {
        self.handle(agent_id)?
            .allocate_free_devices(allocation_id.clone(), slots, container_id)
            .await
    }

    async fn deallocate_container(&self, agent_id: &AgentId, container_id: ContainerId) -> AgentResult<()> {
        self.handle(agent_id)?.deallocate_container(container_id).await
    }
}
