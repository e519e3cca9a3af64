//! Connection lifecycle of a single agent.
//!
//! `AgentConnection` is a synchronous state machine; the agent actor drives
//! it from socket events, requests and its reconnect deadline. While the
//! socket is down the agent is disabled with draining, outgoing start and
//! kill requests are buffered, and on reconnect the containers the agent
//! still runs are reattached.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use berth_events::{
    AgentMessage, AgentShutdown, AgentStarted, AllocationEvent, AllocationLog, Container,
    ContainerLog, ContainerReattach, ContainerReattachAck, ContainerState, ContainerStateChanged,
    ContainerStopped, Device, DeviceId, FailureKind, ManagerMessage, ReleaseResources,
    ResourcesStateChanged, SetAgentOptions, StartContainer, ERR_AGENT_MUST_RECONNECT,
};
use berth_id::{AgentId, AllocationId, ContainerId};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{AgentError, AgentEvent, AgentListener, AgentResult, AgentState, AgentSummary, SlotPatch, SlotSummary};
use crate::clock::Clock;
use crate::publish::AllocationPublisher;
use crate::store::Store;

const REATTACH_FAILED: &str = "failed to reattach container on reconnect";
const CLOSED_WITH_CONTAINERS: &str = "agent closed with allocated containers";
const RECONNECT_DEADLINE_EXCEEDED: &str = "agent failed to reconnect by deadline";

/// Per-agent tunables.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a started agent may stay disconnected before it is dropped.
    pub reconnect_wait: Duration,
    pub max_zero_slot_containers: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_wait: Duration::from_secs(25),
            max_zero_slot_containers: 100,
        }
    }
}

/// Collaborators shared by every agent of a manager.
#[derive(Clone)]
pub struct AgentDeps {
    pub clock: Arc<dyn Clock>,
    pub publisher: Arc<dyn AllocationPublisher>,
    pub listener: Arc<dyn AgentListener>,
    pub store: Option<Arc<dyn Store>>,
}

/// The outbound half of an agent socket.
///
/// Dropping the sender closes the socket.
#[derive(Debug, Clone)]
pub struct AgentSocket {
    pub outbox: mpsc::UnboundedSender<ManagerMessage>,
    pub address: String,
}

impl AgentSocket {
    pub fn new(outbox: mpsc::UnboundedSender<ManagerMessage>, address: impl Into<String>) -> Self {
        Self {
            outbox,
            address: address.into(),
        }
    }
}

/// A request held back while the agent is reconnecting.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferedMessage {
    StartContainer(StartContainer),
    KillContainer(ContainerId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// Socket open, `AgentStarted` not seen yet.
    AwaitingStart,
    Connected,
    AwaitingReconnect,
    Stopped,
}

pub struct AgentConnection {
    id: AgentId,
    resource_pool: String,
    config: ConnectionConfig,
    deps: AgentDeps,

    socket: Option<AgentSocket>,
    address: String,
    version: String,
    registered_at: DateTime<Utc>,

    state: Option<AgentState>,
    started: bool,
    awaiting_restore: bool,
    awaiting_reconnect: bool,
    reconnect_deadline: Option<Instant>,
    pre_disconnect_enabled: bool,
    pre_disconnect_draining: bool,
    backlog: Vec<BufferedMessage>,

    stopped: Option<String>,
}

impl AgentConnection {
    pub fn new(id: AgentId, resource_pool: impl Into<String>, config: ConnectionConfig, deps: AgentDeps) -> Self {
        let registered_at = deps.clock.utc_now();
        Self {
            id,
            resource_pool: resource_pool.into(),
            config,
            deps,
            socket: None,
            address: String::new(),
            version: String::new(),
            registered_at,
            state: None,
            started: false,
            awaiting_restore: false,
            awaiting_reconnect: false,
            reconnect_deadline: None,
            pre_disconnect_enabled: true,
            pre_disconnect_draining: false,
            backlog: Vec::new(),
            stopped: None,
        }
    }

    /// An agent rebuilt from its snapshot after a manager restart.
    ///
    /// It starts out waiting for the agent to reconnect and is dropped if it
    /// does not show up before the reconnect deadline.
    pub fn restored(config: ConnectionConfig, deps: AgentDeps, mut state: AgentState) -> Self {
        state.set_max_zero_slot_containers(config.max_zero_slot_containers);
        let mut conn = Self::new(state.id().clone(), state.resource_pool().to_string(), config, deps);
        info!(agent_id = %conn.id, resource_pool = %conn.resource_pool, "restoring agent");
        conn.state = Some(state);
        conn.started = true;
        conn.awaiting_restore = true;
        conn.notify_updated();
        conn.socket_disconnected();
        conn
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn resource_pool(&self) -> &str {
        &self.resource_pool
    }

    pub fn phase(&self) -> ConnectionPhase {
        if self.stopped.is_some() {
            ConnectionPhase::Stopped
        } else if self.awaiting_reconnect {
            ConnectionPhase::AwaitingReconnect
        } else if self.started {
            ConnectionPhase::Connected
        } else {
            ConnectionPhase::AwaitingStart
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_some()
    }

    /// Why the agent stopped, once it has.
    pub fn stop_cause(&self) -> Option<&str> {
        self.stopped.as_deref()
    }

    pub fn is_awaiting_restore(&self) -> bool {
        self.awaiting_restore
    }

    pub fn reconnect_deadline(&self) -> Option<Instant> {
        self.reconnect_deadline
    }

    pub fn backlog(&self) -> &[BufferedMessage] {
        &self.backlog
    }

    // =========================================================================
    // Socket lifecycle
    // =========================================================================

    /// Attaches a new socket.
    ///
    /// A second socket for an agent that is still connected is refused and
    /// the existing connection is left alone.
    pub fn connect(&mut self, socket: AgentSocket, version: impl Into<String>) -> AgentResult<()> {
        if self.stopped.is_some() {
            return Err(AgentError::Stopped);
        }
        if self.socket.is_some() {
            warn!(agent_id = %self.id, address = %socket.address, "rejecting second socket for connected agent");
            return Err(AgentError::AlreadyConnected);
        }

        self.address = socket.address.clone();
        self.version = version.into();
        self.socket = Some(socket);

        let mut options = SetAgentOptions {
            resource_pool: self.resource_pool.clone(),
            containers_to_reattach: Vec::new(),
        };
        if self.awaiting_reconnect {
            options.containers_to_reattach = self.gather_containers_to_reattach();
        }
        self.send(ManagerMessage::SetAgentOptions(options));
        self.awaiting_restore = false;

        if self.awaiting_reconnect {
            info!(agent_id = %self.id, address = %self.address, "agent reconnected");
            self.awaiting_reconnect = false;
            self.reconnect_deadline = None;

            if let Some(state) = self.state.as_mut() {
                if self.pre_disconnect_enabled {
                    state.enable();
                } else {
                    state.disable(self.pre_disconnect_draining);
                }
            }
            self.patch_all_slots();

            let backlog = std::mem::take(&mut self.backlog);
            for (i, msg) in backlog.into_iter().enumerate() {
                debug!(agent_id = %self.id, index = i, message = ?msg, "sending buffered message");
                match msg {
                    BufferedMessage::StartContainer(start) => {
                        if let Err(e) = self.start_container(start) {
                            error!(agent_id = %self.id, error = %e, "failed to replay buffered start");
                        }
                    }
                    BufferedMessage::KillContainer(container_id) => self.kill_container(container_id),
                }
            }
            self.notify_updated();
        } else {
            info!(agent_id = %self.id, address = %self.address, "agent connected");
        }

        Ok(())
    }

    /// Handles the socket going away, with `error` set when it failed.
    pub fn socket_closed(&mut self, error: Option<String>) {
        if self.stopped.is_some() {
            return;
        }
        self.socket = None;

        match error {
            Some(err) if !self.started => {
                self.stop(Some(format!("child failed: {err}")));
                return;
            }
            Some(err) => {
                error!(agent_id = %self.id, error = %err, "agent socket failed, awaiting reconnect");
            }
            None if !self.started => {
                self.stop(None);
                return;
            }
            None => {
                info!(agent_id = %self.id, "agent socket closed, awaiting reconnect");
            }
        }

        self.socket_disconnected();
    }

    fn socket_disconnected(&mut self) {
        self.socket = None;
        self.awaiting_reconnect = true;
        self.reconnect_deadline = Some(self.deps.clock.now() + self.config.reconnect_wait);

        if let Some(state) = self.state.as_mut() {
            self.pre_disconnect_enabled = state.is_enabled();
            self.pre_disconnect_draining = state.is_draining();
            state.disable(true);
        }
        self.patch_all_slots();
        self.notify_updated();
    }

    /// Stops the agent if it is still disconnected past its deadline.
    ///
    /// Returns true when the agent was stopped.
    pub fn check_reconnect_deadline(&mut self) -> bool {
        match self.reconnect_deadline {
            Some(deadline) if self.awaiting_reconnect && self.deps.clock.now() >= deadline => {
                self.stop(Some(RECONNECT_DEADLINE_EXCEEDED.to_string()));
                true
            }
            _ => false,
        }
    }

    // =========================================================================
    // Inbound protocol
    // =========================================================================

    pub fn handle_message(&mut self, msg: AgentMessage) {
        if self.stopped.is_some() {
            debug!(agent_id = %self.id, kind = msg.kind(), "ignoring message for stopped agent");
            return;
        }
        match msg {
            AgentMessage::AgentStarted(started) => self.handle_agent_started(started),
            AgentMessage::ContainerStateChanged(sc) => self.container_state_changed(sc),
            AgentMessage::ContainerLog(log) => self.container_log(log),
            AgentMessage::ContainerStats(record) => {
                debug!(
                    agent_id = %self.id,
                    container_id = %record.container_id,
                    end_stats = record.end_stats,
                    "received container stats"
                );
            }
        }
    }

    fn handle_agent_started(&mut self, msg: AgentStarted) {
        info!(
            agent_id = %self.id,
            address = %self.address,
            resource_pool = %self.resource_pool,
            slots = msg.devices.len(),
            version = %msg.version,
            "agent started"
        );
        if !msg.version.is_empty() {
            self.version = msg.version.clone();
        }

        if self.started {
            let mismatch = self
                .state
                .as_ref()
                .and_then(|state| state.check_agent_started_devices_match(&msg.devices).err());
            if let Some(err) = mismatch {
                error!(agent_id = %self.id, error = %err, "change in agent devices was detected");
                self.send(ManagerMessage::AgentShutdown(AgentShutdown {
                    error_msg: ERR_AGENT_MUST_RECONNECT.to_string(),
                }));
                self.stop(Some(err.to_string()));
                return;
            }
        } else {
            self.agent_started(&msg.devices);
        }

        self.started = true;
        self.handle_containers_reattached(msg.containers_reattached);
    }

    fn agent_started(&mut self, devices: &[Device]) {
        let mut state = AgentState::new(
            self.id.clone(),
            self.resource_pool.clone(),
            self.config.max_zero_slot_containers,
        );
        state.agent_started(devices);
        info!(agent_id = %self.id, slots = state.num_slots(), "adding agent");
        self.state = Some(state);
        self.persist();
        self.notify_updated();
    }

    fn handle_containers_reattached(&mut self, acks: Vec<ContainerReattachAck>) {
        let Some(state) = self.state.as_ref() else {
            return;
        };

        let mut recovered = HashSet::new();
        let mut doomed: HashMap<ContainerId, ContainerReattachAck> = HashMap::new();

        for ack in acks {
            let cid = ack.container.id.clone();
            if let Some(failure) = &ack.failure {
                if failure.kind == FailureKind::RestoreError {
                    info!(agent_id = %self.id, container_id = %cid, failure = %failure, "agent failed to restore container");
                } else {
                    info!(agent_id = %self.id, container_id = %cid, failure = %failure, "container terminated while agent was away");
                }
                doomed.insert(cid, ack);
                continue;
            }

            if ack.container.state == ContainerState::Terminated {
                warn!(agent_id = %self.id, container_id = %cid, "reattached container is terminated");
                doomed.insert(cid, ack);
                continue;
            }

            if !state.container_allocation().contains_key(&cid) {
                warn!(agent_id = %self.id, container_id = %cid, "agent state is missing reattached container");
                doomed.insert(cid, ack);
                continue;
            }

            match state.container_state().get(&cid) {
                Some(known) if known.state == ack.container.state => {}
                known => {
                    warn!(
                        agent_id = %self.id,
                        container_id = %cid,
                        known = ?known.map(|c| c.state),
                        reported = ?ack.container.state,
                        "reattached container changed state"
                    );
                    doomed.insert(cid, ack);
                    continue;
                }
            }

            recovered.insert(cid);
        }

        self.clear_non_reattached(&recovered, &doomed);
    }

    /// Terminates and kills every allocated container that was not
    /// recovered, then drops them from the ledger.
    fn clear_non_reattached(
        &mut self,
        recovered: &HashSet<ContainerId>,
        doomed: &HashMap<ContainerId, ContainerReattachAck>,
    ) {
        let Some(state) = self.state.as_ref() else {
            return;
        };

        let mut lost: Vec<Container> = state
            .container_allocation()
            .keys()
            .filter(|cid| !recovered.contains(*cid))
            .map(|cid| {
                state
                    .container_state()
                    .get(cid)
                    .cloned()
                    .unwrap_or_else(|| Container::assigned(cid.clone()))
            })
            .collect();
        lost.sort_by(|a, b| a.id.cmp(&b.id));

        for container in lost {
            let cid = container.id.clone();
            let stopped = match doomed.get(&cid).and_then(|ack| ack.failure.clone()) {
                Some(failure) => ContainerStopped {
                    failure: Some(failure),
                },
                None => ContainerStopped::error(FailureKind::AgentFailed, REATTACH_FAILED),
            };
            self.container_state_changed(ContainerStateChanged::terminated(container, stopped));
            self.send(ManagerMessage::kill(cid));
        }

        let updated = self
            .state
            .as_mut()
            .is_some_and(|state| state.clear_unless_recovered(recovered));
        if updated {
            self.persist();
            self.notify_updated();
        }
    }

    fn container_state_changed(&mut self, mut sc: ContainerStateChanged) {
        let Some(state) = self.state.as_mut() else {
            warn!(agent_id = %self.id, container_id = %sc.container.id, "container state change before agent started");
            return;
        };

        let Some(allocation_id) = state.allocation_of(&sc.container.id).cloned() else {
            if sc.container.state != ContainerState::Terminated {
                warn!(
                    agent_id = %self.id,
                    container_id = %sc.container.id,
                    state = ?sc.container.state,
                    "container state change for container not allocated to agent"
                );
            }
            return;
        };

        match sc.container.state {
            ContainerState::Running => {
                let started = sc.started.get_or_insert_with(Default::default);
                if started.proxy_address.as_deref().map_or(true, str::is_empty) {
                    started.proxy_address = Some(self.address.clone());
                }
            }
            ContainerState::Terminated => {
                let failure = sc.stopped.as_ref().and_then(|s| s.failure.as_ref());
                info!(
                    agent_id = %self.id,
                    container_id = %sc.container.id,
                    failure = ?failure.map(ToString::to_string),
                    "container terminated"
                );
                state.remove_container_allocation(&sc.container.id);
            }
            _ => {}
        }

        self.deps
            .publisher
            .publish(AllocationEvent::ResourcesStateChanged(ResourcesStateChanged::from_container_change(
                allocation_id,
                &sc,
            )));

        state.container_state_changed(&sc);
        self.persist();
        if let Some(store) = &self.deps.store {
            if let Err(e) = store.update_container_state(&sc.container) {
                warn!(agent_id = %self.id, container_id = %sc.container.id, error = %e, "failed to persist container state");
            }
        }
        if sc.container.state == ContainerState::Terminated {
            self.notify_updated();
        }
    }

    fn container_log(&self, log: ContainerLog) {
        let allocation_id = self
            .state
            .as_ref()
            .and_then(|state| state.allocation_of(&log.container_id))
            .cloned();
        match allocation_id {
            Some(allocation_id) => self
                .deps
                .publisher
                .publish(AllocationEvent::ContainerLog(AllocationLog { allocation_id, log })),
            None => warn!(
                agent_id = %self.id,
                container_id = %log.container_id,
                "dropping log for container not allocated to agent"
            ),
        }
    }

    // =========================================================================
    // Requests
    // =========================================================================

    /// Launches a container on its reserved devices, or buffers the request
    /// while the agent is reconnecting.
    pub fn start_container(&mut self, msg: StartContainer) -> AgentResult<()> {
        if self.awaiting_reconnect {
            debug!(agent_id = %self.id, container_id = %msg.container.id, "buffering start container");
            self.backlog.push(BufferedMessage::StartContainer(msg));
            return Ok(());
        }
        if !self.started {
            return Err(AgentError::NotStarted);
        }

        let state = self.state.as_mut().ok_or(AgentError::NotStarted)?;
        if state.is_container_bound(&msg.container.id) {
            debug!(agent_id = %self.id, container_id = %msg.container.id, "ignoring repeated start container");
            return Ok(());
        }
        state.start_container(msg.allocation_id.clone(), &msg.container)?;

        info!(
            agent_id = %self.id,
            allocation_id = %msg.allocation_id,
            container_id = %msg.container.id,
            slots = msg.container.devices.len(),
            "starting container"
        );
        self.send(ManagerMessage::StartContainer(msg.clone()));
        self.persist();
        if let Some(store) = &self.deps.store {
            if let Err(e) = store.update_container_state(&msg.container) {
                warn!(agent_id = %self.id, container_id = %msg.container.id, error = %e, "failed to persist container state");
            }
        }
        Ok(())
    }

    /// Sends SIGKILL to a container, or buffers it while reconnecting.
    pub fn kill_container(&mut self, container_id: ContainerId) {
        if self.awaiting_reconnect {
            debug!(agent_id = %self.id, container_id = %container_id, "buffering kill container");
            self.backlog.push(BufferedMessage::KillContainer(container_id));
            return;
        }
        info!(agent_id = %self.id, container_id = %container_id, "killing container");
        self.send(ManagerMessage::kill(container_id));
    }

    pub fn allocate_free_devices(
        &mut self,
        allocation_id: AllocationId,
        slots: usize,
        container_id: ContainerId,
    ) -> AgentResult<Vec<Device>> {
        self.started_state_mut()?
            .reserve_devices(allocation_id, slots, container_id)
    }

    pub fn deallocate_container(&mut self, container_id: &ContainerId) -> AgentResult<()> {
        self.started_state_mut()?.deallocate_container(container_id);
        self.persist();
        self.notify_updated();
        Ok(())
    }

    /// A copy of the ledger for scheduling.
    pub fn agent_state(&self) -> AgentResult<AgentState> {
        if !self.started {
            return Err(AgentError::NotStarted);
        }
        self.state.clone().ok_or(AgentError::NotStarted)
    }

    pub fn enable(&mut self) -> AgentResult<AgentSummary> {
        self.check_settable()?;
        if let Some(state) = self.state.as_mut() {
            state.enable();
        }
        self.patch_all_slots();
        self.persist();
        self.notify_updated();
        Ok(self.summary())
    }

    /// Disables the agent. Without `drain`, every allocation on it is asked
    /// to release immediately.
    pub fn disable(&mut self, drain: bool) -> AgentResult<AgentSummary> {
        self.check_settable()?;
        let mut allocations = BTreeSet::new();
        if let Some(state) = self.state.as_mut() {
            state.disable(drain);
            if !drain {
                allocations.extend(state.container_allocation().values().cloned());
            }
        }
        self.patch_all_slots();

        for allocation_id in allocations {
            self.deps
                .publisher
                .publish(AllocationEvent::ReleaseResources(ReleaseResources {
                    allocation_id,
                    reason: "agent disabled".to_string(),
                    force_kill: true,
                }));
        }
        self.persist();
        self.notify_updated();
        Ok(self.summary())
    }

    pub fn patch_slot(&mut self, device_id: DeviceId, patch: SlotPatch) -> AgentResult<SlotSummary> {
        let (summary, release) = self.started_state_mut()?.patch_slot_state(device_id, patch)?;
        if let Some(release) = release {
            self.deps.publisher.publish(AllocationEvent::ReleaseResources(release));
        }
        self.persist();
        self.notify_updated();
        Ok(summary)
    }

    pub fn slot(&self, device_id: DeviceId) -> AgentResult<SlotSummary> {
        let state = self.state.as_ref().filter(|_| self.started).ok_or(AgentError::NotStarted)?;
        state.slot_summary(device_id).ok_or(AgentError::SlotNotFound(device_id))
    }

    pub fn summary(&self) -> AgentSummary {
        let (enabled, draining, num_containers, slots, idle) = match &self.state {
            Some(state) => (
                state.is_enabled(),
                state.is_draining(),
                state.container_state().len(),
                state.slots_summary(),
                state.idle(),
            ),
            None => (true, false, 0, Vec::new(), true),
        };
        AgentSummary {
            id: self.id.clone(),
            registered_at: self.registered_at,
            resource_pool: self.resource_pool.clone(),
            address: self.address.clone(),
            version: self.version.clone(),
            enabled,
            draining,
            num_containers,
            slots,
            idle,
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Removes the agent for good.
    ///
    /// Containers still allocated are reported terminated with an
    /// agent-failed cause and the persisted snapshot is deleted.
    pub fn stop(&mut self, cause: Option<String>) {
        if self.stopped.is_some() {
            return;
        }
        if let Some(cause) = &cause {
            error!(agent_id = %self.id, address = %self.address, started = self.started, error = %cause, "agent crashed");
        }

        if self.started {
            self.restore_containers_field();
            let mut container_ids: Vec<ContainerId> = self
                .state
                .as_ref()
                .map(|state| state.container_allocation().keys().cloned().collect())
                .unwrap_or_default();
            container_ids.sort();

            for cid in container_ids {
                let container = Container {
                    id: cid,
                    state: ContainerState::Terminated,
                    devices: Vec::new(),
                };
                self.container_state_changed(ContainerStateChanged::terminated(
                    container,
                    ContainerStopped::error(FailureKind::AgentFailed, CLOSED_WITH_CONTAINERS),
                ));
            }

            if let Some(store) = &self.deps.store {
                if let Err(e) = store.delete_agent_snapshot(&self.id) {
                    warn!(agent_id = %self.id, error = %e, "failed to delete agent snapshot");
                }
            }
        } else {
            info!(agent_id = %self.id, "agent disconnected but wasn't started");
        }

        self.socket = None;
        self.awaiting_reconnect = false;
        self.reconnect_deadline = None;
        self.backlog.clear();
        self.stopped = Some(cause.unwrap_or_else(|| "agent disconnected".to_string()));

        info!(agent_id = %self.id, resource_pool = %self.resource_pool, "removing agent");
        self.deps.listener.notify(AgentEvent::Removed {
            agent_id: self.id.clone(),
            resource_pool: self.resource_pool.clone(),
        });
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn check_settable(&self) -> AgentResult<()> {
        if self.stopped.is_some() {
            return Err(AgentError::Stopped);
        }
        if self.awaiting_reconnect {
            return Err(AgentError::Recovering);
        }
        if !self.started {
            return Err(AgentError::NotStarted);
        }
        Ok(())
    }

    fn started_state_mut(&mut self) -> AgentResult<&mut AgentState> {
        if !self.started {
            return Err(AgentError::NotStarted);
        }
        self.state.as_mut().ok_or(AgentError::NotStarted)
    }

    fn send(&self, msg: ManagerMessage) {
        match &self.socket {
            Some(socket) => {
                if socket.outbox.send(msg).is_err() {
                    warn!(agent_id = %self.id, "agent socket closed, dropping message");
                }
            }
            None => warn!(agent_id = %self.id, "no agent socket, dropping message"),
        }
    }

    fn patch_all_slots(&mut self) {
        let releases = match self.state.as_mut() {
            Some(state) => state.patch_all_slots_state(),
            None => return,
        };
        for release in releases {
            self.deps.publisher.publish(AllocationEvent::ReleaseResources(release));
        }
    }

    fn restore_containers_field(&mut self) {
        let (Some(store), Some(state)) = (&self.deps.store, self.state.as_mut()) else {
            return;
        };
        match store.load_containers_to_allocation_ids(&state.container_ids()) {
            Ok(allocations) => state.restore_containers_field(allocations),
            Err(e) => warn!(agent_id = %self.id, error = %e, "failed to restore container allocations"),
        }
    }

    fn gather_containers_to_reattach(&mut self) -> Vec<ContainerReattach> {
        self.restore_containers_field();
        let Some(state) = self.state.as_ref() else {
            return Vec::new();
        };
        let mut containers: Vec<ContainerReattach> = state
            .container_state()
            .values()
            .map(|container| ContainerReattach {
                container: container.clone(),
            })
            .collect();
        containers.sort_by(|a, b| a.container.id.cmp(&b.container.id));
        containers
    }

    fn persist(&self) {
        let (Some(store), Some(state)) = (&self.deps.store, &self.state) else {
            return;
        };
        if let Err(e) = store.persist_agent_snapshot(&state.snapshot()) {
            warn!(agent_id = %self.id, error = %e, "failed to persist agent snapshot");
        }
    }

    fn notify_updated(&self) {
        self.deps.listener.notify(AgentEvent::Updated {
            agent_id: self.id.clone(),
            resource_pool: self.resource_pool.clone(),
        });
    }
}
