//! Runs an [`AgentConnection`] as an actor.
//!
//! Every socket event and request for one agent goes through its mailbox, so
//! the connection state machine never sees concurrent access. The reconnect
//! deadline is the actor's timer.

use async_trait::async_trait;
use berth_events::{AgentMessage, DeviceId, Device, StartContainer};
use berth_id::{AgentId, AllocationId, ContainerId};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error};

use super::{AgentConnection, AgentError, AgentResult, AgentSocket, AgentState, AgentSummary, SlotPatch, SlotSummary};
use crate::actor::{self, Actor, ActorContext, ActorError, ActorHandle};

type Reply<T> = oneshot::Sender<AgentResult<T>>;

/// Mailbox message of an agent actor.
#[derive(Debug)]
pub enum AgentCommand {
    Connect {
        socket: AgentSocket,
        version: String,
        reply: Reply<()>,
    },
    Inbound(AgentMessage),
    SocketClosed {
        error: Option<String>,
    },
    StartContainer {
        msg: StartContainer,
        reply: Reply<()>,
    },
    KillContainer(ContainerId),
    AllocateFreeDevices {
        allocation_id: AllocationId,
        slots: usize,
        container_id: ContainerId,
        reply: Reply<Vec<Device>>,
    },
    DeallocateContainer {
        container_id: ContainerId,
        reply: Reply<()>,
    },
    GetState {
        reply: Reply<AgentState>,
    },
    GetSummary {
        reply: oneshot::Sender<AgentSummary>,
    },
    Enable {
        reply: Reply<AgentSummary>,
    },
    Disable {
        drain: bool,
        reply: Reply<AgentSummary>,
    },
    GetSlot {
        device_id: DeviceId,
        reply: Reply<SlotSummary>,
    },
    PatchSlot {
        device_id: DeviceId,
        patch: SlotPatch,
        reply: Reply<SlotSummary>,
    },
    Stop {
        cause: Option<String>,
    },
}

pub struct AgentActor {
    name: String,
    conn: AgentConnection,
}

impl AgentActor {
    pub fn new(conn: AgentConnection) -> Self {
        Self {
            name: format!("agent-{}", conn.id()),
            conn,
        }
    }

    /// Spawns the actor and returns a handle to it.
    pub fn spawn(
        conn: AgentConnection,
        mailbox_size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (AgentHandle, JoinHandle<()>) {
        let id = conn.id().clone();
        let pool = conn.resource_pool().to_string();
        let (inner, task) = actor::spawn(Self::new(conn), mailbox_size, shutdown);
        (AgentHandle { id, pool, inner }, task)
    }
}

fn reply<T>(tx: oneshot::Sender<T>, value: T) {
    // The asker may have timed out.
    let _ = tx.send(value);
}

#[async_trait]
impl Actor for AgentActor {
    type Message = AgentCommand;

    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&mut self, msg: AgentCommand, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        match msg {
            AgentCommand::Connect { socket, version, reply: tx } => {
                reply(tx, self.conn.connect(socket, version));
            }
            AgentCommand::Inbound(message) => self.conn.handle_message(message),
            AgentCommand::SocketClosed { error } => self.conn.socket_closed(error),
            AgentCommand::StartContainer { msg, reply: tx } => {
                let result = self.conn.start_container(msg);
                if let Err(e) = &result {
                    error!(agent_id = %self.conn.id(), error = %e, "failed to start container");
                }
                reply(tx, result);
            }
            AgentCommand::KillContainer(container_id) => self.conn.kill_container(container_id),
            AgentCommand::AllocateFreeDevices {
                allocation_id,
                slots,
                container_id,
                reply: tx,
            } => reply(tx, self.conn.allocate_free_devices(allocation_id, slots, container_id)),
            AgentCommand::DeallocateContainer { container_id, reply: tx } => {
                reply(tx, self.conn.deallocate_container(&container_id));
            }
            AgentCommand::GetState { reply: tx } => reply(tx, self.conn.agent_state()),
            AgentCommand::GetSummary { reply: tx } => reply(tx, self.conn.summary()),
            AgentCommand::Enable { reply: tx } => reply(tx, self.conn.enable()),
            AgentCommand::Disable { drain, reply: tx } => reply(tx, self.conn.disable(drain)),
            AgentCommand::GetSlot { device_id, reply: tx } => reply(tx, self.conn.slot(device_id)),
            AgentCommand::PatchSlot {
                device_id,
                patch,
                reply: tx,
            } => reply(tx, self.conn.patch_slot(device_id, patch)),
            AgentCommand::Stop { cause } => self.conn.stop(cause),
        }
        Ok(!self.conn.is_stopped())
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.conn.reconnect_deadline()
    }

    async fn on_deadline(&mut self, _ctx: &mut ActorContext) -> Result<bool, ActorError> {
        self.conn.check_reconnect_deadline();
        Ok(!self.conn.is_stopped())
    }

    async fn on_stop(&mut self, _ctx: &mut ActorContext) {
        if !self.conn.is_stopped() {
            debug!(agent_id = %self.conn.id(), "stopping agent on shutdown");
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Typed handle to a running agent actor.
#[derive(Debug, Clone)]
pub struct AgentHandle {
    id: AgentId,
    pool: String,
    inner: ActorHandle<AgentCommand>,
}

fn actor_error(e: ActorError) -> AgentError {
    match e {
        ActorError::ActorStopped => AgentError::Stopped,
        other => AgentError::Actor(other),
    }
}

impl AgentHandle {
    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn resource_pool(&self) -> &str {
        &self.pool
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    async fn ask<T: Send + 'static>(&self, make: impl FnOnce(Reply<T>) -> AgentCommand) -> AgentResult<T> {
        self.inner.ask(make).await.map_err(actor_error)?
    }

    fn tell(&self, msg: AgentCommand) -> AgentResult<()> {
        self.inner.tell(msg).map_err(actor_error)
    }

    pub async fn connect(&self, socket: AgentSocket, version: impl Into<String>) -> AgentResult<()> {
        let version = version.into();
        self.ask(|reply| AgentCommand::Connect { socket, version, reply }).await
    }

    /// Forwards a message read from the agent socket.
    pub fn message(&self, msg: AgentMessage) -> AgentResult<()> {
        self.tell(AgentCommand::Inbound(msg))
    }

    pub fn socket_closed(&self, error: Option<String>) -> AgentResult<()> {
        self.tell(AgentCommand::SocketClosed { error })
    }

    pub async fn start_container(&self, msg: StartContainer) -> AgentResult<()> {
        self.ask(|reply| AgentCommand::StartContainer { msg, reply }).await
    }

    pub fn kill_container(&self, container_id: ContainerId) -> AgentResult<()> {
        self.tell(AgentCommand::KillContainer(container_id))
    }

    pub async fn allocate_free_devices(
        &self,
        allocation_id: AllocationId,
        slots: usize,
        container_id: ContainerId,
    ) -> AgentResult<Vec<Device>> {
        self.ask(|reply| AgentCommand::AllocateFreeDevices {
            allocation_id,
            slots,
            container_id,
            reply,
        })
        .await
    }

    pub async fn deallocate_container(&self, container_id: ContainerId) -> AgentResult<()> {
        self.ask(|reply| AgentCommand::DeallocateContainer { container_id, reply })
            .await
    }

    pub async fn state(&self) -> AgentResult<AgentState> {
        self.ask(|reply| AgentCommand::GetState { reply }).await
    }

    pub async fn summary(&self) -> AgentResult<AgentSummary> {
        self.inner
            .ask(|reply| AgentCommand::GetSummary { reply })
            .await
            .map_err(actor_error)
    }

    pub async fn enable(&self) -> AgentResult<AgentSummary> {
        self.ask(|reply| AgentCommand::Enable { reply }).await
    }

    pub async fn disable(&self, drain: bool) -> AgentResult<AgentSummary> {
        self.ask(|reply| AgentCommand::Disable { drain, reply }).await
    }

    pub async fn slot(&self, device_id: DeviceId) -> AgentResult<SlotSummary> {
        self.ask(|reply| AgentCommand::GetSlot { device_id, reply }).await
    }

    pub async fn patch_slot(&self, device_id: DeviceId, patch: SlotPatch) -> AgentResult<SlotSummary> {
        self.ask(|reply| AgentCommand::PatchSlot {
            device_id,
            patch,
            reply,
        })
        .await
    }

    pub fn stop(&self, cause: Option<String>) -> AgentResult<()> {
        self.tell(AgentCommand::Stop { cause })
    }
}
