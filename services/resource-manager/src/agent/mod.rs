//! Agents: per-agent ledger, connection lifecycle and the fleet registry.
//!
//! - `state`: `AgentState`, the slot and container ledger schedulers read
//! - `connection`: `AgentConnection`, the connect / disconnect / reconnect
//!   state machine around one agent's socket
//! - `actor`: runs an `AgentConnection` as an actor with a reconnect deadline
//! - `fleet`: every agent of the manager, keyed by ID

mod actor;
mod connection;
mod fleet;
mod state;

use berth_events::DeviceId;
use berth_id::{AgentId, ContainerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::actor::ActorError;

pub use actor::{AgentActor, AgentCommand, AgentHandle};
pub use connection::{
    AgentConnection, AgentDeps, AgentSocket, BufferedMessage, ConnectionConfig, ConnectionPhase,
};
pub use fleet::{Fleet, FleetConfig, PoolAgentOptions};
pub use state::{AgentSnapshot, AgentState, Slot, SlotData, SlotEnabled, SlotPatch, SlotSummary};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("not enough devices: need {needed}, found {available}")]
    NotEnoughDevices { needed: usize, available: usize },

    #[error("can't find slot {0}")]
    SlotNotFound(DeviceId),

    #[error("bad startContainer on device: {device} ({agent}): {reason}")]
    StartContainer {
        device: DeviceId,
        agent: AgentId,
        reason: &'static str,
    },

    #[error("container already started: {0}")]
    ContainerAlreadyStarted(ContainerId),

    #[error("device count has changed: {before} -> {after}")]
    DeviceCountChanged { before: usize, after: usize },

    #[error("device properties have changed: {before} -> {after}")]
    DevicePropertiesChanged { before: String, after: String },

    #[error("invalid agent snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("agent is recovering, please retry later")]
    Recovering,

    #[error("agent not started")]
    NotStarted,

    #[error("agent not found: {0}")]
    UnknownAgent(AgentId),

    #[error("agent already connected")]
    AlreadyConnected,

    #[error("agent stopped")]
    Stopped,

    #[error(transparent)]
    Actor(#[from] ActorError),
}

pub type AgentResult<T> = Result<T, AgentError>;

// =============================================================================
// Notifications
// =============================================================================

/// A change the owning resource pool should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// Capacity or flags changed; the pool should reschedule.
    Updated { agent_id: AgentId, resource_pool: String },
    /// The agent is gone for good.
    Removed { agent_id: AgentId, resource_pool: String },
}

impl AgentEvent {
    pub fn resource_pool(&self) -> &str {
        match self {
            Self::Updated { resource_pool, .. } | Self::Removed { resource_pool, .. } => resource_pool,
        }
    }

    pub fn agent_id(&self) -> &AgentId {
        match self {
            Self::Updated { agent_id, .. } | Self::Removed { agent_id, .. } => agent_id,
        }
    }
}

/// Receives agent changes. Must not block.
pub trait AgentListener: Send + Sync + std::fmt::Debug {
    fn notify(&self, event: AgentEvent);
}

/// Ignores every notification.
#[derive(Debug, Default)]
pub struct NoopListener;

impl AgentListener for NoopListener {
    fn notify(&self, _event: AgentEvent) {}
}

// =============================================================================
// Summaries
// =============================================================================

/// Operator view of an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: AgentId,
    pub registered_at: DateTime<Utc>,
    pub resource_pool: String,
    pub address: String,
    pub version: String,
    pub enabled: bool,
    pub draining: bool,
    pub num_containers: usize,
    pub slots: Vec<SlotSummary>,
    pub idle: bool,
}

impl AgentSummary {
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }
}
