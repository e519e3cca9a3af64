//! Events published to allocation owners.
//!
//! Every event names the allocation it concerns. Owners subscribe by
//! allocation ID; the resource manager never waits on them.

use berth_id::{AgentId, AllocationId, ContainerId, ResourcesId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    ContainerLog, ContainerStarted, ContainerState, ContainerStateChanged, ContainerStopped,
    Device, FailureKind,
};

// =============================================================================
// Event Type Constants
// =============================================================================

/// All allocation event type names as constants.
pub mod event_types {
    pub const RESOURCES_ALLOCATED: &str = "resources.allocated";
    pub const RELEASE_RESOURCES: &str = "resources.release_requested";
    pub const RESOURCES_FAILURE: &str = "resources.failure";
    pub const RESOURCES_RELEASED: &str = "resources.released";
    pub const RESOURCES_STATE_CHANGED: &str = "resources.state_changed";
    pub const INVALID_RESOURCES_REQUEST: &str = "resources.invalid_request";
    pub const CONTAINER_LOG: &str = "container.log";
}

// =============================================================================
// Payloads
// =============================================================================

/// One container's worth of resources on one agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGrant {
    pub resources_id: ResourcesId,
    pub agent_id: AgentId,
    pub container_id: ContainerId,
    pub devices: Vec<Device>,
    /// Whether the container has reached `Running`.
    #[serde(default)]
    pub started: bool,
}

impl ResourceGrant {
    pub fn slots(&self) -> usize {
        self.devices.len()
    }
}

/// A request was placed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesAllocated {
    pub allocation_id: AllocationId,
    pub resource_pool: String,
    pub resources: Vec<ResourceGrant>,
    pub job_submission_time: DateTime<Utc>,
    pub allocated_at: DateTime<Utc>,
    /// True when rebuilt from persisted grants after a restart.
    #[serde(default)]
    pub recovered: bool,
}

impl ResourcesAllocated {
    /// Total devices across all grants.
    pub fn slots(&self) -> usize {
        self.resources.iter().map(ResourceGrant::slots).sum()
    }

    /// True once any container of the allocation is running.
    pub fn any_started(&self) -> bool {
        self.resources.iter().any(|r| r.started)
    }
}

/// The scheduler or an operator asks the owner to give resources back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResources {
    pub allocation_id: AllocationId,
    pub reason: String,
    pub force_kill: bool,
}

/// Terminal failure of an allocation's resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesFailure {
    pub allocation_id: AllocationId,
    pub kind: FailureKind,
    pub message: String,
    pub exit_code: Option<i32>,
}

/// All resources of the allocation were returned to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesReleased {
    pub allocation_id: AllocationId,
    pub resource_pool: String,
}

/// A container of the allocation changed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesStateChanged {
    pub allocation_id: AllocationId,
    pub container_id: ContainerId,
    pub state: ContainerState,
    pub started: Option<ContainerStarted>,
    pub stopped: Option<ContainerStopped>,
}

impl ResourcesStateChanged {
    pub fn from_container_change(allocation_id: AllocationId, sc: &ContainerStateChanged) -> Self {
        Self {
            allocation_id,
            container_id: sc.container.id.clone(),
            state: sc.container.state,
            started: sc.started.clone(),
            stopped: sc.stopped.clone(),
        }
    }
}

/// The request can never be satisfied and was dropped from the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidResourcesRequest {
    pub allocation_id: AllocationId,
    pub cause: String,
}

/// A container log line routed to its allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationLog {
    pub allocation_id: AllocationId,
    pub log: ContainerLog,
}

// =============================================================================
// Event
// =============================================================================

/// Every event an allocation owner can receive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AllocationEvent {
    ResourcesAllocated(ResourcesAllocated),
    ReleaseResources(ReleaseResources),
    ResourcesFailure(ResourcesFailure),
    ResourcesReleased(ResourcesReleased),
    ResourcesStateChanged(ResourcesStateChanged),
    InvalidResourcesRequest(InvalidResourcesRequest),
    ContainerLog(AllocationLog),
}

impl AllocationEvent {
    /// The allocation this event is addressed to.
    pub fn allocation_id(&self) -> &AllocationId {
        match self {
            Self::ResourcesAllocated(e) => &e.allocation_id,
            Self::ReleaseResources(e) => &e.allocation_id,
            Self::ResourcesFailure(e) => &e.allocation_id,
            Self::ResourcesReleased(e) => &e.allocation_id,
            Self::ResourcesStateChanged(e) => &e.allocation_id,
            Self::InvalidResourcesRequest(e) => &e.allocation_id,
            Self::ContainerLog(e) => &e.allocation_id,
        }
    }

    /// Dotted event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::ResourcesAllocated(_) => event_types::RESOURCES_ALLOCATED,
            Self::ReleaseResources(_) => event_types::RELEASE_RESOURCES,
            Self::ResourcesFailure(_) => event_types::RESOURCES_FAILURE,
            Self::ResourcesReleased(_) => event_types::RESOURCES_RELEASED,
            Self::ResourcesStateChanged(_) => event_types::RESOURCES_STATE_CHANGED,
            Self::InvalidResourcesRequest(_) => event_types::INVALID_RESOURCES_REQUEST,
            Self::ContainerLog(_) => event_types::CONTAINER_LOG,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeviceType;

    fn grant(agent: &str, slots: u32) -> ResourceGrant {
        ResourceGrant {
            resources_id: ResourcesId::new(),
            agent_id: AgentId::from(agent),
            container_id: ContainerId::new(),
            devices: (0..slots)
                .map(|i| Device::new(i, DeviceType::Cuda, format!("GPU-{i}")))
                .collect(),
            started: false,
        }
    }

    #[test]
    fn test_allocated_slot_count() {
        let allocated = ResourcesAllocated {
            allocation_id: AllocationId::from("task1"),
            resource_pool: "default".to_string(),
            resources: vec![grant("agent1", 4), grant("agent2", 2)],
            job_submission_time: Utc::now(),
            allocated_at: Utc::now(),
            recovered: false,
        };
        assert_eq!(allocated.slots(), 6);
        assert!(!allocated.any_started());
    }

    #[test]
    fn test_event_routing_fields() {
        let event = AllocationEvent::ReleaseResources(ReleaseResources {
            allocation_id: AllocationId::from("task1"),
            reason: "preempted by the scheduler".to_string(),
            force_kill: false,
        });
        assert_eq!(event.allocation_id().as_str(), "task1");
        assert_eq!(event.event_type(), event_types::RELEASE_RESOURCES);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "release_resources");
        assert_eq!(json["reason"], "preempted by the scheduler");
    }
}
