//! Agent protocol messages.
//!
//! `AgentMessage` flows from an agent to the resource manager;
//! `ManagerMessage` flows the other way. Both are framed by the transport.

use berth_id::{AllocationId, ContainerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Container, ContainerFailure, ContainerStarted, ContainerStopped, Device, EventError};

/// Shutdown reason sent to an agent whose devices changed across a reconnect.
pub const ERR_AGENT_MUST_RECONNECT: &str = "agent must reconnect";

// =============================================================================
// Inbound
// =============================================================================

/// First message on every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStarted {
    pub version: String,
    pub devices: Vec<Device>,
    /// Outcome of reattaching the containers listed in `SetAgentOptions`.
    #[serde(default)]
    pub containers_reattached: Vec<ContainerReattachAck>,
}

/// Agent-side result of reattaching one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerReattachAck {
    pub container: Container,
    pub failure: Option<ContainerFailure>,
}

/// A container moved to a new lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStateChanged {
    pub container: Container,
    pub started: Option<ContainerStarted>,
    pub stopped: Option<ContainerStopped>,
}

impl ContainerStateChanged {
    /// A `Terminated` transition carrying the given stop details.
    pub fn terminated(mut container: Container, stopped: ContainerStopped) -> Self {
        container.state = crate::ContainerState::Terminated;
        Self {
            container,
            started: None,
            stopped: Some(stopped),
        }
    }
}

/// A log line emitted by a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLog {
    pub container_id: ContainerId,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: Option<String>,
}

/// Resource usage sample for a container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatsRecord {
    pub container_id: ContainerId,
    pub end_stats: bool,
    pub metrics: serde_json::Value,
}

/// Messages sent by agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    AgentStarted(AgentStarted),
    ContainerStateChanged(ContainerStateChanged),
    ContainerLog(ContainerLog),
    ContainerStats(ContainerStatsRecord),
}

impl AgentMessage {
    /// Decodes a JSON-framed agent message.
    pub fn from_json(raw: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentStarted(_) => "agent_started",
            Self::ContainerStateChanged(_) => "container_state_changed",
            Self::ContainerLog(_) => "container_log",
            Self::ContainerStats(_) => "container_stats",
        }
    }
}

// =============================================================================
// Outbound
// =============================================================================

/// A container the agent should try to reattach after reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerReattach {
    pub container: Container,
}

/// Options pushed to an agent right after it connects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SetAgentOptions {
    pub resource_pool: String,
    #[serde(default)]
    pub containers_to_reattach: Vec<ContainerReattach>,
}

/// Launch a container on reserved devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartContainer {
    pub allocation_id: AllocationId,
    pub container: Container,
    /// Runtime-specific launch spec, passed through untouched.
    pub spec: serde_json::Value,
}

/// Signals deliverable to a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Signal {
    Kill,
    Term,
}

/// Deliver a signal to a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalContainer {
    pub container_id: ContainerId,
    pub signal: Signal,
}

/// Tell the agent to exit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentShutdown {
    pub error_msg: String,
}

/// Messages sent to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ManagerMessage {
    SetAgentOptions(SetAgentOptions),
    StartContainer(StartContainer),
    SignalContainer(SignalContainer),
    AgentShutdown(AgentShutdown),
}

impl ManagerMessage {
    /// Encodes the message as JSON.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// A SIGKILL for the given container.
    pub fn kill(container_id: ContainerId) -> Self {
        Self::SignalContainer(SignalContainer {
            container_id,
            signal: Signal::Kill,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContainerState, DeviceType};

    #[test]
    fn test_agent_message_tagged_json() {
        let msg = AgentMessage::AgentStarted(AgentStarted {
            version: "0.1.0".to_string(),
            devices: vec![Device::new(0, DeviceType::Cuda, "GPU-0")],
            containers_reattached: vec![],
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "agent_started");
        assert_eq!(json["devices"][0]["kind"], "cuda");
    }

    #[test]
    fn test_agent_message_decode() {
        let raw = r#"{
            "type": "container_state_changed",
            "container": {"id": "ctr1", "state": "running"},
            "started": {"proxy_address": null},
            "stopped": null
        }"#;
        let msg = AgentMessage::from_json(raw).unwrap();
        match msg {
            AgentMessage::ContainerStateChanged(sc) => {
                assert_eq!(sc.container.id.as_str(), "ctr1");
                assert_eq!(sc.container.state, ContainerState::Running);
                assert!(sc.container.devices.is_empty());
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn test_agent_message_unknown_type() {
        let err = AgentMessage::from_json(r#"{"type": "nope"}"#).unwrap_err();
        assert!(matches!(err, EventError::Serialization(_)));
    }

    #[test]
    fn test_kill_message() {
        let msg = ManagerMessage::kill(ContainerId::from("ctr1"));
        let json = msg.to_json().unwrap();
        assert!(json.contains("\"signal\":\"kill\""));
    }

    #[test]
    fn test_terminated_helper_sets_state() {
        let sc = ContainerStateChanged::terminated(
            Container::assigned(ContainerId::from("ctr1")),
            ContainerStopped::default(),
        );
        assert_eq!(sc.container.state, ContainerState::Terminated);
        assert!(sc.stopped.is_some());
    }
}
