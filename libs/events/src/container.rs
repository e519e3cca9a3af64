//! Containers and their lifecycle.

use berth_id::ContainerId;
use serde::{Deserialize, Serialize};

use crate::Device;

/// Container lifecycle state.
///
/// Variants are declared in lifecycle order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    #[default]
    Assigned,
    Pulling,
    Starting,
    Running,
    Terminated,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Assigned => "assigned",
            Self::Pulling => "pulling",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Terminated => "terminated",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "assigned" => Some(Self::Assigned),
            "pulling" => Some(Self::Pulling),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container placed on an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub state: ContainerState,
    #[serde(default)]
    pub devices: Vec<Device>,
}

impl Container {
    /// A freshly assigned container holding no devices yet.
    pub fn assigned(id: ContainerId) -> Self {
        Self {
            id,
            state: ContainerState::Assigned,
            devices: Vec::new(),
        }
    }
}

/// Failure classification surfaced to allocation owners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The agent went away with the container still allocated.
    AgentFailed,
    /// The agent reported an error running the container.
    AgentError,
    /// The container exited with an error.
    TaskError,
    /// The container was aborted before it started.
    TaskAborted,
    /// The container could not be restored after an agent or manager restart.
    RestoreError,
    /// The request can never be satisfied by this pool.
    InvalidResourcesRequest,
    /// The resources backing the allocation disappeared.
    ResourcesMissing,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AgentFailed => "agent failed",
            Self::AgentError => "agent error",
            Self::TaskError => "task error",
            Self::TaskAborted => "task aborted",
            Self::RestoreError => "restore error",
            Self::InvalidResourcesRequest => "invalid resources request",
            Self::ResourcesMissing => "resources missing",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified container failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerFailure {
    pub kind: FailureKind,
    pub message: String,
    pub exit_code: Option<i32>,
}

impl ContainerFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
        }
    }
}

impl std::fmt::Display for ContainerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.exit_code {
            Some(code) => write!(f, "{}: {} (exit code {})", self.kind, self.message, code),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Details attached when a container reaches `Running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerStarted {
    /// Address the container is reachable on; filled with the agent address
    /// when the agent leaves it empty.
    pub proxy_address: Option<String>,
}

/// Details attached when a container reaches `Terminated`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerStopped {
    pub failure: Option<ContainerFailure>,
}

impl ContainerStopped {
    /// A stop caused by the given failure.
    pub fn error(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            failure: Some(ContainerFailure::new(kind, message)),
        }
    }
}
