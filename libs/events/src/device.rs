//! Schedulable devices reported by agents.

use serde::{Deserialize, Serialize};

/// Agent-local device index.
pub type DeviceId = u32;

/// Device kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Cpu,
    Cuda,
    Rocm,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Cpu => write!(f, "cpu"),
            DeviceType::Cuda => write!(f, "cuda"),
            DeviceType::Rocm => write!(f, "rocm"),
        }
    }
}

/// A single device; one device backs one slot.
///
/// Ordering is by `id` first, so device maps iterate in index order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub kind: DeviceType,
    pub brand: String,
    pub uuid: String,
}

impl Device {
    /// Creates a device with an empty brand.
    pub fn new(id: DeviceId, kind: DeviceType, uuid: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            brand: String::new(),
            uuid: uuid.into(),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{} ({})", self.kind, self.id, self.uuid)
    }
}
