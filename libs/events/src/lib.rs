//! # berth-events
//!
//! Logical message shapes exchanged by the berth resource manager.
//!
//! ## Design Principles
//!
//! - Messages are plain data; transports choose their own framing
//! - Every message serializes as JSON with a `type` tag
//! - Allocation-owner events are keyed by allocation ID
//!
//! ## Message Families
//!
//! - Devices and containers (`Device`, `Container`, `ContainerState`)
//! - Agent protocol: inbound (`AgentMessage`) and outbound (`ManagerMessage`)
//! - Allocation-owner events (`AllocationEvent`)
//! - Provisioner feedback (`ScalingInfo`)

mod allocation;
mod container;
mod device;
mod error;
mod protocol;
mod scaling;

pub use allocation::*;
pub use container::*;
pub use device::*;
pub use error::EventError;
pub use protocol::*;
pub use scaling::*;
