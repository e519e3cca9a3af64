//! Typed ID definitions for resource manager entities.

use crate::define_id;

// =============================================================================
// Workloads
// =============================================================================

define_id!(AllocationId, "alloc");
define_id!(JobId, "job");
define_id!(ResourcesId, "res");

// =============================================================================
// Fleet
// =============================================================================

define_id!(AgentId, "agent");
define_id!(ContainerId, "ctr");
