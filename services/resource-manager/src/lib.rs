//! Berth resource manager.
//!
//! Tracks the agents that offer compute slots and places allocation
//! requests onto them, one scheduler per resource pool.
//!
//! - `agent`: per-agent state and the fleet of agent actors
//! - `pool`: resource pools, their scheduling tick and routing
//! - `scheduler`: fair-share and priority placement
//! - `tasklist`: request registry and queue positions
//! - `fitting`: choosing an agent for a request
//! - `store`: SQLite persistence for restarts

pub mod actor;
pub mod agent;
pub mod clock;
pub mod config;
pub mod fitting;
pub mod pool;
pub mod provisioner;
pub mod publish;
pub mod scheduler;
pub mod store;
pub mod tasklist;
