//! Routes agent notifications to the pool that owns the agent.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::{debug, warn};

use super::{PoolError, PoolHandle, PoolResult};
use crate::agent::{AgentEvent, AgentListener};

/// Registry of running pools by name.
#[derive(Debug, Default)]
pub struct PoolRouter {
    pools: RwLock<HashMap<String, PoolHandle>>,
}

impl PoolRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, PoolHandle>> {
        self.pools.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, PoolHandle>> {
        self.pools.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a pool, replacing any previous pool of the same name.
    pub fn register(&self, handle: PoolHandle) {
        if let Some(old) = self.write().insert(handle.name().to_string(), handle) {
            debug!(resource_pool = old.name(), "replaced resource pool handle");
        }
    }

    pub fn get(&self, name: &str) -> PoolResult<PoolHandle> {
        self.read()
            .get(name)
            .cloned()
            .ok_or_else(|| PoolError::UnknownPool(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl AgentListener for PoolRouter {
    fn notify(&self, event: AgentEvent) {
        let handle = match self.get(event.resource_pool()) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(agent_id = %event.agent_id(), error = %e, "dropping agent notification");
                return;
            }
        };
        if let Err(e) = handle.agent_updated() {
            warn!(
                agent_id = %event.agent_id(),
                resource_pool = handle.name(),
                error = %e,
                "failed to notify resource pool"
            );
        }
    }
}
