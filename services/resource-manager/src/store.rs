//! SQLite-backed persistence for crash recovery.
//!
//! Stores agent snapshots, container grants and manual job queue
//! positions. Durability is best effort: callers log failures and carry on.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use berth_events::{Container, ContainerState, Device};
use berth_id::{AgentId, AllocationId, ContainerId, JobId, ResourcesId};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::agent::AgentSnapshot;
use crate::tasklist::QueuePosition;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid record: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One container's resources, as persisted at allocation time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerGrant {
    pub resources_id: ResourcesId,
    pub allocation_id: AllocationId,
    pub agent_id: AgentId,
    pub container_id: ContainerId,
    pub state: ContainerState,
    pub devices: Vec<Device>,
}

impl ContainerGrant {
    pub fn container(&self) -> Container {
        Container {
            id: self.container_id.clone(),
            state: self.state,
            devices: self.devices.clone(),
        }
    }
}

/// Persistence used by agents and resource pools.
pub trait Store: Send + Sync {
    fn persist_agent_snapshot(&self, snapshot: &AgentSnapshot) -> StoreResult<()>;

    /// Snapshots of agents belonging to any of the given pools.
    fn load_agent_snapshots(&self, pools: &[String]) -> StoreResult<Vec<AgentSnapshot>>;

    fn delete_agent_snapshot(&self, agent_id: &AgentId) -> StoreResult<()>;

    fn persist_container_grant(&self, grant: &ContainerGrant) -> StoreResult<()>;

    fn update_container_state(&self, container: &Container) -> StoreResult<()>;

    fn load_containers(&self, ids: &[ContainerId]) -> StoreResult<Vec<Container>>;

    fn load_containers_to_allocation_ids(
        &self,
        ids: &[ContainerId],
    ) -> StoreResult<HashMap<ContainerId, AllocationId>>;

    fn load_allocation_grants(&self, allocation_id: &AllocationId) -> StoreResult<Vec<ContainerGrant>>;

    fn delete_allocation_grants(&self, allocation_id: &AllocationId) -> StoreResult<()>;

    fn persist_job_position(&self, job_id: &JobId, position: QueuePosition) -> StoreResult<()>;

    fn load_job_positions(&self) -> StoreResult<Vec<(JobId, QueuePosition)>>;
}

/// SQLite store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn init_schema(&self) -> StoreResult<()> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS agent_snapshots (
                agent_id TEXT PRIMARY KEY,
                uuid TEXT NOT NULL UNIQUE,
                resource_pool TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_agent_snapshots_pool ON agent_snapshots(resource_pool);

            CREATE TABLE IF NOT EXISTS container_grants (
                resources_id TEXT PRIMARY KEY,
                allocation_id TEXT NOT NULL,
                agent_id TEXT NOT NULL,
                container_id TEXT NOT NULL UNIQUE,
                state TEXT NOT NULL,
                devices TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_container_grants_allocation ON container_grants(allocation_id);

            CREATE TABLE IF NOT EXISTS job_positions (
                job_id TEXT PRIMARY KEY,
                position TEXT NOT NULL
            );
            "#,
        )?;

        debug!("resource manager store schema initialized");
        Ok(())
    }

    fn grant_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(ContainerGrant, String, String)> {
        let resources_id: String = row.get(0)?;
        let allocation_id: String = row.get(1)?;
        let agent_id: String = row.get(2)?;
        let container_id: String = row.get(3)?;
        let state: String = row.get(4)?;
        let devices: String = row.get(5)?;
        Ok((
            ContainerGrant {
                resources_id: ResourcesId::from(resources_id),
                allocation_id: AllocationId::from(allocation_id),
                agent_id: AgentId::from(agent_id),
                container_id: ContainerId::from(container_id),
                state: ContainerState::Assigned,
                devices: Vec::new(),
            },
            state,
            devices,
        ))
    }

    fn finish_grant(raw: (ContainerGrant, String, String)) -> StoreResult<ContainerGrant> {
        let (mut grant, state, devices) = raw;
        grant.state = ContainerState::from_str(&state)
            .ok_or_else(|| StoreError::Invalid(format!("container state {state:?}")))?;
        grant.devices = serde_json::from_str(&devices)?;
        Ok(grant)
    }

    fn placeholders(n: usize) -> String {
        vec!["?"; n].join(", ")
    }
}

impl Store for SqliteStore {
    fn persist_agent_snapshot(&self, snapshot: &AgentSnapshot) -> StoreResult<()> {
        let body = serde_json::to_string(snapshot)?;
        let now = chrono::Utc::now().timestamp();
        self.conn().execute(
            r#"
            INSERT INTO agent_snapshots (agent_id, uuid, resource_pool, snapshot, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(agent_id) DO UPDATE SET
                uuid = excluded.uuid,
                resource_pool = excluded.resource_pool,
                snapshot = excluded.snapshot,
                updated_at = excluded.updated_at
            "#,
            params![
                snapshot.agent_id.as_str(),
                snapshot.uuid,
                snapshot.resource_pool,
                body,
                now
            ],
        )?;
        Ok(())
    }

    fn load_agent_snapshots(&self, pools: &[String]) -> StoreResult<Vec<AgentSnapshot>> {
        if pools.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let sql = format!(
            "SELECT snapshot FROM agent_snapshots WHERE resource_pool IN ({}) ORDER BY agent_id",
            Self::placeholders(pools.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let bodies = stmt
            .query_map(params_from_iter(pools.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StoreError::from))
            .collect()
    }

    fn delete_agent_snapshot(&self, agent_id: &AgentId) -> StoreResult<()> {
        self.conn().execute(
            "DELETE FROM agent_snapshots WHERE agent_id = ?1",
            params![agent_id.as_str()],
        )?;
        Ok(())
    }

    fn persist_container_grant(&self, grant: &ContainerGrant) -> StoreResult<()> {
        let devices = serde_json::to_string(&grant.devices)?;
        self.conn().execute(
            r#"
            INSERT INTO container_grants (resources_id, allocation_id, agent_id, container_id, state, devices)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(resources_id) DO UPDATE SET
                state = excluded.state,
                devices = excluded.devices
            "#,
            params![
                grant.resources_id.as_str(),
                grant.allocation_id.as_str(),
                grant.agent_id.as_str(),
                grant.container_id.as_str(),
                grant.state.as_str(),
                devices
            ],
        )?;
        Ok(())
    }

    fn update_container_state(&self, container: &Container) -> StoreResult<()> {
        let devices = serde_json::to_string(&container.devices)?;
        self.conn().execute(
            "UPDATE container_grants SET state = ?1, devices = ?2 WHERE container_id = ?3",
            params![container.state.as_str(), devices, container.id.as_str()],
        )?;
        Ok(())
    }

    fn load_containers(&self, ids: &[ContainerId]) -> StoreResult<Vec<Container>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn();
        let sql = format!(
            "SELECT resources_id, allocation_id, agent_id, container_id, state, devices
             FROM container_grants WHERE container_id IN ({})",
            Self::placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter().map(|id| id.as_str())), Self::grant_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|raw| Self::finish_grant(raw).map(|g| g.container()))
            .collect()
    }

    fn load_containers_to_allocation_ids(
        &self,
        ids: &[ContainerId],
    ) -> StoreResult<HashMap<ContainerId, AllocationId>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.conn();
        let sql = format!(
            "SELECT container_id, allocation_id FROM container_grants WHERE container_id IN ({})",
            Self::placeholders(ids.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let pairs = stmt
            .query_map(params_from_iter(ids.iter().map(|id| id.as_str())), |row| {
                let container_id: String = row.get(0)?;
                let allocation_id: String = row.get(1)?;
                Ok((ContainerId::from(container_id), AllocationId::from(allocation_id)))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(pairs)
    }

    fn load_allocation_grants(&self, allocation_id: &AllocationId) -> StoreResult<Vec<ContainerGrant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT resources_id, allocation_id, agent_id, container_id, state, devices
             FROM container_grants WHERE allocation_id = ?1 ORDER BY resources_id",
        )?;
        let rows = stmt
            .query_map(params![allocation_id.as_str()], Self::grant_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(Self::finish_grant).collect()
    }

    fn delete_allocation_grants(&self, allocation_id: &AllocationId) -> StoreResult<()> {
        self.conn().execute(
            "DELETE FROM container_grants WHERE allocation_id = ?1",
            params![allocation_id.as_str()],
        )?;
        Ok(())
    }

    fn persist_job_position(&self, job_id: &JobId, position: QueuePosition) -> StoreResult<()> {
        self.conn().execute(
            r#"
            INSERT INTO job_positions (job_id, position) VALUES (?1, ?2)
            ON CONFLICT(job_id) DO UPDATE SET position = excluded.position
            "#,
            params![job_id.as_str(), position.to_string()],
        )?;
        Ok(())
    }

    fn load_job_positions(&self) -> StoreResult<Vec<(JobId, QueuePosition)>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT job_id, position FROM job_positions ORDER BY job_id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(job_id, position)| {
                let position = position
                    .parse::<QueuePosition>()
                    .map_err(|e| StoreError::Invalid(e.to_string()))?;
                Ok((JobId::from(job_id), position))
            })
            .collect()
    }
}

impl SqliteStore {
    /// Returns the grant for a container, if one was persisted.
    pub fn container_grant(&self, container_id: &ContainerId) -> StoreResult<Option<ContainerGrant>> {
        let conn = self.conn();
        let raw = conn
            .query_row(
                "SELECT resources_id, allocation_id, agent_id, container_id, state, devices
                 FROM container_grants WHERE container_id = ?1",
                params![container_id.as_str()],
                Self::grant_from_row,
            )
            .optional()?;
        raw.map(Self::finish_grant).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentState;
    use berth_events::DeviceType;

    fn grant(alloc: &str, container: &str, slots: u32) -> ContainerGrant {
        ContainerGrant {
            resources_id: ResourcesId::from(format!("res-{container}")),
            allocation_id: AllocationId::from(alloc),
            agent_id: AgentId::from("agent1"),
            container_id: ContainerId::from(container),
            state: ContainerState::Assigned,
            devices: (0..slots)
                .map(|i| Device::new(i, DeviceType::Cuda, format!("GPU-{i}")))
                .collect(),
        }
    }

    #[test]
    fn test_agent_snapshot_roundtrip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let devices = vec![Device::new(0, DeviceType::Cuda, "GPU-0")];
        let state = AgentState::with_devices(AgentId::from("agent1"), "gpu", 10, &devices);
        let other = AgentState::with_devices(AgentId::from("agent2"), "cpu", 10, &[]);

        store.persist_agent_snapshot(&state.snapshot()).unwrap();
        store.persist_agent_snapshot(&other.snapshot()).unwrap();
        // Upsert keeps one row per agent.
        store.persist_agent_snapshot(&state.snapshot()).unwrap();

        let loaded = store.load_agent_snapshots(&["gpu".to_string()]).unwrap();
        assert_eq!(loaded, vec![state.snapshot()]);
        assert!(store.load_agent_snapshots(&[]).unwrap().is_empty());

        store.delete_agent_snapshot(state.id()).unwrap();
        assert!(store.load_agent_snapshots(&["gpu".to_string()]).unwrap().is_empty());
    }

    #[test]
    fn test_container_grants() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.persist_container_grant(&grant("alloc1", "c1", 2)).unwrap();
        store.persist_container_grant(&grant("alloc1", "c2", 0)).unwrap();
        store.persist_container_grant(&grant("alloc2", "c3", 1)).unwrap();

        let mut running = grant("alloc1", "c1", 2).container();
        running.state = ContainerState::Running;
        store.update_container_state(&running).unwrap();

        let fetched = store.container_grant(&ContainerId::from("c1")).unwrap().unwrap();
        assert_eq!(fetched.state, ContainerState::Running);
        assert_eq!(fetched.devices.len(), 2);

        let ids = [ContainerId::from("c1"), ContainerId::from("c3")];
        let map = store.load_containers_to_allocation_ids(&ids).unwrap();
        assert_eq!(map[&ids[0]].as_str(), "alloc1");
        assert_eq!(map[&ids[1]].as_str(), "alloc2");

        let containers = store.load_containers(&ids).unwrap();
        assert_eq!(containers.len(), 2);

        assert_eq!(store.load_allocation_grants(&AllocationId::from("alloc1")).unwrap().len(), 2);
        store.delete_allocation_grants(&AllocationId::from("alloc1")).unwrap();
        assert!(store.load_allocation_grants(&AllocationId::from("alloc1")).unwrap().is_empty());
        assert!(store.container_grant(&ContainerId::from("c1")).unwrap().is_none());
    }

    #[test]
    fn test_job_positions() {
        let store = SqliteStore::open_in_memory().unwrap();
        let p1: QueuePosition = "1.5".parse().unwrap();
        let p2: QueuePosition = "0.25".parse().unwrap();
        store.persist_job_position(&JobId::from("job1"), p1).unwrap();
        store.persist_job_position(&JobId::from("job2"), p2).unwrap();
        store.persist_job_position(&JobId::from("job1"), p2).unwrap();

        let positions = store.load_job_positions().unwrap();
        assert_eq!(positions, vec![(JobId::from("job1"), p2), (JobId::from("job2"), p2)]);
    }

    #[test]
    fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rm.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.persist_job_position(&JobId::from("job1"), QueuePosition::HEAD).unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.load_job_positions().unwrap().len(), 1);
    }
}
