//! Configuration for the resource manager.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::{FleetConfig, PoolAgentOptions};
use crate::fitting::FittingPolicy;
use crate::scheduler::{SchedulerConfig, SchedulerError, SchedulerKind};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidVar { var: &'static str, value: String },

    #[error("resource pool {0:?} is configured twice")]
    DuplicatePool(String),

    #[error("resource pool name must not be empty")]
    EmptyPoolName,

    #[error("default resource pool {0:?} is not configured")]
    MissingDefaultPool(String),

    #[error("resource pool {pool}: {source}")]
    Scheduler {
        pool: String,
        #[source]
        source: SchedulerError,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

// =============================================================================
// Resource pools
// =============================================================================

fn default_max_aux_containers() -> usize {
    100
}

fn default_true() -> bool {
    true
}

/// Settings of one resource pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default = "default_max_aux_containers")]
    pub max_aux_containers_per_agent: usize,
    #[serde(default = "default_true")]
    pub agent_reattach_enabled: bool,
    /// Slots of one provisioned instance; 0 when the pool has no provisioner.
    #[serde(default)]
    pub slots_per_instance: usize,
    #[serde(default)]
    pub max_instances: usize,
}

impl PoolConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scheduler: SchedulerConfig::default(),
            max_aux_containers_per_agent: default_max_aux_containers(),
            agent_reattach_enabled: true,
            slots_per_instance: 0,
            max_instances: 0,
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn has_provisioner(&self) -> bool {
        self.slots_per_instance > 0
    }

    /// Fails on settings the pool can never run with.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty() {
            return Err(ConfigError::EmptyPoolName);
        }
        self.scheduler.validate().map_err(|source| ConfigError::Scheduler {
            pool: self.name.clone(),
            source,
        })
    }

    pub fn agent_options(&self) -> PoolAgentOptions {
        PoolAgentOptions {
            max_zero_slot_containers: self.max_aux_containers_per_agent,
            agent_reattach_enabled: self.agent_reattach_enabled,
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Resource manager configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the SQLite store.
    pub data_dir: PathBuf,

    /// Scheduling tick of every pool.
    pub tick_interval: Duration,

    /// How long a disconnected agent may take to come back.
    pub agent_reconnect_wait: Duration,

    /// Pool that agents and requests without one belong to.
    pub default_pool: String,

    pub pools: Vec<PoolConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/berth"),
            tick_interval: Duration::from_millis(500),
            agent_reconnect_wait: Duration::from_secs(25),
            default_pool: "default".to_string(),
            pools: vec![PoolConfig::new("default")],
        }
    }
}

fn parse_var<T: FromStr>(var: &'static str, value: Option<String>) -> ConfigResult<Option<T>> {
    match value {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidVar { var, value }),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let data_dir = get("BERTH_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir);

        let tick_interval = parse_var::<u64>("BERTH_TICK_INTERVAL_MS", get("BERTH_TICK_INTERVAL_MS"))?
            .map(Duration::from_millis)
            .unwrap_or(defaults.tick_interval);

        let agent_reconnect_wait =
            parse_var::<u64>("BERTH_AGENT_RECONNECT_WAIT_SECS", get("BERTH_AGENT_RECONNECT_WAIT_SECS"))?
                .map(Duration::from_secs)
                .unwrap_or(defaults.agent_reconnect_wait);

        let default_pool = get("BERTH_DEFAULT_POOL").unwrap_or(defaults.default_pool);

        let pools = match get("BERTH_POOLS_FILE") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read pools file {path}"))?;
                serde_json::from_str::<Vec<PoolConfig>>(&raw)
                    .with_context(|| format!("failed to parse pools file {path}"))?
            }
            None => vec![Self::pool_from_vars(&default_pool, &get)?],
        };

        let config = Self {
            data_dir,
            tick_interval,
            agent_reconnect_wait,
            default_pool,
            pools,
        };
        config.validate()?;
        Ok(config)
    }

    /// The single pool described by the scheduler variables.
    fn pool_from_vars(name: &str, get: &impl Fn(&str) -> Option<String>) -> ConfigResult<PoolConfig> {
        let mut pool = PoolConfig::new(name);

        if let Some(kind) = get("BERTH_SCHEDULER") {
            pool.scheduler.kind = SchedulerKind::from_str(kind.trim()).map_err(|source| ConfigError::Scheduler {
                pool: name.to_string(),
                source,
            })?;
        }
        if let Some(policy) = get("BERTH_FITTING_POLICY") {
            pool.scheduler.fitting_policy =
                FittingPolicy::from_str(policy.trim()).map_err(|source| ConfigError::Scheduler {
                    pool: name.to_string(),
                    source,
                })?;
        }
        if pool.scheduler.kind == SchedulerKind::Priority {
            pool.scheduler.default_priority = Some(
                parse_var::<i32>("BERTH_DEFAULT_PRIORITY", get("BERTH_DEFAULT_PRIORITY"))?
                    .unwrap_or(crate::scheduler::DEFAULT_SCHEDULING_PRIORITY),
            );
        }
        if let Some(preemption) = parse_var::<bool>("BERTH_PREEMPTION", get("BERTH_PREEMPTION"))? {
            pool.scheduler.preemption = preemption;
        }
        if let Some(max) = parse_var::<usize>("BERTH_MAX_AUX_CONTAINERS_PER_AGENT", get("BERTH_MAX_AUX_CONTAINERS_PER_AGENT"))? {
            pool.max_aux_containers_per_agent = max;
        }
        if let Some(slots) = parse_var::<usize>("BERTH_SLOTS_PER_INSTANCE", get("BERTH_SLOTS_PER_INSTANCE"))? {
            pool.slots_per_instance = slots;
        }
        if let Some(max) = parse_var::<usize>("BERTH_MAX_INSTANCES", get("BERTH_MAX_INSTANCES"))? {
            pool.max_instances = max;
        }
        Ok(pool)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut seen = HashSet::new();
        for pool in &self.pools {
            pool.validate()?;
            if !seen.insert(pool.name.as_str()) {
                return Err(ConfigError::DuplicatePool(pool.name.clone()));
            }
        }
        if !seen.contains(self.default_pool.as_str()) {
            return Err(ConfigError::MissingDefaultPool(self.default_pool.clone()));
        }
        Ok(())
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.pools.iter().map(|p| p.name.clone()).collect()
    }

    pub fn fleet_config(&self) -> FleetConfig {
        FleetConfig {
            reconnect_wait: self.agent_reconnect_wait,
            pools: self
                .pools
                .iter()
                .map(|p| (p.name.clone(), p.agent_options()))
                .collect::<HashMap<_, _>>(),
            ..FleetConfig::default()
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("resource-manager.db")
    }
}
