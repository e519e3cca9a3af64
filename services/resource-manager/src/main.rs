//! Berth resource manager
//!
//! Runs one scheduling actor per configured resource pool on top of a
//! shared fleet of agent actors. State is persisted to SQLite under the
//! data directory so that agents and grants survive a restart.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use berth_resource_manager::agent::{AgentDeps, Fleet};
use berth_resource_manager::clock::{Clock, SystemClock};
use berth_resource_manager::config::Config;
use berth_resource_manager::pool::{PoolActor, PoolDeps, PoolRouter, ResourcePool};
use berth_resource_manager::provisioner::{Provisioner, WatchProvisioner};
use berth_resource_manager::publish::{AllocationPublisher, ChannelPublisher};
use berth_resource_manager::store::{SqliteStore, Store};

const POOL_MAILBOX_SIZE: usize = 1024;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting berth resource manager");

    let config = Config::from_env()?;
    info!(
        data_dir = %config.data_dir.display(),
        default_pool = %config.default_pool,
        pools = config.pools.len(),
        "Configuration loaded"
    );

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(config.store_path())?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (publisher, mut allocation_events) = ChannelPublisher::new();
    let publisher: Arc<dyn AllocationPublisher> = Arc::new(publisher);
    let router = Arc::new(PoolRouter::new());

    let fleet = Arc::new(Fleet::new(
        config.fleet_config(),
        AgentDeps {
            clock: clock.clone(),
            publisher: publisher.clone(),
            listener: router.clone(),
            store: Some(store.clone()),
        },
        shutdown_rx.clone(),
    ));
    fleet.restore(&config.pool_names())?;

    let mut pool_tasks = Vec::new();
    for pool_config in &config.pools {
        let provisioner: Option<Arc<dyn Provisioner>> = if pool_config.has_provisioner() {
            let (provisioner, mut scaling) =
                WatchProvisioner::new(pool_config.slots_per_instance, pool_config.max_instances);
            let name = pool_config.name.clone();
            tokio::spawn(async move {
                while scaling.changed().await.is_ok() {
                    let info = scaling.borrow_and_update().clone();
                    info!(
                        resource_pool = %name,
                        desired_new_instances = info.desired_new_instances,
                        "Scaling info updated"
                    );
                }
            });
            Some(Arc::new(provisioner))
        } else {
            None
        };

        let deps = PoolDeps {
            gateway: fleet.clone(),
            publisher: publisher.clone(),
            clock: clock.clone(),
            store: Some(store.clone()),
            provisioner,
            priority_hook: None,
        };
        let pool = ResourcePool::new(pool_config.clone(), deps)?;
        let (handle, task) = PoolActor::spawn(
            pool,
            clock.clone(),
            config.tick_interval,
            POOL_MAILBOX_SIZE,
            shutdown_rx.clone(),
        );
        router.register(handle);
        pool_tasks.push(task);
        info!(resource_pool = %pool_config.name, "Resource pool started");
    }

    tokio::spawn(async move {
        while let Some(event) = allocation_events.recv().await {
            debug!(
                allocation_id = %event.allocation_id(),
                event_type = event.event_type(),
                "Allocation event"
            );
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    for task in pool_tasks {
        let _ = task.await;
    }

    info!("Resource manager shutdown complete");
    Ok(())
}
