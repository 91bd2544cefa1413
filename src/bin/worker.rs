use std::sync::Arc;

use tokio::signal;
use tracing_subscriber::EnvFilter;

use smsbridge::{
    config::AppConfig,
    db,
    devices::DeviceRegistry,
    cache::CacheFactory,
    lock::PgLocker,
    workers::{
        tasks::{DevicesCleanupTask, MessagesCleanupTask, MessagesHashingTask},
        Executor, PeriodicTask,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "worker",
        database_url = %config.redacted_database_url(),
        pool_size = 2,
        "loaded configuration"
    );

    let pool = db::init_pool(&config.database_url, 2)?;
    let locker = Arc::new(PgLocker::new(
        &config.database_url,
        "tasks:",
        config.lock_timeout,
    ));

    let caches = CacheFactory::from_url(&config.cache_url)?;
    let devices = DeviceRegistry::new(caches.namespace("devices:", std::time::Duration::from_secs(600)));

    let tasks: Vec<Arc<dyn PeriodicTask>> = vec![
        Arc::new(MessagesHashingTask::new(
            pool.clone(),
            config.tasks_messages_hashing_interval,
        )),
        Arc::new(MessagesCleanupTask::new(
            pool.clone(),
            config.tasks_messages_cleanup_interval,
            config.tasks_messages_cleanup_max_age,
        )),
        Arc::new(DevicesCleanupTask::new(
            pool.clone(),
            devices,
            config.tasks_devices_cleanup_interval,
            config.tasks_devices_cleanup_max_age,
        )),
    ];

    let executor = Executor::new(tasks, locker.clone());

    tokio::select! {
        _ = executor.run() => {}
        _ = signal::ctrl_c() => {
            tracing::info!("worker received shutdown signal");
        }
    }

    locker.close();

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
