use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::db::{self, PgPool};
use crate::devices::DeviceRegistry;
use crate::messages::repository as messages_repo;

use super::PeriodicTask;

/// Bulk-hashes every settled message that is still stored in the clear.
pub struct MessagesHashingTask {
    pool: PgPool,
    interval: Duration,
}

impl MessagesHashingTask {
    pub fn new(pool: PgPool, interval: Duration) -> Self {
        Self { pool, interval }
    }
}

#[async_trait]
impl PeriodicTask for MessagesHashingTask {
    fn name(&self) -> &'static str {
        "messages:hashing"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> anyhow::Result<()> {
        let rows = db::with_conn(&self.pool, |conn| {
            messages_repo::hash_processed(conn, &[]).map_err(anyhow::Error::from)
        })
        .await?;

        if rows > 0 {
            info!(rows, "hashed messages");
        }
        Ok(())
    }
}

/// Deletes settled messages past their retention age.
pub struct MessagesCleanupTask {
    pool: PgPool,
    interval: Duration,
    max_age: Duration,
}

impl MessagesCleanupTask {
    pub fn new(pool: PgPool, interval: Duration, max_age: Duration) -> Self {
        Self {
            pool,
            interval,
            max_age,
        }
    }
}

#[async_trait]
impl PeriodicTask for MessagesCleanupTask {
    fn name(&self) -> &'static str {
        "messages:cleanup"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> anyhow::Result<()> {
        let until = Utc::now().naive_utc()
            - chrono::Duration::from_std(self.max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let rows = db::with_conn(&self.pool, move |conn| {
            messages_repo::cleanup(conn, until).map_err(anyhow::Error::from)
        })
        .await?;

        if rows > 0 {
            info!(rows, "cleaned up messages");
        }
        Ok(())
    }
}

/// Deletes devices that have not been seen within the retention window.
pub struct DevicesCleanupTask {
    pool: PgPool,
    registry: DeviceRegistry,
    interval: Duration,
    max_age: Duration,
}

impl DevicesCleanupTask {
    pub fn new(
        pool: PgPool,
        registry: DeviceRegistry,
        interval: Duration,
        max_age: Duration,
    ) -> Self {
        Self {
            pool,
            registry,
            interval,
            max_age,
        }
    }
}

#[async_trait]
impl PeriodicTask for DevicesCleanupTask {
    fn name(&self) -> &'static str {
        "devices:cleanup"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(&self) -> anyhow::Result<()> {
        let registry = self.registry.clone();
        let until = Utc::now().naive_utc()
            - chrono::Duration::from_std(self.max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let rows = db::with_conn(&self.pool, move |conn| {
            registry.cleanup(conn, until).map_err(anyhow::Error::from)
        })
        .await?;

        if rows > 0 {
            info!(rows, "cleaned up devices");
        }
        Ok(())
    }
}
