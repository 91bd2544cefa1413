use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use tracing::{debug, error, info, warn};

use crate::cache::{KvCache, SetOptions};
use crate::db::{self, PgPool};
use crate::devices::DeviceRegistry;

/// Coalesces per-device "seen" stamps in the cache and flushes them to the
/// registry once per tick, bounding writes to about one per device per
/// interval regardless of request rate.
#[derive(Clone)]
pub struct OnlineTracker {
    cache: Arc<dyn KvCache>,
    pool: PgPool,
    devices: DeviceRegistry,
    interval: Duration,
}

impl OnlineTracker {
    pub fn new(
        cache: Arc<dyn KvCache>,
        pool: PgPool,
        devices: DeviceRegistry,
        interval: Duration,
    ) -> Self {
        Self {
            cache,
            pool,
            devices,
            interval: interval.max(Duration::from_secs(1)),
        }
    }

    /// Fire-and-forget: failures only lose one observation.
    pub fn set_online(&self, device_id: &str) {
        let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        if let Err(err) = self.cache.set(
            device_id,
            stamp.into_bytes(),
            SetOptions::default(),
        ) {
            warn!(device_id = %device_id, error = %err, "failed to record online status");
        }
    }

    pub async fn run(&self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            self.persist().await;
        }
    }

    async fn persist(&self) {
        let items = match self.cache.drain() {
            Ok(items) => items,
            Err(err) => {
                error!(error = %err, "failed to drain online status cache");
                return;
            }
        };
        if items.is_empty() {
            debug!("no online statuses to persist");
            return;
        }

        let batch: HashMap<String, NaiveDateTime> = items
            .into_iter()
            .map(|(device_id, raw)| {
                let stamp = String::from_utf8_lossy(&raw);
                let parsed = DateTime::parse_from_rfc3339(&stamp)
                    .map(|dt| dt.naive_utc())
                    .unwrap_or_else(|err| {
                        warn!(last_seen = %stamp, error = %err, "failed to parse last seen");
                        Utc::now().naive_utc()
                    });
                (device_id, parsed)
            })
            .collect();

        let devices = self.devices.clone();
        let count = batch.len();
        let result = db::with_conn(&self.pool, move |conn| {
            devices
                .set_last_seen(conn, &batch)
                .map_err(anyhow::Error::from)
        })
        .await;

        match result {
            Ok(()) => info!(count, "persisted last seen batch"),
            Err(err) => error!(error = %err, "failed to persist last seen batch"),
        }
    }
}
