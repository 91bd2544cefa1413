use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::db::{self, PgPool};

use super::repository;

/// Collects ids of messages that reached a terminal state and hashes them in
/// batches. The queue deduplicates; a tick with an empty queue is free.
pub struct HashingQueue {
    pool: PgPool,
    interval: Duration,
    queue: Mutex<HashSet<i64>>,
}

impl HashingQueue {
    pub fn new(pool: PgPool, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            pool,
            interval,
            queue: Mutex::new(HashSet::new()),
        })
    }

    pub fn enqueue(&self, id: i64) {
        self.queue.lock().insert(id);
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.process().await;
        }
    }

    async fn process(&self) {
        let ids: Vec<i64> = {
            let mut queue = self.queue.lock();
            queue.drain().collect()
        };
        if ids.is_empty() {
            return;
        }

        debug!(count = ids.len(), "hashing settled messages");

        let result = db::with_conn(&self.pool, move |conn| {
            repository::hash_processed(conn, &ids).map_err(anyhow::Error::from)
        })
        .await;

        if let Err(err) = result {
            error!(error = %err, "failed to hash messages");
        }
    }
}

