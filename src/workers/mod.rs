use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::lock::PgLocker;

pub mod tasks;

#[async_trait]
pub trait PeriodicTask: Send + Sync {
    fn name(&self) -> &'static str;
    fn interval(&self) -> Duration;
    async fn run(&self) -> anyhow::Result<()>;
}

/// Runs periodic maintenance tasks. Each task sleeps a random fraction of its
/// interval first, so a restarted fleet does not tick in lockstep, and every
/// tick executes under the task-name lock: across all instances at most one
/// runs a given task at a time. A tick that loses the lock is skipped.
pub struct Executor {
    tasks: Vec<Arc<dyn PeriodicTask>>,
    locker: Arc<PgLocker>,
}

impl Executor {
    pub fn new(tasks: Vec<Arc<dyn PeriodicTask>>, locker: Arc<PgLocker>) -> Self {
        Self { tasks, locker }
    }

    /// Drives all task loops until the process shuts down.
    pub async fn run(&self) {
        let mut handles = Vec::new();

        for task in &self.tasks {
            let interval = task.interval();
            if interval.is_zero() {
                info!(name = task.name(), "skipping task with zero interval");
                continue;
            }

            let task = task.clone();
            let locker = self.locker.clone();
            handles.push(tokio::spawn(async move {
                run_task(task, locker).await;
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn run_task(task: Arc<dyn PeriodicTask>, locker: Arc<PgLocker>) {
    let interval = task.interval();
    let initial_delay = interval.mul_f64(rand::thread_rng().gen_range(0.0..1.0));
    info!(name = task.name(), delay = ?initial_delay, "task scheduled");
    sleep(initial_delay).await;

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;
        execute(&task, &locker).await;
    }
}

async fn execute(task: &Arc<dyn PeriodicTask>, locker: &Arc<PgLocker>) {
    let name = task.name();

    let acquired = {
        let locker = locker.clone();
        tokio::task::spawn_blocking(move || locker.acquire(name)).await
    };
    match acquired {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!(name, error = %err, "skipping tick, lock not acquired");
            return;
        }
        Err(err) => {
            error!(name, error = %err, "lock acquisition panicked");
            return;
        }
    }

    let start = Instant::now();
    // The task runs in its own spawn so a panic is contained and reported
    // instead of taking the loop down.
    let run = {
        let task = task.clone();
        tokio::spawn(async move { task.run().await }).await
    };
    let elapsed = start.elapsed();

    match run {
        Ok(Ok(())) => info!(name, duration = ?elapsed, "task succeeded"),
        Ok(Err(err)) => error!(name, duration = ?elapsed, error = %err, "task failed"),
        Err(err) if err.is_panic() => error!(name, duration = ?elapsed, "task panicked"),
        Err(err) => error!(name, duration = ?elapsed, error = %err, "task aborted"),
    }

    let released = {
        let locker = locker.clone();
        tokio::task::spawn_blocking(move || locker.release(name)).await
    };
    match released {
        Ok(Ok(())) => {}
        Ok(Err(err)) => error!(name, error = %err, "failed to release lock"),
        Err(err) => error!(name, error = %err, "lock release panicked"),
    }
}
