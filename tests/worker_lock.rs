use std::env;
use std::time::Duration;

use anyhow::{Context, Result};
use smsbridge::lock::{LockError, PgLocker};

fn database_url() -> Result<String> {
    env::var("TEST_DATABASE_URL").context("TEST_DATABASE_URL must be set for integration tests")
}

#[tokio::test]
async fn lock_is_mutually_exclusive_across_instances() -> Result<()> {
    let url = database_url()?;

    let result = tokio::task::spawn_blocking(move || -> Result<()> {
        let first = PgLocker::new(&url, "tasks:", Duration::from_secs(5));
        let second = PgLocker::new(&url, "tasks:", Duration::from_millis(300));

        first.acquire("messages:hashing")?;

        // A second instance cannot take the same task name while it is held.
        match second.acquire("messages:hashing") {
            Err(LockError::NotAcquired) => {}
            other => panic!("expected lock contention, got {other:?}"),
        }

        // Different names do not contend.
        second.acquire("messages:cleanup")?;
        second.release("messages:cleanup")?;

        first.release("messages:hashing")?;
        second.acquire("messages:hashing")?;
        second.release("messages:hashing")?;

        first.close();
        second.close();
        Ok(())
    })
    .await?;

    result
}

#[tokio::test]
async fn releasing_a_lock_that_is_not_held_fails() -> Result<()> {
    let url = database_url()?;

    tokio::task::spawn_blocking(move || {
        let locker = PgLocker::new(&url, "tasks:", Duration::from_secs(1));
        assert!(matches!(
            locker.release("devices:cleanup"),
            Err(LockError::NotHeld(_))
        ));
    })
    .await?;

    Ok(())
}
