use std::collections::HashMap;
use std::time::{Duration, Instant};

use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;

const RETRY_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock not acquired")]
    NotAcquired,
    #[error("lock not held for key {0}")]
    NotHeld(String),
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("connection error: {0}")]
    Connection(#[from] diesel::ConnectionError),
}

#[derive(QueryableByName)]
struct FlagRow {
    #[diesel(sql_type = diesel::sql_types::Bool)]
    flag: bool,
}

/// Cross-instance named mutex built on session-scoped advisory locks. Each
/// held key pins its own database connection; the lock lives exactly as long
/// as that session, so a crashed holder releases implicitly.
pub struct PgLocker {
    database_url: String,
    prefix: String,
    timeout: Duration,
    held: Mutex<HashMap<String, PgConnection>>,
}

impl PgLocker {
    pub fn new(database_url: &str, prefix: &str, timeout: Duration) -> Self {
        Self {
            database_url: database_url.to_string(),
            prefix: prefix.to_string(),
            timeout,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Blocks up to the configured timeout. Callers on the async runtime must
    /// wrap this in `spawn_blocking`.
    pub fn acquire(&self, key: &str) -> Result<(), LockError> {
        let lock_key = self.lock_key(key);
        let mut conn = PgConnection::establish(&self.database_url)?;
        let deadline = Instant::now() + self.timeout;

        loop {
            let row: FlagRow =
                diesel::sql_query("SELECT pg_try_advisory_lock($1) AS flag")
                    .bind::<BigInt, _>(lock_key)
                    .get_result(&mut conn)?;
            if row.flag {
                break;
            }
            if Instant::now() >= deadline {
                return Err(LockError::NotAcquired);
            }
            std::thread::sleep(RETRY_INTERVAL);
        }

        let mut held = self.held.lock();
        // A stale entry would leak a session; drop it before pinning the new one.
        held.remove(key);
        held.insert(key.to_string(), conn);

        Ok(())
    }

    /// Releases a held key on the connection that acquired it.
    pub fn release(&self, key: &str) -> Result<(), LockError> {
        let mut conn = {
            let mut held = self.held.lock();
            held.remove(key)
                .ok_or_else(|| LockError::NotHeld(key.to_string()))?
        };

        let row: FlagRow = diesel::sql_query("SELECT pg_advisory_unlock($1) AS flag")
            .bind::<BigInt, _>(self.lock_key(key))
            .get_result(&mut conn)?;
        if !row.flag {
            return Err(LockError::NotHeld(key.to_string()));
        }

        Ok(())
    }

    /// Drops every pinned connection; their sessions end and the server
    /// releases the locks.
    pub fn close(&self) {
        self.held.lock().clear();
    }

    fn lock_key(&self, key: &str) -> i64 {
        let digest = Sha256::digest(format!("{}{}", self.prefix, key).as_bytes());
        i64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
    }
}
