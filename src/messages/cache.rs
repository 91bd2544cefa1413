use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheError, GetOptions, KvCache, SetOptions};

use super::MessageStateOut;

/// Message-state cache keyed by `user_id:ext_id`. An empty payload is a
/// negative entry: the message is known to be absent and storage is skipped.
#[derive(Clone)]
pub struct StateCache {
    storage: Arc<dyn KvCache>,
    ttl: Duration,
}

impl StateCache {
    pub fn new(storage: Arc<dyn KvCache>, ttl: Duration) -> Self {
        Self { storage, ttl }
    }

    pub fn set(
        &self,
        user_id: &str,
        ext_id: &str,
        state: Option<&MessageStateOut>,
    ) -> Result<(), CacheError> {
        let payload = match state {
            Some(state) => serde_json::to_vec(state).map_err(|_| CacheError::NotFound)?,
            None => Vec::new(),
        };

        self.storage
            .set(&key(user_id, ext_id), payload, SetOptions::ttl(self.ttl))
    }

    /// `Ok(Some(..))` is a hit, `Ok(None)` a negative hit, `Err` a miss.
    /// A hit refreshes the entry's TTL.
    pub fn get(
        &self,
        user_id: &str,
        ext_id: &str,
    ) -> Result<Option<MessageStateOut>, CacheError> {
        let raw = self
            .storage
            .get(&key(user_id, ext_id), GetOptions::refresh_ttl(self.ttl))?;

        if raw.is_empty() {
            return Ok(None);
        }

        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|_| CacheError::NotFound)
    }
}

fn key(user_id: &str, ext_id: &str) -> String {
    format!("{user_id}:{ext_id}")
}
