use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::{rngs::OsRng, Rng};
use thiserror::Error;

use crate::cache::{CacheError, KvCache, SetOptions};

const CODE_SPACE: u32 = 1_000_000;

#[derive(Debug, Error)]
pub enum OtpError {
    #[error("code not found")]
    NotFound,
    #[error("failed to generate code: {0}")]
    Generate(CacheError),
    #[error("cache error: {0}")]
    Cache(CacheError),
}

#[derive(Debug, Clone)]
pub struct OneTimeCode {
    pub code: String,
    pub valid_until: DateTime<Utc>,
}

/// Issues 6-digit single-use authorization codes bound to a user id.
pub struct OtpService {
    storage: Arc<dyn KvCache>,
    ttl: Duration,
    retries: u32,
}

impl OtpService {
    pub fn new(storage: Arc<dyn KvCache>, ttl: Duration, retries: u32) -> Self {
        Self {
            storage,
            ttl,
            retries: retries.max(1),
        }
    }

    /// Generates a fresh code. Collisions with a live code are retried up to
    /// the configured count; set-or-fail keeps issuance atomic under
    /// concurrent generators.
    pub fn generate(&self, user_id: &str) -> Result<OneTimeCode, OtpError> {
        let valid_until = Utc::now() + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let deadline = Instant::now() + self.ttl;

        let mut last_err = CacheError::Exists;
        for _ in 0..self.retries {
            let number: u32 = OsRng.gen_range(0..CODE_SPACE);
            let code = format!("{number:06}");

            match self.storage.set_or_fail(
                &code,
                user_id.as_bytes().to_vec(),
                SetOptions::valid_until(deadline),
            ) {
                Ok(()) => return Ok(OneTimeCode { code, valid_until }),
                Err(err) => last_err = err,
            }
        }

        Err(OtpError::Generate(last_err))
    }

    /// Resolves a code to its user id, consuming it.
    pub fn validate(&self, code: &str) -> Result<String, OtpError> {
        match self.storage.get_and_delete(code) {
            Ok(value) => Ok(String::from_utf8_lossy(&value).into_owned()),
            Err(CacheError::NotFound) | Err(CacheError::Expired) => Err(OtpError::NotFound),
            Err(err) => Err(OtpError::Cache(err)),
        }
    }
}
