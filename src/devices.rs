use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use diesel::prelude::*;
use diesel::PgConnection;
use thiserror::Error;
use tracing::warn;

use crate::cache::{GetOptions, KvCache, SetOptions};
use crate::ids::new_id;
use crate::models::{Device, NewDevice};
use crate::schema::devices;

pub const AUTH_CACHE_TTL: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found")]
    NotFound,
    #[error("more than one device matched")]
    MoreThanOne,
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
}

#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub id: Option<String>,
    pub auth_token: Option<String>,
    pub with_push_token: Option<bool>,
    pub seen_after: Option<NaiveDateTime>,
}

impl DeviceFilter {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_push_token(mut self, present: bool) -> Self {
        self.with_push_token = Some(present);
        self
    }

    pub fn seen_after(mut self, threshold: NaiveDateTime) -> Self {
        self.seen_after = Some(threshold);
        self
    }
}

/// Device registry with a read-through cache on the auth-token lookup used by
/// every mobile request. Negative lookups are never cached.
#[derive(Clone)]
pub struct DeviceRegistry {
    cache: Arc<dyn KvCache>,
}

impl DeviceRegistry {
    pub fn new(cache: Arc<dyn KvCache>) -> Self {
        Self { cache }
    }

    pub fn insert(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        name: Option<String>,
        push_token: Option<String>,
    ) -> Result<Device, DeviceError> {
        let device = NewDevice {
            id: new_id(),
            user_id: user_id.to_string(),
            name,
            auth_token: new_id(),
            push_token,
        };

        diesel::insert_into(devices::table)
            .values(&device)
            .execute(conn)?;

        devices::table
            .find(&device.id)
            .first(conn)
            .map_err(DeviceError::from)
    }

    pub fn select(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        filter: &DeviceFilter,
    ) -> Result<Vec<Device>, DeviceError> {
        let mut query = devices::table
            .filter(devices::user_id.eq(user_id))
            .into_boxed();

        if let Some(id) = &filter.id {
            query = query.filter(devices::id.eq(id.clone()));
        }
        if let Some(token) = &filter.auth_token {
            query = query.filter(devices::auth_token.eq(token.clone()));
        }
        if let Some(present) = filter.with_push_token {
            if present {
                query = query.filter(devices::push_token.is_not_null());
            } else {
                query = query.filter(devices::push_token.is_null());
            }
        }
        if let Some(threshold) = filter.seen_after {
            query = query.filter(devices::last_seen.ge(threshold));
        }

        query
            .order(devices::last_seen.desc())
            .load(conn)
            .map_err(DeviceError::from)
    }

    pub fn get(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        filter: &DeviceFilter,
    ) -> Result<Device, DeviceError> {
        let mut found = self.select(conn, user_id, filter)?;
        match found.len() {
            0 => Err(DeviceError::NotFound),
            1 => Ok(found.remove(0)),
            _ => Err(DeviceError::MoreThanOne),
        }
    }

    /// Resolves the target device for an enqueue: the explicit id when given,
    /// otherwise the most recently seen device, optionally restricted to
    /// devices active within the given window.
    pub fn get_any(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        device_id: Option<&str>,
        active_within: Option<Duration>,
    ) -> Result<Device, DeviceError> {
        let mut filter = DeviceFilter::default();
        if let Some(id) = device_id {
            filter.id = Some(id.to_string());
        }
        if let Some(window) = active_within {
            let threshold = chrono::Utc::now().naive_utc()
                - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
            filter.seen_after = Some(threshold);
        }

        let mut found = self.select(conn, user_id, &filter)?;
        if found.is_empty() {
            return Err(DeviceError::NotFound);
        }
        Ok(found.remove(0))
    }

    /// Auth-token lookup, served from cache for 10 minutes. Misses fall
    /// through to storage; absent tokens stay uncached.
    pub fn get_by_token(
        &self,
        conn: &mut PgConnection,
        token: &str,
    ) -> Result<Device, DeviceError> {
        if let Some(device) = self.cached_by_token(token) {
            return Ok(device);
        }

        let device: Device = devices::table
            .filter(devices::auth_token.eq(token))
            .first(conn)
            .optional()?
            .ok_or(DeviceError::NotFound)?;

        self.cache_device(&device);

        Ok(device)
    }

    pub fn update_push_token(
        &self,
        conn: &mut PgConnection,
        id: &str,
        push_token: Option<String>,
    ) -> Result<(), DeviceError> {
        self.invalidate(conn, id);

        diesel::update(devices::table.find(id))
            .set(devices::push_token.eq(push_token))
            .execute(conn)?;

        Ok(())
    }

    /// Applies a batch of observed timestamps. Each update only advances:
    /// `last_seen < new` guards against stale writes, which are silently
    /// dropped.
    pub fn set_last_seen(
        &self,
        conn: &mut PgConnection,
        batch: &HashMap<String, NaiveDateTime>,
    ) -> Result<(), DeviceError> {
        for (device_id, last_seen) in batch {
            diesel::update(
                devices::table
                    .find(device_id)
                    .filter(devices::last_seen.lt(last_seen)),
            )
            .set(devices::last_seen.eq(last_seen))
            .execute(conn)?;
        }
        Ok(())
    }

    pub fn remove(
        &self,
        conn: &mut PgConnection,
        user_id: &str,
        filter: &DeviceFilter,
    ) -> Result<usize, DeviceError> {
        let found = self.select(conn, user_id, filter)?;
        if found.is_empty() {
            return Ok(0);
        }

        for device in &found {
            self.drop_cached(device);
        }

        let ids: Vec<String> = found.into_iter().map(|device| device.id).collect();
        diesel::delete(devices::table.filter(devices::id.eq_any(&ids)))
            .execute(conn)
            .map_err(DeviceError::from)
    }

    pub fn cleanup(
        &self,
        conn: &mut PgConnection,
        until: NaiveDateTime,
    ) -> Result<usize, DeviceError> {
        diesel::delete(devices::table.filter(devices::last_seen.lt(until)))
            .execute(conn)
            .map_err(DeviceError::from)
    }

    fn cache_device(&self, device: &Device) {
        match serde_json::to_vec(device) {
            Ok(raw) => {
                let opts = SetOptions::ttl(AUTH_CACHE_TTL);
                let _ = self.cache.set(&token_key(&device.auth_token), raw.clone(), opts);
                let _ = self.cache.set(&id_key(&device.id), raw, opts);
            }
            Err(err) => warn!(device_id = %device.id, error = %err, "failed to cache device"),
        }
    }

    fn cached_by_token(&self, token: &str) -> Option<Device> {
        self.cached(&token_key(token))
    }

    fn cached_by_id(&self, id: &str) -> Option<Device> {
        self.cached(&id_key(id))
    }

    fn cached(&self, key: &str) -> Option<Device> {
        // Undecodable payloads count as misses and fall through to storage.
        self.cache
            .get(key, GetOptions::default())
            .ok()
            .and_then(|raw| serde_json::from_slice(&raw).ok())
    }

    /// Clears both cache keys for a device if a cached copy is at hand; the
    /// copy carries the auth token needed for the second key.
    fn invalidate_cached(&self, id: &str) -> bool {
        match self.cached_by_id(id) {
            Some(device) => {
                self.drop_cached(&device);
                true
            }
            None => false,
        }
    }

    fn invalidate(&self, conn: &mut PgConnection, id: &str) {
        if self.invalidate_cached(id) {
            return;
        }

        let stored = devices::table
            .find(id)
            .first::<Device>(conn)
            .optional()
            .ok()
            .flatten();
        if let Some(device) = stored {
            self.drop_cached(&device);
        }
    }

    fn drop_cached(&self, device: &Device) {
        let _ = self.cache.delete(&id_key(&device.id));
        let _ = self.cache.delete(&token_key(&device.auth_token));
    }
}

fn token_key(token: &str) -> String {
    format!("token:{token}")
}

fn id_key(id: &str) -> String {
    format!("id:{id}")
}
