use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("key not found")]
    NotFound,
    #[error("key expired")]
    Expired,
    #[error("key already exists")]
    Exists,
    #[error("unsupported cache url: {0}")]
    UnsupportedUrl(String),
}

pub type CacheResult<T> = Result<T, CacheError>;

/// Per-item expiry for `set`-family operations. With neither field set the
/// store's default TTL applies; a zero default means no expiry.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub valid_until: Option<Instant>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            valid_until: None,
        }
    }

    pub fn valid_until(deadline: Instant) -> Self {
        Self {
            ttl: None,
            valid_until: Some(deadline),
        }
    }
}

/// Expiry adjustments applied atomically with a read.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetOptions {
    pub refresh_ttl: Option<Duration>,
    pub refresh_default_ttl: bool,
    pub set_valid_until: Option<Instant>,
    pub delete: bool,
}

impl GetOptions {
    pub fn refresh_ttl(ttl: Duration) -> Self {
        Self {
            refresh_ttl: Some(ttl),
            ..Self::default()
        }
    }

    pub fn refresh_default_ttl() -> Self {
        Self {
            refresh_default_ttl: true,
            ..Self::default()
        }
    }

    pub fn set_valid_until(deadline: Instant) -> Self {
        Self {
            set_valid_until: Some(deadline),
            ..Self::default()
        }
    }

    pub fn delete_after_read() -> Self {
        Self {
            delete: true,
            ..Self::default()
        }
    }
}

/// Typed TTL store. Reads that adjust expiry and conditional writes are
/// atomic with respect to concurrent callers.
pub trait KvCache: Send + Sync {
    fn get(&self, key: &str, opts: GetOptions) -> CacheResult<Vec<u8>>;
    fn set(&self, key: &str, value: Vec<u8>, opts: SetOptions) -> CacheResult<()>;
    fn set_or_fail(&self, key: &str, value: Vec<u8>, opts: SetOptions) -> CacheResult<()>;
    fn delete(&self, key: &str) -> CacheResult<()>;
    /// Removes and returns all live items in one step.
    fn drain(&self) -> CacheResult<HashMap<String, Vec<u8>>>;
    /// Evicts expired items.
    fn cleanup(&self) -> CacheResult<()>;

    fn get_and_delete(&self, key: &str) -> CacheResult<Vec<u8>> {
        self.get(key, GetOptions::delete_after_read())
    }
}

/// Builds cache stores from a URL. `memory://` is the only supported scheme;
/// each `namespace` call yields an independent store.
#[derive(Clone)]
pub struct CacheFactory {
    url: String,
}

impl CacheFactory {
    pub fn from_url(url: &str) -> CacheResult<Self> {
        if url != "memory://" && !url.starts_with("memory://") {
            return Err(CacheError::UnsupportedUrl(url.to_string()));
        }
        Ok(Self {
            url: url.to_string(),
        })
    }

    pub fn namespace(&self, prefix: &str, default_ttl: Duration) -> Arc<dyn KvCache> {
        tracing::debug!(url = %self.url, prefix, "creating cache namespace");
        Arc::new(MemoryCache::new(default_ttl))
    }
}

struct Item {
    value: Vec<u8>,
    valid_until: Option<Instant>,
}

impl Item {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.valid_until, Some(deadline) if now >= deadline)
    }
}

/// Process-local realisation guarded by a rw-lock. Plain reads take the read
/// lock; anything that mutates expiry or contents takes the write lock, which
/// makes get-with-TTL-update and set-or-fail atomic.
pub struct MemoryCache {
    items: RwLock<HashMap<String, Item>>,
    default_ttl: Duration,
}

impl MemoryCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    fn new_item(&self, value: Vec<u8>, opts: SetOptions, now: Instant) -> Item {
        let valid_until = opts.valid_until.or_else(|| {
            opts.ttl
                .or(if self.default_ttl.is_zero() {
                    None
                } else {
                    Some(self.default_ttl)
                })
                .map(|ttl| now + ttl)
        });
        Item { value, valid_until }
    }

    fn is_plain_get(opts: &GetOptions) -> bool {
        opts.refresh_ttl.is_none()
            && !opts.refresh_default_ttl
            && opts.set_valid_until.is_none()
            && !opts.delete
    }
}

impl KvCache for MemoryCache {
    fn get(&self, key: &str, opts: GetOptions) -> CacheResult<Vec<u8>> {
        let now = Instant::now();

        if Self::is_plain_get(&opts) {
            let items = self.items.read();
            let item = items.get(key).ok_or(CacheError::NotFound)?;
            if item.is_expired(now) {
                return Err(CacheError::Expired);
            }
            return Ok(item.value.clone());
        }

        let mut items = self.items.write();

        if opts.delete {
            let removed = items.remove(key).ok_or(CacheError::NotFound)?;
            if removed.is_expired(now) {
                return Err(CacheError::Expired);
            }
            return Ok(removed.value);
        }

        let item = items.get_mut(key).ok_or(CacheError::NotFound)?;
        if item.is_expired(now) {
            return Err(CacheError::Expired);
        }

        if let Some(deadline) = opts.set_valid_until {
            item.valid_until = Some(deadline);
        } else if let Some(ttl) = opts.refresh_ttl {
            item.valid_until = Some(now + ttl);
        } else if opts.refresh_default_ttl && !self.default_ttl.is_zero() {
            item.valid_until = Some(now + self.default_ttl);
        }

        Ok(item.value.clone())
    }

    fn set(&self, key: &str, value: Vec<u8>, opts: SetOptions) -> CacheResult<()> {
        let now = Instant::now();
        let item = self.new_item(value, opts, now);
        self.items.write().insert(key.to_string(), item);
        Ok(())
    }

    fn set_or_fail(&self, key: &str, value: Vec<u8>, opts: SetOptions) -> CacheResult<()> {
        let now = Instant::now();
        let mut items = self.items.write();
        if let Some(existing) = items.get(key) {
            if !existing.is_expired(now) {
                return Err(CacheError::Exists);
            }
        }
        let item = self.new_item(value, opts, now);
        items.insert(key.to_string(), item);
        Ok(())
    }

    fn delete(&self, key: &str) -> CacheResult<()> {
        self.items.write().remove(key);
        Ok(())
    }

    fn drain(&self) -> CacheResult<HashMap<String, Vec<u8>>> {
        let now = Instant::now();
        let mut items = self.items.write();
        let drained = std::mem::take(&mut *items);
        drop(items);

        Ok(drained
            .into_iter()
            .filter(|(_, item)| !item.is_expired(now))
            .map(|(key, item)| (key, item.value))
            .collect())
    }

    fn cleanup(&self) -> CacheResult<()> {
        let now = Instant::now();
        self.items.write().retain(|_, item| !item.is_expired(now));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> MemoryCache {
        MemoryCache::new(Duration::ZERO)
    }

    #[test]
    fn get_returns_not_found_for_missing_key() {
        assert_eq!(
            cache().get("missing", GetOptions::default()),
            Err(CacheError::NotFound)
        );
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = cache();
        cache.set("k", b"v".to_vec(), SetOptions::default()).unwrap();
        assert_eq!(cache.get("k", GetOptions::default()).unwrap(), b"v");
    }

    #[test]
    fn expired_items_are_reported_as_expired() {
        let cache = cache();
        cache
            .set(
                "k",
                b"v".to_vec(),
                SetOptions::valid_until(Instant::now() - Duration::from_secs(1)),
            )
            .unwrap();
        assert_eq!(
            cache.get("k", GetOptions::default()),
            Err(CacheError::Expired)
        );
    }

    #[test]
    fn set_or_fail_rejects_live_keys_but_replaces_expired_ones() {
        let cache = cache();
        cache
            .set_or_fail("k", b"a".to_vec(), SetOptions::default())
            .unwrap();
        assert_eq!(
            cache.set_or_fail("k", b"b".to_vec(), SetOptions::default()),
            Err(CacheError::Exists)
        );

        cache
            .set(
                "k",
                b"a".to_vec(),
                SetOptions::valid_until(Instant::now() - Duration::from_secs(1)),
            )
            .unwrap();
        cache
            .set_or_fail("k", b"b".to_vec(), SetOptions::default())
            .unwrap();
        assert_eq!(cache.get("k", GetOptions::default()).unwrap(), b"b");
    }

    #[test]
    fn get_and_delete_is_single_use() {
        let cache = cache();
        cache.set("k", b"v".to_vec(), SetOptions::default()).unwrap();
        assert_eq!(cache.get_and_delete("k").unwrap(), b"v");
        assert_eq!(cache.get_and_delete("k"), Err(CacheError::NotFound));
    }

    #[test]
    fn refresh_ttl_extends_expiry() {
        let cache = cache();
        cache
            .set("k", b"v".to_vec(), SetOptions::ttl(Duration::from_millis(10)))
            .unwrap();
        cache
            .get("k", GetOptions::refresh_ttl(Duration::from_secs(60)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get("k", GetOptions::default()).is_ok());
    }

    #[test]
    fn drain_removes_and_returns_live_items() {
        let cache = cache();
        cache.set("a", b"1".to_vec(), SetOptions::default()).unwrap();
        cache.set("b", b"2".to_vec(), SetOptions::default()).unwrap();
        cache
            .set(
                "gone",
                b"3".to_vec(),
                SetOptions::valid_until(Instant::now() - Duration::from_secs(1)),
            )
            .unwrap();

        let drained = cache.drain().unwrap();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained.get("a").unwrap(), &b"1".to_vec());
        assert!(cache.get("a", GetOptions::default()).is_err());
    }

    #[test]
    fn cleanup_evicts_only_expired_items() {
        let cache = cache();
        cache.set("live", b"1".to_vec(), SetOptions::default()).unwrap();
        cache
            .set(
                "dead",
                b"2".to_vec(),
                SetOptions::valid_until(Instant::now() - Duration::from_secs(1)),
            )
            .unwrap();
        cache.cleanup().unwrap();
        assert!(cache.get("live", GetOptions::default()).is_ok());
        assert_eq!(
            cache.get("dead", GetOptions::default()),
            Err(CacheError::NotFound)
        );
    }

    #[test]
    fn factory_rejects_unknown_schemes() {
        assert!(CacheFactory::from_url("memory://").is_ok());
        assert!(matches!(
            CacheFactory::from_url("redis://localhost"),
            Err(CacheError::UnsupportedUrl(_))
        ));
    }
}
