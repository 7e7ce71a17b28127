//! In-memory TTL caching with moka.
//!
//! The SDK keeps three of these: parsed relay lists, follow lists, and
//! profile metadata. Callers only rely on the at-most-once guarantee
//! within the TTL; a spurious miss just causes a refetch.
//!
//! The trait exists so embedders can swap in their own cache (a
//! persistent one, a no-op one for tests) through the system builder.

use std::time::{Duration, Instant};

use moka::Expiry;
use moka::sync::Cache;

/// Default cache capacity (number of entries).
pub const DEFAULT_CACHE_CAPACITY: u64 = 1000;

/// A bounded string-keyed mapping with per-entry TTL.
pub trait TtlCache<V: Clone>: Send + Sync {
    /// Look up `key`. Expired entries are misses.
    fn get(&self, key: &str) -> Option<V>;

    /// Store `value` under `key` for at most `ttl`.
    fn set_with_ttl(&self, key: &str, value: V, ttl: Duration);

    /// Drop `key` immediately.
    fn delete(&self, key: &str);
}

/// A cached value together with its requested lifetime.
#[derive(Clone)]
struct Expiring<V> {
    value: V,
    ttl: Duration,
}

/// Expiry policy that reads each entry's TTL from the value itself.
struct PerEntryTtl;

impl<V> Expiry<String, Expiring<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        entry: &Expiring<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// The default [`TtlCache`], backed by a bounded moka cache.
pub struct MokaTtlCache<V: Clone + Send + Sync + 'static> {
    inner: Cache<String, Expiring<V>>,
}

impl<V: Clone + Send + Sync + 'static> MokaTtlCache<V> {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .expire_after(PerEntryTtl)
                .build(),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Default for MokaTtlCache<V> {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> for MokaTtlCache<V> {
    fn get(&self, key: &str) -> Option<V> {
        self.inner.get(key).map(|entry| entry.value)
    }

    fn set_with_ttl(&self, key: &str, value: V, ttl: Duration) {
        self.inner.insert(key.to_string(), Expiring { value, ttl });
    }

    fn delete(&self, key: &str) {
        self.inner.invalidate(key);
    }
}
