//! Storage backend traits and adapters.
//!
//! Backends deal exclusively in physical keys and raw string payloads; key
//! normalization, encoding and tag bookkeeping live above this layer.

use crate::config::Capability;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::time::Duration;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis_cache;

#[cfg(feature = "memcached")]
pub mod memcached_cache;

pub use memory::{MemoryBackend, PURGE_INTERVAL};

#[cfg(feature = "redis")]
pub use redis_cache::RedisBackend;

#[cfg(feature = "memcached")]
pub use memcached_cache::MemcachedBackend;

/// Flat key/value operations every backend provides.
///
/// A `ttl` of `None` (or zero) means the entry never expires. Expired
/// entries must be reported as absent by every read.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// A name for logs and error messages.
    ///
    /// # Example
    /// - "memory"
    /// - "redis"
    fn name(&self) -> &'static str;

    /// The tag strategy this backend can host.
    fn capability(&self) -> Capability;

    /// Get the raw payload stored at `key`.
    ///
    /// # Returns
    ///
    /// Returns `Ok(Some(value))` if the key exists, `Ok(None)` if not found,
    /// or an error if the operation fails.
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    /// Store a payload, replacing any previous one.
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()>;

    /// Store a payload only if the key is absent.
    ///
    /// Must be atomic with respect to other writers: of two concurrent calls
    /// for the same absent key, exactly one returns `true`.
    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> CacheResult<bool>;

    /// Delete a key. Returns whether something was deleted.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Check if a key exists.
    async fn exists(&self, key: &str) -> CacheResult<bool>;

    /// Reset the expiration of an existing key. Returns `false` if the key
    /// does not exist.
    async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool>;

    /// Atomically add `delta` to the integer stored at `key`.
    ///
    /// A missing key is seeded with zero before the delta is applied when
    /// `create_if_absent` is set; otherwise `Ok(None)` is returned. A
    /// positive `ttl` is (re)applied to the counter.
    async fn increment(
        &self,
        key: &str,
        delta: i64,
        create_if_absent: bool,
        ttl: Option<Duration>,
    ) -> CacheResult<Option<i64>>;

    /// Get several keys.
    ///
    /// Returns payloads in the same order as `keys`.
    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        use futures::future::try_join_all;

        let futures = keys.iter().map(|key| self.get(key));
        try_join_all(futures).await
    }

    /// Delete several keys. Returns the number of keys deleted.
    async fn delete_many(&self, keys: &[String]) -> CacheResult<usize> {
        use futures::future::try_join_all;

        let futures = keys.iter().map(|key| self.delete(key));
        let deleted = try_join_all(futures).await?;
        Ok(deleted.into_iter().filter(|d| *d).count())
    }

    /// List physical keys matching a glob-style pattern.
    ///
    /// Backends without key enumeration report
    /// [`CacheError::Unsupported`].
    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let _ = pattern;
        Err(CacheError::unsupported("keys", self.name()))
    }
}

/// Backends with enumerable set values, able to host the direct strategy.
#[async_trait]
pub trait SetBackend: CacheBackend {
    /// Add members to the set at `key`, creating it if needed.
    async fn add_members(&self, key: &str, members: &[String]) -> CacheResult<()>;

    /// Remove members from the set at `key`. The set disappears once empty.
    async fn remove_members(&self, key: &str, members: &[String]) -> CacheResult<()>;

    /// All members of the set at `key` (empty when absent).
    async fn members(&self, key: &str) -> CacheResult<Vec<String>>;
}

/// Effective expiration: `None` and zero both mean "never".
pub(crate) fn effective_ttl(ttl: Option<Duration>) -> Option<Duration> {
    ttl.filter(|d| !d.is_zero())
}

/// Glob matching with `*` and `?`, as understood by Redis `KEYS`.
pub(crate) fn glob_match(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();
    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, c));
                p += 1;
            }
            Some(&ch) if ch == '?' || ch == candidate[c] => {
                p += 1;
                c += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    c = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }
    pattern[p..].iter().all(|ch| *ch == '*')
}
