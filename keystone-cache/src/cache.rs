//! The tag-aware cache façade.

use crate::backend::{CacheBackend, MemoryBackend, SetBackend};
use crate::codec::{Codec, Lookup};
use crate::config::{BackendKind, CacheConfig, Capability};
use crate::error::{CacheError, CacheResult};
use crate::key::KeyNormalizer;
use crate::lock::LockManager;
use crate::tags::{DirectTagIndex, TagIndex, TagState, VersionedEntry, VersionedTagIndex};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "redis")]
use crate::backend::RedisBackend;

#[cfg(feature = "memcached")]
use crate::backend::MemcachedBackend;

/// Cache with tag-based invalidation and advisory locks.
///
/// Logical keys are mapped to physical keys by a [`KeyNormalizer`]. Empty
/// keys and tags never reach the backend: operations given one report a
/// plain failure (`false`, [`Lookup::Missing`], `None`).
///
/// # Examples
///
/// ```
/// use keystone_cache::{CacheConfig, Lookup, MemoryBackend, TagCache};
/// use std::sync::Arc;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), keystone_cache::CacheError> {
/// let config = CacheConfig::memory().with_key_prefix("app");
/// let cache = TagCache::direct(Arc::new(MemoryBackend::new()), &config);
///
/// cache.set("user:1", &"Tom", None, &["profile"]).await?;
/// assert_eq!(cache.get::<String>("user:1").await?, Lookup::Found("Tom".to_string()));
///
/// cache.remove_tag("profile").await?;
/// assert!(cache.get::<String>("user:1").await?.is_missing());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TagCache {
    backend: Arc<dyn CacheBackend>,
    index: TagIndex,
    keys: KeyNormalizer,
    codec: Codec,
    locks: LockManager,
}

impl TagCache {
    /// Build a cache using the direct strategy over a set-capable backend.
    pub fn direct<B: SetBackend + 'static>(backend: Arc<B>, config: &CacheConfig) -> Self {
        let keys = KeyNormalizer::from_config(config);
        let index = TagIndex::Direct(DirectTagIndex::new(backend.clone(), keys.clone()));
        Self::assemble(backend, index, keys, config)
    }

    /// Build a cache using the versioned strategy over any backend.
    pub fn versioned<B: CacheBackend + 'static>(backend: Arc<B>, config: &CacheConfig) -> Self {
        let keys = KeyNormalizer::from_config(config);
        let index = TagIndex::Versioned(VersionedTagIndex::new(backend.clone(), keys.clone()));
        Self::assemble(backend, index, keys, config)
    }

    fn assemble(
        backend: Arc<dyn CacheBackend>,
        index: TagIndex,
        keys: KeyNormalizer,
        config: &CacheConfig,
    ) -> Self {
        let locks = LockManager::new(backend.clone(), keys.clone(), config.lock_ttl);
        Self {
            backend,
            index,
            keys,
            codec: Codec::new(config.serializer),
            locks,
        }
    }

    /// Connect to the configured backend.
    ///
    /// Memcached always gets the versioned strategy; Redis and the memory
    /// backend use the direct one unless the configuration asks otherwise.
    pub async fn connect(config: CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        let versioned = config.tag_strategy == Some(Capability::VersionedOnly);

        let cache = match config.backend {
            BackendKind::Memory => {
                let backend = Arc::new(MemoryBackend::new());
                if versioned {
                    Self::versioned(backend, &config)
                } else {
                    Self::direct(backend, &config)
                }
            }
            #[cfg(feature = "redis")]
            BackendKind::Redis => {
                let backend = Arc::new(RedisBackend::connect(&config).await?);
                if versioned {
                    Self::versioned(backend, &config)
                } else {
                    Self::direct(backend, &config)
                }
            }
            #[cfg(feature = "memcached")]
            BackendKind::Memcached => {
                Self::versioned(Arc::new(MemcachedBackend::connect(&config).await?), &config)
            }
            #[allow(unreachable_patterns)]
            other => {
                return Err(CacheError::Config(format!(
                    "support for the {} backend is not compiled in",
                    other
                )));
            }
        };

        debug!(
            "Cache ready on {} with {:?} tags",
            cache.backend.name(),
            cache.capability()
        );
        Ok(cache)
    }

    /// The tag strategy in use.
    pub fn capability(&self) -> Capability {
        if self.index.is_direct() {
            Capability::DirectCapable
        } else {
            Capability::VersionedOnly
        }
    }

    /// Name of the backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// The key normalizer.
    pub fn keys(&self) -> &KeyNormalizer {
        &self.keys
    }

    /// The lock manager sharing this cache's backend and key space.
    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    // Reads

    /// Unwrap a raw stored payload, validating tag versions when needed.
    async fn open(&self, physical: &str, raw: String) -> CacheResult<Option<String>> {
        match &self.index {
            TagIndex::Direct(_) => Ok(Some(raw)),
            TagIndex::Versioned(index) => {
                let entry = VersionedEntry::decode(raw);
                if index.validate(physical, &entry.tags).await? {
                    Ok(Some(entry.value))
                } else {
                    Ok(None)
                }
            }
        }
    }

    async fn read(&self, physical: &str) -> CacheResult<Option<String>> {
        match self.backend.get(physical).await? {
            Some(raw) => self.open(physical, raw).await,
            None => Ok(None),
        }
    }

    /// Get a value.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Lookup<T>> {
        let Ok(physical) = self.keys.value(key) else {
            return Ok(Lookup::Missing);
        };
        match self.read(&physical).await? {
            Some(payload) => self.codec.decode(&payload),
            None => Ok(Lookup::Missing),
        }
    }

    /// Get several values.
    ///
    /// Only keys that were hit appear in the result.
    pub async fn get_multi<T: DeserializeOwned>(
        &self,
        keys: &[&str],
    ) -> CacheResult<HashMap<String, Lookup<T>>> {
        let mut logical = Vec::with_capacity(keys.len());
        let mut physical = Vec::with_capacity(keys.len());
        for key in keys {
            if let Ok(normalized) = self.keys.value(key) {
                logical.push(*key);
                physical.push(normalized);
            }
        }

        let raws = self.backend.get_many(&physical).await?;
        let mut hits = HashMap::new();
        for ((key, physical), raw) in logical.into_iter().zip(&physical).zip(raws) {
            let Some(raw) = raw else { continue };
            if let Some(payload) = self.open(physical, raw).await? {
                hits.insert(key.to_string(), self.codec.decode(&payload)?);
            }
        }
        Ok(hits)
    }

    /// Whether a key holds a live, valid entry.
    pub async fn exists(&self, key: &str) -> CacheResult<bool> {
        let Ok(physical) = self.keys.value(key) else {
            return Ok(false);
        };
        match &self.index {
            TagIndex::Direct(_) => self.backend.exists(&physical).await,
            TagIndex::Versioned(_) => Ok(self.read(&physical).await?.is_some()),
        }
    }

    // Writes

    /// Encode a value for storage, wrapping it in an envelope when versioned.
    ///
    /// Untagged integers stay bare so backend counters keep working on them;
    /// a bare integer can never be read back as an envelope.
    async fn seal<T: Serialize + ?Sized>(
        &self,
        value: &T,
        tags: &[String],
    ) -> CacheResult<String> {
        let payload = self.codec.encode(value)?;
        match &self.index {
            TagIndex::Versioned(_) if tags.is_empty() && payload.parse::<i64>().is_ok() => {
                Ok(payload)
            }
            TagIndex::Versioned(index) => {
                let stamped = index.stamp_tags(tags).await?;
                VersionedEntry::new(payload, stamped).encode()
            }
            TagIndex::Direct(_) => Ok(payload),
        }
    }

    async fn after_write(
        &self,
        physical: &str,
        tags: &[String],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        if let TagIndex::Direct(index) = &self.index {
            index.retag(physical, tags, ttl).await?;
        }
        Ok(())
    }

    /// Store a value, replacing any previous one and its tags.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> CacheResult<bool> {
        let (Ok(physical), Some(tags)) = (self.keys.value(key), tag_list(tags)) else {
            return Ok(false);
        };
        let stored = self.seal(value, &tags).await?;
        self.backend.set(&physical, stored, ttl).await?;
        self.after_write(&physical, &tags, ttl).await?;
        Ok(true)
    }

    /// Store several values with the same TTL and tags.
    ///
    /// Returns `true` only if every value was stored.
    pub async fn set_multi<T: Serialize>(
        &self,
        entries: &[(&str, T)],
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> CacheResult<bool> {
        let mut stored = true;
        for (key, value) in entries {
            stored &= self.set(key, value, ttl, tags).await?;
        }
        Ok(stored)
    }

    /// Store a value only if the key holds no live entry.
    pub async fn add<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> CacheResult<bool> {
        let (Ok(physical), Some(tags)) = (self.keys.value(key), tag_list(tags)) else {
            return Ok(false);
        };
        let stored = self.seal(value, &tags).await?;

        if self
            .backend
            .set_if_absent(&physical, stored.clone(), ttl)
            .await?
        {
            self.after_write(&physical, &tags, ttl).await?;
            return Ok(true);
        }

        // A stale versioned entry is deleted by the read and may be replaced.
        if !self.index.is_direct()
            && self.read(&physical).await?.is_none()
            && self.backend.set_if_absent(&physical, stored, ttl).await?
        {
            return Ok(true);
        }
        Ok(false)
    }

    /// Reset the expiration of a live entry.
    pub async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let Ok(physical) = self.keys.value(key) else {
            return Ok(false);
        };
        match &self.index {
            TagIndex::Direct(index) => {
                let touched = self.backend.touch(&physical, ttl).await?;
                if touched {
                    index.expire_backref(&physical, ttl).await?;
                }
                Ok(touched)
            }
            TagIndex::Versioned(_) => {
                if self.read(&physical).await?.is_none() {
                    return Ok(false);
                }
                self.backend.touch(&physical, ttl).await
            }
        }
    }

    /// Touch several entries. Returns `true` only if every entry was touched.
    pub async fn touch_multi(&self, keys: &[&str], ttl: Option<Duration>) -> CacheResult<bool> {
        let mut touched = true;
        for key in keys {
            touched &= self.touch(key, ttl).await?;
        }
        Ok(touched)
    }

    /// Remove an entry.
    pub async fn remove(&self, key: &str) -> CacheResult<bool> {
        let Ok(physical) = self.keys.value(key) else {
            return Ok(false);
        };
        let removed = self.backend.delete(&physical).await?;
        if let TagIndex::Direct(index) = &self.index {
            index.untag(&physical).await?;
        }
        Ok(removed)
    }

    /// Remove several entries. Returns `true` if anything was removed.
    pub async fn remove_multi(&self, keys: &[&str]) -> CacheResult<bool> {
        let mut removed = false;
        for key in keys {
            removed |= self.remove(key).await?;
        }
        Ok(removed)
    }

    // Counters

    /// Add `offset` to a counter.
    ///
    /// A missing counter is seeded with zero first when `create_if_absent`
    /// is set; otherwise `None` is returned. A TTL, if given, is applied to
    /// the counter.
    pub async fn increment(
        &self,
        key: &str,
        offset: i64,
        ttl: Option<Duration>,
        create_if_absent: bool,
    ) -> CacheResult<Option<i64>> {
        let Ok(physical) = self.keys.value(key) else {
            return Ok(None);
        };
        self.backend
            .increment(&physical, offset, create_if_absent, ttl)
            .await
    }

    /// Subtract `offset` from a counter. See [`TagCache::increment`].
    pub async fn decrement(
        &self,
        key: &str,
        offset: i64,
        ttl: Option<Duration>,
        create_if_absent: bool,
    ) -> CacheResult<Option<i64>> {
        self.increment(key, offset.saturating_neg(), ttl, create_if_absent)
            .await
    }

    // Tags

    /// State of a tag: its members (direct) or its version (versioned).
    pub async fn get_tag(&self, tag: &str) -> CacheResult<Option<TagState>> {
        if tag.is_empty() {
            return Ok(None);
        }
        self.index.state(tag).await
    }

    /// State of several tags. Tags that do not exist are left out.
    pub async fn get_multi_tags(&self, tags: &[&str]) -> CacheResult<HashMap<String, TagState>> {
        let mut states = HashMap::new();
        for tag in tags {
            if let Some(state) = self.get_tag(tag).await? {
                states.insert(tag.to_string(), state);
            }
        }
        Ok(states)
    }

    /// Whether a tag exists.
    pub async fn exists_tag(&self, tag: &str) -> CacheResult<bool> {
        Ok(self.get_tag(tag).await?.is_some())
    }

    /// Invalidate every entry carrying the tag.
    ///
    /// Returns `false` when the tag does not exist.
    pub async fn remove_tag(&self, tag: &str) -> CacheResult<bool> {
        if tag.is_empty() {
            return Ok(false);
        }
        self.index.remove_tag(tag).await
    }

    /// Invalidate every entry carrying any of the tags.
    pub async fn remove_multi_tags(&self, tags: &[&str]) -> CacheResult<bool> {
        let tags: Vec<String> = tags
            .iter()
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
            .collect();
        if tags.is_empty() {
            return Ok(false);
        }
        self.index.remove_tags(&tags).await
    }

    // Locks

    /// Take the advisory lock on `key`. See [`LockManager::acquire`].
    pub async fn lock(&self, key: &str, max_iterations: u32) -> CacheResult<bool> {
        self.locks.acquire(key, max_iterations).await
    }

    /// Release the advisory lock on `key`.
    pub async fn unlock(&self, key: &str) -> CacheResult<bool> {
        self.locks.release(key).await
    }

    // Introspection

    /// Physical keys matching a glob pattern.
    ///
    /// Fails with [`CacheError::Unsupported`] on backends that cannot
    /// enumerate keys.
    pub async fn all_keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        self.backend.keys(pattern).await
    }

    /// Valid entries whose physical keys match a glob pattern.
    ///
    /// Bookkeeping keys (tags, locks, back-references) are skipped and the
    /// result is keyed by physical key. Fails with
    /// [`CacheError::Unsupported`] where [`all_keys`](Self::all_keys) does.
    pub async fn all<T: DeserializeOwned>(
        &self,
        pattern: &str,
    ) -> CacheResult<HashMap<String, Lookup<T>>> {
        let physical: Vec<String> = self
            .backend
            .keys(pattern)
            .await?
            .into_iter()
            .filter(|key| self.keys.is_value_key(key))
            .collect();

        let raws = self.backend.get_many(&physical).await?;
        let mut hits = HashMap::new();
        for (physical, raw) in physical.into_iter().zip(raws) {
            let Some(raw) = raw else { continue };
            if let Some(payload) = self.open(&physical, raw).await? {
                let value = self.codec.decode(&payload)?;
                hits.insert(physical, value);
            }
        }
        debug!("Listed {} entries matching '{}'", hits.len(), pattern);
        Ok(hits)
    }
}

/// Owned tag names, or `None` if any is empty.
fn tag_list(tags: &[&str]) -> Option<Vec<String>> {
    if tags.iter().any(|t| t.is_empty()) {
        return None;
    }
    let mut owned: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
    owned.sort();
    owned.dedup();
    Some(owned)
}
