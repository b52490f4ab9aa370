//! Helper functions for common cache operations.

use crate::cache::TagCache;
use crate::codec::Lookup;
use crate::error::CacheResult;
use crate::lock::DEFAULT_LOCK_ITERATIONS;
use serde::{Serialize, de::DeserializeOwned};
use std::future::Future;
use std::time::Duration;

/// A hit as a value; a stored null counts when `T` accepts null.
fn hit<T: DeserializeOwned>(lookup: Lookup<T>) -> Option<T> {
    match lookup {
        Lookup::Found(value) => Some(value),
        Lookup::Null => serde_json::from_value(serde_json::Value::Null).ok(),
        Lookup::Missing => None,
    }
}

/// Remember a value for a given duration.
///
/// If the key holds a valid entry, returns it. If not, calls the factory,
/// caches the result under `tags` and returns it. The key's advisory lock
/// is held while the factory runs, so concurrent callers wait for the first
/// one instead of all regenerating the value; a caller that cannot get the
/// lock in time computes the value anyway.
///
/// # Examples
///
/// ```
/// use keystone_cache::{CacheConfig, MemoryBackend, TagCache, remember};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), keystone_cache::CacheError> {
/// let cache = TagCache::direct(Arc::new(MemoryBackend::new()), &CacheConfig::memory());
///
/// let total: u64 = remember(&cache, "report:total", Some(Duration::from_secs(60)), &["reports"], || async {
///     Ok::<_, keystone_cache::CacheError>(42)
/// })
/// .await?;
/// assert_eq!(total, 42);
/// # Ok(())
/// # }
/// ```
pub async fn remember<T, F, Fut>(
    cache: &TagCache,
    key: &str,
    ttl: Option<Duration>,
    tags: &[&str],
    factory: F,
) -> CacheResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = CacheResult<T>>,
{
    if let Some(value) = hit(cache.get(key).await?) {
        return Ok(value);
    }

    let locked = cache.lock(key, DEFAULT_LOCK_ITERATIONS).await?;
    if locked {
        // Someone may have filled the entry while we waited.
        if let Some(value) = hit(cache.get(key).await?) {
            cache.unlock(key).await?;
            return Ok(value);
        }
    }

    let outcome = match factory().await {
        Ok(value) => cache.set(key, &value, ttl, tags).await.map(|_| value),
        Err(err) => Err(err),
    };

    if locked {
        cache.unlock(key).await?;
    }
    outcome
}

/// Remember a value forever (no TTL).
pub async fn remember_forever<T, F, Fut>(
    cache: &TagCache,
    key: &str,
    tags: &[&str],
    factory: F,
) -> CacheResult<T>
where
    T: Serialize + DeserializeOwned,
    F: FnOnce() -> Fut,
    Fut: Future<Output = CacheResult<T>>,
{
    remember(cache, key, None, tags, factory).await
}
