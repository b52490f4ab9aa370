//! Memcached backend.

use super::{CacheBackend, effective_ttl};
use crate::config::{Capability, CacheConfig};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use memcache::MemcacheError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Longest relative expiration memcached accepts; larger values are read
/// as absolute unix timestamps.
const MAX_RELATIVE_EXPIRATION: u64 = 60 * 60 * 24 * 30;

/// Memcached cache backend.
///
/// Memcached cannot enumerate keys or hold sets, so it only hosts the
/// versioned tag strategy. Counters are unsigned: decrementing below zero
/// stops at zero.
///
/// The `memcache` crate is blocking, so every call runs on the blocking
/// thread pool behind a tokio mutex.
#[derive(Clone)]
pub struct MemcachedBackend {
    client: Arc<Mutex<memcache::Client>>,
}

impl MemcachedBackend {
    /// Connect to the memcached server named in the configuration.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use keystone_cache::{CacheConfig, CacheError, MemcachedBackend};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), CacheError> {
    ///     let config = CacheConfig::memcached("memcache://localhost:11211");
    ///     let backend = MemcachedBackend::connect(&config).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(config: &CacheConfig) -> CacheResult<Self> {
        let server_url = parse_memcached_url(&config.url)?;

        let client = tokio::task::spawn_blocking(move || memcache::connect(server_url.as_str()))
            .await
            .map_err(|e| CacheError::Connection(format!("Failed to spawn task: {}", e)))?
            .map_err(|e| CacheError::Connection(format!("Failed to connect: {}", e)))?;

        info!("Connected to Memcached cache backend");
        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    async fn run<T, F>(&self, op: F) -> CacheResult<Result<T, MemcacheError>>
    where
        T: Send + 'static,
        F: FnOnce(&memcache::Client) -> Result<T, MemcacheError> + Send + 'static,
    {
        let client = self.client.clone();
        tokio::task::spawn_blocking(move || {
            let client = client.blocking_lock();
            op(&client)
        })
        .await
        .map_err(|e| CacheError::Other(format!("Task join error: {}", e)))
    }
}

/// Normalize a memcached URL.
///
/// Accepts `memcache://host:port` as well as a bare `host:port`.
fn parse_memcached_url(url: &str) -> CacheResult<String> {
    if url.starts_with("memcache://") || url.starts_with("memcache+tls://") {
        Ok(url.to_string())
    } else if url.contains(':') {
        Ok(format!("memcache://{}", url))
    } else {
        Err(CacheError::InvalidUrl(format!(
            "Invalid Memcached URL: {}. Expected format: 'memcache://host:port' or 'host:port'",
            url
        )))
    }
}

/// Convert a TTL to a memcached expiration.
///
/// Partial seconds round up so short TTLs never turn into "no expiry".
fn expiration(ttl: Option<Duration>) -> u32 {
    let Some(ttl) = effective_ttl(ttl) else {
        return 0;
    };
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs += 1;
    }
    if secs > MAX_RELATIVE_EXPIRATION {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        secs = secs.saturating_add(now);
    }
    secs.min(u32::MAX as u64) as u32
}

/// Memcached reports "not stored" and "not found" as command errors.
fn is_command_error(err: &MemcacheError) -> bool {
    matches!(err, MemcacheError::CommandError(_))
}

#[async_trait]
impl CacheBackend for MemcachedBackend {
    fn name(&self) -> &'static str {
        "memcached"
    }

    fn capability(&self) -> Capability {
        Capability::VersionedOnly
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let key = key.to_string();
        Ok(self.run(move |client| client.get::<String>(&key)).await??)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        let key = key.to_string();
        let exp = expiration(ttl);
        self.run(move |client| client.set(&key, value.as_str(), exp))
            .await??;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let key = key.to_string();
        let exp = expiration(ttl);
        match self
            .run(move |client| client.add(&key, value.as_str(), exp))
            .await?
        {
            Ok(()) => Ok(true),
            Err(err) if is_command_error(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let key = key.to_string();
        Ok(self.run(move |client| client.delete(&key)).await??)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        // No native "exists" command.
        Ok(self.get(key).await?.is_some())
    }

    async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let key = key.to_string();
        let exp = expiration(ttl);
        match self.run(move |client| client.touch(&key, exp)).await? {
            Ok(touched) => Ok(touched),
            Err(err) if is_command_error(&err) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        create_if_absent: bool,
        ttl: Option<Duration>,
    ) -> CacheResult<Option<i64>> {
        let owned = key.to_string();
        let exp = expiration(ttl);

        let result = self
            .run(move |client| {
                if create_if_absent {
                    match client.add(&owned, "0", exp) {
                        Ok(()) => {}
                        Err(err) if is_command_error(&err) => {}
                        Err(err) => return Err(err),
                    }
                }
                let value = if delta >= 0 {
                    client.increment(&owned, delta.unsigned_abs())?
                } else {
                    client.decrement(&owned, delta.unsigned_abs())?
                };
                if exp > 0 {
                    client.touch(&owned, exp)?;
                }
                Ok(value)
            })
            .await?;

        match result {
            Ok(value) => {
                debug!("Incremented {} by {}: {}", key, delta, value);
                Ok(Some(i64::try_from(value).unwrap_or(i64::MAX)))
            }
            Err(err) if is_command_error(&err) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let owned = keys.to_vec();
        let mut found = self
            .run(move |client| {
                let refs: Vec<&str> = owned.iter().map(String::as_str).collect();
                client.gets::<String>(&refs)
            })
            .await??;
        Ok(keys.iter().map(|key| found.remove(key)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memcached_url() {
        assert_eq!(
            parse_memcached_url("memcache://localhost:11211").unwrap(),
            "memcache://localhost:11211"
        );
        assert_eq!(
            parse_memcached_url("localhost:11211").unwrap(),
            "memcache://localhost:11211"
        );
        assert!(parse_memcached_url("invalid").is_err());
    }

    #[test]
    fn test_expiration() {
        assert_eq!(expiration(None), 0);
        assert_eq!(expiration(Some(Duration::ZERO)), 0);
        assert_eq!(expiration(Some(Duration::from_secs(60))), 60);
        assert_eq!(expiration(Some(Duration::from_millis(1500))), 2);
        assert_eq!(expiration(Some(Duration::from_millis(1))), 1);
    }

    #[test]
    fn test_long_expiration_is_absolute() {
        let exp = expiration(Some(Duration::from_secs(MAX_RELATIVE_EXPIRATION + 1)));
        assert!(exp as u64 > MAX_RELATIVE_EXPIRATION * 2);
    }
}
