//! Redis backend.

use super::{CacheBackend, SetBackend, effective_ttl};
use crate::config::{Capability, CacheConfig};
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use redis::{AsyncCommands, Client, Script, aio::ConnectionManager};
use std::time::Duration;
use tracing::{debug, info};

/// Seeds a missing counter (when allowed), applies the delta and refreshes
/// the TTL in one server-side step.
const INCREMENT_SCRIPT: &str = r#"
    if redis.call("exists", KEYS[1]) == 0 and ARGV[2] == "0" then
        return false
    end
    local value = redis.call("incrby", KEYS[1], ARGV[1])
    if tonumber(ARGV[3]) > 0 then
        redis.call("pexpire", KEYS[1], ARGV[3])
    end
    return value
"#;

/// Redis cache backend.
///
/// Hosts the direct tag strategy through native sets.
#[derive(Clone)]
pub struct RedisBackend {
    connection: ConnectionManager,
}

impl RedisBackend {
    /// Connect to the Redis server named in the configuration.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use keystone_cache::{CacheConfig, CacheError, RedisBackend};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), CacheError> {
    ///     let config = CacheConfig::redis("redis://localhost:6379");
    ///     let backend = RedisBackend::connect(&config).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn connect(config: &CacheConfig) -> CacheResult<Self> {
        let client =
            Client::open(config.url.as_str()).map_err(|e| CacheError::Connection(e.to_string()))?;

        let connection = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        info!("Connected to Redis cache backend");
        Ok(Self { connection })
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self { connection }
    }

    /// Get the underlying connection manager.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().clamp(1, u64::MAX as u128) as u64
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn capability(&self) -> Capability {
        Capability::DirectCapable
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.connection.clone();

        if let Some(ttl) = effective_ttl(ttl) {
            let _: () = conn.pset_ex(key, value, millis(ttl)).await?;
        } else {
            let _: () = conn.set(key, value).await?;
        }

        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let mut conn = self.connection.clone();

        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = effective_ttl(ttl) {
            cmd.arg("PX").arg(millis(ttl));
        }

        let result: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(result.is_some())
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        let deleted: usize = conn.del(key).await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let mut conn = self.connection.clone();
        let exists: bool = conn.exists(key).await?;
        Ok(exists)
    }

    async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let mut conn = self.connection.clone();

        match effective_ttl(ttl) {
            Some(ttl) => {
                let updated: bool = conn.pexpire(key, millis(ttl) as i64).await?;
                Ok(updated)
            }
            None => {
                // PERSIST reports false for keys that simply had no TTL.
                let exists: bool = conn.exists(key).await?;
                if exists {
                    let _: bool = conn.persist(key).await?;
                }
                Ok(exists)
            }
        }
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        create_if_absent: bool,
        ttl: Option<Duration>,
    ) -> CacheResult<Option<i64>> {
        let mut conn = self.connection.clone();
        let ttl_ms = effective_ttl(ttl).map(millis).unwrap_or(0);

        let value: Option<i64> = Script::new(INCREMENT_SCRIPT)
            .key(key)
            .arg(delta)
            .arg(if create_if_absent { "1" } else { "0" })
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;

        debug!("Incremented {} by {}: {:?}", key, delta, value);
        Ok(value)
    }

    async fn get_many(&self, keys: &[String]) -> CacheResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.connection.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
        Ok(values)
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        let deleted: usize = conn.del(keys).await?;
        debug!("Deleted {} of {} keys", deleted, keys.len());
        Ok(deleted)
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.keys(pattern).await?;
        Ok(keys)
    }
}

#[async_trait]
impl SetBackend for RedisBackend {
    async fn add_members(&self, key: &str, members: &[String]) -> CacheResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: usize = conn.sadd(key, members).await?;
        Ok(())
    }

    async fn remove_members(&self, key: &str, members: &[String]) -> CacheResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection.clone();
        let _: usize = conn.srem(key, members).await?;
        Ok(())
    }

    async fn members(&self, key: &str) -> CacheResult<Vec<String>> {
        let mut conn = self.connection.clone();
        let members: Vec<String> = conn.smembers(key).await?;
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_never_zero() {
        assert_eq!(millis(Duration::from_micros(10)), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }

    #[test]
    fn test_increment_script_compiles_to_hash() {
        // The script hash is what EVALSHA sends; it must be stable.
        let a = Script::new(INCREMENT_SCRIPT);
        let b = Script::new(INCREMENT_SCRIPT);
        assert_eq!(a.get_hash(), b.get_hash());
    }
}
