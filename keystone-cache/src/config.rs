//! Cache configuration types.

use crate::error::{CacheError, CacheResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default expiration of lock sentinels.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(5);

/// Cache backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Redis backend
    Redis,
    /// Memcached backend
    Memcached,
    /// In-process backend
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Redis => "redis",
            BackendKind::Memcached => "memcached",
            BackendKind::Memory => "memory",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        match s.to_lowercase().as_str() {
            "redis" => Ok(BackendKind::Redis),
            "memcached" | "memcache" => Ok(BackendKind::Memcached),
            "memory" | "in-memory" => Ok(BackendKind::Memory),
            other => Err(CacheError::Config(format!("unknown backend '{}'", other))),
        }
    }
}

/// Hash function applied to logical keys before they reach the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashMode {
    /// Use the logical key verbatim.
    #[default]
    None,
    /// XXH3-128, hex encoded.
    Fast,
    /// SHA-256, hex encoded.
    Cryptographic,
}

impl FromStr for HashMode {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        match s.to_lowercase().as_str() {
            "none" | "0" => Ok(HashMode::None),
            "fast" | "xxh3" => Ok(HashMode::Fast),
            "cryptographic" | "sha" | "sha256" => Ok(HashMode::Cryptographic),
            other => Err(CacheError::Config(format!("unknown hash mode '{}'", other))),
        }
    }
}

/// How values are encoded into backend payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerializerKind {
    /// Plain strings and integers are stored as-is, everything else as JSON.
    #[default]
    Native,
    /// Every value is stored as JSON.
    Json,
}

impl FromStr for SerializerKind {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        match s.to_lowercase().as_str() {
            "native" => Ok(SerializerKind::Native),
            "json" => Ok(SerializerKind::Json),
            other => Err(CacheError::Config(format!("unknown serializer '{}'", other))),
        }
    }
}

/// Tag-invalidation strategy a backend can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Backend supports enumerable sets; tags keep explicit membership.
    DirectCapable,
    /// Flat key/value only; tags are version stamps validated on read.
    VersionedOnly,
}

impl FromStr for Capability {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        match s.to_lowercase().as_str() {
            "direct" | "direct_capable" => Ok(Capability::DirectCapable),
            "versioned" | "versioned_only" => Ok(Capability::VersionedOnly),
            other => Err(CacheError::Config(format!("unknown tag strategy '{}'", other))),
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache backend type
    pub backend: BackendKind,

    /// Connection URL
    #[serde(default)]
    pub url: String,

    /// Collection name shared by every key of this cache
    #[serde(default)]
    pub namespace: Option<String>,

    /// Key prefix for all cache keys
    #[serde(default)]
    pub key_prefix: Option<String>,

    /// Hash applied to value and lock keys
    #[serde(default)]
    pub hash_key: HashMode,

    /// Hash applied to tag names
    #[serde(default)]
    pub hash_tag: HashMode,

    /// Expiration of lock sentinels
    #[serde(with = "secs", default = "default_lock_ttl")]
    pub lock_ttl: Duration,

    /// Value encoding
    #[serde(default)]
    pub serializer: SerializerKind,

    /// Force a tag strategy instead of the backend's natural one
    #[serde(default)]
    pub tag_strategy: Option<Capability>,
}

fn default_lock_ttl() -> Duration {
    DEFAULT_LOCK_TTL
}

impl CacheConfig {
    fn with_backend(backend: BackendKind, url: String) -> Self {
        Self {
            backend,
            url,
            namespace: None,
            key_prefix: None,
            hash_key: HashMode::None,
            hash_tag: HashMode::None,
            lock_ttl: DEFAULT_LOCK_TTL,
            serializer: SerializerKind::Native,
            tag_strategy: None,
        }
    }

    /// Create a new Redis cache configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use keystone_cache::CacheConfig;
    ///
    /// let config = CacheConfig::redis("redis://localhost:6379");
    /// ```
    pub fn redis(url: impl Into<String>) -> Self {
        Self::with_backend(BackendKind::Redis, url.into())
    }

    /// Create a new Memcached cache configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use keystone_cache::CacheConfig;
    ///
    /// let config = CacheConfig::memcached("memcache://localhost:11211");
    /// ```
    pub fn memcached(url: impl Into<String>) -> Self {
        Self::with_backend(BackendKind::Memcached, url.into())
    }

    /// Create an in-process cache configuration.
    pub fn memory() -> Self {
        Self::with_backend(BackendKind::Memory, String::new())
    }

    /// Load configuration from `KEYSTONE_CACHE_*` environment variables.
    ///
    /// `KEYSTONE_CACHE_BACKEND` defaults to `memory`. Malformed values are
    /// rejected rather than silently replaced by defaults.
    pub fn from_env() -> CacheResult<Self> {
        let backend = match env("BACKEND") {
            Some(value) => value.parse()?,
            None => BackendKind::Memory,
        };
        let mut config = Self::with_backend(backend, env("URL").unwrap_or_default());

        if let Some(namespace) = env("NAMESPACE") {
            config = config.with_namespace(namespace);
        }
        if let Some(prefix) = env("PREFIX") {
            config = config.with_key_prefix(prefix);
        }
        if let Some(mode) = env("HASH_KEY") {
            config = config.with_hash_key(mode.parse()?);
        }
        if let Some(mode) = env("HASH_TAG") {
            config = config.with_hash_tag(mode.parse()?);
        }
        if let Some(ttl) = env("LOCK_TTL") {
            let secs: u64 = ttl
                .parse()
                .map_err(|_| CacheError::Config(format!("invalid lock TTL '{}'", ttl)))?;
            config = config.with_lock_ttl(Duration::from_secs(secs));
        }
        if let Some(serializer) = env("SERIALIZER") {
            config = config.with_serializer(serializer.parse()?);
        }
        if let Some(strategy) = env("STRATEGY") {
            config = config.with_tag_strategy(strategy.parse()?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Set the collection namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Set the key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Set the hash mode for value and lock keys.
    pub fn with_hash_key(mut self, mode: HashMode) -> Self {
        self.hash_key = mode;
        self
    }

    /// Set the hash mode for tag names.
    pub fn with_hash_tag(mut self, mode: HashMode) -> Self {
        self.hash_tag = mode;
        self
    }

    /// Set the lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Set the value serializer.
    pub fn with_serializer(mut self, serializer: SerializerKind) -> Self {
        self.serializer = serializer;
        self
    }

    /// Force a tag strategy.
    pub fn with_tag_strategy(mut self, strategy: Capability) -> Self {
        self.tag_strategy = Some(strategy);
        self
    }

    /// Check the configuration for programmer errors.
    pub fn validate(&self) -> CacheResult<()> {
        if self.lock_ttl.is_zero() {
            return Err(CacheError::Config("lock TTL must be positive".to_string()));
        }
        if self.backend != BackendKind::Memory && self.url.trim().is_empty() {
            return Err(CacheError::Config(format!(
                "{} backend requires a connection URL",
                self.backend
            )));
        }
        if self.backend == BackendKind::Memcached
            && self.tag_strategy == Some(Capability::DirectCapable)
        {
            return Err(CacheError::Config(
                "memcached cannot host the direct tag strategy".to_string(),
            ));
        }
        Ok(())
    }
}

fn env(name: &str) -> Option<String> {
    std::env::var(format!("KEYSTONE_CACHE_{}", name))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

mod secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config() {
        let config = CacheConfig::redis("redis://localhost:6379");
        assert_eq!(config.backend, BackendKind::Redis);
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.lock_ttl, DEFAULT_LOCK_TTL);
    }

    #[test]
    fn test_memcached_config() {
        let config = CacheConfig::memcached("memcache://localhost:11211");
        assert_eq!(config.backend, BackendKind::Memcached);
        assert_eq!(config.url, "memcache://localhost:11211");
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::memory()
            .with_namespace("cache")
            .with_key_prefix("app")
            .with_hash_key(HashMode::Fast)
            .with_hash_tag(HashMode::Cryptographic)
            .with_lock_ttl(Duration::from_secs(10))
            .with_serializer(SerializerKind::Json);

        assert_eq!(config.namespace.as_deref(), Some("cache"));
        assert_eq!(config.key_prefix.as_deref(), Some("app"));
        assert_eq!(config.hash_key, HashMode::Fast);
        assert_eq!(config.hash_tag, HashMode::Cryptographic);
        assert_eq!(config.lock_ttl, Duration::from_secs(10));
        assert_eq!(config.serializer, SerializerKind::Json);
    }

    #[test]
    fn test_validate_rejects_direct_memcached() {
        let config = CacheConfig::memcached("localhost:11211")
            .with_tag_strategy(Capability::DirectCapable);
        assert!(matches!(config.validate(), Err(CacheError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_lock_ttl() {
        let config = CacheConfig::memory().with_lock_ttl(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_requires_url() {
        assert!(CacheConfig::redis("").validate().is_err());
        assert!(CacheConfig::memory().validate().is_ok());
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("Redis".parse::<BackendKind>().unwrap(), BackendKind::Redis);
        assert_eq!("sha".parse::<HashMode>().unwrap(), HashMode::Cryptographic);
        assert_eq!("json".parse::<SerializerKind>().unwrap(), SerializerKind::Json);
        assert_eq!(
            "versioned".parse::<Capability>().unwrap(),
            Capability::VersionedOnly
        );
        assert!("mongo".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: CacheConfig =
            serde_json::from_str(r#"{"backend":"memcached","url":"localhost:11211","lock_ttl":3}"#)
                .unwrap();
        assert_eq!(config.backend, BackendKind::Memcached);
        assert_eq!(config.lock_ttl, Duration::from_secs(3));
        assert_eq!(config.hash_key, HashMode::None);
        assert_eq!(config.serializer, SerializerKind::Native);
        assert!(config.tag_strategy.is_none());
    }
}
