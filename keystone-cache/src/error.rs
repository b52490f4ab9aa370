//! Error types for cache operations.

use thiserror::Error;

/// Result type for cache operations.
pub type CacheResult<T> = Result<T, CacheError>;

/// Cache-specific errors.
///
/// Cache misses and lock timeouts are not errors; they come back as ordinary
/// values (`Lookup::Missing`, `false`). Variants here describe backend
/// failures, codec failures and misconfiguration.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Redis-specific error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Memcached-specific error
    #[cfg(feature = "memcached")]
    #[error("Memcached error: {0}")]
    Memcached(#[from] memcache::MemcacheError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Empty or otherwise unusable logical key.
    ///
    /// The façade converts this into a no-op failure result; it only escapes
    /// from the key normalizer itself.
    #[error("Invalid cache key: {0:?}")]
    InvalidKey(String),

    /// The active backend cannot provide this capability.
    #[error("Operation '{operation}' is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Generic error
    #[error("Cache error: {0}")]
    Other(String),
}

impl CacheError {
    /// Shorthand for [`CacheError::Unsupported`].
    pub fn unsupported(operation: &'static str, backend: &'static str) -> Self {
        CacheError::Unsupported { operation, backend }
    }

    /// Whether this error reports a missing backend capability.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, CacheError::Unsupported { .. })
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            CacheError::Deserialization(err.to_string())
        } else {
            CacheError::Serialization(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_display() {
        let err = CacheError::unsupported("keys", "memcached");
        assert!(err.is_unsupported());
        assert_eq!(
            err.to_string(),
            "Operation 'keys' is not supported by the memcached backend"
        );
    }

    #[test]
    fn test_json_syntax_error_is_deserialization() {
        let err: CacheError = serde_json::from_str::<u32>("{not json").unwrap_err().into();
        assert!(matches!(err, CacheError::Deserialization(_)));
    }
}
