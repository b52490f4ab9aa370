//! Tag-invalidating cache façade for Keystone.
//!
//! Wraps a plain key/value backend with two things it lacks: grouping
//! entries under tags that can be invalidated together, and advisory locks
//! for coordinating writers of the same key.
//!
//! Two tag strategies are available, picked when the cache is built:
//!
//! - **Direct** - backends with sets (Redis, the in-memory backend) keep an
//!   explicit member set per tag; removing a tag deletes its members.
//! - **Versioned** - flat backends (Memcached) keep a version stamp per tag;
//!   entries record the stamps they were written against and turn stale once
//!   a stamp moves on.
//!
//! # Features
//!
//! - `redis` - Enable Redis backend support (enabled by default)
//! - `memcached` - Enable Memcached backend support (requires explicit opt-in)
//! - `memcached-tls` - TLS connections to Memcached (requires openssl)
//!
//! # Examples
//!
//! ## Tag-based Invalidation
//!
//! ```
//! use keystone_cache::prelude::*;
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//!
//! #[derive(Debug, PartialEq, Serialize, Deserialize)]
//! struct User {
//!     name: String,
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), CacheError> {
//! let config = CacheConfig::memory().with_key_prefix("app");
//! let cache = TagCache::versioned(Arc::new(MemoryBackend::new()), &config);
//!
//! let tom = User { name: "Tom".to_string() };
//! cache.set("u:1", &tom, None, &["profile"]).await?;
//! assert_eq!(cache.get::<User>("u:1").await?, Lookup::Found(tom));
//!
//! // Every entry tagged "profile" is now gone.
//! cache.remove_tag("profile").await?;
//! assert_eq!(cache.get::<User>("u:1").await?, Lookup::Missing);
//! # Ok(())
//! # }
//! ```
//!
//! ## Redis
//!
//! ```no_run
//! use keystone_cache::*;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), CacheError> {
//!     let config = CacheConfig::redis("redis://localhost:6379").with_namespace("cache");
//!     let cache = TagCache::connect(config).await?;
//!
//!     cache.set("key", "value", Some(Duration::from_secs(60)), &["group"]).await?;
//!
//!     if cache.lock("key", DEFAULT_LOCK_ITERATIONS).await? {
//!         // regenerate...
//!         cache.unlock("key").await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod cache;
pub mod codec;
pub mod config;
pub mod error;
pub mod helpers;
pub mod key;
pub mod lock;
pub mod tags;

pub use backend::{CacheBackend, MemoryBackend, SetBackend};
pub use cache::TagCache;
pub use codec::{Codec, Lookup};
pub use config::{BackendKind, CacheConfig, Capability, HashMode, SerializerKind};
pub use error::{CacheError, CacheResult};
pub use helpers::*;
pub use key::{KeyKind, KeyNormalizer};
pub use lock::{DEFAULT_LOCK_ITERATIONS, LockManager};
pub use tags::{TagIndex, TagState, TagVersion};

#[cfg(feature = "redis")]
pub use backend::RedisBackend;

#[cfg(feature = "memcached")]
pub use backend::MemcachedBackend;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::backend::{CacheBackend, MemoryBackend, SetBackend};
    pub use crate::cache::TagCache;
    pub use crate::codec::Lookup;
    pub use crate::config::{CacheConfig, Capability, HashMode, SerializerKind};
    pub use crate::error::{CacheError, CacheResult};
    pub use crate::helpers::{remember, remember_forever};
    pub use crate::lock::DEFAULT_LOCK_ITERATIONS;
    pub use crate::tags::TagState;

    #[cfg(feature = "redis")]
    pub use crate::backend::RedisBackend;

    #[cfg(feature = "memcached")]
    pub use crate::backend::MemcachedBackend;
}
