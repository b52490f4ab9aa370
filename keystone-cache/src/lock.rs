//! Advisory locks built on create-if-absent writes.
//!
//! A lock is a sentinel entry at the lock key with a short TTL, so a holder
//! that dies simply lets it expire. Acquisition polls with a short random
//! pause between attempts; there is no notification or queueing.
//!
//! Release is not ownership-checked: any caller may release any lock.

use crate::backend::CacheBackend;
use crate::error::CacheResult;
use crate::key::KeyNormalizer;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Retries attempted by [`LockManager::acquire`] when the caller has no
/// preference.
pub const DEFAULT_LOCK_ITERATIONS: u32 = 15;

const LOCK_SENTINEL: &str = "1";
const MIN_PAUSE_MICROS: u64 = 10;
const MAX_PAUSE_MICROS: u64 = 1_000;

/// Acquires and releases advisory locks.
#[derive(Clone)]
pub struct LockManager {
    backend: Arc<dyn CacheBackend>,
    keys: KeyNormalizer,
    ttl: Duration,
}

impl LockManager {
    /// Create a lock manager. Locks expire after `ttl`.
    pub fn new(backend: Arc<dyn CacheBackend>, keys: KeyNormalizer, ttl: Duration) -> Self {
        Self { backend, keys, ttl }
    }

    /// Lock expiration.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the lock on `key`, retrying up to `max_iterations` times.
    ///
    /// Returns `Ok(false)` when the lock stayed taken, or for an empty key.
    /// Backend failures are returned as errors.
    pub async fn acquire(&self, key: &str, max_iterations: u32) -> CacheResult<bool> {
        let Ok(lock_key) = self.keys.lock(key) else {
            return Ok(false);
        };

        let mut retries = 0;
        loop {
            if self
                .backend
                .set_if_absent(&lock_key, LOCK_SENTINEL.to_string(), Some(self.ttl))
                .await?
            {
                debug!("Acquired lock {} after {} retries", key, retries);
                return Ok(true);
            }

            if retries >= max_iterations {
                error!(
                    "Could not acquire lock {} after {} attempts",
                    key,
                    retries + 1
                );
                return Ok(false);
            }
            retries += 1;

            let pause = rand::rng().random_range(MIN_PAUSE_MICROS..=MAX_PAUSE_MICROS);
            tokio::time::sleep(Duration::from_micros(pause)).await;
        }
    }

    /// Release the lock on `key`.
    ///
    /// Returns `false` if no lock was held.
    pub async fn release(&self, key: &str) -> CacheResult<bool> {
        let Ok(lock_key) = self.keys.lock(key) else {
            return Ok(false);
        };
        let released = self.backend.delete(&lock_key).await?;
        debug!("Released lock {}: {}", key, released);
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::HashMode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(ttl: Duration) -> LockManager {
        let keys = KeyNormalizer::new(None, Some("test"), HashMode::None, HashMode::None);
        LockManager::new(Arc::new(MemoryBackend::new()), keys, ttl)
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_and_release() {
        let locks = manager(Duration::from_secs(5));

        assert!(locks.acquire("job", DEFAULT_LOCK_ITERATIONS).await.unwrap());
        assert!(!locks.acquire("job", 3).await.unwrap());
        assert!(locks.acquire("other", 0).await.unwrap());

        assert!(locks.release("job").await.unwrap());
        assert!(!locks.release("job").await.unwrap());
        assert!(locks.acquire("job", 0).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires() {
        let locks = manager(Duration::from_secs(5));

        assert!(locks.acquire("job", 0).await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(locks.acquire("job", 0).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_key() {
        let locks = manager(Duration::from_secs(5));
        assert!(!locks.acquire("", 1).await.unwrap());
        assert!(!locks.release("").await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_mutual_exclusion() {
        let locks = manager(Duration::from_secs(30));
        let inside = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            let entered = entered.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    while !locks.acquire("shared", 100).await.unwrap() {}
                    assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                    entered.fetch_add(1, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                    locks.release("shared").await.unwrap();
                }
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 40);
    }
}
