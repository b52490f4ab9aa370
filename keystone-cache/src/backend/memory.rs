//! In-process backend.
//!
//! Supports both plain values and sets, so it can host either tag strategy.
//! Expiration is enforced lazily on access against the tokio clock, which
//! lets tests drive TTLs with a paused runtime. Expired slots are dropped
//! every [`PURGE_INTERVAL`] writes, or on demand with
//! [`MemoryBackend::purge_expired`].

use super::{CacheBackend, SetBackend, effective_ttl, glob_match};
use crate::config::Capability;
use crate::error::{CacheError, CacheResult};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

/// Writes between two sweeps of expired slots.
pub const PURGE_INTERVAL: usize = 256;

/// In-memory cache backend.
///
/// Expired slots stop being visible immediately but are only reclaimed by
/// the periodic sweep on writes or by [`purge_expired`](Self::purge_expired).
#[derive(Clone, Default)]
pub struct MemoryBackend {
    data: Arc<RwLock<HashMap<String, Slot>>>,
    writes: Arc<AtomicUsize>,
}

#[derive(Clone)]
struct Slot {
    data: Data,
    expires_at: Option<Instant>,
}

#[derive(Clone)]
enum Data {
    Value(String),
    Set(BTreeSet<String>),
}

impl Slot {
    fn value(value: String, ttl: Option<Duration>) -> Self {
        Self {
            data: Data::Value(value),
            expires_at: deadline(ttl),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|exp| exp > now)
    }
}

fn deadline(ttl: Option<Duration>) -> Option<Instant> {
    effective_ttl(ttl).map(|ttl| Instant::now() + ttl)
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::Other(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

impl MemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of physically stored keys, expired ones included.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    /// Whether nothing is physically stored.
    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }

    /// Drop every expired entry.
    pub async fn purge_expired(&self) -> usize {
        purge(&mut *self.data.write().await)
    }

    /// Count a write, sweeping expired slots once every `PURGE_INTERVAL`.
    fn note_write(&self, data: &mut HashMap<String, Slot>) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes.is_multiple_of(PURGE_INTERVAL) {
            let purged = purge(data);
            if purged > 0 {
                debug!("Purged {} expired entries", purged);
            }
        }
    }
}

fn purge(data: &mut HashMap<String, Slot>) -> usize {
    let now = Instant::now();
    let before = data.len();
    data.retain(|_, slot| slot.is_live(now));
    before - data.len()
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn capability(&self) -> Capability {
        Capability::DirectCapable
    }

    async fn get(&self, key: &str) -> CacheResult<Option<String>> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(slot) if slot.is_live(Instant::now()) => match &slot.data {
                Data::Value(value) => Ok(Some(value.clone())),
                Data::Set(_) => Err(wrong_type(key)),
            },
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> CacheResult<()> {
        let mut data = self.data.write().await;
        self.note_write(&mut data);
        data.insert(key.to_string(), Slot::value(value, ttl));
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> CacheResult<bool> {
        let mut data = self.data.write().await;
        if data.get(key).is_some_and(|slot| slot.is_live(Instant::now())) {
            return Ok(false);
        }
        self.note_write(&mut data);
        data.insert(key.to_string(), Slot::value(value, ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> CacheResult<bool> {
        let removed = self.data.write().await.remove(key);
        Ok(removed.is_some_and(|slot| slot.is_live(Instant::now())))
    }

    async fn exists(&self, key: &str) -> CacheResult<bool> {
        let data = self.data.read().await;
        Ok(data.get(key).is_some_and(|slot| slot.is_live(Instant::now())))
    }

    async fn touch(&self, key: &str, ttl: Option<Duration>) -> CacheResult<bool> {
        let mut data = self.data.write().await;
        match data.get_mut(key) {
            Some(slot) if slot.is_live(Instant::now()) => {
                slot.expires_at = deadline(ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(
        &self,
        key: &str,
        delta: i64,
        create_if_absent: bool,
        ttl: Option<Duration>,
    ) -> CacheResult<Option<i64>> {
        let mut data = self.data.write().await;
        let now = Instant::now();

        let current = match data.get(key) {
            Some(slot) if slot.is_live(now) => match &slot.data {
                Data::Value(value) => value.parse::<i64>().map_err(|_| {
                    CacheError::Other(format!("value at '{}' is not an integer", key))
                })?,
                Data::Set(_) => return Err(wrong_type(key)),
            },
            _ if create_if_absent => 0,
            _ => return Ok(None),
        };

        let next = current
            .checked_add(delta)
            .ok_or_else(|| CacheError::Other(format!("increment at '{}' overflows", key)))?;

        let expires_at = match effective_ttl(ttl) {
            Some(_) => deadline(ttl),
            None => data
                .get(key)
                .filter(|slot| slot.is_live(now))
                .and_then(|slot| slot.expires_at),
        };
        data.insert(
            key.to_string(),
            Slot {
                data: Data::Value(next.to_string()),
                expires_at,
            },
        );
        Ok(Some(next))
    }

    async fn delete_many(&self, keys: &[String]) -> CacheResult<usize> {
        let mut data = self.data.write().await;
        let now = Instant::now();
        let deleted = keys
            .iter()
            .filter_map(|key| data.remove(key))
            .filter(|slot| slot.is_live(now))
            .count();
        Ok(deleted)
    }

    async fn keys(&self, pattern: &str) -> CacheResult<Vec<String>> {
        let data = self.data.read().await;
        let now = Instant::now();
        let mut keys: Vec<String> = data
            .iter()
            .filter(|(key, slot)| slot.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl SetBackend for MemoryBackend {
    async fn add_members(&self, key: &str, members: &[String]) -> CacheResult<()> {
        if members.is_empty() {
            return Ok(());
        }
        let mut data = self.data.write().await;
        let now = Instant::now();
        let slot = data
            .entry(key.to_string())
            .and_modify(|slot| {
                if !slot.is_live(now) {
                    *slot = Slot {
                        data: Data::Set(BTreeSet::new()),
                        expires_at: None,
                    };
                }
            })
            .or_insert_with(|| Slot {
                data: Data::Set(BTreeSet::new()),
                expires_at: None,
            });
        match &mut slot.data {
            Data::Set(set) => {
                set.extend(members.iter().cloned());
                Ok(())
            }
            Data::Value(_) => Err(wrong_type(key)),
        }
    }

    async fn remove_members(&self, key: &str, members: &[String]) -> CacheResult<()> {
        let mut data = self.data.write().await;
        let emptied = match data.get_mut(key) {
            Some(Slot {
                data: Data::Set(set),
                ..
            }) => {
                for member in members {
                    set.remove(member);
                }
                set.is_empty()
            }
            Some(_) => return Err(wrong_type(key)),
            None => false,
        };
        if emptied {
            data.remove(key);
        }
        Ok(())
    }

    async fn members(&self, key: &str) -> CacheResult<Vec<String>> {
        let data = self.data.read().await;
        match data.get(key) {
            Some(slot) if slot.is_live(Instant::now()) => match &slot.data {
                Data::Set(set) => Ok(set.iter().cloned().collect()),
                Data::Value(_) => Err(wrong_type(key)),
            },
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let backend = MemoryBackend::new();
        backend.set("k", "v".to_string(), None).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some("v".to_string()));
        assert!(backend.exists("k").await.unwrap());
        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.delete("k").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let backend = MemoryBackend::new();
        backend
            .set("k", "v".to_string(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(backend.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
        assert!(!backend.exists("k").await.unwrap());
        assert_eq!(backend.len().await, 1);
        assert_eq!(backend.purge_expired().await, 1);
        assert!(backend.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_purge_expired() {
        let backend = MemoryBackend::new();
        backend
            .set("old", "v".to_string(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        for i in 0..PURGE_INTERVAL {
            backend.set("k", i.to_string(), None).await.unwrap();
        }
        assert_eq!(backend.len().await, 1);
        assert_eq!(backend.get("k").await.unwrap(), Some("255".to_string()));
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let backend = MemoryBackend::new();
        backend
            .set("k", "v".to_string(), Some(Duration::ZERO))
            .await
            .unwrap();
        assert!(backend.exists("k").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_if_absent_replaces_expired() {
        let backend = MemoryBackend::new();
        let ttl = Some(Duration::from_secs(1));
        assert!(backend.set_if_absent("k", "a".into(), ttl).await.unwrap());
        assert!(!backend.set_if_absent("k", "b".into(), ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(backend.set_if_absent("k", "c".into(), None).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some("c".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch() {
        let backend = MemoryBackend::new();
        assert!(!backend.touch("missing", None).await.unwrap());

        backend.set("k", "v".into(), None).await.unwrap();
        assert!(backend.touch("k", Some(Duration::from_secs(1))).await.unwrap());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!backend.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_increment() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.increment("c", 5, false, None).await.unwrap(), None);
        assert_eq!(backend.increment("c", 5, true, None).await.unwrap(), Some(5));
        assert_eq!(backend.increment("c", -7, true, None).await.unwrap(), Some(-2));
        assert_eq!(backend.get("c").await.unwrap(), Some("-2".to_string()));

        backend.set("text", "abc".into(), None).await.unwrap();
        assert!(backend.increment("text", 1, true, None).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_increment_keeps_existing_ttl() {
        let backend = MemoryBackend::new();
        backend
            .increment("c", 1, true, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        backend.increment("c", 1, true, None).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(backend.increment("c", 1, false, None).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sets() {
        let backend = MemoryBackend::new();
        let members = vec!["a".to_string(), "b".to_string()];
        backend.add_members("s", &members).await.unwrap();
        backend.add_members("s", &members[..1]).await.unwrap();
        assert_eq!(backend.members("s").await.unwrap(), members);
        assert!(backend.exists("s").await.unwrap());
        assert!(backend.get("s").await.is_err());

        backend.remove_members("s", &members).await.unwrap();
        assert!(!backend.exists("s").await.unwrap());
        assert!(backend.members("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_many_and_keys() {
        let backend = MemoryBackend::new();
        for key in ["app:v:1", "app:v:2", "app:t:x"] {
            backend.set(key, "1".into(), None).await.unwrap();
        }
        assert_eq!(
            backend.keys("app:v:*").await.unwrap(),
            vec!["app:v:1".to_string(), "app:v:2".to_string()]
        );
        let deleted = backend
            .delete_many(&["app:v:1".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(backend.keys("*").await.unwrap().len(), 2);
    }
}
