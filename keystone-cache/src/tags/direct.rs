//! Direct tag index backed by set-capable storage.
//!
//! Each tag is a set of physical value keys. Each tagged entry additionally
//! owns a back-reference set holding the (logical) tags it was last written
//! with, so overwrites and removals can detach the entry from tags it no
//! longer carries. The back-reference set expires together with its entry.

use crate::backend::SetBackend;
use crate::error::{CacheError, CacheResult};
use crate::key::KeyNormalizer;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Tag → members index.
#[derive(Clone)]
pub struct DirectTagIndex {
    backend: Arc<dyn SetBackend>,
    keys: KeyNormalizer,
}

impl DirectTagIndex {
    /// Create an index over a set-capable backend.
    pub fn new(backend: Arc<dyn SetBackend>, keys: KeyNormalizer) -> Self {
        Self { backend, keys }
    }

    fn backref(&self, key: &str) -> CacheResult<String> {
        self.keys
            .backref_of(key)
            .ok_or_else(|| CacheError::InvalidKey(key.to_string()))
    }

    /// Add a physical value key to a tag.
    pub async fn add_member(&self, tag: &str, key: &str) -> CacheResult<()> {
        let tag_key = self.keys.tag(tag)?;
        let backref = self.backref(key)?;
        self.backend.add_members(&tag_key, &[key.to_string()]).await?;
        self.backend.add_members(&backref, &[tag.to_string()]).await
    }

    /// Make `tags` the exact tag set of `key`.
    ///
    /// Tags the key no longer carries drop it from their member sets. The
    /// back-reference set takes the entry's `ttl`.
    pub async fn retag(
        &self,
        key: &str,
        tags: &[String],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let backref = self.backref(key)?;
        let previous: BTreeSet<String> =
            self.backend.members(&backref).await?.into_iter().collect();
        let wanted: BTreeSet<String> = tags.iter().cloned().collect();

        let member = [key.to_string()];
        let stale: Vec<String> = previous.difference(&wanted).cloned().collect();
        for tag in &stale {
            self.backend.remove_members(&self.keys.tag(tag)?, &member).await?;
        }
        for tag in wanted.difference(&previous) {
            self.backend.add_members(&self.keys.tag(tag)?, &member).await?;
        }

        self.backend.remove_members(&backref, &stale).await?;
        let added: Vec<String> = wanted.difference(&previous).cloned().collect();
        self.backend.add_members(&backref, &added).await?;
        self.expire_backref(key, ttl).await
    }

    /// Align the back-reference set's expiry with its entry's.
    pub async fn expire_backref(&self, key: &str, ttl: Option<Duration>) -> CacheResult<()> {
        let backref = self.backref(key)?;
        self.backend.touch(&backref, ttl).await?;
        Ok(())
    }

    /// Detach `key` from every tag and drop its back-reference set.
    pub async fn untag(&self, key: &str) -> CacheResult<()> {
        let backref = self.backref(key)?;
        let member = [key.to_string()];
        for tag in self.backend.members(&backref).await? {
            self.backend.remove_members(&self.keys.tag(&tag)?, &member).await?;
        }
        self.backend.delete(&backref).await?;
        Ok(())
    }

    /// Physical keys currently carrying the tag, `None` when it has none.
    pub async fn members_of(&self, tag: &str) -> CacheResult<Option<BTreeSet<String>>> {
        let tag_key = self.keys.tag(tag)?;
        let members: BTreeSet<String> =
            self.backend.members(&tag_key).await?.into_iter().collect();
        Ok((!members.is_empty()).then_some(members))
    }

    /// Delete every entry carrying the tag, then the tag itself.
    ///
    /// Returns `false` when the tag has no members.
    pub async fn remove_tag(&self, tag: &str) -> CacheResult<bool> {
        self.remove_entries_by_tags(&[tag.to_string()]).await
    }

    /// Delete every entry carrying any of the tags, then the tags.
    ///
    /// Returns `false` when none of the tags had members.
    pub async fn remove_entries_by_tags(&self, tags: &[String]) -> CacheResult<bool> {
        let swept: BTreeSet<&str> = tags.iter().map(String::as_str).collect();
        let mut tag_keys = Vec::with_capacity(tags.len());
        let mut members = BTreeSet::new();
        for tag in &swept {
            let tag_key = self.keys.tag(tag)?;
            members.extend(self.backend.members(&tag_key).await?);
            tag_keys.push(tag_key);
        }

        if members.is_empty() {
            debug!("No members to sweep for tags {:?}", tags);
            return Ok(false);
        }

        let mut doomed = Vec::with_capacity(members.len() * 2 + tag_keys.len());
        for member in &members {
            let Some(backref) = self.keys.backref_of(member) else {
                doomed.push(member.clone());
                continue;
            };
            // Detach from tags outside this sweep so they never point at a
            // key that may later be rewritten without them.
            let single = [member.clone()];
            for other in self.backend.members(&backref).await? {
                if !swept.contains(other.as_str()) {
                    self.backend.remove_members(&self.keys.tag(&other)?, &single).await?;
                }
            }
            doomed.push(member.clone());
            doomed.push(backref);
        }
        doomed.extend(tag_keys);

        let deleted = self.backend.delete_many(&doomed).await?;
        info!(
            "Removed tags {:?}: {} entries swept ({} keys deleted)",
            tags,
            members.len(),
            deleted
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CacheBackend, MemoryBackend};
    use crate::config::HashMode;

    fn index() -> (Arc<MemoryBackend>, DirectTagIndex, KeyNormalizer) {
        let backend = Arc::new(MemoryBackend::new());
        let keys = KeyNormalizer::new(None, Some("test"), HashMode::None, HashMode::None);
        let index = DirectTagIndex::new(backend.clone(), keys.clone());
        (backend, index, keys)
    }

    fn tags(names: &[&str]) -> Vec<String> {
        names.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test]
    async fn test_add_member_is_idempotent() {
        let (_, index, keys) = index();
        let key = keys.value("user:1").unwrap();

        index.add_member("users", &key).await.unwrap();
        index.add_member("users", &key).await.unwrap();

        let members = index.members_of("users").await.unwrap().unwrap();
        assert_eq!(members.len(), 1);
        assert!(members.contains(&key));
    }

    #[tokio::test]
    async fn test_remove_tag_sweeps_members() {
        let (backend, index, keys) = index();
        let one = keys.value("user:1").unwrap();
        let two = keys.value("user:2").unwrap();
        backend.set(&one, "Alice".into(), None).await.unwrap();
        backend.set(&two, "Bob".into(), None).await.unwrap();
        index.retag(&one, &tags(&["users", "active"]), None).await.unwrap();
        index.retag(&two, &tags(&["users"]), None).await.unwrap();

        assert!(index.remove_tag("users").await.unwrap());

        assert!(!backend.exists(&one).await.unwrap());
        assert!(!backend.exists(&two).await.unwrap());
        assert!(index.members_of("users").await.unwrap().is_none());
        // The other tag no longer references the swept entry.
        assert!(index.members_of("active").await.unwrap().is_none());
        assert!(!index.remove_tag("users").await.unwrap());
    }

    #[tokio::test]
    async fn test_retag_detaches_old_tags() {
        let (backend, index, keys) = index();
        let key = keys.value("k").unwrap();
        backend.set(&key, "v1".into(), None).await.unwrap();
        index.retag(&key, &tags(&["a", "b"]), None).await.unwrap();

        backend.set(&key, "v2".into(), None).await.unwrap();
        index.retag(&key, &tags(&["b", "c"]), None).await.unwrap();

        assert!(index.members_of("a").await.unwrap().is_none());
        assert!(index.members_of("b").await.unwrap().unwrap().contains(&key));
        assert!(index.members_of("c").await.unwrap().unwrap().contains(&key));

        // Removing the dropped tag leaves the entry alone.
        assert!(!index.remove_tag("a").await.unwrap());
        assert!(backend.exists(&key).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backref_expires_with_entry() {
        let (backend, index, keys) = index();
        let key = keys.value("k").unwrap();
        let ttl = Some(Duration::from_secs(1));
        backend.set(&key, "v".into(), ttl).await.unwrap();
        index.retag(&key, &tags(&["a"]), ttl).await.unwrap();

        let backref = keys.backref_of(&key).unwrap();
        assert!(backend.exists(&backref).await.unwrap());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!backend.exists(&key).await.unwrap());
        assert!(!backend.exists(&backref).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retag_without_ttl_persists_backref() {
        let (backend, index, keys) = index();
        let key = keys.value("k").unwrap();
        index.retag(&key, &tags(&["a"]), Some(Duration::from_secs(1))).await.unwrap();
        index.retag(&key, &tags(&["a"]), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let backref = keys.backref_of(&key).unwrap();
        assert!(backend.exists(&backref).await.unwrap());
    }

    #[tokio::test]
    async fn test_untag() {
        let (backend, index, keys) = index();
        let key = keys.value("k").unwrap();
        index.retag(&key, &tags(&["a"]), None).await.unwrap();

        index.untag(&key).await.unwrap();

        assert!(index.members_of("a").await.unwrap().is_none());
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_entries_by_tags_unions_members() {
        let (backend, index, keys) = index();
        let a = keys.value("a").unwrap();
        let b = keys.value("b").unwrap();
        let c = keys.value("c").unwrap();
        for key in [&a, &b, &c] {
            backend.set(key, "x".into(), None).await.unwrap();
        }
        index.retag(&a, &tags(&["t1"]), None).await.unwrap();
        index.retag(&b, &tags(&["t2"]), None).await.unwrap();
        index.retag(&c, &tags(&["t3"]), None).await.unwrap();

        assert!(index.remove_entries_by_tags(&tags(&["t1", "t2", "missing"])).await.unwrap());

        assert!(!backend.exists(&a).await.unwrap());
        assert!(!backend.exists(&b).await.unwrap());
        assert!(backend.exists(&c).await.unwrap());
        assert!(!index.remove_entries_by_tags(&tags(&["t1", "t2"])).await.unwrap());
    }
}
