//! Versioned tag index for flat key/value backends.
//!
//! Every tag owns a version stamp stored at its tag key. Entries written with
//! tags carry the stamps they were written against; on read an entry is
//! valid only while every recorded stamp is still current. Removing a tag
//! just advances its stamp.

use crate::backend::CacheBackend;
use crate::error::CacheResult;
use crate::key::KeyNormalizer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, info, warn};

static LAST_VERSION: AtomicI64 = AtomicI64::new(0);

/// A tag version: wall-clock nanoseconds, strictly increasing per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagVersion(i64);

impl TagVersion {
    /// Mint a version newer than any minted before in this process.
    pub fn mint() -> Self {
        Self::next_above(i64::MIN)
    }

    /// Mint a version strictly greater than `previous`.
    ///
    /// Clocks of different processes may disagree; this keeps a removal
    /// effective even when the stored stamp came from a clock running ahead.
    pub fn mint_after(previous: TagVersion) -> Self {
        Self::next_above(previous.0)
    }

    fn next_above(floor: i64) -> Self {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut last = LAST_VERSION.load(Ordering::Relaxed);
        loop {
            let next = now
                .max(last.saturating_add(1))
                .max(floor.saturating_add(1));
            match LAST_VERSION.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return TagVersion(next),
                Err(actual) => last = actual,
            }
        }
    }

    /// Parse a stored stamp.
    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse().ok().map(TagVersion)
    }

    /// The raw stamp.
    pub fn as_i64(self) -> i64 {
        self.0
    }
}

impl From<i64> for TagVersion {
    fn from(value: i64) -> Self {
        TagVersion(value)
    }
}

impl fmt::Display for TagVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stored form of a tagged entry.
///
/// `tags` maps physical tag keys to the versions current at write time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VersionedEntry {
    /// Encoded payload.
    pub value: String,
    /// Recorded tag versions.
    pub tags: BTreeMap<String, TagVersion>,
}

impl VersionedEntry {
    /// Wrap an encoded payload.
    pub fn new(value: String, tags: BTreeMap<String, TagVersion>) -> Self {
        Self { value, tags }
    }

    /// Serialize for storage.
    pub fn encode(&self) -> CacheResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Read a stored payload.
    ///
    /// Payloads that are not envelopes (bare counters) come back as entries
    /// without tags.
    pub fn decode(raw: String) -> Self {
        match serde_json::from_str::<VersionedEntry>(&raw) {
            Ok(entry) => entry,
            Err(_) => Self::new(raw, BTreeMap::new()),
        }
    }
}

/// Tag → version index.
#[derive(Clone)]
pub struct VersionedTagIndex {
    backend: Arc<dyn CacheBackend>,
    keys: KeyNormalizer,
}

impl VersionedTagIndex {
    /// Create an index over any backend.
    pub fn new(backend: Arc<dyn CacheBackend>, keys: KeyNormalizer) -> Self {
        Self { backend, keys }
    }

    /// Current versions of `tags`, minting stamps for tags that have none.
    ///
    /// Stamping a still-current tag again yields the same version.
    pub async fn stamp_tags(&self, tags: &[String]) -> CacheResult<BTreeMap<String, TagVersion>> {
        let mut stamped = BTreeMap::new();
        for tag in tags {
            let tag_key = self.keys.tag(tag)?;
            let version = self.stamp(&tag_key).await?;
            stamped.insert(tag_key, version);
        }
        Ok(stamped)
    }

    async fn stamp(&self, tag_key: &str) -> CacheResult<TagVersion> {
        if let Some(raw) = self.backend.get(tag_key).await? {
            if let Some(version) = TagVersion::parse(&raw) {
                return Ok(version);
            }
            warn!("Replacing malformed version {:?} at {}", raw, tag_key);
            let version = TagVersion::mint();
            self.backend.set(tag_key, version.to_string(), None).await?;
            return Ok(version);
        }

        let minted = TagVersion::mint();
        if self
            .backend
            .set_if_absent(tag_key, minted.to_string(), None)
            .await?
        {
            debug!("Minted version {} for {}", minted, tag_key);
            return Ok(minted);
        }

        // Another writer minted first; its stamp wins.
        match self
            .backend
            .get(tag_key)
            .await?
            .as_deref()
            .and_then(TagVersion::parse)
        {
            Some(version) => Ok(version),
            None => {
                self.backend.set(tag_key, minted.to_string(), None).await?;
                Ok(minted)
            }
        }
    }

    /// Check the recorded versions of the entry at `key`.
    ///
    /// A stamp that is missing, unreadable or newer than recorded makes the
    /// entry stale: it is deleted and `false` is returned.
    pub async fn validate(
        &self,
        key: &str,
        recorded: &BTreeMap<String, TagVersion>,
    ) -> CacheResult<bool> {
        if recorded.is_empty() {
            return Ok(true);
        }

        let tag_keys: Vec<String> = recorded.keys().cloned().collect();
        let current = self.backend.get_many(&tag_keys).await?;

        for ((tag_key, version), current) in recorded.iter().zip(current) {
            let fresh = current
                .as_deref()
                .and_then(TagVersion::parse)
                .is_some_and(|current| current <= *version);
            if !fresh {
                warn!("Discarding stale entry {} (tag {} changed)", key, tag_key);
                self.backend.delete(key).await?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Invalidate every entry stamped with the tag.
    ///
    /// Returns `false` when the tag has never been stamped.
    pub async fn remove_tag(&self, tag: &str) -> CacheResult<bool> {
        let tag_key = self.keys.tag(tag)?;
        let Some(raw) = self.backend.get(&tag_key).await? else {
            return Ok(false);
        };

        let next = match TagVersion::parse(&raw) {
            Some(current) => TagVersion::mint_after(current),
            None => TagVersion::mint(),
        };
        self.backend.set(&tag_key, next.to_string(), None).await?;
        info!("Advanced tag {} to version {}", tag, next);
        Ok(true)
    }

    /// The tag's current version.
    pub async fn current_version(&self, tag: &str) -> CacheResult<Option<TagVersion>> {
        let tag_key = self.keys.tag(tag)?;
        Ok(self
            .backend
            .get(&tag_key)
            .await?
            .as_deref()
            .and_then(TagVersion::parse))
    }
}
