//! Tag-based invalidation strategies.
//!
//! Backends with enumerable sets keep an explicit tag → members index
//! ([`DirectTagIndex`]); flat backends keep one version stamp per tag and
//! check entries lazily on read ([`VersionedTagIndex`]).

use crate::error::CacheResult;
use std::collections::BTreeSet;

pub mod direct;
pub mod versioned;

pub use direct::DirectTagIndex;
pub use versioned::{TagVersion, VersionedEntry, VersionedTagIndex};

/// What a tag currently holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagState {
    /// Physical keys of the entries carrying the tag.
    Members(BTreeSet<String>),
    /// The tag's current version stamp.
    Version(TagVersion),
}

/// The strategy a cache was built with.
#[derive(Clone)]
pub enum TagIndex {
    /// Explicit membership sets.
    Direct(DirectTagIndex),
    /// Version stamps.
    Versioned(VersionedTagIndex),
}

impl TagIndex {
    /// Current state of a tag, `None` when the tag does not exist.
    pub async fn state(&self, tag: &str) -> CacheResult<Option<TagState>> {
        match self {
            TagIndex::Direct(index) => Ok(index.members_of(tag).await?.map(TagState::Members)),
            TagIndex::Versioned(index) => {
                Ok(index.current_version(tag).await?.map(TagState::Version))
            }
        }
    }

    /// Invalidate every entry carrying the tag.
    ///
    /// Returns `false` when the tag does not exist.
    pub async fn remove_tag(&self, tag: &str) -> CacheResult<bool> {
        match self {
            TagIndex::Direct(index) => index.remove_tag(tag).await,
            TagIndex::Versioned(index) => index.remove_tag(tag).await,
        }
    }

    /// Invalidate every entry carrying any of the tags.
    ///
    /// Returns `false` when none of the tags existed.
    pub async fn remove_tags(&self, tags: &[String]) -> CacheResult<bool> {
        match self {
            TagIndex::Direct(index) => index.remove_entries_by_tags(tags).await,
            TagIndex::Versioned(index) => {
                let mut removed = false;
                for tag in tags {
                    removed |= index.remove_tag(tag).await?;
                }
                Ok(removed)
            }
        }
    }

    /// Whether this is the direct strategy.
    pub fn is_direct(&self) -> bool {
        matches!(self, TagIndex::Direct(_))
    }
}
