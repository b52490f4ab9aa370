//! Logical key to physical key mapping.
//!
//! Every key sent to a backend has the layout
//!
//! ```text
//! [<namespace>:][<prefix>:]<marker>:<key-or-digest>
//! ```
//!
//! where the marker encodes the [`KeyKind`]. Because the marker precedes
//! the (possibly hashed) logical key, a value and a tag with the same name
//! can never share a physical key, whatever the hash mode.

use crate::config::{CacheConfig, HashMode};
use crate::error::{CacheError, CacheResult};
use sha2::{Digest, Sha256};

/// What a physical key stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyKind {
    /// A cached value.
    Value,
    /// A tag's member set or version stamp.
    Tag,
    /// A lock sentinel.
    Lock,
    /// The set of tags a value was last written with (direct strategy).
    Backref,
}

impl KeyKind {
    fn marker(self) -> &'static str {
        match self {
            KeyKind::Value => "v",
            KeyKind::Tag => "t",
            KeyKind::Lock => "l",
            KeyKind::Backref => "r",
        }
    }
}

/// Turns logical keys into physical backend keys.
#[derive(Debug, Clone)]
pub struct KeyNormalizer {
    scope: String,
    hash_key: HashMode,
    hash_tag: HashMode,
}

impl KeyNormalizer {
    /// Create a normalizer.
    pub fn new(
        namespace: Option<&str>,
        prefix: Option<&str>,
        hash_key: HashMode,
        hash_tag: HashMode,
    ) -> Self {
        let mut scope = String::new();
        for segment in [namespace, prefix].into_iter().flatten() {
            if !segment.is_empty() {
                scope.push_str(segment);
                scope.push(':');
            }
        }
        Self {
            scope,
            hash_key,
            hash_tag,
        }
    }

    /// Create a normalizer from the key settings of a cache configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            config.namespace.as_deref(),
            config.key_prefix.as_deref(),
            config.hash_key,
            config.hash_tag,
        )
    }

    /// Map a logical key of the given kind to its physical key.
    ///
    /// Returns [`CacheError::InvalidKey`] for an empty key.
    pub fn normalize(&self, key: &str, kind: KeyKind) -> CacheResult<String> {
        if key.is_empty() {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        let mode = match kind {
            KeyKind::Tag => self.hash_tag,
            KeyKind::Value | KeyKind::Lock | KeyKind::Backref => self.hash_key,
        };
        Ok(format!(
            "{}{}:{}",
            self.scope,
            kind.marker(),
            hash(key, mode)
        ))
    }

    /// Physical key of a cached value.
    pub fn value(&self, key: &str) -> CacheResult<String> {
        self.normalize(key, KeyKind::Value)
    }

    /// Physical key of a tag.
    pub fn tag(&self, tag: &str) -> CacheResult<String> {
        self.normalize(tag, KeyKind::Tag)
    }

    /// Physical key of a lock sentinel.
    pub fn lock(&self, key: &str) -> CacheResult<String> {
        self.normalize(key, KeyKind::Lock)
    }

    /// Whether a physical key is a value key of this normalizer's scope.
    pub fn is_value_key(&self, physical: &str) -> bool {
        physical
            .strip_prefix(self.scope.as_str())
            .is_some_and(|rest| rest.starts_with("v:"))
    }

    /// Back-reference key belonging to a physical value key.
    ///
    /// Tag sets only hold physical keys, so sweeps use this to find the
    /// back-reference of each member. Returns `None` for keys that are not
    /// value keys of this normalizer's scope.
    pub fn backref_of(&self, physical: &str) -> Option<String> {
        let rest = physical.strip_prefix(self.scope.as_str())?;
        let digest = rest.strip_prefix("v:")?;
        Some(format!("{}{}:{}", self.scope, KeyKind::Backref.marker(), digest))
    }
}

/// Apply a hash mode to a key.
pub fn hash(key: &str, mode: HashMode) -> String {
    match mode {
        HashMode::None => key.to_string(),
        HashMode::Fast => format!("{:032x}", xxhash_rust::xxh3::xxh3_128(key.as_bytes())),
        HashMode::Cryptographic => hex::encode(Sha256::digest(key.as_bytes())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn plain() -> KeyNormalizer {
        KeyNormalizer::new(None, Some("app"), HashMode::None, HashMode::None)
    }

    #[test]
    fn test_value_and_tag_never_collide() {
        for mode in [HashMode::None, HashMode::Fast, HashMode::Cryptographic] {
            let keys = KeyNormalizer::new(None, Some("app"), mode, mode);
            assert_ne!(keys.value("X").unwrap(), keys.tag("X").unwrap());
            assert_ne!(keys.value("X").unwrap(), keys.lock("X").unwrap());
            assert_ne!(keys.tag("X").unwrap(), keys.lock("X").unwrap());
        }
    }

    #[test]
    fn test_marker_defeats_crafted_keys() {
        let keys = plain();
        // A value key that spells out another kind's layout stays distinct.
        assert_ne!(keys.value("t:X").unwrap(), keys.tag("X").unwrap());
    }

    #[test]
    fn test_layout() {
        let keys = KeyNormalizer::new(Some("cache"), Some("app"), HashMode::None, HashMode::None);
        assert_eq!(keys.value("user:1").unwrap(), "cache:app:v:user:1");
        assert_eq!(keys.tag("profile").unwrap(), "cache:app:t:profile");
        assert_eq!(keys.lock("user:1").unwrap(), "cache:app:l:user:1");

        let bare = KeyNormalizer::new(None, None, HashMode::None, HashMode::None);
        assert_eq!(bare.value("k").unwrap(), "v:k");
    }

    #[test]
    fn test_empty_key_is_invalid() {
        assert!(matches!(plain().value(""), Err(CacheError::InvalidKey(_))));
        assert!(matches!(plain().tag(""), Err(CacheError::InvalidKey(_))));
    }

    #[test]
    fn test_hash_modes() {
        assert_eq!(hash("abc", HashMode::None), "abc");
        assert_eq!(hash("abc", HashMode::Fast).len(), 32);
        assert_eq!(
            hash("abc", HashMode::Cryptographic),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_independent_tag_hashing() {
        let keys = KeyNormalizer::new(None, None, HashMode::None, HashMode::Cryptographic);
        assert_eq!(keys.value("foo").unwrap(), "v:foo");
        assert_eq!(keys.tag("foo").unwrap().len(), "t:".len() + 64);
    }

    #[test]
    fn test_backref_of() {
        let keys = KeyNormalizer::new(Some("ns"), Some("app"), HashMode::Fast, HashMode::None);
        let value = keys.value("user:1").unwrap();
        let backref = keys.backref_of(&value).unwrap();
        assert_eq!(backref, keys.normalize("user:1", KeyKind::Backref).unwrap());
        assert!(keys.backref_of("other:v:abc").is_none());
        assert!(keys.backref_of(&keys.tag("user:1").unwrap()).is_none());

        assert!(keys.is_value_key(&value));
        assert!(!keys.is_value_key(&backref));
        assert!(!keys.is_value_key(&keys.lock("user:1").unwrap()));
        assert!(!keys.is_value_key("other:v:abc"));
    }

    proptest! {
        #[test]
        fn prop_distinct_keys_distinct_physical(a in "[a-z0-9:]{1,16}", b in "[a-z0-9:]{1,16}") {
            prop_assume!(a != b);
            for mode in [HashMode::None, HashMode::Fast, HashMode::Cryptographic] {
                let keys = KeyNormalizer::new(None, Some("p"), mode, mode);
                prop_assert_ne!(keys.value(&a).unwrap(), keys.value(&b).unwrap());
            }
        }

        #[test]
        fn prop_kinds_never_alias(a in "[a-z0-9:]{1,16}", b in "[a-z0-9:]{1,16}") {
            let keys = KeyNormalizer::new(None, Some("p"), HashMode::None, HashMode::None);
            prop_assert_ne!(keys.value(&a).unwrap(), keys.tag(&b).unwrap());
            prop_assert_ne!(keys.value(&a).unwrap(), keys.lock(&b).unwrap());
        }

        #[test]
        fn prop_normalize_is_deterministic(a in ".{1,32}") {
            let keys = KeyNormalizer::new(Some("n"), Some("p"), HashMode::Fast, HashMode::Fast);
            prop_assert_eq!(keys.value(&a).unwrap(), keys.value(&a).unwrap());
        }
    }
}
