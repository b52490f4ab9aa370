//! Value encoding and the tri-state lookup result.

use crate::config::SerializerKind;
use crate::error::{CacheError, CacheResult};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

/// Result of reading a key.
///
/// A stored `null` is a hit, not a miss: `Null` and `Missing` are kept apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    /// The key holds a value.
    Found(T),
    /// The key holds an explicit null.
    Null,
    /// The key is absent, expired or invalidated.
    Missing,
}

impl<T> Lookup<T> {
    /// Whether the key was present (including a stored null).
    pub fn is_hit(&self) -> bool {
        !matches!(self, Lookup::Missing)
    }

    /// Whether the key was absent.
    pub fn is_missing(&self) -> bool {
        matches!(self, Lookup::Missing)
    }

    /// The value, if one was stored.
    pub fn value(self) -> Option<T> {
        match self {
            Lookup::Found(value) => Some(value),
            Lookup::Null | Lookup::Missing => None,
        }
    }

    /// Map the found value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Lookup<U> {
        match self {
            Lookup::Found(value) => Lookup::Found(f(value)),
            Lookup::Null => Lookup::Null,
            Lookup::Missing => Lookup::Missing,
        }
    }
}

/// Encodes values into backend payloads and back.
///
/// Both serializers write a null as the empty payload, so an empty payload
/// always reads back as [`Lookup::Null`]. The native serializer stores
/// non-empty strings that are not themselves valid JSON verbatim, which
/// keeps plain text readable in the backend and lets integer payloads be
/// shared with the backend's own counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct Codec {
    kind: SerializerKind,
}

impl Codec {
    /// Create a codec.
    pub fn new(kind: SerializerKind) -> Self {
        Self { kind }
    }

    /// The configured serializer.
    pub fn kind(&self) -> SerializerKind {
        self.kind
    }

    /// Encode a value.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> CacheResult<String> {
        let value =
            serde_json::to_value(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        match value {
            Value::Null => Ok(String::new()),
            Value::String(s)
                if self.kind == SerializerKind::Native
                    && !s.is_empty()
                    && serde_json::from_str::<Value>(&s).is_err() =>
            {
                Ok(s)
            }
            other => {
                serde_json::to_string(&other).map_err(|e| CacheError::Serialization(e.to_string()))
            }
        }
    }

    /// Decode a payload read from the backend.
    pub fn decode<T: DeserializeOwned>(&self, raw: &str) -> CacheResult<Lookup<T>> {
        if raw.is_empty() {
            return Ok(Lookup::Null);
        }
        match serde_json::from_str::<T>(raw) {
            Ok(value) => Ok(Lookup::Found(value)),
            Err(err) if self.kind == SerializerKind::Native => {
                serde_json::from_value(Value::String(raw.to_string()))
                    .map(Lookup::Found)
                    .map_err(|_| CacheError::Deserialization(err.to_string()))
            }
            Err(err) => Err(CacheError::Deserialization(err.to_string())),
        }
    }
}
