use std::fmt;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::CacheError;

/// The canonical identity of a cacheable resource request.
///
/// A [`CacheKey`] is derived from any [`Serialize`]-able descriptor, for example a string like
/// `"user:1"`, a tuple like `("user", 1)`, or a struct holding the resource type and its query
/// parameters. The descriptor is rendered in a canonical JSON form, with object members sorted
/// by name on every level, which is kept around as human-readable [`metadata`](Self::metadata).
/// The metadata is then SHA256-hashed to form the actual identity of the key.
///
/// **NOTE**: Two descriptors with equal structural content always produce equal keys, no matter
/// in which order their fields were declared or inserted.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    descriptor: Arc<Value>,
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metadata)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

/// A key serializes as its canonical descriptor, so encoding a key again yields the same key.
impl Serialize for CacheKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.descriptor.serialize(serializer)
    }
}

impl CacheKey {
    /// Encodes a request descriptor into a [`CacheKey`].
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::InvalidDescriptor`] if the descriptor can not be represented as
    /// plain data, for example a map with composite keys, a non-finite float, or a `Serialize`
    /// impl that fails.
    pub fn from_descriptor<D>(descriptor: &D) -> Result<Self, CacheError>
    where
        D: Serialize + ?Sized,
    {
        let value = serde_json::to_value(descriptor)
            .map_err(|err| CacheError::InvalidDescriptor(err.to_string()))?;
        // JSON turns NaN and infinities into `null`, YAML keeps them as floats.
        let raw = serde_yaml::to_value(descriptor)
            .map_err(|err| CacheError::InvalidDescriptor(err.to_string()))?;
        if !is_finite(&raw) {
            return Err(CacheError::InvalidDescriptor(
                "descriptor contains a non-finite float".into(),
            ));
        }
        let descriptor = canonicalize(value);
        let metadata = descriptor.to_string();
        let hash = Sha256::digest(metadata.as_bytes()).into();

        Ok(CacheKey {
            descriptor: Arc::new(descriptor),
            metadata: metadata.into(),
            hash,
        })
    }

    /// Returns the canonical, human-readable form of the descriptor.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the canonical descriptor this key was built from.
    pub fn descriptor(&self) -> &Value {
        &self.descriptor
    }

    /// Returns the hex-formatted sha-256 hash that identifies this key.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash)
    }
}

/// Checks that `value` contains no NaN or infinite numbers on any level.
fn is_finite(value: &serde_yaml::Value) -> bool {
    use serde_yaml::Value;

    match value {
        Value::Number(number) => !number.is_nan() && !number.is_infinite(),
        Value::Sequence(items) => items.iter().all(is_finite),
        Value::Mapping(map) => map.iter().all(|(k, v)| is_finite(k) && is_finite(v)),
        Value::Tagged(tagged) => is_finite(&tagged.value),
        Value::Null | Value::Bool(_) | Value::String(_) => true,
    }
}

/// Rebuilds all objects in `value` with their members inserted in sorted order.
///
/// Insertion order is the iteration order even if `serde_json/preserve_order` is enabled somewhere
/// in the dependency graph.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut members: Vec<_> = map.into_iter().collect();
            members.sort_by(|(a, _), (b, _)| a.cmp(b));

            let mut sorted = Map::new();
            for (name, member) in members {
                sorted.insert(name, canonicalize(member));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}
