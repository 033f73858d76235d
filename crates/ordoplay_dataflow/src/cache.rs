// SPDX-License-Identifier: MIT OR Apache-2.0
//! Evaluation cache.
//!
//! Each output of a graph owns one cache slot, addressed by a [`CacheKey`]
//! derived from the owning node GUID and the output key. A slot either holds
//! a typed value stamped with the producing node's GUID, value hash and
//! timestamp, or a reference to another slot used for zero-copy passthrough.

use crate::connection::OutputKey;
use crate::node::NodeId;
use crate::timestamp::Timestamp;
use crate::types::{DataType, DataflowValue};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// References deeper than this are treated as broken (and most likely cyclic)
const MAX_REFERENCE_DEPTH: usize = 64;

/// Address of a cache slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(pub u64);

impl CacheKey {
    /// Key of the slot written by `output` of `node`
    pub fn for_output(node: NodeId, output: OutputKey) -> Self {
        let bits = node.0.as_u128();
        #[allow(clippy::cast_possible_truncation)]
        let (high, low) = ((bits >> 64) as u64, bits as u64);
        let mut hash = 0xcbf2_9ce4_8422_2325_u64;
        for word in [high, low, u64::from(output.0)] {
            hash ^= word;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
            hash ^= hash >> 29;
        }
        Self(hash)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Type-erased shared value
#[derive(Clone)]
pub struct CachedValue {
    data: Arc<dyn Any + Send + Sync>,
    data_type: DataType,
}

impl CachedValue {
    /// Wrap a value
    pub fn new<T: DataflowValue>(value: T) -> Self {
        Self {
            data: Arc::new(value),
            data_type: T::data_type(),
        }
    }

    /// Wrap an already shared value
    pub fn from_shared(data: Arc<dyn Any + Send + Sync>, data_type: DataType) -> Self {
        Self { data, data_type }
    }

    /// Data type of the stored value
    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    /// Borrow the stored value
    pub fn as_any(&self) -> &(dyn Any + Send + Sync) {
        self.data.as_ref()
    }

    /// Read as `T`, converting where [`DataflowValue::from_cached`] allows
    pub fn get<T: DataflowValue>(&self) -> Option<T> {
        T::from_cached(self.as_any())
    }
}

impl fmt::Debug for CachedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedValue")
            .field("data_type", &self.data_type)
            .finish_non_exhaustive()
    }
}

/// A typed cache entry and the fingerprint of the node that produced it
#[derive(Debug, Clone)]
pub struct TypedCacheElement {
    /// Stored value
    pub value: CachedValue,
    /// Producing node
    pub node_guid: NodeId,
    /// Producing node's value hash at write time
    pub node_hash: u64,
    /// Write time
    pub timestamp: Timestamp,
}

/// One cache slot
#[derive(Debug, Clone)]
pub enum CacheElement {
    /// A computed value
    Typed(TypedCacheElement),
    /// Alias of another slot
    Reference {
        /// Slot read through this alias
        key: CacheKey,
        /// Time the alias was installed
        timestamp: Timestamp,
    },
}

impl CacheElement {
    /// Build a typed element
    pub fn typed(value: CachedValue, node_guid: NodeId, node_hash: u64, timestamp: Timestamp) -> Self {
        Self::Typed(TypedCacheElement {
            value,
            node_guid,
            node_hash,
            timestamp,
        })
    }

    /// Build a reference element
    pub fn reference(key: CacheKey, timestamp: Timestamp) -> Self {
        Self::Reference { key, timestamp }
    }

    /// The element's own write time
    pub fn timestamp(&self) -> Timestamp {
        match self {
            Self::Typed(typed) => typed.timestamp,
            Self::Reference { timestamp, .. } => *timestamp,
        }
    }

    /// Whether this is an alias
    pub fn is_reference(&self) -> bool {
        matches!(self, Self::Reference { .. })
    }
}

/// Errors from cache persistence
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Payload or entry list failed to (de)serialize
    #[error("Cache serialization failed: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Result type for cache persistence
pub type Result<T> = std::result::Result<T, CacheError>;

type SaveFn = fn(&(dyn Any + Send + Sync)) -> Option<Result<Vec<u8>>>;
type LoadFn = fn(&[u8]) -> Result<Arc<dyn Any + Send + Sync>>;

struct CacheSerializer {
    data_type: DataType,
    save: SaveFn,
    load: LoadFn,
}

fn save_value<T: DataflowValue + Serialize>(value: &(dyn Any + Send + Sync)) -> Option<Result<Vec<u8>>> {
    let typed = value.downcast_ref::<T>()?;
    Some(bincode::serialize(typed).map_err(CacheError::from))
}

fn load_value<T: DataflowValue + DeserializeOwned>(bytes: &[u8]) -> Result<Arc<dyn Any + Send + Sync>> {
    let value: T = bincode::deserialize(bytes)?;
    Ok(Arc::new(value))
}

/// Per-type serializers for persisting cache entries.
///
/// Entries whose type has no serializer are skipped on save and are simply
/// absent after a load.
#[derive(Default)]
pub struct CacheSerializerRegistry {
    serializers: IndexMap<String, CacheSerializer>,
}

impl CacheSerializerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with serializers for every built-in value type
    pub fn with_builtin_types() -> Self {
        let mut registry = Self::new();
        registry.register::<bool>();
        registry.register::<f64>();
        registry.register::<f32>();
        registry.register::<i64>();
        registry.register::<u64>();
        registry.register::<i32>();
        registry.register::<u32>();
        registry.register::<i16>();
        registry.register::<u16>();
        registry.register::<i8>();
        registry.register::<u8>();
        registry.register::<String>();
        registry.register::<crate::types::Name>();
        registry
    }

    /// Register `T`, keyed by its data type name
    pub fn register<T: DataflowValue + Serialize + DeserializeOwned>(&mut self) {
        let data_type = T::data_type();
        self.serializers.insert(
            data_type.name().into_owned(),
            CacheSerializer {
                data_type,
                save: save_value::<T>,
                load: load_value::<T>,
            },
        );
    }

    /// Whether a serializer exists for `type_name`
    pub fn contains(&self, type_name: &str) -> bool {
        self.serializers.contains_key(type_name)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    type_name: String,
    key: CacheKey,
    node_guid: NodeId,
    node_hash: u64,
    timestamp: Timestamp,
    payload: Vec<u8>,
}

/// Mapping from cache keys to elements
#[derive(Debug, Clone, Default)]
pub struct ContextCache {
    entries: IndexMap<CacheKey, CacheElement>,
}

impl ContextCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw element, without following references
    pub fn get(&self, key: CacheKey) -> Option<&CacheElement> {
        self.entries.get(&key)
    }

    /// Insert or replace an element
    pub fn insert(&mut self, key: CacheKey, element: CacheElement) {
        self.entries.insert(key, element);
    }

    /// Remove an element
    pub fn remove(&mut self, key: CacheKey) -> Option<CacheElement> {
        self.entries.shift_remove(&key)
    }

    /// Follow references until a typed element is reached
    pub fn resolve(&self, key: CacheKey) -> Option<&TypedCacheElement> {
        let mut current = key;
        for _ in 0..MAX_REFERENCE_DEPTH {
            match self.entries.get(&current)? {
                CacheElement::Typed(typed) => return Some(typed),
                CacheElement::Reference { key, .. } => current = *key,
            }
        }
        tracing::warn!(key = %key, "Cache reference chain too deep; treating as missing");
        None
    }

    /// Whether `key` holds data written at or after `required`.
    ///
    /// A reference is judged by its own timestamp but must still resolve.
    pub fn has_data(&self, key: CacheKey, required: Timestamp) -> bool {
        match self.entries.get(&key) {
            Some(element) => element.timestamp() >= required && self.resolve(key).is_some(),
            None => false,
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every slot
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Move every entry of `other` into this cache, replacing existing slots
    pub fn merge(&mut self, other: ContextCache) -> usize {
        let count = other.entries.len();
        self.entries.extend(other.entries);
        count
    }

    /// Keep only typed entries whose producer fingerprint passes `keep`.
    /// Returns the number of removed entries.
    pub fn retain_matching(&mut self, mut keep: impl FnMut(NodeId, u64) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, element| match element {
            CacheElement::Typed(typed) => keep(typed.node_guid, typed.node_hash),
            CacheElement::Reference { .. } => true,
        });
        before - self.entries.len()
    }

    /// Serialize every typed entry with a registered serializer
    pub fn save(&self, serializers: &CacheSerializerRegistry) -> Result<Vec<u8>> {
        let mut persisted = Vec::new();
        for (key, element) in &self.entries {
            let CacheElement::Typed(typed) = element else {
                continue;
            };
            let type_name = typed.value.data_type().name().into_owned();
            let Some(serializer) = serializers.serializers.get(&type_name) else {
                tracing::debug!(key = %key, type_name = %type_name, "No cache serializer; entry not persisted");
                continue;
            };
            let Some(payload) = (serializer.save)(typed.value.as_any()) else {
                tracing::warn!(key = %key, type_name = %type_name, "Cached value does not match its declared type");
                continue;
            };
            persisted.push(PersistedEntry {
                type_name,
                key: *key,
                node_guid: typed.node_guid,
                node_hash: typed.node_hash,
                timestamp: typed.timestamp,
                payload: payload?,
            });
        }
        tracing::debug!(entries = persisted.len(), total = self.entries.len(), "Saved context cache");
        Ok(bincode::serialize(&persisted)?)
    }

    /// Restore entries written by [`ContextCache::save`].
    ///
    /// Entries whose type is not registered are skipped. The logical clock is
    /// moved past every restored timestamp.
    pub fn load(bytes: &[u8], serializers: &CacheSerializerRegistry) -> Result<Self> {
        let persisted: Vec<PersistedEntry> = bincode::deserialize(bytes)?;
        let mut cache = Self::new();
        for entry in persisted {
            let Some(serializer) = serializers.serializers.get(&entry.type_name) else {
                tracing::warn!(type_name = %entry.type_name, "Skipping cache entry of unregistered type");
                continue;
            };
            let data = (serializer.load)(&entry.payload)?;
            Timestamp::observe(entry.timestamp);
            cache.insert(
                entry.key,
                CacheElement::typed(
                    CachedValue::from_shared(data, serializer.data_type.clone()),
                    entry.node_guid,
                    entry.node_hash,
                    entry.timestamp,
                ),
            );
        }
        Ok(cache)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed<T: DataflowValue>(value: T, timestamp: u64) -> CacheElement {
        CacheElement::typed(CachedValue::new(value), NodeId::new(), 7, Timestamp(timestamp))
    }

    #[test]
    fn test_cache_key_is_stable_per_output() {
        let node = NodeId::new();
        assert_eq!(CacheKey::for_output(node, OutputKey(1)), CacheKey::for_output(node, OutputKey(1)));
        assert_ne!(CacheKey::for_output(node, OutputKey(1)), CacheKey::for_output(node, OutputKey(2)));
    }

    #[test]
    fn test_reference_resolves_transitively() {
        let mut cache = ContextCache::new();
        let (a, b, c) = (CacheKey(1), CacheKey(2), CacheKey(3));
        cache.insert(a, CacheElement::reference(b, Timestamp(5)));
        cache.insert(b, CacheElement::reference(c, Timestamp(5)));
        assert!(cache.resolve(a).is_none());
        assert!(!cache.has_data(a, Timestamp::INVALID));

        cache.insert(c, typed(4.5_f64, 5));
        assert_eq!(cache.resolve(a).and_then(|t| t.value.get::<f64>()), Some(4.5));
        assert!(cache.has_data(a, Timestamp(5)));
        assert!(!cache.has_data(a, Timestamp(6)));
    }

    #[test]
    fn test_reference_cycle_is_missing() {
        let mut cache = ContextCache::new();
        cache.insert(CacheKey(1), CacheElement::reference(CacheKey(2), Timestamp(1)));
        cache.insert(CacheKey(2), CacheElement::reference(CacheKey(1), Timestamp(1)));
        assert!(cache.resolve(CacheKey(1)).is_none());
    }

    #[test]
    fn test_save_load_skips_references_and_unregistered_types() {
        #[derive(Clone)]
        struct Opaque;
        impl DataflowValue for Opaque {
            fn data_type() -> DataType {
                DataType::Custom("Opaque".into())
            }
        }

        let mut cache = ContextCache::new();
        cache.insert(CacheKey(1), typed(3.0_f64, 10));
        cache.insert(CacheKey(2), typed(String::from("hello"), 11));
        cache.insert(CacheKey(3), CacheElement::reference(CacheKey(1), Timestamp(12)));
        cache.insert(CacheKey(4), typed(Opaque, 13));

        let registry = CacheSerializerRegistry::with_builtin_types();
        let bytes = cache.save(&registry).unwrap();
        let restored = ContextCache::load(&bytes, &registry).unwrap();

        assert_eq!(restored.len(), 2);
        assert_eq!(restored.resolve(CacheKey(1)).and_then(|t| t.value.get::<f64>()), Some(3.0));
        assert_eq!(
            restored.resolve(CacheKey(2)).and_then(|t| t.value.get::<String>()).as_deref(),
            Some("hello")
        );
        assert!(restored.get(CacheKey(3)).is_none());
        assert_eq!(restored.get(CacheKey(1)).map(CacheElement::timestamp), Some(Timestamp(10)));
        assert!(Timestamp::now() > Timestamp(11));
    }

    #[test]
    fn test_load_without_serializer_drops_entry() {
        let mut cache = ContextCache::new();
        cache.insert(CacheKey(1), typed(1_u8, 1));
        let bytes = cache.save(&CacheSerializerRegistry::with_builtin_types()).unwrap();
        let restored = ContextCache::load(&bytes, &CacheSerializerRegistry::new()).unwrap();
        assert!(restored.is_empty());
    }

    #[test]
    fn test_retain_matching() {
        let node = NodeId::new();
        let mut cache = ContextCache::new();
        cache.insert(CacheKey(1), CacheElement::typed(CachedValue::new(1.0_f64), node, 1, Timestamp(1)));
        cache.insert(CacheKey(2), CacheElement::typed(CachedValue::new(2.0_f64), node, 2, Timestamp(1)));
        let removed = cache.retain_matching(|guid, hash| guid == node && hash == 2);
        assert_eq!(removed, 1);
        assert!(cache.get(CacheKey(2)).is_some());
    }
}
