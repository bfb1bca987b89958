//! Persistent cache boundary
//!
//! In-process memoization survives one evaluation; this module is the gate
//! entries pass through to survive longer. Two rules are enforced here and
//! nowhere else:
//!
//! - Every key is prefixed with the [`EvalInputs`] fingerprint: entries
//!   produced under different evaluation settings never collide.
//! - Only hashes classified [`Portability::Portable`] may be persisted. A
//!   hash that depends on a pointer, a session index, or a raw path is
//!   meaningless in another process and is rejected outright.
//!
//! The backing store is pluggable; [`MemoryStore`] is the in-tree
//! implementation and the reference for on-disk stores.

use dashmap::DashMap;

use rill_core::{ContentHash, EvalInputs, Portability, StructuralHash};

use crate::accessor::AccessorRef;
use crate::serialize::{SerializeError, deserialize_value, serialize_value};
use crate::symbol::SymbolTable;
use crate::value::ValuePtr;

/// Distinguishes the two hash domains inside a persisted key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum KeyKind {
    Structural = 0x01,
    Content = 0x02,
}

/// Error at the persistence boundary.
#[derive(Debug)]
pub enum PersistError {
    /// The producing hash is not portable; persisting it would poison the
    /// cache for other machines or runs.
    NotPortable(Portability),
    /// The value cannot be represented in the wire format.
    Serialize(SerializeError),
}

impl std::fmt::Display for PersistError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistError::NotPortable(p) => {
                write!(f, "refusing to persist non-portable hash ({:?})", p)
            }
            PersistError::Serialize(e) => write!(f, "serialization failed: {}", e),
        }
    }
}

impl std::error::Error for PersistError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistError::Serialize(e) => Some(e),
            PersistError::NotPortable(_) => None,
        }
    }
}

impl From<SerializeError> for PersistError {
    fn from(e: SerializeError) -> Self {
        PersistError::Serialize(e)
    }
}

/// A key-value store the persistent cache writes through to.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&self, key: Vec<u8>, value: Vec<u8>);
}

/// In-memory store, mostly for tests and as the reference implementation.
#[derive(Default)]
pub struct MemoryStore {
    map: DashMap<Vec<u8>, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        self.map.insert(key, value);
    }
}

/// Cross-run cache of forced values, scoped to one eval-inputs fingerprint.
pub struct PersistentCache<S: CacheStore> {
    fingerprint: ContentHash,
    store: S,
}

impl<S: CacheStore> PersistentCache<S> {
    pub fn new(inputs: &EvalInputs, store: S) -> Self {
        PersistentCache {
            fingerprint: inputs.fingerprint(),
            store,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn key(&self, kind: KeyKind, hash_bytes: &[u8]) -> Vec<u8> {
        let mut key = Vec::with_capacity(self.fingerprint.as_bytes().len() + 1 + hash_bytes.len());
        key.extend_from_slice(self.fingerprint.as_bytes());
        key.push(kind as u8);
        key.extend_from_slice(hash_bytes);
        key
    }

    fn check_portable(portability: Portability) -> Result<(), PersistError> {
        if portability.is_portable() {
            Ok(())
        } else {
            Err(PersistError::NotPortable(portability))
        }
    }

    /// Persist a forced value under its content hash.
    pub fn store_value(
        &self,
        hash: &ContentHash,
        portability: Portability,
        value: &ValuePtr,
        symbols: &SymbolTable,
    ) -> Result<(), PersistError> {
        Self::check_portable(portability)?;
        let bytes = serialize_value(value, symbols)?;
        self.store.put(self.key(KeyKind::Content, hash.as_bytes()), bytes);
        Ok(())
    }

    /// Persist a thunk's forced result under the thunk's structural hash.
    pub fn store_thunk_result(
        &self,
        hash: &StructuralHash,
        portability: Portability,
        value: &ValuePtr,
        symbols: &SymbolTable,
    ) -> Result<(), PersistError> {
        Self::check_portable(portability)?;
        let bytes = serialize_value(value, symbols)?;
        self.store
            .put(self.key(KeyKind::Structural, hash.as_bytes()), bytes);
        Ok(())
    }

    pub fn load_value(
        &self,
        hash: &ContentHash,
        symbols: &SymbolTable,
        accessor: Option<&AccessorRef>,
    ) -> Result<Option<ValuePtr>, PersistError> {
        self.load(KeyKind::Content, hash.as_bytes(), symbols, accessor)
    }

    pub fn load_thunk_result(
        &self,
        hash: &StructuralHash,
        symbols: &SymbolTable,
        accessor: Option<&AccessorRef>,
    ) -> Result<Option<ValuePtr>, PersistError> {
        self.load(KeyKind::Structural, hash.as_bytes(), symbols, accessor)
    }

    fn load(
        &self,
        kind: KeyKind,
        hash_bytes: &[u8],
        symbols: &SymbolTable,
        accessor: Option<&AccessorRef>,
    ) -> Result<Option<ValuePtr>, PersistError> {
        match self.store.get(&self.key(kind, hash_bytes)) {
            Some(bytes) => Ok(Some(deserialize_value(&bytes, symbols, accessor)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use crate::value_hash::hash_value_with_portability;

    fn inputs() -> EvalInputs {
        EvalInputs {
            version: "0.4".into(),
            current_system: "x86_64-linux".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_round_trip_through_store() {
        let syms = SymbolTable::new();
        let cache = PersistentCache::new(&inputs(), MemoryStore::new());
        let v = Value::int(42);
        let result = hash_value_with_portability(&v, &syms);
        cache
            .store_value(&result.hash, result.portability, &v, &syms)
            .unwrap();

        let loaded = cache.load_value(&result.hash, &syms, None).unwrap().unwrap();
        assert_eq!(loaded.as_int(), Some(42));
    }

    #[test]
    fn test_non_portable_rejected() {
        let syms = SymbolTable::new();
        let cache = PersistentCache::new(&inputs(), MemoryStore::new());
        let v = Value::int(1);
        let hash = crate::value_hash::hash_value(&v, &syms, None);
        let err = cache
            .store_value(&hash, Portability::NonPortablePointer, &v, &syms)
            .unwrap_err();
        assert!(matches!(err, PersistError::NotPortable(_)));
        assert!(cache.store().is_empty());
    }

    #[test]
    fn test_different_inputs_partition_keys() {
        let syms = SymbolTable::new();
        let store = MemoryStore::new();
        let v = Value::int(7);
        let result = hash_value_with_portability(&v, &syms);

        let cache_a = PersistentCache::new(&inputs(), store);
        cache_a
            .store_value(&result.hash, result.portability, &v, &syms)
            .unwrap();

        let mut other = inputs();
        other.current_system = "aarch64-linux".into();
        // Same backing store, different fingerprint prefix: not visible.
        let cache_b = PersistentCache {
            fingerprint: other.fingerprint(),
            store: cache_a.store,
        };
        assert!(cache_b.load_value(&result.hash, &syms, None).unwrap().is_none());
    }

    #[test]
    fn test_structural_and_content_keys_disjoint() {
        let syms = SymbolTable::new();
        let cache = PersistentCache::new(&inputs(), MemoryStore::new());
        let v = Value::int(3);
        let content = crate::value_hash::hash_value(&v, &syms, None);
        cache
            .store_value(&content, Portability::Portable, &v, &syms)
            .unwrap();

        // A structural hash with identical bytes addresses a different key.
        let structural = StructuralHash(*content.as_bytes());
        assert!(
            cache
                .load_thunk_result(&structural, &syms, None)
                .unwrap()
                .is_none()
        );
    }
}
