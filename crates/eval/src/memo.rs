//! The thunk memoization cache
//!
//! A sharded concurrent map from thunk identity to forced result. The
//! cache is hit-heavy and shared by every evaluator thread, so it uses a
//! sharded-lock map rather than one global lock: lookups only contend
//! within a shard.
//!
//! Entries carry the GC cycle in which they were inserted. After a cycle
//! advance, cell identities may have been recycled, so older entries are
//! logically invalid; lookups skip them (a "stale hit") and the next
//! insert for the key overwrites them.

use dashmap::DashMap;

use rill_core::StructuralHash;

use crate::value::ValuePtr;

/// One cached forcing result.
#[derive(Debug, Clone)]
pub struct MemoEntry {
    /// A dedicated cell holding the forced value; never a live evaluation
    /// cell (those can be re-thunked or recycled).
    pub value: ValuePtr,
    /// GC cycle at insert time. A lookup only counts as a hit when this
    /// matches the current cycle.
    pub gc_cycle: u64,
}

/// Concurrent map from thunk structural hash to cached result.
#[derive(Default)]
pub struct ThunkMemoCache {
    map: DashMap<StructuralHash, MemoEntry>,
}

impl ThunkMemoCache {
    pub fn new() -> Self {
        ThunkMemoCache::default()
    }

    /// Visit the entry for `hash`, if any, under the shard's shared lock.
    /// Returns whatever the visitor produces.
    pub fn visit<R>(&self, hash: &StructuralHash, f: impl FnOnce(&MemoEntry) -> R) -> Option<R> {
        self.map.get(hash).map(|entry| f(entry.value()))
    }

    /// Insert or overwrite the entry for `hash`. Overwriting is what
    /// retires stale entries from earlier GC cycles.
    pub fn insert_or_assign(&self, hash: StructuralHash, entry: MemoEntry) {
        self.map.insert(hash, entry);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&self) {
        self.map.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn key(n: u8) -> StructuralHash {
        StructuralHash::from_bytes(&[n])
    }

    #[test]
    fn test_visit_finds_inserted_entry() {
        let cache = ThunkMemoCache::new();
        cache.insert_or_assign(
            key(1),
            MemoEntry {
                value: Value::int(42),
                gc_cycle: 0,
            },
        );
        let seen = cache.visit(&key(1), |entry| entry.value.as_int());
        assert_eq!(seen, Some(Some(42)));
        assert!(cache.visit(&key(2), |_| ()).is_none());
    }

    #[test]
    fn test_insert_or_assign_overwrites() {
        let cache = ThunkMemoCache::new();
        cache.insert_or_assign(
            key(1),
            MemoEntry {
                value: Value::int(1),
                gc_cycle: 0,
            },
        );
        cache.insert_or_assign(
            key(1),
            MemoEntry {
                value: Value::int(2),
                gc_cycle: 1,
            },
        );
        assert_eq!(cache.len(), 1);
        let cycle = cache.visit(&key(1), |entry| entry.gc_cycle);
        assert_eq!(cycle, Some(1));
    }

    #[test]
    fn test_concurrent_inserts_are_idempotent() {
        use std::sync::Arc;
        let cache = Arc::new(ThunkMemoCache::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for i in 0..100u8 {
                        cache.insert_or_assign(
                            key(i),
                            MemoEntry {
                                value: Value::int(i64::from(i)),
                                gc_cycle: 0,
                            },
                        );
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.len(), 100);
        for i in 0..100u8 {
            let v = cache.visit(&key(i), |e| e.value.as_int()).flatten();
            assert_eq!(v, Some(i64::from(i)));
        }
    }
}
