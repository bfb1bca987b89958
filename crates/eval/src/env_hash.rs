//! Environment frame hashing
//!
//! An environment hashes as its slot count, its parent chain (recursively,
//! by content, no pointer is ever fed), and the content hash of each
//! filled slot. Because the frame carries its own slot count, the whole
//! parent chain can be walked without any allocator cooperation, which is
//! what makes these hashes reproducible across runs and machines.
//!
//! Cycle detection is shared with the value hasher: environments reach
//! values through slots, values reach environments through closures, and a
//! back-reference has to account for the whole mixed path.

use std::sync::Arc;

use rill_core::{Portability, StructuralHash, StructuralHashResult};

use crate::env::Env;
use crate::symbol::SymbolTable;
use crate::value_hash::{ValueHashCache, ValueHashCtx};

/// Upper bound on believable frame sizes. A frame claiming more slots than
/// this is treated as corrupt: the hasher emits the placeholder instead of
/// walking memory it cannot trust.
pub const MAX_REASONABLE_ENV_SIZE: usize = 1_048_576;

/// Tag byte separating env hashes from every other hash domain.
const ENV_HASH_TAG: u8 = 0xE0;

impl ValueHashCtx<'_> {
    pub(crate) fn hash_env(&mut self, env: &Arc<Env>) -> StructuralHash {
        if let Some(i) = self
            .env_ancestors
            .iter()
            .rposition(|&a| std::ptr::eq(a, Arc::as_ptr(env)))
        {
            let depth = self.env_ancestors.len() - 1 - i;
            return StructuralHash::back_ref(depth);
        }

        let size = env.size();
        if size > MAX_REASONABLE_ENV_SIZE {
            tracing::warn!(size, "environment frame exceeds sanity bound, hashing as placeholder");
            return StructuralHash::placeholder();
        }

        self.env_ancestors.push(Arc::as_ptr(env));

        let mut sink = rill_core::HashSink::new();
        sink.feed_tag(ENV_HASH_TAG);
        sink.feed_u64(size as u64);

        match env.up() {
            Some(parent) => {
                sink.feed_bool(true);
                let parent_hash = self.hash_env(parent);
                sink.feed_bytes(parent_hash.as_bytes());
            }
            None => sink.feed_bool(false),
        }

        for i in 0..size {
            match env.slot(i) {
                Some(cell) if !cell.is_uninit() && !cell.is_blackhole() => {
                    sink.feed_bool(true);
                    let value_hash = self.hash_value(cell);
                    sink.feed_bytes(value_hash.as_bytes());
                }
                // Unset, uninitialized, or currently-being-forced slots
                // have no stable content.
                _ => sink.feed_bool(false),
            }
        }

        self.env_ancestors.pop();
        StructuralHash::from_sink(sink)
    }

    fn env_portability(&mut self, env: &Arc<Env>) -> Portability {
        if self
            .env_ancestors
            .iter()
            .any(|&a| std::ptr::eq(a, Arc::as_ptr(env)))
        {
            return Portability::Portable;
        }
        if env.size() > MAX_REASONABLE_ENV_SIZE {
            return Portability::NonPortablePointer;
        }
        self.env_ancestors.push(Arc::as_ptr(env));

        let mut result = Portability::Portable;
        for i in 0..env.size() {
            if let Some(cell) = env.slot(i) {
                if !cell.is_uninit() && !cell.is_blackhole() {
                    result = result.combine(self.value_portability(&cell.clone()));
                    if !result.is_portable() {
                        break;
                    }
                }
            }
        }

        if result.is_portable() {
            if let Some(parent) = env.up() {
                result = result.combine(self.env_portability(&parent.clone()));
            }
        }

        self.env_ancestors.pop();
        result
    }
}

/// Hash an environment frame and its parent chain.
pub fn hash_env(
    env: &Arc<Env>,
    symbols: &SymbolTable,
    value_cache: Option<&mut ValueHashCache>,
) -> StructuralHash {
    ValueHashCtx::new(symbols, value_cache).hash_env(env)
}

/// Hash an environment frame and classify how portable the hash is.
pub fn hash_env_with_portability(env: &Arc<Env>, symbols: &SymbolTable) -> StructuralHashResult {
    let mut ctx = ValueHashCtx::new(symbols, None);
    if env.size() > MAX_REASONABLE_ENV_SIZE {
        return StructuralHashResult::new(
            StructuralHash::placeholder(),
            Portability::NonPortablePointer,
        );
    }
    let hash = ctx.hash_env(env);
    ctx.value_ancestors.clear();
    ctx.env_ancestors.clear();
    let portability = ctx.env_portability(env);
    StructuralHashResult::new(hash, portability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn test_env_hash_is_content_based() {
        let syms = SymbolTable::new();
        let mk = |n: i64| {
            let env = Env::root(1);
            env.set_slot(0, Value::int(n));
            env
        };
        assert_eq!(
            hash_env(&mk(1), &syms, None),
            hash_env(&mk(1), &syms, None)
        );
        assert_ne!(
            hash_env(&mk(1), &syms, None),
            hash_env(&mk(2), &syms, None)
        );
    }

    #[test]
    fn test_parent_chain_is_hashed_by_content() {
        let syms = SymbolTable::new();
        let mk = |root_val: i64| {
            let root = Env::root(1);
            root.set_slot(0, Value::int(root_val));
            let child = Env::new(Some(root), 0);
            hash_env(&child, &syms, None)
        };
        assert_eq!(mk(5), mk(5));
        assert_ne!(mk(5), mk(6));
    }

    #[test]
    fn test_empty_slot_differs_from_filled() {
        let syms = SymbolTable::new();
        let empty = Env::root(1);
        let filled = Env::root(1);
        filled.set_slot(0, Value::int(0));
        assert_ne!(
            hash_env(&empty, &syms, None),
            hash_env(&filled, &syms, None)
        );
    }

    #[test]
    fn test_slot_count_is_part_of_identity() {
        let syms = SymbolTable::new();
        assert_ne!(
            hash_env(&Env::root(0), &syms, None),
            hash_env(&Env::root(1), &syms, None)
        );
    }

    #[test]
    fn test_portability_follows_slot_values() {
        let syms = SymbolTable::new();
        let portable = Env::root(1);
        portable.set_slot(0, Value::int(1));
        assert!(hash_env_with_portability(&portable, &syms).is_portable());

        let raw_path = Env::root(1);
        raw_path.set_slot(
            0,
            Value::forced(crate::value::Forced::Path {
                accessor: None,
                path: "/only/here".into(),
            }),
        );
        assert_eq!(
            hash_env_with_portability(&raw_path, &syms).portability,
            Portability::NonPortableRawPath
        );
    }
}
