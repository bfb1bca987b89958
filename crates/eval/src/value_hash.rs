//! Content hashing of forced value graphs
//!
//! Produces a [`ContentHash`] for a value, recursing through records,
//! lists, string context, and captured environments. Value graphs may be
//! cyclic (`rec` sets); cycles are cut with depth-encoded back-references
//! against the ancestor stack, so two isomorphic cycles hash identically
//! no matter where they live in memory.
//!
//! A pointer-keyed cache can be supplied, but it is only sound *within one
//! top-level hashing call*: value cells are reclaimed and reused across
//! forcings, so a cache that outlives the call would serve hashes for
//! recycled addresses. This is the opposite of the expression cache, whose
//! nodes are immortal.

use std::collections::HashMap;

use rill_core::{ContentHash, ContentHashResult, HashSink, Portability};

use crate::env::Env;
use crate::expr_hash::{feed_path_fingerprint, hash_expr, path_portability};
use crate::symbol::SymbolTable;
use crate::value::{Forced, Value, ValuePtr, ValueState};

/// Per-call cache of already-hashed value cells, keyed by address.
pub type ValueHashCache = HashMap<usize, ContentHash>;

mod tag {
    pub const INT: u8 = 1;
    pub const FLOAT: u8 = 2;
    pub const BOOL: u8 = 3;
    pub const NULL: u8 = 4;
    pub const STRING: u8 = 5;
    pub const PATH: u8 = 6;
    pub const ATTRS: u8 = 7;
    pub const LIST: u8 = 8;
    pub const LAMBDA: u8 = 9;
    pub const THUNK: u8 = 10;
    pub const APP: u8 = 11;
    pub const PRIM_OP: u8 = 12;
    pub const PRIM_OP_APP: u8 = 13;
    pub const EXTERNAL: u8 = 14;
}

/// Shared traversal state for value and environment hashing.
///
/// The two ancestor stacks are carried together because values reach
/// environments (through closures) and environments reach values (through
/// slots); cycle detection has to see the whole path regardless of which
/// side it entered from.
pub(crate) struct ValueHashCtx<'a> {
    pub(crate) symbols: &'a SymbolTable,
    pub(crate) value_ancestors: Vec<*const Value>,
    pub(crate) env_ancestors: Vec<*const Env>,
    pub(crate) cache: Option<&'a mut ValueHashCache>,
}

impl<'a> ValueHashCtx<'a> {
    pub(crate) fn new(symbols: &'a SymbolTable, cache: Option<&'a mut ValueHashCache>) -> Self {
        ValueHashCtx {
            symbols,
            value_ancestors: Vec::new(),
            env_ancestors: Vec::new(),
            cache,
        }
    }

    fn feed_hash(sink: &mut HashSink, h: ContentHash) {
        sink.feed_bytes(h.as_bytes());
    }

    pub(crate) fn hash_value(&mut self, v: &ValuePtr) -> ContentHash {
        let state = v.state();

        // A cell being forced right now, or never initialized, has no
        // content to speak of; all such cells collide on the placeholder.
        match state {
            ValueState::Pending { .. } | ValueState::Uninit | ValueState::Failed(_) => {
                return ContentHash::placeholder();
            }
            _ => {}
        }

        let key = ValuePtr::as_ptr(v) as usize;
        if let Some(cache) = self.cache.as_deref_mut() {
            if let Some(h) = cache.get(&key) {
                return *h;
            }
        }

        if let Some(i) = self
            .value_ancestors
            .iter()
            .rposition(|&a| std::ptr::eq(a, ValuePtr::as_ptr(v)))
        {
            let depth = self.value_ancestors.len() - 1 - i;
            return ContentHash::back_ref(depth);
        }
        self.value_ancestors.push(ValuePtr::as_ptr(v));

        let mut sink = HashSink::new();
        match state {
            ValueState::Pending { .. } | ValueState::Uninit | ValueState::Failed(_) => unreachable!(),
            ValueState::Thunk { env, expr } => {
                sink.feed_tag(tag::THUNK);
                Self::feed_hash(&mut sink, hash_expr(&expr, self.symbols, None));
                let env_hash = self.hash_env(&env);
                sink.feed_bytes(env_hash.as_bytes());
            }
            ValueState::App { left, right } => {
                sink.feed_tag(tag::APP);
                let h = self.hash_value(&left);
                Self::feed_hash(&mut sink, h);
                let h = self.hash_value(&right);
                Self::feed_hash(&mut sink, h);
            }
            ValueState::Forced(forced) => match forced {
                Forced::Int(n) => {
                    sink.feed_tag(tag::INT);
                    sink.feed_i64(n);
                }
                Forced::Float(x) => {
                    sink.feed_tag(tag::FLOAT);
                    sink.feed_f64(x);
                }
                Forced::Bool(b) => {
                    sink.feed_tag(tag::BOOL);
                    sink.feed_bool(b);
                }
                Forced::Null => {
                    sink.feed_tag(tag::NULL);
                }
                Forced::Str(s) => {
                    sink.feed_tag(tag::STRING);
                    sink.feed_str(&s.content);
                    // BTreeSet iterates sorted; context order never leaks.
                    sink.feed_u64(s.context.len() as u64);
                    for entry in s.context.iter() {
                        sink.feed_str(entry);
                    }
                }
                Forced::Path { accessor, path } => {
                    sink.feed_tag(tag::PATH);
                    feed_path_fingerprint(&mut sink, accessor.as_ref(), &path);
                }
                Forced::Attrs(set) => {
                    sink.feed_tag(tag::ATTRS);
                    sink.feed_u64(set.len() as u64);
                    for attr in set.iter() {
                        sink.feed_str(&self.symbols.resolve(attr.name));
                        let h = self.hash_value(&attr.value);
                        Self::feed_hash(&mut sink, h);
                    }
                }
                Forced::List(elems) => {
                    sink.feed_tag(tag::LIST);
                    sink.feed_u64(elems.len() as u64);
                    for elem in elems.iter() {
                        let h = self.hash_value(elem);
                        Self::feed_hash(&mut sink, h);
                    }
                }
                Forced::Lambda { env, expr } => {
                    sink.feed_tag(tag::LAMBDA);
                    Self::feed_hash(&mut sink, hash_expr(&expr, self.symbols, None));
                    let env_hash = self.hash_env(&env);
                    sink.feed_bytes(env_hash.as_bytes());
                }
                Forced::PrimOp(op) => {
                    sink.feed_tag(tag::PRIM_OP);
                    sink.feed_str(op.name);
                }
                Forced::PrimOpApp { op, args } => {
                    sink.feed_tag(tag::PRIM_OP_APP);
                    sink.feed_str(op.name);
                    sink.feed_u64(args.len() as u64);
                    for arg in &args {
                        let h = self.hash_value(arg);
                        Self::feed_hash(&mut sink, h);
                    }
                }
                Forced::External(ext) => {
                    // Opaque: the address is the only identity available.
                    // Session-local stability only.
                    sink.feed_tag(tag::EXTERNAL);
                    sink.feed_u64(std::sync::Arc::as_ptr(&ext) as *const () as usize as u64);
                }
            },
        }

        let result = ContentHash::from_sink(sink);
        self.value_ancestors.pop();
        if let Some(cache) = self.cache.as_deref_mut() {
            cache.insert(key, result);
        }
        result
    }

    pub(crate) fn value_portability(&mut self, v: &ValuePtr) -> Portability {
        let state = v.state();
        match state {
            ValueState::Pending { .. } | ValueState::Uninit | ValueState::Failed(_) => {
                return Portability::Portable;
            }
            _ => {}
        }

        if self
            .value_ancestors
            .iter()
            .any(|&a| std::ptr::eq(a, ValuePtr::as_ptr(v)))
        {
            return Portability::Portable;
        }
        self.value_ancestors.push(ValuePtr::as_ptr(v));

        let result = match state {
            ValueState::Pending { .. } | ValueState::Uninit | ValueState::Failed(_) => unreachable!(),
            // Closures and partial applications depend on captured
            // environments whose identity is machine-local.
            ValueState::Thunk { .. } | ValueState::App { .. } => Portability::NonPortablePointer,
            ValueState::Forced(forced) => match forced {
                Forced::Lambda { .. } | Forced::PrimOpApp { .. } | Forced::External(_) => {
                    Portability::NonPortablePointer
                }
                Forced::PrimOp(_) => Portability::Portable,
                Forced::Path { accessor, path } => path_portability(accessor.as_ref(), &path),
                Forced::Attrs(set) => {
                    let mut p = Portability::Portable;
                    for attr in set.iter() {
                        p = p.combine(self.value_portability(&attr.value));
                        if !p.is_portable() {
                            break;
                        }
                    }
                    p
                }
                Forced::List(elems) => {
                    let mut p = Portability::Portable;
                    for elem in elems.iter() {
                        p = p.combine(self.value_portability(elem));
                        if !p.is_portable() {
                            break;
                        }
                    }
                    p
                }
                Forced::Int(_)
                | Forced::Float(_)
                | Forced::Bool(_)
                | Forced::Null
                | Forced::Str(_) => Portability::Portable,
            },
        };

        self.value_ancestors.pop();
        result
    }
}

/// Hash a forced value graph.
///
/// `cache` must not outlive the surrounding top-level hashing operation;
/// see the module docs.
pub fn hash_value(
    v: &ValuePtr,
    symbols: &SymbolTable,
    cache: Option<&mut ValueHashCache>,
) -> ContentHash {
    ValueHashCtx::new(symbols, cache).hash_value(v)
}

/// Hash a value and classify how portable the hash is.
pub fn hash_value_with_portability(v: &ValuePtr, symbols: &SymbolTable) -> ContentHashResult {
    let mut ctx = ValueHashCtx::new(symbols, None);
    let hash = ctx.hash_value(v);
    ctx.value_ancestors.clear();
    ctx.env_ancestors.clear();
    let portability = ctx.value_portability(v);
    ContentHashResult::new(hash, portability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Attr, AttrSet, StringValue};
    use std::collections::BTreeSet;

    #[test]
    fn test_primitives_hash_by_content() {
        let syms = SymbolTable::new();
        assert_eq!(
            hash_value(&Value::int(7), &syms, None),
            hash_value(&Value::int(7), &syms, None)
        );
        assert_ne!(
            hash_value(&Value::int(7), &syms, None),
            hash_value(&Value::int(8), &syms, None)
        );
        assert_ne!(
            hash_value(&Value::bool(true), &syms, None),
            hash_value(&Value::int(1), &syms, None)
        );
    }

    #[test]
    fn test_float_canonicalization_at_value_layer() {
        let syms = SymbolTable::new();
        let pos = Value::forced(Forced::Float(0.0));
        let neg = Value::forced(Forced::Float(-0.0));
        assert_eq!(hash_value(&pos, &syms, None), hash_value(&neg, &syms, None));

        let nan1 = Value::forced(Forced::Float(f64::NAN));
        let nan2 = Value::forced(Forced::Float(f64::from_bits(0xfff8_1234_5678_9abc)));
        assert_eq!(
            hash_value(&nan1, &syms, None),
            hash_value(&nan2, &syms, None)
        );
    }

    #[test]
    fn test_string_context_is_part_of_identity() {
        let syms = SymbolTable::new();
        let plain = Value::string("out");
        let mut ctx = BTreeSet::new();
        ctx.insert("src:abc123".to_string());
        let with_ctx = Value::forced(Forced::Str(StringValue::with_context("out", ctx)));
        assert_ne!(
            hash_value(&plain, &syms, None),
            hash_value(&with_ctx, &syms, None)
        );
    }

    #[test]
    fn test_record_order_is_irrelevant() {
        let syms = SymbolTable::new();
        let a = syms.intern("a");
        let b = syms.intern("b");
        let mk = |pairs: Vec<(crate::symbol::Symbol, i64)>| {
            Value::forced(Forced::Attrs(AttrSet::build(
                &syms,
                pairs
                    .into_iter()
                    .map(|(name, n)| Attr {
                        name,
                        value: Value::int(n),
                    })
                    .collect(),
            )))
        };
        let ab = mk(vec![(a, 1), (b, 2)]);
        let ba = mk(vec![(b, 2), (a, 1)]);
        assert_eq!(hash_value(&ab, &syms, None), hash_value(&ba, &syms, None));
    }

    #[test]
    fn test_list_order_matters() {
        let syms = SymbolTable::new();
        let asc = Value::forced(Forced::List(std::sync::Arc::new(vec![
            Value::int(1),
            Value::int(2),
        ])));
        let desc = Value::forced(Forced::List(std::sync::Arc::new(vec![
            Value::int(2),
            Value::int(1),
        ])));
        assert_ne!(hash_value(&asc, &syms, None), hash_value(&desc, &syms, None));
    }

    #[test]
    fn test_blackhole_hashes_as_placeholder() {
        let syms = SymbolTable::new();
        let cell = Value::uninit();
        assert_eq!(
            hash_value(&cell, &syms, None),
            ContentHash::placeholder()
        );
    }

    #[test]
    fn test_cyclic_record_is_finite_and_stable() {
        let syms = SymbolTable::new();
        let a = syms.intern("a");
        // Build a record whose attribute is the record itself.
        let cell = Value::uninit();
        let set = AttrSet::build(
            &syms,
            vec![Attr {
                name: a,
                value: cell.clone(),
            }],
        );
        cell.set_forced(Forced::Attrs(set));

        let h1 = hash_value(&cell, &syms, None);
        let h2 = hash_value(&cell, &syms, None);
        assert_eq!(h1, h2);

        // An isomorphic cycle built from different cells hashes equal.
        let other = Value::uninit();
        let other_set = AttrSet::build(
            &syms,
            vec![Attr {
                name: a,
                value: other.clone(),
            }],
        );
        other.set_forced(Forced::Attrs(other_set));
        assert_eq!(hash_value(&other, &syms, None), h1);
    }
}
