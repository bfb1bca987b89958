//! Structural expression hashing
//!
//! Computes a content hash over an expression tree such that two parses of
//! the same source, in the same or different processes, agree on every
//! hash. The rules that make the hash a semantic identity rather than a
//! syntactic one:
//!
//! - Attribute sets hash their attributes sorted by name *bytes* (symbol
//!   IDs are session-local), so `{a=1;b=2;}` and `{b=2;a=1;}` coincide.
//! - Lambda single-argument names are not hashed: `x: x` and `y: y` are
//!   alpha-equivalent. Formal names are part of the call interface and are
//!   hashed. `let`-bound names are hashed (a deliberate trade-off; see the
//!   attribute rules).
//! - Lexically-bound variables hash as De Bruijn `(level, displacement)`
//!   pairs; `with`-bound variables hash their name plus the `with`-scope
//!   depth, because the index alone only says *which* scope is searched,
//!   not which key.
//! - Path literals hash by source fingerprint or content, falling back to
//!   the raw string only when neither exists (and recording that in the
//!   portability tag).
//!
//! Hashes are memoized in a pointer-keyed cache, sound because expressions
//! are immutable for the life of the evaluator. Cycle tolerance is
//! defensive: expression graphs are normally acyclic, but a corrupt graph
//! degrades to a back-reference instead of looping.

use dashmap::DashMap;

use rill_core::{ContentHash, ContentHashResult, Counter, HashSink, Portability};

use crate::accessor::AccessorRef;
use crate::expr::{AttrName, BinOp, Expr, ExprRef, VarBinding};
use crate::symbol::SymbolTable;

/// One-byte tags, one per expression variant. A tag is written before each
/// variant body so that structurally different nodes can never collide.
mod tag {
    pub const INT: u8 = 1;
    pub const FLOAT: u8 = 2;
    pub const STRING: u8 = 3;
    pub const PATH: u8 = 4;
    pub const VAR: u8 = 5;
    pub const SELECT: u8 = 6;
    pub const HAS_ATTR: u8 = 7;
    pub const ATTRS: u8 = 8;
    pub const LIST: u8 = 9;
    pub const LAMBDA: u8 = 10;
    pub const CALL: u8 = 11;
    pub const LET: u8 = 12;
    pub const WITH: u8 = 13;
    pub const IF: u8 = 14;
    pub const ASSERT: u8 = 15;
    pub const NOT: u8 = 16;
    pub const EQ: u8 = 17;
    pub const NEQ: u8 = 18;
    pub const AND: u8 = 19;
    pub const OR: u8 = 20;
    pub const IMPL: u8 = 21;
    pub const UPDATE: u8 = 22;
    pub const CONCAT_LISTS: u8 = 23;
    pub const CONCAT_STRINGS: u8 = 24;
    pub const CUR_POS: u8 = 25;
    pub const BLACK_HOLE: u8 = 26;
    pub const INHERIT_FROM: u8 = 27;
}

fn bin_op_tag(op: BinOp) -> u8 {
    match op {
        BinOp::Eq => tag::EQ,
        BinOp::Neq => tag::NEQ,
        BinOp::And => tag::AND,
        BinOp::Or => tag::OR,
        BinOp::Impl => tag::IMPL,
        BinOp::Update => tag::UPDATE,
        BinOp::ConcatLists => tag::CONCAT_LISTS,
    }
}

/// Pointer-keyed memoization cache for expression hashes.
///
/// Keys are node addresses; the cache is shared across evaluator threads
/// and lives as long as the evaluator. Caching by pointer is sound only
/// because expressions never mutate after parsing. The ancestor stack is
/// deliberately *not* part of the key: it only exists for cycle detection
/// within one computation, and a finished hash is context-free.
#[derive(Default)]
pub struct ExprHashCache {
    map: DashMap<usize, ContentHash>,
    pub hits: Counter,
    pub misses: Counter,
}

impl ExprHashCache {
    pub fn new() -> Self {
        ExprHashCache::default()
    }

    fn lookup(&self, key: usize) -> Option<ContentHash> {
        match self.map.get(&key) {
            Some(entry) => {
                self.hits.bump();
                Some(*entry)
            }
            None => {
                self.misses.bump();
                None
            }
        }
    }

    fn insert(&self, key: usize, hash: ContentHash) {
        self.map.insert(key, hash);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Feed a path's content-based fingerprint.
///
/// Markers: 0x01 accessor fingerprint + relative path, 0x02 content hash,
/// 0x00 raw path string (the non-portable fallback).
pub(crate) fn feed_path_fingerprint(
    sink: &mut HashSink,
    accessor: Option<&AccessorRef>,
    path: &str,
) {
    if let Some(accessor) = accessor {
        let (rel, fingerprint) = accessor.fingerprint(path);
        if let Some(fp) = fingerprint {
            sink.feed_tag(0x01);
            sink.feed_str(&fp);
            sink.feed_str(&rel);
            return;
        }
        if accessor.exists(path) {
            if let Ok(digest) = accessor.hash_path(path) {
                sink.feed_tag(0x02);
                sink.feed_tag(digest.algo as u8);
                sink.feed_bytes(&digest.bytes);
                return;
            }
        }
    }
    sink.feed_tag(0x00);
    sink.feed_str(path);
}

/// Portability of the fingerprint [`feed_path_fingerprint`] would emit.
pub(crate) fn path_portability(accessor: Option<&AccessorRef>, path: &str) -> Portability {
    if let Some(accessor) = accessor {
        let (_, fingerprint) = accessor.fingerprint(path);
        if fingerprint.is_some() {
            return Portability::Portable;
        }
        if accessor.exists(path) && accessor.hash_path(path).is_ok() {
            return Portability::Portable;
        }
    }
    Portability::NonPortableRawPath
}

struct ExprHasher<'a> {
    symbols: &'a SymbolTable,
    cache: Option<&'a ExprHashCache>,
    ancestors: Vec<*const Expr>,
}

impl<'a> ExprHasher<'a> {
    fn new(symbols: &'a SymbolTable, cache: Option<&'a ExprHashCache>) -> Self {
        ExprHasher {
            symbols,
            cache,
            ancestors: Vec::new(),
        }
    }

    fn feed_symbol(&self, sink: &mut HashSink, sym: crate::symbol::Symbol) {
        sink.feed_str(&self.symbols.resolve(sym));
    }

    fn feed_hash(&self, sink: &mut HashSink, h: ContentHash) {
        sink.feed_bytes(h.as_bytes());
    }

    /// Depth from the top of the ancestor stack, if `e` is being hashed.
    fn find_in_ancestors(&self, e: *const Expr) -> Option<usize> {
        self.ancestors
            .iter()
            .rposition(|&a| std::ptr::eq(a, e))
            .map(|i| self.ancestors.len() - 1 - i)
    }

    fn hash_attr_path(&mut self, sink: &mut HashSink, path: &[AttrName]) {
        sink.feed_u64(path.len() as u64);
        for step in path {
            match step {
                AttrName::Dynamic(e) => {
                    sink.feed_bool(true);
                    let h = self.hash(e);
                    self.feed_hash(sink, h);
                }
                AttrName::Static(sym) => {
                    sink.feed_bool(false);
                    self.feed_symbol(sink, *sym);
                }
            }
        }
    }

    fn hash(&mut self, e: &ExprRef) -> ContentHash {
        let key = ExprRef::as_ptr(e) as usize;

        if let Some(cache) = self.cache {
            if let Some(h) = cache.lookup(key) {
                return h;
            }
        }

        if let Some(depth) = self.find_in_ancestors(ExprRef::as_ptr(e)) {
            return ContentHash::back_ref(depth);
        }
        self.ancestors.push(ExprRef::as_ptr(e));

        let mut sink = HashSink::new();
        match &**e {
            Expr::Int(v) => {
                sink.feed_tag(tag::INT);
                sink.feed_i64(*v);
            }
            Expr::Float(v) => {
                sink.feed_tag(tag::FLOAT);
                sink.feed_f64(*v);
            }
            Expr::Str(s) => {
                // Content only. Context is attached during evaluation and
                // handled by the value hasher.
                sink.feed_tag(tag::STRING);
                sink.feed_str(s);
            }
            Expr::Path { accessor, path } => {
                sink.feed_tag(tag::PATH);
                feed_path_fingerprint(&mut sink, accessor.as_ref(), path);
            }
            Expr::Var(var) => {
                sink.feed_tag(tag::VAR);
                match var.binding {
                    VarBinding::FromWith { with_depth, .. } => {
                        // The depth names the scope; the name picks the key
                        // inside it. Without the name, `x` and `y` under the
                        // same `with` would collide.
                        sink.feed_bool(true);
                        self.feed_symbol(&mut sink, var.name);
                        sink.feed_u32(with_depth);
                    }
                    VarBinding::Lexical { level, displ } => {
                        sink.feed_bool(false);
                        sink.feed_u32(level);
                        sink.feed_u32(displ);
                    }
                }
            }
            Expr::Select {
                base,
                path,
                default,
            } => {
                sink.feed_tag(tag::SELECT);
                let h = self.hash(base);
                self.feed_hash(&mut sink, h);
                self.hash_attr_path(&mut sink, path);
                sink.feed_bool(default.is_some());
                if let Some(def) = default {
                    let h = self.hash(def);
                    self.feed_hash(&mut sink, h);
                }
            }
            Expr::HasAttr { base, path } => {
                sink.feed_tag(tag::HAS_ATTR);
                let h = self.hash(base);
                self.feed_hash(&mut sink, h);
                self.hash_attr_path(&mut sink, path);
            }
            Expr::Attrs(attrs) => {
                sink.feed_tag(tag::ATTRS);
                sink.feed_bool(attrs.recursive);

                // Sort by name bytes, not symbol ID: IDs depend on
                // interning order and would leak session state.
                let mut sorted: Vec<_> = attrs
                    .attrs
                    .iter()
                    .map(|a| (self.symbols.resolve(a.name), a))
                    .collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));

                sink.feed_u64(sorted.len() as u64);
                for (name, attr) in sorted {
                    sink.feed_str(&name);
                    let h = self.hash(&attr.expr);
                    self.feed_hash(&mut sink, h);
                    sink.feed_tag(attr.kind as u8);
                }

                // Dynamic attributes keep construction order: their names
                // are computed, so there is nothing to sort by.
                sink.feed_u64(attrs.dynamic_attrs.len() as u64);
                for dyn_attr in &attrs.dynamic_attrs {
                    let h = self.hash(&dyn_attr.name_expr);
                    self.feed_hash(&mut sink, h);
                    let h = self.hash(&dyn_attr.value_expr);
                    self.feed_hash(&mut sink, h);
                }

                sink.feed_u64(attrs.inherit_from.len() as u64);
                for from in &attrs.inherit_from {
                    let h = self.hash(from);
                    self.feed_hash(&mut sink, h);
                }
            }
            Expr::List(elems) => {
                sink.feed_tag(tag::LIST);
                sink.feed_u64(elems.len() as u64);
                for elem in elems {
                    let h = self.hash(elem);
                    self.feed_hash(&mut sink, h);
                }
            }
            Expr::Lambda(lambda) => {
                sink.feed_tag(tag::LAMBDA);
                match &lambda.formals {
                    Some(formals) => {
                        sink.feed_bool(true);
                        sink.feed_u64(formals.formals.len() as u64);
                        sink.feed_bool(formals.ellipsis);
                        let mut sorted: Vec<_> = formals
                            .formals
                            .iter()
                            .map(|f| (self.symbols.resolve(f.name), f))
                            .collect();
                        sorted.sort_by(|a, b| a.0.cmp(&b.0));
                        for (name, formal) in sorted {
                            sink.feed_str(&name);
                            sink.feed_bool(formal.default.is_some());
                            if let Some(def) = &formal.default {
                                let h = self.hash(def);
                                self.feed_hash(&mut sink, h);
                            }
                        }
                    }
                    None => sink.feed_bool(false),
                }
                // Alpha-equivalence: whether a single-argument binding
                // exists is structural, its name is not.
                sink.feed_bool(lambda.arg.is_some());
                let h = self.hash(&lambda.body);
                self.feed_hash(&mut sink, h);
            }
            Expr::Call { fun, args } => {
                sink.feed_tag(tag::CALL);
                let h = self.hash(fun);
                self.feed_hash(&mut sink, h);
                sink.feed_u64(args.len() as u64);
                for arg in args {
                    let h = self.hash(arg);
                    self.feed_hash(&mut sink, h);
                }
            }
            Expr::Let { attrs, body } => {
                sink.feed_tag(tag::LET);
                let h = self.hash(attrs);
                self.feed_hash(&mut sink, h);
                let h = self.hash(body);
                self.feed_hash(&mut sink, h);
            }
            Expr::With { attrs, body } => {
                sink.feed_tag(tag::WITH);
                let h = self.hash(attrs);
                self.feed_hash(&mut sink, h);
                let h = self.hash(body);
                self.feed_hash(&mut sink, h);
            }
            Expr::If { cond, then, els } => {
                sink.feed_tag(tag::IF);
                let h = self.hash(cond);
                self.feed_hash(&mut sink, h);
                let h = self.hash(then);
                self.feed_hash(&mut sink, h);
                let h = self.hash(els);
                self.feed_hash(&mut sink, h);
            }
            Expr::Assert { cond, body } => {
                sink.feed_tag(tag::ASSERT);
                let h = self.hash(cond);
                self.feed_hash(&mut sink, h);
                let h = self.hash(body);
                self.feed_hash(&mut sink, h);
            }
            Expr::Not(sub) => {
                sink.feed_tag(tag::NOT);
                let h = self.hash(sub);
                self.feed_hash(&mut sink, h);
            }
            Expr::Op { op, lhs, rhs } => {
                sink.feed_tag(bin_op_tag(*op));
                let h = self.hash(lhs);
                self.feed_hash(&mut sink, h);
                let h = self.hash(rhs);
                self.feed_hash(&mut sink, h);
            }
            Expr::ConcatStrings { force_string, parts } => {
                sink.feed_tag(tag::CONCAT_STRINGS);
                sink.feed_bool(*force_string);
                sink.feed_u64(parts.len() as u64);
                for part in parts {
                    let h = self.hash(part);
                    self.feed_hash(&mut sink, h);
                }
            }
            Expr::CurPos(pos) => {
                // Position indices depend on registration order; the hash
                // is only stable within this session, which the portability
                // pass records.
                sink.feed_tag(tag::CUR_POS);
                sink.feed_u64(u64::from(pos.raw()));
            }
            Expr::BlackHole => {
                sink.feed_tag(tag::BLACK_HOLE);
            }
            Expr::InheritFrom { level, displ } => {
                sink.feed_tag(tag::INHERIT_FROM);
                sink.feed_u32(*level);
                sink.feed_u32(*displ);
            }
        }

        let result = ContentHash::from_sink(sink);
        self.ancestors.pop();

        if let Some(cache) = self.cache {
            cache.insert(key, result);
        }
        result
    }

    /// Least portable classification over the subtree. Runs as a separate
    /// traversal so that cached hashes stay usable: the cache stores bare
    /// hashes, and portability short-circuits in ways a combined pass
    /// could not.
    fn portability(&mut self, e: &ExprRef) -> Portability {
        if self.find_in_ancestors(ExprRef::as_ptr(e)).is_some() {
            // A back-ref is just a depth; it is portable by itself.
            return Portability::Portable;
        }
        self.ancestors.push(ExprRef::as_ptr(e));

        let mut result = Portability::Portable;
        let mut combine = |result: &mut Portability, p: Portability| {
            *result = result.combine(p);
            result.is_portable()
        };

        match &**e {
            Expr::CurPos(_) => result = Portability::NonPortableSessionLocal,
            Expr::Path { accessor, path } => {
                result = path_portability(accessor.as_ref(), path);
            }
            Expr::Select {
                base,
                path,
                default,
            } => {
                let p = self.portability(base);
                if combine(&mut result, p) {
                    for step in path {
                        if let AttrName::Dynamic(sub) = step {
                            let p = self.portability(sub);
                            if !combine(&mut result, p) {
                                break;
                            }
                        }
                    }
                }
                if result.is_portable() {
                    if let Some(def) = default {
                        let p = self.portability(def);
                        combine(&mut result, p);
                    }
                }
            }
            Expr::HasAttr { base, path } => {
                let p = self.portability(base);
                if combine(&mut result, p) {
                    for step in path {
                        if let AttrName::Dynamic(sub) = step {
                            let p = self.portability(sub);
                            if !combine(&mut result, p) {
                                break;
                            }
                        }
                    }
                }
            }
            Expr::Attrs(attrs) => {
                for attr in &attrs.attrs {
                    let p = self.portability(&attr.expr);
                    if !combine(&mut result, p) {
                        break;
                    }
                }
                if result.is_portable() {
                    for dyn_attr in &attrs.dynamic_attrs {
                        let p = self.portability(&dyn_attr.name_expr);
                        if !combine(&mut result, p) {
                            break;
                        }
                        let p = self.portability(&dyn_attr.value_expr);
                        if !combine(&mut result, p) {
                            break;
                        }
                    }
                }
                if result.is_portable() {
                    for from in &attrs.inherit_from {
                        let p = self.portability(from);
                        if !combine(&mut result, p) {
                            break;
                        }
                    }
                }
            }
            Expr::List(elems) | Expr::ConcatStrings { parts: elems, .. } => {
                for elem in elems {
                    let p = self.portability(elem);
                    if !combine(&mut result, p) {
                        break;
                    }
                }
            }
            Expr::Lambda(lambda) => {
                if let Some(formals) = &lambda.formals {
                    for formal in &formals.formals {
                        if let Some(def) = &formal.default {
                            let p = self.portability(def);
                            if !combine(&mut result, p) {
                                break;
                            }
                        }
                    }
                }
                if result.is_portable() {
                    let p = self.portability(&lambda.body);
                    combine(&mut result, p);
                }
            }
            Expr::Call { fun, args } => {
                let p = self.portability(fun);
                if combine(&mut result, p) {
                    for arg in args {
                        let p = self.portability(arg);
                        if !combine(&mut result, p) {
                            break;
                        }
                    }
                }
            }
            Expr::Let { attrs: a, body: b }
            | Expr::With { attrs: a, body: b }
            | Expr::Assert { cond: a, body: b }
            | Expr::Op { lhs: a, rhs: b, .. } => {
                let p = self.portability(a);
                if combine(&mut result, p) {
                    let p = self.portability(b);
                    combine(&mut result, p);
                }
            }
            Expr::If { cond, then, els } => {
                let p = self.portability(cond);
                if combine(&mut result, p) {
                    let p = self.portability(then);
                    if combine(&mut result, p) {
                        let p = self.portability(els);
                        combine(&mut result, p);
                    }
                }
            }
            Expr::Not(sub) => {
                let p = self.portability(sub);
                combine(&mut result, p);
            }
            Expr::Int(_)
            | Expr::Float(_)
            | Expr::Str(_)
            | Expr::Var(_)
            | Expr::InheritFrom { .. }
            | Expr::BlackHole => {}
        }

        self.ancestors.pop();
        result
    }
}

/// Hash an expression tree.
pub fn hash_expr(
    expr: &ExprRef,
    symbols: &SymbolTable,
    cache: Option<&ExprHashCache>,
) -> ContentHash {
    ExprHasher::new(symbols, cache).hash(expr)
}

/// Hash an optional expression; absent nodes get the placeholder.
pub fn hash_expr_opt(
    expr: Option<&ExprRef>,
    symbols: &SymbolTable,
    cache: Option<&ExprHashCache>,
) -> ContentHash {
    match expr {
        Some(e) => hash_expr(e, symbols, cache),
        None => ContentHash::placeholder(),
    }
}

/// Hash an expression tree and report how portable the hash is.
pub fn hash_expr_with_portability(expr: &ExprRef, symbols: &SymbolTable) -> ContentHashResult {
    let mut hasher = ExprHasher::new(symbols, None);
    let hash = hasher.hash(expr);
    hasher.ancestors.clear();
    let portability = hasher.portability(expr);
    ContentHashResult::new(hash, portability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{ExprAttrs, Formal, Formals};
    use crate::pos::PosTable;

    fn symbols() -> SymbolTable {
        SymbolTable::new()
    }

    #[test]
    fn test_same_literal_same_hash() {
        let syms = symbols();
        let a = Expr::int(42);
        let b = Expr::int(42);
        assert_eq!(hash_expr(&a, &syms, None), hash_expr(&b, &syms, None));
        assert_ne!(
            hash_expr(&a, &syms, None),
            hash_expr(&Expr::int(43), &syms, None)
        );
    }

    #[test]
    fn test_tag_separates_types() {
        let syms = symbols();
        // 1 the integer vs 1.0 the float: same payload width, different tag.
        assert_ne!(
            hash_expr(&Expr::int(0), &syms, None),
            hash_expr(&Expr::float(0.0), &syms, None)
        );
    }

    #[test]
    fn test_lambda_alpha_equivalence() {
        let syms = symbols();
        let x = syms.intern("x");
        let y = syms.intern("y");
        // x: x  vs  y: y
        let id_x = Expr::lambda(x, Expr::var(x, 0, 0));
        let id_y = Expr::lambda(y, Expr::var(y, 0, 0));
        assert_eq!(
            hash_expr(&id_x, &syms, None),
            hash_expr(&id_y, &syms, None)
        );

        // x: y: x  vs  a: b: a
        let k1 = Expr::lambda(x, Expr::lambda(y, Expr::var(x, 1, 0)));
        let a = syms.intern("a");
        let b = syms.intern("b");
        let k2 = Expr::lambda(a, Expr::lambda(b, Expr::var(a, 1, 0)));
        assert_eq!(hash_expr(&k1, &syms, None), hash_expr(&k2, &syms, None));

        // x: y: x  vs  x: y: y differ (different De Bruijn coordinates)
        let k3 = Expr::lambda(x, Expr::lambda(y, Expr::var(y, 0, 0)));
        assert_ne!(hash_expr(&k1, &syms, None), hash_expr(&k3, &syms, None));
    }

    #[test]
    fn test_formal_names_are_hashed() {
        let syms = symbols();
        let mk = |name: &str| {
            Expr::lambda_formals(
                Formals {
                    ellipsis: false,
                    formals: vec![Formal {
                        name: syms.intern(name),
                        default: None,
                    }],
                },
                Expr::int(1),
            )
        };
        assert_ne!(
            hash_expr(&mk("alpha"), &syms, None),
            hash_expr(&mk("beta"), &syms, None)
        );
    }

    #[test]
    fn test_attr_order_is_irrelevant() {
        let syms = symbols();
        let a = syms.intern("a");
        let b = syms.intern("b");
        let ab = Expr::attrs(
            ExprAttrs::new()
                .attr(a, Expr::int(1))
                .attr(b, Expr::int(2)),
        );
        let ba = Expr::attrs(
            ExprAttrs::new()
                .attr(b, Expr::int(2))
                .attr(a, Expr::int(1)),
        );
        assert_eq!(hash_expr(&ab, &syms, None), hash_expr(&ba, &syms, None));
    }

    #[test]
    fn test_list_order_matters() {
        let syms = symbols();
        let asc = Expr::list(vec![Expr::int(1), Expr::int(2), Expr::int(3)]);
        let desc = Expr::list(vec![Expr::int(3), Expr::int(2), Expr::int(1)]);
        assert_ne!(hash_expr(&asc, &syms, None), hash_expr(&desc, &syms, None));
    }

    #[test]
    fn test_with_vars_hash_their_name() {
        let syms = symbols();
        let x = Expr::with_var(syms.intern("x"), 0, 1);
        let y = Expr::with_var(syms.intern("y"), 0, 1);
        assert_ne!(hash_expr(&x, &syms, None), hash_expr(&y, &syms, None));
    }

    #[test]
    fn test_with_depth_matters() {
        let syms = symbols();
        let x = syms.intern("x");
        let inner = Expr::with_var(x, 0, 2);
        let outer = Expr::with_var(x, 0, 1);
        assert_ne!(
            hash_expr(&inner, &syms, None),
            hash_expr(&outer, &syms, None)
        );
    }

    #[test]
    fn test_cur_pos_is_site_specific_and_session_local() {
        let syms = symbols();
        let positions = PosTable::new();
        let p1 = Expr::cur_pos(positions.add("a.rill", 1, 1));
        let p2 = Expr::cur_pos(positions.add("a.rill", 2, 1));
        assert_ne!(hash_expr(&p1, &syms, None), hash_expr(&p2, &syms, None));

        let result = hash_expr_with_portability(&p1, &syms);
        assert_eq!(result.portability, Portability::NonPortableSessionLocal);
    }

    #[test]
    fn test_pathless_accessor_degrades_portability() {
        let syms = symbols();
        let p = Expr::path(None, "/etc/hosts");
        let result = hash_expr_with_portability(&p, &syms);
        assert_eq!(result.portability, Portability::NonPortableRawPath);

        let pure = hash_expr_with_portability(&Expr::int(1), &syms);
        assert_eq!(pure.portability, Portability::Portable);
    }

    #[test]
    fn test_cache_returns_same_hash() {
        let syms = symbols();
        let cache = ExprHashCache::new();
        let e = Expr::list(vec![Expr::int(1), Expr::string("two")]);
        let uncached = hash_expr(&e, &syms, None);
        let first = hash_expr(&e, &syms, Some(&cache));
        let second = hash_expr(&e, &syms, Some(&cache));
        assert_eq!(first, uncached);
        assert_eq!(first, second);
        assert!(cache.hits.get() > 0);
    }

    #[test]
    fn test_opt_hash_placeholder() {
        let syms = symbols();
        assert_eq!(
            hash_expr_opt(None, &syms, None),
            ContentHash::placeholder()
        );
    }

    #[test]
    fn test_select_default_presence_matters() {
        let syms = symbols();
        let a = syms.intern("a");
        let base = Expr::attrs(ExprAttrs::new());
        let plain = Expr::select(base.clone(), vec![AttrName::Static(a)], None);
        let with_default =
            Expr::select(base, vec![AttrName::Static(a)], Some(Expr::int(0)));
        assert_ne!(
            hash_expr(&plain, &syms, None),
            hash_expr(&with_default, &syms, None)
        );
    }
}
