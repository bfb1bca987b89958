//! Thunk identity
//!
//! The memoization key for a thunk is built from three ingredients: the
//! expression's structural hash, the captured environment's content hash,
//! and the try-catch nesting depth at the force site. The try depth is not
//! decoration: `assert false` *raises* outside a try scope but produces a
//! failure record inside one, so the same `(expr, env)` pair genuinely
//! denotes different results at different depths.

use std::sync::Arc;

use rill_core::{HashSink, StructuralHash};

use crate::env::Env;
use crate::expr::ExprRef;
use crate::expr_hash::{ExprHashCache, hash_expr};
use crate::symbol::SymbolTable;
use crate::value_hash::{ValueHashCache, ValueHashCtx};

/// Tag byte separating thunk hashes from every other hash domain.
const THUNK_HASH_TAG: u8 = 0xD0;

/// Compute the memoization key for a thunk.
///
/// `expr_cache` is the evaluator's long-lived pointer cache; `value_cache`
/// must be scoped to this call (value cells are reused across forcings).
pub fn compute_thunk_hash(
    expr: &ExprRef,
    env: Option<&Arc<Env>>,
    try_depth: i32,
    symbols: &SymbolTable,
    expr_cache: Option<&ExprHashCache>,
    value_cache: Option<&mut ValueHashCache>,
) -> StructuralHash {
    let mut sink = HashSink::new();
    sink.feed_tag(THUNK_HASH_TAG);
    sink.feed_i32(try_depth);

    let expr_hash = hash_expr(expr, symbols, expr_cache);
    sink.feed_bytes(expr_hash.as_bytes());

    match env {
        Some(env) => {
            sink.feed_bool(true);
            let env_hash = ValueHashCtx::new(symbols, value_cache).hash_env(env);
            sink.feed_bytes(env_hash.as_bytes());
        }
        None => sink.feed_bool(false),
    }

    StructuralHash::from_sink(sink)
}
