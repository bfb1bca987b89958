//! Rill Eval: content-addressed hashing and thunk memoization
//!
//! The question this crate answers: given a thunk (an unevaluated
//! expression plus its captured environment), what is a stable, cross-run,
//! cross-machine fingerprint of the value it would produce? Forcing is
//! then memoized on that fingerprint, so a cache built during one
//! evaluation can serve later ones - on other machines too, when the
//! hashes involved are portable.
//!
//! # Layers
//!
//! - `expr` / `value` / `env`: the expression, value-cell, and
//!   environment-frame models the hashers walk
//! - `expr_hash`: alpha-equivalent structural hashing of expressions,
//!   pointer-cached
//! - `value_hash` / `env_hash`: content hashing of (possibly cyclic)
//!   value graphs and environment chains, cycles cut by back-references
//! - `thunk_hash`: the memoization key: expression hash + environment
//!   hash + try depth
//! - `memo` / `eval`: the concurrent cache and the forcing loop with its
//!   impurity, GC-cycle, and uncacheability gates
//! - `serialize` / `persist`: the persistent-cache boundary; only
//!   portable hashes cross it
//!
//! # Example
//!
//! ```
//! use rill_core::EvalInputs;
//! use rill_eval::{Evaluator, Expr, PosIdx, Value};
//!
//! let ev = Evaluator::new(EvalInputs::default());
//! let x = ev.symbols().intern("x");
//! // let x = 41; in x
//! let expr = Expr::let_in(
//!     rill_eval::ExprAttrs::new().attr(x, Expr::int(41)),
//!     Expr::var(x, 0, 0),
//! );
//! let cell = Value::thunk(ev.base_env(), expr);
//! ev.force(&cell, PosIdx::NONE).unwrap();
//! assert_eq!(cell.as_int(), Some(41));
//! ```

pub mod accessor;
pub mod env;
pub mod env_hash;
pub mod error;
pub mod eval;
pub mod expr;
pub mod expr_hash;
pub mod memo;
pub mod persist;
pub mod pos;
pub mod serialize;
pub mod signals;
pub mod stats;
pub mod symbol;
pub mod thunk_hash;
pub mod value;
pub mod value_hash;

pub use accessor::{AccessorRef, FsAccessor, PinnedAccessor, SourceAccessor};
pub use env::{Env, EnvKind};
pub use env_hash::{MAX_REASONABLE_ENV_SIZE, hash_env, hash_env_with_portability};
pub use error::EvalError;
pub use eval::{EvalCounters, Evaluator, ImpureReason};
pub use expr::{
    AttrKind, AttrName, BinOp, Expr, ExprAttrs, ExprLambda, ExprRef, ExprVar, Formal, Formals,
    VarBinding,
};
pub use expr_hash::{ExprHashCache, hash_expr, hash_expr_opt, hash_expr_with_portability};
pub use memo::{MemoEntry, ThunkMemoCache};
pub use persist::{CacheStore, MemoryStore, PersistentCache, PersistError};
pub use pos::{Pos, PosIdx, PosTable};
pub use serialize::{SerializeError, SerializeTag, deserialize_value, serialize_value};
pub use stats::EvalStats;
pub use symbol::{Symbol, SymbolTable};
pub use thunk_hash::compute_thunk_hash;
pub use value::{
    Attr, AttrSet, ExternalValue, Forced, PrimOp, StringValue, Value, ValuePtr, ValueState,
};
pub use value_hash::{ValueHashCache, hash_value, hash_value_with_portability};

// Re-export the foundation crate's types: everything above speaks them.
pub use rill_core::{
    ContentHash, ContentHashResult, EvalInputs, HashAlgorithm, HashDigest, HashResult, Portability,
    StructuralHash, StructuralHashResult,
};
