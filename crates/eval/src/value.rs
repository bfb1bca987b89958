//! Value cells
//!
//! A [`Value`] is a shared heap cell whose state walks a one-way machine:
//!
//! ```text
//! Uninit -> Thunk -> Pending -> Forced(..) | Failed(..)
//!               \-> App  ----/
//! ```
//!
//! `Pending` is the blackhole: the cell has been claimed by a forcing in
//! progress. Encountering it from the same forcing chain means infinite
//! recursion; encountering it from another strand means "wait".
//!
//! The transition out of `Thunk` is an atomic claim under the cell's write
//! lock; every reader clones what it needs out of the guard and drops it
//! before recursing, so lock acquisition always follows the value graph
//! downward.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::accessor::AccessorRef;
use crate::env::Env;
use crate::error::EvalError;
use crate::expr::ExprRef;
use crate::pos::PosIdx;
use crate::symbol::{Symbol, SymbolTable};

pub type ValuePtr = Arc<Value>;

/// A string together with its dependency context.
///
/// Context entries are canonical strings naming the sources the string's
/// content was derived from; the set is ordered so hashing and
/// serialization are deterministic.
#[derive(Debug, Clone)]
pub struct StringValue {
    pub content: Arc<str>,
    pub context: Arc<BTreeSet<String>>,
}

impl StringValue {
    pub fn plain(content: impl Into<Arc<str>>) -> Self {
        StringValue {
            content: content.into(),
            context: Arc::new(BTreeSet::new()),
        }
    }

    pub fn with_context(content: impl Into<Arc<str>>, context: BTreeSet<String>) -> Self {
        StringValue {
            content: content.into(),
            context: Arc::new(context),
        }
    }

    pub fn has_context(&self) -> bool {
        !self.context.is_empty()
    }
}

/// One attribute in a record.
#[derive(Debug, Clone)]
pub struct Attr {
    pub name: Symbol,
    pub value: ValuePtr,
}

/// A record, sorted by attribute-name bytes at construction.
#[derive(Debug, Clone, Default)]
pub struct AttrSet {
    entries: Arc<Vec<Attr>>,
}

impl AttrSet {
    pub fn empty() -> Self {
        AttrSet::default()
    }

    /// Build a set from unsorted entries. Later duplicates win.
    pub fn build(symbols: &SymbolTable, mut entries: Vec<Attr>) -> Self {
        entries.sort_by(|a, b| symbols.resolve(a.name).cmp(&symbols.resolve(b.name)));
        entries.dedup_by(|later, earlier| {
            if later.name == earlier.name {
                earlier.value = later.value.clone();
                true
            } else {
                false
            }
        });
        AttrSet {
            entries: Arc::new(entries),
        }
    }

    pub fn get(&self, name: Symbol) -> Option<&ValuePtr> {
        self.entries
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Attr> {
        self.entries.iter()
    }
}

/// A builtin function.
pub struct PrimOp {
    pub name: &'static str,
    pub arity: usize,
    pub func: fn(&crate::eval::Evaluator, &[ValuePtr], PosIdx) -> Result<Forced, EvalError>,
}

impl std::fmt::Debug for PrimOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrimOp({})", self.name)
    }
}

/// An opaque value injected by the embedder. Hashed by pointer; never
/// portable, never serializable.
pub trait ExternalValue: Send + Sync {
    fn type_name(&self) -> &'static str;
}

impl std::fmt::Debug for dyn ExternalValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "External({})", self.type_name())
    }
}

/// A fully-forced value.
#[derive(Debug, Clone)]
pub enum Forced {
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
    Str(StringValue),
    Path {
        accessor: Option<AccessorRef>,
        path: String,
    },
    Attrs(AttrSet),
    List(Arc<Vec<ValuePtr>>),
    Lambda {
        env: Arc<Env>,
        /// The `Expr::Lambda` node this closure was built from.
        expr: ExprRef,
    },
    PrimOp(Arc<PrimOp>),
    PrimOpApp {
        op: Arc<PrimOp>,
        args: Vec<ValuePtr>,
    },
    External(Arc<dyn ExternalValue>),
}

impl Forced {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Forced::Int(_) => "an integer",
            Forced::Float(_) => "a float",
            Forced::Bool(_) => "a boolean",
            Forced::Null => "null",
            Forced::Str(_) => "a string",
            Forced::Path { .. } => "a path",
            Forced::Attrs(_) => "a set",
            Forced::List(_) => "a list",
            Forced::Lambda { .. } => "a function",
            Forced::PrimOp(_) | Forced::PrimOpApp { .. } => "a builtin function",
            Forced::External(_) => "an external value",
        }
    }
}

/// Cell state. See the module docs for the transition diagram.
#[derive(Debug, Clone)]
pub enum ValueState {
    Uninit,
    Thunk { env: Arc<Env>, expr: ExprRef },
    App { left: ValuePtr, right: ValuePtr },
    /// Blackhole: claimed by the strand identified by `owner`. The owner
    /// re-entering means infinite recursion; anyone else waits.
    Pending { owner: u64 },
    Forced(Forced),
    Failed(EvalError),
}

/// Identity of the current forcing strand (one per OS thread).
pub(crate) fn current_strand_id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT_STRAND_ID: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static STRAND_ID: u64 = NEXT_STRAND_ID.fetch_add(1, Ordering::Relaxed);
    }
    STRAND_ID.with(|id| *id)
}

#[derive(Debug)]
pub struct Value {
    state: RwLock<ValueState>,
}

impl Value {
    pub fn uninit() -> ValuePtr {
        Arc::new(Value {
            state: RwLock::new(ValueState::Uninit),
        })
    }

    pub fn thunk(env: Arc<Env>, expr: ExprRef) -> ValuePtr {
        Arc::new(Value {
            state: RwLock::new(ValueState::Thunk { env, expr }),
        })
    }

    pub fn app(left: ValuePtr, right: ValuePtr) -> ValuePtr {
        Arc::new(Value {
            state: RwLock::new(ValueState::App { left, right }),
        })
    }

    pub fn forced(f: Forced) -> ValuePtr {
        Arc::new(Value {
            state: RwLock::new(ValueState::Forced(f)),
        })
    }

    pub fn int(v: i64) -> ValuePtr {
        Value::forced(Forced::Int(v))
    }

    pub fn bool(v: bool) -> ValuePtr {
        Value::forced(Forced::Bool(v))
    }

    pub fn string(s: impl Into<Arc<str>>) -> ValuePtr {
        Value::forced(Forced::Str(StringValue::plain(s)))
    }

    /// Snapshot of the current state. Callers clone what they need and
    /// must not hold the snapshot across a recursion into child cells.
    pub fn state(&self) -> ValueState {
        self.state.read_recursive().clone()
    }

    /// Claim a thunk for forcing: atomically replace `Thunk` with
    /// `Pending` and hand the contents to the caller. Returns `None` if
    /// the cell is in any other state (someone else won, or it is already
    /// forced).
    pub fn claim_thunk(&self) -> Option<(Arc<Env>, ExprRef)> {
        let mut guard = self.state.write();
        if let ValueState::Thunk { env, expr } = &*guard {
            let taken = (env.clone(), expr.clone());
            *guard = ValueState::Pending {
                owner: current_strand_id(),
            };
            Some(taken)
        } else {
            None
        }
    }

    /// Undo a claim after a failed forcing, restoring the original thunk.
    pub fn restore_thunk(&self, env: Arc<Env>, expr: ExprRef) {
        *self.state.write() = ValueState::Thunk { env, expr };
    }

    pub fn set_forced(&self, f: Forced) {
        *self.state.write() = ValueState::Forced(f);
    }

    pub fn set_failed(&self, err: EvalError) {
        *self.state.write() = ValueState::Failed(err);
    }

    pub fn is_blackhole(&self) -> bool {
        matches!(&*self.state.read_recursive(), ValueState::Pending { .. })
    }

    pub fn is_uninit(&self) -> bool {
        matches!(&*self.state.read_recursive(), ValueState::Uninit)
    }

    /// True for states that still need forcing before the content is known.
    pub fn is_thunk_like(&self) -> bool {
        matches!(
            &*self.state.read_recursive(),
            ValueState::Thunk { .. } | ValueState::App { .. } | ValueState::Pending { .. }
        )
    }

    /// The forced content, if this cell has been forced.
    pub fn forced_ref(&self) -> Option<Forced> {
        match &*self.state.read_recursive() {
            ValueState::Forced(f) => Some(f.clone()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self.forced_ref()? {
            Forced::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.forced_ref()? {
            Forced::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_string(&self) -> Option<Arc<str>> {
        match self.forced_ref()? {
            Forced::Str(s) => Some(s.content),
            _ => None,
        }
    }

    pub fn as_attrs(&self) -> Option<AttrSet> {
        match self.forced_ref()? {
            Forced::Attrs(set) => Some(set),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<Arc<Vec<ValuePtr>>> {
        match self.forced_ref()? {
            Forced::List(l) => Some(l),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attrset_sorts_by_name_bytes() {
        let symbols = SymbolTable::new();
        let b = symbols.intern("b");
        let a = symbols.intern("a");
        let set = AttrSet::build(
            &symbols,
            vec![
                Attr {
                    name: b,
                    value: Value::int(2),
                },
                Attr {
                    name: a,
                    value: Value::int(1),
                },
            ],
        );
        let names: Vec<_> = set.iter().map(|e| symbols.resolve(e.name)).collect();
        assert_eq!(&*names[0], "a");
        assert_eq!(&*names[1], "b");
    }

    #[test]
    fn test_attrset_later_duplicate_wins() {
        let symbols = SymbolTable::new();
        let a = symbols.intern("a");
        let set = AttrSet::build(
            &symbols,
            vec![
                Attr {
                    name: a,
                    value: Value::int(1),
                },
                Attr {
                    name: a,
                    value: Value::int(2),
                },
            ],
        );
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(a).unwrap().as_int(), Some(2));
    }

    #[test]
    fn test_claim_is_exclusive() {
        let env = Env::root(0);
        let cell = Value::thunk(env.clone(), crate::expr::Expr::int(1));
        let first = cell.claim_thunk();
        assert!(first.is_some());
        assert!(cell.claim_thunk().is_none());
        assert!(cell.is_blackhole());

        let (env, expr) = first.unwrap();
        cell.restore_thunk(env, expr);
        assert!(cell.claim_thunk().is_some());
    }

    #[test]
    fn test_forced_accessors() {
        assert_eq!(Value::int(42).as_int(), Some(42));
        assert_eq!(Value::bool(true).as_bool(), Some(true));
        assert_eq!(Value::int(42).as_bool(), None);
    }
}
