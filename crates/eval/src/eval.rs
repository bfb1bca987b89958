//! The evaluator: forcing with thunk memoization
//!
//! [`Evaluator::force`] is the hot path this whole subsystem exists for.
//! Before reducing a thunk it computes the thunk's structural hash and
//! consults the memo cache; after reducing it decides whether the result
//! may be cached. Three gates guard correctness:
//!
//! - **Impurity**: the impurity token is sampled before and after the
//!   reduction. Any observable side effect (trace output, clock read, env
//!   read) bumps the token, and a changed token vetoes caching so the
//!   effect happens again on the next force.
//! - **GC cycle**: entries record the GC cycle they were inserted in. A
//!   hit from an older cycle is stale (cell identities may have been
//!   recycled) and is treated as a miss; the next insert overwrites it.
//! - **Shallow uncacheability**: paths, and values whose immediate
//!   children are still thunks or paths, are skipped. The check is
//!   deliberately shallow: nested thunks get their own cache entries when
//!   they are forced later.
//!
//! The reducer itself is a compact structural interpreter, just enough
//! semantics to drive the force path; it is not a complete front end.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use rill_core::{Counter, EvalInputs, StructuralHash};

use crate::env::{Env, EnvKind};
use crate::error::EvalError;
use crate::expr::{AttrName, BinOp, Expr, ExprAttrs, ExprLambda, ExprRef, ExprVar, VarBinding};
use crate::expr_hash::ExprHashCache;
use crate::memo::{MemoEntry, ThunkMemoCache};
use crate::pos::{PosIdx, PosTable};
use crate::symbol::SymbolTable;
use crate::thunk_hash::compute_thunk_hash;
use crate::value::{
    Attr, AttrSet, Forced, PrimOp, StringValue, Value, ValuePtr, ValueState, current_strand_id,
};

/// Why the impurity token was bumped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImpureReason {
    Trace,
    Warn,
    Break,
    Clock,
    EnvRead,
    FileRead,
    RawPath,
}

impl std::fmt::Display for ImpureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ImpureReason::Trace => "trace",
            ImpureReason::Warn => "warn",
            ImpureReason::Break => "break",
            ImpureReason::Clock => "clock",
            ImpureReason::EnvRead => "env-read",
            ImpureReason::FileRead => "file-read",
            ImpureReason::RawPath => "raw-path",
        };
        f.write_str(name)
    }
}

/// Force-path counters.
#[derive(Default)]
pub struct EvalCounters {
    /// Fresh cache hits (current GC cycle).
    pub hits: Counter,
    /// Entries found but from an older GC cycle.
    pub stale_hits: Counter,
    /// Reductions whose results were inserted.
    pub misses: Counter,
    /// Reductions skipped from caching because the impurity token moved.
    pub impure_skips: Counter,
    /// Reductions skipped because the value was shallowly uncacheable.
    pub lazy_skips: Counter,
}

/// True if a freshly-forced value must not be cached.
///
/// Paths are context-dependent (their accessor belongs to one source
/// tree); values with immediate thunk/app/path children may still have
/// pending effects. Only immediate children are inspected; the transitive
/// closure is covered because child thunks are memoized on their own when
/// forced.
fn value_is_shallow_uncacheable(forced: &Forced) -> bool {
    fn child_blocks_caching(child: &ValuePtr) -> bool {
        if child.is_thunk_like() {
            return true;
        }
        matches!(child.forced_ref(), Some(Forced::Path { .. }))
    }

    match forced {
        Forced::Path { .. } => true,
        Forced::List(elems) => elems.iter().any(child_blocks_caching),
        Forced::Attrs(set) => set.iter().any(|attr| child_blocks_caching(&attr.value)),
        _ => false,
    }
}

fn cooperative_yield() {
    if may::coroutine::is_coroutine() {
        may::coroutine::yield_now();
    } else {
        std::thread::yield_now();
    }
}

pub struct Evaluator {
    inputs: EvalInputs,
    symbols: SymbolTable,
    positions: PosTable,
    expr_cache: ExprHashCache,
    memo: ThunkMemoCache,
    counters: EvalCounters,
    impurity: AtomicU64,
    gc_cycle: AtomicU64,
    try_depth: AtomicU32,
    interrupt: Arc<AtomicBool>,
}

impl Evaluator {
    pub fn new(inputs: EvalInputs) -> Self {
        Evaluator {
            inputs,
            symbols: SymbolTable::new(),
            positions: PosTable::new(),
            expr_cache: ExprHashCache::new(),
            memo: ThunkMemoCache::new(),
            counters: EvalCounters::default(),
            impurity: AtomicU64::new(0),
            gc_cycle: AtomicU64::new(0),
            try_depth: AtomicU32::new(0),
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn inputs(&self) -> &EvalInputs {
        &self.inputs
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    pub fn positions(&self) -> &PosTable {
        &self.positions
    }

    pub fn expr_cache(&self) -> &ExprHashCache {
        &self.expr_cache
    }

    pub fn memo_cache(&self) -> &ThunkMemoCache {
        &self.memo
    }

    pub fn counters(&self) -> &EvalCounters {
        &self.counters
    }

    /// Current value of the impurity token.
    pub fn impurity_token(&self) -> u64 {
        self.impurity.load(Ordering::Acquire)
    }

    /// Record that an observable side effect happened.
    pub fn mark_impure(&self, reason: ImpureReason) {
        self.impurity.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(%reason, "impure operation during evaluation");
    }

    pub fn current_gc_cycle(&self) -> u64 {
        self.gc_cycle.load(Ordering::Acquire)
    }

    /// Called by the embedder after it reclaims value cells. Logically
    /// invalidates every existing memo entry.
    pub fn advance_gc_cycle(&self) -> u64 {
        let cycle = self.gc_cycle.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::debug!(cycle, "GC cycle advanced, memo entries invalidated");
        cycle
    }

    pub fn try_depth(&self) -> u32 {
        self.try_depth.load(Ordering::Acquire)
    }

    fn enter_try(&self) {
        self.try_depth.fetch_add(1, Ordering::AcqRel);
    }

    fn exit_try(&self) {
        self.try_depth.fetch_sub(1, Ordering::AcqRel);
    }

    /// Shared interrupt flag; expose it to signal handlers.
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }

    pub fn request_interrupt(&self) {
        self.interrupt.store(true, Ordering::Release);
    }

    pub fn clear_interrupt(&self) {
        self.interrupt.store(false, Ordering::Release);
    }

    pub fn check_interrupt(&self) -> Result<(), EvalError> {
        if self.interrupt.load(Ordering::Acquire) {
            Err(EvalError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// The memoization key of a thunk at the current try depth.
    pub fn thunk_hash(&self, expr: &ExprRef, env: Option<&Arc<Env>>) -> StructuralHash {
        compute_thunk_hash(
            expr,
            env,
            self.try_depth() as i32,
            &self.symbols,
            Some(&self.expr_cache),
            None,
        )
    }

    /// Force a value cell to weak head normal form.
    pub fn force(&self, v: &ValuePtr, pos: PosIdx) -> Result<(), EvalError> {
        loop {
            self.check_interrupt()?;

            match v.state() {
                ValueState::Forced(_) => return Ok(()),
                ValueState::Failed(err) => return Err(err),
                ValueState::Uninit => return Err(EvalError::InfiniteRecursion { pos }),
                ValueState::Pending { owner } => {
                    if owner == current_strand_id() {
                        return Err(EvalError::InfiniteRecursion { pos });
                    }
                    // Another strand claimed this thunk; wait for it.
                    cooperative_yield();
                }
                ValueState::App { left, right } => {
                    let forced = self.call_function(&left, &right, pos)?;
                    v.set_forced(forced);
                    return Ok(());
                }
                ValueState::Thunk { env, expr } => {
                    let hash = self.thunk_hash(&expr, Some(&env));

                    let mut hit = None;
                    let mut stale = false;
                    self.memo.visit(&hash, |entry| {
                        if entry.gc_cycle == self.current_gc_cycle() {
                            hit = entry.value.forced_ref();
                        } else {
                            stale = true;
                        }
                    });
                    if let Some(forced) = hit {
                        self.counters.hits.bump();
                        tracing::trace!(hash = %hash, "thunk memo hit");
                        v.set_forced(forced);
                        return Ok(());
                    }
                    if stale {
                        self.counters.stale_hits.bump();
                    }

                    // Claim the cell; a lost race loops back to the top
                    // and sees whatever the winner left behind.
                    let Some((env, expr)) = v.claim_thunk() else {
                        continue;
                    };

                    let token_before = self.impurity_token();
                    match self.eval_expr(&expr, &env, pos) {
                        Ok(forced) => {
                            if self.impurity_token() != token_before {
                                self.counters.impure_skips.bump();
                                tracing::trace!(hash = %hash, "skip caching: impure");
                            } else if value_is_shallow_uncacheable(&forced) {
                                self.counters.lazy_skips.bump();
                                tracing::trace!(hash = %hash, "skip caching: uncacheable value");
                            } else {
                                self.counters.misses.bump();
                                // Copy into a dedicated cell: `v` may be
                                // re-thunked or recycled by the embedder.
                                let store = Value::forced(forced.clone());
                                self.memo.insert_or_assign(
                                    hash,
                                    MemoEntry {
                                        value: store,
                                        gc_cycle: self.current_gc_cycle(),
                                    },
                                );
                            }
                            v.set_forced(forced);
                            return Ok(());
                        }
                        Err(err) => {
                            v.restore_thunk(env, expr);
                            let err = match err {
                                EvalError::InfiniteRecursion { pos: p } if p.is_none() => {
                                    EvalError::InfiniteRecursion { pos }
                                }
                                other => other,
                            };
                            return Err(err);
                        }
                    }
                }
            }
        }
    }

    /// Force and hand back the forced content.
    pub fn force_to(&self, v: &ValuePtr, pos: PosIdx) -> Result<Forced, EvalError> {
        self.force(v, pos)?;
        match v.forced_ref() {
            Some(forced) => Ok(forced),
            // Only reachable if the embedder re-thunked the cell from
            // another strand mid-call.
            None => Err(EvalError::InfiniteRecursion { pos }),
        }
    }

    fn force_attrs(&self, v: &ValuePtr, pos: PosIdx) -> Result<AttrSet, EvalError> {
        match self.force_to(v, pos)? {
            Forced::Attrs(set) => Ok(set),
            other => Err(EvalError::type_error("a set", other.kind_name(), pos)),
        }
    }

    fn force_bool(&self, v: &ValuePtr, pos: PosIdx) -> Result<bool, EvalError> {
        match self.force_to(v, pos)? {
            Forced::Bool(b) => Ok(b),
            other => Err(EvalError::type_error("a boolean", other.kind_name(), pos)),
        }
    }

    fn force_string(&self, v: &ValuePtr, pos: PosIdx) -> Result<StringValue, EvalError> {
        match self.force_to(v, pos)? {
            Forced::Str(s) => Ok(s),
            other => Err(EvalError::type_error("a string", other.kind_name(), pos)),
        }
    }

    fn force_list(&self, v: &ValuePtr, pos: PosIdx) -> Result<Arc<Vec<ValuePtr>>, EvalError> {
        match self.force_to(v, pos)? {
            Forced::List(l) => Ok(l),
            other => Err(EvalError::type_error("a list", other.kind_name(), pos)),
        }
    }

    /// Wrap an expression for lazy evaluation, but skip the thunk when the
    /// value is immediate: literals evaluate now, and lexical variables
    /// share the cell they resolve to.
    pub fn maybe_thunk(&self, expr: &ExprRef, env: &Arc<Env>) -> ValuePtr {
        match &**expr {
            Expr::Int(n) => Value::int(*n),
            Expr::Float(x) => Value::forced(Forced::Float(*x)),
            Expr::Str(s) => Value::string(s.as_str()),
            Expr::Path { accessor, path } => Value::forced(Forced::Path {
                accessor: accessor.clone(),
                path: path.clone(),
            }),
            Expr::Var(ExprVar {
                binding: VarBinding::Lexical { level, displ },
                ..
            }) => match env
                .ancestor(*level)
                .and_then(|frame| frame.slot(*displ as usize).cloned())
            {
                Some(cell) => cell,
                None => Value::thunk(env.clone(), expr.clone()),
            },
            _ => Value::thunk(env.clone(), expr.clone()),
        }
    }

    fn lookup_var(
        &self,
        var: &ExprVar,
        env: &Arc<Env>,
        pos: PosIdx,
    ) -> Result<ValuePtr, EvalError> {
        let undefined = || EvalError::UndefinedVariable {
            name: self.symbols.resolve(var.name).to_string(),
            pos,
        };
        match var.binding {
            VarBinding::Lexical { level, displ } => env
                .ancestor(level)
                .and_then(|frame| frame.slot(displ as usize).cloned())
                .ok_or_else(undefined),
            VarBinding::FromWith { level, .. } => {
                // Search the enclosing `with` scopes, innermost first.
                let mut frame = env.ancestor(level);
                while let Some(cur) = frame {
                    if cur.kind() == EnvKind::With {
                        if let Some(attrs_cell) = cur.slot(0) {
                            let set = self.force_attrs(attrs_cell, pos)?;
                            if let Some(found) = set.get(var.name) {
                                return Ok(found.clone());
                            }
                        }
                    }
                    frame = cur.up().cloned();
                }
                Err(undefined())
            }
        }
    }

    /// Allocate the frame of a recursive scope (`rec { .. }`, `let`) and
    /// fill it with thunks that capture the frame itself.
    fn recursive_frame(&self, attrs: &ExprAttrs, env: &Arc<Env>) -> Arc<Env> {
        let frame = Env::new(Some(env.clone()), attrs.attrs.len());
        for (displ, attr) in attrs.attrs.iter().enumerate() {
            frame.set_slot(displ, self.maybe_thunk(&attr.expr, &frame));
        }
        frame
    }

    fn eval_attrs(
        &self,
        attrs: &ExprAttrs,
        env: &Arc<Env>,
        pos: PosIdx,
    ) -> Result<Forced, EvalError> {
        let mut entries = Vec::with_capacity(attrs.attrs.len() + attrs.dynamic_attrs.len());

        let value_env = if attrs.recursive {
            let frame = self.recursive_frame(attrs, env);
            for (displ, attr) in attrs.attrs.iter().enumerate() {
                if let Some(cell) = frame.slot(displ) {
                    entries.push(Attr {
                        name: attr.name,
                        value: cell.clone(),
                    });
                }
            }
            frame
        } else {
            for attr in &attrs.attrs {
                entries.push(Attr {
                    name: attr.name,
                    value: self.maybe_thunk(&attr.expr, env),
                });
            }
            env.clone()
        };

        // Dynamic attributes: the name is computed, the value stays lazy.
        for dyn_attr in &attrs.dynamic_attrs {
            let name_cell = self.maybe_thunk(&dyn_attr.name_expr, &value_env);
            let name = self.force_string(&name_cell, pos)?;
            let sym = self.symbols.intern(&name.content);
            if entries.iter().any(|a| a.name == sym) {
                return Err(EvalError::Thrown {
                    message: format!("dynamic attribute '{}' already defined", name.content),
                    pos,
                });
            }
            entries.push(Attr {
                name: sym,
                value: self.maybe_thunk(&dyn_attr.value_expr, &value_env),
            });
        }

        Ok(Forced::Attrs(AttrSet::build(&self.symbols, entries)))
    }

    fn select_step(
        &self,
        set: &AttrSet,
        step: &AttrName,
        env: &Arc<Env>,
        pos: PosIdx,
    ) -> Result<Option<ValuePtr>, EvalError> {
        let sym = match step {
            AttrName::Static(sym) => *sym,
            AttrName::Dynamic(name_expr) => {
                let cell = self.maybe_thunk(name_expr, env);
                let name = self.force_string(&cell, pos)?;
                self.symbols.intern(&name.content)
            }
        };
        Ok(set.get(sym).cloned())
    }

    fn eval_concat_strings(
        &self,
        parts: &[ExprRef],
        env: &Arc<Env>,
        pos: PosIdx,
    ) -> Result<Forced, EvalError> {
        let mut content = String::new();
        let mut context = BTreeSet::new();
        for part in parts {
            let cell = self.maybe_thunk(part, env);
            match self.force_to(&cell, pos)? {
                Forced::Str(s) => {
                    content.push_str(&s.content);
                    context.extend(s.context.iter().cloned());
                }
                Forced::Path { path, .. } => content.push_str(&path),
                other => {
                    return Err(EvalError::type_error("a string", other.kind_name(), pos));
                }
            }
        }
        Ok(Forced::Str(StringValue::with_context(content, context)))
    }

    /// Structural equality; forces both sides as deep as the comparison
    /// needs. Functions never compare equal (unless they are the same
    /// cell).
    pub fn eq_values(&self, a: &ValuePtr, b: &ValuePtr, pos: PosIdx) -> Result<bool, EvalError> {
        if ValuePtr::ptr_eq(a, b) {
            self.force(a, pos)?;
            return Ok(true);
        }
        let lhs = self.force_to(a, pos)?;
        let rhs = self.force_to(b, pos)?;
        let eq = match (&lhs, &rhs) {
            (Forced::Int(x), Forced::Int(y)) => x == y,
            (Forced::Float(x), Forced::Float(y)) => x == y,
            (Forced::Int(x), Forced::Float(y)) | (Forced::Float(y), Forced::Int(x)) => {
                (*x as f64) == *y
            }
            (Forced::Bool(x), Forced::Bool(y)) => x == y,
            (Forced::Null, Forced::Null) => true,
            (Forced::Str(x), Forced::Str(y)) => x.content == y.content,
            (
                Forced::Path {
                    accessor: ax,
                    path: px,
                },
                Forced::Path {
                    accessor: ay,
                    path: py,
                },
            ) => {
                let same_accessor = match (ax, ay) {
                    (Some(x), Some(y)) => Arc::ptr_eq(x, y),
                    (None, None) => true,
                    _ => false,
                };
                same_accessor && px == py
            }
            (Forced::List(xs), Forced::List(ys)) => {
                if xs.len() != ys.len() {
                    false
                } else {
                    for (x, y) in xs.iter().zip(ys.iter()) {
                        if !self.eq_values(x, y, pos)? {
                            return Ok(false);
                        }
                    }
                    true
                }
            }
            (Forced::Attrs(xs), Forced::Attrs(ys)) => {
                if xs.len() != ys.len() {
                    false
                } else {
                    for (x, y) in xs.iter().zip(ys.iter()) {
                        if x.name != y.name || !self.eq_values(&x.value, &y.value, pos)? {
                            return Ok(false);
                        }
                    }
                    true
                }
            }
            _ => false,
        };
        Ok(eq)
    }

    fn apply(&self, fun: Forced, arg: ValuePtr, pos: PosIdx) -> Result<Forced, EvalError> {
        match fun {
            Forced::Lambda { env, expr } => {
                let Expr::Lambda(lambda) = &*expr else {
                    return Err(EvalError::BadApplication {
                        message: "closure does not wrap a function".into(),
                        pos,
                    });
                };
                self.apply_lambda(lambda, &env, arg, pos)
            }
            Forced::PrimOp(op) => {
                if op.arity <= 1 {
                    (op.func)(self, &[arg], pos)
                } else {
                    Ok(Forced::PrimOpApp {
                        op,
                        args: vec![arg],
                    })
                }
            }
            Forced::PrimOpApp { op, mut args } => {
                args.push(arg);
                if args.len() >= op.arity {
                    (op.func)(self, &args, pos)
                } else {
                    Ok(Forced::PrimOpApp { op, args })
                }
            }
            other => Err(EvalError::type_error("a function", other.kind_name(), pos)),
        }
    }

    fn apply_lambda(
        &self,
        lambda: &ExprLambda,
        captured: &Arc<Env>,
        arg: ValuePtr,
        pos: PosIdx,
    ) -> Result<Forced, EvalError> {
        let frame = Env::new(Some(captured.clone()), lambda.env_size());
        let formals_base = usize::from(lambda.arg.is_some());
        if lambda.arg.is_some() {
            frame.set_slot(0, arg.clone());
        }

        if let Some(formals) = &lambda.formals {
            let set = self.force_attrs(&arg, pos)?;

            for (i, formal) in formals.formals.iter().enumerate() {
                match set.get(formal.name) {
                    Some(cell) => {
                        frame.set_slot(formals_base + i, cell.clone());
                    }
                    None => match &formal.default {
                        Some(default) => {
                            frame.set_slot(formals_base + i, self.maybe_thunk(default, &frame));
                        }
                        None => {
                            return Err(EvalError::BadApplication {
                                message: format!(
                                    "function called without required argument '{}'",
                                    self.symbols.resolve(formal.name)
                                ),
                                pos,
                            });
                        }
                    },
                }
            }

            if !formals.ellipsis {
                for attr in set.iter() {
                    if !formals.formals.iter().any(|f| f.name == attr.name) {
                        return Err(EvalError::BadApplication {
                            message: format!(
                                "function called with unexpected argument '{}'",
                                self.symbols.resolve(attr.name)
                            ),
                            pos,
                        });
                    }
                }
            }
        }

        self.eval_expr(&lambda.body, &frame, pos)
    }

    /// Apply `left` to `right`, forcing `left` first.
    pub fn call_function(
        &self,
        left: &ValuePtr,
        right: &ValuePtr,
        pos: PosIdx,
    ) -> Result<Forced, EvalError> {
        let fun = self.force_to(left, pos)?;
        self.apply(fun, right.clone(), pos)
    }

    /// Reduce an expression to a forced value. This is what a claimed
    /// thunk runs; the caller decides what happens to the result.
    pub fn eval_expr(
        &self,
        expr: &ExprRef,
        env: &Arc<Env>,
        pos: PosIdx,
    ) -> Result<Forced, EvalError> {
        match &**expr {
            Expr::Int(n) => Ok(Forced::Int(*n)),
            Expr::Float(x) => Ok(Forced::Float(*x)),
            Expr::Str(s) => Ok(Forced::Str(StringValue::plain(s.as_str()))),
            Expr::Path { accessor, path } => Ok(Forced::Path {
                accessor: accessor.clone(),
                path: path.clone(),
            }),
            Expr::Var(var) => {
                let cell = self.lookup_var(var, env, pos)?;
                self.force_to(&cell, pos)
            }
            Expr::InheritFrom { level, displ } => {
                let cell = env
                    .ancestor(*level)
                    .and_then(|frame| frame.slot(*displ as usize).cloned())
                    .ok_or_else(|| EvalError::UndefinedVariable {
                        name: "<inherit source>".into(),
                        pos,
                    })?;
                self.force_to(&cell, pos)
            }
            Expr::Select {
                base,
                path,
                default,
            } => {
                let base_cell = self.maybe_thunk(base, env);
                let mut current = base_cell;
                for step in path {
                    let set = match (self.force_to(&current, pos)?, default) {
                        (Forced::Attrs(set), _) => set,
                        (_, Some(def)) => return self.eval_expr(def, env, pos),
                        (other, None) => {
                            return Err(EvalError::type_error("a set", other.kind_name(), pos));
                        }
                    };
                    match self.select_step(&set, step, env, pos)? {
                        Some(next) => current = next,
                        None => {
                            return match default {
                                Some(def) => self.eval_expr(def, env, pos),
                                None => Err(EvalError::MissingAttribute {
                                    name: self.attr_name_for_error(step),
                                    pos,
                                }),
                            };
                        }
                    }
                }
                self.force_to(&current, pos)
            }
            Expr::HasAttr { base, path } => {
                let mut current = self.maybe_thunk(base, env);
                for step in path {
                    let set = match self.force_to(&current, pos)? {
                        Forced::Attrs(set) => set,
                        _ => return Ok(Forced::Bool(false)),
                    };
                    match self.select_step(&set, step, env, pos)? {
                        Some(next) => current = next,
                        None => return Ok(Forced::Bool(false)),
                    }
                }
                Ok(Forced::Bool(true))
            }
            Expr::Attrs(attrs) => self.eval_attrs(attrs, env, pos),
            Expr::List(elems) => Ok(Forced::List(Arc::new(
                elems.iter().map(|e| self.maybe_thunk(e, env)).collect(),
            ))),
            Expr::Lambda(_) => Ok(Forced::Lambda {
                env: env.clone(),
                expr: expr.clone(),
            }),
            Expr::Call { fun, args } => {
                let mut current = self.eval_expr(fun, env, pos)?;
                for arg in args {
                    let arg_cell = self.maybe_thunk(arg, env);
                    current = self.apply(current, arg_cell, pos)?;
                }
                Ok(current)
            }
            Expr::Let { attrs, body } => {
                let Expr::Attrs(bindings) = &**attrs else {
                    return Err(EvalError::BadApplication {
                        message: "malformed let bindings".into(),
                        pos,
                    });
                };
                let frame = self.recursive_frame(bindings, env);
                self.eval_expr(body, &frame, pos)
            }
            Expr::With { attrs, body } => {
                let attrs_cell = self.maybe_thunk(attrs, env);
                let scope = Env::with_scope(env.clone(), attrs_cell);
                self.eval_expr(body, &scope, pos)
            }
            Expr::If { cond, then, els } => {
                let cell = self.maybe_thunk(cond, env);
                if self.force_bool(&cell, pos)? {
                    self.eval_expr(then, env, pos)
                } else {
                    self.eval_expr(els, env, pos)
                }
            }
            Expr::Assert { cond, body } => {
                let cell = self.maybe_thunk(cond, env);
                if !self.force_bool(&cell, pos)? {
                    return Err(EvalError::AssertionFailed { pos });
                }
                self.eval_expr(body, env, pos)
            }
            Expr::Not(sub) => {
                let cell = self.maybe_thunk(sub, env);
                Ok(Forced::Bool(!self.force_bool(&cell, pos)?))
            }
            Expr::Op { op, lhs, rhs } => self.eval_bin_op(*op, lhs, rhs, env, pos),
            Expr::ConcatStrings { parts, .. } => self.eval_concat_strings(parts, env, pos),
            Expr::CurPos(p) => Ok(self.cur_pos_value(*p)),
            Expr::BlackHole => Err(EvalError::InfiniteRecursion { pos }),
        }
    }

    fn eval_bin_op(
        &self,
        op: BinOp,
        lhs: &ExprRef,
        rhs: &ExprRef,
        env: &Arc<Env>,
        pos: PosIdx,
    ) -> Result<Forced, EvalError> {
        match op {
            BinOp::Eq | BinOp::Neq => {
                let a = self.maybe_thunk(lhs, env);
                let b = self.maybe_thunk(rhs, env);
                let eq = self.eq_values(&a, &b, pos)?;
                Ok(Forced::Bool(if op == BinOp::Eq { eq } else { !eq }))
            }
            BinOp::And => {
                let a = self.maybe_thunk(lhs, env);
                if !self.force_bool(&a, pos)? {
                    return Ok(Forced::Bool(false));
                }
                let b = self.maybe_thunk(rhs, env);
                Ok(Forced::Bool(self.force_bool(&b, pos)?))
            }
            BinOp::Or => {
                let a = self.maybe_thunk(lhs, env);
                if self.force_bool(&a, pos)? {
                    return Ok(Forced::Bool(true));
                }
                let b = self.maybe_thunk(rhs, env);
                Ok(Forced::Bool(self.force_bool(&b, pos)?))
            }
            BinOp::Impl => {
                let a = self.maybe_thunk(lhs, env);
                if !self.force_bool(&a, pos)? {
                    return Ok(Forced::Bool(true));
                }
                let b = self.maybe_thunk(rhs, env);
                Ok(Forced::Bool(self.force_bool(&b, pos)?))
            }
            BinOp::Update => {
                let a = self.maybe_thunk(lhs, env);
                let b = self.maybe_thunk(rhs, env);
                let left = self.force_attrs(&a, pos)?;
                let right = self.force_attrs(&b, pos)?;
                let mut entries: Vec<Attr> = left.iter().cloned().collect();
                entries.extend(right.iter().cloned());
                Ok(Forced::Attrs(AttrSet::build(&self.symbols, entries)))
            }
            BinOp::ConcatLists => {
                let a = self.maybe_thunk(lhs, env);
                let b = self.maybe_thunk(rhs, env);
                let left = self.force_list(&a, pos)?;
                let right = self.force_list(&b, pos)?;
                let mut elems = Vec::with_capacity(left.len() + right.len());
                elems.extend(left.iter().cloned());
                elems.extend(right.iter().cloned());
                Ok(Forced::List(Arc::new(elems)))
            }
        }
    }

    fn attr_name_for_error(&self, step: &AttrName) -> String {
        match step {
            AttrName::Static(sym) => self.symbols.resolve(*sym).to_string(),
            AttrName::Dynamic(_) => "<dynamic>".to_string(),
        }
    }

    fn cur_pos_value(&self, pos: PosIdx) -> Forced {
        match self.positions.lookup(pos) {
            Some(resolved) => {
                let entries = vec![
                    Attr {
                        name: self.symbols.intern("file"),
                        value: Value::string(resolved.file.as_str()),
                    },
                    Attr {
                        name: self.symbols.intern("line"),
                        value: Value::int(i64::from(resolved.line)),
                    },
                    Attr {
                        name: self.symbols.intern("column"),
                        value: Value::int(i64::from(resolved.column)),
                    },
                ];
                Forced::Attrs(AttrSet::build(&self.symbols, entries))
            }
            None => Forced::Null,
        }
    }

    /// A root environment whose slot 0 holds the builtins record.
    pub fn base_env(&self) -> Arc<Env> {
        let env = Env::root(1);
        env.set_slot(0, Value::forced(Forced::Attrs(self.builtins())));
        env
    }

    /// The builtin record: the small set of primops the force path's
    /// correctness gates depend on.
    pub fn builtins(&self) -> AttrSet {
        let prim = |name: &'static str,
                    arity: usize,
                    func: fn(&Evaluator, &[ValuePtr], PosIdx) -> Result<Forced, EvalError>| {
            Attr {
                name: self.symbols.intern(name),
                value: Value::forced(Forced::PrimOp(Arc::new(PrimOp { name, arity, func }))),
            }
        };
        AttrSet::build(
            &self.symbols,
            vec![
                prim("trace", 2, prim_trace),
                prim("warn", 2, prim_warn),
                prim("tryEval", 1, prim_try_eval),
                prim("getEnv", 1, prim_get_env),
                prim("currentTime", 1, prim_current_time),
                prim("abort", 1, prim_abort),
                prim("seq", 2, prim_seq),
            ],
        )
    }

    fn message_string(&self, forced: &Forced) -> String {
        match forced {
            Forced::Str(s) => s.content.to_string(),
            Forced::Int(n) => n.to_string(),
            Forced::Float(x) => x.to_string(),
            Forced::Bool(b) => b.to_string(),
            Forced::Null => "null".to_string(),
            other => other.kind_name().to_string(),
        }
    }

    fn attrs_pair(&self, success: bool, value: ValuePtr) -> Forced {
        let entries = vec![
            Attr {
                name: self.symbols.intern("success"),
                value: Value::bool(success),
            },
            Attr {
                name: self.symbols.intern("value"),
                value,
            },
        ];
        Forced::Attrs(AttrSet::build(&self.symbols, entries))
    }
}

fn prim_trace(ev: &Evaluator, args: &[ValuePtr], pos: PosIdx) -> Result<Forced, EvalError> {
    let msg = ev.force_to(&args[0], pos)?;
    eprintln!("trace: {}", ev.message_string(&msg));
    ev.mark_impure(ImpureReason::Trace);
    ev.force_to(&args[1], pos)
}

fn prim_warn(ev: &Evaluator, args: &[ValuePtr], pos: PosIdx) -> Result<Forced, EvalError> {
    let msg = ev.force_to(&args[0], pos)?;
    eprintln!("warning: {}", ev.message_string(&msg));
    ev.mark_impure(ImpureReason::Warn);
    ev.force_to(&args[1], pos)
}

fn prim_try_eval(ev: &Evaluator, args: &[ValuePtr], pos: PosIdx) -> Result<Forced, EvalError> {
    ev.enter_try();
    let result = ev.force(&args[0], pos);
    ev.exit_try();
    match result {
        Ok(()) => Ok(ev.attrs_pair(true, args[0].clone())),
        Err(EvalError::Thrown { .. }) | Err(EvalError::AssertionFailed { .. }) => {
            Ok(ev.attrs_pair(false, Value::bool(false)))
        }
        Err(other) => Err(other),
    }
}

fn prim_get_env(ev: &Evaluator, args: &[ValuePtr], pos: PosIdx) -> Result<Forced, EvalError> {
    let name = match ev.force_to(&args[0], pos)? {
        Forced::Str(s) => s,
        other => return Err(EvalError::type_error("a string", other.kind_name(), pos)),
    };
    ev.mark_impure(ImpureReason::EnvRead);
    let value = std::env::var(&*name.content).unwrap_or_default();
    Ok(Forced::Str(StringValue::plain(value)))
}

fn prim_current_time(ev: &Evaluator, args: &[ValuePtr], pos: PosIdx) -> Result<Forced, EvalError> {
    ev.force(&args[0], pos)?;
    ev.mark_impure(ImpureReason::Clock);
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    Ok(Forced::Int(now))
}

fn prim_abort(ev: &Evaluator, args: &[ValuePtr], pos: PosIdx) -> Result<Forced, EvalError> {
    let msg = ev.force_to(&args[0], pos)?;
    Err(EvalError::Thrown {
        message: ev.message_string(&msg),
        pos,
    })
}

fn prim_seq(ev: &Evaluator, args: &[ValuePtr], pos: PosIdx) -> Result<Forced, EvalError> {
    ev.force(&args[0], pos)?;
    ev.force_to(&args[1], pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evaluator() -> Evaluator {
        Evaluator::new(EvalInputs::default())
    }

    fn force_expr(ev: &Evaluator, expr: ExprRef) -> Result<ValuePtr, EvalError> {
        let cell = Value::thunk(ev.base_env(), expr);
        ev.force(&cell, PosIdx::NONE)?;
        Ok(cell)
    }

    #[test]
    fn test_literals_force_to_themselves() {
        let ev = evaluator();
        assert_eq!(force_expr(&ev, Expr::int(42)).unwrap().as_int(), Some(42));
        assert_eq!(
            force_expr(&ev, Expr::string("hi")).unwrap().as_string().as_deref(),
            Some("hi")
        );
    }

    #[test]
    fn test_let_and_var() {
        let ev = evaluator();
        let x = ev.symbols().intern("x");
        // let x = 40; in x
        let expr = Expr::let_in(
            ExprAttrs::new().attr(x, Expr::int(40)),
            Expr::var(x, 0, 0),
        );
        assert_eq!(force_expr(&ev, expr).unwrap().as_int(), Some(40));
    }

    #[test]
    fn test_lambda_application() {
        let ev = evaluator();
        let x = ev.symbols().intern("x");
        // (x: x) 7
        let expr = Expr::call(Expr::lambda(x, Expr::var(x, 0, 0)), vec![Expr::int(7)]);
        assert_eq!(force_expr(&ev, expr).unwrap().as_int(), Some(7));
    }

    #[test]
    fn test_formals_defaults_and_ellipsis() {
        let ev = evaluator();
        let syms = ev.symbols();
        let a = syms.intern("a");
        let b = syms.intern("b");
        let extra = syms.intern("extra");

        // ({ a, b ? 10, ... }: b) { a = 1; extra = 0; }  =>  10
        let lambda = Expr::lambda_formals(
            crate::expr::Formals {
                ellipsis: true,
                formals: vec![
                    crate::expr::Formal {
                        name: a,
                        default: None,
                    },
                    crate::expr::Formal {
                        name: b,
                        default: Some(Expr::int(10)),
                    },
                ],
            },
            Expr::var(b, 0, 1),
        );
        let arg = Expr::attrs(
            ExprAttrs::new()
                .attr(a, Expr::int(1))
                .attr(extra, Expr::int(0)),
        );
        let expr = Expr::call(lambda, vec![arg]);
        assert_eq!(force_expr(&ev, expr).unwrap().as_int(), Some(10));
    }

    #[test]
    fn test_unexpected_argument_rejected() {
        let ev = evaluator();
        let syms = ev.symbols();
        let a = syms.intern("a");
        let oops = syms.intern("oops");
        let lambda = Expr::lambda_formals(
            crate::expr::Formals {
                ellipsis: false,
                formals: vec![crate::expr::Formal {
                    name: a,
                    default: None,
                }],
            },
            Expr::var(a, 0, 0),
        );
        let arg = Expr::attrs(
            ExprAttrs::new()
                .attr(a, Expr::int(1))
                .attr(oops, Expr::int(2)),
        );
        let err = force_expr(&ev, Expr::call(lambda, vec![arg])).unwrap_err();
        assert!(matches!(err, EvalError::BadApplication { .. }));
    }

    #[test]
    fn test_with_scope_lookup() {
        let ev = evaluator();
        let syms = ev.symbols();
        let x = syms.intern("x");
        let y = syms.intern("y");
        // with { x = 1; y = 2; }; x
        let attrs = Expr::attrs(
            ExprAttrs::new()
                .attr(x, Expr::int(1))
                .attr(y, Expr::int(2)),
        );
        let expr = Expr::with(attrs, Expr::with_var(x, 0, 1));
        assert_eq!(force_expr(&ev, expr).unwrap().as_int(), Some(1));
    }

    #[test]
    fn test_nested_with_inner_shadows() {
        let ev = evaluator();
        let syms = ev.symbols();
        let x = syms.intern("x");
        // with { x = 1; }; with { x = 2; }; x  =>  2
        let outer = Expr::attrs(ExprAttrs::new().attr(x, Expr::int(1)));
        let inner = Expr::attrs(ExprAttrs::new().attr(x, Expr::int(2)));
        let expr = Expr::with(outer, Expr::with(inner, Expr::with_var(x, 0, 2)));
        assert_eq!(force_expr(&ev, expr).unwrap().as_int(), Some(2));
    }

    #[test]
    fn test_if_assert_and_ops() {
        let ev = evaluator();
        let expr = Expr::if_then_else(
            Expr::op(BinOp::Eq, Expr::int(1), Expr::int(1)),
            Expr::int(1),
            Expr::int(2),
        );
        assert_eq!(force_expr(&ev, expr).unwrap().as_int(), Some(1));

        let failing = Expr::assert(
            Expr::op(BinOp::Eq, Expr::int(1), Expr::int(2)),
            Expr::int(1),
        );
        assert!(matches!(
            force_expr(&ev, failing).unwrap_err(),
            EvalError::AssertionFailed { .. }
        ));
    }

    #[test]
    fn test_update_right_biased() {
        let ev = evaluator();
        let syms = ev.symbols();
        let a = syms.intern("a");
        let b = syms.intern("b");
        let lhs = Expr::attrs(
            ExprAttrs::new()
                .attr(a, Expr::int(1))
                .attr(b, Expr::int(2)),
        );
        let rhs = Expr::attrs(ExprAttrs::new().attr(a, Expr::int(9)));
        let expr = Expr::select_name(Expr::op(BinOp::Update, lhs, rhs), a);
        assert_eq!(force_expr(&ev, expr).unwrap().as_int(), Some(9));
    }

    #[test]
    fn test_select_with_default() {
        let ev = evaluator();
        let syms = ev.symbols();
        let missing = syms.intern("missing");
        let empty = Expr::attrs(ExprAttrs::new());
        let expr = Expr::select(
            empty,
            vec![AttrName::Static(missing)],
            Some(Expr::int(5)),
        );
        assert_eq!(force_expr(&ev, expr).unwrap().as_int(), Some(5));
    }

    #[test]
    fn test_infinite_recursion_is_detected() {
        let ev = evaluator();
        let x = ev.symbols().intern("x");
        // let x = x; in x
        let expr = Expr::let_in(
            ExprAttrs::new().attr(x, Expr::var(x, 0, 0)),
            Expr::var(x, 0, 0),
        );
        let err = force_expr(&ev, expr).unwrap_err();
        assert!(matches!(err, EvalError::InfiniteRecursion { .. }));
    }

    #[test]
    fn test_failed_forcing_restores_thunk() {
        let ev = evaluator();
        let cell = Value::thunk(
            ev.base_env(),
            Expr::assert(
                Expr::op(BinOp::Eq, Expr::int(0), Expr::int(1)),
                Expr::int(1),
            ),
        );
        assert!(ev.force(&cell, PosIdx::NONE).is_err());
        // Restored to a thunk, not poisoned; forcing again re-raises.
        assert!(cell.is_thunk_like());
        assert!(ev.force(&cell, PosIdx::NONE).is_err());
    }

    #[test]
    fn test_interrupt_stops_forcing() {
        let ev = evaluator();
        ev.request_interrupt();
        let cell = Value::thunk(ev.base_env(), Expr::int(1));
        assert!(matches!(
            ev.force(&cell, PosIdx::NONE),
            Err(EvalError::Interrupted)
        ));
        ev.clear_interrupt();
        assert!(ev.force(&cell, PosIdx::NONE).is_ok());
    }

    #[test]
    #[serial_test::serial]
    fn test_get_env_marks_impurity() {
        let ev = evaluator();
        // set_var mutates process state; the serial guard keeps other
        // tests from observing it.
        unsafe { std::env::set_var("RILL_EVAL_TEST_VAR", "present") };

        let builtins = Expr::var(ev.symbols().intern("builtins"), 0, 0);
        let expr = Expr::call(
            Expr::select_name(builtins, ev.symbols().intern("getEnv")),
            vec![Expr::string("RILL_EVAL_TEST_VAR")],
        );
        let token_before = ev.impurity_token();
        let cell = force_expr(&ev, expr).unwrap();
        assert_eq!(cell.as_string().as_deref(), Some("present"));
        assert!(ev.impurity_token() > token_before);

        unsafe { std::env::remove_var("RILL_EVAL_TEST_VAR") };
    }

    #[test]
    fn test_shallow_uncacheable_check() {
        let ev = evaluator();
        let path = Forced::Path {
            accessor: None,
            path: "/x".into(),
        };
        assert!(value_is_shallow_uncacheable(&path));

        let with_thunk = Forced::List(Arc::new(vec![Value::thunk(
            ev.base_env(),
            Expr::int(1),
        )]));
        assert!(value_is_shallow_uncacheable(&with_thunk));

        let plain = Forced::List(Arc::new(vec![Value::int(1)]));
        assert!(!value_is_shallow_uncacheable(&plain));
    }
}
