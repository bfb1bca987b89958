//! The expression model
//!
//! Expressions are produced by the parser as an immutable graph of
//! [`ExprRef`] nodes and never change for the life of an evaluator. That
//! immutability is what makes pointer-keyed hash caching sound.
//!
//! Variables carry their binding coordinates instead of raw names:
//! lexically-bound variables use De Bruijn `(level, displacement)` pairs,
//! while `with`-bound variables carry the frame distance to their nearest
//! enclosing `with` scope plus the number of `with` scopes stacked above
//! it. The name itself is kept for `with` lookups (and diagnostics), since
//! a `with` scope is searched by key, not by position.
//!
//! There is no parser in this crate; the builder constructors at the bottom
//! are what the front end (and the tests) use to assemble programs.

use std::sync::Arc;

use crate::accessor::AccessorRef;
use crate::pos::PosIdx;
use crate::symbol::Symbol;

pub type ExprRef = Arc<Expr>;

/// How a variable reference is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarBinding {
    /// Bound by a lambda, `let`, or `rec` attrset: `level` frames up the
    /// environment chain, slot `displ`.
    Lexical { level: u32, displ: u32 },
    /// Bound dynamically by the nearest enclosing `with`, `level` frames up.
    /// `with_depth` counts the `with` scopes from the capture site outward,
    /// so shadowing structure is part of the variable's identity.
    FromWith { level: u32, with_depth: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExprVar {
    pub name: Symbol,
    pub binding: VarBinding,
}

/// One step in a select / has-attr path: a literal name or a computed one.
#[derive(Debug, Clone)]
pub enum AttrName {
    Static(Symbol),
    Dynamic(ExprRef),
}

/// How a static attribute was introduced. Fed into the hash so that
/// `{ inherit x; }` and `{ x = x; }` stay distinguishable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrKind {
    Plain = 0,
    Inherited = 1,
    InheritedFrom = 2,
}

#[derive(Debug, Clone)]
pub struct StaticAttr {
    pub name: Symbol,
    pub kind: AttrKind,
    pub expr: ExprRef,
}

#[derive(Debug, Clone)]
pub struct DynamicAttr {
    pub name_expr: ExprRef,
    pub value_expr: ExprRef,
}

/// An attribute-set literal, also the binding form of `let`.
///
/// `attrs` is in construction order; for recursive sets and `let` bodies
/// the construction index is the environment displacement of the binding.
/// Hashing sorts by name bytes, so construction order never leaks into the
/// fingerprint.
#[derive(Debug, Clone, Default)]
pub struct ExprAttrs {
    pub recursive: bool,
    pub attrs: Vec<StaticAttr>,
    pub dynamic_attrs: Vec<DynamicAttr>,
    pub inherit_from: Vec<ExprRef>,
}

#[derive(Debug, Clone)]
pub struct Formal {
    pub name: Symbol,
    pub default: Option<ExprRef>,
}

#[derive(Debug, Clone)]
pub struct Formals {
    pub ellipsis: bool,
    pub formals: Vec<Formal>,
}

/// A function literal.
///
/// The single-argument name is a purely local binding and is *not* part of
/// the function's hash (`x: x` and `y: y` are the same function). Formal
/// names are part of the call interface and are hashed.
#[derive(Debug, Clone)]
pub struct ExprLambda {
    pub arg: Option<Symbol>,
    pub formals: Option<Formals>,
    pub body: ExprRef,
}

impl ExprLambda {
    /// Number of environment slots a call frame for this lambda needs.
    pub fn env_size(&self) -> usize {
        usize::from(self.arg.is_some())
            + self.formals.as_ref().map_or(0, |f| f.formals.len())
    }
}

/// Binary operators that share the two-operand hashing shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Eq,
    Neq,
    And,
    Or,
    Impl,
    Update,
    ConcatLists,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Int(i64),
    Float(f64),
    /// A string literal. Context is attached during evaluation, never here.
    Str(String),
    /// A path literal within a source accessor. A missing accessor means
    /// the path can only hash as its raw string.
    Path {
        accessor: Option<AccessorRef>,
        path: String,
    },
    Var(ExprVar),
    Select {
        base: ExprRef,
        path: Vec<AttrName>,
        default: Option<ExprRef>,
    },
    HasAttr {
        base: ExprRef,
        path: Vec<AttrName>,
    },
    Attrs(ExprAttrs),
    List(Vec<ExprRef>),
    Lambda(ExprLambda),
    Call {
        fun: ExprRef,
        args: Vec<ExprRef>,
    },
    /// `let <attrs> in body`; the bindings are an [`ExprAttrs`] whose
    /// construction order fixes the slot layout of the let frame.
    Let {
        attrs: ExprRef,
        body: ExprRef,
    },
    With {
        attrs: ExprRef,
        body: ExprRef,
    },
    If {
        cond: ExprRef,
        then: ExprRef,
        els: ExprRef,
    },
    Assert {
        cond: ExprRef,
        body: ExprRef,
    },
    Not(ExprRef),
    Op {
        op: BinOp,
        lhs: ExprRef,
        rhs: ExprRef,
    },
    ConcatStrings {
        force_string: bool,
        parts: Vec<ExprRef>,
    },
    /// A source-position literal (`__curPos`); evaluates to position info
    /// at its own site, so two occurrences are never interchangeable.
    CurPos(PosIdx),
    /// Sentinel for a binding currently being evaluated.
    BlackHole,
    /// Reference to a synthesized `inherit (from)` slot.
    InheritFrom {
        level: u32,
        displ: u32,
    },
}

impl Expr {
    pub fn int(v: i64) -> ExprRef {
        Arc::new(Expr::Int(v))
    }

    pub fn float(v: f64) -> ExprRef {
        Arc::new(Expr::Float(v))
    }

    pub fn string(s: impl Into<String>) -> ExprRef {
        Arc::new(Expr::Str(s.into()))
    }

    pub fn path(accessor: Option<AccessorRef>, path: impl Into<String>) -> ExprRef {
        Arc::new(Expr::Path {
            accessor,
            path: path.into(),
        })
    }

    pub fn var(name: Symbol, level: u32, displ: u32) -> ExprRef {
        Arc::new(Expr::Var(ExprVar {
            name,
            binding: VarBinding::Lexical { level, displ },
        }))
    }

    pub fn with_var(name: Symbol, level: u32, with_depth: u32) -> ExprRef {
        Arc::new(Expr::Var(ExprVar {
            name,
            binding: VarBinding::FromWith { level, with_depth },
        }))
    }

    pub fn select(base: ExprRef, path: Vec<AttrName>, default: Option<ExprRef>) -> ExprRef {
        Arc::new(Expr::Select {
            base,
            path,
            default,
        })
    }

    pub fn select_name(base: ExprRef, name: Symbol) -> ExprRef {
        Self::select(base, vec![AttrName::Static(name)], None)
    }

    pub fn has_attr(base: ExprRef, path: Vec<AttrName>) -> ExprRef {
        Arc::new(Expr::HasAttr { base, path })
    }

    pub fn attrs(attrs: ExprAttrs) -> ExprRef {
        Arc::new(Expr::Attrs(attrs))
    }

    pub fn list(elems: Vec<ExprRef>) -> ExprRef {
        Arc::new(Expr::List(elems))
    }

    pub fn lambda(arg: Symbol, body: ExprRef) -> ExprRef {
        Arc::new(Expr::Lambda(ExprLambda {
            arg: Some(arg),
            formals: None,
            body,
        }))
    }

    pub fn lambda_formals(formals: Formals, body: ExprRef) -> ExprRef {
        Arc::new(Expr::Lambda(ExprLambda {
            arg: None,
            formals: Some(formals),
            body,
        }))
    }

    pub fn call(fun: ExprRef, args: Vec<ExprRef>) -> ExprRef {
        Arc::new(Expr::Call { fun, args })
    }

    pub fn let_in(attrs: ExprAttrs, body: ExprRef) -> ExprRef {
        Arc::new(Expr::Let {
            attrs: Self::attrs(attrs),
            body,
        })
    }

    pub fn with(attrs: ExprRef, body: ExprRef) -> ExprRef {
        Arc::new(Expr::With { attrs, body })
    }

    pub fn if_then_else(cond: ExprRef, then: ExprRef, els: ExprRef) -> ExprRef {
        Arc::new(Expr::If { cond, then, els })
    }

    pub fn assert(cond: ExprRef, body: ExprRef) -> ExprRef {
        Arc::new(Expr::Assert { cond, body })
    }

    pub fn not(e: ExprRef) -> ExprRef {
        Arc::new(Expr::Not(e))
    }

    pub fn op(op: BinOp, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
        Arc::new(Expr::Op { op, lhs, rhs })
    }

    pub fn concat_strings(force_string: bool, parts: Vec<ExprRef>) -> ExprRef {
        Arc::new(Expr::ConcatStrings { force_string, parts })
    }

    pub fn cur_pos(pos: PosIdx) -> ExprRef {
        Arc::new(Expr::CurPos(pos))
    }
}

impl ExprAttrs {
    pub fn new() -> Self {
        ExprAttrs::default()
    }

    pub fn recursive() -> Self {
        ExprAttrs {
            recursive: true,
            ..ExprAttrs::default()
        }
    }

    pub fn attr(mut self, name: Symbol, expr: ExprRef) -> Self {
        self.attrs.push(StaticAttr {
            name,
            kind: AttrKind::Plain,
            expr,
        });
        self
    }

    pub fn inherit(mut self, name: Symbol, expr: ExprRef) -> Self {
        self.attrs.push(StaticAttr {
            name,
            kind: AttrKind::Inherited,
            expr,
        });
        self
    }

    /// `inherit (from) name;`, desugared at construction into a select on
    /// the from-expression, kept distinguishable through the attr kind.
    pub fn inherit_from(mut self, from: ExprRef, name: Symbol) -> Self {
        self.inherit_from.push(from.clone());
        self.attrs.push(StaticAttr {
            name,
            kind: AttrKind::InheritedFrom,
            expr: Expr::select_name(from, name),
        });
        self
    }

    pub fn dynamic(mut self, name_expr: ExprRef, value_expr: ExprRef) -> Self {
        self.dynamic_attrs.push(DynamicAttr {
            name_expr,
            value_expr,
        });
        self
    }

    /// Construction-order displacement of a static attribute.
    pub fn displ_of(&self, name: Symbol) -> Option<u32> {
        self.attrs
            .iter()
            .position(|a| a.name == name)
            .map(|i| i as u32)
    }
}
