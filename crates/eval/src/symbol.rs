//! String interning for attribute and variable names
//!
//! A [`Symbol`] is a session-local index into the table. Symbol IDs are
//! assigned in interning order, so they are never fed into a hash; every
//! hasher resolves the symbol back to its string bytes first. The table is
//! shared across evaluator threads behind a read-write lock (interning is
//! rare after startup, resolution is the common path).

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// A session-local interned name. The numeric value depends on interning
/// order and must never escape the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

#[derive(Default)]
struct Interner {
    names: Vec<Arc<str>>,
    index: HashMap<Arc<str>, Symbol>,
}

/// Shared symbol table.
#[derive(Default)]
pub struct SymbolTable {
    inner: RwLock<Interner>,
}

impl SymbolTable {
    pub fn new() -> Self {
        SymbolTable::default()
    }

    /// Intern a name, returning its symbol. Idempotent.
    pub fn intern(&self, name: &str) -> Symbol {
        if let Some(sym) = self.inner.read().index.get(name) {
            return *sym;
        }
        let mut inner = self.inner.write();
        if let Some(sym) = inner.index.get(name) {
            return *sym;
        }
        let sym = Symbol(inner.names.len() as u32);
        let shared: Arc<str> = Arc::from(name);
        inner.names.push(shared.clone());
        inner.index.insert(shared, sym);
        sym
    }

    /// Resolve a symbol to its string bytes.
    pub fn resolve(&self, sym: Symbol) -> Arc<str> {
        self.inner.read().names[sym.0 as usize].clone()
    }

    pub fn len(&self) -> usize {
        self.inner.read().names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
