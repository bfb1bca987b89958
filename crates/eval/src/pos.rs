//! Source positions
//!
//! Positions are registered once at parse time and referenced everywhere by
//! a small index. The index is session-local: it depends on registration
//! order, which is why hashing a position literal downgrades portability to
//! session-local.

use parking_lot::RwLock;

/// Index into the position table. `PosIdx::NONE` means "no position".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PosIdx(u32);

impl PosIdx {
    pub const NONE: PosIdx = PosIdx(0);

    pub fn is_none(self) -> bool {
        self == PosIdx::NONE
    }

    /// The raw session-local index, for hashing.
    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A resolved source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pos {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

/// Append-only table of source positions.
#[derive(Default)]
pub struct PosTable {
    entries: RwLock<Vec<Pos>>,
}

impl PosTable {
    pub fn new() -> Self {
        PosTable::default()
    }

    pub fn add(&self, file: impl Into<String>, line: u32, column: u32) -> PosIdx {
        let mut entries = self.entries.write();
        entries.push(Pos {
            file: file.into(),
            line,
            column,
        });
        // Index 0 is reserved for NONE.
        PosIdx(entries.len() as u32)
    }

    pub fn lookup(&self, idx: PosIdx) -> Option<Pos> {
        if idx.is_none() {
            return None;
        }
        self.entries.read().get(idx.0 as usize - 1).cloned()
    }
}
