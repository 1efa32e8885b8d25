//! Interned symbols
//!
//! Words refer to symbols by [`SymId`]. Every spelling is interned once and
//! points at its *canon*: the lowercase spelling. Word lookup, key matching
//! and binder stamps all go through the canon, so `Foo` and `foo` name the
//! same variable while each keeps its own spelling for display.
//!
//! The canon record also carries the binder's two index halves (see
//! [`crate::binder`]). Stamping an index on the record itself means a bind
//! pass needs no side hash table.

use std::collections::HashMap;

/// Handle to an interned spelling.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SymId(u32);

impl SymId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Symbols every interpreter needs, interned in this order at startup.
pub mod sym {
    use super::SymId;

    /// Placeholder key at slot 0 of keylists and paramlists.
    pub const ROOT: SymId = SymId(0);
    pub const SELF: SymId = SymId(1);
    pub const RETURN: SymId = SymId(2);
    /// Stands in for feed input lost before a variadic reification.
    pub const OPTIMIZED_OUT: SymId = SymId(3);
    pub const TYPE: SymId = SymId(4);
    pub const ID: SymId = SymId(5);
    pub const MESSAGE: SymId = SymId(6);
    pub const NEAR: SymId = SymId(7);
    pub const WHERE: SymId = SymId(8);
    pub const ARG1: SymId = SymId(9);
    pub const ARG2: SymId = SymId(10);
    pub const ARG3: SymId = SymId(11);
    pub const LOCAL: SymId = SymId(12);

    pub(super) const SPELLINGS: &[&str] = &[
        "~root~",
        "self",
        "return",
        "--optimized-out--",
        "type",
        "id",
        "message",
        "near",
        "where",
        "arg1",
        "arg2",
        "arg3",
        "local",
    ];
}

#[derive(Debug)]
struct SymbolRecord {
    spelling: Box<str>,
    canon: SymId,
    /// Binder stamps, high half and low half. Zero means "not stamped".
    bind_index: [u32; 2],
}

/// Interning table owned by the interpreter.
#[derive(Debug)]
pub struct SymbolTable {
    records: Vec<SymbolRecord>,
    by_spelling: HashMap<Box<str>, SymId>,
    /// Which binder halves are claimed by a live `Binder`.
    halves_in_use: [bool; 2],
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        let mut table = SymbolTable {
            records: Vec::with_capacity(256),
            by_spelling: HashMap::with_capacity(256),
            halves_in_use: [false, false],
        };
        for spelling in sym::SPELLINGS {
            table.intern(spelling);
        }
        table
    }

    /// Intern `spelling`, returning the existing id if already present.
    pub fn intern(&mut self, spelling: &str) -> SymId {
        if let Some(&id) = self.by_spelling.get(spelling) {
            return id;
        }
        let lower = spelling.to_lowercase();
        let canon = if lower == spelling {
            SymId(self.records.len() as u32)
        } else {
            self.intern(&lower)
        };
        let id = SymId(self.records.len() as u32);
        self.records.push(SymbolRecord {
            spelling: spelling.into(),
            canon,
            bind_index: [0, 0],
        });
        self.by_spelling.insert(spelling.into(), id);
        id
    }

    /// Find a spelling without interning it.
    pub fn lookup(&self, spelling: &str) -> Option<SymId> {
        self.by_spelling.get(spelling).copied()
    }

    pub fn spelling(&self, id: SymId) -> &str {
        &self.records[id.index()].spelling
    }

    pub fn canon(&self, id: SymId) -> SymId {
        self.records[id.index()].canon
    }

    /// Case-insensitive symbol equality.
    pub fn same(&self, a: SymId, b: SymId) -> bool {
        a == b || self.canon(a) == self.canon(b)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn bind_index(&self, canon: SymId, half: usize) -> u32 {
        self.records[canon.index()].bind_index[half]
    }

    pub(crate) fn set_bind_index(&mut self, canon: SymId, half: usize, index: u32) {
        self.records[canon.index()].bind_index[half] = index;
    }

    pub(crate) fn claim_half(&mut self) -> Option<usize> {
        let half = self.halves_in_use.iter().position(|used| !used)?;
        self.halves_in_use[half] = true;
        Some(half)
    }

    pub(crate) fn release_half(&mut self, half: usize) {
        self.halves_in_use[half] = false;
    }

    /// Number of binder halves currently claimed.
    pub fn binders_active(&self) -> usize {
        self.halves_in_use.iter().filter(|used| **used).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_interned_in_order() {
        let table = SymbolTable::new();
        assert_eq!(table.spelling(sym::RETURN), "return");
        assert_eq!(table.spelling(sym::OPTIMIZED_OUT), "--optimized-out--");
        assert_eq!(table.lookup("arg3"), Some(sym::ARG3));
    }

    #[test]
    fn test_intern_is_idempotent() {
        let mut table = SymbolTable::new();
        let a = table.intern("append");
        let b = table.intern("append");
        assert_eq!(a, b);
    }

    #[test]
    fn test_canon_is_case_insensitive() {
        let mut table = SymbolTable::new();
        let upper = table.intern("Foo");
        let lower = table.intern("foo");
        assert_ne!(upper, lower);
        assert_eq!(table.canon(upper), lower);
        assert_eq!(table.canon(lower), lower);
        assert!(table.same(upper, lower));
        assert_eq!(table.spelling(upper), "Foo");
    }

    #[test]
    fn test_halves_are_exclusive() {
        let mut table = SymbolTable::new();
        let a = table.claim_half();
        let b = table.claim_half();
        assert_eq!((a, b), (Some(0), Some(1)));
        assert_eq!(table.claim_half(), None);
        table.release_half(0);
        assert_eq!(table.binders_active(), 1);
        assert_eq!(table.claim_half(), Some(0));
    }
}
