//! Binder
//!
//! A short-lived symbol → index map used by one bind or scan pass. Instead
//! of a hash table, the index is stamped on the symbol's canon record. The
//! record has two stamp halves, so two binders (say, an outer bind pass and
//! a nested scan) can be live at once without seeing each other's entries.
//!
//! Every `add` must be undone by a `remove` before [`Binder::shutdown`];
//! leftover stamps would leak into the next pass that claims the half.

use crate::error::{Fatal, crash};
use crate::symbol::{SymId, SymbolTable};

#[derive(Debug)]
pub struct Binder {
    half: usize,
    count: usize,
    released: bool,
}

impl Binder {
    /// Claim a free stamp half. Crashes if both halves are busy.
    pub fn new(symbols: &mut SymbolTable) -> Self {
        match symbols.claim_half() {
            Some(half) => Binder {
                half,
                count: 0,
                released: false,
            },
            None => crash(Fatal::Invariant("more than two binders active".into())),
        }
    }

    /// Stamp `index` (nonzero) on `symbol`'s canon. False if already stamped.
    pub fn try_add(&mut self, symbols: &mut SymbolTable, symbol: SymId, index: u32) -> bool {
        debug_assert!(index != 0, "binder index 0 means absent");
        let canon = symbols.canon(symbol);
        if symbols.bind_index(canon, self.half) != 0 {
            return false;
        }
        symbols.set_bind_index(canon, self.half, index);
        self.count += 1;
        true
    }

    pub fn add(&mut self, symbols: &mut SymbolTable, symbol: SymId, index: u32) {
        if !self.try_add(symbols, symbol, index) {
            crash(Fatal::Invariant(format!(
                "binder already holds {}",
                symbols.spelling(symbol)
            )));
        }
    }

    pub fn get(&self, symbols: &SymbolTable, symbol: SymId) -> Option<u32> {
        match symbols.bind_index(symbols.canon(symbol), self.half) {
            0 => None,
            index => Some(index),
        }
    }

    pub fn try_remove(&mut self, symbols: &mut SymbolTable, symbol: SymId) -> Option<u32> {
        let canon = symbols.canon(symbol);
        match symbols.bind_index(canon, self.half) {
            0 => None,
            index => {
                symbols.set_bind_index(canon, self.half, 0);
                self.count -= 1;
                Some(index)
            }
        }
    }

    pub fn remove(&mut self, symbols: &mut SymbolTable, symbol: SymId) -> u32 {
        match self.try_remove(symbols, symbol) {
            Some(index) => index,
            None => crash(Fatal::Invariant(format!(
                "binder does not hold {}",
                symbols.spelling(symbol)
            ))),
        }
    }

    /// Entries added and not yet removed.
    pub fn count(&self) -> usize {
        self.count
    }

    /// End the pass, releasing the half. Every entry must have been removed.
    pub fn shutdown(mut self, symbols: &mut SymbolTable) {
        if self.count != 0 {
            crash(Fatal::Invariant(format!(
                "binder shut down with {} entries left",
                self.count
            )));
        }
        symbols.release_half(self.half);
        self.released = true;
    }
}

impl Drop for Binder {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert!(self.released, "binder dropped without shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let mut symbols = SymbolTable::new();
        let x = symbols.intern("x");
        let upper = symbols.intern("X");
        let mut binder = Binder::new(&mut symbols);
        binder.add(&mut symbols, x, 3);
        assert_eq!(binder.get(&symbols, upper), Some(3));
        assert!(!binder.try_add(&mut symbols, upper, 4));
        assert_eq!(binder.remove(&mut symbols, upper), 3);
        assert_eq!(binder.get(&symbols, x), None);
        binder.shutdown(&mut symbols);
        assert_eq!(symbols.binders_active(), 0);
    }

    #[test]
    fn test_two_binders_are_independent() {
        let mut symbols = SymbolTable::new();
        let x = symbols.intern("x");
        let mut outer = Binder::new(&mut symbols);
        let mut inner = Binder::new(&mut symbols);
        outer.add(&mut symbols, x, 1);
        assert_eq!(inner.get(&symbols, x), None);
        inner.add(&mut symbols, x, 2);
        assert_eq!(outer.get(&symbols, x), Some(1));
        inner.remove(&mut symbols, x);
        inner.shutdown(&mut symbols);
        outer.remove(&mut symbols, x);
        outer.shutdown(&mut symbols);
    }

    #[test]
    #[should_panic(expected = "entries left")]
    fn test_shutdown_with_entries_is_fatal() {
        let mut symbols = SymbolTable::new();
        let x = symbols.intern("x");
        let mut binder = Binder::new(&mut symbols);
        binder.add(&mut symbols, x, 1);
        binder.shutdown(&mut symbols);
    }

    #[test]
    #[should_panic(expected = "more than two binders")]
    fn test_third_binder_is_fatal() {
        let mut symbols = SymbolTable::new();
        let _a = Binder::new(&mut symbols);
        let _b = Binder::new(&mut symbols);
        let _c = Binder::new(&mut symbols);
    }
}
