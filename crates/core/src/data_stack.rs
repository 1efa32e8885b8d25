//! Data stack
//!
//! A contiguous stack of cells used to collect values of unknown count
//! (scanner output, path refinements, feed reification) before they are
//! popped into an array of exactly the right size.
//!
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────┐
//! │  cell 0  │  cell 1  │  cell 2  │  ...    │
//! └──────────┴──────────┴──────────┴─────────┘
//!                                  ↑ depth
//! ```
//!
//! Callers remember `depth()` as their *base*, push, then
//! [`DataStack::pop_to_array`] from that base. Everything above a base
//! belongs to whoever took it, so nested collectors compose.
//!
//! The stack is a GC root: cells on it keep their series alive.

use crate::cell::Cell;
use crate::error::{Fatal, crash};
use crate::heap::{Heap, reserve_or_crash};
use crate::series::{Content, Flavor, SeriesId};

/// Initial capacity (number of cells)
pub const DEFAULT_DATA_STACK_CAPACITY: usize = 4096;

/// Depth past which a push is treated as runaway recursion.
pub const DEFAULT_DATA_STACK_LIMIT: usize = 1 << 20;

#[derive(Debug)]
pub struct DataStack {
    cells: Vec<Cell>,
    limit: usize,
}

impl Default for DataStack {
    fn default() -> Self {
        Self::new(DEFAULT_DATA_STACK_CAPACITY, DEFAULT_DATA_STACK_LIMIT)
    }
}

impl DataStack {
    pub fn new(capacity: usize, limit: usize) -> Self {
        DataStack {
            cells: reserve_or_crash(capacity.min(limit)),
            limit,
        }
    }

    #[inline(always)]
    pub fn depth(&self) -> usize {
        self.cells.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn push(&mut self, cell: Cell) {
        if self.cells.len() >= self.limit {
            crash(Fatal::StackOverflow);
        }
        self.cells.push(cell);
    }

    /// Panics if the stack is empty.
    #[inline]
    pub fn pop(&mut self) -> Cell {
        match self.cells.pop() {
            Some(cell) => cell,
            None => crash(Fatal::Invariant("pop: data stack is empty".into())),
        }
    }

    #[inline]
    pub fn top(&self) -> Option<&Cell> {
        self.cells.last()
    }

    /// Cells pushed since `base`.
    pub fn since(&self, base: usize) -> &[Cell] {
        &self.cells[base.min(self.cells.len())..]
    }

    /// Discard everything above `base`.
    pub fn drop_to(&mut self, base: usize) {
        if base > self.cells.len() {
            crash(Fatal::Invariant(format!(
                "drop_to({base}) above depth {}",
                self.cells.len()
            )));
        }
        self.cells.truncate(base);
    }

    /// Move everything above `base` into a new array.
    pub fn pop_to_array(&mut self, heap: &mut Heap, base: usize, managed: bool) -> SeriesId {
        let mut cells = reserve_or_crash(self.cells.len().saturating_sub(base));
        cells.extend(self.cells.drain(base..));
        heap.alloc_series(Flavor::Array, Content::Cells(cells), managed)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cell> {
        self.cells.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_pop() {
        let mut stack = DataStack::default();
        assert!(stack.is_empty());
        stack.push(Cell::integer(1));
        stack.push(Cell::integer(2));
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.top().and_then(Cell::as_integer), Some(2));
        assert_eq!(stack.pop().as_integer(), Some(2));
        assert_eq!(stack.pop().as_integer(), Some(1));
    }

    #[test]
    fn test_pop_to_array_from_base() {
        let mut heap = Heap::default();
        let mut stack = DataStack::default();
        stack.push(Cell::blank());
        let base = stack.depth();
        for i in 0..5 {
            stack.push(Cell::integer(i));
        }
        let array = stack.pop_to_array(&mut heap, base, true);
        assert_eq!(stack.depth(), 1);
        let cells = heap.series(array).cells();
        assert_eq!(cells.len(), 5);
        assert_eq!(cells[4].as_integer(), Some(4));
    }

    #[test]
    fn test_drop_to() {
        let mut stack = DataStack::default();
        for i in 0..10 {
            stack.push(Cell::integer(i));
        }
        stack.drop_to(3);
        assert_eq!(stack.depth(), 3);
        assert_eq!(stack.since(1).len(), 2);
    }

    #[test]
    #[should_panic(expected = "stack overflow")]
    fn test_limit_is_fatal() {
        let mut stack = DataStack::new(2, 2);
        for i in 0..3 {
            stack.push(Cell::integer(i));
        }
    }

    #[test]
    #[should_panic(expected = "data stack is empty")]
    fn test_pop_empty_is_fatal() {
        let mut stack = DataStack::default();
        stack.pop();
    }
}
