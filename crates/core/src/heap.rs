//! Node heap
//!
//! Owns every series stub and API pairing, handing out index handles
//! ([`SeriesId`], [`PairingId`]) instead of pointers. Freed slots keep a
//! header whose leading byte is one of the two reserved freed-node bytes
//! and are recycled through a free list.
//!
//! ## Ownership states
//!
//! ```text
//!   alloc_series(managed = false) ──► manual (on the roster)
//!          │                             │ manage_series
//!          │                             ▼
//!          └──(managed = true)──────► managed (GC decides)
//! ```
//!
//! Manual series must be freed or managed by whoever made them. They stay on
//! the manual roster so an error boundary can free everything made since it
//! was entered (`manuals_mark` / `free_manuals_since`).
//!
//! ## Allocation pressure
//!
//! Every allocation subtracts its size from the *ballast*. Once the ballast
//! is spent the heap asks for a collection; the evaluator honors the request
//! at its next safe point. Collection itself lives in [`crate::gc`].

use crate::cell::Cell;
use crate::error::{Fatal, crash};
use crate::memory_stats;
use crate::node::{Header, NODE_FLAG_CELL, NODE_FLAG_MANAGED, NODE_FLAG_MARKED, NODE_FLAG_ROOT};
use crate::series::{Content, Flavor, Series, SeriesId};

/// Bytes allocated between collections unless configured otherwise.
pub const DEFAULT_BALLAST: usize = 3_000_000;

/// Handle to a two-cell API pairing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct PairingId(u32);

impl PairingId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Rebuild a handle from a raw index handed across the FFI boundary.
    pub const fn from_raw(raw: u32) -> Self {
        PairingId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

pub(crate) enum SeriesSlot {
    Free(Header),
    Live(Series),
}

pub(crate) struct Pairing {
    pub(crate) header: Header,
    pub(crate) cells: [Cell; 2],
}

pub(crate) enum PairingSlot {
    Free(Header),
    Live(Pairing),
}

/// Something pinned across a safe point.
#[derive(Debug, Clone, Copy)]
pub enum Guard {
    Series(SeriesId),
    Cell(Cell),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    pub series_allocated: u64,
    pub series_freed: u64,
    pub collections: u64,
    pub swept_last: usize,
    pub live_bytes: usize,
    pub peak_bytes: usize,
}

pub struct Heap {
    pub(crate) series: Vec<SeriesSlot>,
    free_series: Vec<u32>,
    pub(crate) pairings: Vec<PairingSlot>,
    free_pairings: Vec<u32>,
    manuals: Vec<SeriesId>,
    pub(crate) guards: Vec<Guard>,
    ballast: isize,
    ballast_size: usize,
    gc_disabled: bool,
    recycle_requested: bool,
    limit: Option<usize>,
    /// Last series handed out by `series_mut`, whose size change has not
    /// been accounted yet.
    touched: Option<SeriesId>,
    pub(crate) stats: HeapStats,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new(DEFAULT_BALLAST)
    }
}

impl Heap {
    pub fn new(ballast: usize) -> Self {
        memory_stats::get_or_register_slot();
        Heap {
            series: Vec::with_capacity(1024),
            free_series: Vec::new(),
            pairings: Vec::new(),
            free_pairings: Vec::new(),
            manuals: Vec::with_capacity(64),
            guards: Vec::new(),
            ballast: ballast as isize,
            ballast_size: ballast,
            gc_disabled: false,
            recycle_requested: false,
            limit: None,
            touched: None,
            stats: HeapStats::default(),
        }
    }

    // =========================================================================
    // Series allocation
    // =========================================================================

    /// Place `content` in a new series stub.
    pub fn alloc_series(&mut self, flavor: Flavor, content: Content, managed: bool) -> SeriesId {
        let mut series = Series::new(flavor, content);
        if managed {
            series.header_mut().set(NODE_FLAG_MANAGED);
        }
        let bytes = series.byte_size();

        let id = match self.free_series.pop() {
            Some(index) => {
                self.series[index as usize] = SeriesSlot::Live(series);
                SeriesId::from_index(index as usize)
            }
            None => {
                self.series.push(SeriesSlot::Live(series));
                SeriesId::from_index(self.series.len() - 1)
            }
        };
        if !managed {
            self.manuals.push(id);
        }

        self.stats.series_allocated += 1;
        self.account(bytes);
        id
    }

    /// New empty array with room for `capacity` cells.
    pub fn make_array(&mut self, capacity: usize, managed: bool) -> SeriesId {
        let cells = reserve_or_crash(capacity);
        self.alloc_series(Flavor::Array, Content::Cells(cells), managed)
    }

    /// New array holding a copy of `cells`.
    pub fn make_array_from(&mut self, cells: &[Cell], managed: bool) -> SeriesId {
        let mut vec = reserve_or_crash(cells.len());
        vec.extend_from_slice(cells);
        self.alloc_series(Flavor::Array, Content::Cells(vec), managed)
    }

    pub fn make_text(&mut self, text: &str, managed: bool) -> SeriesId {
        let mut s = String::new();
        if s.try_reserve_exact(text.len()).is_err() {
            crash(Fatal::OutOfMemory);
        }
        s.push_str(text);
        self.alloc_series(Flavor::Text, Content::Utf8(s), managed)
    }

    pub fn make_binary(&mut self, bytes: &[u8], managed: bool) -> SeriesId {
        let mut vec = reserve_or_crash(bytes.len());
        vec.extend_from_slice(bytes);
        self.alloc_series(Flavor::Binary, Content::Bytes(vec), managed)
    }

    fn account(&mut self, bytes: usize) {
        self.ballast -= bytes as isize;
        self.stats.live_bytes += bytes;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
        if self.ballast <= 0 {
            self.recycle_requested = true;
        }
        if self.limit.is_some_and(|limit| self.stats.live_bytes > limit) {
            self.recycle_requested = true;
        }
        memory_stats::update_heap_stats(self.stats.live_bytes, self.live_count());
    }

    /// Account for storage a series gained or lost after allocation.
    fn settle(&mut self, id: SeriesId) {
        let delta = match self.series.get_mut(id.index()) {
            Some(SeriesSlot::Live(series)) => series.take_resized(),
            _ => return,
        };
        if delta > 0 {
            self.account(delta as usize);
        } else if delta < 0 {
            self.stats.live_bytes = self.stats.live_bytes.saturating_sub(delta.unsigned_abs());
        }
    }

    /// Account for the last mutated series' growth.
    pub fn settle_resized(&mut self) {
        if let Some(id) = self.touched.take() {
            self.settle(id);
        }
    }

    /// Free a manual series. Managed series belong to the GC.
    pub fn free_series(&mut self, id: SeriesId) {
        let series = self.series(id);
        if series.is_managed() {
            crash(Fatal::Invariant(format!("explicit free of managed series {id:?}")));
        }
        let bytes = series.byte_size();
        self.remove_from_roster(id);
        self.release_slot(id, bytes);
    }

    pub(crate) fn release_slot(&mut self, id: SeriesId, bytes: usize) {
        self.settle(id);
        if self.touched == Some(id) {
            self.touched = None;
        }
        self.series[id.index()] = SeriesSlot::Free(Header::freed(false));
        self.free_series.push(id.index() as u32);
        self.stats.series_freed += 1;
        self.stats.live_bytes = self.stats.live_bytes.saturating_sub(bytes);
    }

    /// Hand a manual series to the GC. Already-managed series are left alone.
    pub fn manage_series(&mut self, id: SeriesId) {
        if self.series(id).is_managed() {
            return;
        }
        self.remove_from_roster(id);
        self.series_mut(id).header_mut().set(NODE_FLAG_MANAGED);
    }

    fn remove_from_roster(&mut self, id: SeriesId) {
        // Recent allocations are freed first, so search from the end.
        match self.manuals.iter().rposition(|m| *m == id) {
            Some(pos) => {
                self.manuals.remove(pos);
            }
            None => crash(Fatal::Invariant(format!(
                "series {id:?} missing from manual roster"
            ))),
        }
    }

    // =========================================================================
    // Access
    // =========================================================================

    pub fn series(&self, id: SeriesId) -> &Series {
        match self.series.get(id.index()) {
            Some(SeriesSlot::Live(s)) => s,
            _ => crash(Fatal::Invariant(format!("use of freed series {id:?}"))),
        }
    }

    pub fn series_mut(&mut self, id: SeriesId) -> &mut Series {
        if self.touched != Some(id) {
            self.settle_resized();
            self.touched = Some(id);
        }
        match self.series.get_mut(id.index()) {
            Some(SeriesSlot::Live(s)) => s,
            _ => crash(Fatal::Invariant(format!("use of freed series {id:?}"))),
        }
    }

    pub fn try_series(&self, id: SeriesId) -> Option<&Series> {
        match self.series.get(id.index()) {
            Some(SeriesSlot::Live(s)) => Some(s),
            _ => None,
        }
    }

    /// Header of the node in `id`'s slot, freed or not.
    pub fn node_header(&self, id: SeriesId) -> Header {
        match self.series.get(id.index()) {
            Some(SeriesSlot::Live(s)) => s.header(),
            Some(SeriesSlot::Free(h)) => *h,
            None => crash(Fatal::Invariant(format!("series {id:?} out of range"))),
        }
    }

    pub fn is_managed(&self, id: SeriesId) -> bool {
        self.series(id).is_managed()
    }

    pub fn is_marked(&self, id: SeriesId) -> bool {
        self.series(id).header().is_marked()
    }

    /// Set the mark bit; returns false if it was already set.
    pub fn mark(&mut self, id: SeriesId) -> bool {
        let header = self.series_mut(id).header_mut();
        if header.is_marked() {
            false
        } else {
            header.set(NODE_FLAG_MARKED);
            true
        }
    }

    /// Take the cells out of an array, leaving an inaccessible stub.
    pub fn take_cells(&mut self, id: SeriesId) -> Vec<Cell> {
        match self.series_mut(id).replace_content(Content::Inaccessible) {
            Content::Cells(cells) => cells,
            other => crash(Fatal::Invariant(format!(
                "take_cells on non-array series ({} elements)",
                other.len()
            ))),
        }
    }

    pub fn live_series(&self) -> usize {
        self.series
            .iter()
            .filter(|slot| matches!(slot, SeriesSlot::Live(_)))
            .count()
    }

    fn live_count(&self) -> usize {
        (self.stats.series_allocated - self.stats.series_freed) as usize
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    // =========================================================================
    // Manual roster
    // =========================================================================

    pub fn manuals_len(&self) -> usize {
        self.manuals.len()
    }

    pub fn manuals(&self) -> &[SeriesId] {
        &self.manuals
    }

    /// Free every manual series allocated after `mark` was taken.
    pub fn free_manuals_since(&mut self, mark: usize) {
        while self.manuals.len() > mark {
            if let Some(id) = self.manuals.pop() {
                let bytes = self.series(id).byte_size();
                self.release_slot(id, bytes);
            }
        }
    }

    // =========================================================================
    // Guards
    // =========================================================================

    pub fn push_guard(&mut self, guard: Guard) {
        self.guards.push(guard);
    }

    pub fn drop_guard(&mut self) {
        if self.guards.pop().is_none() {
            crash(Fatal::Invariant("drop_guard on empty guard stack".into()));
        }
    }

    pub fn guards_len(&self) -> usize {
        self.guards.len()
    }

    pub fn truncate_guards(&mut self, len: usize) {
        self.guards.truncate(len);
    }

    // =========================================================================
    // API pairings
    // =========================================================================

    /// Root a copy of `cell` in a standalone pairing.
    pub fn alloc_pairing(&mut self, cell: Cell) -> PairingId {
        let mut header = Header::cell();
        header.set(NODE_FLAG_ROOT | NODE_FLAG_MANAGED);
        let pairing = Pairing {
            header,
            cells: [cell, Cell::END],
        };
        let id = match self.free_pairings.pop() {
            Some(index) => {
                self.pairings[index as usize] = PairingSlot::Live(pairing);
                PairingId(index)
            }
            None => {
                self.pairings.push(PairingSlot::Live(pairing));
                PairingId(self.pairings.len() as u32 - 1)
            }
        };
        self.account(std::mem::size_of::<Pairing>());
        id
    }

    pub fn pairing(&self, id: PairingId) -> &Cell {
        match self.pairings.get(id.index()) {
            Some(PairingSlot::Live(p)) => &p.cells[0],
            _ => crash(Fatal::Invariant(format!("use of released API handle {id:?}"))),
        }
    }

    pub fn pairing_header(&self, id: PairingId) -> Header {
        match self.pairings.get(id.index()) {
            Some(PairingSlot::Live(p)) => p.header.with_second_byte(p.cells[0].kind_byte()),
            Some(PairingSlot::Free(h)) => *h,
            None => crash(Fatal::Invariant(format!("API handle {id:?} out of range"))),
        }
    }

    pub fn free_pairing(&mut self, id: PairingId) {
        match self.pairings.get(id.index()) {
            Some(PairingSlot::Live(p)) => debug_assert!(p.header.has(NODE_FLAG_CELL)),
            _ => crash(Fatal::Invariant(format!("API handle {id:?} released twice"))),
        }
        self.pairings[id.index()] = PairingSlot::Free(Header::freed(true));
        self.free_pairings.push(id.0);
        self.stats.live_bytes = self
            .stats
            .live_bytes
            .saturating_sub(std::mem::size_of::<Pairing>());
    }

    pub fn live_pairings(&self) -> usize {
        self.pairings
            .iter()
            .filter(|slot| matches!(slot, PairingSlot::Live(_)))
            .count()
    }

    // =========================================================================
    // Collection requests
    // =========================================================================

    /// True when a collection is due and allowed.
    pub fn needs_recycle(&mut self) -> bool {
        self.settle_resized();
        !self.gc_disabled && self.recycle_requested
    }

    pub fn request_recycle(&mut self) {
        self.recycle_requested = true;
    }

    pub fn set_gc_disabled(&mut self, disabled: bool) {
        self.gc_disabled = disabled;
    }

    pub fn gc_disabled(&self) -> bool {
        self.gc_disabled
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn ballast(&self) -> isize {
        self.ballast
    }

    pub(crate) fn reset_ballast(&mut self) {
        self.touched = None;
        self.ballast = self.ballast_size as isize;
        self.recycle_requested = false;
    }
}

/// Allocate a vector or crash with "out of memory".
pub fn reserve_or_crash<T>(capacity: usize) -> Vec<T> {
    let mut vec = Vec::new();
    if vec.try_reserve_exact(capacity).is_err() {
        crash(Fatal::OutOfMemory);
    }
    vec
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{FREED_CELL_BYTE, FREED_SERIES_BYTE};

    #[test]
    fn test_manual_then_managed() {
        let mut heap = Heap::default();
        let id = heap.make_array(4, false);
        assert_eq!(heap.manuals(), &[id]);
        heap.manage_series(id);
        assert!(heap.is_managed(id));
        assert!(heap.manuals().is_empty());
    }

    #[test]
    fn test_freed_slot_has_reserved_byte_and_is_reused() {
        let mut heap = Heap::default();
        let id = heap.make_array(1, false);
        heap.free_series(id);
        assert_eq!(heap.node_header(id).first_byte(), FREED_SERIES_BYTE);
        assert!(heap.try_series(id).is_none());
        let again = heap.make_text("x", false);
        assert_eq!(again, id);
        assert_eq!(heap.series(again).as_str(), "x");
    }

    #[test]
    #[should_panic(expected = "explicit free of managed series")]
    fn test_free_managed_is_fatal() {
        let mut heap = Heap::default();
        let id = heap.make_array(1, true);
        heap.free_series(id);
    }

    #[test]
    #[should_panic(expected = "use of freed series")]
    fn test_use_after_free_is_fatal() {
        let mut heap = Heap::default();
        let id = heap.make_array(1, false);
        heap.free_series(id);
        heap.series(id);
    }

    #[test]
    fn test_free_manuals_since_mark() {
        let mut heap = Heap::default();
        let keep = heap.make_array(1, false);
        let mark = heap.manuals_len();
        let a = heap.make_array(1, false);
        let b = heap.make_array(1, false);
        heap.free_manuals_since(mark);
        assert!(heap.try_series(keep).is_some());
        assert!(heap.try_series(a).is_none());
        assert!(heap.try_series(b).is_none());
    }

    #[test]
    fn test_growth_after_allocation_is_accounted() {
        let mut heap = Heap::new(1_000_000);
        let id = heap.make_array(0, true);
        let before = heap.stats().live_bytes;
        for i in 0..100 {
            heap.series_mut(id).push(Cell::integer(i)).unwrap();
        }
        heap.settle_resized();
        let grown = heap.series(id).capacity() * std::mem::size_of::<Cell>();
        assert_eq!(heap.stats().live_bytes, before + grown);
        assert_eq!(heap.ballast(), 1_000_000 - (before + grown) as isize);
    }

    #[test]
    fn test_growth_spends_ballast() {
        let mut heap = Heap::new(4096);
        let id = heap.make_array(0, true);
        assert!(!heap.needs_recycle());
        for i in 0..1000 {
            heap.series_mut(id).push(Cell::integer(i)).unwrap();
        }
        assert!(heap.needs_recycle());
    }

    #[test]
    fn test_freeing_grown_series_returns_all_bytes() {
        let mut heap = Heap::new(1_000_000);
        let base = heap.stats().live_bytes;
        let id = heap.make_text("", false);
        heap.series_mut(id).push_str(&"x".repeat(500)).unwrap();
        heap.free_series(id);
        assert_eq!(heap.stats().live_bytes, base);
    }

    #[test]
    fn test_ballast_requests_recycle() {
        let mut heap = Heap::new(256);
        assert!(!heap.needs_recycle());
        heap.make_array(64, true);
        assert!(heap.needs_recycle());
        heap.set_gc_disabled(true);
        assert!(!heap.needs_recycle());
    }

    #[test]
    fn test_pairing_release() {
        let mut heap = Heap::default();
        let id = heap.alloc_pairing(Cell::integer(9));
        assert_eq!(heap.pairing(id).as_integer(), Some(9));
        assert!(heap.pairing_header(id).has(NODE_FLAG_ROOT));
        heap.free_pairing(id);
        assert_eq!(heap.pairing_header(id).first_byte(), FREED_CELL_BYTE);
        assert_eq!(heap.live_pairings(), 0);
    }

    #[test]
    #[should_panic(expected = "released twice")]
    fn test_double_release_is_fatal() {
        let mut heap = Heap::default();
        let id = heap.alloc_pairing(Cell::blank());
        heap.free_pairing(id);
        heap.free_pairing(id);
    }
}
