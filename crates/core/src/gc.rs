//! Mark-sweep collection
//!
//! Stop-the-world and synchronous: [`recycle`] is only called from the
//! evaluator's safe points, never while a cell is half-written.
//!
//! ## Roots
//!
//! - cells and series handed in by the caller (frames, feeds, data stack,
//!   library contexts)
//! - every manual series (they may hold the only reference to managed ones)
//! - the guard stack
//! - live API pairings (ROOT until released)
//!
//! Marking follows cell payloads, bindings and the `link`/`misc` fields of
//! each reached series (keysources, ancestors, details, meta). The sweep
//! frees managed series left unmarked and clears marks on the survivors.

use crate::cell::{Binding, Cell, Specifier, Value};
use crate::error::{Fatal, crash};
use crate::heap::{Guard, Heap, PairingSlot, SeriesSlot};
use crate::memory_stats;
use crate::node::{NODE_FLAG_MARKED, NODE_FLAG_ROOT};
use crate::series::{Link, Misc, SeriesId};

/// Collect garbage. Returns the number of series freed.
pub fn recycle(heap: &mut Heap, root_cells: &[Cell], root_series: &[SeriesId]) -> usize {
    let mut pending: Vec<SeriesId> = Vec::with_capacity(256);

    for cell in root_cells {
        queue_cell(cell, &mut pending);
    }
    pending.extend_from_slice(root_series);
    pending.extend_from_slice(heap.manuals());
    for guard in &heap.guards {
        match guard {
            Guard::Series(id) => pending.push(*id),
            Guard::Cell(cell) => queue_cell(cell, &mut pending),
        }
    }
    for slot in &heap.pairings {
        if let PairingSlot::Live(pairing) = slot
            && pairing.header.has(NODE_FLAG_ROOT)
        {
            queue_cell(&pairing.cells[0], &mut pending);
        }
    }

    propagate(heap, &mut pending);
    let swept = sweep(heap);

    heap.stats.collections += 1;
    heap.stats.swept_last = swept;
    heap.reset_ballast();
    memory_stats::record_collection();
    memory_stats::update_heap_stats(heap.stats.live_bytes, heap.live_series());
    tracing::debug!(
        swept,
        live_bytes = heap.stats.live_bytes,
        collections = heap.stats.collections,
        "recycle"
    );

    if heap.limit().is_some_and(|limit| heap.stats.live_bytes > limit) {
        crash(Fatal::OutOfMemory);
    }
    swept
}

fn queue_cell(cell: &Cell, pending: &mut Vec<SeriesId>) {
    if let Some(series) = cell.value.series() {
        pending.push(series);
    }
    match cell.value {
        Value::Word { binding, .. } => match binding {
            Binding::Specific { varlist, .. } => pending.push(varlist),
            Binding::Relative { paramlist, .. } => pending.push(paramlist),
            Binding::Unbound => {}
        },
        Value::Array { specifier, .. } => match specifier {
            Specifier::Relative(id) | Specifier::Frame(id) => pending.push(id),
            Specifier::Specified => {}
        },
        Value::Context { phase, binding, .. } => {
            pending.extend(phase);
            pending.extend(binding);
        }
        Value::Action { binding, .. } => pending.extend(binding),
        _ => {}
    }
}

fn propagate(heap: &mut Heap, pending: &mut Vec<SeriesId>) {
    while let Some(id) = pending.pop() {
        if heap.try_series(id).is_none() {
            crash(Fatal::Invariant(format!("GC reached freed series {id:?}")));
        }
        if !heap.mark(id) {
            continue;
        }
        let series = heap.series(id);
        match series.link {
            Link::Ancestor(s) | Link::Keysource(s) => pending.push(s),
            Link::File(_) | Link::None => {}
        }
        match series.misc {
            Misc::Meta(s) | Misc::Details(s) => pending.push(s),
            Misc::Line(_) | Misc::Dispatcher(_) | Misc::None => {}
        }
        if series.is_array() {
            for cell in series.cells() {
                queue_cell(cell, pending);
            }
        }
    }
}

fn sweep(heap: &mut Heap) -> usize {
    let mut dead = Vec::new();
    let mut live_bytes = 0;
    for (index, slot) in heap.series.iter_mut().enumerate() {
        if let SeriesSlot::Live(series) = slot {
            // live bytes are recounted from scratch below
            series.take_resized();
            let header = series.header_mut();
            if header.is_marked() {
                header.clear(NODE_FLAG_MARKED);
                live_bytes += series.byte_size();
            } else if header.is_managed() {
                dead.push((SeriesId::from_index(index), series.byte_size()));
            } else {
                live_bytes += series.byte_size();
            }
        }
    }
    let swept = dead.len();
    for (id, bytes) in dead {
        heap.release_slot(id, bytes);
    }
    let pairing_bytes = heap.live_pairings() * std::mem::size_of::<crate::heap::Pairing>();
    heap.stats.live_bytes = live_bytes + pairing_bytes;
    swept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{append_key, ctx_var_mut, manage_context, make_context};
    use crate::cell::ContextKind;
    use crate::symbol::SymbolTable;

    #[test]
    fn test_unreachable_managed_series_are_swept() {
        let mut heap = Heap::default();
        let garbage = heap.make_array(4, true);
        let kept = heap.make_array(4, true);
        let swept = recycle(&mut heap, &[Cell::block(kept)], &[]);
        assert_eq!(swept, 1);
        assert!(heap.try_series(garbage).is_none());
        assert!(heap.try_series(kept).is_some());
        assert!(!heap.is_marked(kept));
    }

    #[test]
    fn test_manual_series_keep_contents_alive() {
        let mut heap = Heap::default();
        let inner = heap.make_array(1, true);
        let outer = heap.make_array(1, false);
        heap.series_mut(outer).push(Cell::block(inner)).unwrap();
        recycle(&mut heap, &[], &[]);
        assert!(heap.try_series(inner).is_some());
        assert!(heap.try_series(outer).is_some());
    }

    #[test]
    fn test_context_keeps_keylist_and_word_targets() {
        let mut heap = Heap::default();
        let mut symbols = SymbolTable::new();
        let ctx = make_context(&mut heap, ContextKind::Object, 1);
        let x = symbols.intern("x");
        let index = append_key(&mut heap, ctx, x).unwrap();
        let text = heap.make_text("payload", true);
        *ctx_var_mut(&mut heap, ctx, index) = Cell::text(text);
        manage_context(&mut heap, ctx);

        let word = Cell::new(Value::Word {
            kind: crate::cell::WordKind::Word,
            symbol: x,
            binding: Binding::Specific { varlist: ctx, index },
        });
        recycle(&mut heap, &[word], &[]);
        assert!(heap.try_series(text).is_some());
        assert!(heap.try_series(crate::context::ctx_keysource(&heap, ctx)).is_some());

        recycle(&mut heap, &[], &[]);
        assert!(heap.try_series(ctx).is_none());
        assert!(heap.try_series(text).is_none());
    }

    #[test]
    fn test_guards_and_pairings_are_roots() {
        let mut heap = Heap::default();
        let guarded = heap.make_array(1, true);
        let handled = heap.make_array(1, true);
        heap.push_guard(Guard::Series(guarded));
        let pairing = heap.alloc_pairing(Cell::block(handled));
        recycle(&mut heap, &[], &[]);
        assert!(heap.try_series(guarded).is_some());
        assert!(heap.try_series(handled).is_some());

        heap.drop_guard();
        heap.free_pairing(pairing);
        recycle(&mut heap, &[], &[]);
        assert!(heap.try_series(guarded).is_none());
        assert!(heap.try_series(handled).is_none());
    }

    #[test]
    fn test_recycle_resets_ballast() {
        let mut heap = Heap::new(100);
        heap.make_array(32, true);
        assert!(heap.needs_recycle());
        recycle(&mut heap, &[], &[]);
        assert!(!heap.needs_recycle());
        assert_eq!(heap.stats().collections, 1);
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn test_over_limit_after_collection_is_fatal() {
        let mut heap = Heap::default();
        heap.set_limit(Some(64));
        let big = heap.make_array(1024, true);
        recycle(&mut heap, &[Cell::block(big)], &[]);
    }
}
