//! Actions
//!
//! An action's identity is its *paramlist*: a key series with one [`Key`]
//! per parameter (placeholder at slot 0). The paramlist's `misc` points at
//! the *details* array:
//!
//! ```text
//! paramlist ──misc──► details [ archetype ACTION! | body? ]
//!                        └──misc──► dispatcher id
//! ```
//!
//! The dispatcher id indexes the runtime's native table; interpreted
//! functions share one dispatcher and keep their body in details slot 1.

use crate::cell::Cell;
use crate::context::{Key, ParamClass};
use crate::error::{Fatal, crash};
use crate::heap::{Heap, reserve_or_crash};
use crate::series::{Content, Flavor, Misc, SeriesId};
use crate::symbol::{SymId, SymbolTable};

/// Build a managed action from its parameters, dispatcher and optional body.
pub fn make_action(
    heap: &mut Heap,
    params: &[Key],
    dispatcher: u32,
    body: Option<Cell>,
) -> SeriesId {
    let mut keys = reserve_or_crash(params.len() + 1);
    keys.push(Key::root());
    keys.extend_from_slice(params);
    let paramlist = heap.alloc_series(Flavor::Paramlist, Content::Keys(keys), true);

    let mut cells = reserve_or_crash(2);
    cells.push(Cell::action(paramlist, None));
    cells.extend(body);
    let details = heap.alloc_series(Flavor::Details, Content::Cells(cells), true);

    heap.series_mut(details).misc = Misc::Dispatcher(dispatcher);
    heap.series_mut(paramlist).misc = Misc::Details(details);
    paramlist
}

pub fn action_details(heap: &Heap, paramlist: SeriesId) -> SeriesId {
    match heap.series(paramlist).misc {
        Misc::Details(details) => details,
        other => crash(Fatal::Invariant(format!(
            "paramlist {paramlist:?} has no details ({other:?})"
        ))),
    }
}

pub fn action_dispatcher(heap: &Heap, paramlist: SeriesId) -> u32 {
    let details = action_details(heap, paramlist);
    match heap.series(details).misc {
        Misc::Dispatcher(id) => id,
        other => crash(Fatal::Invariant(format!(
            "details {details:?} has no dispatcher ({other:?})"
        ))),
    }
}

pub fn action_body(heap: &Heap, paramlist: SeriesId) -> Option<Cell> {
    let details = action_details(heap, paramlist);
    heap.series(details).at(1).copied()
}

pub fn action_num_params(heap: &Heap, paramlist: SeriesId) -> usize {
    heap.series(paramlist).keys().len() - 1
}

/// Parameter `index` (1-based).
pub fn action_param(heap: &Heap, paramlist: SeriesId, index: usize) -> Key {
    match heap.series(paramlist).keys().get(index) {
        Some(key) if index > 0 => *key,
        _ => crash(Fatal::Invariant(format!(
            "parameter {index} out of range for {paramlist:?}"
        ))),
    }
}

/// 1-based index of the parameter named `symbol`, if any.
pub fn find_param(
    heap: &Heap,
    symbols: &SymbolTable,
    paramlist: SeriesId,
    symbol: SymId,
) -> Option<usize> {
    heap.series(paramlist)
        .keys()
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, key)| symbols.same(key.symbol, symbol))
        .map(|(i, _)| i)
}

/// True if the paramlist has a definitional RETURN slot.
pub fn action_has_return(heap: &Heap, paramlist: SeriesId) -> bool {
    heap.series(paramlist)
        .keys()
        .iter()
        .any(|key| key.class == ParamClass::Return)
}
