//! Contexts: varlist + keylist pairs
//!
//! A context is two parallel series of equal length. The *varlist* holds
//! one cell per variable, with slot 0 reserved for the archetype (a cell
//! naming the context itself). The *keylist* holds one [`Key`] per slot,
//! with a placeholder at 0. Frames use their action's paramlist in place
//! of a keylist.
//!
//! ## Ancestors
//!
//! Each keylist links to an ancestor keylist, or to itself when it has no
//! ancestor. A keylist made for a derived context points at the parent's
//! keylist; a keylist copied because a shared one had to grow keeps the
//! original's ancestor. [`is_overriding_context`] walks this chain.
//!
//! ## Sharing
//!
//! Shallow copies share one keylist. The first append to either copy gives
//! it a private keylist first, so existing slot indices keep their meaning
//! for every word that cached them.

use crate::cell::{CELL_FLAG_PROTECTED, Cell, ContextKind, Value};
use crate::error::{Fatal, SeriesError, crash};
use crate::heap::{Heap, reserve_or_crash};
use crate::series::{
    Content, Flavor, Link, SERIES_INFO_FROZEN, SERIES_INFO_SHARED_KEYLIST, SeriesId,
};
use crate::symbol::{SymId, SymbolTable, sym};

/// How a parameter of an action is filled in at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParamClass {
    /// Evaluated argument.
    Normal,
    /// Taken literally from the feed.
    HardQuote,
    /// `/name` switch; LOGIC! in the frame.
    Refinement,
    /// Not gathered; starts out null.
    Local,
    /// Definitional RETURN, filled in by the function dispatcher.
    Return,
}

/// Slot not listed when reflecting or forming the context.
pub const KEY_FLAG_HIDDEN: u8 = 1 << 0;
/// Argument is gathered only when the refinement before it is in use.
pub const KEY_FLAG_REFINEMENT_ARG: u8 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Key {
    pub symbol: SymId,
    pub class: ParamClass,
    pub flags: u8,
}

impl Key {
    pub const fn new(symbol: SymId) -> Self {
        Key {
            symbol,
            class: ParamClass::Normal,
            flags: 0,
        }
    }

    pub const fn param(symbol: SymId, class: ParamClass) -> Self {
        Key {
            symbol,
            class,
            flags: 0,
        }
    }

    pub const fn with_flags(mut self, flags: u8) -> Self {
        self.flags |= flags;
        self
    }

    pub const fn is_hidden(&self) -> bool {
        self.flags & KEY_FLAG_HIDDEN != 0
    }

    pub(crate) const fn root() -> Self {
        Key::new(sym::ROOT)
    }
}

/// Allocate an empty manual context with room for `capacity` variables.
pub fn make_context(heap: &mut Heap, kind: ContextKind, capacity: usize) -> SeriesId {
    let mut keys = reserve_or_crash(capacity + 1);
    keys.push(Key::root());
    let keylist = heap.alloc_series(Flavor::Keylist, Content::Keys(keys), false);
    heap.series_mut(keylist).link = Link::Ancestor(keylist);

    let vars = reserve_or_crash(capacity + 1);
    let varlist = heap.alloc_series(Flavor::Varlist, Content::Cells(vars), false);
    let series = heap.series_mut(varlist);
    series.link = Link::Keysource(keylist);
    series.push_unchecked(Cell::context(kind, varlist));
    varlist
}

/// Manage a varlist together with its keylist.
pub fn manage_context(heap: &mut Heap, varlist: SeriesId) {
    let keysource = ctx_keysource(heap, varlist);
    if heap.series(keysource).flavor() == Flavor::Keylist {
        heap.manage_series(keysource);
    }
    heap.manage_series(varlist);
}

/// Free a manual context and its keylist (if not shared or managed).
pub fn free_context(heap: &mut Heap, varlist: SeriesId) {
    let keysource = ctx_keysource(heap, varlist);
    let keylist = heap.series(keysource);
    let keylist_is_private = keylist.flavor() == Flavor::Keylist
        && !keylist.is_managed()
        && !keylist.has_info(SERIES_INFO_SHARED_KEYLIST);
    heap.free_series(varlist);
    if keylist_is_private {
        heap.free_series(keysource);
    }
}

/// Keylist of an object, or paramlist of a frame.
pub fn ctx_keysource(heap: &Heap, varlist: SeriesId) -> SeriesId {
    match heap.series(varlist).link {
        Link::Keysource(k) => k,
        other => crash(Fatal::Invariant(format!(
            "varlist {varlist:?} has no keysource ({other:?})"
        ))),
    }
}

/// A keylist's ancestor (itself if it has none).
pub fn keylist_ancestor(heap: &Heap, keylist: SeriesId) -> SeriesId {
    match heap.series(keylist).link {
        Link::Ancestor(a) => a,
        _ => keylist,
    }
}

/// Number of variables, not counting the archetype slot.
pub fn ctx_len(heap: &Heap, varlist: SeriesId) -> usize {
    heap.series(varlist).len().saturating_sub(1)
}

pub fn ctx_archetype(heap: &Heap, varlist: SeriesId) -> Cell {
    match heap.series(varlist).at(0) {
        Some(cell) => *cell,
        None => crash(Fatal::Invariant(format!("context {varlist:?} lost its archetype"))),
    }
}

pub fn ctx_kind(heap: &Heap, varlist: SeriesId) -> ContextKind {
    match ctx_archetype(heap, varlist).value {
        Value::Context { kind, .. } => kind,
        other => crash(Fatal::Invariant(format!("bad archetype {other:?}"))),
    }
}

pub fn ctx_key(heap: &Heap, varlist: SeriesId, index: u32) -> Key {
    let keysource = ctx_keysource(heap, varlist);
    match heap.series(keysource).keys().get(index as usize) {
        Some(key) => *key,
        None => crash(Fatal::Invariant(format!(
            "key {index} out of range for context {varlist:?}"
        ))),
    }
}

pub fn ctx_var(heap: &Heap, varlist: SeriesId, index: u32) -> &Cell {
    match heap.series(varlist).at(index as usize) {
        Some(cell) => cell,
        None => crash(Fatal::Invariant(format!(
            "variable {index} out of range for context {varlist:?}"
        ))),
    }
}

/// Raw slot access; callers enforce protection themselves.
pub fn ctx_var_mut(heap: &mut Heap, varlist: SeriesId, index: u32) -> &mut Cell {
    match heap.series_mut(varlist).cells_mut().get_mut(index as usize) {
        Some(cell) => cell,
        None => crash(Fatal::Invariant(format!(
            "variable {index} out of range for context {varlist:?}"
        ))),
    }
}

/// Slot index for `symbol` (case-insensitive), skipping hidden keys.
pub fn find_key(
    heap: &Heap,
    symbols: &SymbolTable,
    varlist: SeriesId,
    symbol: SymId,
) -> Option<u32> {
    let keysource = ctx_keysource(heap, varlist);
    let canon = symbols.canon(symbol);
    heap.series(keysource)
        .keys()
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, key)| !key.is_hidden() && symbols.canon(key.symbol) == canon)
        .map(|(i, _)| i as u32)
}

/// Give `varlist` a private keylist if it is sharing one.
fn ensure_private_keylist(heap: &mut Heap, varlist: SeriesId) -> SeriesId {
    let keylist = ctx_keysource(heap, varlist);
    let old = heap.series(keylist);
    if !old.has_info(SERIES_INFO_SHARED_KEYLIST) {
        return keylist;
    }
    let mut keys = reserve_or_crash(old.len() + 1);
    keys.extend_from_slice(old.keys());
    let self_ancestored = matches!(old.link, Link::Ancestor(a) if a == keylist);
    let managed = heap.is_managed(varlist);

    let copy = heap.alloc_series(Flavor::Keylist, Content::Keys(keys), managed);
    let ancestor = if self_ancestored {
        copy
    } else {
        keylist_ancestor(heap, keylist)
    };
    heap.series_mut(copy).link = Link::Ancestor(ancestor);
    heap.series_mut(varlist).link = Link::Keysource(copy);
    tracing::trace!(?varlist, ?keylist, ?copy, "copied shared keylist before expansion");
    copy
}

/// Append a variable, returning its slot index. The new slot holds void.
pub fn append_key(
    heap: &mut Heap,
    varlist: SeriesId,
    symbol: SymId,
) -> Result<u32, SeriesError> {
    heap.series(varlist).check_mutable(true)?;
    if heap.series(ctx_keysource(heap, varlist)).flavor() != Flavor::Keylist {
        crash(Fatal::Invariant("cannot append to a frame context".into()));
    }
    let keylist = ensure_private_keylist(heap, varlist);
    heap.series_mut(keylist).push_key(Key::new(symbol))?;
    heap.series_mut(varlist).push(Cell::void())?;
    Ok(ctx_len(heap, varlist) as u32)
}

/// Find `symbol`, appending it if absent.
pub fn ensure_key(
    heap: &mut Heap,
    symbols: &SymbolTable,
    varlist: SeriesId,
    symbol: SymId,
) -> Result<u32, SeriesError> {
    match find_key(heap, symbols, varlist, symbol) {
        Some(index) => Ok(index),
        None => append_key(heap, varlist, symbol),
    }
}

fn copy_vars(heap: &Heap, source: SeriesId, extra: usize) -> Vec<Cell> {
    let cells = heap.series(source).cells();
    let mut vars = reserve_or_crash(cells.len() + extra);
    vars.extend(cells.iter().map(|c| c.copied()));
    vars
}

/// Shallow copy. With `extra == 0` the copy shares the source keylist;
/// otherwise it gets its own keylist descended from the source's.
pub fn copy_context(heap: &mut Heap, source: SeriesId, extra: usize) -> SeriesId {
    let keylist = ctx_keysource(heap, source);
    let vars = copy_vars(heap, source, extra);
    let varlist = heap.alloc_series(Flavor::Varlist, Content::Cells(vars), false);

    let keysource = if extra == 0 {
        heap.series_mut(keylist).set_info(SERIES_INFO_SHARED_KEYLIST);
        keylist
    } else {
        let mut keys = reserve_or_crash(heap.series(keylist).len() + extra);
        keys.extend_from_slice(heap.series(keylist).keys());
        let copy = heap.alloc_series(Flavor::Keylist, Content::Keys(keys), false);
        heap.series_mut(copy).link = Link::Ancestor(keylist);
        copy
    };
    finish_copy(heap, varlist, keysource);
    varlist
}

/// New context inheriting every variable of `parent`.
///
/// The child always gets a fresh keylist whose ancestor is the parent's, so
/// the child overrides the parent for derived-binding purposes. ACTION!
/// values bound to the parent (or unbound) are rebound to the child.
pub fn derive_context(heap: &mut Heap, parent: SeriesId, extra: usize) -> SeriesId {
    let parent_keylist = ctx_keysource(heap, parent);
    let vars = copy_vars(heap, parent, extra);
    let varlist = heap.alloc_series(Flavor::Varlist, Content::Cells(vars), false);

    let mut keys = reserve_or_crash(heap.series(parent_keylist).len() + extra);
    keys.extend_from_slice(heap.series(parent_keylist).keys());
    let keylist = heap.alloc_series(Flavor::Keylist, Content::Keys(keys), false);
    heap.series_mut(keylist).link = Link::Ancestor(parent_keylist);
    finish_copy(heap, varlist, keylist);

    for cell in heap.series_mut(varlist).cells_mut().iter_mut().skip(1) {
        if let Value::Action { binding, .. } = &mut cell.value
            && (binding.is_none() || *binding == Some(parent))
        {
            *binding = Some(varlist);
        }
    }
    varlist
}

fn finish_copy(heap: &mut Heap, varlist: SeriesId, keysource: SeriesId) {
    let series = heap.series_mut(varlist);
    series.link = Link::Keysource(keysource);
    if let Some(Value::Context { varlist: v, .. }) =
        series.cells_mut().first_mut().map(|c| &mut c.value)
    {
        *v = varlist;
    }
}

/// Does `override_ctx` stand in for `stored` when resolving a word bound to
/// `stored`?
///
/// True when the override's keylist is the stored keylist or descends from
/// it. Frames never take part: if either side is keyed by a paramlist the
/// answer is false.
pub fn is_overriding_context(heap: &Heap, stored: SeriesId, override_ctx: SeriesId) -> bool {
    let stored_source = ctx_keysource(heap, stored);
    let mut temp = ctx_keysource(heap, override_ctx);

    if heap.series(stored_source).flavor() == Flavor::Paramlist
        || heap.series(temp).flavor() == Flavor::Paramlist
    {
        return false;
    }

    loop {
        if temp == stored_source {
            return true;
        }
        let ancestor = keylist_ancestor(heap, temp);
        if ancestor == temp {
            return false;
        }
        temp = ancestor;
    }
}

/// Set or clear per-slot protection.
pub fn protect_var(heap: &mut Heap, varlist: SeriesId, index: u32, protect: bool) {
    let cell = ctx_var_mut(heap, varlist, index);
    if protect {
        cell.set_flag(CELL_FLAG_PROTECTED);
    } else {
        cell.clear_flag(CELL_FLAG_PROTECTED);
    }
}

/// Make every variable of the context permanently read-only.
pub fn freeze_context(heap: &mut Heap, varlist: SeriesId) {
    heap.series_mut(varlist).set_info(SERIES_INFO_FROZEN);
}
