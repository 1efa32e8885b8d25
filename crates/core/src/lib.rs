//! cellvm core: the memory model of the cellvm language runtime
//!
//! Everything the evaluator stores lives in cells, and every container of
//! cells (or bytes, or keys) is a series owned by the [`Heap`]. Handles are
//! plain indices, so the evaluator can hold many of them while mutating the
//! heap without fighting the borrow checker.
//!
//! # Modules
//!
//! - `node`: header bit layout shared by cells and series, pointer detection
//! - `symbol`: interned spellings with case-insensitive canons
//! - `cell`: the `Cell`/`Value` tagged union
//! - `series`: growable containers with hold/frozen/protected info bits
//! - `heap`: series and API pairing slots, manual roster, guards, ballast
//! - `gc`: mark-sweep collection
//! - `context`: varlist/keylist environments and override ancestry
//! - `action`: paramlists and details of callable values
//! - `binder`: symbol-stamped index map for bind passes
//! - `data_stack`: scratch stack for collecting cells into arrays
//! - `memory_stats`: cross-thread heap statistics for diagnostics
//! - `error`: fatal conditions and series mutation errors

pub mod action;
pub mod binder;
pub mod cell;
pub mod context;
pub mod data_stack;
pub mod error;
pub mod gc;
pub mod heap;
pub mod memory_stats;
pub mod node;
pub mod series;
pub mod symbol;

pub use binder::Binder;
pub use cell::{
    ArrayKind, Binding, CELL_FLAG_ENFIXED, CELL_FLAG_NEWLINE_BEFORE, CELL_FLAG_OUT_STALE,
    CELL_FLAG_PROTECTED, CELL_FLAG_UNEVALUATED, Cell, ContextKind, Kind, Specifier, TextKind,
    Value, WordKind,
};
pub use context::{Key, ParamClass};
pub use data_stack::DataStack;
pub use error::{Fatal, SeriesError, crash};
pub use heap::{Guard, Heap, HeapStats, PairingId};
pub use series::{Flavor, Series, SeriesId};
pub use symbol::{SymId, SymbolTable, sym};
