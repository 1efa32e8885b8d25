//! Runtime errors
//!
//! Recoverable failures are described by [`RuntimeError`], then turned into
//! an ERROR! context by [`Interpreter::make_error`] and raised as
//! [`Flow::Raise`]. The context has a fixed key layout:
//!
//! ```text
//! [type id message near where arg1 arg2 arg3]
//! ```
//!
//! `message` is a template: `:arg1` .. `:arg3` are substituted with the
//! molded arguments when the error is reported, so the arguments keep
//! their identity (a word keeps its binding) for code that TRAPs them.
//!
//! The thread-local last-error slot is used by the FFI layer, which cannot
//! return an ERROR! to a C caller that asked for an integer.

use crate::interpreter::Interpreter;
use crate::scan::ScanError;
use crate::throw::Flow;
use cellvm_core::context::{append_key, ctx_var_mut, make_context, manage_context};
use cellvm_core::{Cell, ContextKind, SeriesError, SeriesId, WordKind, sym};
use std::cell::RefCell;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Script,
    Syntax,
    Math,
    Access,
    User,
}

impl Category {
    pub fn name(self) -> &'static str {
        match self {
            Category::Script => "script",
            Category::Syntax => "syntax",
            Category::Math => "math",
            Category::Access => "access",
            Category::User => "user",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error(":arg1 word is not bound to a context")]
    NotBound { word: Cell },
    #[error(":arg1 has no value")]
    NoValue { word: Cell },
    #[error(":arg1 needs a value")]
    NeedValue { word: Cell },
    #[error("variable :arg1 is protected")]
    ProtectedWord { word: Cell },
    #[error("{0}")]
    Locked(SeriesError),
    #[error(":arg1 is missing its :arg2 argument")]
    NoArg { label: Cell, param: Cell },
    #[error(":arg1 does not allow :arg3 for its :arg2 argument")]
    ExpectArg { label: Cell, param: Cell, got: Cell },
    #[error("incompatible or invalid refinement: :arg1")]
    BadRefine { refinement: Cell },
    #[error("cannot pick :arg2 from :arg1")]
    BadPick { container: Cell, picker: Cell },
    #[error("frame is no longer running")]
    ExpiredFrame,
    #[error("no catch for throw: :arg1")]
    NoCatch { label: Cell, value: Cell },
    #[error("invalid value spliced into an API call")]
    BadSplice,
    #[error("invalid function spec element: :arg1")]
    BadSpec { item: Cell },
    #[error("math or number overflow")]
    Overflow,
    #[error("{0}")]
    Scan(#[from] ScanError),
    #[error("{0}")]
    User(String),
}

impl RuntimeError {
    pub fn category(&self) -> Category {
        match self {
            RuntimeError::Scan(_) => Category::Syntax,
            RuntimeError::Overflow => Category::Math,
            RuntimeError::Locked(_) | RuntimeError::ExpiredFrame => Category::Access,
            RuntimeError::User(_) => Category::User,
            _ => Category::Script,
        }
    }

    /// Symbolic id stored in the `id` field; user errors have none.
    pub fn id(&self) -> Option<&'static str> {
        Some(match self {
            RuntimeError::NotBound { .. } => "not-bound",
            RuntimeError::NoValue { .. } => "no-value",
            RuntimeError::NeedValue { .. } => "need-value",
            RuntimeError::ProtectedWord { .. } => "protected-word",
            RuntimeError::Locked(SeriesError::Held) => "series-held",
            RuntimeError::Locked(SeriesError::Frozen) => "series-frozen",
            RuntimeError::Locked(SeriesError::Protected) => "series-protected",
            RuntimeError::Locked(SeriesError::Inaccessible) => "series-data-freed",
            RuntimeError::Locked(SeriesError::OutOfRange(_)) => "out-of-range",
            RuntimeError::NoArg { .. } => "no-arg",
            RuntimeError::ExpectArg { .. } => "expect-arg",
            RuntimeError::BadRefine { .. } => "bad-refine",
            RuntimeError::BadPick { .. } => "bad-pick",
            RuntimeError::ExpiredFrame => "expired-frame",
            RuntimeError::NoCatch { .. } => "no-catch",
            RuntimeError::BadSplice => "bad-splice",
            RuntimeError::BadSpec { .. } => "bad-func-def",
            RuntimeError::Overflow => "overflow",
            RuntimeError::Scan(ScanError::Missing { .. }) => "scan-missing",
            RuntimeError::Scan(ScanError::Extra { .. }) => "scan-extra",
            RuntimeError::Scan(ScanError::Invalid { .. }) => "scan-invalid",
            RuntimeError::User(_) => return None,
        })
    }

    fn args(&self) -> [Option<Cell>; 3] {
        match *self {
            RuntimeError::NotBound { word }
            | RuntimeError::NoValue { word }
            | RuntimeError::NeedValue { word }
            | RuntimeError::ProtectedWord { word } => [Some(word), None, None],
            RuntimeError::NoArg { label, param } => [Some(label), Some(param), None],
            RuntimeError::ExpectArg { label, param, got } => [Some(label), Some(param), Some(got)],
            RuntimeError::BadRefine { refinement } => [Some(refinement), None, None],
            RuntimeError::BadPick { container, picker } => [Some(container), Some(picker), None],
            RuntimeError::NoCatch { label, value } => [Some(label), Some(value), None],
            RuntimeError::BadSpec { item } => [Some(item), None, None],
            _ => [None, None, None],
        }
    }
}

/// Key order of every ERROR! context.
const ERROR_KEYS: [cellvm_core::SymId; 8] = [
    sym::TYPE,
    sym::ID,
    sym::MESSAGE,
    sym::NEAR,
    sym::WHERE,
    sym::ARG1,
    sym::ARG2,
    sym::ARG3,
];

impl Interpreter {
    /// Build a managed ERROR! context describing `err` at the current
    /// evaluation position.
    pub fn make_error(&mut self, err: &RuntimeError) -> Cell {
        let category = self.symbols.intern(err.category().name());
        let id = err.id().map(|id| self.symbols.intern(id));
        let message = self.heap.make_text(&err.to_string(), true);
        let near = self.near_block();
        let location = self.where_label();

        let mut fields = [Cell::nulled(); 8];
        fields[0] = Cell::word(WordKind::Word, category);
        if let Some(id) = id {
            fields[1] = Cell::word(WordKind::Word, id);
        }
        fields[2] = Cell::text(message);
        if let Some(near) = near {
            fields[3] = Cell::block(near);
        }
        if let Some(label) = location {
            fields[4] = Cell::word(WordKind::Word, label);
        }
        for (slot, arg) in fields[5..].iter_mut().zip(err.args()) {
            if let Some(arg) = arg {
                *slot = arg.copied();
            }
        }
        error_context(self, &fields)
    }

    /// Make the ERROR! for `err` and wrap it for propagation.
    pub fn raise(&mut self, err: RuntimeError) -> Flow {
        tracing::debug!(error = %err, "raise");
        Flow::Raise(self.make_error(&err))
    }

    /// Field of an ERROR! (or any context) by symbol.
    pub fn error_field(&self, error: &Cell, field: cellvm_core::SymId) -> Option<Cell> {
        let varlist = error.as_varlist()?;
        let index = cellvm_core::context::find_key(&self.heap, &self.symbols, varlist, field)?;
        Some(*cellvm_core::context::ctx_var(&self.heap, varlist, index))
    }

    /// The `id` of an ERROR! as a string, for tests and reporting.
    pub fn error_id(&self, error: &Cell) -> Option<String> {
        let id = self.error_field(error, sym::ID)?.as_symbol()?;
        Some(self.symbols.spelling(id).to_string())
    }

    /// Up to three cells around the innermost feed position.
    fn near_block(&mut self) -> Option<SeriesId> {
        let feed = self.frames.last()?.feed;
        let feed = &self.feeds[feed.0];
        let mut cells = Vec::with_capacity(3);
        if !feed.lookback().is_end() {
            cells.push(feed.lookback().copied());
        }
        cells.extend(feed.value().map(|c| c.copied()));
        if cells.iter().any(Cell::is_relative) {
            let specifier = feed.specifier;
            for cell in &mut cells {
                *cell = self.derelativize(*cell, specifier);
            }
        }
        Some(self.heap.make_array_from(&cells, true))
    }

    fn where_label(&self) -> Option<cellvm_core::SymId> {
        self.frames.iter().rev().find_map(|frame| frame.label)
    }
}

fn error_context(interp: &mut Interpreter, fields: &[Cell; 8]) -> Cell {
    let varlist = make_context(&mut interp.heap, ContextKind::Error, ERROR_KEYS.len());
    for (key, value) in ERROR_KEYS.iter().zip(fields) {
        match append_key(&mut interp.heap, varlist, *key) {
            Ok(index) => *ctx_var_mut(&mut interp.heap, varlist, index) = *value,
            Err(err) => cellvm_core::crash(cellvm_core::Fatal::Invariant(format!(
                "fresh error context refused a key: {err}"
            ))),
        }
    }
    manage_context(&mut interp.heap, varlist);
    Cell::context(ContextKind::Error, varlist)
}

// =============================================================================
// Last error for FFI callers
// =============================================================================

thread_local! {
    /// Message of the last failure seen at the FFI boundary
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

pub fn set_last_error(msg: impl Into<String>) {
    LAST_ERROR.with(|e| *e.borrow_mut() = Some(msg.into()));
}

/// Take (and clear) the last error message
pub fn take_last_error() -> Option<String> {
    LAST_ERROR.with(|e| e.borrow_mut().take())
}

pub fn has_last_error() -> bool {
    LAST_ERROR.with(|e| e.borrow().is_some())
}

/// Format a panic payload into an error message
pub fn format_panic_payload(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_error_context_layout() {
        let mut interp = Interpreter::new(Config::default());
        let foo = interp.symbols.intern("foo");
        let word = Cell::word(WordKind::Word, foo);
        let error = interp.make_error(&RuntimeError::NoValue { word });

        assert_eq!(error.kind(), cellvm_core::Kind::Error);
        assert_eq!(interp.error_id(&error).as_deref(), Some("no-value"));
        let arg1 = interp.error_field(&error, sym::ARG1).and_then(|c| c.as_symbol());
        assert_eq!(arg1, Some(foo));
        let category = interp.error_field(&error, sym::TYPE).and_then(|c| c.as_symbol());
        assert_eq!(category.map(|s| interp.symbols.spelling(s).to_string()).as_deref(), Some("script"));
    }

    #[test]
    fn test_user_errors_have_no_id() {
        let err = RuntimeError::User("boom".into());
        assert_eq!(err.id(), None);
        assert_eq!(err.category(), Category::User);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_locked_ids_follow_reason() {
        assert_eq!(RuntimeError::Locked(SeriesError::Held).id(), Some("series-held"));
        assert_eq!(
            RuntimeError::Locked(SeriesError::Frozen).category(),
            Category::Access
        );
    }

    #[test]
    fn test_last_error_roundtrip() {
        set_last_error("bad thing");
        assert!(has_last_error());
        assert_eq!(take_last_error().as_deref(), Some("bad thing"));
        assert!(!has_last_error());
    }

    #[test]
    fn test_format_panic_payload() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("stack overflow");
        assert_eq!(format_panic_payload(&payload), "stack overflow");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(format_panic_payload(&payload), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42u8);
        assert_eq!(format_panic_payload(&payload), "unknown panic");
    }
}
