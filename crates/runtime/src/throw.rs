//! Non-local control flow
//!
//! Everything that unwinds the evaluator travels as the `Err` side of
//! [`Eval`]. Each layer pops what it pushed and returns the flow upward
//! with `?`; the layer that recognizes it (CATCH, a function's RETURN
//! handling, TRAP, the API boundary) stops it.
//!
//! - `Throw`: THROW or a definitional RETURN. The label is null for an
//!   unnamed throw, a word for THROW/NAME, or the FRAME! of the function
//!   a RETURN belongs to.
//! - `Raise`: an ERROR! context. Caught by TRAP or reported at the top.
//! - `Halt`: the interrupt flag was seen at a safe point. Only the
//!   outermost boundary stops it.

use cellvm_core::{Cell, ContextKind, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Flow {
    Throw { label: Cell, value: Cell },
    Raise(Cell),
    Halt,
}

pub type Eval<T> = Result<T, Flow>;

impl Flow {
    pub fn is_halt(&self) -> bool {
        matches!(self, Flow::Halt)
    }

    /// The ERROR! being raised, if this is a raise.
    pub fn error(&self) -> Option<Cell> {
        match self {
            Flow::Raise(error) => Some(*error),
            _ => None,
        }
    }

    /// True for a RETURN aimed at the frame whose varlist is `varlist`.
    pub fn is_return_to(&self, varlist: cellvm_core::SeriesId) -> bool {
        match self {
            Flow::Throw { label, .. } => matches!(
                label.value,
                Value::Context { kind: ContextKind::Frame, varlist: v, .. } if v == varlist
            ),
            _ => false,
        }
    }
}
