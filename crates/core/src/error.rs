//! Fatal conditions and series mutation errors
//!
//! Two classes of failure originate in the memory layer:
//!
//! - [`Fatal`]: out of memory, native stack overflow, or a broken internal
//!   invariant. Continuing would operate on corrupted state, so [`crash`]
//!   logs the reason and panics. Embedders see the panic at the API
//!   boundary (the runtime's FFI layer catches it and reports the message).
//! - [`SeriesError`]: a write refused because the target is held, frozen,
//!   protected or expired. The runtime turns these into ERROR! values.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fatal {
    #[error("out of memory")]
    OutOfMemory,
    #[error("stack overflow")]
    StackOverflow,
    #[error("invariant violated: {0}")]
    Invariant(String),
}

/// Abort the current evaluation with an unrecoverable condition.
#[cold]
#[track_caller]
pub fn crash(reason: Fatal) -> ! {
    tracing::error!(%reason, location = %std::panic::Location::caller(), "fatal");
    panic!("{reason}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SeriesError {
    #[error("series is held by an active iteration")]
    Held,
    #[error("series is frozen")]
    Frozen,
    #[error("series is protected")]
    Protected,
    #[error("series storage is no longer accessible")]
    Inaccessible,
    #[error("index {0} is out of range")]
    OutOfRange(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "stack overflow")]
    fn test_crash_panics_with_reason() {
        crash(Fatal::StackOverflow);
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            Fatal::Invariant("relative word".into()).to_string(),
            "invariant violated: relative word"
        );
        assert_eq!(SeriesError::Held.to_string(), "series is held by an active iteration");
    }
}
