//! cellvm runtime: the evaluator over the cellvm memory model
//!
//! Key design principles:
//! - Feed: a cursor over an array, or over a single-pass stream of API items
//! - Frame: one level of evaluation; argument gathering pushes child frames
//!   on the same feed
//! - Flow: throws, raised errors and halts all travel as `Err(Flow)` and are
//!   stopped only where someone is listening for them
//!
//! Words are bound when code is loaded (`user` first, then `lib`), bound
//! relatively inside function bodies, and resolved against the running
//! frame when evaluated.

pub mod api;
pub mod arena;
pub mod bind;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod eval;
pub mod feed;
pub mod ffi;
pub mod form;
pub mod frame;
pub mod interpreter;
pub mod natives;
pub mod path;
pub mod scan;
pub mod signal;
pub mod throw;
pub mod variadic;

pub use arena::ArenaStats;
pub use config::Config;
pub use dispatch::{Bounce, Dispatcher};
pub use error::{Category, RuntimeError};
pub use interpreter::{FeedId, FrameId, Interpreter};
pub use scan::ScanError;
pub use signal::{HaltHandler, install_halt_handler};
pub use throw::{Eval, Flow};
pub use variadic::{ApiHandle, ApiItem, ItemSource, VariadicSource};

pub use cellvm_core::{Cell, ContextKind, Kind, SeriesId, SymId, Value, WordKind};
