//! Interpreter state
//!
//! One [`Interpreter`] owns everything an evaluation touches: the heap and
//! symbol table, the data stack, the frame and feed stacks, the varlist
//! arena, the native table and the two root contexts (`lib` for natives,
//! `user` for everything loaded). It is single-threaded; the only thing
//! another thread may touch is the halt flag.
//!
//! Frames and feeds live in vectors and are named by index
//! ([`FrameId`], [`FeedId`]). They are strictly LIFO: whoever pushes one
//! pops it on every path, including errors, before returning.

use crate::arena::{ArenaStats, VarlistArena};
use crate::config::Config;
use crate::dispatch::Native;
use crate::feed::Feed;
use crate::frame::Frame;
use crate::throw::{Eval, Flow};
use cellvm_core::context::{make_context, manage_context};
use cellvm_core::{Cell, ContextKind, DataStack, Heap, SeriesId, SymbolTable, gc};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FeedId(pub(crate) usize);

pub struct Interpreter {
    pub heap: Heap,
    pub symbols: SymbolTable,
    pub stack: DataStack,
    pub(crate) frames: Vec<Frame>,
    pub(crate) feeds: Vec<Feed>,
    pub(crate) arena: VarlistArena,
    pub(crate) natives: Vec<Native>,
    pub(crate) lib: SeriesId,
    pub(crate) user: SeriesId,
    /// Paramlist shared by every definitional RETURN.
    pub(crate) return_action: SeriesId,
    pub(crate) config: Config,
    halt: Arc<AtomicBool>,
    /// Native stack address of the outermost frame push.
    pub(crate) stack_base: Option<usize>,
}

/// Evaluator depths recorded at a recovery point.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Snapshot {
    frames: usize,
    feeds: usize,
    stack: usize,
    guards: usize,
    manuals: usize,
}

impl Interpreter {
    pub fn new(config: Config) -> Self {
        let mut heap = Heap::new(config.gc_ballast);
        heap.set_gc_disabled(config.gc_disabled);
        heap.set_limit(config.heap_limit);

        let lib = make_context(&mut heap, ContextKind::Object, 64);
        manage_context(&mut heap, lib);
        let user = make_context(&mut heap, ContextKind::Object, 64);
        manage_context(&mut heap, user);

        let mut interp = Interpreter {
            heap,
            symbols: SymbolTable::new(),
            stack: DataStack::default(),
            frames: Vec::with_capacity(64),
            feeds: Vec::with_capacity(64),
            arena: VarlistArena::new(config.varlist_cache),
            natives: Vec::with_capacity(64),
            lib,
            user,
            return_action: lib,
            config,
            halt: Arc::new(AtomicBool::new(false)),
            stack_base: None,
        };
        crate::natives::boot(&mut interp);
        tracing::debug!(
            natives = interp.natives.len(),
            symbols = interp.symbols.len(),
            "interpreter booted"
        );
        interp
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The context natives and constants are defined in.
    pub fn lib(&self) -> SeriesId {
        self.lib
    }

    /// The context loaded code defines its words in.
    pub fn user(&self) -> SeriesId {
        self.user
    }

    /// Number of live frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn arena_stats(&self) -> ArenaStats {
        self.arena.stats()
    }

    // =========================================================================
    // Halting
    // =========================================================================

    /// Flag another thread (or a signal handler) may set to stop evaluation.
    pub fn halt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.halt)
    }

    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::SeqCst);
    }

    /// Checked between evaluation steps: honors a halt request and runs the
    /// collector when the ballast is spent.
    pub(crate) fn safe_point(&mut self) -> Eval<()> {
        if self.halt.swap(false, Ordering::SeqCst) {
            tracing::info!(depth = self.frames.len(), "halt requested");
            return Err(Flow::Halt);
        }
        if self.heap.needs_recycle() {
            self.recycle();
        }
        Ok(())
    }

    // =========================================================================
    // Garbage collection
    // =========================================================================

    /// Run the collector with every live frame, feed and stack cell as a
    /// root. Returns the number of series freed.
    pub fn recycle(&mut self) -> usize {
        let mut cells = Vec::with_capacity(self.frames.len() + self.feeds.len() * 2);
        let mut series = vec![self.lib, self.user, self.return_action];
        for frame in &self.frames {
            cells.push(frame.out);
            series.extend(frame.varlist);
            series.extend(frame.original);
            series.extend(frame.binding);
        }
        for feed in &self.feeds {
            feed.gc_roots(&mut cells, &mut series);
        }
        cells.extend(self.stack.iter().copied());
        gc::recycle(&mut self.heap, &cells, &series)
    }

    // =========================================================================
    // Recovery points
    // =========================================================================

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot {
            frames: self.frames.len(),
            feeds: self.feeds.len(),
            stack: self.stack.depth(),
            guards: self.heap.guards_len(),
            manuals: self.heap.manuals_len(),
        }
    }

    /// Restore the state of `snap` after a raise unwound to it. Frames and
    /// feeds were popped on the way out; scratch state left behind by the
    /// failed code (stack cells, guards, manual series) is discarded here.
    pub(crate) fn rollback(&mut self, snap: &Snapshot) {
        debug_assert_eq!(self.frames.len(), snap.frames, "frames leaked past recovery point");
        debug_assert_eq!(self.feeds.len(), snap.feeds, "feeds leaked past recovery point");
        self.stack.drop_to(snap.stack.min(self.stack.depth()));
        self.heap.truncate_guards(snap.guards);
        let leaked = self.heap.manuals_len().saturating_sub(snap.manuals);
        if leaked > 0 {
            tracing::debug!(leaked, "freeing manual series after failure");
        }
        self.heap.free_manuals_since(snap.manuals);
    }

    /// Run `body` as a recovery point: on failure the evaluator state is
    /// rolled back to what it was on entry before the flow is returned.
    pub fn rescue<T>(&mut self, body: impl FnOnce(&mut Self) -> Eval<T>) -> Eval<T> {
        let snap = self.snapshot();
        let outermost = self.frames.is_empty();
        let result = body(self);
        if result.is_err() {
            self.rollback(&snap);
        }
        if outermost {
            self.stack_base = None;
        }
        result
    }
}

/// Address of a local, used to measure native stack consumption.
#[inline(never)]
pub(crate) fn stack_address() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boot_defines_natives_in_lib() {
        let interp = Interpreter::new(Config::default());
        let add = interp.symbols.lookup("add");
        assert!(add.is_some());
        assert!(interp.depth() == 0);
        assert_ne!(interp.lib(), interp.user());
    }

    #[test]
    fn test_halt_is_seen_once_at_safe_point() {
        let mut interp = Interpreter::new(Config::default());
        interp.request_halt();
        assert_eq!(interp.safe_point(), Err(Flow::Halt));
        assert_eq!(interp.safe_point(), Ok(()));
    }

    #[test]
    fn test_recycle_keeps_root_contexts() {
        let mut interp = Interpreter::new(Config::default());
        let garbage = interp.heap.make_array(8, true);
        interp.recycle();
        assert!(interp.heap.try_series(garbage).is_none());
        assert!(interp.heap.try_series(interp.lib()).is_some());
        assert!(interp.heap.try_series(interp.user()).is_some());
    }

    #[test]
    fn test_rescue_frees_manuals_on_failure() {
        let mut interp = Interpreter::new(Config::default());
        let before = interp.heap.manuals_len();
        let result: Eval<()> = interp.rescue(|interp| {
            interp.heap.make_array(4, false);
            interp.stack.push(Cell::integer(1));
            Err(Flow::Halt)
        });
        assert_eq!(result, Err(Flow::Halt));
        assert_eq!(interp.heap.manuals_len(), before);
        assert!(interp.stack.is_empty());
    }
}
