//! Frames
//!
//! A frame is one level of evaluation: a feed to pull from, an output
//! cell, and (when it is running an action) the action's varlist. Argument
//! gathering pushes child frames on the same feed, so the frame stack is
//! also the chain of "who is consuming this feed right now".
//!
//! Pushing checks both recursion limits. Running out of either is fatal,
//! not an ERROR!, since there is no stack left to handle it on.

use crate::interpreter::{FeedId, FrameId, Interpreter, stack_address};
use cellvm_core::{CELL_FLAG_OUT_STALE, Cell, Fatal, SeriesId, SymId, crash};

/// Don't look ahead for enfix operators after the step (right-hand side of
/// an enfix call, so `1 + 2 * 3` groups left to right).
pub const FRAME_FLAG_NO_LOOKAHEAD: u8 = 1 << 0;
/// The frame pushed its feed and pops it with itself.
pub const FRAME_FLAG_OWNS_FEED: u8 = 1 << 1;

#[derive(Debug, Clone)]
pub struct Frame {
    pub feed: FeedId,
    /// Result of the last step. Carries OUT_STALE until a step writes it.
    pub out: Cell,
    pub(crate) flags: u8,
    /// Action being run, if any.
    pub original: Option<SeriesId>,
    pub varlist: Option<SeriesId>,
    /// Binding the action value carried when it was invoked.
    pub binding: Option<SeriesId>,
    /// Word the action was invoked through, for error reports.
    pub label: Option<SymId>,
    /// Parameter currently being gathered (1-based).
    pub param: usize,
}

impl Interpreter {
    /// Push a frame over `feed`. With `owns_feed`, the feed is popped with
    /// the frame and its array is held for the frame's lifetime.
    pub(crate) fn push_frame(&mut self, feed: FeedId, owns_feed: bool) -> FrameId {
        if self.frames.len() >= self.config.max_depth {
            tracing::error!(depth = self.frames.len(), "frame depth limit reached");
            crash(Fatal::StackOverflow);
        }
        let here = stack_address();
        match self.stack_base {
            None => self.stack_base = Some(here),
            Some(base) if base.abs_diff(here) > self.config.stack_limit => {
                tracing::error!(used = base.abs_diff(here), "native stack limit reached");
                crash(Fatal::StackOverflow);
            }
            Some(_) => {}
        }
        if owns_feed {
            self.take_hold(feed);
        }
        self.frames.push(Frame {
            feed,
            out: Cell::END.with_flag(CELL_FLAG_OUT_STALE),
            flags: if owns_feed { FRAME_FLAG_OWNS_FEED } else { 0 },
            original: None,
            varlist: None,
            binding: None,
            label: None,
            param: 0,
        });
        FrameId(self.frames.len() - 1)
    }

    /// Pop the innermost frame, which must be `f`.
    pub(crate) fn pop_frame(&mut self, f: FrameId) {
        if f.0 + 1 != self.frames.len() {
            crash(Fatal::Invariant(format!(
                "popping frame {} with {} live",
                f.0,
                self.frames.len()
            )));
        }
        let Some(frame) = self.frames.pop() else {
            crash(Fatal::Invariant("frame stack underflow".into()));
        };
        debug_assert!(frame.varlist.is_none(), "action frame popped with its varlist");
        if frame.flags & FRAME_FLAG_OWNS_FEED != 0 {
            self.pop_feed(frame.feed);
        }
        if self.frames.is_empty() {
            self.stack_base = None;
        }
    }

    pub fn frame(&self, f: FrameId) -> &Frame {
        &self.frames[f.0]
    }

    /// Specifier for relative values read from the frame's feed.
    pub fn frame_specifier(&self, f: FrameId) -> Option<SeriesId> {
        self.feeds[self.frames[f.0].feed.0].specifier
    }

    pub(crate) fn set_out(&mut self, f: FrameId, mut value: Cell) {
        value.clear_flag(CELL_FLAG_OUT_STALE);
        self.escape(&value);
        self.frames[f.0].out = value;
    }

    pub(crate) fn out_is_stale(&self, f: FrameId) -> bool {
        self.frames[f.0].out.has_flag(CELL_FLAG_OUT_STALE)
    }

    /// Labels of the action frames from innermost out, for backtraces.
    pub fn backtrace(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .filter(|frame| frame.original.is_some())
            .map(|frame| match frame.label {
                Some(label) => self.symbols.spelling(label).to_string(),
                None => "(anonymous)".to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::interpreter::Interpreter;
    use cellvm_core::series::SERIES_INFO_HOLD;
    use cellvm_core::Cell;

    #[test]
    fn test_owning_frame_holds_array_until_popped() {
        let mut interp = Interpreter::new(Config::default());
        let array = interp.heap.make_array_from(&[Cell::integer(1)], true);
        let feed = interp.push_array_feed(array, 0, None);
        let f = interp.push_frame(feed, true);
        assert!(interp.heap.series(array).has_info(SERIES_INFO_HOLD));
        assert!(interp.out_is_stale(f));
        interp.pop_frame(f);
        assert!(!interp.heap.series(array).has_info(SERIES_INFO_HOLD));
        assert_eq!(interp.depth(), 0);
    }

    #[test]
    fn test_nested_frames_do_not_release_outer_hold() {
        let mut interp = Interpreter::new(Config::default());
        let array = interp.heap.make_array_from(&[Cell::integer(1)], true);
        let outer_feed = interp.push_array_feed(array, 0, None);
        let outer = interp.push_frame(outer_feed, true);
        let inner_feed = interp.push_array_feed(array, 0, None);
        let inner = interp.push_frame(inner_feed, true);
        interp.pop_frame(inner);
        assert!(interp.heap.series(array).has_info(SERIES_INFO_HOLD));
        interp.pop_frame(outer);
        assert!(!interp.heap.series(array).has_info(SERIES_INFO_HOLD));
    }

    #[test]
    #[should_panic(expected = "stack overflow")]
    fn test_depth_limit_is_fatal() {
        let mut interp = Interpreter::new(Config::default().with_max_depth(8));
        let array = interp.heap.make_array(0, true);
        let feed = interp.push_array_feed(array, 0, None);
        for _ in 0..9 {
            interp.push_frame(feed, false);
        }
    }
}
