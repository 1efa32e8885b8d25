//! The evaluator
//!
//! One step takes the feed's current value, consumes it (plus whatever
//! arguments it gathers) and leaves a result in the frame's `out`:
//!
//! | Value | Step |
//! |-------|------|
//! | quoted | one quote level removed |
//! | word | variable's value; an ACTION! is invoked |
//! | set-word | next expression evaluated and assigned |
//! | get-word | variable's value, never invoked |
//! | group | contents evaluated, result kept unless invisible |
//! | path / set-path / get-path | see [`crate::path`] |
//! | ACTION! | invoked |
//! | anything else | itself |
//!
//! After the step, an enfix operator to the right takes `out` as its first
//! argument (the lookahead). Steps that produce nothing, like COMMENT,
//! leave `out` stale so the previous result shows through.

use crate::dispatch::Bounce;
use crate::error::RuntimeError;
use crate::frame::FRAME_FLAG_NO_LOOKAHEAD;
use crate::interpreter::{FeedId, FrameId, Interpreter};
use crate::throw::Eval;
use cellvm_core::action::action_param;
use cellvm_core::{
    ArrayKind, CELL_FLAG_ENFIXED, CELL_FLAG_OUT_STALE, CELL_FLAG_UNEVALUATED, Cell, SeriesId,
    Value, WordKind,
};

impl Interpreter {
    /// Evaluate an array from `index` to its end. Empty (or all
    /// invisible) arrays give void.
    pub fn do_array(
        &mut self,
        series: SeriesId,
        index: usize,
        specifier: Option<SeriesId>,
    ) -> Eval<Cell> {
        let mut out = Cell::void();
        self.eval_array_into(&mut out, series, index, specifier)?;
        Ok(out)
    }

    /// Evaluate an array, writing the result into `out` only if something
    /// visible was produced. Returns whether `out` was written.
    pub(crate) fn eval_array_into(
        &mut self,
        out: &mut Cell,
        series: SeriesId,
        index: usize,
        specifier: Option<SeriesId>,
    ) -> Eval<bool> {
        let feed = self.push_array_feed(series, index, specifier);
        match self.eval_feed(feed)? {
            Some(result) => {
                *out = result;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Run a frame over `feed` to its end, popping both. `None` if nothing
    /// visible was produced.
    pub(crate) fn eval_feed(&mut self, feed: FeedId) -> Eval<Option<Cell>> {
        let f = self.push_frame(feed, true);
        let result = self.run_to_end(f);
        let out = self.frames[f.0].out;
        self.pop_frame(f);
        result?;
        Ok((!out.has_flag(CELL_FLAG_OUT_STALE)).then(|| out.copied()))
    }

    fn run_to_end(&mut self, f: FrameId) -> Eval<()> {
        let feed = self.frames[f.0].feed;
        while !self.feeds[feed.0].is_end() {
            self.eval_step(f)?;
        }
        Ok(())
    }

    /// Evaluate one expression from `f`'s feed.
    pub(crate) fn eval_step(&mut self, f: FrameId) -> Eval<()> {
        self.safe_point()?;
        let feed = self.frames[f.0].feed;
        let Some(current) = self.feeds[feed.0].value().copied() else {
            return Ok(());
        };
        let specifier = self.feeds[feed.0].specifier;
        self.fetch_next(feed)?;
        self.eval_current(f, current, specifier)?;
        if self.frames[f.0].flags & FRAME_FLAG_NO_LOOKAHEAD == 0 {
            self.lookahead(f)?;
        }
        Ok(())
    }

    fn eval_current(
        &mut self,
        f: FrameId,
        current: Cell,
        specifier: Option<SeriesId>,
    ) -> Eval<()> {
        if current.quote_depth() > 0 {
            let value = self.derelativize(current.unquoted(), specifier).copied();
            self.set_out(f, value);
            return Ok(());
        }

        match current.value {
            Value::Word {
                kind: WordKind::Word,
                symbol,
                ..
            } => {
                let var = self.get_var(&current, specifier)?;
                match var.value {
                    Value::Action { paramlist, binding } => {
                        if var.has_flag(CELL_FLAG_ENFIXED) {
                            // lookahead would have taken it if there were a left side
                            let param = action_param(&self.heap, paramlist, 1).symbol;
                            return Err(self.raise(RuntimeError::NoArg {
                                label: Cell::word(WordKind::Word, symbol),
                                param: Cell::word(WordKind::Word, param),
                            }));
                        }
                        let bounce =
                            self.call_action(f, paramlist, binding, Some(symbol), None, &[])?;
                        self.apply_bounce(f, bounce);
                    }
                    Value::Void => {
                        let word = self.derelativize(current, specifier).copied();
                        return Err(self.raise(RuntimeError::NoValue { word }));
                    }
                    _ => self.set_out(f, var),
                }
            }

            Value::Word {
                kind: WordKind::Set,
                ..
            } => {
                let Some(value) = self.eval_arg(f, false)? else {
                    let word = self.derelativize(current, specifier).copied();
                    return Err(self.raise(RuntimeError::NeedValue { word }));
                };
                self.set_var(&current, specifier, value)?;
                self.set_out(f, value);
            }

            Value::Word {
                kind: WordKind::Get,
                ..
            } => {
                let var = self.get_var(&current, specifier)?;
                self.set_out(f, var.copied());
            }

            Value::Array {
                kind: ArrayKind::Group,
                series,
                index,
                ..
            } => {
                let group = self.derelativize(current, specifier);
                let inner = self.array_specifier(&group);
                let mut out = Cell::void();
                if self.eval_array_into(&mut out, series, index as usize, inner)? {
                    self.set_out(f, out);
                }
            }

            Value::Array {
                kind: ArrayKind::Path,
                ..
            } => self.eval_path(f, current, specifier)?,

            Value::Array {
                kind: ArrayKind::SetPath,
                ..
            } => self.set_path(f, current, specifier)?,

            Value::Array {
                kind: ArrayKind::GetPath,
                ..
            } => self.get_path(f, current, specifier)?,

            Value::Action { paramlist, binding } => {
                let bounce = self.call_action(f, paramlist, binding, None, None, &[])?;
                self.apply_bounce(f, bounce);
            }

            _ => {
                let value = self
                    .derelativize(current, specifier)
                    .copied()
                    .with_flag(CELL_FLAG_UNEVALUATED);
                self.set_out(f, value);
            }
        }
        Ok(())
    }

    /// While the next value names an enfix action, call it with `out` as
    /// its left argument.
    fn lookahead(&mut self, f: FrameId) -> Eval<()> {
        let feed = self.frames[f.0].feed;
        loop {
            if self.out_is_stale(f) {
                return Ok(());
            }
            let Some(next) = self.feeds[feed.0].value().copied() else {
                return Ok(());
            };
            let Value::Word {
                kind: WordKind::Word,
                symbol,
                ..
            } = next.value
            else {
                return Ok(());
            };
            if next.quote_depth() != 0 {
                return Ok(());
            }
            let specifier = self.feeds[feed.0].specifier;
            let Some(var) = self.peek_var(&next, specifier) else {
                return Ok(());
            };
            let Value::Action { paramlist, binding } = var.value else {
                return Ok(());
            };
            if !var.has_flag(CELL_FLAG_ENFIXED) {
                return Ok(());
            }
            self.fetch_next(feed)?;
            let left = self.frames[f.0].out.copied();
            let bounce = self.call_action(f, paramlist, binding, Some(symbol), Some(left), &[])?;
            self.apply_bounce(f, bounce);
        }
    }

    pub(crate) fn apply_bounce(&mut self, f: FrameId, bounce: Bounce) {
        if let Bounce::Out(value) = bounce {
            self.set_out(f, value);
        }
    }

    /// Gather one argument from `f`'s feed on a child frame. Invisible
    /// steps are skipped; `None` if the feed ended first.
    pub(crate) fn eval_arg(&mut self, f: FrameId, no_lookahead: bool) -> Eval<Option<Cell>> {
        let feed = self.frames[f.0].feed;
        let child = self.push_frame(feed, false);
        if no_lookahead {
            self.frames[child.0].flags |= FRAME_FLAG_NO_LOOKAHEAD;
        }
        let result = loop {
            if self.feeds[feed.0].is_end() {
                break Ok(());
            }
            if let Err(flow) = self.eval_step(child) {
                break Err(flow);
            }
            if !self.out_is_stale(child) {
                break Ok(());
            }
        };
        let out = self.frames[child.0].out;
        self.pop_frame(child);
        result?;
        Ok((!out.has_flag(CELL_FLAG_OUT_STALE)).then_some(out))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::interpreter::Interpreter;
    use cellvm_core::Cell;

    fn eval(interp: &mut Interpreter, source: &str) -> Cell {
        let array = interp.load(source, None).unwrap();
        interp.do_array(array, 0, None).unwrap()
    }

    #[test]
    fn test_last_value_wins() {
        let mut interp = Interpreter::new(Config::default());
        assert_eq!(eval(&mut interp, "1 2 3").as_integer(), Some(3));
        assert_eq!(interp.depth(), 0);
    }

    #[test]
    fn test_empty_block_is_void() {
        let mut interp = Interpreter::new(Config::default());
        assert!(eval(&mut interp, "").is_void());
    }

    #[test]
    fn test_set_word_assigns_and_returns() {
        let mut interp = Interpreter::new(Config::default());
        assert_eq!(eval(&mut interp, "x: 10 x").as_integer(), Some(10));
        assert_eq!(interp.lookup("x").unwrap().as_integer(), Some(10));
    }

    #[test]
    fn test_enfix_is_left_to_right() {
        let mut interp = Interpreter::new(Config::default());
        assert_eq!(eval(&mut interp, "1 + 2 * 3").as_integer(), Some(9));
    }

    #[test]
    fn test_invisible_keeps_previous_result() {
        let mut interp = Interpreter::new(Config::default());
        assert_eq!(eval(&mut interp, "1 comment \"x\"").as_integer(), Some(1));
        assert_eq!(eval(&mut interp, "add 1 elide 5 2").as_integer(), Some(3));
    }

    #[test]
    fn test_quoted_drops_one_level() {
        let mut interp = Interpreter::new(Config::default());
        let result = eval(&mut interp, "''foo");
        assert_eq!(result.quote_depth(), 1);
    }

    #[test]
    fn test_group_evaluates_in_place() {
        let mut interp = Interpreter::new(Config::default());
        assert_eq!(eval(&mut interp, "add (1 + 1) 3").as_integer(), Some(5));
    }
}
