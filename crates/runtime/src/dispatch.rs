//! Action invocation
//!
//! Calling an action takes four steps, all on a frame pushed over the
//! caller's feed:
//!
//! 1. [`push_action`]: give the frame a varlist (buffer from the arena,
//!    FRAME! archetype in slot 0, one null per parameter)
//! 2. fulfill: gather each parameter in paramlist order, evaluating from
//!    the shared feed, taking quoted ones literally, switching refinements
//! 3. dispatch: run the native function the paramlist's details name
//! 4. [`drop_action`]: hand the buffer back, leaving an inaccessible stub
//!    if the varlist was managed while the call ran
//!
//! [`push_action`]: Interpreter::push_action
//! [`drop_action`]: Interpreter::drop_action

use crate::error::RuntimeError;
use crate::interpreter::{FrameId, Interpreter};
use crate::throw::{Eval, Flow};
use cellvm_core::action::{
    action_dispatcher, action_num_params, action_param, find_param, make_action,
};
use cellvm_core::context::{
    KEY_FLAG_HIDDEN, KEY_FLAG_REFINEMENT_ARG, ctx_archetype, ctx_var_mut, ensure_key,
};
use cellvm_core::series::{Content, Link, SERIES_INFO_INACCESSIBLE};
use cellvm_core::{
    CELL_FLAG_ENFIXED, Cell, ContextKind, Fatal, Flavor, Key, ParamClass, SeriesId, SymId,
    TextKind, Value, WordKind, crash, sym,
};

/// What a dispatcher produced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bounce {
    Out(Cell),
    /// Leave the caller's output untouched (COMMENT, ELIDE).
    Invisible,
}

pub type Dispatcher = fn(&mut Interpreter, FrameId) -> Eval<Bounce>;

#[derive(Debug, Clone, Copy)]
pub struct Native {
    pub name: SymId,
    pub dispatcher: Dispatcher,
}

impl Interpreter {
    // =========================================================================
    // Registration
    // =========================================================================

    /// Add a dispatcher to the native table, returning its id.
    pub(crate) fn add_dispatcher(&mut self, name: &str, dispatcher: Dispatcher) -> u32 {
        let name = self.symbols.intern(name);
        self.natives.push(Native { name, dispatcher });
        (self.natives.len() - 1) as u32
    }

    /// Define a native in `lib`. `spec` uses function spec syntax:
    /// `value 'literal /refinement arg`.
    pub fn register_native(
        &mut self,
        name: &str,
        spec: &str,
        dispatcher: Dispatcher,
    ) -> Eval<Cell> {
        let id = self.add_dispatcher(name, dispatcher);
        let spec = self.scan_text(spec, None)?;
        let params = self.params_from_spec(spec, 0)?;
        let paramlist = make_action(&mut self.heap, &params, id, None);
        let action = Cell::action(paramlist, None);
        let symbol = self.symbols.intern(name);
        self.define_lib(symbol, action)?;
        Ok(action)
    }

    /// Like [`register_native`](Self::register_native), but the first
    /// argument is taken from the value on the left.
    pub fn register_enfix(&mut self, name: &str, spec: &str, dispatcher: Dispatcher) -> Eval<Cell> {
        let action = self.register_native(name, spec, dispatcher)?;
        let enfixed = action.with_flag(CELL_FLAG_ENFIXED);
        let symbol = self.symbols.intern(name);
        self.define_lib(symbol, enfixed)?;
        Ok(enfixed)
    }

    pub(crate) fn define_lib(&mut self, symbol: SymId, value: Cell) -> Eval<()> {
        let lib = self.lib;
        let index = ensure_key(&mut self.heap, &self.symbols, lib, symbol)
            .map_err(|e| self.raise(RuntimeError::Locked(e)))?;
        *ctx_var_mut(&mut self.heap, lib, index) = value;
        Ok(())
    }

    /// Turn a spec block into parameter keys.
    ///
    /// Words are evaluated parameters, `'word`s are literal ones. A
    /// `/refinement` makes the words after it its arguments. Words after
    /// `<local>` are locals. Text (notes) and blocks (types) are skipped.
    pub(crate) fn params_from_spec(&mut self, spec: SeriesId, index: usize) -> Eval<Vec<Key>> {
        #[derive(PartialEq)]
        enum Mode {
            Args,
            RefinementArgs,
            Locals,
        }

        let cells = self.heap.series(spec).cells().get(index..).unwrap_or(&[]).to_vec();
        let mut keys: Vec<Key> = Vec::with_capacity(cells.len());
        let mut mode = Mode::Args;
        for cell in cells {
            let key = match cell.value {
                Value::Word {
                    kind: WordKind::Word,
                    symbol,
                    ..
                } => {
                    let class = match cell.quote_depth() {
                        0 => ParamClass::Normal,
                        1 => ParamClass::HardQuote,
                        _ => return Err(self.raise(RuntimeError::BadSpec { item: cell })),
                    };
                    match mode {
                        Mode::Args => Key::param(symbol, class),
                        Mode::RefinementArgs => {
                            Key::param(symbol, class).with_flags(KEY_FLAG_REFINEMENT_ARG)
                        }
                        Mode::Locals => Key::param(symbol, ParamClass::Local),
                    }
                }
                Value::Word {
                    kind: WordKind::Refinement,
                    symbol,
                    ..
                } if mode != Mode::Locals => {
                    mode = Mode::RefinementArgs;
                    Key::param(symbol, ParamClass::Refinement)
                }
                Value::Text {
                    kind: TextKind::Tag,
                    series,
                    ..
                } if self.heap.series(series).as_str() == "local" => {
                    mode = Mode::Locals;
                    continue;
                }
                Value::Text {
                    kind: TextKind::Text,
                    ..
                }
                | Value::Array { .. } => continue,
                _ => return Err(self.raise(RuntimeError::BadSpec { item: cell })),
            };
            if keys.iter().any(|k| self.symbols.same(k.symbol, key.symbol)) {
                return Err(self.raise(RuntimeError::BadSpec { item: cell }));
            }
            keys.push(key);
        }
        Ok(keys)
    }

    /// Add the hidden definitional RETURN slot unless a parameter is
    /// already named `return`.
    pub(crate) fn add_return_key(&self, keys: &mut Vec<Key>) {
        if !keys.iter().any(|k| self.symbols.same(k.symbol, sym::RETURN)) {
            keys.push(Key::param(sym::RETURN, ParamClass::Return).with_flags(KEY_FLAG_HIDDEN));
        }
    }

    // =========================================================================
    // Varlists
    // =========================================================================

    /// Give frame `f` a varlist for `paramlist`, all arguments null.
    pub fn push_action(
        &mut self,
        f: FrameId,
        paramlist: SeriesId,
        binding: Option<SeriesId>,
        label: Option<SymId>,
    ) {
        let params = action_num_params(&self.heap, paramlist);
        let buffer = self.arena.take(params);
        let varlist = self
            .heap
            .alloc_series(Flavor::Varlist, Content::Cells(buffer), false);
        let series = self.heap.series_mut(varlist);
        series.link = Link::Keysource(paramlist);
        series.push_unchecked(Cell::new(Value::Context {
            kind: ContextKind::Frame,
            varlist,
            phase: Some(paramlist),
            binding,
        }));
        for _ in 0..params {
            series.push_unchecked(Cell::nulled());
        }

        let frame = &mut self.frames[f.0];
        frame.original = Some(paramlist);
        frame.varlist = Some(varlist);
        frame.binding = binding;
        frame.label = label;
        frame.param = 0;
    }

    /// Release frame `f`'s varlist. An unmanaged varlist is freed; a
    /// managed one keeps a stub holding only its archetype, marked
    /// inaccessible. The buffer goes back to the arena either way.
    pub fn drop_action(&mut self, f: FrameId) {
        let Some(varlist) = self.frames[f.0].varlist.take() else {
            crash(Fatal::Invariant("drop_action on a frame with no varlist".into()));
        };
        let params = self.frames[f.0]
            .original
            .map_or(0, |p| action_num_params(&self.heap, p));
        let managed = self.heap.is_managed(varlist);
        let buffer = if managed {
            let archetype = ctx_archetype(&self.heap, varlist);
            let series = self.heap.series_mut(varlist);
            let old = series.replace_content(Content::Cells(vec![archetype]));
            series.set_info(SERIES_INFO_INACCESSIBLE);
            match old {
                Content::Cells(cells) => cells,
                _ => crash(Fatal::Invariant("frame varlist was not an array".into())),
            }
        } else {
            let cells = self.heap.take_cells(varlist);
            self.heap.free_series(varlist);
            cells
        };
        if managed {
            tracing::trace!(?varlist, "frame outlived by its varlist");
        }
        self.arena.give(params, buffer, managed);

        let frame = &mut self.frames[f.0];
        frame.original = None;
        frame.binding = None;
        frame.param = 0;
    }

    // =========================================================================
    // Argument access
    // =========================================================================

    pub fn frame_varlist(&self, f: FrameId) -> Option<SeriesId> {
        self.frames[f.0].varlist
    }

    /// Argument `index` (1-based, paramlist order) of action frame `f`.
    pub fn arg(&self, f: FrameId, index: usize) -> Cell {
        let Some(varlist) = self.frames[f.0].varlist else {
            crash(Fatal::Invariant("argument read from a frame with no action".into()));
        };
        match self.heap.series(varlist).at(index) {
            Some(cell) if index > 0 => *cell,
            _ => crash(Fatal::Invariant(format!("argument {index} out of range"))),
        }
    }

    pub fn arg_named(&self, f: FrameId, name: &str) -> Option<Cell> {
        let symbol = self.symbols.lookup(name)?;
        let paramlist = self.frames[f.0].original?;
        let index = find_param(&self.heap, &self.symbols, paramlist, symbol)?;
        Some(self.arg(f, index))
    }

    /// Whether refinement `name` was used to invoke frame `f`'s action.
    pub fn has_refinement(&self, f: FrameId, name: &str) -> bool {
        self.arg_named(f, name).is_some_and(|c| c.is_truthy())
    }

    pub(crate) fn set_arg(&mut self, f: FrameId, index: usize, value: Cell) {
        let Some(varlist) = self.frames[f.0].varlist else {
            crash(Fatal::Invariant("argument written to a frame with no action".into()));
        };
        match self.heap.series_mut(varlist).cells_mut().get_mut(index) {
            Some(slot) if index > 0 => *slot = value.copied(),
            _ => crash(Fatal::Invariant(format!("argument {index} out of range"))),
        }
    }

    /// FRAME! for the action running in `f`. The varlist becomes managed,
    /// since the value may outlive the call.
    pub fn frame_value(&mut self, f: FrameId) -> Cell {
        let Some(varlist) = self.frames[f.0].varlist else {
            crash(Fatal::Invariant("frame value of a frame with no action".into()));
        };
        self.heap.manage_series(varlist);
        ctx_archetype(&self.heap, varlist).copied()
    }

    /// ERROR! for an argument of the wrong type.
    pub fn arg_type_error(&mut self, f: FrameId, index: usize, got: &Cell) -> Flow {
        let label = self.frames[f.0].label.unwrap_or(sym::ROOT);
        let param = self.frames[f.0]
            .original
            .map_or(sym::ROOT, |p| action_param(&self.heap, p, index).symbol);
        let got = self.symbols.intern(got.kind().name());
        self.raise(RuntimeError::ExpectArg {
            label: Cell::word(WordKind::Word, label),
            param: Cell::word(WordKind::Word, param),
            got: Cell::word(WordKind::Word, got),
        })
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call an action, gathering its arguments from frame `f`'s feed.
    /// `left` is the enfix left-hand value; `refinements` come from a path.
    pub(crate) fn call_action(
        &mut self,
        f: FrameId,
        paramlist: SeriesId,
        binding: Option<SeriesId>,
        label: Option<SymId>,
        left: Option<Cell>,
        refinements: &[SymId],
    ) -> Eval<Bounce> {
        let feed = self.frames[f.0].feed;
        let af = self.push_frame(feed, false);
        self.push_action(af, paramlist, binding, label);
        let result = match self.fulfill(af, left, refinements) {
            Ok(()) => self.dispatch(af),
            Err(flow) => Err(flow),
        };
        self.drop_action(af);
        self.pop_frame(af);
        result
    }

    /// Run the dispatcher of `af`'s action on its gathered arguments.
    fn dispatch(&mut self, af: FrameId) -> Eval<Bounce> {
        let Some(paramlist) = self.frames[af.0].original else {
            crash(Fatal::Invariant("dispatch without an action".into()));
        };
        let id = action_dispatcher(&self.heap, paramlist);
        let Some(native) = self.natives.get(id as usize).copied() else {
            crash(Fatal::Invariant(format!("no dispatcher {id}")));
        };
        (native.dispatcher)(self, af)
    }

    fn fulfill(&mut self, af: FrameId, left: Option<Cell>, refinements: &[SymId]) -> Eval<()> {
        let Some(paramlist) = self.frames[af.0].original else {
            crash(Fatal::Invariant("fulfill without an action".into()));
        };
        for &refinement in refinements {
            let known = find_param(&self.heap, &self.symbols, paramlist, refinement)
                .map(|i| action_param(&self.heap, paramlist, i).class);
            if known != Some(ParamClass::Refinement) {
                let refinement = Cell::word(WordKind::Refinement, refinement);
                return Err(self.raise(RuntimeError::BadRefine { refinement }));
            }
        }

        let enfix = left.is_some();
        let mut left = left;
        let mut refinement_in_use = true;
        for index in 1..=action_num_params(&self.heap, paramlist) {
            let key = action_param(&self.heap, paramlist, index);
            self.frames[af.0].param = index;
            let arg = match key.class {
                ParamClass::Local | ParamClass::Return => Cell::nulled(),
                ParamClass::Refinement => {
                    refinement_in_use = refinements
                        .iter()
                        .any(|r| self.symbols.same(*r, key.symbol));
                    Cell::logic(refinement_in_use)
                }
                ParamClass::Normal | ParamClass::HardQuote
                    if key.flags & KEY_FLAG_REFINEMENT_ARG != 0 && !refinement_in_use =>
                {
                    Cell::nulled()
                }
                ParamClass::Normal | ParamClass::HardQuote => match left.take() {
                    Some(value) => value,
                    None => {
                        let gathered = if key.class == ParamClass::HardQuote {
                            self.take_literal(af)?
                        } else {
                            self.eval_arg(af, enfix)?
                        };
                        match gathered {
                            Some(value) => value,
                            None => return Err(self.no_arg_error(af, key.symbol)),
                        }
                    }
                },
            };
            self.set_arg(af, index, arg);
        }
        Ok(())
    }

    /// Take the next feed value without evaluating it.
    fn take_literal(&mut self, f: FrameId) -> Eval<Option<Cell>> {
        let feed = self.frames[f.0].feed;
        let Some(current) = self.feeds[feed.0].value().copied() else {
            return Ok(None);
        };
        let specifier = self.feeds[feed.0].specifier;
        self.fetch_next(feed)?;
        Ok(Some(self.derelativize(current, specifier)))
    }

    fn no_arg_error(&mut self, f: FrameId, param: SymId) -> Flow {
        let label = self.frames[f.0].label.unwrap_or(sym::ROOT);
        self.raise(RuntimeError::NoArg {
            label: Cell::word(WordKind::Word, label),
            param: Cell::word(WordKind::Word, param),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use cellvm_core::series::SERIES_INFO_INACCESSIBLE;

    fn two_params(interp: &mut Interpreter) -> SeriesId {
        let a = interp.symbols.intern("a");
        let b = interp.symbols.intern("b");
        make_action(&mut interp.heap, &[Key::new(a), Key::new(b)], 0, None)
    }

    #[test]
    fn test_push_drop_reuses_buffer() {
        let mut interp = Interpreter::new(Config::default());
        let action = two_params(&mut interp);
        let array = interp.heap.make_array(0, true);
        let feed = interp.push_array_feed(array, 0, None);
        let f = interp.push_frame(feed, true);

        let before = interp.arena_stats();
        let mut first_ptr = None;
        for _ in 0..1000 {
            interp.push_action(f, action, None, None);
            let varlist = interp.frame_varlist(f).unwrap();
            let ptr = interp.heap.series(varlist).cells().as_ptr();
            assert_eq!(*first_ptr.get_or_insert(ptr), ptr);
            assert_eq!(interp.arg(f, 2), Cell::nulled());
            interp.drop_action(f);
        }
        let after = interp.arena_stats();
        assert_eq!(after.allocated - before.allocated, 1);
        assert_eq!(after.reused - before.reused, 999);
        interp.pop_frame(f);
    }

    #[test]
    fn test_managed_varlist_leaves_inaccessible_stub() {
        let mut interp = Interpreter::new(Config::default());
        let action = two_params(&mut interp);
        let array = interp.heap.make_array(0, true);
        let feed = interp.push_array_feed(array, 0, None);
        let f = interp.push_frame(feed, true);

        interp.push_action(f, action, None, None);
        let frame = interp.frame_value(f);
        let varlist = frame.as_varlist().unwrap();
        interp.drop_action(f);

        let stub = interp.heap.series(varlist);
        assert!(stub.has_info(SERIES_INFO_INACCESSIBLE));
        assert_eq!(stub.cells().len(), 1);
        assert_eq!(interp.arena_stats().stolen, 1);
        interp.pop_frame(f);
    }

    #[test]
    fn test_spec_parsing() {
        let mut interp = Interpreter::new(Config::default());
        let spec = interp
            .scan_text("value 'name \"doc\" [integer!] /only limit <local> tmp", None)
            .unwrap();
        let keys = interp.params_from_spec(spec, 0).unwrap();
        let classes: Vec<_> = keys.iter().map(|k| k.class).collect();
        assert_eq!(
            classes,
            vec![
                ParamClass::Normal,
                ParamClass::HardQuote,
                ParamClass::Refinement,
                ParamClass::Normal,
                ParamClass::Local,
            ]
        );
        assert_ne!(keys[3].flags & KEY_FLAG_REFINEMENT_ARG, 0);
    }

    #[test]
    fn test_duplicate_param_is_an_error() {
        let mut interp = Interpreter::new(Config::default());
        let spec = interp.scan_text("a A", None).unwrap();
        let err = interp.params_from_spec(spec, 0).unwrap_err();
        let error = err.error().unwrap();
        assert_eq!(interp.error_id(&error).as_deref(), Some("bad-func-def"));
    }
}
