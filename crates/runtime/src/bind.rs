//! Binding and variable resolution
//!
//! A word finds its variable through its binding:
//!
//! - `Specific { varlist, index }`: slot `index` of that context, unless
//!   the specifier's frame was invoked through a context that overrides it
//!   (a derived object standing in for its parent, see
//!   [`is_overriding_context`])
//! - `Relative { paramlist, index }`: slot `index` of the frame given as
//!   specifier, which must be running that paramlist
//! - `Unbound`: no variable
//!
//! Relative values only exist inside function bodies. Any value copied out
//! of a body into a place without a specifier is *derelativized* first,
//! which also manages the frame's varlist so it can outlive the call.

use crate::error::RuntimeError;
use crate::interpreter::Interpreter;
use crate::throw::{Eval, Flow};
use cellvm_core::context::{
    ctx_archetype, ctx_keysource, ctx_key, ctx_len, ctx_var, ctx_var_mut, ensure_key,
    is_overriding_context,
};
use cellvm_core::{
    Binder, Binding, CELL_FLAG_PROTECTED, Cell, ContextKind, Fatal, Flavor, SeriesId, Specifier,
    SymId, Value, WordKind, crash,
};
use std::collections::{HashMap, HashSet};

enum Unresolved {
    Unbound,
    Expired,
}

impl Interpreter {
    // =========================================================================
    // Resolution
    // =========================================================================

    fn resolve(
        &self,
        word: &Cell,
        specifier: Option<SeriesId>,
    ) -> Result<(SeriesId, u32), Unresolved> {
        let Value::Word { binding, .. } = word.value else {
            crash(Fatal::Invariant(format!("resolving non-word {word:?}")));
        };
        let (varlist, index) = match binding {
            Binding::Unbound => return Err(Unresolved::Unbound),
            Binding::Relative { paramlist, index } => {
                (self.frame_for(paramlist, specifier), index)
            }
            Binding::Specific { varlist, index } => {
                (self.override_for(varlist, specifier), index)
            }
        };
        if !self.heap.series(varlist).is_accessible() {
            return Err(Unresolved::Expired);
        }
        Ok((varlist, index))
    }

    /// The specifier frame a relative value of `paramlist` resolves in.
    fn frame_for(&self, paramlist: SeriesId, specifier: Option<SeriesId>) -> SeriesId {
        match specifier {
            Some(frame) if ctx_keysource(&self.heap, frame) == paramlist => frame,
            Some(frame) => crash(Fatal::Invariant(format!(
                "specifier {frame:?} is not a frame of {paramlist:?}"
            ))),
            None => crash(Fatal::Invariant(
                "relative value used without a specifier".into(),
            )),
        }
    }

    /// Apply the derived-binding override: if the specifier frame's action
    /// was invoked through a context that overrides `stored`, use it.
    fn override_for(&self, stored: SeriesId, specifier: Option<SeriesId>) -> SeriesId {
        let Some(frame) = specifier else {
            return stored;
        };
        match ctx_archetype(&self.heap, frame).value {
            Value::Context {
                binding: Some(candidate),
                ..
            } if candidate != stored && is_overriding_context(&self.heap, stored, candidate) => {
                candidate
            }
            _ => stored,
        }
    }

    fn unresolved(&mut self, why: Unresolved, word: &Cell, specifier: Option<SeriesId>) -> Flow {
        match why {
            Unresolved::Unbound => {
                let word = self.derelativize(*word, specifier).copied();
                self.raise(RuntimeError::NotBound { word })
            }
            Unresolved::Expired => self.raise(RuntimeError::ExpiredFrame),
        }
    }

    /// Value of the variable `word` refers to.
    pub fn get_var(&mut self, word: &Cell, specifier: Option<SeriesId>) -> Eval<Cell> {
        match self.resolve(word, specifier) {
            Ok((varlist, index)) => Ok(ctx_var(&self.heap, varlist, index).copied()),
            Err(why) => Err(self.unresolved(why, word, specifier)),
        }
    }

    /// Value of the variable, or `None` if it can't be resolved.
    pub(crate) fn peek_var(&self, word: &Cell, specifier: Option<SeriesId>) -> Option<Cell> {
        let (varlist, index) = self.resolve(word, specifier).ok()?;
        Some(ctx_var(&self.heap, varlist, index).copied())
    }

    /// Assign the variable `word` refers to, honoring protection.
    pub fn set_var(&mut self, word: &Cell, specifier: Option<SeriesId>, value: Cell) -> Eval<()> {
        let (varlist, index) = match self.resolve(word, specifier) {
            Ok(found) => found,
            Err(why) => return Err(self.unresolved(why, word, specifier)),
        };
        if let Err(e) = self.heap.series(varlist).check_mutable(false) {
            return Err(self.raise(RuntimeError::Locked(e)));
        }
        if ctx_var(&self.heap, varlist, index).has_flag(CELL_FLAG_PROTECTED) {
            let word = self.derelativize(*word, specifier).copied();
            return Err(self.raise(RuntimeError::ProtectedWord { word }));
        }
        ctx_var_mut(&mut self.heap, varlist, index).assign(&value);
        Ok(())
    }

    /// Protect (or unprotect) the variable a word refers to.
    pub fn protect_word(&mut self, word: &Cell, protect: bool) -> Eval<()> {
        match self.resolve(word, None) {
            Ok((varlist, index)) => {
                cellvm_core::context::protect_var(&mut self.heap, varlist, index, protect);
                Ok(())
            }
            Err(why) => Err(self.unresolved(why, word, None)),
        }
    }

    // =========================================================================
    // Specifying
    // =========================================================================

    /// Resolve a relative value against `specifier`, producing one that is
    /// usable anywhere.
    pub fn derelativize(&mut self, cell: Cell, specifier: Option<SeriesId>) -> Cell {
        let mut cell = cell;
        match &mut cell.value {
            Value::Word { binding, .. } => {
                if let Binding::Relative { paramlist, index } = *binding {
                    let frame = self.frame_for(paramlist, specifier);
                    self.heap.manage_series(frame);
                    *binding = Binding::Specific {
                        varlist: frame,
                        index,
                    };
                }
            }
            Value::Array { specifier: s, .. } => {
                if let Specifier::Relative(paramlist) = *s {
                    let frame = self.frame_for(paramlist, specifier);
                    self.heap.manage_series(frame);
                    *s = Specifier::Frame(frame);
                }
            }
            _ => {}
        }
        cell
    }

    /// Manage any frame varlist `value` refers to, since it is about to be
    /// stored where it can outlive the frame.
    pub(crate) fn escape(&mut self, value: &Cell) {
        let target = match value.value {
            Value::Context {
                kind: ContextKind::Frame,
                varlist,
                ..
            } => Some(varlist),
            Value::Word {
                binding: Binding::Specific { varlist, .. },
                ..
            } => Some(varlist),
            Value::Array {
                specifier: Specifier::Frame(varlist),
                ..
            } => Some(varlist),
            Value::Action {
                binding: Some(varlist),
                ..
            } => Some(varlist),
            _ => None,
        };
        if let Some(varlist) = target
            && !self.heap.is_managed(varlist)
            && self.heap.series(varlist).flavor() == Flavor::Varlist
        {
            cellvm_core::context::manage_context(&mut self.heap, varlist);
        }
    }

    /// Frame varlist an array value is specified by (after derelativizing).
    pub(crate) fn array_specifier(&self, cell: &Cell) -> Option<SeriesId> {
        match cell.value {
            Value::Array {
                specifier: Specifier::Frame(frame),
                ..
            } => Some(frame),
            Value::Array {
                specifier: Specifier::Relative(_),
                ..
            } => crash(Fatal::Invariant("array used without derelativizing".into())),
            _ => None,
        }
    }

    // =========================================================================
    // Deep copy and bind
    // =========================================================================

    /// Copy an array and every array nested in it, derelativizing the
    /// cells against `specifier`. The copies are managed.
    pub fn copy_deep(
        &mut self,
        series: SeriesId,
        index: usize,
        specifier: Option<SeriesId>,
    ) -> SeriesId {
        let mut copies = HashMap::new();
        self.copy_deep_inner(series, index, specifier, &mut copies)
    }

    fn copy_deep_inner(
        &mut self,
        series: SeriesId,
        index: usize,
        specifier: Option<SeriesId>,
        copies: &mut HashMap<SeriesId, SeriesId>,
    ) -> SeriesId {
        let source = self.heap.series(series).cells().get(index..).unwrap_or(&[]).to_vec();
        let copy = self.heap.make_array_from(&[], true);
        copies.insert(series, copy);
        let mut cells = Vec::with_capacity(source.len());
        for cell in source {
            let mut cell = self.derelativize(cell, specifier);
            if let Value::Array {
                series: inner,
                index: inner_index,
                specifier: inner_specifier,
                ..
            } = &mut cell.value
            {
                let nested_specifier = match *inner_specifier {
                    Specifier::Frame(frame) => Some(frame),
                    _ => None,
                };
                let new = match copies.get(inner) {
                    Some(done) => *done,
                    None => self.copy_deep_inner(
                        *inner,
                        *inner_index as usize,
                        nested_specifier,
                        copies,
                    ),
                };
                *inner = new;
                *inner_index = 0;
                *inner_specifier = Specifier::Specified;
            }
            cells.push(cell);
        }
        for cell in cells {
            self.heap.series_mut(copy).push_unchecked(cell);
        }
        copy
    }

    /// Visit every array reachable from `root` once, including `root`.
    fn arrays_deep(&self, root: SeriesId) -> Vec<SeriesId> {
        let mut seen = HashSet::new();
        let mut pending = vec![root];
        let mut order = Vec::new();
        while let Some(series) = pending.pop() {
            if !seen.insert(series) {
                continue;
            }
            order.push(series);
            for cell in self.heap.series(series).cells() {
                if let Value::Array { series: inner, .. } = cell.value {
                    pending.push(inner);
                }
            }
        }
        order
    }

    /// Bind words of `array` (deeply) that name variables of `context`.
    pub fn bind_deep(&mut self, array: SeriesId, context: SeriesId) {
        let mut binder = Binder::new(&mut self.symbols);
        let keys: Vec<(SymId, u32)> = (1..=ctx_len(&self.heap, context) as u32)
            .map(|i| (ctx_key(&self.heap, context, i), i))
            .filter(|(key, _)| !key.is_hidden())
            .map(|(key, i)| (key.symbol, i))
            .collect();
        for &(symbol, index) in &keys {
            binder.try_add(&mut self.symbols, symbol, index);
        }

        for series in self.arrays_deep(array) {
            let symbols = &self.symbols;
            for cell in self.heap.series_mut(series).cells_mut() {
                if let Value::Word {
                    kind,
                    symbol,
                    binding,
                } = &mut cell.value
                    && *kind != WordKind::Refinement
                    && let Some(index) = binder.get(symbols, *symbol)
                {
                    *binding = Binding::Specific {
                        varlist: context,
                        index,
                    };
                }
            }
        }

        for &(symbol, _) in &keys {
            binder.try_remove(&mut self.symbols, symbol);
        }
        binder.shutdown(&mut self.symbols);
    }

    /// Make the words of a function body that name parameters relative to
    /// `paramlist`, and mark nested arrays as needing a specifier.
    pub fn relativize_deep(&mut self, body: SeriesId, paramlist: SeriesId) {
        let mut binder = Binder::new(&mut self.symbols);
        let keys: Vec<SymId> = self
            .heap
            .series(paramlist)
            .keys()
            .get(1..)
            .unwrap_or(&[])
            .iter()
            .map(|key| key.symbol)
            .collect();
        for (i, &symbol) in keys.iter().enumerate() {
            binder.try_add(&mut self.symbols, symbol, i as u32 + 1);
        }

        for series in self.arrays_deep(body) {
            let symbols = &self.symbols;
            for cell in self.heap.series_mut(series).cells_mut() {
                match &mut cell.value {
                    Value::Word {
                        kind,
                        symbol,
                        binding,
                    } if *kind != WordKind::Refinement => {
                        if let Some(index) = binder.get(symbols, *symbol) {
                            *binding = Binding::Relative { paramlist, index };
                        }
                    }
                    Value::Array { specifier, .. } if *specifier == Specifier::Specified => {
                        *specifier = Specifier::Relative(paramlist);
                    }
                    _ => {}
                }
            }
        }

        for &symbol in &keys {
            binder.try_remove(&mut self.symbols, symbol);
        }
        binder.shutdown(&mut self.symbols);
    }

    /// Set-words at the top level of `array`, in order, without duplicates.
    pub(crate) fn collect_set_words(&mut self, array: SeriesId, index: usize) -> Vec<SymId> {
        let mut binder = Binder::new(&mut self.symbols);
        let mut found = Vec::new();
        let cells = self.heap.series(array).cells().get(index..).unwrap_or(&[]).to_vec();
        for cell in cells {
            if let Value::Word {
                kind: WordKind::Set,
                symbol,
                ..
            } = cell.value
                && cell.quote_depth() == 0
                && binder.try_add(&mut self.symbols, symbol, found.len() as u32 + 1)
            {
                found.push(symbol);
            }
        }
        for &symbol in &found {
            binder.remove(&mut self.symbols, symbol);
        }
        binder.shutdown(&mut self.symbols);
        found
    }

    // =========================================================================
    // Loading
    // =========================================================================

    /// Scan source text and bind it for evaluation in `user`.
    ///
    /// Every set-word (at any depth) gets a variable in `user`. Other
    /// words bind to `user` if it has them, else to `lib`, else stay
    /// unbound.
    pub fn load(&mut self, source: &str, file: Option<&str>) -> Eval<SeriesId> {
        let file = file.map(|f| self.symbols.intern(f));
        let (array, set_words) = self.scan_collecting(source, file)?;
        let user = self.user;
        for symbol in set_words {
            if let Err(e) = ensure_key(&mut self.heap, &self.symbols, user, symbol) {
                return Err(self.raise(RuntimeError::Locked(e)));
            }
        }
        self.bind_loaded(array);
        Ok(array)
    }

    pub(crate) fn load_fragment(&mut self, source: &str) -> Eval<SeriesId> {
        self.load(source, None)
    }

    fn bind_loaded(&mut self, array: SeriesId) {
        let (user, lib) = (self.user, self.lib);
        let mut user_binder = Binder::new(&mut self.symbols);
        let mut lib_binder = Binder::new(&mut self.symbols);
        let user_keys = self.visible_keys(user);
        let lib_keys = self.visible_keys(lib);
        for &(symbol, index) in &user_keys {
            user_binder.try_add(&mut self.symbols, symbol, index);
        }
        for &(symbol, index) in &lib_keys {
            lib_binder.try_add(&mut self.symbols, symbol, index);
        }

        for series in self.arrays_deep(array) {
            let symbols = &self.symbols;
            for cell in self.heap.series_mut(series).cells_mut() {
                if let Value::Word {
                    kind,
                    symbol,
                    binding,
                } = &mut cell.value
                    && *kind != WordKind::Refinement
                    && *binding == Binding::Unbound
                {
                    if let Some(index) = user_binder.get(symbols, *symbol) {
                        *binding = Binding::Specific { varlist: user, index };
                    } else if let Some(index) = lib_binder.get(symbols, *symbol) {
                        *binding = Binding::Specific { varlist: lib, index };
                    }
                }
            }
        }

        for &(symbol, _) in &user_keys {
            user_binder.try_remove(&mut self.symbols, symbol);
        }
        for &(symbol, _) in &lib_keys {
            lib_binder.try_remove(&mut self.symbols, symbol);
        }
        lib_binder.shutdown(&mut self.symbols);
        user_binder.shutdown(&mut self.symbols);
    }

    fn visible_keys(&self, context: SeriesId) -> Vec<(SymId, u32)> {
        (1..=ctx_len(&self.heap, context) as u32)
            .filter_map(|i| {
                let key = ctx_key(&self.heap, context, i);
                (!key.is_hidden()).then_some((key.symbol, i))
            })
            .collect()
    }

    /// Look up a word's value in `user`, then `lib`, by spelling.
    pub fn lookup(&self, name: &str) -> Option<Cell> {
        let symbol = self.symbols.lookup(name)?;
        [self.user, self.lib].into_iter().find_map(|context| {
            let index =
                cellvm_core::context::find_key(&self.heap, &self.symbols, context, symbol)?;
            Some(ctx_var(&self.heap, context, index).copied())
        })
    }
}
