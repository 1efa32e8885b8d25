//! Path evaluation
//!
//! `a/b/c` starts from the variable `a` and picks each following element
//! out of the value reached so far:
//!
//! - OBJECT!, ERROR! or FRAME! picked by a word: that field
//! - BLOCK! or GROUP! picked by an integer: that element, 1-based, or null
//!   past either end
//!
//! A group element is evaluated and its result used as the picker. Once
//! an ACTION! is reached the remaining elements name refinements, and a
//! plain path invokes it with them (`append/only`).

use crate::error::RuntimeError;
use crate::interpreter::{FrameId, Interpreter};
use crate::throw::Eval;
use cellvm_core::context::{ctx_var, ctx_var_mut, find_key};
use cellvm_core::{
    ArrayKind, CELL_FLAG_PROTECTED, Cell, SeriesId, SymId, Value, WordKind,
};

/// Where a path walk ended up.
struct Walked {
    value: Cell,
    /// Refinement names following an ACTION!.
    refinements: Vec<SymId>,
    /// Last word picked, used as the action's label.
    label: Option<SymId>,
}

impl Interpreter {
    /// Elements of a path value, derelativized, plus the path itself.
    fn path_elements(&mut self, path: Cell, specifier: Option<SeriesId>) -> (Cell, Vec<Cell>) {
        let path = self.derelativize(path, specifier);
        let Value::Array { series, index, .. } = path.value else {
            return (path, Vec::new());
        };
        let inner = self.array_specifier(&path);
        let cells = self
            .heap
            .series(series)
            .cells()
            .get(index as usize..)
            .unwrap_or(&[])
            .to_vec();
        let elements = cells
            .into_iter()
            .map(|cell| self.derelativize(cell.unquoted(), inner).copied())
            .collect();
        (path, elements)
    }

    /// Evaluate a group element; other elements pick as themselves.
    fn picker(&mut self, element: Cell) -> Eval<Cell> {
        match element.value {
            Value::Array {
                kind: ArrayKind::Group,
                series,
                index,
                ..
            } => {
                let inner = self.array_specifier(&element);
                self.do_array(series, index as usize, inner)
            }
            _ => Ok(element),
        }
    }

    /// Walk `elements` from the head variable. `specifier` is the running
    /// frame, so a head word sees the same derived-object override a plain
    /// word would.
    fn walk_path(
        &mut self,
        path: Cell,
        elements: &[Cell],
        specifier: Option<SeriesId>,
    ) -> Eval<Walked> {
        let Some((head, rest)) = elements.split_first() else {
            return Err(self.raise(RuntimeError::BadPick {
                container: path,
                picker: Cell::blank(),
            }));
        };
        let mut label = head.as_symbol();
        let mut value = match head.value {
            Value::Word { .. } => self.get_var(head, specifier)?,
            _ => self.picker(*head)?,
        };
        let mut refinements = Vec::new();

        for (i, element) in rest.iter().enumerate() {
            if value.is_action() {
                for refinement in &rest[i..] {
                    match refinement.as_symbol() {
                        Some(symbol) => refinements.push(symbol),
                        None => {
                            return Err(self.raise(RuntimeError::BadRefine {
                                refinement: *refinement,
                            }));
                        }
                    }
                }
                break;
            }
            let picker = self.picker(*element)?;
            value = self.pick(value, picker)?;
            if let Some(symbol) = picker.as_symbol() {
                label = Some(symbol);
            }
        }
        Ok(Walked {
            value,
            refinements,
            label,
        })
    }

    /// Pick `picker` out of `container`.
    pub(crate) fn pick(&mut self, container: Cell, picker: Cell) -> Eval<Cell> {
        match (container.value, picker.value) {
            (Value::Context { varlist, .. }, Value::Word { symbol, .. }) => {
                if !self.heap.series(varlist).is_accessible() {
                    return Err(self.raise(RuntimeError::ExpiredFrame));
                }
                let Some(index) = find_key(&self.heap, &self.symbols, varlist, symbol) else {
                    return Err(self.raise(RuntimeError::BadPick { container, picker }));
                };
                let mut value = ctx_var(&self.heap, varlist, index).copied();
                if let Value::Action { binding, .. } = &mut value.value
                    && binding.is_none()
                {
                    *binding = Some(varlist);
                }
                Ok(value)
            }
            (Value::Array { series, index, .. }, Value::Integer(n)) => {
                let cells = self.heap.series(series).cells();
                let position = n
                    .checked_sub(1)
                    .and_then(|offset| (index as i64).checked_add(offset));
                let value = match position {
                    Some(p) if n >= 1 && p >= 0 => cells.get(p as usize).copied(),
                    _ => None,
                };
                Ok(match value {
                    Some(cell) => {
                        let specifier = self.array_specifier(&container);
                        self.derelativize(cell, specifier).copied()
                    }
                    None => Cell::nulled(),
                })
            }
            _ => Err(self.raise(RuntimeError::BadPick { container, picker })),
        }
    }

    /// `a/b/c`: pick, invoking an ACTION! at the end.
    pub(crate) fn eval_path(
        &mut self,
        f: FrameId,
        path: Cell,
        specifier: Option<SeriesId>,
    ) -> Eval<()> {
        let (path, elements) = self.path_elements(path, specifier);
        let walked = self.walk_path(path, &elements, specifier)?;
        match walked.value.value {
            Value::Action { paramlist, binding } => {
                let bounce = self.call_action(
                    f,
                    paramlist,
                    binding,
                    walked.label,
                    None,
                    &walked.refinements,
                )?;
                self.apply_bounce(f, bounce);
            }
            Value::Void => {
                return Err(self.raise(RuntimeError::NoValue { word: path }));
            }
            _ => self.set_out(f, walked.value),
        }
        Ok(())
    }

    /// `:a/b/c`: pick without invoking.
    pub(crate) fn get_path(
        &mut self,
        f: FrameId,
        path: Cell,
        specifier: Option<SeriesId>,
    ) -> Eval<()> {
        let (path, elements) = self.path_elements(path, specifier);
        let walked = self.walk_path(path, &elements, specifier)?;
        if let Some(&refinement) = walked.refinements.first() {
            let refinement = Cell::word(WordKind::Refinement, refinement);
            return Err(self.raise(RuntimeError::BadRefine { refinement }));
        }
        self.set_out(f, walked.value);
        Ok(())
    }

    /// `a/b/c: value`: evaluate the next expression and store it in the
    /// last element's slot.
    pub(crate) fn set_path(
        &mut self,
        f: FrameId,
        path: Cell,
        specifier: Option<SeriesId>,
    ) -> Eval<()> {
        let (path, elements) = self.path_elements(path, specifier);
        let Some(value) = self.eval_arg(f, false)? else {
            return Err(self.raise(RuntimeError::NeedValue { word: path }));
        };
        let Some((last, parent)) = elements.split_last() else {
            return Err(self.raise(RuntimeError::BadPick {
                container: path,
                picker: Cell::blank(),
            }));
        };
        if parent.is_empty() {
            // `a:` written as a path
            self.set_var(last, specifier, value)?;
            self.set_out(f, value);
            return Ok(());
        }
        let walked = self.walk_path(path, parent, specifier)?;
        let container = walked.value;
        let picker = self.picker(*last)?;
        self.poke(container, picker, value)?;
        self.set_out(f, value);
        Ok(())
    }

    fn poke(&mut self, container: Cell, picker: Cell, value: Cell) -> Eval<()> {
        match (container.value, picker.value) {
            (Value::Context { varlist, .. }, Value::Word { symbol, .. }) => {
                if !self.heap.series(varlist).is_accessible() {
                    return Err(self.raise(RuntimeError::ExpiredFrame));
                }
                let Some(index) = find_key(&self.heap, &self.symbols, varlist, symbol) else {
                    return Err(self.raise(RuntimeError::BadPick { container, picker }));
                };
                if let Err(e) = self.heap.series(varlist).check_mutable(false) {
                    return Err(self.raise(RuntimeError::Locked(e)));
                }
                if ctx_var(&self.heap, varlist, index).has_flag(CELL_FLAG_PROTECTED) {
                    return Err(self.raise(RuntimeError::ProtectedWord { word: picker }));
                }
                self.escape(&value);
                ctx_var_mut(&mut self.heap, varlist, index).assign(&value);
                Ok(())
            }
            (Value::Array { series, index, .. }, Value::Integer(n)) if n >= 1 => {
                let position = index as usize + (n as usize - 1);
                self.escape(&value);
                self.heap
                    .series_mut(series)
                    .set(position, value.copied())
                    .map_err(|e| self.raise(RuntimeError::Locked(e)))
            }
            _ => Err(self.raise(RuntimeError::BadPick { container, picker })),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::Config;
    use crate::interpreter::Interpreter;
    use crate::throw::Eval;
    use cellvm_core::Cell;

    fn eval(interp: &mut Interpreter, source: &str) -> Eval<Cell> {
        let array = interp.load(source, None)?;
        interp.do_array(array, 0, None)
    }

    #[test]
    fn test_pick_object_field() {
        let mut interp = Interpreter::new(Config::default());
        let result = eval(&mut interp, "o: object [x: 10] o/x").unwrap();
        assert_eq!(result.as_integer(), Some(10));
    }

    #[test]
    fn test_set_path_updates_field() {
        let mut interp = Interpreter::new(Config::default());
        let result = eval(&mut interp, "o: object [x: 10] o/x: 20 o/x").unwrap();
        assert_eq!(result.as_integer(), Some(20));
    }

    #[test]
    fn test_block_pick_out_of_range_is_null() {
        let mut interp = Interpreter::new(Config::default());
        let b = eval(&mut interp, "b: [1 2 3] b/2").unwrap();
        assert_eq!(b.as_integer(), Some(2));
        let missing = eval(&mut interp, "b/4").unwrap();
        assert!(missing.is_nulled());
    }

    #[test]
    fn test_extreme_integer_pickers_are_null() {
        let mut interp = Interpreter::new(Config::default());
        let source = "b: [1 2] n: 0 - 9223372036854775807 - 1 b/(n)";
        assert!(eval(&mut interp, source).unwrap().is_nulled());
        assert!(eval(&mut interp, "b/0").unwrap().is_nulled());
        assert!(eval(&mut interp, "b/9223372036854775807").unwrap().is_nulled());
    }

    #[test]
    fn test_path_head_in_method_follows_derived_object() {
        let mut interp = Interpreter::new(Config::default());
        let source = "o1: object [x: 1 data: [1 2] f: func [] [x] g: func [] [data/1]]
            o2: derive o1 [x: 3 data: [3 4]]";
        eval(&mut interp, source).unwrap();
        assert_eq!(eval(&mut interp, "o2/f").unwrap().as_integer(), Some(3));
        assert_eq!(eval(&mut interp, "o2/g").unwrap().as_integer(), Some(3));
        assert_eq!(eval(&mut interp, "o1/g").unwrap().as_integer(), Some(1));
    }

    #[test]
    fn test_set_path_head_in_method_follows_derived_object() {
        let mut interp = Interpreter::new(Config::default());
        let source = "o1: object [data: [1 2] poke-first: func [v] [data/1: v]]
            o2: derive o1 [data: [3 4]]
            o2/poke-first 9";
        eval(&mut interp, source).unwrap();
        assert_eq!(eval(&mut interp, "o2/data/1").unwrap().as_integer(), Some(9));
        assert_eq!(eval(&mut interp, "o1/data/1").unwrap().as_integer(), Some(1));
    }

    #[test]
    fn test_missing_field_is_bad_pick() {
        let mut interp = Interpreter::new(Config::default());
        let err = eval(&mut interp, "o: object [x: 10] o/y").unwrap_err();
        let error = err.error().unwrap();
        assert_eq!(interp.error_id(&error).as_deref(), Some("bad-pick"));
    }

    #[test]
    fn test_unknown_refinement_is_bad_refine() {
        let mut interp = Interpreter::new(Config::default());
        let err = eval(&mut interp, "add/nonsense 1 2").unwrap_err();
        let error = err.error().unwrap();
        assert_eq!(interp.error_id(&error).as_deref(), Some("bad-refine"));
        assert_eq!(interp.depth(), 0);
    }
}
