//! Embedding API
//!
//! Host code drives the evaluator through a handful of entry points, each
//! one an outermost recovery boundary: whatever escapes is rolled back
//! (frames, feeds, data stack, guards, manual series) before it is
//! returned. A throw nobody caught becomes a `no-catch` ERROR! here, so
//! callers only ever see `Raise` or `Halt`.
//!
//! Values that must survive collection between calls are held in API
//! handles (rooted pairings). A handle is released exactly once, either
//! explicitly or by passing it to a run as [`ApiItem::Release`].

use crate::error::RuntimeError;
use crate::interpreter::Interpreter;
use crate::throw::{Eval, Flow};
use crate::variadic::{ApiHandle, ApiItem, ItemSource, VariadicSource};
use cellvm_core::Cell;
use std::path::Path;

impl Interpreter {
    /// Root `cell` in a new API handle.
    pub fn handle(&mut self, cell: Cell) -> ApiHandle {
        self.escape(&cell);
        ApiHandle(self.heap.alloc_pairing(cell.copied()))
    }

    pub fn handle_value(&self, handle: &ApiHandle) -> Cell {
        *self.heap.pairing(handle.0)
    }

    pub fn release(&mut self, handle: ApiHandle) {
        self.heap.free_pairing(handle.0);
    }

    pub fn integer(&mut self, i: i64) -> ApiHandle {
        self.handle(Cell::integer(i))
    }

    pub fn text(&mut self, text: &str) -> ApiHandle {
        let series = self.heap.make_text(text, true);
        self.handle(Cell::text(series))
    }

    /// Evaluate a list of items as one expression stream. Empty or fully
    /// invisible input gives void.
    pub fn run(&mut self, items: Vec<ApiItem>) -> Eval<Cell> {
        self.run_with(Box::new(ItemSource::new(items)))
    }

    pub fn run_text(&mut self, source: &str) -> Eval<Cell> {
        self.run(vec![ApiItem::Text(source.to_string())])
    }

    /// Evaluate everything `source` yields.
    pub fn run_with(&mut self, source: Box<dyn VariadicSource>) -> Eval<Cell> {
        let result = self.rescue(|interp| {
            let feed = interp.push_variadic_feed(source)?;
            interp.eval_feed(feed)
        });
        self.boundary(result.map(|out| out.unwrap_or_else(Cell::void)))
    }

    /// Load and evaluate a script file. Source locations carry the file
    /// name.
    pub fn run_file(&mut self, path: &Path) -> Eval<Cell> {
        let source = match std::fs::read_to_string(path) {
            Ok(source) => source,
            Err(e) => {
                let message = format!("cannot read {}: {e}", path.display());
                return Err(self.raise(RuntimeError::User(message)));
            }
        };
        let name = path.display().to_string();
        tracing::debug!(file = %name, bytes = source.len(), "running script");
        let result = self.rescue(|interp| {
            let array = interp.load(&source, Some(&name))?;
            interp.do_array(array, 0, None)
        });
        self.boundary(result)
    }

    /// Turn an uncaught throw into an error.
    fn boundary(&mut self, result: Eval<Cell>) -> Eval<Cell> {
        match result {
            Err(Flow::Throw { label, value }) => {
                tracing::debug!("throw reached the API boundary");
                Err(self.raise(RuntimeError::NoCatch { label, value }))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::io::Write;

    #[test]
    fn test_run_mixes_text_and_cells() {
        let mut interp = Interpreter::new(Config::default());
        let result = interp
            .run(vec![
                ApiItem::Text("add".into()),
                ApiItem::Cell(Cell::integer(1)),
                ApiItem::Text("2".into()),
            ])
            .unwrap();
        assert_eq!(result.as_integer(), Some(3));
        assert_eq!(interp.depth(), 0);
    }

    #[test]
    fn test_release_item_frees_handle_once() {
        let mut interp = Interpreter::new(Config::default());
        let before = interp.heap.live_pairings();
        let handle = interp.integer(20);
        assert_eq!(interp.heap.live_pairings(), before + 1);
        let result = interp
            .run(vec![
                ApiItem::Text("add 1".into()),
                ApiItem::Release(handle),
            ])
            .unwrap();
        assert_eq!(result.as_integer(), Some(21));
        assert_eq!(interp.heap.live_pairings(), before);
    }

    #[test]
    fn test_empty_run_is_void() {
        let mut interp = Interpreter::new(Config::default());
        assert!(interp.run(vec![]).unwrap().is_void());
        assert!(interp.run_text("comment [nothing]").unwrap().is_void());
    }

    #[test]
    fn test_uncaught_throw_becomes_no_catch() {
        let mut interp = Interpreter::new(Config::default());
        let err = interp.run_text("throw 1").unwrap_err();
        let error = err.error().unwrap();
        assert_eq!(interp.error_id(&error).as_deref(), Some("no-catch"));
    }

    #[test]
    fn test_error_rolls_back_to_boundary() {
        let mut interp = Interpreter::new(Config::default());
        let manuals = interp.heap.manuals_len();
        let err = interp.run_text("add 1 undefined-word").unwrap_err();
        assert!(err.error().is_some());
        assert_eq!(interp.depth(), 0);
        assert_eq!(interp.heap.manuals_len(), manuals);
        assert_eq!(interp.stack.depth(), 0);
    }

    #[test]
    fn test_run_file_reports_missing_file() {
        let mut interp = Interpreter::new(Config::default());
        let dir = tempfile::tempdir().unwrap();
        let err = interp.run_file(&dir.path().join("missing.cvm")).unwrap_err();
        assert!(err.error().is_some());
    }

    #[test]
    fn test_run_file_evaluates_script() {
        let mut interp = Interpreter::new(Config::default());
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "x: 20").unwrap();
        writeln!(file, "x + 22").unwrap();
        let result = interp.run_file(file.path()).unwrap();
        assert_eq!(result.as_integer(), Some(42));
    }
}
