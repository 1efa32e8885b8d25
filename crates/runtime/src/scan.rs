//! Scanner
//!
//! Turns source text into an array of unbound cells. The syntax is small:
//!
//! ```text
//! [block]  (group)  "text"  {braced text}  <tag>  #{BINARY}
//! 10  -3  1.5  _  word  word:  :word  /refinement  'quoted  ''twice
//! a/b/1  a/b:  :a/b  a/(expr)
//! ; comment to end of line
//! ```
//!
//! Nested values are collected on the data stack and popped into arrays
//! as each one closes. Arrays remember the file and line they started on.
//! String escapes are decoded into a scratch bump arena before being
//! copied into a text series.

use crate::error::RuntimeError;
use crate::interpreter::Interpreter;
use crate::throw::Eval;
use bumpalo::Bump;
use bumpalo::collections::String as BumpString;
use cellvm_core::series::{Link, Misc};
use cellvm_core::{
    ArrayKind, Binder, CELL_FLAG_NEWLINE_BEFORE, Cell, SeriesId, SymId, TextKind, Value,
    WordKind,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("missing {expected} (line {line})")]
    Missing { expected: char, line: u32 },
    #[error("unexpected {found} (line {line})")]
    Extra { found: char, line: u32 },
    #[error("invalid {what}: {near} (line {line})")]
    Invalid {
        what: &'static str,
        near: String,
        line: u32,
    },
}

fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '[' | ']' | '(' | ')' | '{' | '}' | '"' | ';')
}

struct Scanner<'a, 's, 'b> {
    interp: &'a mut Interpreter,
    source: &'s str,
    pos: usize,
    line: u32,
    file: Option<SymId>,
    newline_pending: bool,
    scratch: &'b Bump,
    /// Set-words seen so far, when collecting.
    collect: Option<(Binder, Vec<SymId>)>,
}

impl<'a, 's, 'b> Scanner<'a, 's, 'b> {
    fn new(
        interp: &'a mut Interpreter,
        source: &'s str,
        file: Option<SymId>,
        scratch: &'b Bump,
    ) -> Self {
        Scanner {
            interp,
            source,
            pos: 0,
            line: 1,
            file,
            newline_pending: false,
            scratch,
            collect: None,
        }
    }

    fn peek(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn peek_second(&self) -> Option<char> {
        let mut chars = self.source[self.pos..].chars();
        chars.next();
        chars.next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn invalid(&self, what: &'static str, start: usize) -> ScanError {
        let end = self.source[start..]
            .find(is_delimiter)
            .map_or(self.source.len(), |n| (start + n).max(self.pos));
        ScanError::Invalid {
            what,
            near: self.source[start..end].to_string(),
            line: self.line,
        }
    }

    fn skip_space(&mut self) {
        while let Some(c) = self.peek() {
            match c {
                '\n' => {
                    self.newline_pending = true;
                    self.bump();
                }
                ';' => {
                    while let Some(c) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                c if c.is_whitespace() => {
                    self.bump();
                }
                _ => return,
            }
        }
    }

    /// Scan values up to `close` (or the end of input when `None`) into a
    /// new array.
    fn scan_array(&mut self, close: Option<char>) -> Result<SeriesId, ScanError> {
        let base = self.interp.stack.depth();
        let line = self.line;
        loop {
            self.skip_space();
            match self.peek() {
                None => match close {
                    None => break,
                    Some(expected) => {
                        self.interp.stack.drop_to(base);
                        return Err(ScanError::Missing {
                            expected,
                            line: self.line,
                        });
                    }
                },
                Some(c @ (']' | ')')) => {
                    if Some(c) == close {
                        self.bump();
                        break;
                    }
                    self.interp.stack.drop_to(base);
                    return Err(ScanError::Extra {
                        found: c,
                        line: self.line,
                    });
                }
                Some(_) => {
                    let newline = std::mem::take(&mut self.newline_pending);
                    match self.scan_value() {
                        Ok(mut cell) => {
                            if newline {
                                cell.set_flag(CELL_FLAG_NEWLINE_BEFORE);
                            }
                            self.interp.stack.push(cell);
                        }
                        Err(e) => {
                            self.interp.stack.drop_to(base);
                            return Err(e);
                        }
                    }
                }
            }
        }
        let array = self.interp.stack.pop_to_array(&mut self.interp.heap, base, true);
        let series = self.interp.heap.series_mut(array);
        if let Some(file) = self.file {
            series.link = Link::File(file);
        }
        series.misc = Misc::Line(line);
        Ok(array)
    }

    fn scan_value(&mut self) -> Result<Cell, ScanError> {
        let start = self.pos;
        match (self.peek(), self.peek_second()) {
            (Some('['), _) => {
                self.bump();
                let array = self.scan_array(Some(']'))?;
                Ok(Cell::array(ArrayKind::Block, array))
            }
            (Some('('), _) => {
                self.bump();
                let array = self.scan_array(Some(')'))?;
                Ok(Cell::array(ArrayKind::Group, array))
            }
            (Some('"'), _) => self.scan_quoted_text(),
            (Some('{'), _) => self.scan_braced_text(),
            (Some('#'), Some('{')) => self.scan_binary(),
            (Some('<'), Some(c)) if c.is_alphabetic() => self.scan_tag(),
            (Some('\''), _) => {
                let mut depth: u8 = 0;
                while self.peek() == Some('\'') {
                    self.bump();
                    depth = depth
                        .checked_add(1)
                        .ok_or_else(|| self.invalid("quote", start))?;
                }
                match self.peek() {
                    Some(c) if !is_delimiter(c) || matches!(c, '[' | '(' | '"' | '{') => {}
                    _ => return Err(self.invalid("quote", start)),
                }
                let cell = self.scan_value()?;
                cell.quoted(depth).ok_or_else(|| self.invalid("quote", start))
            }
            (Some('/'), Some(c)) if !is_delimiter(c) && c != '/' => {
                self.bump();
                let atom = self.take_atom();
                if atom.is_empty() || atom.ends_with(':') {
                    return Err(self.invalid("refinement", start));
                }
                let symbol = self.interp.symbols.intern(atom);
                Ok(Cell::word(WordKind::Refinement, symbol))
            }
            _ => self.scan_word_or_path(),
        }
    }

    /// Characters up to the next delimiter or path separator.
    fn take_atom(&mut self) -> &'s str {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if is_delimiter(c) || (c == '/' && self.pos > start) {
                break;
            }
            self.bump();
        }
        let source = self.source;
        &source[start..self.pos]
    }

    fn scan_word_or_path(&mut self) -> Result<Cell, ScanError> {
        let start = self.pos;
        let get = self.peek() == Some(':');
        if get {
            self.bump();
        }
        let mut elements = vec![self.scan_element(start)?];
        while self.peek() == Some('/')
            && self
                .peek_second()
                .is_some_and(|c| !is_delimiter(c) || c == '(')
        {
            self.bump();
            if self.peek() == Some('(') {
                self.bump();
                let group = self.scan_array(Some(')'))?;
                elements.push((Cell::array(ArrayKind::Group, group), false));
            } else {
                elements.push(self.scan_element(start)?);
            }
        }
        let set = elements.last().is_some_and(|(_, set)| *set);
        if elements[..elements.len() - 1].iter().any(|(_, s)| *s) || (get && set) {
            return Err(self.invalid("path", start));
        }

        if elements.len() == 1 {
            let (cell, _) = elements[0];
            return match cell.value {
                Value::Word { symbol, .. } if get => Ok(Cell::word(WordKind::Get, symbol)),
                Value::Word { symbol, .. } if set => {
                    self.collect_set_word(symbol);
                    Ok(Cell::word(WordKind::Set, symbol))
                }
                _ if get || set => Err(self.invalid("word", start)),
                _ => Ok(cell),
            };
        }

        let kind = match (get, set) {
            (true, _) => ArrayKind::GetPath,
            (_, true) => ArrayKind::SetPath,
            _ => ArrayKind::Path,
        };
        let base = self.interp.stack.depth();
        for (cell, _) in elements {
            self.interp.stack.push(cell);
        }
        let array = self.interp.stack.pop_to_array(&mut self.interp.heap, base, true);
        self.interp.heap.series_mut(array).misc = Misc::Line(self.line);
        Ok(Cell::array(kind, array))
    }

    /// One word-like atom: number, blank or word. The flag is set if it
    /// ended in a colon.
    fn scan_element(&mut self, start: usize) -> Result<(Cell, bool), ScanError> {
        let atom = self.take_atom();
        let (text, set) = match atom.strip_suffix(':') {
            Some(stripped) => (stripped, true),
            None => (atom, false),
        };
        if text.is_empty() || text.contains(':') {
            return Err(self.invalid("word", start));
        }
        let mut chars = text.chars();
        let first = chars.next();
        let second = chars.next();
        let numeric = match first {
            Some(c) if c.is_ascii_digit() => true,
            Some('-' | '+') => second.is_some_and(|c| c.is_ascii_digit()),
            _ => false,
        };
        let cell = if numeric {
            if set {
                return Err(self.invalid("word", start));
            }
            self.number(text, start)?
        } else if text == "_" {
            Cell::blank()
        } else {
            let symbol = self.interp.symbols.intern(text);
            Cell::word(WordKind::Word, symbol)
        };
        Ok((cell, set))
    }

    fn number(&self, text: &str, start: usize) -> Result<Cell, ScanError> {
        if text.contains('.') {
            text.parse::<f64>()
                .map(Cell::decimal)
                .map_err(|_| self.invalid("decimal", start))
        } else {
            text.parse::<i64>()
                .map(Cell::integer)
                .map_err(|_| self.invalid("integer", start))
        }
    }

    fn scan_quoted_text(&mut self) -> Result<Cell, ScanError> {
        let line = self.line;
        self.bump();
        let mut text = BumpString::new_in(self.scratch);
        loop {
            match self.bump() {
                None | Some('\n') => {
                    return Err(ScanError::Missing {
                        expected: '"',
                        line,
                    });
                }
                Some('"') => break,
                Some('^') => match self.bump() {
                    Some('/') => text.push('\n'),
                    Some('-') => text.push('\t'),
                    Some(c @ ('"' | '^' | '{' | '}')) => text.push(c),
                    _ => {
                        return Err(ScanError::Invalid {
                            what: "escape",
                            near: text.to_string(),
                            line: self.line,
                        });
                    }
                },
                Some(c) => text.push(c),
            }
        }
        let series = self.interp.heap.make_text(&text, true);
        Ok(Cell::text(series))
    }

    fn scan_braced_text(&mut self) -> Result<Cell, ScanError> {
        let line = self.line;
        self.bump();
        let mut depth = 1usize;
        let mut text = BumpString::new_in(self.scratch);
        loop {
            match self.bump() {
                None => {
                    return Err(ScanError::Missing {
                        expected: '}',
                        line,
                    });
                }
                Some('{') => {
                    depth += 1;
                    text.push('{');
                }
                Some('}') => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                    text.push('}');
                }
                Some('^') => match self.bump() {
                    Some('/') => text.push('\n'),
                    Some('-') => text.push('\t'),
                    Some(c) => text.push(c),
                    None => {
                        return Err(ScanError::Missing {
                            expected: '}',
                            line,
                        });
                    }
                },
                Some(c) => text.push(c),
            }
        }
        let series = self.interp.heap.make_text(&text, true);
        Ok(Cell::text(series))
    }

    fn scan_tag(&mut self) -> Result<Cell, ScanError> {
        let line = self.line;
        self.bump();
        let start = self.pos;
        loop {
            match self.peek() {
                None | Some('\n') => {
                    return Err(ScanError::Missing {
                        expected: '>',
                        line,
                    });
                }
                Some('>') => break,
                Some(_) => {
                    self.bump();
                }
            }
        }
        let series = self.interp.heap.make_text(&self.source[start..self.pos], true);
        self.bump();
        Ok(Cell::new(Value::Text {
            kind: TextKind::Tag,
            series,
            index: 0,
        }))
    }

    fn scan_binary(&mut self) -> Result<Cell, ScanError> {
        let start = self.pos;
        let line = self.line;
        self.bump();
        self.bump();
        let mut digits = BumpString::new_in(self.scratch);
        loop {
            match self.bump() {
                None => {
                    return Err(ScanError::Missing {
                        expected: '}',
                        line,
                    });
                }
                Some('}') => break,
                Some(c) if c.is_whitespace() => {}
                Some(c) if c.is_ascii_hexdigit() => digits.push(c),
                Some(_) => return Err(self.invalid("binary", start)),
            }
        }
        if digits.len() % 2 != 0 {
            return Err(self.invalid("binary", start));
        }
        let bytes: Vec<u8> = digits
            .as_bytes()
            .chunks(2)
            .map(|pair| {
                let hex = std::str::from_utf8(pair).unwrap_or("00");
                u8::from_str_radix(hex, 16).unwrap_or(0)
            })
            .collect();
        let series = self.interp.heap.make_binary(&bytes, true);
        Ok(Cell::new(Value::Binary { series, index: 0 }))
    }

    fn collect_set_word(&mut self, symbol: SymId) {
        if let Some((binder, found)) = &mut self.collect
            && binder.try_add(&mut self.interp.symbols, symbol, found.len() as u32 + 1)
        {
            found.push(symbol);
        }
    }

    /// End the scan, releasing the set-word binder if there is one.
    fn finish(mut self) -> Vec<SymId> {
        match self.collect.take() {
            Some((mut binder, found)) => {
                for &symbol in &found {
                    binder.remove(&mut self.interp.symbols, symbol);
                }
                binder.shutdown(&mut self.interp.symbols);
                found
            }
            None => Vec::new(),
        }
    }
}

impl Interpreter {
    /// Scan source text into a managed array of unbound values.
    pub fn scan_text(&mut self, source: &str, file: Option<SymId>) -> Eval<SeriesId> {
        let scratch = Bump::new();
        let mut scanner = Scanner::new(self, source, file, &scratch);
        let result = scanner.scan_array(None);
        scanner.finish();
        result.map_err(|e| self.scan_failed(e))
    }

    /// Scan, also returning every set-word (at any depth) once, in order
    /// of first appearance.
    pub(crate) fn scan_collecting(
        &mut self,
        source: &str,
        file: Option<SymId>,
    ) -> Eval<(SeriesId, Vec<SymId>)> {
        let scratch = Bump::new();
        let mut scanner = Scanner::new(self, source, file, &scratch);
        let binder = Binder::new(&mut scanner.interp.symbols);
        scanner.collect = Some((binder, Vec::new()));
        let result = scanner.scan_array(None);
        let set_words = scanner.finish();
        match result {
            Ok(array) => Ok((array, set_words)),
            Err(e) => Err(self.scan_failed(e)),
        }
    }

    fn scan_failed(&mut self, error: ScanError) -> crate::throw::Flow {
        tracing::debug!(%error, "scan failed");
        self.raise(RuntimeError::Scan(error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn scan(interp: &mut Interpreter, source: &str) -> Vec<Cell> {
        let array = interp.scan_text(source, None).unwrap();
        interp.heap.series(array).cells().to_vec()
    }

    fn scan_error(source: &str) -> ScanError {
        let mut interp = Interpreter::new(Config::default());
        let scratch = Bump::new();
        let mut scanner = Scanner::new(&mut interp, source, None, &scratch);
        let result = scanner.scan_array(None);
        scanner.finish();
        result.unwrap_err()
    }

    #[test]
    fn test_scalars_and_words() {
        let mut interp = Interpreter::new(Config::default());
        let cells = scan(&mut interp, "10 -3 1.5 _ foo foo: :foo /foo");
        assert_eq!(cells[0].as_integer(), Some(10));
        assert_eq!(cells[1].as_integer(), Some(-3));
        assert_eq!(cells[2].value, Value::Decimal(1.5));
        assert_eq!(cells[3].value, Value::Blank);
        let kinds: Vec<_> = cells[4..].iter().map(|c| c.word_kind().unwrap()).collect();
        assert_eq!(
            kinds,
            vec![WordKind::Word, WordKind::Set, WordKind::Get, WordKind::Refinement]
        );
    }

    #[test]
    fn test_operators_are_words() {
        let mut interp = Interpreter::new(Config::default());
        let cells = scan(&mut interp, "+ - * / <");
        assert!(cells.iter().all(|c| c.word_kind() == Some(WordKind::Word)));
    }

    #[test]
    fn test_nested_arrays_and_newlines() {
        let mut interp = Interpreter::new(Config::default());
        let cells = scan(&mut interp, "[a (b)]\nc");
        let Value::Array { kind, series, .. } = cells[0].value else {
            panic!("expected block");
        };
        assert_eq!(kind, ArrayKind::Block);
        let inner = interp.heap.series(series).cells();
        assert!(matches!(inner[1].value, Value::Array { kind: ArrayKind::Group, .. }));
        assert!(cells[1].has_flag(CELL_FLAG_NEWLINE_BEFORE));
    }

    #[test]
    fn test_text_escapes_and_tags() {
        let mut interp = Interpreter::new(Config::default());
        let cells = scan(&mut interp, r#""a^/b^"" {x {y}} <local>"#);
        let text = |c: &Cell| interp.heap.series(c.value.series().unwrap()).as_str().to_string();
        assert_eq!(text(&cells[0]), "a\nb\"");
        assert_eq!(text(&cells[1]), "x {y}");
        assert!(matches!(cells[2].value, Value::Text { kind: TextKind::Tag, .. }));
        assert_eq!(text(&cells[2]), "local");
    }

    #[test]
    fn test_paths() {
        let mut interp = Interpreter::new(Config::default());
        let cells = scan(&mut interp, "a/b/1 a/b: :a/b a/(c)");
        let kinds: Vec<_> = cells
            .iter()
            .map(|c| match c.value {
                Value::Array { kind, .. } => kind,
                _ => panic!("expected path"),
            })
            .collect();
        assert_eq!(
            kinds,
            vec![ArrayKind::Path, ArrayKind::SetPath, ArrayKind::GetPath, ArrayKind::Path]
        );
        let elements = interp.heap.series(cells[0].value.series().unwrap()).cells();
        assert_eq!(elements.len(), 3);
        assert_eq!(elements[2].as_integer(), Some(1));
    }

    #[test]
    fn test_quotes_and_binary() {
        let mut interp = Interpreter::new(Config::default());
        let cells = scan(&mut interp, "''a '[b] #{DE AD}");
        assert_eq!(cells[0].quote_depth(), 2);
        assert_eq!(cells[1].quote_depth(), 1);
        let bytes = interp.heap.series(cells[2].value.series().unwrap()).bytes();
        assert_eq!(bytes, &[0xDE, 0xAD]);
    }

    #[test]
    fn test_errors() {
        assert_eq!(
            scan_error("[1 2"),
            ScanError::Missing {
                expected: ']',
                line: 1
            }
        );
        assert_eq!(
            scan_error("1\n)"),
            ScanError::Extra {
                found: ')',
                line: 2
            }
        );
        assert!(matches!(
            scan_error("12abc"),
            ScanError::Invalid { what: "integer", .. }
        ));
        assert!(matches!(scan_error("\"open"), ScanError::Missing { expected: '"', .. }));
    }

    #[test]
    fn test_scan_error_leaves_stack_balanced() {
        let mut interp = Interpreter::new(Config::default());
        let depth = interp.stack.depth();
        let err = interp.scan_text("[a [b", None).unwrap_err();
        let error = err.error().unwrap();
        assert_eq!(interp.error_id(&error).as_deref(), Some("scan-missing"));
        assert_eq!(interp.stack.depth(), depth);
        assert_eq!(interp.symbols.binders_active(), 0);
    }

    #[test]
    fn test_collects_set_words_once() {
        let mut interp = Interpreter::new(Config::default());
        let (_, words) = interp.scan_collecting("a: 1 [b: a: 2] A: 3", None).unwrap();
        let names: Vec<_> = words.iter().map(|w| interp.symbols.spelling(*w)).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
