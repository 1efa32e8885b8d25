//! Rendering values as text
//!
//! `mold` produces source-like text that scans back to an equivalent value
//! where that is possible; `form` is the human-readable variant PRINT uses
//! (text without quotes, blocks without brackets). Error reports for the
//! outermost boundary are built here too.
//!
//! Arrays and contexts can contain themselves, so molding keeps the stack
//! of series being rendered and prints `...` for a repeat.

use crate::interpreter::Interpreter;
use crate::throw::Flow;
use cellvm_core::action::{action_num_params, action_param};
use cellvm_core::context::{ctx_key, ctx_len, ctx_var};
use cellvm_core::{ArrayKind, Cell, ContextKind, ParamClass, SeriesId, TextKind, Value, WordKind, sym};
use std::fmt::Write;

struct Molder<'a> {
    interp: &'a Interpreter,
    out: String,
    /// Series currently being rendered.
    stack: Vec<SeriesId>,
}

impl<'a> Molder<'a> {
    fn new(interp: &'a Interpreter) -> Self {
        Molder {
            interp,
            out: String::new(),
            stack: Vec::new(),
        }
    }

    fn spelling(&self, symbol: cellvm_core::SymId) -> &'a str {
        self.interp.symbols.spelling(symbol)
    }

    fn text(&self, series: SeriesId, index: u32) -> &'a str {
        self.interp
            .heap
            .series(series)
            .as_str()
            .get(index as usize..)
            .unwrap_or("")
    }

    fn mold(&mut self, cell: &Cell) {
        for _ in 0..cell.quote_depth() {
            self.out.push('\'');
        }
        match cell.value {
            Value::End => self.out.push_str("~end~"),
            Value::Nulled => self.out.push_str("~null~"),
            Value::Void => self.out.push_str("~void~"),
            Value::Blank => self.out.push('_'),
            Value::Logic(flag) => self.out.push_str(if flag { "true" } else { "false" }),
            Value::Integer(i) => {
                let _ = write!(self.out, "{i}");
            }
            Value::Decimal(d) => {
                let _ = write!(self.out, "{d:?}");
            }
            Value::Word { kind, symbol, .. } => {
                let spelling = self.spelling(symbol);
                match kind {
                    WordKind::Word => self.out.push_str(spelling),
                    WordKind::Set => {
                        self.out.push_str(spelling);
                        self.out.push(':');
                    }
                    WordKind::Get => {
                        self.out.push(':');
                        self.out.push_str(spelling);
                    }
                    WordKind::Refinement => {
                        self.out.push('/');
                        self.out.push_str(spelling);
                    }
                }
            }
            Value::Array {
                kind,
                series,
                index,
                ..
            } => self.mold_array(kind, series, index),
            Value::Text {
                kind: TextKind::Text,
                series,
                index,
            } => {
                let text = self.text(series, index);
                self.mold_text(text);
            }
            Value::Text {
                kind: TextKind::Tag,
                series,
                index,
            } => {
                let tag = self.text(series, index);
                let _ = write!(self.out, "<{tag}>");
            }
            Value::Binary { series, index } => {
                self.out.push_str("#{");
                let interp = self.interp;
                let bytes = interp.heap.series(series).bytes();
                for byte in bytes.get(index as usize..).unwrap_or(&[]) {
                    let _ = write!(self.out, "{byte:02X}");
                }
                self.out.push('}');
            }
            Value::Context { kind, varlist, .. } => self.mold_context(kind, varlist),
            Value::Action { paramlist, .. } => self.mold_action(paramlist),
        }
    }

    fn mold_text(&mut self, text: &str) {
        self.out.push('"');
        for c in text.chars() {
            match c {
                '"' => self.out.push_str("^\""),
                '^' => self.out.push_str("^^"),
                '\n' => self.out.push_str("^/"),
                '\t' => self.out.push_str("^-"),
                c => self.out.push(c),
            }
        }
        self.out.push('"');
    }

    fn mold_array(&mut self, kind: ArrayKind, series: SeriesId, index: u32) {
        let (open, close, separator) = match kind {
            ArrayKind::Block => ("[", "]", " "),
            ArrayKind::Group => ("(", ")", " "),
            ArrayKind::Path => ("", "", "/"),
            ArrayKind::SetPath => ("", ":", "/"),
            ArrayKind::GetPath => (":", "", "/"),
        };
        self.out.push_str(open);
        if self.stack.contains(&series) {
            self.out.push_str("...");
        } else {
            self.stack.push(series);
            let interp = self.interp;
            let cells = interp.heap.series(series).cells();
            for (i, cell) in cells.iter().skip(index as usize).enumerate() {
                if i > 0 {
                    self.out.push_str(separator);
                }
                self.mold(cell);
            }
            self.stack.pop();
        }
        self.out.push_str(close);
    }

    fn mold_context(&mut self, kind: ContextKind, varlist: SeriesId) {
        let name = match kind {
            ContextKind::Object => "object!",
            ContextKind::Frame => "frame!",
            ContextKind::Error => "error!",
        };
        let interp = self.interp;
        let heap = &interp.heap;
        if !heap.series(varlist).is_accessible() {
            let _ = write!(self.out, "make {name} [...expired...]");
            return;
        }
        if self.stack.contains(&varlist) {
            let _ = write!(self.out, "make {name} [...]");
            return;
        }
        self.stack.push(varlist);
        let _ = write!(self.out, "make {name} [");
        let mut first = true;
        for index in 1..=ctx_len(heap, varlist) as u32 {
            let key = ctx_key(heap, varlist, index);
            if key.is_hidden() {
                continue;
            }
            if !first {
                self.out.push(' ');
            }
            first = false;
            let spelling = self.spelling(key.symbol);
            let _ = write!(self.out, "{spelling}: ");
            let var = *ctx_var(heap, varlist, index);
            if var.is_nulled() || var.is_void() {
                self.out.push_str("~null~");
            } else {
                self.mold(&var);
            }
        }
        self.out.push(']');
        self.stack.pop();
    }

    fn mold_action(&mut self, paramlist: SeriesId) {
        let interp = self.interp;
        let heap = &interp.heap;
        self.out.push_str("#[action! [");
        let mut first = true;
        for index in 1..=action_num_params(heap, paramlist) {
            let key = action_param(heap, paramlist, index);
            if key.is_hidden() || key.class == ParamClass::Return {
                continue;
            }
            if !first {
                self.out.push(' ');
            }
            first = false;
            let spelling = self.spelling(key.symbol);
            match key.class {
                ParamClass::HardQuote => {
                    let _ = write!(self.out, "'{spelling}");
                }
                ParamClass::Refinement => {
                    let _ = write!(self.out, "/{spelling}");
                }
                ParamClass::Local => {
                    let _ = write!(self.out, "<local> {spelling}");
                }
                _ => self.out.push_str(spelling),
            }
        }
        self.out.push_str("]]");
    }

    fn form(&mut self, cell: &Cell) {
        if cell.quote_depth() > 0 {
            self.mold(cell);
            return;
        }
        match cell.value {
            Value::Nulled | Value::Void => {}
            Value::Text { series, index, .. } => {
                let text = self.text(series, index);
                self.out.push_str(text);
            }
            Value::Word { symbol, .. } => {
                let spelling = self.spelling(symbol);
                self.out.push_str(spelling);
            }
            Value::Array {
                kind: ArrayKind::Block,
                series,
                index,
                ..
            } => {
                if self.stack.contains(&series) {
                    self.out.push_str("...");
                    return;
                }
                self.stack.push(series);
                let interp = self.interp;
                let cells = interp.heap.series(series).cells();
                for (i, cell) in cells.iter().skip(index as usize).enumerate() {
                    if i > 0 {
                        self.out.push(' ');
                    }
                    self.form(cell);
                }
                self.stack.pop();
            }
            _ => self.mold(cell),
        }
    }
}

impl Interpreter {
    /// Source-like rendering of `cell`.
    pub fn mold(&self, cell: &Cell) -> String {
        let mut molder = Molder::new(self);
        molder.mold(cell);
        molder.out
    }

    /// Display rendering of `cell`, as PRINT shows it.
    pub fn form(&self, cell: &Cell) -> String {
        let mut molder = Molder::new(self);
        molder.form(cell);
        molder.out
    }

    /// Multi-line report of an ERROR! for the outermost boundary:
    ///
    /// ```text
    /// ** Script Error: foo has no value
    /// ** Where: add
    /// ** Near: [add foo]
    /// ```
    pub fn report_error(&self, error: &Cell) -> String {
        let category = self
            .error_field(error, sym::TYPE)
            .and_then(|c| c.as_symbol())
            .map_or("user", |s| self.symbols.spelling(s));
        let mut report = String::from("** ");
        let mut chars = category.chars();
        if let Some(first) = chars.next() {
            report.extend(first.to_uppercase());
            report.push_str(chars.as_str());
        }
        report.push_str(" Error: ");

        let message = match self.error_field(error, sym::MESSAGE).map(|c| c.value) {
            Some(Value::Text { series, index, .. }) => self
                .heap
                .series(series)
                .as_str()
                .get(index as usize..)
                .unwrap_or("")
                .to_string(),
            _ => String::new(),
        };
        let mut message = message;
        for (placeholder, field) in [(":arg1", sym::ARG1), (":arg2", sym::ARG2), (":arg3", sym::ARG3)] {
            if message.contains(placeholder) {
                let arg = self
                    .error_field(error, field)
                    .map_or_else(String::new, |c| self.mold(&c));
                message = message.replace(placeholder, &arg);
            }
        }
        report.push_str(&message);

        if let Some(label) = self.error_field(error, sym::WHERE).and_then(|c| c.as_symbol()) {
            let _ = write!(report, "\n** Where: {}", self.symbols.spelling(label));
        }
        if let Some(near) = self.error_field(error, sym::NEAR)
            && !near.is_nulled()
        {
            let _ = write!(report, "\n** Near: {}", self.mold(&near));
        }
        report
    }

    /// Report for a flow that escaped the outermost boundary.
    pub fn report(&self, flow: &Flow) -> String {
        match flow {
            Flow::Raise(error) => self.report_error(error),
            Flow::Throw { label, .. } => {
                format!("** Script Error: no catch for throw: {}", self.mold(label))
            }
            Flow::Halt => "** Halted".to_string(),
        }
    }
}
