//! Cells
//!
//! A [`Cell`] is the fixed-size unit every runtime datum lives in. The
//! header holds node flags, per-cell flags and the quoting depth; the
//! [`Value`] enum is the payload and its variant alone decides how the
//! payload is read.
//!
//! ## Payload layout
//!
//! | Kind | Payload | Extra (binding) |
//! |------|---------|-----------------|
//! | INTEGER!, DECIMAL!, LOGIC! | immediate | - |
//! | WORD! family | symbol | [`Binding`] with cached slot index |
//! | BLOCK!/GROUP!/PATH! family | series + index | [`Specifier`] |
//! | TEXT!, TAG!, BINARY! | series + index | - |
//! | OBJECT!, FRAME!, ERROR! | varlist + phase | binding context |
//! | ACTION! | paramlist | binding context |
//!
//! Cells live inside series or in Rust locals; the only standalone heap
//! cells are the API pairings in [`crate::heap`].

use crate::node::{Header, flag_left_bit};
use crate::series::SeriesId;
use crate::symbol::SymId;

/// Assignment through this variable slot fails with a "protected" error.
pub const CELL_FLAG_PROTECTED: u32 = flag_left_bit(24);
/// Value was copied from source without being evaluated.
pub const CELL_FLAG_UNEVALUATED: u32 = flag_left_bit(25);
/// Output slot has not been written since the step began.
pub const CELL_FLAG_OUT_STALE: u32 = flag_left_bit(26);
/// A newline preceded this value in source.
pub const CELL_FLAG_NEWLINE_BEFORE: u32 = flag_left_bit(27);
/// ACTION! stored here takes its first argument from the left.
pub const CELL_FLAG_ENFIXED: u32 = flag_left_bit(28);

const CELL_FLAG_MASK: u32 = 0xFF;

/// Kind byte, as seen in the second byte of a cell header.
///
/// `End` is zero so a zeroed kind byte reads as the end marker.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    End = 0,
    Nulled,
    Void,
    Blank,
    Logic,
    Integer,
    Decimal,
    Word,
    SetWord,
    GetWord,
    Refinement,
    Block,
    Group,
    Path,
    SetPath,
    GetPath,
    Text,
    Tag,
    Binary,
    Object,
    Frame,
    Error,
    Action,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::End => "end",
            Kind::Nulled => "null",
            Kind::Void => "void",
            Kind::Blank => "blank!",
            Kind::Logic => "logic!",
            Kind::Integer => "integer!",
            Kind::Decimal => "decimal!",
            Kind::Word => "word!",
            Kind::SetWord => "set-word!",
            Kind::GetWord => "get-word!",
            Kind::Refinement => "refinement!",
            Kind::Block => "block!",
            Kind::Group => "group!",
            Kind::Path => "path!",
            Kind::SetPath => "set-path!",
            Kind::GetPath => "get-path!",
            Kind::Text => "text!",
            Kind::Tag => "tag!",
            Kind::Binary => "binary!",
            Kind::Object => "object!",
            Kind::Frame => "frame!",
            Kind::Error => "error!",
            Kind::Action => "action!",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WordKind {
    Word,
    Set,
    Get,
    Refinement,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArrayKind {
    Block,
    Group,
    Path,
    SetPath,
    GetPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextKind {
    Text,
    Tag,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContextKind {
    Object,
    Frame,
    Error,
}

/// Where a word's variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Binding {
    Unbound,
    /// Slot `index` of a context varlist.
    Specific { varlist: SeriesId, index: u32 },
    /// Slot `index` of whichever frame is running the action `paramlist`.
    /// Only meaningful together with a frame specifier.
    Relative { paramlist: SeriesId, index: u32 },
}

/// How words inside an array value are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Specifier {
    /// Contains no relative words.
    Specified,
    /// Inside an action body; needs a frame of `paramlist` to be used.
    Relative(SeriesId),
    /// Relative words resolve in this frame varlist.
    Frame(SeriesId),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    End,
    Nulled,
    Void,
    Blank,
    Logic(bool),
    Integer(i64),
    Decimal(f64),
    Word {
        kind: WordKind,
        symbol: SymId,
        binding: Binding,
    },
    Array {
        kind: ArrayKind,
        series: SeriesId,
        index: u32,
        specifier: Specifier,
    },
    Text {
        kind: TextKind,
        series: SeriesId,
        index: u32,
    },
    Binary {
        series: SeriesId,
        index: u32,
    },
    Context {
        kind: ContextKind,
        varlist: SeriesId,
        /// Action whose frame this is (FRAME! only).
        phase: Option<SeriesId>,
        /// Context captured when the frame's action was invoked.
        binding: Option<SeriesId>,
    },
    Action {
        paramlist: SeriesId,
        binding: Option<SeriesId>,
    },
}

impl Value {
    pub fn kind(&self) -> Kind {
        match self {
            Value::End => Kind::End,
            Value::Nulled => Kind::Nulled,
            Value::Void => Kind::Void,
            Value::Blank => Kind::Blank,
            Value::Logic(_) => Kind::Logic,
            Value::Integer(_) => Kind::Integer,
            Value::Decimal(_) => Kind::Decimal,
            Value::Word { kind, .. } => match kind {
                WordKind::Word => Kind::Word,
                WordKind::Set => Kind::SetWord,
                WordKind::Get => Kind::GetWord,
                WordKind::Refinement => Kind::Refinement,
            },
            Value::Array { kind, .. } => match kind {
                ArrayKind::Block => Kind::Block,
                ArrayKind::Group => Kind::Group,
                ArrayKind::Path => Kind::Path,
                ArrayKind::SetPath => Kind::SetPath,
                ArrayKind::GetPath => Kind::GetPath,
            },
            Value::Text { kind, .. } => match kind {
                TextKind::Text => Kind::Text,
                TextKind::Tag => Kind::Tag,
            },
            Value::Binary { .. } => Kind::Binary,
            Value::Context { kind, .. } => match kind {
                ContextKind::Object => Kind::Object,
                ContextKind::Frame => Kind::Frame,
                ContextKind::Error => Kind::Error,
            },
            Value::Action { .. } => Kind::Action,
        }
    }

    /// Series this value keeps alive, other than its binding.
    pub fn series(&self) -> Option<SeriesId> {
        match *self {
            Value::Array { series, .. } => Some(series),
            Value::Text { series, .. } => Some(series),
            Value::Binary { series, .. } => Some(series),
            Value::Context { varlist, .. } => Some(varlist),
            Value::Action { paramlist, .. } => Some(paramlist),
            _ => None,
        }
    }
}

/// A single value slot.
#[derive(Clone, Copy, PartialEq)]
pub struct Cell {
    header: Header,
    pub value: Value,
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let quotes = self.quote_depth();
        if quotes > 0 {
            write!(f, "{}", "'".repeat(quotes as usize))?;
        }
        write!(f, "{:?}", self.value)
    }
}

impl Default for Cell {
    fn default() -> Self {
        Cell::END
    }
}

impl From<Value> for Cell {
    fn from(value: Value) -> Self {
        Cell::new(value)
    }
}

impl Cell {
    pub const END: Cell = Cell {
        header: Header::cell(),
        value: Value::End,
    };

    pub const fn new(value: Value) -> Self {
        Cell {
            header: Header::cell(),
            value,
        }
    }

    pub const fn nulled() -> Self {
        Cell::new(Value::Nulled)
    }

    pub const fn void() -> Self {
        Cell::new(Value::Void)
    }

    pub const fn blank() -> Self {
        Cell::new(Value::Blank)
    }

    pub const fn logic(flag: bool) -> Self {
        Cell::new(Value::Logic(flag))
    }

    pub const fn integer(i: i64) -> Self {
        Cell::new(Value::Integer(i))
    }

    pub const fn decimal(d: f64) -> Self {
        Cell::new(Value::Decimal(d))
    }

    pub const fn word(kind: WordKind, symbol: SymId) -> Self {
        Cell::new(Value::Word {
            kind,
            symbol,
            binding: Binding::Unbound,
        })
    }

    pub const fn array(kind: ArrayKind, series: SeriesId) -> Self {
        Cell::new(Value::Array {
            kind,
            series,
            index: 0,
            specifier: Specifier::Specified,
        })
    }

    pub const fn block(series: SeriesId) -> Self {
        Cell::array(ArrayKind::Block, series)
    }

    pub const fn text(series: SeriesId) -> Self {
        Cell::new(Value::Text {
            kind: TextKind::Text,
            series,
            index: 0,
        })
    }

    pub const fn context(kind: ContextKind, varlist: SeriesId) -> Self {
        Cell::new(Value::Context {
            kind,
            varlist,
            phase: None,
            binding: None,
        })
    }

    pub const fn action(paramlist: SeriesId, binding: Option<SeriesId>) -> Self {
        Cell::new(Value::Action { paramlist, binding })
    }

    /// Full header, with the kind byte filled in from the payload.
    pub fn header(&self) -> Header {
        self.header.with_second_byte(self.kind_byte())
    }

    pub fn kind(&self) -> Kind {
        self.value.kind()
    }

    pub fn kind_byte(&self) -> u8 {
        self.value.kind() as u8
    }

    pub fn is_end(&self) -> bool {
        matches!(self.value, Value::End)
    }

    pub fn is_nulled(&self) -> bool {
        matches!(self.value, Value::Nulled)
    }

    pub fn is_void(&self) -> bool {
        matches!(self.value, Value::Void)
    }

    /// Conditional truth: only `false`, null and blank are falsey.
    pub fn is_truthy(&self) -> bool {
        !matches!(
            self.value,
            Value::Logic(false) | Value::Nulled | Value::Blank | Value::Void
        )
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self.value {
            Value::Integer(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<SymId> {
        match self.value {
            Value::Word { symbol, .. } => Some(symbol),
            _ => None,
        }
    }

    pub fn word_kind(&self) -> Option<WordKind> {
        match self.value {
            Value::Word { kind, .. } => Some(kind),
            _ => None,
        }
    }

    /// Varlist of an ANY-CONTEXT! value.
    pub fn as_varlist(&self) -> Option<SeriesId> {
        match self.value {
            Value::Context { varlist, .. } => Some(varlist),
            _ => None,
        }
    }

    pub fn is_action(&self) -> bool {
        matches!(self.value, Value::Action { .. })
    }

    /// True if this value cannot be used without a frame specifier.
    pub fn is_relative(&self) -> bool {
        matches!(
            self.value,
            Value::Word {
                binding: Binding::Relative { .. },
                ..
            } | Value::Array {
                specifier: Specifier::Relative(_),
                ..
            }
        )
    }

    #[inline]
    pub fn has_flag(&self, flag: u32) -> bool {
        self.header.has(flag)
    }

    #[inline]
    pub fn set_flag(&mut self, flag: u32) {
        debug_assert_eq!(flag & !CELL_FLAG_MASK, 0);
        self.header.set(flag);
    }

    #[inline]
    pub fn clear_flag(&mut self, flag: u32) {
        self.header.clear(flag);
    }

    pub fn with_flag(mut self, flag: u32) -> Self {
        self.set_flag(flag);
        self
    }

    /// Drop per-slot flags that must not travel with a copied value.
    pub fn copied(mut self) -> Self {
        self.header.clear(
            CELL_FLAG_PROTECTED | CELL_FLAG_UNEVALUATED | CELL_FLAG_OUT_STALE
                | CELL_FLAG_NEWLINE_BEFORE,
        );
        self
    }

    /// Overwrite the payload, keeping slot flags such as PROTECTED.
    pub fn assign(&mut self, source: &Cell) {
        let keep = self.header.bits() & CELL_FLAG_PROTECTED;
        *self = source.copied();
        self.header.set(keep);
    }

    pub fn quote_depth(&self) -> u8 {
        self.header.third_byte()
    }

    /// Add `levels` of quoting. Returns None on depth overflow.
    pub fn quoted(mut self, levels: u8) -> Option<Self> {
        let depth = self.quote_depth().checked_add(levels)?;
        self.header = self.header.with_third_byte(depth);
        Some(self)
    }

    /// Remove one level of quoting (no-op on an unquoted cell).
    pub fn unquoted(mut self) -> Self {
        let depth = self.quote_depth().saturating_sub(1);
        self.header = self.header.with_third_byte(depth);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{NODE_FLAG_CELL, NODE_FLAG_NODE};
    use crate::symbol::sym;

    #[test]
    fn test_end_kind_byte_is_zero() {
        assert_eq!(Cell::END.kind_byte(), 0);
        assert!(Cell::END.is_end());
        assert_eq!(Cell::default(), Cell::END);
    }

    #[test]
    fn test_header_carries_kind_byte() {
        let cell = Cell::integer(7);
        let header = cell.header();
        assert!(header.has(NODE_FLAG_NODE | NODE_FLAG_CELL));
        assert_eq!(header.second_byte(), Kind::Integer as u8);
    }

    #[test]
    fn test_quoting() {
        let word = Cell::word(WordKind::Word, sym::SELF);
        let twice = word.quoted(2).unwrap();
        assert_eq!(twice.quote_depth(), 2);
        assert_eq!(twice.unquoted().quote_depth(), 1);
        assert_eq!(word.unquoted().quote_depth(), 0);
        assert!(twice.quoted(254).is_none());
    }

    #[test]
    fn test_assign_keeps_protection() {
        let mut slot = Cell::integer(1).with_flag(CELL_FLAG_PROTECTED);
        let source = Cell::integer(2).with_flag(CELL_FLAG_NEWLINE_BEFORE);
        slot.assign(&source);
        assert_eq!(slot.as_integer(), Some(2));
        assert!(slot.has_flag(CELL_FLAG_PROTECTED));
        assert!(!slot.has_flag(CELL_FLAG_NEWLINE_BEFORE));
    }

    #[test]
    fn test_truthiness() {
        assert!(Cell::integer(0).is_truthy());
        assert!(!Cell::logic(false).is_truthy());
        assert!(!Cell::nulled().is_truthy());
        assert!(!Cell::blank().is_truthy());
    }
}
