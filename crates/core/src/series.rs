//! Series
//!
//! A series is the growable container behind every array, string, binary,
//! varlist, keylist and paramlist. The stub ([`Series`]) holds the header,
//! info bits, the element storage and two auxiliary fields whose meaning
//! depends on the flavor:
//!
//! | Flavor | `link` | `misc` |
//! |--------|--------|--------|
//! | Array (from source) | file | line |
//! | Varlist | keysource (keylist or paramlist) | meta |
//! | Keylist | ancestor keylist | - |
//! | Paramlist | - | details array |
//! | Details | - | dispatcher id |
//!
//! Reading at `len()` yields `None`: the terminator is implicit and never
//! stored.

use crate::cell::Cell;
use crate::context::Key;
use crate::error::{Fatal, SeriesError, crash};
use crate::node::{Header, flag_left_bit};
use crate::symbol::SymId;

/// Handle to a series slot in the [`crate::heap::Heap`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct SeriesId(u32);

impl SeriesId {
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) const fn from_index(index: usize) -> Self {
        SeriesId(index as u32)
    }
}

/// An evaluator is iterating the array; no insertion or removal.
pub const SERIES_INFO_HOLD: u32 = flag_left_bit(0);
/// Permanently read-only.
pub const SERIES_INFO_FROZEN: u32 = flag_left_bit(1);
/// Read-only until unprotected.
pub const SERIES_INFO_PROTECTED: u32 = flag_left_bit(2);
/// Storage was stolen or released; only the stub remains.
pub const SERIES_INFO_INACCESSIBLE: u32 = flag_left_bit(3);
/// Keylist is shared by more than one varlist.
pub const SERIES_INFO_SHARED_KEYLIST: u32 = flag_left_bit(4);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    Array = 1,
    Varlist,
    Keylist,
    Paramlist,
    Details,
    Text,
    Binary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    None,
    Ancestor(SeriesId),
    Keysource(SeriesId),
    File(SymId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Misc {
    None,
    Meta(SeriesId),
    Line(u32),
    Details(SeriesId),
    Dispatcher(u32),
}

#[derive(Debug, Clone)]
pub enum Content {
    Cells(Vec<Cell>),
    Utf8(String),
    Bytes(Vec<u8>),
    Keys(Vec<Key>),
    Inaccessible,
}

impl Content {
    pub fn width(&self) -> usize {
        match self {
            Content::Cells(_) => std::mem::size_of::<Cell>(),
            Content::Utf8(_) | Content::Bytes(_) => 1,
            Content::Keys(_) => std::mem::size_of::<Key>(),
            Content::Inaccessible => 0,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Content::Cells(v) => v.len(),
            Content::Utf8(s) => s.len(),
            Content::Bytes(v) => v.len(),
            Content::Keys(v) => v.len(),
            Content::Inaccessible => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        match self {
            Content::Cells(v) => v.capacity(),
            Content::Utf8(s) => s.capacity(),
            Content::Bytes(v) => v.capacity(),
            Content::Keys(v) => v.capacity(),
            Content::Inaccessible => 0,
        }
    }
}

#[derive(Debug)]
pub struct Series {
    header: Header,
    info: u32,
    flavor: Flavor,
    content: Content,
    /// Bytes of storage gained (or lost) since the heap last accounted for
    /// this series.
    resized: isize,
    pub link: Link,
    pub misc: Misc,
}

impl Series {
    pub(crate) fn new(flavor: Flavor, content: Content) -> Self {
        Series {
            header: Header::series().with_second_byte(flavor as u8),
            info: 0,
            flavor,
            content,
            resized: 0,
            link: Link::None,
            misc: Misc::None,
        }
    }

    pub fn header(&self) -> Header {
        self.header
    }

    pub(crate) fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn is_array(&self) -> bool {
        matches!(self.content, Content::Cells(_))
    }

    pub fn width(&self) -> usize {
        self.content.width()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.content.capacity()
    }

    /// Bytes of element storage currently reserved.
    pub fn byte_size(&self) -> usize {
        self.capacity() * self.width() + std::mem::size_of::<Series>()
    }

    pub fn has_info(&self, flag: u32) -> bool {
        self.info & flag == flag
    }

    pub fn set_info(&mut self, flag: u32) {
        self.info |= flag;
    }

    pub fn clear_info(&mut self, flag: u32) {
        self.info &= !flag;
    }

    pub fn is_accessible(&self) -> bool {
        !self.has_info(SERIES_INFO_INACCESSIBLE)
    }

    pub fn is_managed(&self) -> bool {
        self.header.is_managed()
    }

    /// Check that a write is allowed; `structural` writes also respect HOLD.
    pub fn check_mutable(&self, structural: bool) -> Result<(), SeriesError> {
        if !self.is_accessible() {
            Err(SeriesError::Inaccessible)
        } else if self.has_info(SERIES_INFO_FROZEN) {
            Err(SeriesError::Frozen)
        } else if self.has_info(SERIES_INFO_PROTECTED) {
            Err(SeriesError::Protected)
        } else if structural && self.has_info(SERIES_INFO_HOLD) {
            Err(SeriesError::Held)
        } else {
            Ok(())
        }
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Replace the storage, returning the old one. The stub becomes
    /// inaccessible if `Content::Inaccessible` is put in.
    pub fn replace_content(&mut self, content: Content) -> Content {
        if matches!(content, Content::Inaccessible) {
            self.set_info(SERIES_INFO_INACCESSIBLE);
        } else {
            self.clear_info(SERIES_INFO_INACCESSIBLE);
        }
        self.tracking_size(|series| std::mem::replace(&mut series.content, content))
    }

    /// Run a mutation that may reallocate, remembering the size change.
    fn tracking_size<R>(&mut self, op: impl FnOnce(&mut Self) -> R) -> R {
        let before = self.byte_size();
        let result = op(self);
        self.resized += self.byte_size() as isize - before as isize;
        result
    }

    /// Size change not yet seen by the heap's accounting, and reset it.
    pub(crate) fn take_resized(&mut self) -> isize {
        std::mem::take(&mut self.resized)
    }

    // -------------------------------------------------------------------------
    // Arrays
    // -------------------------------------------------------------------------

    pub fn cells(&self) -> &[Cell] {
        match &self.content {
            Content::Cells(cells) => cells,
            Content::Inaccessible => &[],
            other => crash(Fatal::Invariant(format!(
                "{:?} series read as array",
                kind_of(other)
            ))),
        }
    }

    /// Raw element access for initialization; bypasses protection checks.
    pub fn cells_mut(&mut self) -> &mut [Cell] {
        self.cells_vec()
    }

    fn cells_vec(&mut self) -> &mut Vec<Cell> {
        match &mut self.content {
            Content::Cells(cells) => cells,
            other => crash(Fatal::Invariant(format!(
                "{:?} series written as array",
                kind_of(other)
            ))),
        }
    }

    /// Element at `index`, or `None` at (and past) the implicit terminator.
    pub fn at(&self, index: usize) -> Option<&Cell> {
        self.cells().get(index)
    }

    pub fn push(&mut self, cell: Cell) -> Result<(), SeriesError> {
        self.check_mutable(true)?;
        self.tracking_size(|series| series.cells_vec().push(cell));
        Ok(())
    }

    pub fn insert(&mut self, index: usize, cells: &[Cell]) -> Result<(), SeriesError> {
        self.check_mutable(true)?;
        self.tracking_size(|series| {
            let vec = series.cells_vec();
            let index = index.min(vec.len());
            vec.splice(index..index, cells.iter().copied());
        });
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<Option<Cell>, SeriesError> {
        self.check_mutable(true)?;
        let vec = self.cells_vec();
        Ok((index < vec.len()).then(|| vec.remove(index)))
    }

    pub fn truncate(&mut self, len: usize) -> Result<(), SeriesError> {
        self.check_mutable(true)?;
        self.cells_vec().truncate(len);
        Ok(())
    }

    /// Overwrite an existing element (not structural, so HOLD allows it).
    pub fn set(&mut self, index: usize, cell: Cell) -> Result<(), SeriesError> {
        self.check_mutable(false)?;
        match self.cells_vec().get_mut(index) {
            Some(slot) => {
                *slot = cell;
                Ok(())
            }
            None => Err(SeriesError::OutOfRange(index)),
        }
    }

    /// Push without checks, for series under construction.
    pub fn push_unchecked(&mut self, cell: Cell) {
        self.tracking_size(|series| series.cells_vec().push(cell));
    }

    // -------------------------------------------------------------------------
    // Strings and binaries
    // -------------------------------------------------------------------------

    pub fn as_str(&self) -> &str {
        match &self.content {
            Content::Utf8(s) => s,
            Content::Inaccessible => "",
            other => crash(Fatal::Invariant(format!(
                "{:?} series read as text",
                kind_of(other)
            ))),
        }
    }

    pub fn push_str(&mut self, text: &str) -> Result<(), SeriesError> {
        self.check_mutable(true)?;
        self.tracking_size(|series| match &mut series.content {
            Content::Utf8(s) => s.push_str(text),
            Content::Bytes(b) => b.extend_from_slice(text.as_bytes()),
            other => crash(Fatal::Invariant(format!(
                "{:?} series appended as text",
                kind_of(other)
            ))),
        });
        Ok(())
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.content {
            Content::Utf8(s) => s.as_bytes(),
            Content::Bytes(b) => b,
            Content::Inaccessible => &[],
            other => crash(Fatal::Invariant(format!(
                "{:?} series read as bytes",
                kind_of(other)
            ))),
        }
    }

    // -------------------------------------------------------------------------
    // Keylists and paramlists
    // -------------------------------------------------------------------------

    pub fn keys(&self) -> &[Key] {
        match &self.content {
            Content::Keys(keys) => keys,
            other => crash(Fatal::Invariant(format!(
                "{:?} series read as keylist",
                kind_of(other)
            ))),
        }
    }

    pub fn push_key(&mut self, key: Key) -> Result<(), SeriesError> {
        self.check_mutable(true)?;
        self.tracking_size(|series| match &mut series.content {
            Content::Keys(keys) => keys.push(key),
            other => crash(Fatal::Invariant(format!(
                "{:?} series appended as keylist",
                kind_of(other)
            ))),
        });
        Ok(())
    }
}

fn kind_of(content: &Content) -> &'static str {
    match content {
        Content::Cells(_) => "cell",
        Content::Utf8(_) => "utf-8",
        Content::Bytes(_) => "byte",
        Content::Keys(_) => "key",
        Content::Inaccessible => "inaccessible",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn array(n: usize) -> Series {
        Series::new(Flavor::Array, Content::Cells(Vec::with_capacity(n)))
    }

    fn assert_len_invariant(s: &Series) {
        assert!(s.len() <= s.capacity());
        assert!(s.at(s.len()).is_none());
    }

    #[test]
    fn test_length_never_exceeds_capacity() {
        let mut s = array(2);
        assert_len_invariant(&s);
        for i in 0..10 {
            s.push(Cell::integer(i)).unwrap();
            assert_len_invariant(&s);
        }
        s.insert(3, &[Cell::blank(), Cell::blank()]).unwrap();
        assert_len_invariant(&s);
        s.remove(0).unwrap();
        s.truncate(4).unwrap();
        assert_len_invariant(&s);
        assert_eq!(s.len(), 4);
    }

    #[test]
    fn test_hold_blocks_structural_change_only() {
        let mut s = array(4);
        s.push(Cell::integer(1)).unwrap();
        s.set_info(SERIES_INFO_HOLD);
        assert_eq!(s.push(Cell::integer(2)), Err(SeriesError::Held));
        assert_eq!(s.remove(0), Err(SeriesError::Held));
        s.set(0, Cell::integer(5)).unwrap();
        assert_eq!(s.at(0).and_then(Cell::as_integer), Some(5));
        s.clear_info(SERIES_INFO_HOLD);
        s.push(Cell::integer(2)).unwrap();
    }

    #[test]
    fn test_frozen_rejects_all_writes() {
        let mut s = array(1);
        s.push(Cell::integer(1)).unwrap();
        s.set_info(SERIES_INFO_FROZEN);
        assert_eq!(s.set(0, Cell::blank()), Err(SeriesError::Frozen));
        assert_eq!(s.push(Cell::blank()), Err(SeriesError::Frozen));
    }

    #[test]
    fn test_replace_content_marks_inaccessible() {
        let mut s = array(1);
        s.push(Cell::integer(1)).unwrap();
        let old = s.replace_content(Content::Inaccessible);
        assert_eq!(old.len(), 1);
        assert!(!s.is_accessible());
        assert!(s.cells().is_empty());
        assert_eq!(s.push(Cell::blank()), Err(SeriesError::Inaccessible));
    }

    #[test]
    fn test_text_content() {
        let mut s = Series::new(Flavor::Text, Content::Utf8(String::new()));
        s.push_str("héllo").unwrap();
        assert_eq!(s.as_str(), "héllo");
        assert_eq!(s.width(), 1);
        assert_eq!(s.len(), 6);
    }
}
