//! Node headers
//!
//! Every heap-shared structure (series stubs, API pairings, cells) begins
//! with a 32-bit header. Flags are numbered from the most significant bit,
//! so the first eight flags form the *leading byte* of the header.
//!
//! ## Leading byte layout
//!
//! ```text
//!   bit:   0      1      2        3       4      5     6      7
//!        NODE   FREE  MANAGED  MARKED  (unused) ROOT  STACK  CELL
//! ```
//!
//! - An in-use node always has NODE set and FREE clear, so its leading byte
//!   is `10xxxxxx`. That is a UTF-8 continuation byte, which can never begin
//!   a well-formed string, and is never a multi-byte sequence lead.
//! - A freed node has both NODE and FREE set and nothing else, giving exactly
//!   one of two reserved bytes: `0xC0` (series-sized) or `0xC1` (cell-sized).
//!   Both are illegal anywhere in UTF-8.
//!
//! The evaluator dispatches on Rust enums. The leading-byte trick is only
//! consulted where foreign pointers arrive without a type (see the FFI layer
//! in the runtime crate).

/// Flag numbered from the most significant bit of a 32-bit header.
pub const fn flag_left_bit(n: u32) -> u32 {
    1 << (31 - n)
}

pub const NODE_FLAG_NODE: u32 = flag_left_bit(0);
pub const NODE_FLAG_FREE: u32 = flag_left_bit(1);
pub const NODE_FLAG_MANAGED: u32 = flag_left_bit(2);
pub const NODE_FLAG_MARKED: u32 = flag_left_bit(3);
pub const NODE_FLAG_ROOT: u32 = flag_left_bit(5);
pub const NODE_FLAG_STACK: u32 = flag_left_bit(6);
pub const NODE_FLAG_CELL: u32 = flag_left_bit(7);

/// Leading byte of a freed series-sized node.
pub const FREED_SERIES_BYTE: u8 = 192;
/// Leading byte of a freed cell-sized node (API pairings).
pub const FREED_CELL_BYTE: u8 = 193;

/// Common header of cells and series.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Header(u32);

impl Header {
    /// Header for a live series stub.
    pub const fn series() -> Self {
        Header(NODE_FLAG_NODE)
    }

    /// Header for a live cell.
    pub const fn cell() -> Self {
        Header(NODE_FLAG_NODE | NODE_FLAG_CELL)
    }

    /// Header left behind in a freed slot.
    pub const fn freed(cell_sized: bool) -> Self {
        let byte = if cell_sized {
            FREED_CELL_BYTE
        } else {
            FREED_SERIES_BYTE
        };
        Header((byte as u32) << 24)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Header(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn has(self, flag: u32) -> bool {
        self.0 & flag == flag
    }

    #[inline]
    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    #[inline]
    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    /// The byte a foreign caller sees first when reading the node.
    pub const fn first_byte(self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// Second byte: the kind byte for cells, the flavor byte for series.
    pub const fn second_byte(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub const fn with_second_byte(self, byte: u8) -> Self {
        Header((self.0 & !0x00FF_0000) | ((byte as u32) << 16))
    }

    /// Third byte; cells keep their quoting depth here.
    pub const fn third_byte(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub const fn with_third_byte(self, byte: u8) -> Self {
        Header((self.0 & !0x0000_FF00) | ((byte as u32) << 8))
    }

    pub const fn is_free(self) -> bool {
        self.has(NODE_FLAG_FREE)
    }

    pub const fn is_managed(self) -> bool {
        self.has(NODE_FLAG_MANAGED)
    }

    pub const fn is_marked(self) -> bool {
        self.has(NODE_FLAG_MARKED)
    }
}

impl std::fmt::Debug for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Header({:#010x})", self.0)
    }
}

/// What a leading byte (plus the kind byte, for cells) says a pointer is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Detected {
    /// Start of UTF-8 text (including the empty string).
    Utf8,
    /// A live cell node.
    Cell,
    /// A live non-cell node (series stub or API instruction).
    Series,
    /// The end marker: a cell node whose kind byte is zero.
    End,
    FreedSeries,
    FreedCell,
    /// 0xF5..=0xFF: neither UTF-8 nor a node header starts this way.
    Invalid,
}

/// Classify a foreign pointer from its first two bytes.
///
/// `second` is only read when `lead` says the pointer is a cell.
pub fn detect(lead: u8, second: impl FnOnce() -> u8) -> Detected {
    match lead {
        FREED_SERIES_BYTE => Detected::FreedSeries,
        FREED_CELL_BYTE => Detected::FreedCell,
        0x00..=0x7F | 0xC2..=0xF4 => Detected::Utf8,
        0x80..=0xBF => {
            let header = Header::from_bits((lead as u32) << 24);
            if header.has(NODE_FLAG_CELL) {
                if second() == 0 {
                    Detected::End
                } else {
                    Detected::Cell
                }
            } else {
                Detected::Series
            }
        }
        _ => Detected::Invalid,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn could_lead_utf8(byte: u8) -> bool {
        // Any well-formed string starting with `byte` must decode with some tail.
        let tails: [&[u8]; 4] = [&[], &[0x80], &[0x80, 0x80], &[0x80, 0x80, 0x80]];
        tails.iter().any(|tail| {
            let mut bytes = vec![byte];
            bytes.extend_from_slice(tail);
            std::str::from_utf8(&bytes).is_ok()
        })
    }

    #[test]
    fn test_in_use_lead_byte_never_starts_utf8() {
        for extra in 0u32..=0x3F {
            let mut header = Header::series();
            header.set(extra << 24 & !NODE_FLAG_FREE);
            let lead = header.first_byte();
            assert_eq!(lead & 0xC0, 0x80);
            assert!(!could_lead_utf8(lead), "{lead:#x} starts valid UTF-8");
            assert_ne!(lead, FREED_SERIES_BYTE);
            assert_ne!(lead, FREED_CELL_BYTE);
        }
    }

    #[test]
    fn test_freed_bytes_are_reserved() {
        assert_eq!(Header::freed(false).first_byte(), FREED_SERIES_BYTE);
        assert_eq!(Header::freed(true).first_byte(), FREED_CELL_BYTE);
        assert!(!could_lead_utf8(FREED_SERIES_BYTE));
        assert!(!could_lead_utf8(FREED_CELL_BYTE));
        assert!(Header::freed(true).is_free());
    }

    #[test]
    fn test_detect() {
        assert_eq!(detect(b'a', || 0), Detected::Utf8);
        assert_eq!(detect(0, || 0), Detected::Utf8);
        assert_eq!(detect(0xE2, || 0), Detected::Utf8);
        let cell = Header::cell().with_second_byte(7);
        assert_eq!(detect(cell.first_byte(), || cell.second_byte()), Detected::Cell);
        assert_eq!(detect(cell.first_byte(), || 0), Detected::End);
        assert_eq!(detect(Header::series().first_byte(), || 0), Detected::Series);
        assert_eq!(detect(FREED_CELL_BYTE, || 0), Detected::FreedCell);
        assert_eq!(detect(0xFF, || 0), Detected::Invalid);
    }

    #[test]
    fn test_byte_accessors() {
        let h = Header::cell().with_second_byte(0x12).with_third_byte(3);
        assert_eq!(h.second_byte(), 0x12);
        assert_eq!(h.third_byte(), 3);
        assert!(h.has(NODE_FLAG_CELL));
        assert!(!h.is_managed());
    }
}
