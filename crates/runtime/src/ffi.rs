//! C embedding layer
//!
//! A C caller evaluates code by passing an array of untyped pointers ended
//! by [`cellvm_end`]. Each pointer is classified by its leading bytes:
//!
//! | Lead byte | Second byte | Meaning |
//! |-----------|-------------|---------|
//! | UTF-8 lead (or NUL) | - | NUL-terminated source text |
//! | cell node | kind, nonzero | API handle ([`CellvmNode`]) |
//! | cell node | 0 | end of the array |
//! | null pointer | - | end of the array |
//! | series node | instruction code | release-on-use, quote, unquote |
//! | 0xC0 / 0xC1 | - | freed node: rejected |
//!
//! Nothing past the end marker is ever read. A release-on-use handle is
//! freed exactly once: when the feed reaches it, or when an unfinished
//! feed is drained after an error.
//!
//! Every entry point catches panics (fatal crashes included) and reports
//! them through the last-error slot instead of unwinding into C.

use crate::config::Config;
use crate::error::{format_panic_payload, set_last_error, take_last_error};
use crate::interpreter::Interpreter;
use crate::variadic::{ApiHandle, ApiItem, VariadicSource};
use cellvm_core::node::{Detected, Header, detect};
use cellvm_core::{Cell, PairingId};
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};

const INSTRUCTION_RELEASE: u8 = 1;
const INSTRUCTION_QUOTE: u8 = 2;
const INSTRUCTION_UNQUOTE: u8 = 3;

/// What C holds for an API handle or instruction. The header is stored
/// big-endian so its leading byte comes first in memory.
#[repr(C)]
#[derive(Debug)]
pub struct CellvmNode {
    header: [u8; 4],
    pairing: u32,
}

impl CellvmNode {
    const fn instruction(code: u8) -> Self {
        CellvmNode {
            header: Header::series().with_second_byte(code).bits().to_be_bytes(),
            pairing: 0,
        }
    }
}

static END_NODE: CellvmNode = CellvmNode {
    header: Header::cell().bits().to_be_bytes(),
    pairing: 0,
};
static QUOTE_NODE: CellvmNode = CellvmNode::instruction(INSTRUCTION_QUOTE);
static UNQUOTE_NODE: CellvmNode = CellvmNode::instruction(INSTRUCTION_UNQUOTE);

/// Variadic source over a C pointer array.
struct PointerSource {
    cursor: *const *const c_void,
    done: bool,
}

impl PointerSource {
    /// # Safety
    ///
    /// `items` must point to an array of valid pointers ended by the end
    /// marker, alive until the source is finished.
    unsafe fn new(items: *const *const c_void) -> Self {
        PointerSource {
            cursor: items,
            done: items.is_null(),
        }
    }

    /// Item for one pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be non-null and point to text or a node.
    unsafe fn classify(ptr: *const c_void) -> ApiItem {
        let bytes = ptr as *const u8;
        // SAFETY: every accepted pointer has at least one readable byte, and
        // the second byte is read only when the first says it is a node.
        let detected = unsafe { detect(*bytes, || *bytes.add(1)) };
        match detected {
            Detected::End => ApiItem::End,
            Detected::Utf8 => {
                // SAFETY: a UTF-8 lead means a NUL-terminated C string.
                let text = unsafe { CStr::from_ptr(ptr as *const c_char) };
                ApiItem::Text(text.to_string_lossy().into_owned())
            }
            Detected::Cell => {
                // SAFETY: a cell lead means a CellvmNode made by this module.
                let node = unsafe { &*(ptr as *const CellvmNode) };
                ApiItem::Handle(PairingId::from_raw(node.pairing))
            }
            Detected::Series => {
                // SAFETY: as above, for instruction nodes.
                let code = unsafe { *bytes.add(1) };
                match code {
                    INSTRUCTION_RELEASE => {
                        // SAFETY: release-on-use nodes are boxed by
                        // cellvm_release_on_use and consumed here once.
                        let node = unsafe { Box::from_raw(ptr as *mut CellvmNode) };
                        ApiItem::Release(ApiHandle(PairingId::from_raw(node.pairing)))
                    }
                    INSTRUCTION_QUOTE => ApiItem::Quote,
                    INSTRUCTION_UNQUOTE => ApiItem::Unquote,
                    _ => ApiItem::Cell(Cell::END),
                }
            }
            // an END cell splices as a bad-splice error
            Detected::FreedSeries | Detected::FreedCell | Detected::Invalid => {
                ApiItem::Cell(Cell::END)
            }
        }
    }
}

impl VariadicSource for PointerSource {
    fn next_item(&mut self) -> ApiItem {
        if self.done {
            return ApiItem::End;
        }
        // SAFETY: not done, so the cursor is at or before the end marker.
        let ptr = unsafe { *self.cursor };
        // a null entry ends the array like the end marker
        if ptr.is_null() {
            self.done = true;
            return ApiItem::End;
        }
        // SAFETY: non-null entry of the caller's array.
        let item = unsafe { Self::classify(ptr) };
        if matches!(item, ApiItem::End) {
            self.done = true;
        } else {
            // SAFETY: the marker has not been reached, so the next slot exists.
            self.cursor = unsafe { self.cursor.add(1) };
        }
        item
    }
}

/// Run `body`, turning a panic into a last-error message and `failed`.
fn guarded<T>(failed: T, body: impl FnOnce() -> T) -> T {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(value) => value,
        Err(payload) => {
            let message = format_panic_payload(&payload);
            tracing::error!(%message, "panic at the C boundary");
            set_last_error(message);
            failed
        }
    }
}

fn handle_node(interp: &Interpreter, handle: ApiHandle) -> *mut CellvmNode {
    let header = interp.heap.pairing_header(handle.id()).bits().to_be_bytes();
    Box::into_raw(Box::new(CellvmNode {
        header,
        pairing: handle.id().raw(),
    }))
}

// =============================================================================
// Interpreter lifetime
// =============================================================================

/// New interpreter configured from the environment.
#[unsafe(no_mangle)]
pub extern "C" fn cellvm_new() -> *mut Interpreter {
    guarded(std::ptr::null_mut(), || {
        Box::into_raw(Box::new(Interpreter::new(Config::from_env())))
    })
}

/// # Safety
///
/// `interp` must come from [`cellvm_new`] and not be used afterwards.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cellvm_free(interp: *mut Interpreter) {
    if !interp.is_null() {
        // SAFETY: caller passes a pointer from cellvm_new exactly once.
        drop(unsafe { Box::from_raw(interp) });
    }
}

// =============================================================================
// Markers and handles
// =============================================================================

#[unsafe(no_mangle)]
pub extern "C" fn cellvm_end() -> *const c_void {
    &END_NODE as *const CellvmNode as *const c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn cellvm_quote() -> *const c_void {
    &QUOTE_NODE as *const CellvmNode as *const c_void
}

#[unsafe(no_mangle)]
pub extern "C" fn cellvm_unquote() -> *const c_void {
    &UNQUOTE_NODE as *const CellvmNode as *const c_void
}

/// Handle holding an INTEGER!.
///
/// # Safety
///
/// `interp` must be a live interpreter.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cellvm_integer(interp: *mut Interpreter, value: i64) -> *mut CellvmNode {
    // SAFETY: caller guarantees a live interpreter.
    let Some(interp) = (unsafe { interp.as_mut() }) else {
        return std::ptr::null_mut();
    };
    guarded(std::ptr::null_mut(), || {
        let handle = interp.integer(value);
        handle_node(interp, handle)
    })
}

/// Read an INTEGER! handle into `out`. Returns 0 on success, -1 if the
/// handle holds something else.
///
/// # Safety
///
/// `interp` must be live, `node` a live handle, `out` writable.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cellvm_to_integer(
    interp: *const Interpreter,
    node: *const CellvmNode,
    out: *mut i64,
) -> c_int {
    // SAFETY: caller guarantees all three pointers.
    let (Some(interp), Some(node)) = (unsafe { interp.as_ref() }, unsafe { node.as_ref() }) else {
        return -1;
    };
    guarded(-1, || {
        match interp.heap.pairing(PairingId::from_raw(node.pairing)).as_integer() {
            Some(i) if !out.is_null() => {
                // SAFETY: checked non-null; caller guarantees writable.
                unsafe { *out = i };
                0
            }
            _ => -1,
        }
    })
}

/// Turn a handle into a release-on-use instruction: the next evaluation
/// that reaches it splices its value and frees it.
///
/// # Safety
///
/// `node` must be a live handle from this module, not used again by C.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cellvm_release_on_use(node: *mut CellvmNode) -> *mut CellvmNode {
    // SAFETY: caller guarantees a live handle.
    if let Some(node) = unsafe { node.as_mut() } {
        node.header = Header::series()
            .with_second_byte(INSTRUCTION_RELEASE)
            .bits()
            .to_be_bytes();
    }
    node
}

/// # Safety
///
/// `interp` must be live and `node` a live handle, released only once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cellvm_release(interp: *mut Interpreter, node: *mut CellvmNode) {
    // SAFETY: caller guarantees a live interpreter.
    let Some(interp) = (unsafe { interp.as_mut() }) else {
        return;
    };
    if node.is_null() {
        return;
    }
    // SAFETY: node was boxed by handle_node and is released once.
    let node = unsafe { Box::from_raw(node) };
    guarded((), || interp.release(ApiHandle(PairingId::from_raw(node.pairing))));
}

// =============================================================================
// Evaluation
// =============================================================================

/// Evaluate the pointer array `items`. Returns a handle to the result, or
/// null with the report in the last-error slot.
///
/// # Safety
///
/// `interp` must be live; `items` must be an array of text pointers and
/// nodes from this module, ended by [`cellvm_end`].
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cellvm_run(
    interp: *mut Interpreter,
    items: *const *const c_void,
) -> *mut CellvmNode {
    // SAFETY: caller guarantees a live interpreter.
    let Some(interp) = (unsafe { interp.as_mut() }) else {
        set_last_error("null interpreter");
        return std::ptr::null_mut();
    };
    // SAFETY: caller guarantees the array contract.
    let source = unsafe { PointerSource::new(items) };
    guarded(std::ptr::null_mut(), || match interp.run_with(Box::new(source)) {
        Ok(value) => {
            let handle = interp.handle(value);
            handle_node(interp, handle)
        }
        Err(flow) => {
            set_last_error(interp.report(&flow));
            std::ptr::null_mut()
        }
    })
}

/// Take the last error message, or null if there is none. Free it with
/// [`cellvm_free_string`].
#[unsafe(no_mangle)]
pub extern "C" fn cellvm_last_error() -> *mut c_char {
    match take_last_error().and_then(|message| CString::new(message).ok()) {
        Some(message) => message.into_raw(),
        None => std::ptr::null_mut(),
    }
}

/// # Safety
///
/// `s` must come from [`cellvm_last_error`] and be freed once.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cellvm_free_string(s: *mut c_char) {
    if !s.is_null() {
        // SAFETY: caller passes a string from CString::into_raw once.
        drop(unsafe { CString::from_raw(s) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last_error() -> String {
        let raw = cellvm_last_error();
        assert!(!raw.is_null());
        let message = unsafe { CStr::from_ptr(raw) }.to_string_lossy().into_owned();
        unsafe { cellvm_free_string(raw) };
        message
    }

    #[test]
    fn test_run_text_and_release_on_use_handle() {
        let interp = cellvm_new();
        let before = unsafe { (*interp).heap.live_pairings() };
        let code = CString::new("add 1").unwrap();
        let twenty = unsafe { cellvm_release_on_use(cellvm_integer(interp, 20)) };
        let items = [
            code.as_ptr() as *const c_void,
            twenty as *const c_void,
            cellvm_end(),
        ];
        let result = unsafe { cellvm_run(interp, items.as_ptr()) };
        assert!(!result.is_null());

        let mut out = 0i64;
        assert_eq!(unsafe { cellvm_to_integer(interp, result, &mut out) }, 0);
        assert_eq!(out, 21);
        unsafe { cellvm_release(interp, result) };
        assert_eq!(unsafe { (*interp).heap.live_pairings() }, before);
        unsafe { cellvm_free(interp) };
    }

    #[test]
    fn test_quote_instruction_applies_to_handle() {
        let interp = cellvm_new();
        let code = CString::new("quote").unwrap();
        let one = unsafe { cellvm_integer(interp, 1) };
        let items = [
            code.as_ptr() as *const c_void,
            cellvm_quote(),
            one as *const c_void,
            cellvm_end(),
        ];
        let result = unsafe { cellvm_run(interp, items.as_ptr()) };
        assert!(!result.is_null());
        // the literal argument was already quoted once by the instruction
        let quoted = unsafe { (*interp).heap.pairing(PairingId::from_raw((*result).pairing)) };
        assert_eq!(quoted.quote_depth(), 2);
        unsafe {
            cellvm_release(interp, result);
            cellvm_release(interp, one);
            cellvm_free(interp);
        }
    }

    #[test]
    fn test_error_drains_remaining_release_handles() {
        let interp = cellvm_new();
        let before = unsafe { (*interp).heap.live_pairings() };
        let code = CString::new("fail \"stop\"").unwrap();
        let pending = unsafe { cellvm_release_on_use(cellvm_integer(interp, 5)) };
        let items = [
            code.as_ptr() as *const c_void,
            pending as *const c_void,
            cellvm_end(),
        ];
        let result = unsafe { cellvm_run(interp, items.as_ptr()) };
        assert!(result.is_null());
        assert!(last_error().contains("stop"));
        assert_eq!(unsafe { (*interp).heap.live_pairings() }, before);
        unsafe { cellvm_free(interp) };
    }

    #[test]
    fn test_freed_node_is_a_bad_splice() {
        let interp = cellvm_new();
        let freed = [cellvm_core::node::FREED_CELL_BYTE, 0, 0, 0];
        let items = [freed.as_ptr() as *const c_void, cellvm_end()];
        let result = unsafe { cellvm_run(interp, items.as_ptr()) };
        assert!(result.is_null());
        assert!(last_error().contains("invalid value spliced"));
        unsafe { cellvm_free(interp) };
    }

    #[test]
    fn test_null_entry_ends_the_array() {
        let interp = cellvm_new();
        let code = CString::new("add 1 2").unwrap();
        let unread = CString::new("fail \"never read\"").unwrap();
        let items = [
            code.as_ptr() as *const c_void,
            std::ptr::null(),
            unread.as_ptr() as *const c_void,
            cellvm_end(),
        ];
        let result = unsafe { cellvm_run(interp, items.as_ptr()) };
        assert!(!result.is_null());
        let mut out = 0i64;
        assert_eq!(unsafe { cellvm_to_integer(interp, result, &mut out) }, 0);
        assert_eq!(out, 3);
        unsafe {
            cellvm_release(interp, result);
            cellvm_free(interp);
        }
    }

    #[test]
    fn test_end_marker_is_never_passed() {
        let items = [cellvm_end(), std::ptr::null()];
        let mut source = unsafe { PointerSource::new(items.as_ptr()) };
        assert!(matches!(source.next_item(), ApiItem::End));
        assert!(matches!(source.next_item(), ApiItem::End));
    }
}
