//! Variadic feed sources
//!
//! An API call hands the evaluator a stream of heterogeneous items instead
//! of an array: source text to scan, ready-made cells, API handles, and
//! instructions. Items are pulled one at a time as evaluation needs them,
//! so a stream is never walked twice unless it is reified into an array.

use cellvm_core::{Cell, PairingId};

/// An API handle: a rooted cell owned by the embedder until released.
///
/// Not `Clone`, so a handle passed as [`ApiItem::Release`] is moved into
/// the feed and freed exactly once, when the feed consumes or drains it.
#[derive(Debug)]
#[must_use = "API handles stay rooted until released"]
pub struct ApiHandle(pub(crate) PairingId);

impl ApiHandle {
    pub fn id(&self) -> PairingId {
        self.0
    }
}

#[derive(Debug)]
pub enum ApiItem {
    /// Source text, scanned and bound when reached.
    Text(String),
    /// A value spliced as-is.
    Cell(Cell),
    /// A handle spliced by reference; the embedder keeps ownership.
    Handle(PairingId),
    /// A handle spliced and then released.
    Release(ApiHandle),
    /// Add one quoting level to the next spliced value.
    Quote,
    /// Remove one quoting level from the next spliced value.
    Unquote,
    End,
}

pub trait VariadicSource {
    /// Next item; [`ApiItem::End`] once exhausted (and forever after).
    fn next_item(&mut self) -> ApiItem;

    /// Called once, after the last item was taken.
    fn finish(&mut self) {}
}

/// A source over an owned list of items.
#[derive(Debug)]
pub struct ItemSource {
    items: std::vec::IntoIter<ApiItem>,
    finished: bool,
}

impl ItemSource {
    pub fn new(items: Vec<ApiItem>) -> Self {
        ItemSource {
            items: items.into_iter(),
            finished: false,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl VariadicSource for ItemSource {
    fn next_item(&mut self) -> ApiItem {
        self.items.next().unwrap_or(ApiItem::End)
    }

    fn finish(&mut self) {
        self.finished = true;
    }
}

impl From<Vec<ApiItem>> for ItemSource {
    fn from(items: Vec<ApiItem>) -> Self {
        ItemSource::new(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_source_ends_and_stays_ended() {
        let mut source = ItemSource::new(vec![ApiItem::Text("1".into()), ApiItem::Quote]);
        assert!(matches!(source.next_item(), ApiItem::Text(_)));
        assert!(matches!(source.next_item(), ApiItem::Quote));
        assert!(matches!(source.next_item(), ApiItem::End));
        assert!(matches!(source.next_item(), ApiItem::End));
        assert!(!source.is_finished());
        source.finish();
        assert!(source.is_finished());
    }
}
