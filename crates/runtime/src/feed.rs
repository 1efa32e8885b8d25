//! Feeds
//!
//! A feed is the stream of values a frame evaluates: either a position in
//! an array, or a variadic source that is pulled from one item at a time.
//! Either way the evaluator sees the same three things:
//!
//! - `value`: the current (not yet consumed) cell, `None` at the end
//! - `lookback`: the cell consumed by the last fetch
//! - `specifier`: the frame varlist relative cells are resolved against
//!
//! Fetching only moves forward. Array positions increase by one per fetch;
//! a variadic source hands out each item once. Anything that needs to look
//! back further, or revisit a variadic stream, must first [reify] it into
//! an array.
//!
//! [reify]: Interpreter::reify_feed

use crate::error::RuntimeError;
use crate::interpreter::{FeedId, Interpreter};
use crate::throw::Eval;
use crate::variadic::{ApiItem, VariadicSource};
use cellvm_core::series::SERIES_INFO_HOLD;
use cellvm_core::{Cell, Fatal, Heap, SeriesId, WordKind, crash, sym};

pub(crate) enum Source {
    Array {
        series: SeriesId,
        index: usize,
    },
    Variadic {
        source: Box<dyn VariadicSource>,
        /// Array scanned from a text item, and the next index to read.
        fragment: Option<(SeriesId, usize)>,
    },
    /// A variadic source that has been exhausted and finished.
    Finished,
}

pub struct Feed {
    source: Source,
    value: Option<Cell>,
    lookback: Cell,
    pub(crate) specifier: Option<SeriesId>,
    /// Quoting levels to add (or remove, if negative) on the next splice.
    quoting: i16,
    /// Array this feed put a hold on, released when the feed is popped.
    held: Option<SeriesId>,
    consumed: usize,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let source = match &self.source {
            Source::Array { series, index } => format!("array {series:?} @ {index}"),
            Source::Variadic { fragment, .. } => format!("variadic (fragment {fragment:?})"),
            Source::Finished => "finished".to_string(),
        };
        f.debug_struct("Feed")
            .field("source", &source)
            .field("value", &self.value)
            .field("specifier", &self.specifier)
            .field("consumed", &self.consumed)
            .finish()
    }
}

impl Feed {
    /// Feed positioned at `index` of an array.
    pub fn from_array(
        heap: &Heap,
        series: SeriesId,
        index: usize,
        specifier: Option<SeriesId>,
    ) -> Self {
        Feed {
            value: heap.series(series).at(index).copied(),
            source: Source::Array { series, index },
            lookback: Cell::END,
            specifier,
            quoting: 0,
            held: None,
            consumed: 0,
        }
    }

    /// Feed over a variadic source. Nothing is pulled until it is primed.
    pub fn from_variadic(source: Box<dyn VariadicSource>) -> Self {
        Feed {
            source: Source::Variadic {
                source,
                fragment: None,
            },
            value: None,
            lookback: Cell::END,
            specifier: None,
            quoting: 0,
            held: None,
            consumed: 0,
        }
    }

    pub fn value(&self) -> Option<&Cell> {
        self.value.as_ref()
    }

    pub fn lookback(&self) -> &Cell {
        &self.lookback
    }

    pub fn is_end(&self) -> bool {
        self.value.is_none()
    }

    pub fn is_variadic(&self) -> bool {
        !matches!(self.source, Source::Array { .. })
    }

    /// Backing array and index of the current value, for array feeds.
    pub fn array_position(&self) -> Option<(SeriesId, usize)> {
        match self.source {
            Source::Array { series, index } => Some((series, index)),
            _ => None,
        }
    }

    /// Number of fetches performed so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    pub(crate) fn gc_roots(&self, cells: &mut Vec<Cell>, series: &mut Vec<SeriesId>) {
        cells.extend(self.value);
        cells.push(self.lookback);
        series.extend(self.specifier);
        match self.source {
            Source::Array { series: s, .. } => series.push(s),
            Source::Variadic {
                fragment: Some((s, _)),
                ..
            } => series.push(s),
            _ => {}
        }
    }
}

impl Interpreter {
    pub(crate) fn push_feed(&mut self, feed: Feed) -> FeedId {
        self.feeds.push(feed);
        FeedId(self.feeds.len() - 1)
    }

    pub(crate) fn push_array_feed(
        &mut self,
        series: SeriesId,
        index: usize,
        specifier: Option<SeriesId>,
    ) -> FeedId {
        let feed = Feed::from_array(&self.heap, series, index, specifier);
        self.push_feed(feed)
    }

    /// Push a variadic feed and pull its first value.
    pub(crate) fn push_variadic_feed(&mut self, source: Box<dyn VariadicSource>) -> Eval<FeedId> {
        let id = self.push_feed(Feed::from_variadic(source));
        match self.next_variadic_value(id) {
            Ok(value) => {
                self.feeds[id.0].value = value;
                Ok(id)
            }
            Err(flow) => {
                self.pop_feed(id);
                Err(flow)
            }
        }
    }

    pub fn feed(&self, id: FeedId) -> &Feed {
        &self.feeds[id.0]
    }

    /// Pop the innermost feed, which must be `id`. A variadic source that
    /// was not exhausted is drained, releasing any handles it still owns.
    pub(crate) fn pop_feed(&mut self, id: FeedId) {
        if id.0 + 1 != self.feeds.len() {
            crash(Fatal::Invariant(format!(
                "popping feed {} with {} live",
                id.0,
                self.feeds.len()
            )));
        }
        let Some(feed) = self.feeds.pop() else {
            crash(Fatal::Invariant("feed stack underflow".into()));
        };
        if let Some(held) = feed.held {
            self.heap.series_mut(held).clear_info(SERIES_INFO_HOLD);
        }
        if let Source::Variadic { mut source, .. } = feed.source {
            let mut released = 0usize;
            loop {
                match source.next_item() {
                    ApiItem::End => break,
                    ApiItem::Release(handle) => {
                        self.heap.free_pairing(handle.0);
                        released += 1;
                    }
                    _ => {}
                }
            }
            source.finish();
            tracing::trace!(released, "drained unfinished variadic feed");
        }
    }

    /// Hold the feed's array so it can't change size under evaluation.
    /// Does nothing if it is already held by someone else.
    pub(crate) fn take_hold(&mut self, id: FeedId) {
        let feed = &mut self.feeds[id.0];
        if let Source::Array { series, .. } = feed.source {
            let array = self.heap.series_mut(series);
            if !array.has_info(SERIES_INFO_HOLD) {
                array.set_info(SERIES_INFO_HOLD);
                feed.held = Some(series);
            }
        }
    }

    /// Advance to the next value. The old current value becomes lookback.
    pub(crate) fn fetch_next(&mut self, id: FeedId) -> Eval<()> {
        let feed = &mut self.feeds[id.0];
        feed.lookback = feed.value.take().unwrap_or(Cell::END);
        feed.consumed += 1;
        if let Source::Array { series, index } = &mut feed.source {
            *index += 1;
            feed.value = self.heap.series(*series).at(*index).copied();
            return Ok(());
        }
        if matches!(feed.source, Source::Variadic { .. }) {
            let value = self.next_variadic_value(id)?;
            self.feeds[id.0].value = value;
        }
        Ok(())
    }

    /// Pull the next value out of a variadic source: continue a scanned
    /// fragment, scan a new text item, or splice a cell. Finishes the
    /// source when it runs out.
    fn next_variadic_value(&mut self, id: FeedId) -> Eval<Option<Cell>> {
        loop {
            let feed = &mut self.feeds[id.0];
            let Source::Variadic { source, fragment } = &mut feed.source else {
                return Ok(None);
            };
            if let Some((series, next)) = fragment {
                if let Some(cell) = self.heap.series(*series).at(*next).copied() {
                    *next += 1;
                    return Ok(Some(cell));
                }
                *fragment = None;
            }
            match source.next_item() {
                ApiItem::End => {
                    source.finish();
                    feed.source = Source::Finished;
                    return Ok(None);
                }
                ApiItem::Quote => feed.quoting += 1,
                ApiItem::Unquote => feed.quoting -= 1,
                ApiItem::Text(text) => {
                    let array = self.load_fragment(&text)?;
                    if let Source::Variadic { fragment, .. } = &mut self.feeds[id.0].source {
                        *fragment = Some((array, 0));
                    }
                }
                ApiItem::Cell(cell) => return self.splice(id, cell).map(Some),
                ApiItem::Handle(pairing) => {
                    let cell = *self.heap.pairing(pairing);
                    return self.splice(id, cell).map(Some);
                }
                ApiItem::Release(handle) => {
                    let cell = *self.heap.pairing(handle.0);
                    self.heap.free_pairing(handle.0);
                    return self.splice(id, cell).map(Some);
                }
            }
        }
    }

    /// Apply pending quoting to a spliced cell.
    fn splice(&mut self, id: FeedId, cell: Cell) -> Eval<Cell> {
        let quoting = std::mem::take(&mut self.feeds[id.0].quoting);
        if cell.is_end() {
            return Err(self.raise(RuntimeError::BadSplice));
        }
        let cell = cell.copied();
        if quoting >= 0 {
            match u8::try_from(quoting).ok().and_then(|q| cell.quoted(q)) {
                Some(quoted) => Ok(quoted),
                None => Err(self.raise(RuntimeError::BadSplice)),
            }
        } else {
            Ok((0..quoting.unsigned_abs()).fold(cell, |c, _| c.unquoted()))
        }
    }

    /// Turn a variadic feed into an array feed over the same values.
    ///
    /// Everything not yet consumed (starting with the current value) is
    /// pulled out of the source, which is finished. With `truncated`, a
    /// `--optimized-out--` word is placed first to mark that earlier items
    /// of the stream are no longer available. The feed continues at the
    /// same current value, and the new array is held unless the feed was
    /// already at its end.
    pub fn reify_feed(&mut self, id: FeedId, truncated: bool) -> Eval<()> {
        if !self.feeds[id.0].is_variadic() {
            return Ok(());
        }
        let base = self.stack.depth();
        if truncated {
            self.stack.push(Cell::word(WordKind::Word, sym::OPTIMIZED_OUT));
        }
        if let Some(current) = self.feeds[id.0].value {
            self.stack.push(current);
            loop {
                match self.next_variadic_value(id) {
                    Ok(Some(cell)) => self.stack.push(cell),
                    Ok(None) => break,
                    Err(flow) => {
                        self.stack.drop_to(base);
                        return Err(flow);
                    }
                }
            }
        }
        let array = self.stack.pop_to_array(&mut self.heap, base, true);
        // an exhausted feed only keeps the array as a record of truncation
        let at_end = self.feeds[id.0].value.is_none();
        if !at_end {
            self.heap.series_mut(array).set_info(SERIES_INFO_HOLD);
        }

        let feed = &mut self.feeds[id.0];
        let index = usize::from(truncated);
        feed.source = Source::Array { series: array, index };
        feed.held = (!at_end).then_some(array);
        feed.specifier = None;
        tracing::trace!(?array, truncated, "reified variadic feed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::variadic::ItemSource;

    fn interp() -> Interpreter {
        Interpreter::new(Config::default())
    }

    #[test]
    fn test_array_feed_moves_forward() {
        let mut interp = interp();
        let cells = [Cell::integer(1), Cell::integer(2), Cell::integer(3)];
        let array = interp.heap.make_array_from(&cells, true);
        let id = interp.push_array_feed(array, 0, None);

        let mut last = None;
        while let Some(value) = interp.feed(id).value().copied() {
            let (_, index) = interp.feed(id).array_position().unwrap();
            if let Some(prev) = last {
                assert!(index > prev);
            }
            last = Some(index);
            interp.fetch_next(id).unwrap();
            assert_eq!(interp.feed(id).lookback(), &value);
        }
        assert_eq!(interp.feed(id).consumed(), 3);
        interp.pop_feed(id);
    }

    #[test]
    fn test_variadic_feed_scans_text_and_splices_cells() {
        let mut interp = interp();
        let source = ItemSource::new(vec![
            ApiItem::Text("1 2".into()),
            ApiItem::Cell(Cell::integer(3)),
        ]);
        let id = interp.push_variadic_feed(Box::new(source)).unwrap();
        let mut seen = Vec::new();
        while let Some(value) = interp.feed(id).value().copied() {
            seen.push(value.as_integer().unwrap());
            interp.fetch_next(id).unwrap();
        }
        assert_eq!(seen, vec![1, 2, 3]);
        interp.pop_feed(id);
    }

    #[test]
    fn test_quote_applies_to_next_splice_only() {
        let mut interp = interp();
        let source = ItemSource::new(vec![
            ApiItem::Quote,
            ApiItem::Cell(Cell::integer(1)),
            ApiItem::Cell(Cell::integer(2)),
        ]);
        let id = interp.push_variadic_feed(Box::new(source)).unwrap();
        assert_eq!(interp.feed(id).value().unwrap().quote_depth(), 1);
        interp.fetch_next(id).unwrap();
        assert_eq!(interp.feed(id).value().unwrap().quote_depth(), 0);
        interp.pop_feed(id);
    }

    #[test]
    fn test_spliced_end_is_an_error() {
        let mut interp = interp();
        let source = ItemSource::new(vec![ApiItem::Cell(Cell::END)]);
        let err = interp.push_variadic_feed(Box::new(source)).unwrap_err();
        let error = err.error().unwrap();
        assert_eq!(interp.error_id(&error).as_deref(), Some("bad-splice"));
        assert_eq!(interp.feeds.len(), 0);
    }

    #[test]
    fn test_reify_keeps_current_value() {
        let mut interp = interp();
        let source = ItemSource::new(vec![
            ApiItem::Text("abc".into()),
            ApiItem::Cell(Cell::integer(1)),
        ]);
        let id = interp.push_variadic_feed(Box::new(source)).unwrap();
        interp.reify_feed(id, false).unwrap();

        let (array, index) = interp.feed(id).array_position().unwrap();
        assert_eq!(index, 0);
        let cells = interp.heap.series(array).cells().to_vec();
        assert_eq!(cells.len(), 2);
        let abc = interp.symbols.lookup("abc").unwrap();
        assert_eq!(cells[0].as_symbol(), Some(abc));
        assert_eq!(cells[1].as_integer(), Some(1));
        assert!(interp.heap.series(array).has_info(SERIES_INFO_HOLD));
        interp.pop_feed(id);
        assert!(!interp.heap.series(array).has_info(SERIES_INFO_HOLD));
    }

    #[test]
    fn test_reify_truncated_marks_missing_prefix() {
        let mut interp = interp();
        let source = ItemSource::new(vec![
            ApiItem::Text("abc".into()),
            ApiItem::Cell(Cell::integer(1)),
        ]);
        let id = interp.push_variadic_feed(Box::new(source)).unwrap();
        interp.reify_feed(id, true).unwrap();

        let (array, index) = interp.feed(id).array_position().unwrap();
        assert_eq!(index, 1);
        let cells = interp.heap.series(array).cells();
        assert_eq!(cells[0].as_symbol(), Some(sym::OPTIMIZED_OUT));
        assert_eq!(interp.feed(id).value(), Some(&cells[1]));
        interp.pop_feed(id);
    }

    fn three_items() -> ItemSource {
        ItemSource::new(vec![
            ApiItem::Text("abc".into()),
            ApiItem::Cell(Cell::integer(1)),
            ApiItem::Cell(Cell::integer(2)),
        ])
    }

    #[test]
    fn test_reify_after_consuming_marks_truncation() {
        let mut interp = interp();
        let id = interp.push_variadic_feed(Box::new(three_items())).unwrap();
        interp.fetch_next(id).unwrap();
        let current = interp.feed(id).value().copied().unwrap();
        assert_eq!(current.as_integer(), Some(1));

        interp.reify_feed(id, true).unwrap();
        let (array, index) = interp.feed(id).array_position().unwrap();
        assert_eq!(index, 1);
        let cells = interp.heap.series(array).cells().to_vec();
        assert_eq!(cells.len(), 3);
        assert_eq!(cells[0].as_symbol(), Some(sym::OPTIMIZED_OUT));
        assert_eq!(cells[1].as_integer(), Some(1));
        assert_eq!(cells[2].as_integer(), Some(2));
        assert_eq!(interp.feed(id).value().and_then(Cell::as_integer), Some(1));
        assert!(interp.heap.series(array).has_info(SERIES_INFO_HOLD));

        interp.fetch_next(id).unwrap();
        assert_eq!(interp.feed(id).value().and_then(Cell::as_integer), Some(2));
        interp.pop_feed(id);
        assert!(!interp.heap.series(array).has_info(SERIES_INFO_HOLD));
    }

    #[test]
    fn test_reify_after_consuming_without_marker() {
        let mut interp = interp();
        let id = interp.push_variadic_feed(Box::new(three_items())).unwrap();
        interp.fetch_next(id).unwrap();

        interp.reify_feed(id, false).unwrap();
        let (array, index) = interp.feed(id).array_position().unwrap();
        assert_eq!(index, 0);
        let cells = interp.heap.series(array).cells().to_vec();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].as_integer(), Some(1));
        assert_eq!(cells[1].as_integer(), Some(2));
        assert_eq!(interp.feed(id).value(), Some(&cells[0]));
        assert!(interp.heap.series(array).has_info(SERIES_INFO_HOLD));
        interp.pop_feed(id);
        assert!(!interp.heap.series(array).has_info(SERIES_INFO_HOLD));
    }

    #[test]
    fn test_reify_at_end_takes_no_hold() {
        let mut interp = interp();
        let source = ItemSource::new(vec![ApiItem::Cell(Cell::integer(1))]);
        let id = interp.push_variadic_feed(Box::new(source)).unwrap();
        interp.fetch_next(id).unwrap();
        assert!(interp.feed(id).is_end());

        interp.reify_feed(id, true).unwrap();
        let (array, index) = interp.feed(id).array_position().unwrap();
        assert_eq!(index, 1);
        assert!(interp.feed(id).is_end());
        let cells = interp.heap.series(array).cells().to_vec();
        assert_eq!(cells.len(), 1);
        assert_eq!(cells[0].as_symbol(), Some(sym::OPTIMIZED_OUT));
        assert!(!interp.heap.series(array).has_info(SERIES_INFO_HOLD));
        interp.pop_feed(id);
    }

    #[test]
    fn test_pop_drains_and_releases_handles() {
        let mut interp = interp();
        let pairings = interp.heap.live_pairings();
        let handle = interp.handle(Cell::integer(7));
        let source = ItemSource::new(vec![
            ApiItem::Cell(Cell::integer(1)),
            ApiItem::Release(handle),
        ]);
        let id = interp.push_variadic_feed(Box::new(source)).unwrap();
        assert_eq!(interp.heap.live_pairings(), pairings + 1);
        interp.pop_feed(id);
        assert_eq!(interp.heap.live_pairings(), pairings);
    }
}
