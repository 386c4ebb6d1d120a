//! Header spans and the span-based modification machinery.
//!
//! A [`Span`] marks a half-open byte range inside the header region of the
//! current message; offsets are absolute from the start of that region and
//! reset to zero with every message. Messages collect [`Modification`]s
//! keyed by span, sorted ascending and non-overlapping, and apply them
//! while the header is re-emitted: the handler writes replacement bytes
//! through a [`Modifier`] and decides whether the original span bytes are
//! skipped or kept.

use bytes::BytesMut;

use crate::protocol::OverlapError;

/// Half-open `[start, end)` byte range within a message's header region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    start: u32,
    end: u32,
}

impl Span {
    pub fn new(start: u32, end: u32) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Zero-length span, used to mark pure insertion points.
    pub fn at(offset: u32) -> Self {
        Self { start: offset, end: offset }
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn end(&self) -> u32 {
        self.end
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    fn overlaps(&self, other: &Span) -> bool {
        !(self.end <= other.start || other.end <= self.start)
    }
}

/// Outcome of a modification handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The handler wrote replacement bytes (possibly none, to delete);
    /// the original span bytes are skipped.
    Replaced,
    /// The handler wrote nothing; the original span bytes are emitted
    /// unchanged.
    Kept,
}

/// Write access handed to a modification handler while its span is being
/// applied. Bytes written here land in the output exactly at the span's
/// position.
pub struct Modifier<'a> {
    out: &'a mut BytesMut,
    span: Span,
}

impl std::fmt::Debug for Modifier<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Modifier").field("span", &self.span).field("written", &self.out.len()).finish()
    }
}

impl<'a> Modifier<'a> {
    pub(crate) fn new(out: &'a mut BytesMut, span: Span) -> Self {
        Self { out, span }
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.out.extend_from_slice(bytes);
    }
}

/// Handler invoked when its span is reached during header emission.
pub type ModificationHandler = Box<dyn FnMut(&mut Modifier<'_>) -> Handled + Send>;

/// A single span-targeted header rewrite. Without a handler the entry is a
/// pure marker; the original bytes are emitted unchanged.
pub struct Modification {
    span: Span,
    handler: Option<ModificationHandler>,
}

impl Modification {
    pub fn new(span: Span, handler: ModificationHandler) -> Self {
        Self { span, handler: Some(handler) }
    }

    pub fn marker(span: Span) -> Self {
        Self { span, handler: None }
    }

    pub fn span(&self) -> Span {
        self.span
    }

    pub(crate) fn apply(&mut self, out: &mut BytesMut) -> Handled {
        match &mut self.handler {
            Some(handler) => {
                let mut modifier = Modifier::new(out, self.span);
                handler(&mut modifier)
            }
            None => Handled::Kept,
        }
    }
}

impl std::fmt::Debug for Modification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Modification").field("span", &self.span).field("has_handler", &self.handler.is_some()).finish()
    }
}

/// Ordered, non-overlapping list of modifications.
///
/// Invariant: for all adjacent entries, `entry[i].end <= entry[i+1].start`.
/// Zero-length spans at the same offset keep insertion order. Inserting a
/// span that overlaps an existing entry fails.
#[derive(Debug, Default)]
pub struct ModificationList {
    entries: Vec<Modification>,
}

impl ModificationList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Inserts keeping the span ordering invariant. The insertion point is
    /// found by linear scan; a zero-length span inserted at the start of an
    /// existing span sorts before it, equal zero-length spans sort in call
    /// order.
    pub fn insert(&mut self, modification: Modification) -> Result<(), OverlapError> {
        let span = modification.span();
        for existing in &self.entries {
            if existing.span().overlaps(&span) {
                return Err(OverlapError { start: span.start(), end: span.end() });
            }
        }

        let idx = self
            .entries
            .iter()
            .position(|e| {
                let s = e.span();
                s.start() > span.start() || (s.start() == span.start() && s.end() > span.end())
            })
            .unwrap_or(self.entries.len());
        self.entries.insert(idx, modification);

        debug_assert!(self.is_sorted());
        Ok(())
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [Modification] {
        &mut self.entries
    }

    pub fn spans(&self) -> impl Iterator<Item = Span> + '_ {
        self.entries.iter().map(Modification::span)
    }

    fn is_sorted(&self) -> bool {
        self.entries.windows(2).all(|w| w[0].span().end() <= w[1].span().start())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(span: Span) -> Modification {
        Modification::new(span, Box::new(|_| Handled::Kept))
    }

    #[test]
    fn inserts_stay_sorted() {
        let mut list = ModificationList::new();
        list.insert(noop(Span::new(10, 14))).unwrap();
        list.insert(noop(Span::new(0, 4))).unwrap();
        list.insert(noop(Span::new(5, 9))).unwrap();

        let spans: Vec<Span> = list.spans().collect();
        assert_eq!(spans, vec![Span::new(0, 4), Span::new(5, 9), Span::new(10, 14)]);
    }

    #[test]
    fn overlap_is_rejected() {
        let mut list = ModificationList::new();
        list.insert(noop(Span::new(10, 20))).unwrap();

        assert!(list.insert(noop(Span::new(15, 25))).is_err());
        assert!(list.insert(noop(Span::new(5, 11))).is_err());
        assert!(list.insert(noop(Span::new(12, 18))).is_err());
        // zero-length inside an existing span still overlaps
        assert!(list.insert(noop(Span::at(15))).is_err());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn adjacent_spans_are_allowed() {
        let mut list = ModificationList::new();
        list.insert(noop(Span::new(10, 20))).unwrap();
        list.insert(noop(Span::new(20, 30))).unwrap();
        list.insert(noop(Span::new(0, 10))).unwrap();
        assert_eq!(list.len(), 3);
    }

    #[test]
    fn equal_point_zero_length_spans_keep_call_order() {
        let mut list = ModificationList::new();
        for tag in [b'1', b'2', b'3'] {
            list.insert(Modification::new(
                Span::at(7),
                Box::new(move |m| {
                    m.write(&[b'H', tag]);
                    Handled::Replaced
                }),
            ))
            .unwrap();
        }

        let mut out = BytesMut::new();
        for entry in list.entries_mut() {
            entry.apply(&mut out);
        }
        assert_eq!(&out[..], b"H1H2H3");
    }

    #[test]
    fn zero_length_at_span_start_sorts_first() {
        let mut list = ModificationList::new();
        list.insert(noop(Span::new(7, 12))).unwrap();
        list.insert(noop(Span::at(7))).unwrap();

        let spans: Vec<Span> = list.spans().collect();
        assert_eq!(spans, vec![Span::at(7), Span::new(7, 12)]);
    }
}
