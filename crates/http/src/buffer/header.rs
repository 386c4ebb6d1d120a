//! Header-syntax scanning and span-based header re-emission.
//!
//! [`HeaderBuffer`] specializes the [`ByteScanner`] for HTTP header syntax:
//! space-separated start-line items, `name: value` field lines and CRLF
//! framing. It owns the retained block chain for the current message's
//! header region, which makes it the natural home of the two operations
//! that replay those bytes later: [`write_header`](HeaderBuffer::write_header)
//! (with span modifications applied) and [`write_range`](HeaderBuffer::write_range).
//!
//! The prefetch hand-off between consecutive messages on a persistent
//! connection also lives here, delegated to the scanner.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::buffer::block::BlockPool;
use crate::buffer::scanner::{ByteScanner, Prefetch};
use crate::protocol::{Handled, ModificationList, ParseError, SendError, Span};

/// Scanner specialized for header syntax, owner of the header block chain.
pub struct HeaderBuffer<R> {
    scanner: ByteScanner<R>,
}

impl<R> std::fmt::Debug for HeaderBuffer<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderBuffer").field("scanner", &self.scanner).finish()
    }
}

impl<R> HeaderBuffer<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(source: R, pool: BlockPool) -> Self {
        Self { scanner: ByteScanner::new(source, pool) }
    }

    /// Cumulative bytes consumed since the start of the header region;
    /// the offset spans are built from.
    pub fn current_offset(&self) -> u32 {
        self.scanner.current_offset() as u32
    }

    /// Reads one space-separated start-line item. The last item on the
    /// line runs to CRLF instead of a single space. Returns the collected
    /// bytes, their span, and whether the scan ended at end of line.
    pub async fn read_token(&mut self, decapitalize: bool, last: bool) -> Result<(Vec<u8>, Span, bool), ParseError> {
        let start = self.current_offset();
        let mut buf = Vec::new();
        let at_eol = if last {
            // bare LF accepted as line end, same leniency as CRLF scanning
            self.scanner.read_ascii_to(b'\n', &mut buf, decapitalize).await?;
            true
        } else {
            self.scanner.read_ascii_to(b' ', &mut buf, decapitalize).await?
        };
        let span = Span::new(start, start + buf.len() as u32);
        Ok((buf, span, at_eol))
    }

    /// Reads the remainder of a field name whose first (already consumed,
    /// already decapitalized) byte is `first`. Returns `None` when the line
    /// ended before a colon; the line has then been consumed entirely.
    pub async fn read_field_name(&mut self, first: u8) -> Result<Option<Vec<u8>>, ParseError> {
        let mut name = vec![first];
        let at_eol = self.scanner.read_ascii_to(b':', &mut name, true).await?;
        if at_eol {
            return Ok(None);
        }
        while name.last().is_some_and(|b| *b == b' ' || *b == b'\t') {
            name.pop();
        }
        Ok(Some(name))
    }

    /// Reads a field value up to CRLF, skipping leading whitespace.
    /// Returns the raw bytes and the span they occupy.
    pub async fn read_field_value(&mut self) -> Result<(Vec<u8>, Span), ParseError> {
        loop {
            let b = self.scanner.next_byte().await?;
            if b != b' ' && b != b'\t' {
                self.scanner.rewind(1);
                break;
            }
        }
        let start = self.current_offset();
        let mut buf = Vec::new();
        self.scanner.read_ascii_to(b'\n', &mut buf, false).await?;
        let span = Span::new(start, start + buf.len() as u32);
        Ok((buf, span))
    }

    /// Skips the rest of an uninteresting field line.
    pub async fn skip_field(&mut self) -> Result<(), ParseError> {
        self.scanner.skip_to_crlf().await?;
        Ok(())
    }

    /// Streams the header region `[0, header_len)` to the sink, applying
    /// modifications in ascending span order. A handler returning
    /// [`Handled::Replaced`] suppresses the original span bytes; the bytes
    /// it wrote through the [`Modifier`](crate::protocol::Modifier) take
    /// their place. [`Handled::Kept`] emits the original bytes unchanged.
    pub async fn write_header<W>(
        &self,
        sink: &mut W,
        header_len: usize,
        modifications: &mut ModificationList,
    ) -> Result<(), SendError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut cursor = 0usize;
        let mut staged = BytesMut::new();

        for entry in modifications.entries_mut() {
            let span = entry.span();
            let (start, end) = (span.start() as usize, span.end() as usize);
            debug_assert!(cursor <= start && end <= header_len, "modification spans must be sorted and in range");

            self.write_range(sink, cursor, start).await?;

            staged.clear();
            match entry.apply(&mut staged) {
                Handled::Replaced => {
                    if !staged.is_empty() {
                        sink.write_all(&staged).await?;
                    }
                }
                Handled::Kept => self.write_range(sink, start, end).await?,
            }
            cursor = end;
        }

        self.write_range(sink, cursor, header_len).await?;
        Ok(())
    }

    /// Replays retained bytes `[start, end)` of the current message.
    pub async fn write_range<W>(&self, sink: &mut W, mut start: usize, end: usize) -> Result<(), SendError>
    where
        W: AsyncWrite + Unpin,
    {
        while start < end {
            let chunk = self.scanner.chunk_at(start, end);
            sink.write_all(chunk).await?;
            start += chunk.len();
        }
        Ok(())
    }

    /// Releases the block chain, carrying unread bytes forward as the next
    /// message's prefetch.
    pub fn reset(&mut self) {
        self.scanner.reset();
    }

    /// Swaps the byte source; pending prefetch and buffered bytes are
    /// discarded so stale bytes are never replayed against the new source.
    pub fn reconnect_input(&mut self, source: R) {
        self.scanner.reconnect_input(source);
    }

    /// Accepts an externally-sourced prefetched block for the next read.
    pub fn set_prefetched(&mut self, prefetch: Prefetch) {
        self.scanner.set_prefetched(prefetch);
    }

    /// Dismantles the buffer, returning the source plus every buffered but
    /// unconsumed byte in stream order.
    pub fn into_parts(self) -> (R, Vec<u8>) {
        self.scanner.into_parts()
    }

    // scanning primitives used by the body buffer

    pub(crate) fn set_streaming(&mut self, streaming: bool) {
        self.scanner.set_streaming(streaming);
    }

    pub(crate) async fn next_byte(&mut self) -> Result<u8, ParseError> {
        self.scanner.next_byte().await
    }

    pub(crate) async fn fill_some(&mut self) -> Result<(), ParseError> {
        self.scanner.fill_some().await
    }

    pub(crate) async fn fill_exact(&mut self, n: usize) -> Result<(), ParseError> {
        self.scanner.fill_exact(n).await
    }

    pub(crate) async fn read_raw_line(&mut self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        self.scanner.read_raw_line(buf).await
    }

    pub(crate) async fn read_exact_from_source(&mut self, buf: &mut [u8]) -> Result<(), ParseError> {
        self.scanner.read_exact_from_source(buf).await
    }

    pub(crate) fn unread_chunk(&self) -> &[u8] {
        self.scanner.unread_chunk()
    }

    pub(crate) fn advance(&mut self, n: usize) {
        self.scanner.advance(n);
    }

    pub(crate) fn resident_capacity(&self) -> usize {
        self.scanner.resident_capacity()
    }
}
