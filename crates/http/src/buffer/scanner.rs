//! Byte-at-a-time scanning over a chain of pooled memory blocks.
//!
//! [`ByteScanner`] is the lowest layer of the message core: it pulls bytes
//! from an async source into fixed-size blocks and exposes cursor-style
//! scanning primitives (delimiter search, ASCII collection, bulk copy). It
//! owns no HTTP semantics.
//!
//! Two block regimes exist. While a header is being read every filled block
//! is retained in the chain, because header bytes must be replayable for
//! [`write_header`](crate::buffer::HeaderBuffer::write_header) and spans
//! index into them. Once the owner switches to streaming mode, fresh bytes
//! are served from a single recycled scratch block instead, so arbitrarily
//! large bodies never grow the chain.
//!
//! Bytes pulled past the end of the current message are handed to the next
//! message as a prefetched block; see [`ByteScanner::reset`].

use std::io::ErrorKind;

use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use crate::buffer::block::{Block, BlockPool, BLOCK_SIZE};
use crate::protocol::ParseError;

const CR: u8 = b'\r';
const LF: u8 = b'\n';

/// Bytes already pulled from the source that belong to the next message.
///
/// Ownership of the block moves with the hand-off; the previous owner
/// forgets it before the next owner may read it.
pub struct Prefetch {
    block: Block,
    offset: usize,
    len: usize,
}

impl std::fmt::Debug for Prefetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prefetch").field("offset", &self.offset).field("len", &self.len).finish()
    }
}

impl Prefetch {
    pub fn new(block: Block, offset: usize, len: usize) -> Self {
        debug_assert!(offset + len <= BLOCK_SIZE);
        Self { block, offset, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.block[self.offset..self.offset + self.len]
    }
}

/// Incremental scanner over a growable chain of fixed-size blocks.
///
/// All offsets handed out by [`current_offset`](Self::current_offset) are
/// absolute byte offsets from the start of the current message's header
/// region and stay valid until [`reset`](Self::reset).
///
/// Not safe for concurrent use; each instance is owned by exactly one
/// connection worker.
pub struct ByteScanner<R> {
    source: R,
    pool: BlockPool,

    /// Retained block chain; only the tail block is partially filled.
    blocks: Vec<Block>,
    /// Valid bytes across the chain.
    filled: usize,
    /// Read cursor into the chain.
    pos: usize,

    /// Streaming-mode scratch block and its fill/read cursors.
    scratch: Option<Block>,
    scratch_filled: usize,
    scratch_pos: usize,

    streaming: bool,
    /// Total bytes obtained for the current message (source + prefetch).
    pulled: usize,

    prefetch: Option<Prefetch>,
}

impl<R> std::fmt::Debug for ByteScanner<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteScanner")
            .field("blocks", &self.blocks.len())
            .field("filled", &self.filled)
            .field("pos", &self.pos)
            .field("streaming", &self.streaming)
            .finish_non_exhaustive()
    }
}

impl<R> ByteScanner<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(source: R, pool: BlockPool) -> Self {
        Self {
            source,
            pool,
            blocks: Vec::new(),
            filled: 0,
            pos: 0,
            scratch: None,
            scratch_filled: 0,
            scratch_pos: 0,
            streaming: false,
            pulled: 0,
            prefetch: None,
        }
    }

    /// Absolute offset of the next unread byte, counted from the start of
    /// the current message's header region.
    pub fn current_offset(&self) -> usize {
        self.pos
    }

    /// Switches between retain mode (header phase) and streaming mode
    /// (body phase). In streaming mode fresh bytes no longer grow the
    /// chain; they pass through a recycled scratch block.
    pub fn set_streaming(&mut self, streaming: bool) {
        self.streaming = streaming;
    }

    fn unread_is_empty(&self) -> bool {
        self.pos == self.filled && self.scratch_pos == self.scratch_filled
    }

    /// Number of buffered bytes not yet consumed by the cursor.
    pub fn resident_len(&self) -> usize {
        (self.filled - self.pos) + (self.scratch_filled - self.scratch_pos)
    }

    /// Free space between the cursor and the end of the tail block, or zero
    /// when the cursor is not inside the tail block. This is the capacity
    /// the tiny body tier may use without growing the chain.
    pub fn resident_capacity(&self) -> usize {
        if self.blocks.is_empty() {
            return 0;
        }
        let tail_start = (self.blocks.len() - 1) * BLOCK_SIZE;
        if self.pos >= tail_start {
            self.blocks.len() * BLOCK_SIZE - self.pos
        } else {
            0
        }
    }

    /// The longest contiguous run of unread bytes, without pulling from the
    /// source. Empty when everything buffered has been consumed.
    pub fn unread_chunk(&self) -> &[u8] {
        if self.pos < self.filled {
            let idx = self.pos / BLOCK_SIZE;
            let start = self.pos % BLOCK_SIZE;
            let in_block = (self.filled - idx * BLOCK_SIZE).min(BLOCK_SIZE);
            &self.blocks[idx][start..in_block]
        } else if self.scratch_pos < self.scratch_filled {
            &self.scratch.as_ref().expect("scratch cursor without scratch block")[self.scratch_pos..self.scratch_filled]
        } else {
            &[]
        }
    }

    /// Advances the cursor by `n` bytes; `n` must not exceed the length of
    /// the current [`unread_chunk`](Self::unread_chunk).
    pub fn advance(&mut self, n: usize) {
        if self.pos < self.filled {
            debug_assert!(n <= self.unread_chunk().len());
            self.pos += n;
        } else {
            debug_assert!(self.scratch_pos + n <= self.scratch_filled);
            self.scratch_pos += n;
        }
    }

    pub(crate) fn rewind(&mut self, n: usize) {
        if self.pos == self.filled && self.scratch_pos >= n {
            self.scratch_pos -= n;
        } else {
            debug_assert!(self.pos >= n);
            self.pos -= n;
        }
    }

    /// Pulls at least one more byte into the active block.
    ///
    /// Fails with [`ParseError::EndOfInput`] only when not a single byte of
    /// the current message has been obtained yet; any later end of stream
    /// is a truncation and fails with [`ParseError::UnexpectedEof`].
    pub async fn fill_some(&mut self) -> Result<(), ParseError> {
        // Prefetched bytes are the very first block of a new message; they
        // bypass the source entirely.
        if self.blocks.is_empty() {
            if let Some(Prefetch { mut block, offset, len }) = self.prefetch.take() {
                block.copy_within(offset..offset + len, 0);
                self.blocks.push(block);
                self.filled = len;
                self.pulled += len;
                trace!(len, "consumed prefetched bytes");
                return Ok(());
            }
        }

        if self.streaming && self.pos == self.filled {
            if self.scratch.is_none() {
                self.scratch = Some(self.pool.checkout());
            }
            if self.scratch_pos == self.scratch_filled {
                // fully consumed, recycle in place
                self.scratch_pos = 0;
                self.scratch_filled = 0;
            }
            let block = self.scratch.as_mut().expect("scratch block just ensured");
            let n = self.source.read(&mut block[self.scratch_filled..]).await?;
            if n == 0 {
                return Err(ParseError::UnexpectedEof);
            }
            self.scratch_filled += n;
            self.pulled += n;
            return Ok(());
        }

        if self.blocks.is_empty() || self.filled == self.blocks.len() * BLOCK_SIZE {
            self.blocks.push(self.pool.checkout());
        }
        let tail_start = (self.blocks.len() - 1) * BLOCK_SIZE;
        let tail_fill = self.filled - tail_start;
        let block = self.blocks.last_mut().expect("tail block just ensured");
        let n = self.source.read(&mut block[tail_fill..]).await?;
        if n == 0 {
            return Err(if self.pulled == 0 { ParseError::EndOfInput } else { ParseError::UnexpectedEof });
        }
        self.filled += n;
        self.pulled += n;
        Ok(())
    }

    /// Ensures at least `n` unread bytes are resident in the chain.
    /// Retain mode only.
    pub async fn fill_exact(&mut self, n: usize) -> Result<(), ParseError> {
        debug_assert!(!self.streaming);
        while self.filled - self.pos < n {
            self.fill_some().await?;
        }
        Ok(())
    }

    /// Reads the next byte, pulling from the source as needed.
    pub async fn next_byte(&mut self) -> Result<u8, ParseError> {
        if self.unread_is_empty() {
            self.fill_some().await?;
        }
        let b = self.unread_chunk()[0];
        self.advance(1);
        Ok(b)
    }

    /// Scans forward to the next CRLF and consumes it. Returns `true` when
    /// the line was empty. A bare CR not followed by LF is ordinary data.
    pub async fn skip_to_crlf(&mut self) -> Result<bool, ParseError> {
        let mut seen = 0usize;
        loop {
            let b = self.next_byte().await?;
            if b == CR {
                let b2 = self.next_byte().await?;
                if b2 == LF {
                    return Ok(seen == 0);
                }
                self.rewind(1);
            }
            seen += 1;
        }
    }

    /// Collects ASCII bytes into `buf` until `terminator` or CRLF.
    ///
    /// Returns `true` when the scan ended at CRLF rather than at the
    /// terminator. With `decapitalize`, `A..Z` are folded to lowercase as
    /// each byte is appended, so the caller can compare case-insensitively
    /// without a second pass.
    pub async fn read_ascii_to(&mut self, terminator: u8, buf: &mut Vec<u8>, decapitalize: bool) -> Result<bool, ParseError> {
        loop {
            let b = self.next_byte().await?;
            if b == terminator {
                return Ok(false);
            }
            if b == CR {
                let b2 = self.next_byte().await?;
                if b2 == LF {
                    return Ok(true);
                }
                self.rewind(1);
                buf.push(CR);
                continue;
            }
            buf.push(if decapitalize { b.to_ascii_lowercase() } else { b });
        }
    }

    /// Collects one raw line into `buf`, including its terminating CRLF.
    pub async fn read_raw_line(&mut self, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        loop {
            let b = self.next_byte().await?;
            buf.push(b);
            if b == CR {
                let b2 = self.next_byte().await?;
                if b2 == LF {
                    buf.push(LF);
                    return Ok(());
                }
                self.rewind(1);
            }
        }
    }

    /// Reads exactly `buf.len()` bytes straight from the source, bypassing
    /// the block chain. Callers must have drained all resident bytes first.
    pub async fn read_exact_from_source(&mut self, buf: &mut [u8]) -> Result<(), ParseError> {
        debug_assert!(self.unread_is_empty());
        self.source.read_exact(buf).await.map_err(|e| {
            if e.kind() == ErrorKind::UnexpectedEof {
                ParseError::UnexpectedEof
            } else {
                ParseError::from(e)
            }
        })?;
        self.pulled += buf.len();
        Ok(())
    }

    /// Contiguous retained bytes starting at absolute offset `pos`, capped
    /// at `end` and at the containing block's boundary.
    pub fn chunk_at(&self, pos: usize, end: usize) -> &[u8] {
        debug_assert!(pos < end && end <= self.filled);
        let idx = pos / BLOCK_SIZE;
        let start = pos % BLOCK_SIZE;
        let cap = ((idx + 1) * BLOCK_SIZE).min(end) - idx * BLOCK_SIZE;
        &self.blocks[idx][start..cap]
    }

    /// Hands the scanner externally-sourced prefetched bytes. Empty hand-offs
    /// are ignored.
    pub fn set_prefetched(&mut self, prefetch: Prefetch) {
        debug_assert!(self.prefetch.is_none(), "prefetch hand-off must not overlap");
        if !prefetch.is_empty() {
            self.prefetch = Some(prefetch);
        }
    }

    #[cfg(test)]
    pub(crate) fn has_prefetch(&self) -> bool {
        self.prefetch.is_some()
    }

    /// Releases all blocks and prepares for the next message. Unconsumed
    /// bytes beyond the cursor are captured as the prefetch hand-off for
    /// that message instead of being discarded.
    pub fn reset(&mut self) {
        if self.pos < self.filled {
            let tail_start = (self.blocks.len() - 1) * BLOCK_SIZE;
            debug_assert!(self.pos >= tail_start, "unread leftover must sit in the tail block");
            debug_assert!(self.prefetch.is_none());
            let block = self.blocks.pop().expect("leftover implies a tail block");
            let offset = self.pos - tail_start;
            let len = self.filled - self.pos;
            trace!(len, "captured prefetch from header chain");
            self.prefetch = Some(Prefetch::new(block, offset, len));
        } else if self.scratch_pos < self.scratch_filled {
            debug_assert!(self.prefetch.is_none());
            let block = self.scratch.take().expect("scratch leftover implies a scratch block");
            let len = self.scratch_filled - self.scratch_pos;
            trace!(len, "captured prefetch from scratch block");
            self.prefetch = Some(Prefetch::new(block, self.scratch_pos, len));
        }

        self.blocks.clear();
        self.scratch = None;
        self.filled = 0;
        self.pos = 0;
        self.scratch_filled = 0;
        self.scratch_pos = 0;
        self.streaming = false;
        self.pulled = 0;
    }

    /// Swaps the byte source. Any pending prefetch and buffered bytes are
    /// discarded; they must never be replayed against the new source.
    pub fn reconnect_input(&mut self, source: R) {
        debug!("input reconnected, discarding buffered bytes and prefetch");
        self.source = source;
        self.prefetch = None;
        self.blocks.clear();
        self.scratch = None;
        self.filled = 0;
        self.pos = 0;
        self.scratch_filled = 0;
        self.scratch_pos = 0;
        self.streaming = false;
        self.pulled = 0;
    }

    /// Dismantles the scanner, returning the source and every byte that was
    /// buffered but not consumed (chain leftovers, scratch leftovers, then
    /// any pending prefetch, in stream order).
    pub fn into_parts(mut self) -> (R, Vec<u8>) {
        let mut leftover = Vec::with_capacity(self.resident_len());
        while !self.unread_chunk().is_empty() {
            let n = {
                let chunk = self.unread_chunk();
                leftover.extend_from_slice(chunk);
                chunk.len()
            };
            self.advance(n);
        }
        if let Some(prefetch) = self.prefetch.take() {
            leftover.extend_from_slice(prefetch.as_slice());
        }
        (self.source, leftover)
    }
}
