//! Body capture, storage tiers and chunked streaming.
//!
//! [`BodyBuffer`] consumes body bytes exclusively through the attached
//! [`HeaderBuffer`], so bytes incidentally pre-read into the header block
//! chain are reused rather than re-fetched. Storage is tiered by size:
//!
//! - *tiny* — the body fits in the unused tail of the last header block and
//!   stays resident in the chain, referenced by `(offset, len)`;
//! - *small* — at most one pooled block;
//! - *medium* — up to [`MEDIUM_BODY_LIMIT`], held in a growable buffer;
//! - *large* — spooled to a delete-on-close temporary file;
//! - *chunked* — length unknown up front; the raw chunked framing is
//!   spooled byte-for-byte while chunk boundaries are parsed, flushing
//!   whenever the active block fills or a chunk boundary is reached.
//!
//! [`redirect_body`](BodyBuffer::redirect_body) streams a body straight to
//! a sink without storing it, for pass-through messages.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::buffer::block::{Block, BlockPool, BLOCK_SIZE};
use crate::buffer::header::HeaderBuffer;
use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, SendError};

/// Largest body kept fully in memory; anything bigger is spooled to disk.
pub const MEDIUM_BODY_LIMIT: u64 = 1024 * 1024;

/// Delete-on-close temporary file buffering a spooled body.
struct Spool {
    file: tokio::fs::File,
    len: u64,
}

impl Spool {
    fn create() -> std::io::Result<Self> {
        let file = tempfile::tempfile()?;
        Ok(Self { file: tokio::fs::File::from_std(file), len: 0 })
    }

    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.file.write_all(bytes).await?;
        self.len += bytes.len() as u64;
        Ok(())
    }

    /// Copies the spooled bytes to the sink from the beginning; replayable.
    async fn replay<W>(&mut self, sink: &mut W) -> std::io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.file.flush().await?;
        self.file.seek(std::io::SeekFrom::Start(0)).await?;
        let copied = tokio::io::copy(&mut self.file, sink).await?;
        debug_assert_eq!(copied, self.len);
        Ok(())
    }
}

impl AsyncWrite for Spool {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = &mut *self;
        let written = std::task::ready!(std::pin::Pin::new(&mut this.file).poll_write(cx, buf))?;
        this.len += written as u64;
        std::task::Poll::Ready(Ok(written))
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.file).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.file).poll_shutdown(cx)
    }
}

enum BodyStore {
    Empty,
    Tiny { offset: usize, len: usize },
    Small { block: Block, len: usize },
    Medium { bytes: BytesMut },
    Large { spool: Spool },
    Chunked { spool: Spool },
}

/// Per-message body storage; exactly one tier is active at a time.
pub struct BodyBuffer {
    store: BodyStore,
    pool: BlockPool,
}

impl std::fmt::Debug for BodyBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tier = match &self.store {
            BodyStore::Empty => "empty",
            BodyStore::Tiny { .. } => "tiny",
            BodyStore::Small { .. } => "small",
            BodyStore::Medium { .. } => "medium",
            BodyStore::Large { .. } => "large",
            BodyStore::Chunked { .. } => "chunked",
        };
        f.debug_struct("BodyBuffer").field("tier", &tier).finish()
    }
}

impl BodyBuffer {
    pub fn new(pool: BlockPool) -> Self {
        Self { store: BodyStore::Empty, pool }
    }

    /// Releases the active tier (blocks return to the pool, spool files
    /// close and delete themselves).
    pub fn reset(&mut self) {
        self.store = BodyStore::Empty;
    }

    /// Consumes and stores the message body described by `payload`,
    /// selecting the storage tier by size. Any short read before the body
    /// is complete is a decode error.
    pub async fn read_body<R>(&mut self, header: &mut HeaderBuffer<R>, payload: PayloadSize) -> Result<(), ParseError>
    where
        R: AsyncRead + Unpin,
    {
        self.store = BodyStore::Empty;
        match payload {
            PayloadSize::Empty | PayloadSize::Length(0) => Ok(()),
            PayloadSize::Length(n) => self.read_sized(header, n).await,
            PayloadSize::Chunked => self.read_chunked(header).await,
        }
    }

    async fn read_sized<R>(&mut self, header: &mut HeaderBuffer<R>, n: u64) -> Result<(), ParseError>
    where
        R: AsyncRead + Unpin,
    {
        if n <= header.resident_capacity() as u64 {
            let len = n as usize;
            header.fill_exact(len).await?;
            let offset = header.current_offset() as usize;
            header.advance(len);
            trace!(tier = "tiny", len, "body stored in header chain tail");
            self.store = BodyStore::Tiny { offset, len };
        } else if n <= BLOCK_SIZE as u64 {
            let len = n as usize;
            let mut block = self.pool.checkout();
            let resident = drain_resident(header, &mut block[..len]);
            if resident < len {
                header.read_exact_from_source(&mut block[resident..len]).await?;
            }
            trace!(tier = "small", len, "body stored in a pooled block");
            self.store = BodyStore::Small { block, len };
        } else if n <= MEDIUM_BODY_LIMIT {
            let len = n as usize;
            let mut bytes = BytesMut::zeroed(len);
            let resident = drain_resident(header, &mut bytes[..]);
            if resident < len {
                header.read_exact_from_source(&mut bytes[resident..]).await?;
            }
            trace!(tier = "medium", len, "body stored in memory");
            self.store = BodyStore::Medium { bytes };
        } else {
            let mut spool = Spool::create()?;
            let mut copied = copy_resident(header, &mut spool.file, n).await?;
            spool.len += copied;
            let mut scratch = self.pool.checkout();
            while copied < n {
                let take = (n - copied).min(BLOCK_SIZE as u64) as usize;
                header.read_exact_from_source(&mut scratch[..take]).await?;
                spool.write_all(&scratch[..take]).await?;
                copied += take as u64;
            }
            trace!(tier = "large", len = n, "body spooled to temporary file");
            self.store = BodyStore::Large { spool };
        }
        Ok(())
    }

    async fn read_chunked<R>(&mut self, header: &mut HeaderBuffer<R>) -> Result<(), ParseError>
    where
        R: AsyncRead + Unpin,
    {
        let mut spool = Spool::create()?;
        header.set_streaming(true);
        let result = stream_chunked(header, &mut spool).await;
        header.set_streaming(false);
        result?;
        trace!(len = spool.len, "chunked body spooled to temporary file");
        self.store = BodyStore::Chunked { spool };
        Ok(())
    }

    /// Emits the stored body. Replayable; a buffered request body can be
    /// written again for a repeated turn.
    pub async fn write_body<R, W>(&mut self, header: &HeaderBuffer<R>, sink: &mut W) -> Result<(), SendError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match &mut self.store {
            BodyStore::Empty => Ok(()),
            BodyStore::Tiny { offset, len } => header.write_range(sink, *offset, *offset + *len).await,
            BodyStore::Small { block, len } => Ok(sink.write_all(&block[..*len]).await?),
            BodyStore::Medium { bytes } => Ok(sink.write_all(bytes).await?),
            BodyStore::Large { spool } | BodyStore::Chunked { spool } => Ok(spool.replay(sink).await?),
        }
    }

    /// Streams the body described by `payload` straight from the attached
    /// buffer's source to the sink, without storing it.
    pub async fn redirect_body<R, W>(
        &mut self,
        header: &mut HeaderBuffer<R>,
        sink: &mut W,
        payload: PayloadSize,
    ) -> Result<(), ParseError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        match payload {
            PayloadSize::Empty | PayloadSize::Length(0) => Ok(()),
            PayloadSize::Length(n) => {
                let mut copied = copy_resident(header, sink, n).await?;
                let mut scratch = self.pool.checkout();
                while copied < n {
                    let take = (n - copied).min(BLOCK_SIZE as u64) as usize;
                    header.read_exact_from_source(&mut scratch[..take]).await?;
                    sink.write_all(&scratch[..take]).await?;
                    copied += take as u64;
                }
                Ok(())
            }
            PayloadSize::Chunked => {
                header.set_streaming(true);
                let result = stream_chunked(header, sink).await;
                header.set_streaming(false);
                result
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tier(&self) -> &'static str {
        match &self.store {
            BodyStore::Empty => "empty",
            BodyStore::Tiny { .. } => "tiny",
            BodyStore::Small { .. } => "small",
            BodyStore::Medium { .. } => "medium",
            BodyStore::Large { .. } => "large",
            BodyStore::Chunked { .. } => "chunked",
        }
    }
}

/// Streams up to `max` resident bytes to `sink`, returning how many were
/// available.
async fn copy_resident<R, W>(header: &mut HeaderBuffer<R>, sink: &mut W, max: u64) -> Result<u64, ParseError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    loop {
        let take = {
            let chunk = header.unread_chunk();
            if chunk.is_empty() || copied == max {
                break;
            }
            let take = (chunk.len() as u64).min(max - copied) as usize;
            sink.write_all(&chunk[..take]).await?;
            take
        };
        header.advance(take);
        copied += take as u64;
    }
    Ok(copied)
}

/// Copies resident bytes into `dst`, returning how many were available.
fn drain_resident<R>(header: &mut HeaderBuffer<R>, dst: &mut [u8]) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut copied = 0;
    while copied < dst.len() {
        let take = {
            let chunk = header.unread_chunk();
            if chunk.is_empty() {
                break;
            }
            let take = chunk.len().min(dst.len() - copied);
            dst[copied..copied + take].copy_from_slice(&chunk[..take]);
            take
        };
        header.advance(take);
        copied += take;
    }
    copied
}

/// Scans one chunked body from the buffer, echoing the raw framing
/// (size lines, data, trailers) byte-for-byte into `out`. Output is
/// flushed per contiguous block run and at every chunk boundary.
async fn stream_chunked<R, W>(header: &mut HeaderBuffer<R>, out: &mut W) -> Result<(), ParseError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        header.read_raw_line(&mut line).await?;
        let size = parse_chunk_size(&line)?;
        out.write_all(&line).await?;
        if size == 0 {
            break;
        }
        trace!(size, "streaming chunk");

        let mut remaining = size;
        while remaining > 0 {
            if header.unread_chunk().is_empty() {
                header.fill_some().await?;
            }
            let take = {
                let chunk = header.unread_chunk();
                let take = (chunk.len() as u64).min(remaining) as usize;
                out.write_all(&chunk[..take]).await?;
                take
            };
            header.advance(take);
            remaining -= take as u64;
        }

        let cr = header.next_byte().await?;
        let lf = header.next_byte().await?;
        ensure!(cr == b'\r' && lf == b'\n', ParseError::invalid_chunk("chunk data not terminated by CRLF"));
        out.write_all(b"\r\n").await?;
    }

    // trailer section runs to the terminating empty line
    loop {
        line.clear();
        header.read_raw_line(&mut line).await?;
        out.write_all(&line).await?;
        if line == b"\r\n" {
            return Ok(());
        }
    }
}

/// Parses a chunk-size line (terminating CRLF included in `line`).
///
/// Hex digits in either case, optional linear whitespace and an optional
/// `;extension` suffix which is ignored. Redundant leading zeros are
/// accepted; digit count is unbounded short of u64 overflow.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let line = line.strip_suffix(b"\r\n").unwrap_or(line);
    let mut size: u64 = 0;
    let mut digits = 0usize;

    for &b in line {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            b';' | b' ' | b'\t' => {
                ensure!(digits > 0, ParseError::invalid_chunk("chunk size line has no digits"));
                return Ok(size);
            }
            other => {
                return Err(ParseError::invalid_chunk(format!("invalid byte {other:#04x} in chunk size")));
            }
        };
        size = size
            .checked_mul(16)
            .and_then(|s| s.checked_add(u64::from(digit)))
            .ok_or_else(|| ParseError::invalid_chunk("chunk size overflows u64"))?;
        digits += 1;
    }

    ensure!(digits > 0, ParseError::invalid_chunk("empty chunk size line"));
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn buffers(input: &[u8]) -> (HeaderBuffer<&[u8]>, BodyBuffer) {
        let pool = BlockPool::new();
        (HeaderBuffer::new(input, pool.clone()), BodyBuffer::new(pool))
    }

    async fn roundtrip(input: &[u8], payload: PayloadSize) -> (Vec<u8>, &'static str) {
        let (mut header, mut body) = buffers(input);
        body.read_body(&mut header, payload).await.unwrap();
        let tier = body.tier();
        let mut out = Cursor::new(Vec::new());
        body.write_body(&header, &mut out).await.unwrap();
        (out.into_inner(), tier)
    }

    #[test]
    fn chunk_size_parsing() {
        assert_eq!(parse_chunk_size(b"2f\r\n").unwrap(), 0x2F);
        assert_eq!(parse_chunk_size(b"2F\r\n").unwrap(), 0x2F);
        assert_eq!(parse_chunk_size(b"000\r\n").unwrap(), 0);
        assert_eq!(parse_chunk_size(b"8;name=value\r\n").unwrap(), 8);
        assert_eq!(parse_chunk_size(b"8  \r\n").unwrap(), 8);
        assert!(parse_chunk_size(b"xyz\r\n").is_err());
        assert!(parse_chunk_size(b"\r\n").is_err());
        assert!(parse_chunk_size(b";ext\r\n").is_err());
    }

    #[tokio::test]
    async fn small_tier_at_block_boundary() {
        let input = vec![b'a'; BLOCK_SIZE];
        let (out, tier) = roundtrip(&input, PayloadSize::Length(BLOCK_SIZE as u64)).await;
        assert_eq!(tier, "small");
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn medium_tier_one_past_block_boundary() {
        let input = vec![b'b'; BLOCK_SIZE + 1];
        let (out, tier) = roundtrip(&input, PayloadSize::Length(input.len() as u64)).await;
        assert_eq!(tier, "medium");
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn medium_tier_at_spool_threshold() {
        let input = vec![b'c'; MEDIUM_BODY_LIMIT as usize];
        let (out, tier) = roundtrip(&input, PayloadSize::Length(input.len() as u64)).await;
        assert_eq!(tier, "medium");
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn large_tier_one_past_spool_threshold() {
        let input = vec![b'd'; MEDIUM_BODY_LIMIT as usize + 1];
        let (out, tier) = roundtrip(&input, PayloadSize::Length(input.len() as u64)).await;
        assert_eq!(tier, "large");
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn short_read_is_a_decode_error() {
        let (mut header, mut body) = buffers(b"only5");
        let err = body.read_body(&mut header, PayloadSize::Length(10)).await.unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof));
    }

    #[tokio::test]
    async fn chunked_round_trip_preserves_framing() {
        let mut input = Vec::new();
        input.extend_from_slice(b"2f\r\n");
        input.extend_from_slice(&[b'x'; 0x2F]);
        input.extend_from_slice(b"\r\n8\r\nabcdefgh\r\n0\r\n\r\n");

        let (out, tier) = roundtrip(&input, PayloadSize::Chunked).await;
        assert_eq!(tier, "chunked");
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn chunked_round_trip_with_trailers() {
        let mut input = Vec::new();
        input.extend_from_slice(b"2F\r\n");
        input.extend_from_slice(&[b'y'; 0x2F]);
        input.extend_from_slice(b"\r\n8\r\n01234567\r\n0\r\nExpires: never\r\nVia: test\r\n\r\n");

        let (out, _) = roundtrip(&input, PayloadSize::Chunked).await;
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn chunked_body_larger_than_memory_blocks() {
        let data = vec![b'z'; BLOCK_SIZE * 4 + 17];
        let mut input = Vec::new();
        input.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        input.extend_from_slice(&data);
        input.extend_from_slice(b"\r\n0\r\n\r\n");

        let (out, _) = roundtrip(&input, PayloadSize::Chunked).await;
        assert_eq!(out, input);
    }

    #[tokio::test]
    async fn chunk_without_trailing_crlf_is_rejected() {
        let (mut header, mut body) = buffers(b"5\r\nhelloXX0\r\n\r\n");
        let err = body.read_body(&mut header, PayloadSize::Chunked).await.unwrap_err();
        assert!(matches!(err, ParseError::InvalidChunk { .. }));
    }

    #[tokio::test]
    async fn truncated_chunk_is_a_decode_error() {
        let (mut header, mut body) = buffers(b"10\r\nshort");
        let err = body.read_body(&mut header, PayloadSize::Chunked).await.unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEof));
    }

    #[tokio::test]
    async fn redirect_streams_without_storing() {
        let input = vec![b'r'; BLOCK_SIZE * 2 + 5];
        let (mut header, mut body) = buffers(&input);
        let mut out = Cursor::new(Vec::new());
        body.redirect_body(&mut header, &mut out, PayloadSize::Length(input.len() as u64)).await.unwrap();
        assert_eq!(out.get_ref().as_slice(), &input[..]);
        assert_eq!(body.tier(), "empty");
    }

    #[tokio::test]
    async fn redirect_chunked_preserves_framing() {
        let input = b"3\r\nabc\r\n0\r\n\r\n";
        let (mut header, mut body) = buffers(input);
        let mut out = Cursor::new(Vec::new());
        body.redirect_body(&mut header, &mut out, PayloadSize::Chunked).await.unwrap();
        assert_eq!(out.get_ref().as_slice(), input as &[u8]);
    }
}
