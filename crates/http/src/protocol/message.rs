//! The generic message state machine shared by requests and responses.
//!
//! [`Message`] owns a [`HeaderBuffer`] and a [`BodyBuffer`] and drives them
//! through one message at a time: scan the start line, walk the field
//! lines, capture the body per its framing, then replay everything to a
//! sink with span modifications applied. What differs between a request
//! and a response — the start line shape and the extra fields each side
//! cares about — is delegated to a [`MessageKind`].

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::buffer::block::BlockPool;
use crate::buffer::body::BodyBuffer;
use crate::buffer::header::HeaderBuffer;
use crate::buffer::scanner::Prefetch;
use crate::ensure;
use crate::protocol::{Modification, ModificationList, OverlapError, ParseError, SendError};

/// Body framing determined by the header fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadSize {
    /// No framing header present; the message has no body.
    #[default]
    Empty,
    /// `Content-Length` framing.
    Length(u64),
    /// `Transfer-Encoding` whose final coding is `chunked`.
    Chunked,
}

/// Where the state machine stands for the current message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadingState {
    /// Nothing read yet (or just reset).
    #[default]
    None,
    /// Header fully scanned, body not yet consumed.
    Header,
    /// Body consumed and stored; the message is replayable.
    Body,
    /// Body streamed through to a sink; only the header is replayable.
    BodyRedirected,
    /// A decode failure poisoned the message; reset before reuse.
    Error,
}

/// Result of attempting to read a message from the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The stream ended cleanly before any byte of a new message.
    CleanEnd,
    /// A message header was decoded.
    Message,
}

/// Start-line and field behavior that distinguishes message kinds.
///
/// `Message` itself scans the framing fields every message has
/// (`content-length`, `transfer-encoding`); a kind is consulted for the
/// rest through a cheap first-byte filter before the field name is even
/// read.
#[trait_variant::make(Send)]
pub trait MessageKind {
    /// Drops per-message parse results.
    fn reset(&mut self);

    /// Scans and records this kind's start line.
    async fn scan_start_line<R>(&mut self, header: &mut HeaderBuffer<R>) -> Result<(), ParseError>
    where
        R: AsyncRead + Unpin + Send;

    /// Whether a field line starting with `first` (decapitalized) might
    /// interest this kind.
    fn wants_field(&self, first: u8) -> bool;

    /// Offered a field this kind declared interest in. `field_start` is
    /// the offset of the first name byte. Returns `false` to decline, in
    /// which case the rest of the line is still unconsumed; returning
    /// `true` means the kind consumed the line through its CRLF.
    async fn scan_field<R>(
        &mut self,
        header: &mut HeaderBuffer<R>,
        name: &[u8],
        field_start: u32,
    ) -> Result<bool, ParseError>
    where
        R: AsyncRead + Unpin + Send;
}

/// One HTTP message on a byte stream, parameterized by direction.
pub struct Message<R, K> {
    header: HeaderBuffer<R>,
    body: BodyBuffer,
    kind: K,
    state: ReadingState,
    payload: PayloadSize,
    end_of_fields: u32,
    header_len: usize,
    modifications: ModificationList,
}

impl<R, K: std::fmt::Debug> std::fmt::Debug for Message<R, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("payload", &self.payload)
            .field("header_len", &self.header_len)
            .finish_non_exhaustive()
    }
}

impl<R, K> Message<R, K>
where
    R: AsyncRead + Unpin + Send,
    K: MessageKind,
{
    pub fn new(source: R, pool: BlockPool, kind: K) -> Self {
        Self {
            header: HeaderBuffer::new(source, pool.clone()),
            body: BodyBuffer::new(pool),
            kind,
            state: ReadingState::None,
            payload: PayloadSize::Empty,
            end_of_fields: 0,
            header_len: 0,
            modifications: ModificationList::new(),
        }
    }

    pub fn state(&self) -> ReadingState {
        self.state
    }

    pub fn payload(&self) -> PayloadSize {
        self.payload
    }

    /// Offset of the CR of the empty line terminating the field section;
    /// the canonical insertion point for new field lines.
    pub fn end_of_fields(&self) -> u32 {
        self.end_of_fields
    }

    /// Total header length in bytes, terminating empty line included.
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }

    /// Registers a span rewrite to apply when the header is next emitted.
    pub fn add_modification(&mut self, modification: Modification) -> Result<(), OverlapError> {
        self.modifications.insert(modification)
    }

    /// Replaces the registered modifications wholesale.
    pub fn set_modifications(&mut self, modifications: ModificationList) {
        self.modifications = modifications;
    }

    /// Reads and stores one complete message.
    pub async fn read(&mut self) -> Result<ReadOutcome, ParseError> {
        match self.read_header().await? {
            ReadOutcome::CleanEnd => Ok(ReadOutcome::CleanEnd),
            ReadOutcome::Message => {
                self.read_body().await?;
                Ok(ReadOutcome::Message)
            }
        }
    }

    /// Reads the start line and field section of the next message. Resets
    /// first if a previous message is still held.
    pub async fn read_header(&mut self) -> Result<ReadOutcome, ParseError> {
        if self.state != ReadingState::None {
            self.reset();
        }
        match self.scan_header().await {
            Ok(()) => {
                self.state = ReadingState::Header;
                trace!(payload = ?self.payload, header_len = self.header_len(), "header decoded");
                Ok(ReadOutcome::Message)
            }
            Err(ParseError::EndOfInput) => Ok(ReadOutcome::CleanEnd),
            Err(e) => {
                self.state = ReadingState::Error;
                Err(e)
            }
        }
    }

    /// Consumes and stores the body announced by the header.
    pub async fn read_body(&mut self) -> Result<(), ParseError> {
        ensure!(
            self.state == ReadingState::Header,
            ParseError::invalid_header("no decoded header to read a body for")
        );
        match self.body.read_body(&mut self.header, self.payload).await {
            Ok(()) => {
                self.state = ReadingState::Body;
                Ok(())
            }
            Err(e) => {
                self.state = ReadingState::Error;
                Err(e)
            }
        }
    }

    /// Emits the stored message: header (modifications applied) then body.
    /// Replayable while the message is held; a request retried against a
    /// reconnected upstream writes identical bytes again.
    pub async fn write<W>(&mut self, sink: &mut W) -> Result<(), SendError>
    where
        W: AsyncWrite + Unpin,
    {
        ensure!(
            matches!(self.state, ReadingState::Body | ReadingState::BodyRedirected),
            SendError::invalid_state(format!("cannot write a message in state {:?}", self.state))
        );
        let header_len = self.header_len();
        self.header.write_header(sink, header_len, &mut self.modifications).await?;
        self.body.write_body(&self.header, sink).await?;
        sink.flush().await?;
        Ok(())
    }

    /// Emits the header (modifications applied) and then streams the body
    /// straight from the source to the sink without storing it.
    pub async fn redirect<W>(&mut self, sink: &mut W) -> Result<(), HttpPhaseError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.state != ReadingState::Header {
            return Err(HttpPhaseError::Send(SendError::invalid_state(format!(
                "cannot redirect a message in state {:?}",
                self.state
            ))));
        }
        let header_len = self.header_len();
        self.header
            .write_header(sink, header_len, &mut self.modifications)
            .await
            .map_err(HttpPhaseError::Send)?;
        match self.body.redirect_body(&mut self.header, sink, self.payload).await {
            Ok(()) => {
                sink.flush().await.map_err(|e| HttpPhaseError::Send(e.into()))?;
                self.state = ReadingState::BodyRedirected;
                Ok(())
            }
            Err(e) => {
                self.state = ReadingState::Error;
                Err(HttpPhaseError::Parse(e))
            }
        }
    }

    /// Releases the current message; unread buffered bytes carry over as
    /// the next message's prefetch.
    pub fn reset(&mut self) {
        self.header.reset();
        self.body.reset();
        self.kind.reset();
        self.modifications.clear();
        self.state = ReadingState::None;
        self.payload = PayloadSize::Empty;
        self.end_of_fields = 0;
        self.header_len = 0;
    }

    /// Swaps the byte source, dropping buffered bytes and prefetch.
    pub fn reconnect_input(&mut self, source: R) {
        self.header.reconnect_input(source);
        self.body.reset();
        self.kind.reset();
        self.modifications.clear();
        self.state = ReadingState::None;
        self.payload = PayloadSize::Empty;
        self.end_of_fields = 0;
        self.header_len = 0;
    }

    /// Installs an externally captured prefetch block.
    pub fn set_prefetched(&mut self, prefetch: Prefetch) {
        self.header.set_prefetched(prefetch);
    }

    /// Dismantles the message, returning the source and any buffered but
    /// unconsumed bytes in stream order.
    pub fn into_parts(self) -> (R, Vec<u8>) {
        self.header.into_parts()
    }

    async fn scan_header(&mut self) -> Result<(), ParseError> {
        self.kind.scan_start_line(&mut self.header).await?;

        loop {
            let first = self.header.next_byte().await?;
            if first == b'\r' || first == b'\n' {
                self.end_of_fields = self.header.current_offset() - 1;
                if first == b'\r' {
                    let lf = self.header.next_byte().await?;
                    ensure!(lf == b'\n', ParseError::invalid_header("CR not followed by LF at end of fields"));
                }
                self.header_len = self.header.current_offset() as usize;
                return Ok(());
            }

            let field_start = self.header.current_offset() - 1;
            let first = first.to_ascii_lowercase();
            if first != b'c' && first != b't' && !self.kind.wants_field(first) {
                self.header.skip_field().await?;
                continue;
            }

            let Some(name) = self.header.read_field_name(first).await? else {
                continue;
            };
            match name.as_slice() {
                b"content-length" => {
                    let (value, _) = self.header.read_field_value().await?;
                    let text = std::str::from_utf8(&value)
                        .map_err(|_| ParseError::invalid_content_length("value is not ascii"))?;
                    let n = text
                        .trim_end()
                        .parse::<u64>()
                        .map_err(|e| ParseError::invalid_content_length(format!("{text:?}: {e}")))?;
                    self.payload = PayloadSize::Length(n);
                }
                b"transfer-encoding" => {
                    let (value, _) = self.header.read_field_value().await?;
                    if last_coding_is_chunked(&value) {
                        self.payload = PayloadSize::Chunked;
                    }
                }
                _ => {
                    if !self.kind.scan_field(&mut self.header, &name, field_start).await? {
                        self.header.skip_field().await?;
                    }
                }
            }
        }
    }
}

/// Error from an operation that both decodes from one stream and sends to
/// another, keeping the two failure directions distinct.
#[derive(Debug, thiserror::Error)]
pub enum HttpPhaseError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Whether the final `Transfer-Encoding` coding is `chunked`, per the
/// rule that only the last coding determines the framing.
fn last_coding_is_chunked(value: &[u8]) -> bool {
    value
        .split(|b| *b == b',')
        .filter(|token| !token.iter().all(u8::is_ascii_whitespace))
        .next_back()
        .is_some_and(|token| token.trim_ascii().eq_ignore_ascii_case(b"chunked"))
}
