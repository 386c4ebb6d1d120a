use std::io;
use thiserror::Error;

/// Top-level error for a connection turn, classified by direction:
/// decode failures on the client side surface as bad request, decode
/// failures on the upstream side as bad gateway.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("bad request: {source}")]
    BadRequest { source: ParseError },

    #[error("bad gateway: {source}")]
    BadGateway { source: ParseError },

    #[error("send error: {source}")]
    Send {
        #[from]
        source: SendError,
    },
}

impl HttpError {
    pub fn bad_request(source: ParseError) -> Self {
        Self::BadRequest { source }
    }

    pub fn bad_gateway(source: ParseError) -> Self {
        Self::BadGateway { source }
    }

    /// True when the underlying transport itself failed; such errors tear
    /// the connection down instead of being downgraded to an error reply.
    pub fn is_transport(&self) -> bool {
        match self {
            Self::BadRequest { source } | Self::BadGateway { source } => source.is_transport(),
            Self::Send { .. } => true,
        }
    }
}

/// Errors raised while reading and decoding a message.
///
/// [`ParseError::EndOfInput`] is special: it is only produced when the
/// stream ends before a single byte of a message was obtained, and callers
/// translate it to a clean "no more messages" outcome rather than a
/// failure.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("end of input before a message started")]
    EndOfInput,

    #[error("unexpected end of input inside a message")]
    UnexpectedEof,

    #[error("invalid start line: {reason}")]
    InvalidStartLine { reason: String },

    #[error("invalid http version: {reason}")]
    InvalidVersion { reason: String },

    #[error("invalid status code: {reason}")]
    InvalidStatusCode { reason: String },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid chunk framing: {reason}")]
    InvalidChunk { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn invalid_start_line<S: ToString>(reason: S) -> Self {
        Self::InvalidStartLine { reason: reason.to_string() }
    }

    pub fn invalid_version<S: ToString>(reason: S) -> Self {
        Self::InvalidVersion { reason: reason.to_string() }
    }

    pub fn invalid_status_code<S: ToString>(reason: S) -> Self {
        Self::InvalidStatusCode { reason: reason.to_string() }
    }

    pub fn invalid_header<S: ToString>(reason: S) -> Self {
        Self::InvalidHeader { reason: reason.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(reason: S) -> Self {
        Self::InvalidContentLength { reason: reason.to_string() }
    }

    pub fn invalid_chunk<S: ToString>(reason: S) -> Self {
        Self::InvalidChunk { reason: reason.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Io { .. })
    }
}

/// Errors raised while writing a message to a sink.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid message state: {reason}")]
    InvalidState { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_state<S: ToString>(reason: S) -> Self {
        Self::InvalidState { reason: reason.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// A modification span overlapping one already registered. Always a
/// programming error in the caller, never recoverable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("modification span [{start}, {end}) overlaps an existing span")]
pub struct OverlapError {
    pub start: u32,
    pub end: u32,
}
