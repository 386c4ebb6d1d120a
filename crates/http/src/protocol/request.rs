//! Request-side start line and field scanning.
//!
//! Beyond the framing fields every message shares, a request records the
//! upstream destination (from the request target, with the `Host` field as
//! a backstop) and the span of a `Proxy-Authorization` field line so the
//! credentials can be stripped or replaced before forwarding.

use http::{Method, Uri, Version};
use tokio::io::AsyncRead;
use tracing::trace;

use crate::buffer::header::HeaderBuffer;
use crate::protocol::{Message, MessageKind, ParseError, Span};

/// Destination authority a request resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl HostPort {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl std::fmt::Display for HostPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// An inbound request message.
pub type Request<R> = Message<R, RequestKind>;

/// Read-only view of the request facts a connection host decides on.
#[derive(Debug)]
pub struct RequestView<'a> {
    pub method: &'a Method,
    pub target: &'a [u8],
    pub target_span: Span,
    pub version: Version,
    pub host: Option<&'a HostPort>,
    pub host_span: Option<Span>,
    pub proxy_authorization: Option<Span>,
    pub end_of_fields: u32,
}

impl<R> Request<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn request(source: R, pool: crate::buffer::block::BlockPool) -> Self {
        Message::new(source, pool, RequestKind::default())
    }

    pub fn view(&self) -> RequestView<'_> {
        let kind = self.kind();
        RequestView {
            method: &kind.method,
            target: &kind.target,
            target_span: kind.target_span,
            version: kind.version,
            host: kind.host.as_ref(),
            host_span: kind.host_span,
            proxy_authorization: kind.proxy_authorization,
            end_of_fields: self.end_of_fields(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.kind().method == Method::CONNECT
    }
}

/// Parse results for a request start line and request-only fields.
#[derive(Debug, Default)]
pub struct RequestKind {
    method: Method,
    target: Vec<u8>,
    target_span: Span,
    version: Version,
    host: Option<HostPort>,
    host_from_target: bool,
    host_span: Option<Span>,
    proxy_authorization: Option<Span>,
}

impl RequestKind {
    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &[u8] {
        &self.target
    }

    pub fn target_span(&self) -> Span {
        self.target_span
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Destination derived from the target form, or from `Host` when the
    /// target does not carry one (origin form, unparseable absolute form).
    pub fn host(&self) -> Option<&HostPort> {
        self.host.as_ref()
    }

    /// Span of the `Host` field value, when the field was present.
    pub fn host_span(&self) -> Option<Span> {
        self.host_span
    }

    /// Full field line of `Proxy-Authorization`, CRLF included, so a
    /// zero-write replacement deletes the credentials entirely.
    pub fn proxy_authorization(&self) -> Option<Span> {
        self.proxy_authorization
    }
}

impl MessageKind for RequestKind {
    fn reset(&mut self) {
        *self = Self::default();
    }

    async fn scan_start_line<R>(&mut self, header: &mut HeaderBuffer<R>) -> Result<(), ParseError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (method, _, at_eol) = header.read_token(false, false).await?;
        if at_eol || method.is_empty() {
            return Err(ParseError::invalid_start_line("missing request target"));
        }
        self.method = Method::from_bytes(&method)
            .map_err(|_| ParseError::invalid_start_line(format!("bad method {:?}", String::from_utf8_lossy(&method))))?;

        let (target, span, at_eol) = header.read_token(false, false).await?;
        if at_eol || target.is_empty() {
            return Err(ParseError::invalid_start_line("missing http version"));
        }
        self.target_span = span;
        (self.host, self.host_from_target) = match destination_of(&target) {
            Some(host) => (Some(host), true),
            None => (None, false),
        };
        self.target = target;

        let (version, _, _) = header.read_token(true, true).await?;
        self.version = parse_version(&version)?;
        trace!(method = %self.method, target = %String::from_utf8_lossy(&self.target), "request line decoded");
        Ok(())
    }

    fn wants_field(&self, first: u8) -> bool {
        first == b'h' || first == b'p'
    }

    async fn scan_field<R>(
        &mut self,
        header: &mut HeaderBuffer<R>,
        name: &[u8],
        field_start: u32,
    ) -> Result<bool, ParseError>
    where
        R: AsyncRead + Unpin + Send,
    {
        match name {
            b"host" => {
                let (value, span) = header.read_field_value().await?;
                self.host_span = Some(span);
                // the target form wins; Host only fills the gap
                if !self.host_from_target {
                    self.host = host_field(&value);
                }
                Ok(true)
            }
            b"proxy-authorization" => {
                header.read_field_value().await?;
                self.proxy_authorization = Some(Span::new(field_start, header.current_offset()));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

pub(crate) fn parse_version(token: &[u8]) -> Result<Version, ParseError> {
    match token {
        b"http/1.1" => Ok(Version::HTTP_11),
        b"http/1.0" => Ok(Version::HTTP_10),
        other => Err(ParseError::invalid_version(String::from_utf8_lossy(other))),
    }
}

/// Extracts the destination from a request target, by form:
///
/// - origin (`/path`) and asterisk forms carry none;
/// - absolute form takes the URI authority, defaulting the port from the
///   scheme; an unparseable URI yields none rather than failing the
///   message;
/// - anything else is treated as authority form (`CONNECT host:port`),
///   defaulting to 443.
fn destination_of(target: &[u8]) -> Option<HostPort> {
    if target.starts_with(b"/") || target.starts_with(b"*") {
        return None;
    }
    let text = std::str::from_utf8(target).ok()?;
    if text.contains("://") {
        let uri: Uri = text.parse().ok()?;
        let authority = uri.authority()?;
        let port = authority.port_u16().or_else(|| match uri.scheme_str() {
            Some("http") => Some(80),
            Some("https") => Some(443),
            _ => None,
        })?;
        return Some(HostPort::new(authority.host(), port));
    }
    split_host_port(text, 443)
}

/// Parses a `Host` field value, defaulting to port 80.
fn host_field(value: &[u8]) -> Option<HostPort> {
    let text = std::str::from_utf8(value).ok()?;
    split_host_port(text.trim_ascii(), 80)
}

fn split_host_port(text: &str, default_port: u16) -> Option<HostPort> {
    if text.is_empty() {
        return None;
    }
    match text.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse().ok()?;
            Some(HostPort::new(host, port))
        }
        Some(_) => None,
        None => Some(HostPort::new(text, default_port)),
    }
}
