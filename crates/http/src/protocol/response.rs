//! Response-side status line and field scanning.

use http::{StatusCode, Version};
use tokio::io::AsyncRead;
use tracing::trace;

use crate::buffer::header::HeaderBuffer;
use crate::protocol::request::parse_version;
use crate::protocol::{Message, MessageKind, ParseError, Span};

/// An upstream response message.
pub type Response<R> = Message<R, ResponseKind>;

/// Read-only view of the response facts a connection host decides on.
#[derive(Debug)]
pub struct ResponseView<'a> {
    pub version: Version,
    pub status: StatusCode,
    pub reason: &'a [u8],
    pub proxy_authenticate: Option<(Span, &'a str)>,
    pub end_of_fields: u32,
}

impl<R> Response<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn response(source: R, pool: crate::buffer::block::BlockPool) -> Self {
        Message::new(source, pool, ResponseKind::default())
    }

    pub fn view(&self) -> ResponseView<'_> {
        let kind = self.kind();
        ResponseView {
            version: kind.version,
            status: kind.status,
            reason: &kind.reason,
            proxy_authenticate: kind.proxy_authenticate.as_ref().map(|(span, value)| (*span, value.as_str())),
            end_of_fields: self.end_of_fields(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind().status
    }
}

/// Parse results for a status line and response-only fields.
#[derive(Debug, Default)]
pub struct ResponseKind {
    version: Version,
    status: StatusCode,
    reason: Vec<u8>,
    proxy_authenticate: Option<(Span, String)>,
}

impl ResponseKind {
    pub fn version(&self) -> Version {
        self.version
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &[u8] {
        &self.reason
    }

    /// Full `Proxy-Authenticate` field line span (CRLF included) plus its
    /// value, kept so a host can read the challenge and strip the line
    /// before the response reaches the client.
    pub fn proxy_authenticate(&self) -> Option<(Span, &str)> {
        self.proxy_authenticate.as_ref().map(|(span, value)| (*span, value.as_str()))
    }
}

impl MessageKind for ResponseKind {
    fn reset(&mut self) {
        *self = Self::default();
    }

    async fn scan_start_line<R>(&mut self, header: &mut HeaderBuffer<R>) -> Result<(), ParseError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (version, _, at_eol) = header.read_token(true, false).await?;
        if at_eol || version.is_empty() {
            return Err(ParseError::invalid_start_line("missing status code"));
        }
        self.version = parse_version(&version)?;

        let (status, _, at_eol) = header.read_token(false, false).await?;
        self.status = StatusCode::from_bytes(&status)
            .map_err(|_| ParseError::invalid_status_code(String::from_utf8_lossy(&status)))?;

        // the reason phrase is optional and may itself contain spaces
        if !at_eol {
            let (reason, _, _) = header.read_token(false, true).await?;
            self.reason = reason;
        }
        trace!(status = %self.status, "status line decoded");
        Ok(())
    }

    fn wants_field(&self, first: u8) -> bool {
        first == b'p'
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
        if name != b"proxy-authenticate" {
            return Ok(false);
        }
        let (value, _) = header.read_field_value().await?;
        let span = Span::new(field_start, header.current_offset());
        let value = String::from_utf8_lossy(&value).into_owned();
        self.proxy_authenticate = Some((span, value));
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::block::BlockPool;
    use crate::protocol::{PayloadSize, ReadOutcome};

    async fn read_response(input: &[u8]) -> Response<&[u8]> {
        let mut response = Response::response(input, BlockPool::new());
        assert_eq!(response.read().await.unwrap(), ReadOutcome::Message);
        response
    }

    #[tokio::test]
    async fn status_line_with_reason() {
        let response = read_response(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n").await;
        let view = response.view();
        assert_eq!(view.status, StatusCode::NOT_FOUND);
        assert_eq!(view.version, Version::HTTP_11);
        assert_eq!(view.reason, b"Not Found");
        assert_eq!(response.payload(), PayloadSize::Length(0));
    }

    #[tokio::test]
    async fn status_line_without_reason() {
        let response = read_response(b"HTTP/1.1 200\r\n\r\n").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.view().reason.is_empty());
    }

    #[tokio::test]
    async fn proxy_authenticate_span_and_value() {
        let input = b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"proxy\"\r\nContent-Length: 0\r\n\r\n";
        let response = read_response(input).await;
        let (span, value) = response.view().proxy_authenticate.unwrap();
        assert_eq!(value, "Basic realm=\"proxy\"");
        assert_eq!(
            &input[span.start() as usize..span.end() as usize],
            b"Proxy-Authenticate: Basic realm=\"proxy\"\r\n"
        );
    }

    #[tokio::test]
    async fn chunked_response_body() {
        let response = read_response(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n").await;
        assert_eq!(response.payload(), PayloadSize::Chunked);
    }

    #[tokio::test]
    async fn bad_status_code_is_rejected() {
        let mut response = Response::response(b"HTTP/1.1 xyz OK\r\n\r\n" as &[u8], BlockPool::new());
        assert!(matches!(response.read().await.unwrap_err(), ParseError::InvalidStatusCode { .. }));
    }
}
