//! The per-connection turn loop.
//!
//! A [`Communication`] owns both ends of one proxied connection: the
//! client's read/write halves and the upstream server's read/write halves.
//! It repeatedly reads a request, asks its [`ConnectionHost`] for header
//! modifications, forwards the request upstream, and relays the response
//! back — possibly repeating the request when the host answers a response
//! (say, a 407 challenge) with fresh modifications. A successful `CONNECT`
//! turn switches the connection into raw bidirectional forwarding.

use std::time::Duration;

use http::StatusCode;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{error, info, warn};

use crate::buffer::block::BlockPool;
use crate::connection::tunnel::forward;
use crate::protocol::{
    HttpError, HttpPhaseError, ModificationList, ParseError, ReadOutcome, Request, RequestView, Response, ResponseView,
    SendError,
};

/// Grace period granted to the remaining tunnel direction once the other
/// has finished.
const TUNNEL_GRACE: Duration = Duration::from_secs(5);

const BAD_REQUEST_REPLY: &[u8] = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";

/// Policy callbacks a connection consults while running turns. The host
/// decides what to rewrite and when to repeat a turn; the connection
/// supplies the mechanism.
#[trait_variant::make(Send)]
pub trait ConnectionHost {
    /// Asked once per request with `repeat_count == 0` and `response`
    /// absent, then again after every response header with the count
    /// incremented. With a response present, returning modifications
    /// means "repeat the request carrying these"; returning `None` means
    /// the response is final and should go to the client.
    async fn modifications(
        &mut self,
        repeat_count: u32,
        request: &RequestView<'_>,
        response: Option<&ResponseView<'_>>,
    ) -> Option<ModificationList>;

    /// Told about every turn or tunnel failure; the connection handles
    /// recovery itself.
    fn report_error(&mut self, error: &HttpError);

    /// Whether the upstream side is itself a proxy (so requests keep
    /// their absolute form) rather than the origin server.
    fn upstream_is_proxy(&self) -> bool;
}

/// One proxied connection: client duplex, upstream duplex, and the host
/// policy driving it.
pub struct Communication<CR, CW, SR, SW, H> {
    request: Request<CR>,
    client_write: CW,
    response: Response<SR>,
    server_write: SW,
    host: H,
    pool: BlockPool,
}

impl<CR, CW, SR, SW, H> std::fmt::Debug for Communication<CR, CW, SR, SW, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communication")
            .field("request", &self.request)
            .field("response", &self.response)
            .finish_non_exhaustive()
    }
}

impl<CR, CW, SR, SW, H> Communication<CR, CW, SR, SW, H>
where
    CR: AsyncRead + Unpin + Send,
    CW: AsyncWrite + Unpin + Send + 'static,
    SR: AsyncRead + Unpin + Send + 'static,
    SW: AsyncWrite + Unpin + Send,
    H: ConnectionHost,
{
    pub fn new(client_read: CR, client_write: CW, server_read: SR, server_write: SW, host: H, pool: BlockPool) -> Self {
        Self {
            request: Request::request(client_read, pool.clone()),
            client_write,
            response: Response::response(server_read, pool.clone()),
            server_write,
            host,
            pool,
        }
    }

    /// Runs turns until the client closes, the transport breaks, or the
    /// connection upgrades to a tunnel.
    pub async fn run(mut self) -> Result<(), HttpError> {
        info!(upstream_is_proxy = self.host.upstream_is_proxy(), "connection turn loop started");
        loop {
            match self.request.read().await {
                Ok(ReadOutcome::CleanEnd) => {
                    info!("client closed cleanly, ending turn loop");
                    return Ok(());
                }
                Ok(ReadOutcome::Message) => {}
                Err(e) => {
                    let error = HttpError::bad_request(e);
                    self.host.report_error(&error);
                    if error.is_transport() {
                        return Err(error);
                    }
                    // no reliable way to find the next message boundary
                    error!(%error, "malformed request, replying 400 and closing");
                    self.send_bad_request().await?;
                    return Err(error);
                }
            }

            if let Some(modifications) = self.host.modifications(0, &self.request.view(), None).await {
                self.request.set_modifications(modifications);
            }

            match self.relay_response().await {
                Ok(()) => {
                    if self.request.is_connect() && self.response.status() == StatusCode::OK {
                        return self.tunnel().await;
                    }
                }
                Err(error) => {
                    self.host.report_error(&error);
                    if error.is_transport() {
                        return Err(error);
                    }
                    // one malformed turn does not kill the connection
                    error!(%error, "turn failed, replying 400 and continuing");
                    self.send_bad_request().await?;
                }
            }
        }
    }

    /// Writes the request upstream and relays the final response to the
    /// client, repeating the request as long as the host keeps supplying
    /// modifications for interim responses.
    async fn relay_response(&mut self) -> Result<(), HttpError> {
        let mut repeat_count = 0u32;
        loop {
            self.request.write(&mut self.server_write).await.map_err(HttpError::from)?;

            match self.response.read_header().await {
                Ok(ReadOutcome::Message) => {}
                Ok(ReadOutcome::CleanEnd) => return Err(HttpError::bad_gateway(ParseError::UnexpectedEof)),
                Err(e) => return Err(HttpError::bad_gateway(e)),
            }
            repeat_count += 1;

            let modifications =
                self.host.modifications(repeat_count, &self.request.view(), Some(&self.response.view())).await;
            match modifications {
                Some(modifications) => {
                    info!(repeat_count, status = %self.response.status(), "repeating request per host decision");
                    // drain the interim response body before reusing the stream
                    self.response.read_body().await.map_err(HttpError::bad_gateway)?;
                    self.request.set_modifications(modifications);
                }
                None => {
                    return match self.response.redirect(&mut self.client_write).await {
                        Ok(()) => Ok(()),
                        Err(HttpPhaseError::Parse(e)) => Err(HttpError::bad_gateway(e)),
                        Err(HttpPhaseError::Send(e)) => Err(HttpError::from(e)),
                    };
                }
            }
        }
    }

    /// Hands both directions over to raw forwarding. The server-to-client
    /// direction runs as its own task; client-to-server runs inline. Once
    /// the inline direction finishes, the spawned one gets a bounded grace
    /// period before the tunnel is abandoned.
    async fn tunnel(self) -> Result<(), HttpError> {
        let Self { request, client_write, response, server_write, mut host, pool } = self;
        let (client_read, client_leftover) = request.into_parts();
        let (server_read, server_leftover) = response.into_parts();
        info!("switching connection to tunnel mode");

        let mut downstream = tokio::spawn(forward(server_read, client_write, server_leftover, pool.clone()));

        if let Err(e) = forward(client_read, server_write, client_leftover, pool).await {
            host.report_error(&HttpError::from(SendError::io(e)));
        }

        match tokio::time::timeout(TUNNEL_GRACE, &mut downstream).await {
            Ok(Ok(Ok(copied))) => info!(copied, "tunnel closed"),
            Ok(Ok(Err(e))) => host.report_error(&HttpError::from(SendError::io(e))),
            Ok(Err(e)) => error!(%e, "tunnel direction task failed"),
            Err(_) => {
                warn!("tunnel direction still busy after grace period, abandoning");
                downstream.abort();
            }
        }
        Ok(())
    }

    async fn send_bad_request(&mut self) -> Result<(), HttpError> {
        self.client_write.write_all(BAD_REQUEST_REPLY).await.map_err(SendError::io)?;
        self.client_write.flush().await.map_err(SendError::io)?;
        Ok(())
    }
}
