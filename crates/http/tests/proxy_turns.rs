//! Full connection turns through [`Communication`] over in-memory duplex
//! streams: passthrough, authentication retry, CONNECT tunneling and
//! malformed-upstream downgrade.

use http::StatusCode;
use relay_http::buffer::BlockPool;
use relay_http::connection::{Communication, ConnectionHost};
use relay_http::protocol::{
    Handled, HttpError, Modification, ModificationList, RequestView, ResponseView, Span,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Forwards everything unmodified.
#[derive(Default)]
struct Passthrough;

impl ConnectionHost for Passthrough {
    async fn modifications(
        &mut self,
        _repeat_count: u32,
        _request: &RequestView<'_>,
        _response: Option<&ResponseView<'_>>,
    ) -> Option<ModificationList> {
        None
    }

    fn report_error(&mut self, _error: &HttpError) {}

    fn upstream_is_proxy(&self) -> bool {
        true
    }
}

/// Answers a 407 challenge by repeating the request with credentials.
#[derive(Default)]
struct Authenticating {
    retried: bool,
}

impl ConnectionHost for Authenticating {
    async fn modifications(
        &mut self,
        repeat_count: u32,
        request: &RequestView<'_>,
        response: Option<&ResponseView<'_>>,
    ) -> Option<ModificationList> {
        let response = response?;
        if repeat_count == 1 && response.status == StatusCode::PROXY_AUTHENTICATION_REQUIRED && !self.retried {
            self.retried = true;
            let mut list = ModificationList::new();
            list.insert(Modification::new(
                Span::at(request.end_of_fields),
                Box::new(|m| {
                    m.write(b"Proxy-Authorization: Basic Zm9vOmJhcg==\r\n");
                    Handled::Replaced
                }),
            ))
            .expect("span is fresh");
            return Some(list);
        }
        None
    }

    fn report_error(&mut self, _error: &HttpError) {}

    fn upstream_is_proxy(&self) -> bool {
        true
    }
}

fn spawn_communication<H>(
    client: DuplexStream,
    server: DuplexStream,
    host: H,
) -> JoinHandle<Result<(), HttpError>>
where
    H: ConnectionHost + Send + 'static,
{
    let (client_read, client_write) = tokio::io::split(client);
    let (server_read, server_write) = tokio::io::split(server);
    let communication =
        Communication::new(client_read, client_write, server_read, server_write, host, BlockPool::new());
    tokio::spawn(communication.run())
}

async fn read_exactly(stream: &mut DuplexStream, n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    stream.read_exact(&mut buf).await.expect("peer closed early");
    buf
}

#[tokio::test]
async fn passthrough_get_turn() {
    init_logging();
    let (mut client, proxy_client) = tokio::io::duplex(4096);
    let (mut server, proxy_server) = tokio::io::duplex(4096);
    let proxy = spawn_communication(proxy_client, proxy_server, Passthrough::default());

    let request = b"GET http://www.example.org/ HTTP/1.1\r\nHost: www.example.org\r\n\r\n";
    let response = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello";

    let upstream = tokio::spawn(async move {
        assert_eq!(read_exactly(&mut server, request.len()).await, request);
        server.write_all(response).await.unwrap();
    });

    client.write_all(request).await.unwrap();
    assert_eq!(read_exactly(&mut client, response.len()).await, response);
    drop(client);

    upstream.await.unwrap();
    proxy.await.unwrap().unwrap();
}

#[tokio::test]
async fn pipelined_requests_share_one_connection() {
    init_logging();
    let (mut client, proxy_client) = tokio::io::duplex(4096);
    let (mut server, proxy_server) = tokio::io::duplex(4096);
    let proxy = spawn_communication(proxy_client, proxy_server, Passthrough::default());

    let first = b"GET /1 HTTP/1.1\r\nHost: a\r\n\r\n";
    let second = b"GET /2 HTTP/1.1\r\nHost: a\r\n\r\n";
    let reply_one = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\none";
    let reply_two = b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\ntwo";

    let upstream = tokio::spawn(async move {
        assert_eq!(read_exactly(&mut server, first.len()).await, first);
        server.write_all(reply_one).await.unwrap();
        assert_eq!(read_exactly(&mut server, second.len()).await, second);
        server.write_all(reply_two).await.unwrap();
    });

    // both requests land in the proxy's buffer before the first turn ends,
    // exercising the prefetch hand-off between turns
    let mut pipelined = first.to_vec();
    pipelined.extend_from_slice(second);
    client.write_all(&pipelined).await.unwrap();

    assert_eq!(read_exactly(&mut client, reply_one.len()).await, reply_one);
    assert_eq!(read_exactly(&mut client, reply_two.len()).await, reply_two);
    drop(client);

    upstream.await.unwrap();
    proxy.await.unwrap().unwrap();
}

#[tokio::test]
async fn proxy_auth_challenge_repeats_the_request() {
    init_logging();
    let (mut client, proxy_client) = tokio::io::duplex(4096);
    let (mut server, proxy_server) = tokio::io::duplex(4096);
    let proxy = spawn_communication(proxy_client, proxy_server, Authenticating::default());

    let request = b"GET http://www.example.org/ HTTP/1.1\r\nHost: www.example.org\r\n\r\n";
    let retried = b"GET http://www.example.org/ HTTP/1.1\r\nHost: www.example.org\r\nProxy-Authorization: Basic Zm9vOmJhcg==\r\n\r\n";
    let challenge =
        b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"relay\"\r\nContent-Length: 0\r\n\r\n";
    let granted = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\ndone!";

    let upstream = tokio::spawn(async move {
        assert_eq!(read_exactly(&mut server, request.len()).await, request);
        server.write_all(challenge).await.unwrap();
        // the repeated request carries credentials
        assert_eq!(read_exactly(&mut server, retried.len()).await, retried);
        server.write_all(granted).await.unwrap();
    });

    client.write_all(request).await.unwrap();
    // the client never sees the interim 407
    assert_eq!(read_exactly(&mut client, granted.len()).await, granted);
    drop(client);

    upstream.await.unwrap();
    proxy.await.unwrap().unwrap();
}

#[tokio::test]
async fn connect_switches_to_raw_tunneling() {
    init_logging();
    let (mut client, proxy_client) = tokio::io::duplex(4096);
    let (mut server, proxy_server) = tokio::io::duplex(4096);
    let proxy = spawn_communication(proxy_client, proxy_server, Passthrough::default());

    let request = b"CONNECT www.example.org:443 HTTP/1.1\r\nHost: www.example.org:443\r\n\r\n";
    let established = b"HTTP/1.1 200 OK\r\n\r\n";

    let upstream = tokio::spawn(async move {
        assert_eq!(read_exactly(&mut server, request.len()).await, request);
        server.write_all(established).await.unwrap();
        // not HTTP anymore: raw bytes flow both ways
        assert_eq!(read_exactly(&mut server, 5).await, b"hello");
        server.write_all(b"HELLO").await.unwrap();
    });

    client.write_all(request).await.unwrap();
    assert_eq!(read_exactly(&mut client, established.len()).await, established);

    client.write_all(b"hello").await.unwrap();
    assert_eq!(read_exactly(&mut client, 5).await, b"HELLO");
    drop(client);

    upstream.await.unwrap();
    proxy.await.unwrap().unwrap();
}

#[tokio::test]
async fn malformed_upstream_response_downgrades_to_400() {
    init_logging();
    let (mut client, proxy_client) = tokio::io::duplex(4096);
    let (mut server, proxy_server) = tokio::io::duplex(4096);
    let proxy = spawn_communication(proxy_client, proxy_server, Passthrough::default());

    let request = b"GET http://www.example.org/ HTTP/1.1\r\nHost: www.example.org\r\n\r\n";
    let reply = b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n";

    let upstream = tokio::spawn(async move {
        assert_eq!(read_exactly(&mut server, request.len()).await, request);
        server.write_all(b"WAT/9 maybe\r\n\r\n").await.unwrap();
    });

    client.write_all(request).await.unwrap();
    assert_eq!(read_exactly(&mut client, reply.len()).await, reply);
    drop(client);

    upstream.await.unwrap();
    // the connection survived the malformed turn and ended cleanly
    proxy.await.unwrap().unwrap();
}
