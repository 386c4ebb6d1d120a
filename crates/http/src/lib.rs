//! The message-processing core of an asynchronous HTTP/1.1 forward proxy
//!
//! This crate parses request and response octet streams incrementally from a
//! socket-like source, buffers and optionally rewrites header fields and
//! bodies in place, and re-emits the (possibly modified) message to a sink,
//! without materializing a whole message as a single allocation when
//! avoidable. It is built on top of tokio.
//!
//! # Features
//!
//! - Incremental HTTP/1.1 parsing over chained fixed-size memory blocks
//! - Surgical header rewriting through span-targeted modification handlers
//! - Body storage tiered by size, from "already in the header buffer" up to
//!   delete-on-close spool files
//! - Chunked transfer-coding with byte-accurate incremental flushing
//! - Cross-message prefetch on persistent connections
//! - Turn-based request/response orchestration with authentication retry
//! - `CONNECT` upgrade to raw bidirectional tunneling
//!
//! # Example
//!
//! ```no_run
//! use relay_http::buffer::BlockPool;
//! use relay_http::connection::{Communication, ConnectionHost};
//! use relay_http::protocol::{HttpError, ModificationList, RequestView, ResponseView};
//! use tokio::net::TcpStream;
//! use tracing::error;
//!
//! /// A host that forwards every message unmodified.
//! struct Passthrough;
//!
//! impl ConnectionHost for Passthrough {
//!     async fn modifications(
//!         &mut self,
//!         _repeat_count: u32,
//!         _request: &RequestView<'_>,
//!         _response: Option<&ResponseView<'_>>,
//!     ) -> Option<ModificationList> {
//!         None
//!     }
//!
//!     fn report_error(&mut self, error: &HttpError) {
//!         error!(%error, "turn failed");
//!     }
//!
//!     fn upstream_is_proxy(&self) -> bool {
//!         false
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // in a real proxy the client stream comes from a listener's accept
//!     let client = TcpStream::connect("127.0.0.1:8080").await?;
//!     let server = TcpStream::connect("upstream.example:3128").await?;
//!     let (client_read, client_write) = client.into_split();
//!     let (server_read, server_write) = server.into_split();
//!
//!     let pool = BlockPool::new();
//!     let communication =
//!         Communication::new(client_read, client_write, server_read, server_write, Passthrough, pool);
//!     communication.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`buffer`]: block pool, byte scanner, header retention and tiered body
//!   storage
//! - [`protocol`]: the message state machine, span modifications and the
//!   request/response types
//! - [`connection`]: the per-connection turn loop and tunnel forwarding
//!
//! # Error Handling
//!
//! - [`protocol::HttpError`]: top-level, direction-classified turn errors
//! - [`protocol::ParseError`]: message decode errors
//! - [`protocol::SendError`]: message emission errors
//!
//! # Limitations
//!
//! - HTTP/1.1 and 1.0 only
//! - Lenient by design: the parser accepts what real-world traffic sends
//!   rather than enforcing full RFC 7230 conformance
//! - No TLS termination; `CONNECT` traffic is tunneled opaquely

pub mod buffer;
pub mod connection;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
