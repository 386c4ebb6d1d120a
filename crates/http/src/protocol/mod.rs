//! Message decoding, span modifications and the request/response types.

pub mod error;
pub mod message;
pub mod request;
pub mod response;
pub mod span;

pub use error::{HttpError, OverlapError, ParseError, SendError};
pub use message::{HttpPhaseError, Message, MessageKind, PayloadSize, ReadOutcome, ReadingState};
pub use request::{HostPort, Request, RequestKind, RequestView};
pub use response::{Response, ResponseKind, ResponseView};
pub use span::{Handled, Modification, ModificationHandler, ModificationList, Modifier, Span};
