//! Block-pooled buffering: the byte scanner, header-region retention and
//! tiered body storage.

pub mod block;
pub mod body;
pub mod header;
pub mod scanner;

pub use block::{Block, BlockPool, BLOCK_SIZE};
pub use body::{BodyBuffer, MEDIUM_BODY_LIMIT};
pub use header::HeaderBuffer;
pub use scanner::{ByteScanner, Prefetch};
