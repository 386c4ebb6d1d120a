//! Raw byte forwarding for tunneled connections.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::buffer::block::BlockPool;

/// Copies one tunnel direction until the source reaches end of stream.
///
/// `leftover` holds bytes that were buffered ahead of the protocol switch
/// and belong to the peer; they go out first so no byte is lost crossing
/// into tunnel mode. Each pooled-block read is flushed before the next so
/// interactive traffic is not held back.
pub(crate) async fn forward<R, W>(mut source: R, mut sink: W, leftover: Vec<u8>, pool: BlockPool) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    if !leftover.is_empty() {
        sink.write_all(&leftover).await?;
        sink.flush().await?;
        copied += leftover.len() as u64;
    }

    let mut block = pool.checkout();
    loop {
        let n = source.read(&mut block[..]).await?;
        if n == 0 {
            trace!(copied, "tunnel direction reached end of stream");
            return Ok(copied);
        }
        sink.write_all(&block[..n]).await?;
        sink.flush().await?;
        copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::block::BLOCK_SIZE;
    use std::io::Cursor;

    #[tokio::test]
    async fn forwards_leftover_before_the_stream() {
        let source: &[u8] = b" world";
        let mut sink = Cursor::new(Vec::new());
        let copied = forward(source, &mut sink, b"hello".to_vec(), BlockPool::new()).await.unwrap();
        assert_eq!(copied, 11);
        assert_eq!(sink.get_ref().as_slice(), b"hello world");
    }

    #[tokio::test]
    async fn forwards_more_than_one_block() {
        let payload = vec![b'x'; BLOCK_SIZE * 3 + 7];
        let mut sink = Cursor::new(Vec::new());
        let copied = forward(payload.as_slice(), &mut sink, Vec::new(), BlockPool::new()).await.unwrap();
        assert_eq!(copied, payload.len() as u64);
        assert_eq!(sink.get_ref().as_slice(), &payload[..]);
    }
}
