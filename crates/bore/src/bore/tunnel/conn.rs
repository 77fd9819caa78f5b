use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Anything the relay can pump bytes through in both directions: TCP sockets
/// in production, in-memory duplex pipes in tests.
pub trait AsyncStream: AsyncRead + AsyncWrite {}
impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + ?Sized {}

/// Control connection: buffered reads for delimited frames, unbuffered writes.
pub type BufConn<S> = BufReader<S>;

pub fn buffered<S: AsyncRead>(stream: S) -> BufConn<S> {
    BufReader::new(stream)
}

/// Hands the connection over to raw relaying.
///
/// Bytes the peer sent right behind its last control frame may already sit in
/// the read buffer; they are written to `dst` before the bare stream is
/// returned, so nothing is lost when the buffer is discarded.
pub async fn flush_buffered<S, W>(conn: BufConn<S>, dst: &mut W) -> std::io::Result<S>
where
    S: AsyncRead,
    W: AsyncWrite + Unpin + ?Sized,
{
    let pending = conn.buffer();
    if !pending.is_empty() {
        tracing::debug!(buffered = pending.len(), "conn: consume buffered bytes");
        dst.write_all(pending).await?;
    }
    Ok(conn.into_inner())
}
