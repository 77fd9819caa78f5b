use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bore::telemetry;
use crate::bore::tunnel::conn::AsyncStream;

const COPY_BUF_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copies bytes in both directions until each source reaches end of stream
/// or fails, and returns once both directions are done.
///
/// When one side finishes, the opposite write half is shut down so the peer
/// sees EOF; neither endpoint is dropped here, closing stays with the caller.
pub async fn relay<A, B>(a: &mut A, b: &mut B) -> RelayStats
where
    A: AsyncStream + Unpin,
    B: AsyncStream + Unpin,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let (a_to_b, b_to_a) = tokio::join!(
        pipe(&mut a_rd, &mut b_wr, "a->b"),
        pipe(&mut b_rd, &mut a_wr, "b->a"),
    );

    metrics::counter!(telemetry::RELAY_BYTES_TOTAL, "direction" => "a_to_b").increment(a_to_b);
    metrics::counter!(telemetry::RELAY_BYTES_TOTAL, "direction" => "b_to_a").increment(b_to_a);

    RelayStats { a_to_b, b_to_a }
}

/// Copies `r` into `w` and returns the bytes delivered, including those
/// delivered before a read or write error cut the direction short.
async fn pipe<R, W>(r: &mut R, w: &mut W, direction: &'static str) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_BYTES];
    let mut total = 0u64;
    loop {
        let n = match r.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                tracing::debug!(direction, copied = total, err = %err, "relay: read failed");
                break;
            }
        };
        if let Err(err) = w.write_all(&buf[..n]).await {
            tracing::debug!(direction, copied = total, err = %err, "relay: write failed");
            break;
        }
        total += n as u64;
    }
    let _ = w.shutdown().await;
    total
}
