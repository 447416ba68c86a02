//! Bidirectional byte pump between two streams.
//!
//! One shared `copy_half` drives each direction; the pump finishes when
//! both directions have seen EOF or an error. Byte counts are returned so
//! handlers can account traffic on teardown.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Relay buffer size per direction (32KB)
pub const PIPE_BUFFER_SIZE: usize = 32 * 1024;

/// Pump bytes both ways until EOF/error on both directions.
///
/// Returns (client→upstream, upstream→client) byte totals.
pub async fn pipe<A, B>(a: A, b: B) -> (u64, u64)
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    tokio::join!(copy_half(a_read, b_write), copy_half(b_read, a_write))
}

/// Drain one direction, propagating the writer's shutdown at the end so the
/// far side observes EOF. Errors end the direction quietly; the opposite
/// direction keeps running until it ends on its own.
async fn copy_half<R, W>(mut from: R, mut to: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut moved: u64 = 0;

    while let Ok(n @ 1..) = from.read(&mut buf).await {
        let delivered = async {
            to.write_all(&buf[..n]).await?;
            to.flush().await
        };
        if delivered.await.is_err() {
            break;
        }
        moved += n as u64;
    }

    let _ = to.shutdown().await;
    moved
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pipe_byte_conservation() {
        let (client, client_far) = tokio::io::duplex(1024);
        let (upstream, upstream_far) = tokio::io::duplex(1024);

        // upstream echo
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(upstream_far);
            let mut buf = vec![0u8; 1024];
            loop {
                match r.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if w.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let pump = tokio::spawn(pipe(client_far, upstream));

        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let (mut cr, mut cw) = tokio::io::split(client);
        cw.write_all(&payload).await.unwrap();
        cw.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        cr.read_to_end(&mut echoed).await.unwrap();
        assert_eq!(echoed, payload);

        let (up, down) = pump.await.unwrap();
        assert_eq!(up, payload.len() as u64);
        assert_eq!(down, payload.len() as u64);
    }

    #[tokio::test]
    async fn test_half_close_propagates_eof() {
        let (near_a, far_a) = tokio::io::duplex(256);
        let (near_b, far_b) = tokio::io::duplex(256);
        let pump = tokio::spawn(pipe(far_a, near_b));

        let (mut ar, mut aw) = tokio::io::split(near_a);
        let (mut br, mut bw) = tokio::io::split(far_b);

        aw.write_all(b"one way").await.unwrap();
        aw.shutdown().await.unwrap();

        let mut got = Vec::new();
        br.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"one way");

        // the reverse direction still completes independently
        bw.write_all(b"back").await.unwrap();
        bw.shutdown().await.unwrap();
        let mut back = Vec::new();
        ar.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"back");

        let (up, down) = pump.await.unwrap();
        assert_eq!((up, down), (7, 4));
    }
}
