//! Bidirectional byte relay.
//!
//! Used by the multiplexer (client <-> backend) and by the SOCKS backend
//! (client <-> destination). Bytes are copied verbatim in both directions.
//! When one direction reaches EOF its write half is shut down and the other
//! direction keeps running until it reaches EOF too. An I/O error on either
//! leg ends the relay immediately.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUF_SIZE: usize = 16 * 1024;

/// Bytes moved by a finished relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from `a` to `b`.
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`.
    pub b_to_a: u64,
}

async fn pipe<R, W>(mut reader: R, mut writer: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        total += n as u64;
    }
    writer.shutdown().await?;
    Ok(total)
}

/// Relay bytes between `a` and `b` until both directions reach EOF or
/// either one fails.
pub async fn relay<A, B>(a: &mut A, b: &mut B) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (a_to_b, b_to_a) =
        tokio::try_join!(pipe(a_read, b_write), pipe(b_read, a_write))?;

    Ok(RelayStats { a_to_b, b_to_a })
}
