//! Backend-side connection intake.
//!
//! Every backend connection starts with a PROXY v2 header written by the
//! multiplexer. [`accept_inbound`] consumes that header to recover the real
//! client address. Bytes read past the header (or all bytes, when a client
//! connects to the backend directly without a header) are replayed to the
//! protocol handler through [`PrefixedStream`].

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::proxy_protocol::{self, ParseOutcome};

/// Upper bound for the PROXY v2 header plus whatever arrives with it.
const MAX_HEADER_READ: usize = 512;

/// A stream that yields `prefix` before reading from `inner`.
#[derive(Debug)]
pub struct PrefixedStream<S> {
    inner: S,
    prefix: Vec<u8>,
    pos: usize,
}

impl<S> PrefixedStream<S> {
    pub fn new(inner: S, prefix: Vec<u8>) -> Self {
        Self {
            inner,
            prefix,
            pos: 0,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = &self.prefix[self.pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            if self.pos == self.prefix.len() {
                self.prefix = Vec::new();
                self.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A backend connection with its resolved client address.
#[derive(Debug)]
pub struct Inbound {
    pub stream: PrefixedStream<TcpStream>,
    /// Client address as reported by the multiplexer, or the socket peer.
    pub client_addr: SocketAddr,
}

impl Inbound {
    /// Client IP with IPv4-mapped IPv6 addresses folded to IPv4.
    pub fn client_ip(&self) -> IpAddr {
        self.client_addr.ip().to_canonical()
    }
}

/// Read the optional PROXY v2 header from a freshly accepted connection.
pub async fn accept_inbound(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    header_timeout: Duration,
) -> io::Result<Inbound> {
    let mut buf = Vec::with_capacity(64);

    let outcome = timeout(header_timeout, async {
        let mut chunk = [0u8; 128];
        loop {
            match proxy_protocol::parse(&buf) {
                ParseOutcome::Incomplete if buf.len() < MAX_HEADER_READ => {}
                ParseOutcome::Incomplete => return Ok::<_, io::Error>(ParseOutcome::Invalid),
                outcome => return Ok(outcome),
            }

            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(ParseOutcome::Invalid);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "PROXY header timeout"))??;

    let (client_addr, prefix) = match outcome {
        ParseOutcome::Complete { header, len } => {
            let client_addr = header.map(|h| h.source).unwrap_or(peer_addr);
            (client_addr, buf.split_off(len))
        }
        _ => {
            debug!(peer_addr = %peer_addr, "No PROXY header, using socket peer address");
            (peer_addr, buf)
        }
    };

    Ok(Inbound {
        stream: PrefixedStream::new(stream, prefix),
        client_addr,
    })
}
