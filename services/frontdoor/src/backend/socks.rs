//! Minimal SOCKS5 backend.
//!
//! Supports the "no authentication" method and the CONNECT command with
//! IPv4, domain and IPv6 destinations. BIND and UDP ASSOCIATE are answered
//! with "command not supported". The whitelist is checked before the
//! greeting is read.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};

use super::inbound::accept_inbound;
use super::{bind_listener, serve, BackendConfig, BackendDescriptor, BackendRole};
use crate::access::AccessControl;
use crate::error::StartupError;
use crate::relay::relay;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 reply codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl Reply {
    fn for_connect_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Reply::ConnectionRefused,
            io::ErrorKind::TimedOut | io::ErrorKind::HostUnreachable => Reply::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => Reply::NetworkUnreachable,
            _ => Reply::GeneralFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported SOCKS version {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("client offered no acceptable authentication method")]
    NoAcceptableMethod,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    UnsupportedAddressType(u8),

    #[error("invalid domain name")]
    InvalidDomain,

    #[error("connect to {target} failed: {source}")]
    Connect { target: TargetAddr, source: io::Error },
}

/// CONNECT destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

impl TargetAddr {
    async fn connect(&self) -> io::Result<TcpStream> {
        match self {
            TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
            TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
        }
    }
}

/// Read the method negotiation and select "no authentication".
pub async fn negotiate<S>(stream: &mut S) -> Result<(), SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(SocksError::UnsupportedVersion(head[0]));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        stream
            .write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
            .await?;
        return Err(SocksError::NoAcceptableMethod);
    }

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    Ok(())
}

/// Read a request and return its CONNECT destination.
///
/// Other commands and unknown address types are answered with the matching
/// failure reply before the error is returned.
pub async fn read_request<S>(stream: &mut S) -> Result<TargetAddr, SocksError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let [version, command, _reserved, atyp] = head;

    if version != SOCKS_VERSION {
        return Err(SocksError::UnsupportedVersion(version));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            TargetAddr::Ip(SocketAddr::from((ip, port)))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(octets), port)))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut buf = vec![0u8; len + 2];
            stream.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            buf.truncate(len);
            let host = String::from_utf8(buf).map_err(|_| SocksError::InvalidDomain)?;
            if host.is_empty() {
                return Err(SocksError::InvalidDomain);
            }
            TargetAddr::Domain(host, port)
        }
        other => {
            write_reply(stream, Reply::AddressTypeNotSupported, None).await?;
            return Err(SocksError::UnsupportedAddressType(other));
        }
    };

    if command != CMD_CONNECT {
        write_reply(stream, Reply::CommandNotSupported, None).await?;
        return Err(SocksError::UnsupportedCommand(command));
    }

    Ok(target)
}

/// Write a reply carrying `bound` (or 0.0.0.0:0).
pub async fn write_reply<S>(stream: &mut S, reply: Reply, bound: Option<SocketAddr>) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let bound = bound.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    let mut buf = Vec::with_capacity(22);
    buf.extend_from_slice(&[SOCKS_VERSION, reply as u8, 0x00]);
    match bound {
        SocketAddr::V4(addr) => {
            buf.push(ATYP_IPV4);
            buf.extend_from_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            buf.push(ATYP_IPV6);
            buf.extend_from_slice(&addr.ip().octets());
        }
    }
    buf.extend_from_slice(&bound.port().to_be_bytes());
    stream.write_all(&buf).await
}

/// SOCKS5 backend.
pub struct SocksBackend {
    config: BackendConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    access: AccessControl,
}

impl SocksBackend {
    pub async fn bind(config: BackendConfig, access: AccessControl) -> Result<Self, StartupError> {
        let (listener, local_addr) = bind_listener(BackendRole::Socks, config.bind_addr).await?;
        info!(bind_addr = %local_addr, "SOCKS backend bound");

        Ok(Self {
            config,
            listener,
            local_addr,
            access,
        })
    }

    /// Bind and spawn the accept loop.
    pub async fn start(
        config: BackendConfig,
        access: AccessControl,
    ) -> Result<BackendDescriptor, StartupError> {
        let backend = Arc::new(Self::bind(config, access).await?);
        let local_addr = backend.local_addr();
        let task = tokio::spawn(backend.run());
        Ok(BackendDescriptor::new(BackendRole::Socks, local_addr, task))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self: Arc<Self>) {
        let this = Arc::clone(&self);
        serve(&self.listener, BackendRole::Socks, move |stream, peer_addr| {
            let this = Arc::clone(&this);
            async move { this.handle_connection(stream, peer_addr).await }
        })
        .await;
    }

    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<(), SocksError> {
        let inbound = accept_inbound(stream, peer_addr, self.config.header_timeout).await?;
        let client_ip = inbound.client_ip();

        if !self.access.check(BackendRole::Socks, client_ip).is_allowed() {
            return Ok(());
        }

        let mut client = inbound.stream;
        negotiate(&mut client).await?;
        let target = read_request(&mut client).await?;
        debug!(client = %client_ip, target = %target, "SOCKS CONNECT");

        let connected = match timeout(self.config.connect_timeout, target.connect()).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        };
        let mut outbound = match connected {
            Ok(stream) => stream,
            Err(source) => {
                write_reply(&mut client, Reply::for_connect_error(&source), None).await?;
                return Err(SocksError::Connect { target, source });
            }
        };

        write_reply(&mut client, Reply::Succeeded, outbound.local_addr().ok()).await?;

        let stats = relay(&mut client, &mut outbound).await?;
        debug!(
            target = %target,
            bytes_up = stats.a_to_b,
            bytes_down = stats.b_to_a,
            "SOCKS relay closed"
        );
        Ok(())
    }
}
