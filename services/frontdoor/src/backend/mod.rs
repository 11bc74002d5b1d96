//! Protocol backends behind the multiplexer.
//!
//! Each backend binds its own loopback listener, reports the bound address
//! to the startup coordinator, and then serves connections relayed by the
//! multiplexer. Every backend connection starts with a PROXY v2 header (see
//! [`inbound`]).

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

use crate::error::StartupError;
use crate::mux::classify::{self, Matcher};

pub mod admin;
pub mod http;
pub mod inbound;
pub mod socks;

pub use admin::{AdminBackend, AdminConfig};
pub use http::HttpBackend;
pub use socks::SocksBackend;

/// Default time a backend waits for the PROXY v2 header.
pub const DEFAULT_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Default connect timeout for outbound (destination) connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Listener settings shared by the SOCKS and HTTP backends.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Address to bind to; port 0 lets the OS pick.
    pub bind_addr: SocketAddr,
    /// How long to wait for the PROXY v2 header.
    pub header_timeout: Duration,
    /// Timeout for connecting to the client's destination.
    pub connect_timeout: Duration,
}

impl BackendConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Ephemeral loopback port.
    pub fn loopback() -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self::loopback()
    }
}

/// Bind a backend listener, returning it with its resolved address.
pub async fn bind_listener(
    role: BackendRole,
    addr: SocketAddr,
) -> Result<(TcpListener, SocketAddr), StartupError> {
    let bind_error = |source| StartupError::Bind { role, addr, source };
    let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
    let local_addr = listener.local_addr().map_err(bind_error)?;
    Ok((listener, local_addr))
}

/// Accept loop shared by all backends.
///
/// Every connection gets its own task and tracing span. Handler errors are
/// logged at debug and never stop the loop.
pub(crate) async fn serve<H, Fut, E>(listener: &TcpListener, role: BackendRole, handler: H)
where
    H: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: fmt::Display,
{
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                let connection = handler(stream, peer_addr);
                tokio::spawn(
                    async move {
                        if let Err(e) = connection.await {
                            debug!(error = %e, "Connection error");
                        }
                    }
                    .instrument(tracing::info_span!("backend", role = %role, peer = %peer_addr)),
                );
            }
            Err(e) => {
                error!(role = %role, error = %e, "Accept error");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// The protocol a backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendRole {
    Socks,
    Http,
    Admin,
}

impl BackendRole {
    /// Mux rule priority order.
    pub const PRIORITY: [BackendRole; 3] = [BackendRole::Http, BackendRole::Admin, BackendRole::Socks];

    /// Prefix matcher selecting this backend.
    pub fn matcher(self) -> Matcher {
        match self {
            BackendRole::Http => classify::match_http,
            BackendRole::Admin => classify::match_tls,
            BackendRole::Socks => classify::match_socks5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendRole::Socks => "socks",
            BackendRole::Http => "http",
            BackendRole::Admin => "admin",
        }
    }
}

impl fmt::Display for BackendRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A started backend.
///
/// The bound address is fixed at construction; there is no way to change it
/// afterwards. Dropping the descriptor stops the backend.
#[derive(Debug)]
pub struct BackendDescriptor {
    role: BackendRole,
    local_addr: SocketAddr,
    task: JoinHandle<()>,
}

impl BackendDescriptor {
    pub fn new(role: BackendRole, local_addr: SocketAddr, task: JoinHandle<()>) -> Self {
        Self {
            role,
            local_addr,
            task,
        }
    }

    pub fn role(&self) -> BackendRole {
        self.role
    }

    pub fn matcher(&self) -> Matcher {
        self.role.matcher()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Address the multiplexer connects to. An unspecified bind address is
    /// reached over loopback.
    pub fn target(&self) -> SocketAddr {
        let ip = match self.local_addr.ip() {
            IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
            ip => ip,
        };
        SocketAddr::new(ip, self.local_addr.port())
    }

    /// Whether the backend's accept loop has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for BackendDescriptor {
    fn drop(&mut self) {
        self.task.abort();
    }
}
