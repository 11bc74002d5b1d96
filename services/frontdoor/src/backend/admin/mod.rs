//! TLS admin backend.
//!
//! Serves the whitelist management API behind HTTP Basic authentication,
//! plus static files. The admin backend does not apply the whitelist; the
//! credentials are its only gate.

pub mod api;
pub mod auth;
pub mod tls;

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{middleware, Router};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use onedoor_whitelist::Whitelist;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tower::ServiceExt;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::info;

use super::inbound::accept_inbound;
use super::{bind_listener, serve, BackendDescriptor, BackendRole, DEFAULT_HEADER_TIMEOUT};
use crate::error::StartupError;

pub use api::ClientAddr;
pub use auth::Credentials;

/// Admin backend settings.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    /// Address to bind to; port 0 lets the OS pick.
    pub bind_addr: SocketAddr,
    pub header_timeout: Duration,
    /// PEM certificate chain.
    pub cert_path: PathBuf,
    /// PEM private key.
    pub key_path: PathBuf,
    /// Directory served for paths without an API route.
    pub static_dir: PathBuf,
    pub credentials: Credentials,
    /// Write the whitelist file after each change.
    pub persist: bool,
}

impl AdminConfig {
    pub fn new(
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
        credentials: Credentials,
    ) -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            header_timeout: DEFAULT_HEADER_TIMEOUT,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            static_dir: PathBuf::from("./static"),
            credentials,
            persist: true,
        }
    }
}

/// State shared by the admin handlers.
#[derive(Clone)]
pub struct AdminState {
    inner: Arc<AdminStateInner>,
}

struct AdminStateInner {
    whitelist: Arc<Whitelist>,
    credentials: Credentials,
    persist: bool,
}

impl AdminState {
    pub fn new(whitelist: Arc<Whitelist>, credentials: Credentials, persist: bool) -> Self {
        Self {
            inner: Arc::new(AdminStateInner {
                whitelist,
                credentials,
                persist,
            }),
        }
    }

    pub fn whitelist(&self) -> &Arc<Whitelist> {
        &self.inner.whitelist
    }

    pub fn credentials(&self) -> &Credentials {
        &self.inner.credentials
    }

    pub fn persist(&self) -> bool {
        self.inner.persist
    }
}

/// Admin router: API routes, static fallback, Basic auth on everything.
pub fn create_router(state: AdminState, static_dir: impl Into<PathBuf>) -> Router {
    Router::new()
        .merge(api::routes())
        .fallback_service(ServeDir::new(static_dir.into()))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_basic_auth,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Error)]
enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),
}

/// TLS admin backend.
pub struct AdminBackend {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
    header_timeout: Duration,
}

impl AdminBackend {
    /// Load TLS material and bind. Either failure is fatal.
    pub async fn bind(config: AdminConfig, whitelist: Arc<Whitelist>) -> Result<Self, StartupError> {
        let acceptor = tls::load_acceptor(&config.cert_path, &config.key_path)?;
        let (listener, local_addr) = bind_listener(BackendRole::Admin, config.bind_addr).await?;

        let state = AdminState::new(whitelist, config.credentials, config.persist);
        let router = create_router(state, &config.static_dir);

        info!(
            bind_addr = %local_addr,
            static_dir = %config.static_dir.display(),
            "Admin backend bound"
        );

        Ok(Self {
            listener,
            local_addr,
            acceptor,
            router,
            header_timeout: config.header_timeout,
        })
    }

    /// Bind and spawn the accept loop.
    pub async fn start(
        config: AdminConfig,
        whitelist: Arc<Whitelist>,
    ) -> Result<BackendDescriptor, StartupError> {
        let backend = Arc::new(Self::bind(config, whitelist).await?);
        let local_addr = backend.local_addr();
        let task = tokio::spawn(backend.run());
        Ok(BackendDescriptor::new(BackendRole::Admin, local_addr, task))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self: Arc<Self>) {
        let this = Arc::clone(&self);
        serve(&self.listener, BackendRole::Admin, move |stream, peer_addr| {
            let this = Arc::clone(&this);
            async move { this.handle_connection(stream, peer_addr).await }
        })
        .await;
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), ConnectionError> {
        let inbound = accept_inbound(stream, peer_addr, self.header_timeout).await?;
        let client = ClientAddr(inbound.client_addr);
        let tls = self.acceptor.accept(inbound.stream).await?;

        let router = self.router.clone();
        let service = service_fn(move |mut req: Request<Incoming>| {
            req.extensions_mut().insert(client);
            router.clone().oneshot(req)
        });

        http1::Builder::new()
            .serve_connection(TokioIo::new(tls), service)
            .await?;
        Ok(())
    }
}
