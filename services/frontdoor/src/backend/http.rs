//! Plain HTTP forward proxy backend.
//!
//! Requests arrive in absolute form (`GET http://host:port/path HTTP/1.1`).
//! The `Host` header is rewritten to the URL authority, the target to
//! origin form, and the request is sent to the origin over a fresh
//! HTTP/1.1 connection. No `X-Forwarded-*` headers are added.
//!
//! The whitelist is checked per request. A denied request fails the service
//! call, which makes hyper drop the connection without a response.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1::Builder as ClientBuilder;
use hyper::header::{HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::inbound::accept_inbound;
use super::{bind_listener, serve, BackendConfig, BackendDescriptor, BackendRole};
use crate::access::AccessControl;
use crate::error::StartupError;

/// Port used when the request URL has none.
pub const DEFAULT_HTTP_PORT: u16 = 80;

type ProxyBody = BoxBody<Bytes, hyper::Error>;

#[derive(Debug, Error)]
pub enum HttpProxyError {
    #[error("unauthorized access from {0}")]
    Unauthorized(IpAddr),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Hyper(#[from] hyper::Error),
}

/// Where an absolute-form request goes, and what it looks like on arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    /// Origin host without IPv6 brackets.
    pub host: String,
    pub port: u16,
    /// `Host` header value (the URL authority).
    pub host_header: String,
    /// Origin-form request target.
    pub path: String,
}

impl Forward {
    /// Resolve the origin from an absolute-form URI.
    pub fn from_uri(uri: &Uri) -> Option<Self> {
        let authority = uri.authority()?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return None;
        }
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
            .to_string();

        Some(Self {
            host,
            port: authority.port_u16().unwrap_or(DEFAULT_HTTP_PORT),
            host_header: authority.as_str().to_string(),
            path,
        })
    }

    /// Rewrite `req` for the origin server.
    pub fn apply<B>(&self, req: &mut Request<B>) -> Option<()> {
        *req.uri_mut() = self.path.parse().ok()?;
        let host = HeaderValue::from_str(&self.host_header).ok()?;
        req.headers_mut().insert(HOST, host);
        req.headers_mut().remove("proxy-connection");
        Some(())
    }
}

fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never: Infallible| match never {})
        .boxed()
}

fn status_response(status: StatusCode, msg: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full(msg));
    *response.status_mut() = status;
    response
}

/// HTTP forward proxy backend.
pub struct HttpBackend {
    config: BackendConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    access: AccessControl,
}

impl HttpBackend {
    pub async fn bind(config: BackendConfig, access: AccessControl) -> Result<Self, StartupError> {
        let (listener, local_addr) = bind_listener(BackendRole::Http, config.bind_addr).await?;
        info!(bind_addr = %local_addr, "HTTP backend bound");

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
        Ok(BackendDescriptor::new(BackendRole::Http, local_addr, task))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn run(self: Arc<Self>) {
        let this = Arc::clone(&self);
        serve(&self.listener, BackendRole::Http, move |stream, peer_addr| {
            let this = Arc::clone(&this);
            async move { this.handle_connection(stream, peer_addr).await }
        })
        .await;
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), HttpProxyError> {
        let inbound = accept_inbound(stream, peer_addr, self.config.header_timeout).await?;
        let client_ip = inbound.client_ip();
        let io = TokioIo::new(inbound.stream);

        let this = Arc::clone(&self);
        let service = service_fn(move |req| {
            let this = Arc::clone(&this);
            async move { this.proxy(req, client_ip).await }
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .await?;
        Ok(())
    }

    async fn proxy(
        &self,
        mut req: Request<Incoming>,
        client_ip: IpAddr,
    ) -> Result<Response<ProxyBody>, HttpProxyError> {
        if !self.access.check(BackendRole::Http, client_ip).is_allowed() {
            return Err(HttpProxyError::Unauthorized(client_ip));
        }

        let Some(forward) = Forward::from_uri(req.uri()) else {
            debug!(uri = %req.uri(), "Request without absolute URL");
            return Ok(status_response(StatusCode::BAD_REQUEST, "absolute URL required"));
        };
        if forward.apply(&mut req).is_none() {
            return Ok(status_response(StatusCode::BAD_REQUEST, "invalid request target"));
        }

        debug!(
            method = %req.method(),
            host = %forward.host,
            port = forward.port,
            path = %forward.path,
            "Forwarding request"
        );

        let origin = match timeout(
            self.config.connect_timeout,
            TcpStream::connect((forward.host.as_str(), forward.port)),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(host = %forward.host, port = forward.port, error = %e, "Origin connect failed");
                return Ok(status_response(StatusCode::BAD_GATEWAY, "origin unreachable"));
            }
            Err(_) => {
                warn!(host = %forward.host, port = forward.port, "Origin connect timeout");
                return Ok(status_response(StatusCode::GATEWAY_TIMEOUT, "origin connect timeout"));
            }
        };

        let (mut sender, conn) = match ClientBuilder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(origin))
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                warn!(host = %forward.host, error = %e, "Origin handshake failed");
                return Ok(status_response(StatusCode::BAD_GATEWAY, "origin handshake failed"));
            }
        };

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!(error = %e, "Origin connection error");
            }
        });

        match sender.send_request(req).await {
            Ok(response) => Ok(response.map(|body| body.boxed())),
            Err(e) => {
                warn!(host = %forward.host, error = %e, "Origin request failed");
                Ok(status_response(StatusCode::BAD_GATEWAY, "origin request failed"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy_protocol::ProxyHeader;
    use onedoor_whitelist::Whitelist;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Origin that records the request head and answers with a fixed body.
    async fn origin_server() -> (SocketAddr, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            let _ = tx.send(String::from_utf8_lossy(&head).into_owned());
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\nConnection: close\r\n\r\norigin")
                .await
                .unwrap();
        });
        (addr, rx)
    }

    async fn start_backend(whitelist: &[&str]) -> BackendDescriptor {
        let access = AccessControl::new(Arc::new(Whitelist::with_addresses(whitelist)));
        HttpBackend::start(BackendConfig::loopback(), access)
            .await
            .unwrap()
    }

    async fn read_response(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut buf)).await;
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[test]
    fn test_forward_from_absolute_uri() {
        let uri: Uri = "http://example.com:8080/a/b?c=d".parse().unwrap();
        let forward = Forward::from_uri(&uri).unwrap();
        assert_eq!(forward.host, "example.com");
        assert_eq!(forward.port, 8080);
        assert_eq!(forward.host_header, "example.com:8080");
        assert_eq!(forward.path, "/a/b?c=d");
    }

    #[test]
    fn test_forward_defaults() {
        let uri: Uri = "http://example.com".parse().unwrap();
        let forward = Forward::from_uri(&uri).unwrap();
        assert_eq!(forward.port, DEFAULT_HTTP_PORT);
        assert_eq!(forward.path, "/");

        let uri: Uri = "http://[::1]:81/x".parse().unwrap();
        let forward = Forward::from_uri(&uri).unwrap();
        assert_eq!(forward.host, "::1");
        assert_eq!(forward.host_header, "[::1]:81");
    }

    #[test]
    fn test_origin_form_has_no_forward() {
        let uri: Uri = "/index.html".parse().unwrap();
        assert!(Forward::from_uri(&uri).is_none());
    }

    #[test]
    fn test_apply_rewrites_target_and_host() {
        let uri: Uri = "http://example.com:8080/x?y=1".parse().unwrap();
        let forward = Forward::from_uri(&uri).unwrap();
        let mut req = Request::builder()
            .uri(uri)
            .header(HOST, "wrong")
            .header("proxy-connection", "keep-alive")
            .body(())
            .unwrap();

        forward.apply(&mut req).unwrap();
        assert_eq!(req.uri(), "/x?y=1");
        assert_eq!(req.headers()[HOST], "example.com:8080");
        assert!(req.headers().get("proxy-connection").is_none());
    }

    #[tokio::test]
    async fn test_request_forwarded_to_origin() {
        let (origin, head_rx) = origin_server().await;
        let backend = start_backend(&[]).await;

        let mut client = TcpStream::connect(backend.local_addr()).await.unwrap();
        let request = format!(
            "GET http://{origin}/hello?x=1 HTTP/1.1\r\nHost: {origin}\r\nConnection: close\r\n\r\n"
        );
        client.write_all(request.as_bytes()).await.unwrap();

        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.ends_with("origin"));

        let head = head_rx.await.unwrap();
        assert!(head.starts_with("GET /hello?x=1 HTTP/1.1\r\n"), "{head}");
        assert!(head.contains(&format!("Host: {origin}\r\n")), "{head}");
        assert!(!head.to_ascii_lowercase().contains("x-forwarded"));
    }

    #[tokio::test]
    async fn test_unlisted_client_gets_no_response() {
        let (origin, mut head_rx) = origin_server().await;
        let backend = start_backend(&["10.0.0.1"]).await;

        let mut client = TcpStream::connect(backend.local_addr()).await.unwrap();
        let mut data = ProxyHeader::new(
            "10.0.0.2:40000".parse().unwrap(),
            "127.0.0.1:8818".parse().unwrap(),
        )
        .encode();
        data.extend_from_slice(
            format!("GET http://{origin}/ HTTP/1.1\r\nHost: {origin}\r\n\r\n").as_bytes(),
        );
        client.write_all(&data).await.unwrap();

        let response = read_response(&mut client).await;
        assert!(!response.starts_with("HTTP/1.1"), "{response}");
        assert!(head_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unreachable_origin_is_bad_gateway() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let backend = start_backend(&[]).await;

        let mut client = TcpStream::connect(backend.local_addr()).await.unwrap();
        let request = format!("GET http://{closed}/ HTTP/1.1\r\nHost: {closed}\r\nConnection: close\r\n\r\n");
        client.write_all(request.as_bytes()).await.unwrap();

        let response = read_response(&mut client).await;
        assert!(response.starts_with("HTTP/1.1 502"), "{response}");
    }
}
