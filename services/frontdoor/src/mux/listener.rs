//! Public listener: accept, classify by prefix, relay to a backend.
//!
//! Each accepted connection runs in its own task:
//! 1. read up to [`LOOKAHEAD`] bytes until the rule set decides, EOF, or the
//!    classification timeout fires;
//! 2. connect to the matched backend and send a PROXY v2 header followed by
//!    the buffered prefix;
//! 3. relay bytes in both directions until close.
//!
//! Unclassifiable connections are closed without a reply.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn, Instrument};

use super::classify::{Classification, Classifier, LOOKAHEAD};
use crate::backend::BackendRole;
use crate::proxy_protocol::ProxyHeader;
use crate::relay::relay;

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default time allowed for the classification prefix to arrive.
pub const DEFAULT_CLASSIFY_TIMEOUT: Duration = Duration::from_secs(2);

/// Default timeout for connecting to a backend.
pub const DEFAULT_BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Configuration for the public listener.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Public address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// How long a client has to send a classifiable prefix.
    pub classify_timeout: Duration,
    /// Backend connect timeout.
    pub connect_timeout: Duration,
}

impl MuxConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            classify_timeout: DEFAULT_CLASSIFY_TIMEOUT,
            connect_timeout: DEFAULT_BACKEND_CONNECT_TIMEOUT,
        }
    }
}

/// Counters for the public listener.
#[derive(Debug, Default)]
pub struct MuxStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections finished.
    pub connections_closed: AtomicU64,
    /// Connections refused because the connection limit was reached.
    pub connections_rejected: AtomicU64,
    /// Connections closed because no rule matched.
    pub unclassified: AtomicU64,
    pub classified_http: AtomicU64,
    pub classified_admin: AtomicU64,
    pub classified_socks: AtomicU64,
    /// Backend connect failures.
    pub backend_failed: AtomicU64,
    /// Bytes relayed client -> backend (prefix included).
    pub bytes_to_backend: AtomicU64,
    /// Bytes relayed backend -> client.
    pub bytes_from_backend: AtomicU64,
}

impl MuxStats {
    fn record_classified(&self, role: BackendRole) {
        let counter = match role {
            BackendRole::Http => &self.classified_http,
            BackendRole::Admin => &self.classified_admin,
            BackendRole::Socks => &self.classified_socks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Read from `stream` into `prefix` until `classifier` reaches a decision.
///
/// Reading stops as soon as a rule matches or every rule has refused. EOF,
/// `classify_timeout` or a full lookahead buffer settle the prefix with
/// [`Classifier::classify_final`].
pub async fn read_prefix<S>(
    stream: &mut S,
    classifier: &Classifier,
    classify_timeout: Duration,
    prefix: &mut Vec<u8>,
) -> io::Result<Classification>
where
    S: AsyncRead + Unpin,
{
    let deadline = Instant::now() + classify_timeout;
    let mut chunk = [0u8; LOOKAHEAD];

    loop {
        match classifier.classify(prefix) {
            Classification::Undecided if prefix.len() < LOOKAHEAD => {}
            Classification::Undecided => return Ok(classifier.classify_final(prefix)),
            decided => return Ok(decided),
        }

        let want = LOOKAHEAD - prefix.len();
        match timeout_at(deadline, stream.read(&mut chunk[..want])).await {
            Ok(Ok(0)) => {
                debug!(buffered = prefix.len(), "EOF before classification");
                return Ok(classifier.classify_final(prefix));
            }
            Ok(Ok(n)) => prefix.extend_from_slice(&chunk[..n]),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!(buffered = prefix.len(), "Classification timeout");
                return Ok(classifier.classify_final(prefix));
            }
        }
    }
}

/// The single public listener.
pub struct MuxListener {
    config: MuxConfig,
    listener: TcpListener,
    classifier: Classifier,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<MuxStats>,
}

impl MuxListener {
    /// Bind the public port.
    pub async fn bind(config: MuxConfig, classifier: Classifier) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            rules = classifier.rules().len(),
            "Mux listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            classifier,
            stats: Arc::new(MuxStats::default()),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &MuxStats {
        &self.stats
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Accept and handle connections until the task is dropped.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Mux listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream, peer_addr).await {
                                debug!(error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    async fn handle_connection(&self, mut client: TcpStream, peer_addr: SocketAddr) -> io::Result<()> {
        let local_addr = client.local_addr()?;

        let mut prefix = Vec::with_capacity(LOOKAHEAD);
        let classification = read_prefix(
            &mut client,
            &self.classifier,
            self.config.classify_timeout,
            &mut prefix,
        )
        .await?;

        let rule = match classification {
            Classification::Matched(index) => self.classifier.rule(index),
            Classification::Undecided | Classification::Rejected => None,
        };
        let Some(rule) = rule else {
            self.stats.unclassified.fetch_add(1, Ordering::Relaxed);
            debug!(buffered = prefix.len(), "Unclassifiable connection closed");
            return Ok(());
        };

        self.stats.record_classified(rule.role);
        debug!(role = %rule.role, target = %rule.target, "Connection classified");

        let mut backend = match timeout(self.config.connect_timeout, TcpStream::connect(rule.target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(role = %rule.role, target = %rule.target, error = %e, "Backend connect failed");
                return Ok(());
            }
            Err(_) => {
                self.stats.backend_failed.fetch_add(1, Ordering::Relaxed);
                warn!(role = %rule.role, target = %rule.target, "Backend connect timeout");
                return Ok(());
            }
        };

        let mut head = ProxyHeader::new(peer_addr, local_addr).encode();
        head.extend_from_slice(&prefix);
        backend.write_all(&head).await?;

        let relayed = relay(&mut client, &mut backend).await?;

        let to_backend = relayed.a_to_b + prefix.len() as u64;
        self.stats
            .bytes_to_backend
            .fetch_add(to_backend, Ordering::Relaxed);
        self.stats
            .bytes_from_backend
            .fetch_add(relayed.b_to_a, Ordering::Relaxed);

        debug!(
            role = %rule.role,
            bytes_to_backend = to_backend,
            bytes_from_backend = relayed.b_to_a,
            "Connection closed"
        );

        Ok(())
    }
}
