//! Startup coordination.
//!
//! The three backends bind concurrently. Only when all of them have reported
//! their bound address is the rule set built and the public port bound. Any
//! failure aborts startup and drops the backends that did come up, so the
//! public port is never open without every backend behind it.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use onedoor_whitelist::Whitelist;
use tracing::info;

use crate::access::AccessControl;
use crate::backend::{
    AdminBackend, AdminConfig, BackendConfig, BackendDescriptor, BackendRole, HttpBackend,
    SocksBackend,
};
use crate::error::StartupError;
use crate::mux::{Classifier, MuxConfig, MuxListener, MuxRule, MuxStats};

/// Everything needed to bring the front door up.
#[derive(Debug, Clone)]
pub struct FrontDoorConfig {
    pub mux: MuxConfig,
    pub socks: BackendConfig,
    pub http: BackendConfig,
    pub admin: AdminConfig,
}

/// A started front door: backends running, public port bound.
pub struct FrontDoor {
    listener: Arc<MuxListener>,
    public_addr: SocketAddr,
    /// In rule priority order.
    backends: Vec<BackendDescriptor>,
}

impl FrontDoor {
    /// Start the backends, then bind the public listener.
    pub async fn start(
        config: FrontDoorConfig,
        whitelist: Arc<Whitelist>,
    ) -> Result<Self, StartupError> {
        let access = AccessControl::new(Arc::clone(&whitelist));

        let (socks, http, admin) = tokio::try_join!(
            SocksBackend::start(config.socks, access.clone()),
            HttpBackend::start(config.http, access),
            AdminBackend::start(config.admin, whitelist),
        )?;

        let backends = vec![http, admin, socks];
        debug_assert!(backends
            .iter()
            .map(BackendDescriptor::role)
            .eq(BackendRole::PRIORITY));

        for backend in &backends {
            info!(
                role = %backend.role(),
                bind_addr = %backend.local_addr(),
                "Backend ready"
            );
        }

        let classifier = Classifier::new(
            backends
                .iter()
                .map(|backend| MuxRule {
                    role: backend.role(),
                    matcher: backend.matcher(),
                    target: backend.target(),
                })
                .collect(),
        );

        let bind_addr = config.mux.bind_addr;
        let public_bind_error = |source| StartupError::PublicBind {
            addr: bind_addr,
            source,
        };
        let listener = MuxListener::bind(config.mux, classifier)
            .await
            .map_err(public_bind_error)?;
        let public_addr = listener.local_addr().map_err(public_bind_error)?;

        info!(public_addr = %public_addr, "Front door listening");

        Ok(Self {
            listener: Arc::new(listener),
            public_addr,
            backends,
        })
    }

    pub fn public_addr(&self) -> SocketAddr {
        self.public_addr
    }

    /// Started backends, in rule priority order.
    pub fn backends(&self) -> &[BackendDescriptor] {
        &self.backends
    }

    pub fn backend(&self, role: BackendRole) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|backend| backend.role() == role)
    }

    pub fn stats(&self) -> &MuxStats {
        self.listener.stats()
    }

    /// Serve the public port. The backends stop when this future is dropped.
    pub async fn run(self) -> io::Result<()> {
        let Self {
            listener, backends, ..
        } = self;
        let result = listener.run().await;
        drop(backends);
        result
    }
}
