//! Startup errors.
//!
//! Anything here is fatal: the public port is never opened when startup
//! fails. Per-connection faults are logged by the task that hit them.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendRole;

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to bind {role} backend on {addr}: {source}")]
    Bind {
        role: BackendRole,
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),

    #[error("failed to load TLS material from {}: {source}", path.display())]
    TlsMaterial { path: PathBuf, source: io::Error },

    #[error("failed to bind public listener on {addr}: {source}")]
    PublicBind { addr: SocketAddr, source: io::Error },
}

impl StartupError {
    pub fn tls_material(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::TlsMaterial {
            path: path.into(),
            source,
        }
    }
}
