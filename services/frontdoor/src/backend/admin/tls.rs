//! TLS material for the admin backend.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::error::StartupError;

/// Build a server config from a PEM certificate chain and private key.
pub fn load_server_config(cert_path: &Path, key_path: &Path) -> Result<ServerConfig, StartupError> {
    let open = |path: &Path| {
        File::open(path)
            .map(BufReader::new)
            .map_err(|e| StartupError::tls_material(path, e))
    };

    let certs = rustls_pemfile::certs(&mut open(cert_path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| StartupError::tls_material(cert_path, e))?;
    if certs.is_empty() {
        return Err(StartupError::tls_material(
            cert_path,
            io::Error::new(io::ErrorKind::InvalidData, "no certificates found"),
        ));
    }

    let key = rustls_pemfile::private_key(&mut open(key_path)?)
        .map_err(|e| StartupError::tls_material(key_path, e))?
        .ok_or_else(|| {
            StartupError::tls_material(
                key_path,
                io::Error::new(io::ErrorKind::InvalidData, "no private key found"),
            )
        })?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    info!(
        cert = %cert_path.display(),
        key = %key_path.display(),
        "Loaded TLS certificates"
    );

    Ok(config)
}

/// Load the acceptor used by the admin backend.
pub fn load_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, StartupError> {
    let mut config = load_server_config(cert_path, key_path)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}
