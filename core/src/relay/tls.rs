//! Optional TLS wrapping for relay connections.
//!
//! The relay speaks the same protocol either way; these helpers only
//! build the acceptor/connector. TLS 1.3 is the supported minimum.

use crate::config::TlsPaths;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{version, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        path: String,
        source: std::io::Error,
    },
    #[error("No private key found in {0}")]
    NoPrivateKey(String),
    #[error("Invalid certificate or key: {0}")]
    Config(String),
    #[error("Invalid server name {0:?}")]
    ServerName(String),
}

/// Build a server-side acceptor from PEM cert/key files
pub fn load_acceptor(paths: &TlsPaths) -> Result<TlsAcceptor, TlsError> {
    let certs = read_certs(&paths.cert)?;
    let key = read_key(&paths.key)?;

    let config = ServerConfig::builder_with_protocol_versions(&[&version::TLS13])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TlsError::Config(e.to_string()))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a client-side connector trusting the standard web roots
pub fn client_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder_with_protocol_versions(&[&version::TLS13])
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Parse the host part of `host:port` into a rustls server name
pub fn server_name(addr: &str) -> Result<ServerName<'static>, TlsError> {
    let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
    ServerName::try_from(host.to_string()).map_err(|_| TlsError::ServerName(host.to_string()))
}

fn read_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    certs.map_err(|e| TlsError::Config(e.to_string()))
}

fn read_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsError::Config(e.to_string()))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.display().to_string()))
}
