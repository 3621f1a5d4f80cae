//! Relay client: dial, authenticate, hand back the open pipe

use super::protocol::{read_json_line, write_json_line, HandshakeRequest, HandshakeResponse};
use super::{tls, ProtocolError, RelayIo, RelayStream};
use crate::auth::Role;
use std::time::Duration;
use thiserror::Error;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// Relay client errors
#[derive(Debug, Error)]
pub enum RelayClientError {
    #[error("Relay unreachable: {0}")]
    Unreachable(String),
    #[error("Timed out connecting to the relay")]
    ConnectTimeout,
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Relay rejected the connection: {0}")]
    Rejected(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Connects to a relay and performs the one-frame handshake.
///
/// On success the returned stream is the opaque byte pipe to the peer;
/// nothing else ever travels on it.
#[derive(Debug, Clone)]
pub struct RelayClient {
    addr: String,
    use_tls: bool,
    connect_timeout: Duration,
    handshake_timeout: Duration,
}

impl RelayClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            use_tls: false,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
        }
    }

    /// Wrap the connection in TLS (server certificates verified against
    /// the standard web roots)
    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, handshake_timeout: Duration) -> Self {
        self.handshake_timeout = handshake_timeout;
        self
    }

    /// Dial the relay and authenticate as (session, role)
    pub async fn connect(
        &self,
        session_id: &str,
        relay_token: &str,
        role: Role,
    ) -> Result<RelayStream, RelayClientError> {
        let request = HandshakeRequest {
            session_id: session_id.to_string(),
            relay_token: relay_token.to_string(),
            role,
        };

        let tcp = self.dial().await?;
        debug!("Connected to relay {} as {}", self.addr, role);

        if self.use_tls {
            let connector = tls::client_connector();
            let name =
                tls::server_name(&self.addr).map_err(|e| RelayClientError::Tls(e.to_string()))?;
            let stream = connector
                .connect(name, tcp)
                .await
                .map_err(|e| RelayClientError::Tls(e.to_string()))?;
            self.authenticate(stream, &request).await
        } else {
            self.authenticate(tcp, &request).await
        }
    }

    /// Probe whether the relay accepts TCP connections at all
    pub async fn check_reachable(&self) -> Result<(), RelayClientError> {
        let stream = self.dial().await?;
        drop(stream);
        Ok(())
    }

    async fn dial(&self) -> Result<TcpStream, RelayClientError> {
        timeout(self.connect_timeout, TcpStream::connect(self.addr.as_str()))
            .await
            .map_err(|_| RelayClientError::ConnectTimeout)?
            .map_err(|e| RelayClientError::Unreachable(e.to_string()))
    }

    async fn authenticate<S: RelayIo + 'static>(
        &self,
        stream: S,
        request: &HandshakeRequest,
    ) -> Result<RelayStream, RelayClientError> {
        let mut stream = BufReader::new(stream);

        let response: HandshakeResponse = timeout(self.handshake_timeout, async {
            write_json_line(&mut stream, request).await?;
            read_json_line(&mut stream).await
        })
        .await
        .map_err(|_| RelayClientError::HandshakeTimeout)??;

        if !response.success {
            return Err(RelayClientError::Rejected(
                response.error.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }

        Ok(Box::new(stream))
    }
}

// ============================================================================
// TESTS
// ============================================================================
