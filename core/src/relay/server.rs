//! Relay server: handshake, pairing and splicing

use super::protocol::{read_json_line, write_json_line, HandshakeRequest, HandshakeResponse};
use super::{tls, RelayIo, RelayStream};
use crate::auth::{Role, Signer};
use crate::config::{is_default_secret, RelayConfig};
use crate::rendezvous::RendezvousClient;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Relay error taxonomy
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Handshake timed out")]
    HandshakeTimeout,
    #[error("Malformed handshake: {0}")]
    HandshakeMalformed(String),
    #[error("Authentication failed: {0}")]
    AuthFailed(String),
    #[error("No peer arrived before the pair timeout")]
    PairTimeout,
    #[error("Session exceeded the maximum duration")]
    SessionExpired,
    #[error("Peer closed the connection")]
    PeerClosed,
    #[error("Relay shutting down")]
    Cancelled,
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connection that authenticated but has no peer yet.
/// The table owns the socket; dropping the entry closes it.
struct Pending {
    stream: RelayStream,
    role: Role,
    created_at: Instant,
}

enum PairOutcome {
    /// Parked in the pending table (possibly displacing a same-role entry)
    Installed,
    /// Matched the waiting opposite role; both streams ready to splice
    Paired {
        host: RelayStream,
        joiner: RelayStream,
    },
}

struct Inner {
    config: RelayConfig,
    signer: Signer,
    /// session id -> the one connection waiting for its peer
    pending: Mutex<HashMap<String, Pending>>,
    /// Liveness reporting and validate fallback; None when standalone
    rendezvous: Option<RendezvousClient>,
    cancel: CancellationToken,
    spliced: AtomicU64,
}

/// The relay service: one TCP listener, a pending table and a janitor.
///
/// Pairing is the critical section. Under one mutex, a new authenticated
/// connection either takes the waiting opposite-role entry (then splices
/// outside the lock), displaces a same-role entry, or parks itself.
/// There is no pair-wait loop: the entry owns the socket and the second
/// arrival drives the splice, so the janitor alone enforces the pair
/// timeout.
#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<Inner>,
}

impl RelayServer {
    pub fn new(config: RelayConfig, cancel: CancellationToken) -> Self {
        if is_default_secret(&config.secret) {
            warn!("Relay is using the default secret; set a real one in production");
        }

        let rendezvous = config
            .rendezvous_url
            .as_deref()
            .map(RendezvousClient::new);
        let signer = Signer::new(&config.secret);

        Self {
            inner: Arc::new(Inner {
                config,
                signer,
                pending: Mutex::new(HashMap::new()),
                rendezvous,
                cancel,
                spliced: AtomicU64::new(0),
            }),
        }
    }

    /// Bind the configured port
    pub async fn bind(&self) -> Result<TcpListener, RelayError> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.inner.config.port).into();
        Ok(TcpListener::bind(addr).await?)
    }

    /// Accept connections until cancellation.
    ///
    /// Each connection runs in its own task; the janitor reaps pending
    /// entries older than the pair timeout.
    pub async fn run(&self, listener: TcpListener) -> Result<(), RelayError> {
        let acceptor = match &self.inner.config.tls {
            Some(paths) => Some(
                tls::load_acceptor(paths).map_err(|e| RelayError::Tls(e.to_string()))?,
            ),
            None => None,
        };

        self.spawn_janitor();

        info!(
            "Relay listening on {} (tls: {})",
            listener.local_addr()?,
            acceptor.is_some()
        );

        loop {
            let (stream, peer) = tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    info!("Relay shutting down");
                    // Parked sockets close with their entries
                    self.inner.pending.lock().clear();
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("Accept error: {}", e);
                        continue;
                    }
                },
            };

            debug!("New connection from {}", peer);
            let server = self.clone();
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => {
                        let deadline = server.inner.config.handshake_timeout;
                        match timeout(deadline, acceptor.accept(stream)).await {
                            Ok(Ok(tls_stream)) => server.handle_conn(tls_stream, peer).await,
                            Ok(Err(e)) => warn!("TLS accept from {} failed: {}", peer, e),
                            Err(_) => warn!("TLS accept from {} timed out", peer),
                        }
                    }
                    None => server.handle_conn(stream, peer).await,
                }
            });
        }
    }

    /// Number of connections currently waiting for a peer
    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Total sessions spliced since start
    pub fn sessions_spliced(&self) -> u64 {
        self.inner.spliced.load(Ordering::Relaxed)
    }

    async fn handle_conn<S: RelayIo + 'static>(&self, stream: S, peer: SocketAddr) {
        match self.process(stream, peer).await {
            Ok(()) | Err(RelayError::PeerClosed) => {}
            Err(RelayError::Cancelled) => debug!("Connection from {} cancelled", peer),
            Err(RelayError::SessionExpired) => {
                warn!("Session from {} hit the max-session deadline", peer)
            }
            Err(e) => warn!("Connection from {} failed: {}", peer, e),
        }
    }

    async fn process<S: RelayIo + 'static>(
        &self,
        stream: S,
        peer: SocketAddr,
    ) -> Result<(), RelayError> {
        // A pending shutdown aborts handshakes in flight; dropping the
        // future closes the socket
        let handshake = tokio::select! {
            _ = self.inner.cancel.cancelled() => return Err(RelayError::Cancelled),
            done = self.handshake(stream) => done,
        };
        let (session_id, role, stream) = handshake?;
        info!("Authenticated {} for session {} ({})", role, session_id, peer);

        self.report_connected(&session_id, role, true);

        match self.install_or_pair(&session_id, role, stream) {
            PairOutcome::Installed => {
                debug!("Parked {} for session {}", role, session_id);
                Ok(())
            }
            PairOutcome::Paired { host, joiner } => {
                self.inner.spliced.fetch_add(1, Ordering::Relaxed);
                info!("Paired session {}", session_id);
                let outcome = self.splice(&session_id, host, joiner).await;
                self.report_connected(&session_id, Role::Host, false);
                self.report_connected(&session_id, Role::Joiner, false);
                Err(outcome)
            }
        }
    }

    /// Read and answer the single handshake frame under the deadline.
    ///
    /// Failures send a best-effort error envelope and never touch the
    /// pending table.
    async fn handshake<S: RelayIo + 'static>(
        &self,
        stream: S,
    ) -> Result<(String, Role, RelayStream), RelayError> {
        let deadline = self.inner.config.handshake_timeout;
        let mut stream = BufReader::new(stream);

        let read_result = timeout(deadline, read_json_line(&mut stream)).await;
        let request: HandshakeRequest = match read_result {
            Err(_) => {
                self.reject(&mut stream, "handshake timeout").await;
                return Err(RelayError::HandshakeTimeout);
            }
            Ok(Err(e)) => {
                self.reject(&mut stream, "invalid handshake").await;
                return Err(RelayError::HandshakeMalformed(e.to_string()));
            }
            Ok(Ok(request)) => request,
        };

        let (session_id, role) = match self.validate_token(&request).await {
            Ok(ok) => ok,
            Err(e) => {
                self.reject(&mut stream, "invalid token").await;
                return Err(e);
            }
        };

        timeout(
            deadline,
            write_json_line(&mut stream, &HandshakeResponse::ok()),
        )
        .await
        .map_err(|_| RelayError::HandshakeTimeout)?
        .map_err(|e| match e {
            super::protocol::ProtocolError::Io(io) => RelayError::Io(io),
            other => RelayError::HandshakeMalformed(other.to_string()),
        })?;

        Ok((session_id, role, Box::new(stream)))
    }

    /// Verify the token locally; fall back to the rendezvous validate
    /// endpoint when one is configured. Claims must match the asserted
    /// session id and role exactly.
    async fn validate_token(
        &self,
        request: &HandshakeRequest,
    ) -> Result<(String, Role), RelayError> {
        let (session_id, role) = match self.inner.signer.verify(&request.relay_token) {
            Ok(claims) => (claims.session_id, claims.role),
            Err(local_err) => match &self.inner.rendezvous {
                Some(client) => {
                    let validated = client
                        .validate(&request.relay_token)
                        .await
                        .map_err(|e| RelayError::AuthFailed(e.to_string()))?;
                    (validated.session_id, validated.role)
                }
                None => return Err(RelayError::AuthFailed(local_err.to_string())),
            },
        };

        if session_id != request.session_id || role != request.role {
            return Err(RelayError::AuthFailed("token mismatch".into()));
        }

        Ok((session_id, role))
    }

    async fn reject<S: RelayIo>(&self, stream: &mut S, reason: &str) {
        let envelope = HandshakeResponse::rejected(reason);
        let _ = timeout(
            self.inner.config.handshake_timeout,
            write_json_line(stream, &envelope),
        )
        .await;
        let _ = stream.shutdown().await;
    }

    /// The pairing critical section
    fn install_or_pair(
        &self,
        session_id: &str,
        role: Role,
        stream: RelayStream,
    ) -> PairOutcome {
        let mut pending = self.inner.pending.lock();

        match pending.remove(session_id) {
            Some(waiting) if waiting.role != role => {
                let (host, joiner) = if role == Role::Host {
                    (stream, waiting.stream)
                } else {
                    (waiting.stream, stream)
                };
                PairOutcome::Paired { host, joiner }
            }
            displaced => {
                if displaced.is_some() {
                    // Same role reconnected; the old socket closes on drop
                    debug!("Displacing stale {} for session {}", role, session_id);
                }
                pending.insert(
                    session_id.to_string(),
                    Pending {
                        stream,
                        role,
                        created_at: Instant::now(),
                    },
                );
                PairOutcome::Installed
            }
        }
    }

    /// Run both directional copies until each side has finished, under
    /// the max-session deadline. Each direction shuts the destination's
    /// write side when its source reaches EOF so the peer learns about
    /// it; no byte is inspected. Returns how the session terminated
    /// ([`RelayError::PeerClosed`] being the normal case).
    async fn splice(
        &self,
        session_id: &str,
        host: RelayStream,
        joiner: RelayStream,
    ) -> RelayError {
        let (mut host_r, mut host_w) = tokio::io::split(host);
        let (mut joiner_r, mut joiner_w) = tokio::io::split(joiner);

        let host_to_joiner = async {
            let copied = tokio::io::copy(&mut host_r, &mut joiner_w).await;
            let _ = joiner_w.shutdown().await;
            copied
        };
        let joiner_to_host = async {
            let copied = tokio::io::copy(&mut joiner_r, &mut host_w).await;
            let _ = host_w.shutdown().await;
            copied
        };

        let both = async { tokio::join!(host_to_joiner, joiner_to_host) };

        tokio::select! {
            _ = self.inner.cancel.cancelled() => {
                // Dropping the halves closes both sockets
                RelayError::Cancelled
            }
            outcome = timeout(self.inner.config.max_session, both) => match outcome {
                Err(_) => RelayError::SessionExpired,
                Ok((up, down)) => {
                    info!(
                        "Session {} ended: host->joiner {} bytes, joiner->host {} bytes",
                        session_id,
                        up.map(|n| n.to_string()).unwrap_or_else(|e| e.to_string()),
                        down.map(|n| n.to_string()).unwrap_or_else(|e| e.to_string()),
                    );
                    RelayError::PeerClosed
                }
            }
        }
    }

    /// Drop pending entries older than the pair timeout
    fn reap_stale(&self) {
        let horizon = self.inner.config.pair_timeout;
        let now = Instant::now();

        let reaped: Vec<(String, Role)> = {
            let mut pending = self.inner.pending.lock();
            let stale: Vec<String> = pending
                .iter()
                .filter(|(_, p)| now.duration_since(p.created_at) >= horizon)
                .map(|(id, _)| id.clone())
                .collect();
            stale
                .into_iter()
                .filter_map(|id| pending.remove(&id).map(|p| (id, p.role)))
                .collect()
        };

        for (session_id, role) in reaped {
            info!(
                "Session {}: {} (dropped parked {})",
                session_id,
                RelayError::PairTimeout,
                role
            );
            self.report_connected(&session_id, role, false);
        }
    }

    fn spawn_janitor(&self) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(server.inner.config.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = server.inner.cancel.cancelled() => break,
                    _ = ticker.tick() => server.reap_stale(),
                }
            }
        });
    }

    /// The relay is the only writer of the session liveness flags;
    /// reporting is best-effort and never blocks connection handling.
    fn report_connected(&self, session_id: &str, role: Role, connected: bool) {
        let Some(client) = self.inner.rendezvous.clone() else {
            return;
        };
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = client.set_connected(&session_id, role, connected).await {
                debug!(
                    "Liveness report for session {} ({}={}) failed: {}",
                    session_id, role, connected, e
                );
            }
        });
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::protocol::MAX_FRAME_LEN;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};

    fn test_config() -> RelayConfig {
        RelayConfig {
            secret: "relay-test-secret".to_string(),
            handshake_timeout: Duration::from_millis(500),
            pair_timeout: Duration::from_secs(5),
            ..RelayConfig::default()
        }
    }

    fn test_server(config: RelayConfig) -> RelayServer {
        RelayServer::new(config, CancellationToken::new())
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:9999".parse().unwrap()
    }

    async fn send_handshake<S: RelayIo>(
        stream: &mut S,
        session_id: &str,
        token: &str,
        role: Role,
    ) {
        let request = HandshakeRequest {
            session_id: session_id.to_string(),
            relay_token: token.to_string(),
            role,
        };
        write_json_line(stream, &request)
            .await
            .expect("Failed to send handshake");
    }

    async fn read_response<S: RelayIo>(stream: &mut BufReader<S>) -> HandshakeResponse {
        read_json_line(stream).await.expect("Failed to read response")
    }

    /// The pending install happens after the success envelope is
    /// written, so observers poll briefly
    async fn wait_for_pending(server: &RelayServer, expected: usize) {
        for _ in 0..100 {
            if server.pending_len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.pending_len(), expected);
    }

    #[tokio::test]
    async fn test_valid_handshake_accepted() {
        let server = test_server(test_config());
        let token = server
            .inner
            .signer
            .issue("s1", Role::Host, Duration::from_secs(60))
            .unwrap();

        let (mut client, relay_side) = tokio::io::duplex(MAX_FRAME_LEN as usize);
        let srv = server.clone();
        let task = tokio::spawn(async move { srv.handle_conn(relay_side, peer()).await });

        send_handshake(&mut client, "s1", &token, Role::Host).await;
        let mut client = BufReader::new(client);
        let response = read_response(&mut client).await;

        assert!(response.success);
        wait_for_pending(&server, 1).await;
        drop(client);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_forged_token_rejected() {
        let server = test_server(test_config());
        // Right shape, wrong MAC
        let other = Signer::new("attacker-secret");
        let token = other.issue("s1", Role::Joiner, Duration::from_secs(60)).unwrap();

        let (mut client, relay_side) = tokio::io::duplex(MAX_FRAME_LEN as usize);
        let srv = server.clone();
        tokio::spawn(async move { srv.handle_conn(relay_side, peer()).await });

        send_handshake(&mut client, "s1", &token, Role::Joiner).await;
        let mut client = BufReader::new(client);
        let response = read_response(&mut client).await;

        assert!(!response.success);
        assert!(response.error.is_some());
        assert_eq!(server.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_claims_must_match_assertion() {
        let server = test_server(test_config());
        // Valid token for s1/host used to claim s1/joiner
        let token = server
            .inner
            .signer
            .issue("s1", Role::Host, Duration::from_secs(60))
            .unwrap();

        let (mut client, relay_side) = tokio::io::duplex(MAX_FRAME_LEN as usize);
        let srv = server.clone();
        tokio::spawn(async move { srv.handle_conn(relay_side, peer()).await });

        send_handshake(&mut client, "s1", &token, Role::Joiner).await;
        let mut client = BufReader::new(client);
        let response = read_response(&mut client).await;

        assert!(!response.success);
        assert_eq!(server.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_malformed_handshake_rejected() {
        let server = test_server(test_config());

        let (mut client, relay_side) = tokio::io::duplex(MAX_FRAME_LEN as usize);
        let srv = server.clone();
        tokio::spawn(async move { srv.handle_conn(relay_side, peer()).await });

        client.write_all(b"not json at all\n").await.unwrap();
        let mut client = BufReader::new(client);
        let response = read_response(&mut client).await;

        assert!(!response.success);
        assert_eq!(server.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_handshake_stall_times_out() {
        let server = test_server(test_config());

        let (client, relay_side) = tokio::io::duplex(MAX_FRAME_LEN as usize);
        let srv = server.clone();
        let task = tokio::spawn(async move { srv.handle_conn(relay_side, peer()).await });

        // Write nothing; the relay must give up on its own
        let mut client = BufReader::new(client);
        let mut line = String::new();
        let n = tokio::time::timeout(Duration::from_secs(2), client.read_line(&mut line))
            .await
            .expect("relay did not close the stalled socket")
            .expect("read failed");

        if n > 0 {
            let response: HandshakeResponse = serde_json::from_str(line.trim_end()).unwrap();
            assert!(!response.success);
        }
        task.await.unwrap();
        assert_eq!(server.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_pair_and_splice_both_directions() {
        let server = test_server(test_config());
        let host_token = server
            .inner
            .signer
            .issue("s1", Role::Host, Duration::from_secs(60))
            .unwrap();
        let joiner_token = server
            .inner
            .signer
            .issue("s1", Role::Joiner, Duration::from_secs(60))
            .unwrap();

        let (mut host, relay_a) = tokio::io::duplex(MAX_FRAME_LEN as usize);
        let srv = server.clone();
        tokio::spawn(async move { srv.handle_conn(relay_a, peer()).await });
        send_handshake(&mut host, "s1", &host_token, Role::Host).await;
        let mut host = BufReader::new(host);
        assert!(read_response(&mut host).await.success);

        let (mut joiner, relay_b) = tokio::io::duplex(MAX_FRAME_LEN as usize);
        let srv = server.clone();
        tokio::spawn(async move { srv.handle_conn(relay_b, peer()).await });
        send_handshake(&mut joiner, "s1", &joiner_token, Role::Joiner).await;
        let mut joiner = BufReader::new(joiner);
        assert!(read_response(&mut joiner).await.success);

        // Host -> joiner
        host.get_mut().write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        joiner.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        // Joiner -> host
        joiner.get_mut().write_all(b"world").await.unwrap();
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");

        assert_eq!(server.pending_len(), 0);
        assert_eq!(server.sessions_spliced(), 1);
    }

    #[tokio::test]
    async fn test_same_role_displaces_previous() {
        let server = test_server(test_config());
        let token = server
            .inner
            .signer
            .issue("s1", Role::Host, Duration::from_secs(60))
            .unwrap();

        let (mut first, relay_a) = tokio::io::duplex(MAX_FRAME_LEN as usize);
        let srv = server.clone();
        tokio::spawn(async move { srv.handle_conn(relay_a, peer()).await });
        send_handshake(&mut first, "s1", &token, Role::Host).await;
        let mut first = BufReader::new(first);
        assert!(read_response(&mut first).await.success);

        let (mut second, relay_b) = tokio::io::duplex(MAX_FRAME_LEN as usize);
        let srv = server.clone();
        tokio::spawn(async move { srv.handle_conn(relay_b, peer()).await });
        send_handshake(&mut second, "s1", &token, Role::Host).await;
        let mut second = BufReader::new(second);
        assert!(read_response(&mut second).await.success);

        // Still exactly one pending entry, and the first socket is closed
        assert_eq!(server.pending_len(), 1);
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), first.read(&mut buf))
            .await
            .expect("displaced socket was not closed")
            .expect("read failed");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_reap_drops_stale_pending() {
        let config = RelayConfig {
            pair_timeout: Duration::from_millis(10),
            ..test_config()
        };
        let server = test_server(config);
        let token = server
            .inner
            .signer
            .issue("s1", Role::Host, Duration::from_secs(60))
            .unwrap();

        let (mut client, relay_side) = tokio::io::duplex(MAX_FRAME_LEN as usize);
        let srv = server.clone();
        tokio::spawn(async move { srv.handle_conn(relay_side, peer()).await });
        send_handshake(&mut client, "s1", &token, Role::Host).await;
        let mut client = BufReader::new(client);
        assert!(read_response(&mut client).await.success);
        wait_for_pending(&server, 1).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        server.reap_stale();

        assert_eq!(server.pending_len(), 0);
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.expect("read failed");
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_pairing_is_at_most_once() {
        // Three authenticated connections: exactly one pair splices and
        // the straggler parks
        let server = test_server(test_config());
        let signer = &server.inner.signer;
        let host_token = signer.issue("s1", Role::Host, Duration::from_secs(60)).unwrap();
        let joiner_token = signer
            .issue("s1", Role::Joiner, Duration::from_secs(60))
            .unwrap();

        let mut ends = Vec::new();
        for (token, role) in [
            (host_token.clone(), Role::Host),
            (joiner_token, Role::Joiner),
            (host_token, Role::Host),
        ] {
            let (mut client, relay_side) = tokio::io::duplex(MAX_FRAME_LEN as usize);
            let srv = server.clone();
            tokio::spawn(async move { srv.handle_conn(relay_side, peer()).await });
            send_handshake(&mut client, "s1", &token, role).await;
            let mut client = BufReader::new(client);
            assert!(read_response(&mut client).await.success);
            // Serialize arrivals so the outcome is deterministic
            tokio::time::sleep(Duration::from_millis(20)).await;
            ends.push(client);
        }

        assert_eq!(server.sessions_spliced(), 1);
        assert_eq!(server.pending_len(), 1);
    }
}
