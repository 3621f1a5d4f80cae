//! Bridge: couples a relay connection to a pre-existing local TCP
//! listener, starting as soon as that listener appears

use crate::config::BridgeConfig;
use crate::relay::RelayStream;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Copy-loop scratch buffer; bytes are never accumulated beyond this
const COPY_BUF: usize = 32 * 1024;

/// Bridge lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Init,
    WaitingForLocalListener,
    Ready,
    RelayAttached,
    Forwarding,
    Closed,
    Error,
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BridgeState::Init => "INIT",
            BridgeState::WaitingForLocalListener => "WAITING_FOR_LOCAL_LISTENER",
            BridgeState::Ready => "READY",
            BridgeState::RelayAttached => "RELAY_ATTACHED",
            BridgeState::Forwarding => "FORWARDING",
            BridgeState::Closed => "CLOSED",
            BridgeState::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Bridge errors
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("Timed out waiting for a local listener on {0}")]
    WaitTimeout(String),
    #[error("Failed to connect to local target {addr}: {reason}")]
    LocalConnect { addr: String, reason: String },
    #[error("Forwarding failed: {0}")]
    Forward(String),
    #[error("Bridge cancelled")]
    Cancelled,
}

/// Counters and observables, readable at any time without touching the
/// copy loops
#[derive(Debug, Default)]
pub struct BridgeStats {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    started_at: Mutex<Option<Instant>>,
    last_error: Mutex<Option<String>>,
}

impl BridgeStats {
    /// Bytes copied relay -> local
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Bytes copied local -> relay
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Instant forwarding began, if it did
    pub fn started_at(&self) -> Option<Instant> {
        *self.started_at.lock()
    }

    /// Last recorded failure, if any
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    fn record_error(&self, error: impl Into<String>) {
        *self.last_error.lock() = Some(error.into());
    }
}

/// Where the local listener is expected
#[derive(Debug, Clone)]
pub enum BridgeTarget {
    /// Fixed `host:port`
    Addr(String),
    /// Bare port: loopback is probed first, then every non-loopback
    /// non-link-local IPv4 interface address
    Port(u16),
}

impl BridgeTarget {
    /// Parse either a bare port or a `host:port` pair
    pub fn parse(input: &str) -> Option<Self> {
        if let Ok(port) = input.parse::<u16>() {
            return Some(BridgeTarget::Port(port));
        }
        let (host, port) = input.rsplit_once(':')?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return None;
        }
        Some(BridgeTarget::Addr(input.to_string()))
    }
}

impl fmt::Display for BridgeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeTarget::Addr(addr) => f.write_str(addr),
            BridgeTarget::Port(port) => write!(f, ":{port}"),
        }
    }
}

/// The peer-side state machine: wait for the local listener, then pump
/// bytes between it and the relay connection.
///
/// State is a watch channel, so observers see transitions without the
/// bridge ever invoking callbacks under a lock. `shutdown` is idempotent
/// and safe from any task.
pub struct Bridge {
    target: BridgeTarget,
    config: BridgeConfig,
    /// Probe winner; the forwarding target for the bridge's lifetime
    canonical: Mutex<Option<String>>,
    state_tx: watch::Sender<BridgeState>,
    state_rx: watch::Receiver<BridgeState>,
    stats: Arc<BridgeStats>,
    cancel: CancellationToken,
}

impl Bridge {
    pub fn new(target: BridgeTarget, config: BridgeConfig, cancel: CancellationToken) -> Self {
        let (state_tx, state_rx) = watch::channel(BridgeState::Init);
        Self {
            target,
            config,
            canonical: Mutex::new(None),
            state_tx,
            state_rx,
            stats: Arc::new(BridgeStats::default()),
            cancel,
        }
    }

    /// Current state, non-blocking
    pub fn state(&self) -> BridgeState {
        *self.state_rx.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<BridgeState> {
        self.state_tx.subscribe()
    }

    /// Shared counters
    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    /// The address forwarding will dial, once the probe has picked one
    pub fn canonical_target(&self) -> Option<String> {
        self.canonical.lock().clone()
    }

    /// Stop the bridge: probe loops end, both sockets close. Safe to
    /// call any number of times from any task.
    pub fn shutdown(&self) {
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            debug!("Bridge shutdown requested");
        }
    }

    /// Poll the target until a TCP dial succeeds, then remember that
    /// candidate as the canonical target.
    ///
    /// A single successful dial (immediately closed) is the evidence;
    /// resolution is the OS's problem.
    pub async fn wait_for_listener(&self) -> Result<String, BridgeError> {
        self.set_state(BridgeState::WaitingForLocalListener);
        let deadline = Instant::now() + self.config.wait_deadline;
        let candidates = self.candidates();
        info!(
            "Waiting for local listener on {} ({} candidate addresses)",
            self.target,
            candidates.len()
        );

        loop {
            if self.cancel.is_cancelled() {
                self.set_state(BridgeState::Closed);
                return Err(BridgeError::Cancelled);
            }

            for candidate in &candidates {
                if let Ok(Ok(probe)) =
                    timeout(self.config.probe_timeout, TcpStream::connect(candidate.as_str())).await
                {
                    drop(probe);
                    info!("Local listener found at {}", candidate);
                    *self.canonical.lock() = Some(candidate.clone());
                    self.set_state(BridgeState::Ready);
                    return Ok(candidate.clone());
                }
            }

            if Instant::now() >= deadline {
                let target = self.target.to_string();
                self.stats.record_error(format!("no listener on {target}"));
                self.set_state(BridgeState::Error);
                return Err(BridgeError::WaitTimeout(target));
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.set_state(BridgeState::Closed);
                    return Err(BridgeError::Cancelled);
                }
                _ = tokio::time::sleep(self.config.probe_interval) => {}
            }
        }
    }

    /// Couple an authenticated relay connection to the local listener
    /// and pump bytes both ways until either direction ends.
    ///
    /// Read-EOF on either side is a normal termination; I/O errors are
    /// recorded and returned. Both sockets are closed on every exit.
    pub async fn forward(&self, relay: RelayStream) -> Result<(), BridgeError> {
        self.set_state(BridgeState::RelayAttached);

        let addr = self
            .canonical
            .lock()
            .clone()
            .unwrap_or_else(|| self.default_candidate());

        let dialed = timeout(self.config.connect_timeout, TcpStream::connect(addr.as_str())).await;
        let local = match dialed {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                self.stats.record_error(format!("local connect: {e}"));
                self.set_state(BridgeState::Error);
                return Err(BridgeError::LocalConnect {
                    addr,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.stats.record_error("local connect timed out");
                self.set_state(BridgeState::Error);
                return Err(BridgeError::LocalConnect {
                    addr,
                    reason: "connect timed out".to_string(),
                });
            }
        };

        info!("Forwarding between relay and {}", addr);
        *self.stats.started_at.lock() = Some(Instant::now());
        self.set_state(BridgeState::Forwarding);

        let (relay_r, relay_w) = tokio::io::split(relay);
        let (local_r, local_w) = local.into_split();

        let inbound = pump(relay_r, local_w, &self.stats.bytes_in, &self.cancel);
        let outbound = pump(local_r, relay_w, &self.stats.bytes_out, &self.cancel);
        tokio::pin!(inbound, outbound);

        // First direction to end wins; dropping the other closes its
        // socket halves
        let result = tokio::select! {
            r = &mut inbound => r,
            r = &mut outbound => r,
        };

        self.set_state(BridgeState::Closed);

        match result {
            Ok(()) => {
                debug!(
                    "Bridge closed: {} bytes in, {} bytes out",
                    self.stats.bytes_in(),
                    self.stats.bytes_out()
                );
                Ok(())
            }
            Err(e) => {
                warn!("Bridge forwarding failed: {}", e);
                self.stats.record_error(e.to_string());
                Err(BridgeError::Forward(e.to_string()))
            }
        }
    }

    fn set_state(&self, state: BridgeState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Bridge state {} -> {}", previous, state);
        }
    }

    fn default_candidate(&self) -> String {
        match &self.target {
            BridgeTarget::Addr(addr) => addr.clone(),
            BridgeTarget::Port(port) => format!("127.0.0.1:{port}"),
        }
    }

    fn candidates(&self) -> Vec<String> {
        match &self.target {
            BridgeTarget::Addr(addr) => vec![addr.clone()],
            BridgeTarget::Port(port) => {
                let mut out = vec![format!("127.0.0.1:{port}")];
                if let Ok(interfaces) = get_if_addrs::get_if_addrs() {
                    for interface in interfaces {
                        if let std::net::IpAddr::V4(v4) = interface.ip() {
                            if !v4.is_loopback() && !v4.is_link_local() {
                                out.push(format!("{v4}:{port}"));
                            }
                        }
                    }
                }
                out
            }
        }
    }
}

/// One copy direction with a stack-local buffer. The counter advances
/// only after a successful write; read-EOF and cancellation are clean
/// exits.
async fn pump<R, W>(
    mut reader: R,
    mut writer: W,
    counter: &AtomicU64,
    cancel: &CancellationToken,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
            read = reader.read(&mut buf) => read?,
        };
        if n == 0 {
            let _ = writer.shutdown().await;
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

// ============================================================================
// TESTS
// ============================================================================
