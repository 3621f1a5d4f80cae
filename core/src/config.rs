//! Configuration for the three Passage services.
//!
//! Every timeout the protocol depends on lives here with an explicit
//! default; nothing in the hot paths hardcodes a duration.

use std::path::PathBuf;
use std::time::Duration;

/// Placeholder secret shipped in examples. Running with it is a
/// misconfiguration and triggers a startup warning.
pub const DEFAULT_SECRET: &str = "changeme-in-production";

/// Rendezvous HTTP service configuration
#[derive(Debug, Clone)]
pub struct RendezvousConfig {
    /// TCP port for the HTTP listener
    pub port: u16,
    /// Shared MAC secret for capability tokens
    pub secret: String,
    /// Session lifetime; also the TTL of minted relay tokens
    pub session_ttl: Duration,
    /// Session-create limit: sustained per minute / burst
    pub create_per_min: f64,
    pub create_burst: u32,
    /// Session-join limit: sustained per minute / burst
    pub join_per_min: f64,
    pub join_burst: u32,
    /// How often the expiry janitor runs
    pub sweep_interval: Duration,
    /// How often the rate-limit janitor runs
    pub limiter_sweep_interval: Duration,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            secret: DEFAULT_SECRET.to_string(),
            session_ttl: Duration::from_secs(15 * 60),
            create_per_min: 10.0,
            create_burst: 3,
            join_per_min: 30.0,
            join_burst: 10,
            sweep_interval: Duration::from_secs(60),
            limiter_sweep_interval: Duration::from_secs(3 * 60),
        }
    }
}

/// TLS material for the relay listener
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Relay TCP service configuration
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP port for the relay listener
    pub port: u16,
    /// Shared MAC secret, same as the rendezvous secret
    pub secret: String,
    /// Deadline for the single handshake frame
    pub handshake_timeout: Duration,
    /// How long a pending connection may wait for its peer.
    /// One named value; the janitor and logging both use it.
    pub pair_timeout: Duration,
    /// Hard ceiling on a spliced session
    pub max_session: Duration,
    /// How often the pending-table janitor runs
    pub reap_interval: Duration,
    /// Rendezvous base URL for the validate fallback and liveness
    /// reporting; `None` disables both
    pub rendezvous_url: Option<String>,
    /// Cert/key paths; `None` means plain TCP
    pub tls: Option<TlsPaths>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8443,
            secret: DEFAULT_SECRET.to_string(),
            handshake_timeout: Duration::from_secs(10),
            pair_timeout: Duration::from_secs(30),
            max_session: Duration::from_secs(4 * 60 * 60),
            reap_interval: Duration::from_secs(10),
            rendezvous_url: None,
            tls: None,
        }
    }
}

/// Peer-side bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Per-attempt dial timeout while probing for the local listener
    pub probe_timeout: Duration,
    /// Pause between probe rounds
    pub probe_interval: Duration,
    /// Overall deadline for the listener to appear
    pub wait_deadline: Duration,
    /// Dial timeout for the forwarding connection to the local target
    pub connect_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(500),
            probe_interval: Duration::from_millis(500),
            wait_deadline: Duration::from_secs(5 * 60),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Whether `secret` is still the shipped placeholder
pub fn is_default_secret(secret: &str) -> bool {
    secret == DEFAULT_SECRET
}
