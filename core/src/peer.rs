//! Peer-side session flows.
//!
//! Composes the rendezvous client, relay client and bridge into the two
//! flows a peer actually runs: share a local listener behind a code, or
//! redeem a code and couple the tunnel to a local listener. Front ends
//! (CLI, daemon) stay thin adapters over these.

use crate::auth::{unix_now, Role};
use crate::bridge::{Bridge, BridgeError, BridgeStats, BridgeTarget};
use crate::config::BridgeConfig;
use crate::relay::{RelayClient, RelayClientError, RelayStream};
use crate::rendezvous::{
    CreateSessionResponse, JoinSessionResponse, RendezvousClient, RendezvousClientError,
    SessionStatus,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Peer flow errors
#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Rendezvous(#[from] RendezvousClientError),
    #[error(transparent)]
    Relay(#[from] RelayClientError),
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("Session expired before the peer arrived")]
    Expired,
    #[error("The relay connection is already coupled to a bridge")]
    AlreadyForwarding,
    #[error("Cancelled")]
    Cancelled,
}

/// Everything a peer needs to know to run a flow
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Base URL of the rendezvous service
    pub rendezvous_url: String,
    /// `host:port` of the relay
    pub relay_addr: String,
    /// Wrap the relay connection in TLS
    pub relay_tls: bool,
    /// Bridge probing and forwarding knobs
    pub bridge: BridgeConfig,
    /// How often `wait_for_peer` polls session status
    pub status_poll_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            rendezvous_url: "http://localhost:8080".to_string(),
            relay_addr: "localhost:8443".to_string(),
            relay_tls: false,
            bridge: BridgeConfig::default(),
            status_poll_interval: Duration::from_secs(2),
        }
    }
}

impl PeerConfig {
    fn relay_client(&self) -> RelayClient {
        RelayClient::new(self.relay_addr.clone()).with_tls(self.relay_tls)
    }
}

/// The sharing side: owns a freshly created session and a parked relay
/// connection, waiting for a joiner
pub struct HostSession {
    config: PeerConfig,
    rendezvous: RendezvousClient,
    session: CreateSessionResponse,
    /// Taken when the bridge starts forwarding
    relay: Option<RelayStream>,
}

impl HostSession {
    /// Create a session and park on the relay as the host.
    ///
    /// Checks both services are reachable first so failures surface
    /// before a code is handed to a human.
    pub async fn open(config: PeerConfig) -> Result<Self, PeerError> {
        let rendezvous = RendezvousClient::new(&config.rendezvous_url);
        rendezvous.health().await?;

        let relay_client = config.relay_client();
        relay_client.check_reachable().await?;

        let session = rendezvous.create_session().await?;
        info!(
            "Created session {} with code {}",
            session.session_id, session.code
        );

        let relay = relay_client
            .connect(&session.session_id, &session.relay_token, Role::Host)
            .await?;

        Ok(Self {
            config,
            rendezvous,
            session,
            relay: Some(relay),
        })
    }

    /// The code to hand to the joining peer, canonical form
    pub fn code(&self) -> &str {
        &self.session.code
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Expiry as unix seconds
    pub fn expires_at(&self) -> i64 {
        self.session.expires_at
    }

    /// Current session status from the rendezvous
    pub async fn status(&self) -> Result<SessionStatus, PeerError> {
        Ok(self.rendezvous.session_status(&self.session.session_id).await?)
    }

    /// Poll until the joiner reaches the relay. Bounded by the session
    /// TTL; cancellable.
    pub async fn wait_for_peer(&self, cancel: &CancellationToken) -> Result<(), PeerError> {
        loop {
            if unix_now() >= self.session.expires_at {
                return Err(PeerError::Expired);
            }

            let status = self.status().await?;
            if status.join_connected {
                debug!("Joiner reached the relay for {}", self.session.session_id);
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PeerError::Cancelled),
                _ = tokio::time::sleep(self.config.status_poll_interval) => {}
            }
        }
    }

    /// A detached observer for the joiner's arrival, usable from
    /// another task while this session forwards
    pub fn watcher(&self) -> PeerWatcher {
        PeerWatcher {
            rendezvous: self.rendezvous.clone(),
            session_id: self.session.session_id.clone(),
            expires_at: self.session.expires_at,
            poll_interval: self.config.status_poll_interval,
        }
    }

    /// Couple the parked relay connection to the local target and pump
    /// until either side ends. Returns the bridge counters.
    pub async fn run_bridge(
        &mut self,
        target: BridgeTarget,
        cancel: CancellationToken,
    ) -> Result<Arc<BridgeStats>, PeerError> {
        let relay = self.relay.take().ok_or(PeerError::AlreadyForwarding)?;
        run_bridge(target, self.config.bridge.clone(), relay, cancel).await
    }

    /// Delete the session server-side with the host capability
    pub async fn close(&self) -> Result<(), PeerError> {
        self.rendezvous
            .delete_session(&self.session.session_id, &self.session.host_token)
            .await?;
        Ok(())
    }
}

/// Polls a session's liveness from outside the owning flow
pub struct PeerWatcher {
    rendezvous: RendezvousClient,
    session_id: String,
    expires_at: i64,
    poll_interval: Duration,
}

impl PeerWatcher {
    /// Wait for the joiner to reach the relay. Returns `false` on
    /// cancellation, expiry or a lookup failure.
    pub async fn wait(&self, cancel: &CancellationToken) -> bool {
        loop {
            if unix_now() >= self.expires_at {
                return false;
            }
            match self.rendezvous.session_status(&self.session_id).await {
                Ok(status) if status.join_connected => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

/// The joining side: redeemed a code and parked on the relay
pub struct JoinSession {
    config: PeerConfig,
    session: JoinSessionResponse,
    relay: Option<RelayStream>,
}

impl JoinSession {
    /// Redeem a code and connect to the relay as the joiner
    pub async fn open(code: &str, config: PeerConfig) -> Result<Self, PeerError> {
        let rendezvous = RendezvousClient::new(&config.rendezvous_url);
        rendezvous.health().await?;

        let session = rendezvous.join_session(code).await?;
        info!("Joined session {}", session.session_id);

        let relay = config
            .relay_client()
            .connect(&session.session_id, &session.relay_token, Role::Joiner)
            .await?;

        Ok(Self {
            config,
            session,
            relay: Some(relay),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Whether the host had already reached the relay at join time
    pub fn host_connected(&self) -> bool {
        self.session.host_connected
    }

    /// Couple the relay connection to the local target and pump until
    /// either side ends
    pub async fn run_bridge(
        &mut self,
        target: BridgeTarget,
        cancel: CancellationToken,
    ) -> Result<Arc<BridgeStats>, PeerError> {
        let relay = self.relay.take().ok_or(PeerError::AlreadyForwarding)?;
        run_bridge(target, self.config.bridge.clone(), relay, cancel).await
    }
}

/// Shared tail of both flows: wait for the local listener, then forward
async fn run_bridge(
    target: BridgeTarget,
    config: BridgeConfig,
    relay: RelayStream,
    cancel: CancellationToken,
) -> Result<Arc<BridgeStats>, PeerError> {
    let bridge = Bridge::new(target, config, cancel);
    bridge.wait_for_listener().await?;
    let stats = bridge.stats();
    bridge.forward(relay).await?;
    Ok(stats)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PeerConfig::default();
        assert_eq!(config.rendezvous_url, "http://localhost:8080");
        assert_eq!(config.relay_addr, "localhost:8443");
        assert!(!config.relay_tls);
        assert_eq!(config.status_poll_interval, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_open_fails_fast_when_rendezvous_down() {
        let config = PeerConfig {
            rendezvous_url: "http://127.0.0.1:1".to_string(),
            ..PeerConfig::default()
        };
        let result = HostSession::open(config).await;
        assert!(matches!(result, Err(PeerError::Rendezvous(_))));
    }

    #[tokio::test]
    async fn test_join_fails_fast_when_rendezvous_down() {
        let config = PeerConfig {
            rendezvous_url: "http://127.0.0.1:1".to_string(),
            ..PeerConfig::default()
        };
        let result = JoinSession::open("AB12-CD34-EF56", config).await;
        assert!(matches!(result, Err(PeerError::Rendezvous(_))));
    }
}
