//! Passage core: the networking substrate for NAT-to-NAT TCP tunnels.
//!
//! Three cooperating services, composed leaves-first:
//!
//! - [`auth`]: MAC-sealed capability tokens (no I/O)
//! - [`ratelimit`]: per-identity token buckets with a sweep janitor
//! - [`session`]: the authoritative session store behind the rendezvous
//! - [`rendezvous`]: the HTTP surface minting codes and capabilities
//! - [`relay`]: the TCP service pairing two authenticated peers and
//!   splicing their sockets into one byte pipe
//! - [`bridge`]: the peer-side state machine coupling a relay
//!   connection to a local TCP listener
//! - [`peer`]: the host/join flows composing the three above
//! - [`gateway`]: the port-mapping collaborator contract
//!
//! One peer creates a session and parks on the relay; the other redeems
//! the short code, dials in, and the relay splices them. Each peer runs
//! a bridge against its own local listener. The relay never inspects a
//! byte after the handshake; peers may layer their own crypto on top.

pub mod auth;
pub mod bridge;
pub mod config;
pub mod gateway;
pub mod peer;
pub mod ratelimit;
pub mod relay;
pub mod rendezvous;
pub mod session;

pub use auth::{Claims, Role, Signer, TokenError};
pub use bridge::{Bridge, BridgeError, BridgeState, BridgeStats, BridgeTarget};
pub use config::{BridgeConfig, RelayConfig, RendezvousConfig, TlsPaths, DEFAULT_SECRET};
pub use gateway::{DisabledGateway, Gateway, GatewayError, GatewayProtocol, PortMapping};
pub use peer::{HostSession, JoinSession, PeerConfig, PeerError};
pub use ratelimit::{OpLimiter, RateLimiter};
pub use relay::{RelayClient, RelayClientError, RelayError, RelayServer, RelayStream};
pub use rendezvous::{
    RendezvousClient, RendezvousClientError, RendezvousServer, RendezvousServerError,
};
pub use session::{Session, SessionError, SessionStore};
