//! Relay: authenticated two-sided rendezvous-by-id with byte splicing.
//!
//! A peer opens one TCP connection, authenticates with a single
//! newline-terminated JSON frame carrying a capability token, and parks
//! until the opposite role arrives for the same session. The relay then
//! splices the two sockets into one full-duplex pipe and never looks at
//! another byte.

pub mod client;
pub mod protocol;
pub mod server;
pub mod tls;

pub use client::{RelayClient, RelayClientError};
pub use protocol::{HandshakeRequest, HandshakeResponse, ProtocolError, MAX_FRAME_LEN};
pub use server::{RelayError, RelayServer};

use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream the relay can splice: plain TCP or TLS-wrapped.
/// The wrapping is invisible to pairing, splicing and the bridge.
pub trait RelayIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RelayIo for T {}

/// An owned, already-authenticated relay connection
pub type RelayStream = Box<dyn RelayIo>;
