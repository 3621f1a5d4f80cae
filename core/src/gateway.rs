//! Gateway port-mapping contract.
//!
//! An optional external capability a peer may invoke at startup to open
//! router port mappings. Only the interface lives here; every failure
//! is non-fatal and the core carries on without a mapping.

use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("No gateway available")]
    Unavailable,
    #[error("Gateway refused the mapping: {0}")]
    Refused(String),
    #[error("Gateway error: {0}")]
    Other(String),
}

/// Mapping protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayProtocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for GatewayProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            GatewayProtocol::Tcp => "TCP",
            GatewayProtocol::Udp => "UDP",
        })
    }
}

/// One requested port mapping
#[derive(Debug, Clone)]
pub struct PortMapping {
    pub protocol: GatewayProtocol,
    pub external_port: u16,
    pub internal_port: u16,
    /// Defaults to the host's primary local address when `None`
    pub internal_address: Option<IpAddr>,
    pub description: String,
    /// `None` means permanent until closed
    pub ttl: Option<Duration>,
}

/// The interface the core invokes on whatever mapping capability the
/// host application provides (UPnP, NAT-PMP, a router API, nothing)
pub trait Gateway: Send + Sync {
    /// Open a mapping; idempotent on repeat calls for the same ports
    fn open(&self, mapping: &PortMapping) -> Result<(), GatewayError>;

    /// Close a previously opened mapping
    fn close(&self, protocol: GatewayProtocol, external_port: u16) -> Result<(), GatewayError>;

    /// The router's external address, when the gateway knows it
    fn external_address(&self) -> Result<IpAddr, GatewayError>;
}

/// The always-absent gateway: every operation reports unavailability.
/// Callers treat that the same as any other gateway failure.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledGateway;

impl Gateway for DisabledGateway {
    fn open(&self, _mapping: &PortMapping) -> Result<(), GatewayError> {
        Err(GatewayError::Unavailable)
    }

    fn close(&self, _protocol: GatewayProtocol, _external_port: u16) -> Result<(), GatewayError> {
        Err(GatewayError::Unavailable)
    }

    fn external_address(&self) -> Result<IpAddr, GatewayError> {
        Err(GatewayError::Unavailable)
    }
}

/// Best-effort local address discovery: let the OS pick the outbound
/// interface for a public destination and read the chosen source
/// address. No packet is sent.
pub fn local_ip() -> Option<IpAddr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let addr = socket.local_addr().ok()?;
    Some(addr.ip())
}
