//! Rendezvous: session and capability issuance over HTTP.
//!
//! The sole source of capability tokens. Peers call it to mint a session
//! (host side) or redeem a join code (joiner side); the relay calls it
//! to cross-check tokens and to report liveness.

pub mod client;
pub mod server;

pub use client::{RendezvousClient, RendezvousClientError};
pub use server::{RendezvousServer, RendezvousServerError};

use crate::auth::Role;
use serde::{Deserialize, Serialize};

/// Body of `POST /session/create` (200)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionResponse {
    pub session_id: String,
    /// Canonical join code, `XXXX-XXXX-XXXX`
    pub code: String,
    /// Bearer secret for later `DELETE /session/{id}`
    pub host_token: String,
    /// Capability for the relay handshake
    pub relay_token: String,
    /// Unix seconds
    pub expires_at: i64,
}

/// Body of `POST /session/join`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    pub code: String,
}

/// Body of `POST /session/join` (200)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSessionResponse {
    pub session_id: String,
    pub join_token: String,
    pub relay_token: String,
    /// Whether the host already reached the relay
    pub host_connected: bool,
}

/// Body of `GET /session/{id}/status` (200)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    pub session_id: String,
    pub host_connected: bool,
    pub join_connected: bool,
    pub expires_at: i64,
}

/// Body of `POST /session/{id}/connect`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub role: Role,
    pub connected: bool,
}

/// Body of `POST /internal/validate`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub token: String,
}

/// Body of `POST /internal/validate` (200)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateResponse {
    pub session_id: String,
    pub role: Role,
    pub valid: bool,
}

/// Error body every non-200 carries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
