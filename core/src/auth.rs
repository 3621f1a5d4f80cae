//! Capability tokens: MAC-sealed credentials binding a session, a role
//! and an expiry instant

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Domain-separation prefix mixed into every MAC.
/// Changing this invalidates all previously issued tokens.
const MAC_DOMAIN: &[u8] = b"passage.capability.v1:";

/// Token errors, distinguishable so callers can log the right thing
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Malformed token: {0}")]
    Malformed(String),
    #[error("Signature mismatch")]
    BadSignature,
    #[error("Token expired")]
    Expired,
}

/// The two sides of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Joiner,
}

impl Role {
    /// The role this one pairs with
    pub fn opposite(&self) -> Role {
        match self {
            Role::Host => Role::Joiner,
            Role::Joiner => Role::Host,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Host => "host",
            Role::Joiner => "joiner",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = TokenError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(Role::Host),
            "joiner" => Ok(Role::Joiner),
            other => Err(TokenError::Malformed(format!("unknown role {other:?}"))),
        }
    }
}

/// Claims carried by a capability token.
///
/// Serialization is canonical: field order is fixed by this struct and
/// `serde_json` emits no whitespace, so the same claims always produce
/// the same bytes and therefore the same MAC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Session id the capability refers to
    #[serde(rename = "sid")]
    pub session_id: String,
    /// Role the bearer may assert
    pub role: Role,
    /// Expiry as unix seconds
    #[serde(rename = "exp")]
    pub expires_at: i64,
}

impl Claims {
    /// Build claims expiring `ttl` from now
    pub fn new(session_id: impl Into<String>, role: Role, ttl: Duration) -> Self {
        Self {
            session_id: session_id.into(),
            role,
            expires_at: unix_now() + ttl.as_secs() as i64,
        }
    }

    /// Whether the expiry instant has passed
    pub fn is_expired(&self) -> bool {
        unix_now() > self.expires_at
    }
}

/// Signs and verifies capability tokens with a shared secret.
///
/// Token format: `b64url(claims-json) "." b64url(hmac-sha256)`, both
/// halves unpadded. The MAC covers a domain prefix plus the exact
/// serialized claims.
#[derive(Clone)]
pub struct Signer {
    secret: Vec<u8>,
}

impl Signer {
    /// Create a signer from the shared server secret
    pub fn new(secret: impl AsRef<[u8]>) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
        }
    }

    /// Seal claims into a token string
    pub fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        let payload = serde_json::to_vec(claims)
            .map_err(|e| TokenError::Malformed(format!("claims serialization: {e}")))?;
        let mac = self.mac(&payload);

        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(&payload),
            URL_SAFE_NO_PAD.encode(mac)
        ))
    }

    /// Verify a token and return its claims.
    ///
    /// Fails with [`TokenError::Malformed`] on encoding problems,
    /// [`TokenError::BadSignature`] on MAC mismatch (constant-time
    /// comparison) and [`TokenError::Expired`] when the expiry is in
    /// the past.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let (payload_b64, sig_b64) = token
            .split_once('.')
            .ok_or_else(|| TokenError::Malformed("expected two dot-separated parts".into()))?;
        if sig_b64.contains('.') {
            return Err(TokenError::Malformed("expected two dot-separated parts".into()));
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|e| TokenError::Malformed(format!("payload encoding: {e}")))?;
        let signature = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|e| TokenError::Malformed(format!("signature encoding: {e}")))?;

        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(MAC_DOMAIN);
        mac.update(&payload);
        // verify_slice compares in constant time
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::BadSignature)?;

        let claims: Claims = serde_json::from_slice(&payload)
            .map_err(|e| TokenError::Malformed(format!("claims: {e}")))?;

        if claims.is_expired() {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    /// Mint a relay capability for (session, role) valid for `ttl`
    pub fn issue(
        &self,
        session_id: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<String, TokenError> {
        self.sign(&Claims::new(session_id, role, ttl))
    }

    fn mac(&self, payload: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(MAC_DOMAIN);
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer").field("secret", &"[redacted]").finish()
    }
}

/// Current unix time in seconds
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

// ============================================================================
// TESTS
// ============================================================================
