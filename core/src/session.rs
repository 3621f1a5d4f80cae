//! Session store: authoritative records behind the rendezvous service

use crate::auth::Role;
use parking_lot::RwLock;
use rand::rngs::OsRng;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Alphabet for join codes: RFC 4648 base32, all uppercase, no 0/1/8/9
/// so codes survive being read aloud. 32 symbols = 5 bits each.
const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Join codes are three dash-separated quartets
const CODE_LEN: usize = 12;

/// How many redraws a code collision gets before we give up
const CODE_MINT_RETRIES: usize = 8;

/// Session store errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found or expired")]
    NotFound,
    #[error("Session already has a joiner")]
    AlreadyJoined,
    #[error("Capability mismatch")]
    Forbidden,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// One rendezvous attempt: a code, two bearer tokens and two liveness flags
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque unguessable id, hex-rendered (128 bits)
    pub id: String,
    /// Short human-typable code, canonical `XXXX-XXXX-XXXX`
    pub code: String,
    /// Bearer secret proving host ownership
    pub host_token: String,
    /// Bearer secret for the joiner, minted at most once
    pub join_token: Option<String>,
    pub host_connected: bool,
    pub join_connected: bool,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
}

impl Session {
    /// Expiry as unix seconds, the form every HTTP response uses
    pub fn expires_at_unix(&self) -> i64 {
        self.expires_at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }

    fn is_expired(&self, now: SystemTime) -> bool {
        now > self.expires_at
    }
}

struct StoreInner {
    /// Records keyed by session id
    sessions: HashMap<String, Session>,
    /// Canonical code -> session id
    by_code: HashMap<String, String>,
}

/// In-memory session store with TTL.
///
/// One lock guards both indices so deletion and expiry always remove a
/// record and its code entry together. Callers get clones; all mutation
/// goes through the narrow operations below.
pub struct SessionStore {
    inner: RwLock<StoreInner>,
    ttl: Duration,
}

impl SessionStore {
    /// Create a store whose sessions live for `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                sessions: HashMap::new(),
                by_code: HashMap::new(),
            }),
            ttl,
        }
    }

    /// Session TTL this store applies
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create a new session with a fresh id, code and host token
    pub fn create(&self) -> Result<Session, SessionError> {
        let mut inner = self.inner.write();

        let id = random_hex(16);
        let host_token = random_hex(32);

        let mut code = mint_code();
        let mut retries = 0;
        while inner.by_code.contains_key(&code) {
            retries += 1;
            if retries > CODE_MINT_RETRIES {
                return Err(SessionError::Internal("code space exhausted".into()));
            }
            code = mint_code();
        }

        let now = SystemTime::now();
        let session = Session {
            id: id.clone(),
            code: code.clone(),
            host_token,
            join_token: None,
            host_connected: false,
            join_connected: false,
            created_at: now,
            expires_at: now + self.ttl,
        };

        inner.by_code.insert(code, id.clone());
        inner.sessions.insert(id, session.clone());

        Ok(session)
    }

    /// Look up a live session by id
    pub fn get(&self, id: &str) -> Result<Session, SessionError> {
        let inner = self.inner.read();
        let session = inner.sessions.get(id).ok_or(SessionError::NotFound)?;
        if session.is_expired(SystemTime::now()) {
            return Err(SessionError::NotFound);
        }
        Ok(session.clone())
    }

    /// Look up a live session by join code (any accepted spelling)
    pub fn get_by_code(&self, code: &str) -> Result<Session, SessionError> {
        let code = normalize_code(code).ok_or(SessionError::NotFound)?;
        let inner = self.inner.read();
        let id = inner.by_code.get(&code).ok_or(SessionError::NotFound)?;
        let session = inner.sessions.get(id).ok_or(SessionError::NotFound)?;
        if session.is_expired(SystemTime::now()) {
            return Err(SessionError::NotFound);
        }
        Ok(session.clone())
    }

    /// Admit a joiner: mint and install the join token.
    ///
    /// Lookup, expiry check, conflict check and the mint all happen
    /// under one write lock, so a racing second join always fails with
    /// [`SessionError::AlreadyJoined`].
    pub fn join(&self, code: &str) -> Result<Session, SessionError> {
        let code = normalize_code(code).ok_or(SessionError::NotFound)?;
        let mut inner = self.inner.write();

        let id = inner.by_code.get(&code).ok_or(SessionError::NotFound)?.clone();
        let session = inner
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::NotFound)?;

        if session.is_expired(SystemTime::now()) {
            return Err(SessionError::NotFound);
        }
        if session.join_token.is_some() {
            return Err(SessionError::AlreadyJoined);
        }

        session.join_token = Some(random_hex(32));
        Ok(session.clone())
    }

    /// Update a liveness flag; the relay is the sole caller
    pub fn set_connected(&self, id: &str, role: Role, connected: bool) -> Result<(), SessionError> {
        let mut inner = self.inner.write();
        let session = inner.sessions.get_mut(id).ok_or(SessionError::NotFound)?;
        match role {
            Role::Host => session.host_connected = connected,
            Role::Joiner => session.join_connected = connected,
        }
        Ok(())
    }

    /// Check a bearer token against the stored one for `role`
    pub fn validate_bearer(&self, id: &str, token: &str, role: Role) -> bool {
        let inner = self.inner.read();
        let Some(session) = inner.sessions.get(id) else {
            return false;
        };
        if session.is_expired(SystemTime::now()) {
            return false;
        }
        match role {
            Role::Host => session.host_token == token,
            Role::Joiner => session.join_token.as_deref() == Some(token),
        }
    }

    /// Delete a session, gated on the host bearer token
    pub fn delete(&self, id: &str, host_token: &str) -> Result<(), SessionError> {
        let mut inner = self.inner.write();
        let session = inner.sessions.get(id).ok_or(SessionError::NotFound)?;
        if session.host_token != host_token {
            return Err(SessionError::Forbidden);
        }
        let code = session.code.clone();
        inner.sessions.remove(id);
        inner.by_code.remove(&code);
        Ok(())
    }

    /// Drop expired records and their code index entries
    pub fn sweep(&self) {
        let now = SystemTime::now();
        let mut inner = self.inner.write();

        let expired: Vec<(String, String)> = inner
            .sessions
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| (s.id.clone(), s.code.clone()))
            .collect();

        for (id, code) in &expired {
            inner.sessions.remove(id);
            inner.by_code.remove(code);
        }

        if !expired.is_empty() {
            debug!("Session sweep removed {} expired sessions", expired.len());
        }
    }

    /// Number of live (unswept) records
    pub fn len(&self) -> usize {
        self.inner.read().sessions.len()
    }

    /// Whether the store holds no records
    pub fn is_empty(&self) -> bool {
        self.inner.read().sessions.is_empty()
    }

    /// Spawn the periodic expiry janitor, stopping when `cancel` fires
    pub fn spawn_janitor(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let store = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => store.sweep(),
                }
            }
        });
    }
}

/// Canonicalize a user-typed join code.
///
/// Accepts any case and optional dashes; returns the dashed uppercase
/// form, or `None` when the input cannot be a code.
pub fn normalize_code(input: &str) -> Option<String> {
    let stripped: String = input
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();

    if stripped.len() != CODE_LEN || !stripped.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }

    Some(format!(
        "{}-{}-{}",
        &stripped[0..4],
        &stripped[4..8],
        &stripped[8..12]
    ))
}

fn mint_code() -> String {
    let mut raw = [0u8; CODE_LEN];
    OsRng.fill_bytes(&mut raw);

    let chars: String = raw
        .iter()
        .map(|b| CODE_ALPHABET[(b % 32) as usize] as char)
        .collect();

    format!("{}-{}-{}", &chars[0..4], &chars[4..8], &chars[8..12])
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

// ============================================================================
// TESTS
// ============================================================================
