//! Rendezvous HTTP service: thin warp adapters over the signer,
//! limiter and session store

use super::{
    ConnectRequest, CreateSessionResponse, ErrorBody, JoinRequest, JoinSessionResponse,
    SessionStatus, ValidateRequest, ValidateResponse,
};
use crate::auth::{Role, Signer};
use crate::config::{is_default_secret, RendezvousConfig};
use crate::ratelimit::OpLimiter;
use crate::session::{SessionError, SessionStore};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::reply::{Json, WithStatus};
use warp::Filter;

#[derive(Debug, Error)]
pub enum RendezvousServerError {
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },
}

/// Shared handler state
struct State {
    store: Arc<SessionStore>,
    signer: Signer,
    limiter: Arc<OpLimiter>,
    token_ttl: Duration,
}

/// The rendezvous HTTP service.
///
/// Construction spawns the store and limiter janitors; `run` serves
/// until the cancellation token fires, then shuts down gracefully.
pub struct RendezvousServer {
    state: Arc<State>,
    config: RendezvousConfig,
    cancel: CancellationToken,
}

impl RendezvousServer {
    pub fn new(config: RendezvousConfig, cancel: CancellationToken) -> Self {
        if is_default_secret(&config.secret) {
            warn!("Rendezvous is using the default secret; set a real one in production");
        }

        let store = Arc::new(SessionStore::new(config.session_ttl));
        store.clone().spawn_janitor(config.sweep_interval, cancel.clone());

        let limiter = Arc::new(OpLimiter::new(
            config.create_per_min,
            config.create_burst,
            config.join_per_min,
            config.join_burst,
        ));
        limiter
            .clone()
            .spawn_janitor(config.limiter_sweep_interval, cancel.clone());

        let state = Arc::new(State {
            store,
            signer: Signer::new(&config.secret),
            limiter,
            token_ttl: config.session_ttl,
        });

        Self {
            state,
            config,
            cancel,
        }
    }

    /// Serve on the configured port until cancellation
    pub async fn run(&self) -> Result<(), RendezvousServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.port));
        let (bound, serving) = self.bind(addr)?;
        info!("Rendezvous listening on {}", bound);
        serving.await;
        info!("Rendezvous shut down");
        Ok(())
    }

    /// Bind an explicit address (port 0 works for tests) and return the
    /// bound address plus the serve future
    pub fn bind(
        &self,
        addr: SocketAddr,
    ) -> Result<(SocketAddr, impl std::future::Future<Output = ()> + Send), RendezvousServerError>
    {
        let cancel = self.cancel.clone();
        warp::serve(routes(self.state.clone()))
            .try_bind_with_graceful_shutdown(addr, async move { cancel.cancelled().await })
            .map_err(|e| RendezvousServerError::Bind {
                addr,
                reason: e.to_string(),
            })
    }
}

/// The complete route set with permissive CORS.
///
/// Methods are matched per path, so a mismatched method falls through to
/// warp's rejection handling and surfaces as 405.
fn routes(
    state: Arc<State>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let state = warp::any().map(move || state.clone());

    let health = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| {
            warp::reply::with_status(
                warp::reply::json(&serde_json::json!({"status": "ok"})),
                StatusCode::OK,
            )
        });

    let create = warp::path!("session" / "create")
        .and(warp::post())
        .and(client_ip())
        .and(state.clone())
        .and_then(handle_create);

    let join = warp::path!("session" / "join")
        .and(warp::post())
        .and(client_ip())
        .and(state.clone())
        .and(warp::body::content_length_limit(16 * 1024))
        .and(warp::body::json())
        .and_then(handle_join);

    let status = warp::path!("session" / String / "status")
        .and(warp::get())
        .and(state.clone())
        .and_then(handle_status);

    let connect = warp::path!("session" / String / "connect")
        .and(warp::post())
        .and(state.clone())
        .and(warp::body::content_length_limit(16 * 1024))
        .and(warp::body::json())
        .and_then(handle_connect);

    let delete = warp::path!("session" / String)
        .and(warp::delete())
        .and(warp::header::optional::<String>("authorization"))
        .and(state.clone())
        .and_then(handle_delete);

    let validate = warp::path!("internal" / "validate")
        .and(warp::post())
        .and(state)
        .and(warp::body::content_length_limit(16 * 1024))
        .and(warp::body::json())
        .and_then(handle_validate);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_methods(vec!["GET", "POST", "DELETE", "OPTIONS"])
        .allow_headers(vec!["Content-Type", "Authorization"]);

    health
        .or(create)
        .or(join)
        .or(status)
        .or(connect)
        .or(delete)
        .or(validate)
        .with(cors)
}

/// Caller identity for rate limiting: first X-Forwarded-For entry, then
/// X-Real-IP, then the socket address
fn client_ip() -> impl Filter<Extract = (String,), Error = warp::Rejection> + Clone {
    warp::header::optional::<String>("x-forwarded-for")
        .and(warp::header::optional::<String>("x-real-ip"))
        .and(warp::addr::remote())
        .map(
            |forwarded: Option<String>, real_ip: Option<String>, remote: Option<SocketAddr>| {
                if let Some(forwarded) = forwarded {
                    if let Some(first) = forwarded.split(',').next() {
                        let first = first.trim();
                        if !first.is_empty() {
                            return first.to_string();
                        }
                    }
                }
                if let Some(real_ip) = real_ip {
                    return real_ip;
                }
                remote
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_else(|| "unknown".to_string())
            },
        )
}

fn json_error(status: StatusCode, message: &str) -> WithStatus<Json> {
    warp::reply::with_status(
        warp::reply::json(&ErrorBody {
            error: message.to_string(),
        }),
        status,
    )
}

async fn handle_create(ip: String, state: Arc<State>) -> Result<WithStatus<Json>, Infallible> {
    if !state.limiter.allow_create(&ip) {
        return Ok(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded",
        ));
    }

    let session = match state.store.create() {
        Ok(session) => session,
        Err(e) => {
            warn!("Failed to create session: {}", e);
            return Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to create session",
            ));
        }
    };

    let relay_token = match state
        .signer
        .issue(&session.id, Role::Host, state.token_ttl)
    {
        Ok(token) => token,
        Err(e) => {
            warn!("Failed to issue relay token: {}", e);
            return Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to create token",
            ));
        }
    };

    info!("Created session {} with code {}", session.id, session.code);
    let expires_at = session.expires_at_unix();

    Ok(warp::reply::with_status(
        warp::reply::json(&CreateSessionResponse {
            session_id: session.id,
            code: session.code,
            host_token: session.host_token,
            relay_token,
            expires_at,
        }),
        StatusCode::OK,
    ))
}

async fn handle_join(
    ip: String,
    state: Arc<State>,
    request: JoinRequest,
) -> Result<WithStatus<Json>, Infallible> {
    if !state.limiter.allow_join(&ip) {
        return Ok(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded",
        ));
    }

    let session = match state.store.join(&request.code) {
        Ok(session) => session,
        Err(SessionError::AlreadyJoined) => {
            return Ok(json_error(
                StatusCode::CONFLICT,
                "Session already has a joiner",
            ));
        }
        Err(SessionError::NotFound) => {
            return Ok(json_error(StatusCode::NOT_FOUND, "Invalid or expired code"));
        }
        Err(e) => {
            warn!("Join failed: {}", e);
            return Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to join session",
            ));
        }
    };

    let relay_token = match state
        .signer
        .issue(&session.id, Role::Joiner, state.token_ttl)
    {
        Ok(token) => token,
        Err(e) => {
            warn!("Failed to issue relay token: {}", e);
            return Ok(json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to create token",
            ));
        }
    };

    // join() always installs the token before returning the record
    let join_token = session.join_token.clone().unwrap_or_default();

    info!("Joiner admitted to session {}", session.id);

    Ok(warp::reply::with_status(
        warp::reply::json(&JoinSessionResponse {
            session_id: session.id,
            join_token,
            relay_token,
            host_connected: session.host_connected,
        }),
        StatusCode::OK,
    ))
}

async fn handle_status(id: String, state: Arc<State>) -> Result<WithStatus<Json>, Infallible> {
    match state.store.get(&id) {
        Ok(session) => {
            let expires_at = session.expires_at_unix();
            Ok(warp::reply::with_status(
            warp::reply::json(&SessionStatus {
                session_id: session.id,
                host_connected: session.host_connected,
                join_connected: session.join_connected,
                expires_at,
            }),
            StatusCode::OK,
            ))
        }
        Err(_) => Ok(json_error(StatusCode::NOT_FOUND, "Session not found")),
    }
}

async fn handle_connect(
    id: String,
    state: Arc<State>,
    request: ConnectRequest,
) -> Result<WithStatus<Json>, Infallible> {
    match state
        .store
        .set_connected(&id, request.role, request.connected)
    {
        Ok(()) => Ok(warp::reply::with_status(
            warp::reply::json(&serde_json::json!({})),
            StatusCode::OK,
        )),
        Err(_) => Ok(json_error(StatusCode::NOT_FOUND, "Session not found")),
    }
}

async fn handle_delete(
    id: String,
    authorization: Option<String>,
    state: Arc<State>,
) -> Result<WithStatus<Json>, Infallible> {
    let Some(authorization) = authorization else {
        return Ok(json_error(
            StatusCode::UNAUTHORIZED,
            "Authorization required",
        ));
    };
    let token = authorization
        .strip_prefix("Bearer ")
        .unwrap_or(authorization.as_str());

    match state.store.delete(&id, token) {
        Ok(()) => {
            info!("Deleted session {}", id);
            Ok(warp::reply::with_status(
                warp::reply::json(&serde_json::json!({})),
                StatusCode::OK,
            ))
        }
        // An unknown session and a bad token answer alike, so a DELETE
        // cannot probe for session existence
        Err(_) => Ok(json_error(StatusCode::FORBIDDEN, "Invalid token")),
    }
}

async fn handle_validate(
    state: Arc<State>,
    request: ValidateRequest,
) -> Result<WithStatus<Json>, Infallible> {
    let claims = match state.signer.verify(&request.token) {
        Ok(claims) => claims,
        Err(_) => return Ok(json_error(StatusCode::UNAUTHORIZED, "Invalid token")),
    };

    if state.store.get(&claims.session_id).is_err() {
        return Ok(json_error(StatusCode::NOT_FOUND, "Session not found"));
    }

    Ok(warp::reply::with_status(
        warp::reply::json(&ValidateResponse {
            session_id: claims.session_id,
            role: claims.role,
            valid: true,
        }),
        StatusCode::OK,
    ))
}

// ============================================================================
// TESTS
// ============================================================================
