//! Rendezvous HTTP client used by peers and by the relay

use super::{
    ConnectRequest, CreateSessionResponse, JoinSessionResponse, SessionStatus, ValidateRequest,
    ValidateResponse,
};
use crate::auth::Role;
use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Rendezvous client errors; the interesting HTTP statuses get their
/// own variants so callers can branch without string matching
#[derive(Debug, Error)]
pub enum RendezvousClientError {
    #[error("Invalid or expired join code")]
    CodeNotFound,
    #[error("Session already has a joiner")]
    AlreadyJoined,
    #[error("Rate limit exceeded, wait and try again")]
    RateLimited,
    #[error("Session not found")]
    SessionNotFound,
    #[error("Token rejected")]
    Unauthorized,
    #[error("Rendezvous request failed: {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("Rendezvous unreachable: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Typed client for the rendezvous API
#[derive(Debug, Clone)]
pub struct RendezvousClient {
    base: String,
    http: reqwest::Client,
}

impl RendezvousClient {
    /// Create a client for `base` (scheme + host + port, no trailing
    /// slash required)
    pub fn new(base: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();

        Self {
            base: base.trim_end_matches('/').to_string(),
            http,
        }
    }

    /// `GET /health`
    pub async fn health(&self) -> Result<(), RendezvousClientError> {
        let response = self.http.get(self.url("/health")).send().await?;
        expect_ok(response).await?;
        Ok(())
    }

    /// `POST /session/create`
    pub async fn create_session(&self) -> Result<CreateSessionResponse, RendezvousClientError> {
        let response = self.http.post(self.url("/session/create")).send().await?;
        let response = expect_ok(response).await?;
        Ok(response.json().await?)
    }

    /// `POST /session/join`
    pub async fn join_session(
        &self,
        code: &str,
    ) -> Result<JoinSessionResponse, RendezvousClientError> {
        let response = self
            .http
            .post(self.url("/session/join"))
            .json(&serde_json::json!({ "code": code }))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(RendezvousClientError::CodeNotFound),
            StatusCode::CONFLICT => Err(RendezvousClientError::AlreadyJoined),
            _ => {
                let response = expect_ok(response).await?;
                Ok(response.json().await?)
            }
        }
    }

    /// `GET /session/{id}/status`
    pub async fn session_status(&self, id: &str) -> Result<SessionStatus, RendezvousClientError> {
        let response = self
            .http
            .get(self.url(&format!("/session/{id}/status")))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RendezvousClientError::SessionNotFound);
        }
        let response = expect_ok(response).await?;
        Ok(response.json().await?)
    }

    /// `POST /session/{id}/connect`
    pub async fn set_connected(
        &self,
        id: &str,
        role: Role,
        connected: bool,
    ) -> Result<(), RendezvousClientError> {
        let response = self
            .http
            .post(self.url(&format!("/session/{id}/connect")))
            .json(&ConnectRequest { role, connected })
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(RendezvousClientError::SessionNotFound);
        }
        expect_ok(response).await?;
        Ok(())
    }

    /// `DELETE /session/{id}` with the host bearer token
    pub async fn delete_session(
        &self,
        id: &str,
        host_token: &str,
    ) -> Result<(), RendezvousClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/session/{id}")))
            .bearer_auth(host_token)
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RendezvousClientError::Unauthorized)
            }
            _ => {
                expect_ok(response).await?;
                Ok(())
            }
        }
    }

    /// `POST /internal/validate`
    pub async fn validate(&self, token: &str) -> Result<ValidateResponse, RendezvousClientError> {
        let response = self
            .http
            .post(self.url("/internal/validate"))
            .json(&ValidateRequest {
                token: token.to_string(),
            })
            .send()
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(RendezvousClientError::Unauthorized),
            StatusCode::NOT_FOUND => Err(RendezvousClientError::SessionNotFound),
            _ => {
                let response = expect_ok(response).await?;
                Ok(response.json().await?)
            }
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

async fn expect_ok(
    response: reqwest::Response,
) -> Result<reqwest::Response, RendezvousClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(RendezvousClientError::RateLimited);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RendezvousClientError::Status { status, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_normalization() {
        let client = RendezvousClient::new("http://localhost:8080/");
        assert_eq!(client.url("/health"), "http://localhost:8080/health");

        let client = RendezvousClient::new("http://localhost:8080");
        assert_eq!(client.url("/health"), "http://localhost:8080/health");
    }

    #[tokio::test]
    async fn test_unreachable_is_transport_error() {
        let client = RendezvousClient::new("http://127.0.0.1:1");
        let result = client.health().await;
        assert!(matches!(result, Err(RendezvousClientError::Transport(_))));
    }
}
