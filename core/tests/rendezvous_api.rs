//! Rendezvous API integration tests over a real HTTP listener.
//!
//! Run with: cargo test --test rendezvous_api

use passage_core::rendezvous::{RendezvousClient, RendezvousClientError, RendezvousServer};
use passage_core::{Role, RendezvousConfig, Signer};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn test_config() -> RendezvousConfig {
    RendezvousConfig {
        secret: "integration-test-secret".to_string(),
        session_ttl: Duration::from_secs(60),
        // Generous so only the dedicated test trips the limiter
        create_per_min: 10_000.0,
        create_burst: 1_000,
        join_per_min: 10_000.0,
        join_burst: 1_000,
        ..RendezvousConfig::default()
    }
}

async fn start_server(config: RendezvousConfig) -> (RendezvousClient, CancellationToken) {
    let cancel = CancellationToken::new();
    let server = RendezvousServer::new(config, cancel.clone());
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (bound, serving) = server.bind(addr).expect("Failed to bind rendezvous");
    tokio::spawn(serving);

    (RendezvousClient::new(&format!("http://{bound}")), cancel)
}

#[tokio::test]
async fn test_health() {
    let (client, cancel) = start_server(test_config()).await;
    client.health().await.expect("health check failed");
    cancel.cancel();
}

#[tokio::test]
async fn test_create_then_status_matches() {
    let (client, cancel) = start_server(test_config()).await;

    let created = client.create_session().await.expect("create failed");
    assert!(!created.session_id.is_empty());
    assert!(!created.host_token.is_empty());
    assert!(!created.relay_token.is_empty());

    let status = client
        .session_status(&created.session_id)
        .await
        .expect("status failed");
    assert_eq!(status.session_id, created.session_id);
    assert!(!status.host_connected);
    assert!(!status.join_connected);
    assert_eq!(status.expires_at, created.expires_at);
    assert!(status.expires_at > passage_core::auth::unix_now());

    cancel.cancel();
}

#[tokio::test]
async fn test_relay_token_is_verifiable() {
    let (client, cancel) = start_server(test_config()).await;
    let created = client.create_session().await.expect("create failed");

    let signer = Signer::new("integration-test-secret");
    let claims = signer
        .verify(&created.relay_token)
        .expect("relay token did not verify");
    assert_eq!(claims.session_id, created.session_id);
    assert_eq!(claims.role, Role::Host);

    cancel.cancel();
}

#[tokio::test]
async fn test_join_happy_path_and_conflict() {
    let (client, cancel) = start_server(test_config()).await;
    let created = client.create_session().await.expect("create failed");

    let joined = client
        .join_session(&created.code)
        .await
        .expect("join failed");
    assert_eq!(joined.session_id, created.session_id);
    assert!(!joined.join_token.is_empty());

    let signer = Signer::new("integration-test-secret");
    let claims = signer.verify(&joined.relay_token).expect("token invalid");
    assert_eq!(claims.role, Role::Joiner);

    // A second joiner conflicts while the session is live
    let second = client.join_session(&created.code).await;
    assert!(matches!(second, Err(RendezvousClientError::AlreadyJoined)));

    cancel.cancel();
}

#[tokio::test]
async fn test_join_wrong_code_not_found() {
    let (client, cancel) = start_server(test_config()).await;
    let result = client.join_session("ZZ99-ZZ99-ZZ99").await;
    assert!(matches!(result, Err(RendezvousClientError::CodeNotFound)));
    cancel.cancel();
}

#[tokio::test]
async fn test_join_accepts_sloppy_spelling() {
    let (client, cancel) = start_server(test_config()).await;
    let created = client.create_session().await.expect("create failed");

    let sloppy = created.code.replace('-', "").to_lowercase();
    let joined = client.join_session(&sloppy).await.expect("join failed");
    assert_eq!(joined.session_id, created.session_id);

    cancel.cancel();
}

#[tokio::test]
async fn test_create_rate_limited() {
    let config = RendezvousConfig {
        secret: "integration-test-secret".to_string(),
        create_per_min: 10.0,
        create_burst: 3,
        ..RendezvousConfig::default()
    };
    let (client, cancel) = start_server(config).await;

    for _ in 0..3 {
        client.create_session().await.expect("create failed");
    }
    let limited = client.create_session().await;
    assert!(matches!(limited, Err(RendezvousClientError::RateLimited)));

    cancel.cancel();
}

#[tokio::test]
async fn test_delete_lifecycle() {
    let (client, cancel) = start_server(test_config()).await;
    let created = client.create_session().await.expect("create failed");

    // Wrong bearer is rejected
    let forbidden = client
        .delete_session(&created.session_id, "wrong-token")
        .await;
    assert!(matches!(forbidden, Err(RendezvousClientError::Unauthorized)));

    client
        .delete_session(&created.session_id, &created.host_token)
        .await
        .expect("delete failed");

    let gone = client.session_status(&created.session_id).await;
    assert!(matches!(gone, Err(RendezvousClientError::SessionNotFound)));

    // The code is dead too
    let rejoin = client.join_session(&created.code).await;
    assert!(matches!(rejoin, Err(RendezvousClientError::CodeNotFound)));

    cancel.cancel();
}

#[tokio::test]
async fn test_validate_endpoint() {
    let (client, cancel) = start_server(test_config()).await;
    let created = client.create_session().await.expect("create failed");

    let validated = client
        .validate(&created.relay_token)
        .await
        .expect("validate failed");
    assert_eq!(validated.session_id, created.session_id);
    assert_eq!(validated.role, Role::Host);
    assert!(validated.valid);

    let forged = client.validate("AAAA.BBBB").await;
    assert!(matches!(forged, Err(RendezvousClientError::Unauthorized)));

    cancel.cancel();
}

#[tokio::test]
async fn test_connect_updates_liveness() {
    let (client, cancel) = start_server(test_config()).await;
    let created = client.create_session().await.expect("create failed");

    client
        .set_connected(&created.session_id, Role::Host, true)
        .await
        .expect("connect failed");

    let status = client
        .session_status(&created.session_id)
        .await
        .expect("status failed");
    assert!(status.host_connected);
    assert!(!status.join_connected);

    let joined = client.join_session(&created.code).await.expect("join failed");
    assert!(joined.host_connected);

    cancel.cancel();
}

#[tokio::test]
async fn test_expired_session_vanishes() {
    let config = RendezvousConfig {
        session_ttl: Duration::from_millis(200),
        ..test_config()
    };
    let (client, cancel) = start_server(config).await;
    let created = client.create_session().await.expect("create failed");

    tokio::time::sleep(Duration::from_millis(400)).await;

    let status = client.session_status(&created.session_id).await;
    assert!(matches!(status, Err(RendezvousClientError::SessionNotFound)));
    let join = client.join_session(&created.code).await;
    assert!(matches!(join, Err(RendezvousClientError::CodeNotFound)));

    cancel.cancel();
}
