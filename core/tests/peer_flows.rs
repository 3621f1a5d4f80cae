//! Host/join flow integration tests over a full local stack.
//!
//! Run with: cargo test --test peer_flows

use passage_core::bridge::BridgeTarget;
use passage_core::peer::{HostSession, JoinSession, PeerConfig, PeerError};
use passage_core::relay::RelayServer;
use passage_core::rendezvous::{RendezvousClientError, RendezvousServer};
use passage_core::{BridgeConfig, RelayConfig, RendezvousConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "peer-flow-secret";

async fn start_stack(cancel: &CancellationToken) -> PeerConfig {
    let rendezvous_config = RendezvousConfig {
        secret: SECRET.to_string(),
        session_ttl: Duration::from_secs(60),
        create_per_min: 10_000.0,
        create_burst: 1_000,
        join_per_min: 10_000.0,
        join_burst: 1_000,
        ..RendezvousConfig::default()
    };
    let rendezvous_server = RendezvousServer::new(rendezvous_config, cancel.clone());
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (http_addr, serving) = rendezvous_server.bind(addr).expect("bind rendezvous");
    tokio::spawn(serving);
    let rendezvous_url = format!("http://{http_addr}");

    let relay_config = RelayConfig {
        secret: SECRET.to_string(),
        rendezvous_url: Some(rendezvous_url.clone()),
        ..RelayConfig::default()
    };
    let relay_server = RelayServer::new(relay_config, cancel.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
    let relay_addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let _ = relay_server.run(listener).await;
    });

    PeerConfig {
        rendezvous_url,
        relay_addr,
        relay_tls: false,
        bridge: BridgeConfig {
            probe_timeout: Duration::from_millis(200),
            probe_interval: Duration::from_millis(100),
            wait_deadline: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(2),
        },
        status_poll_interval: Duration::from_millis(100),
    }
}

/// A local service that answers `reply` whenever it reads `expect`,
/// surviving the bridge's probe connections
async fn echo_service(expect: &'static [u8], reply: &'static [u8]) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; expect.len()];
                if stream.read_exact(&mut buf).await.is_ok() {
                    assert_eq!(buf, expect);
                    let _ = stream.write_all(reply).await;
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn test_host_and_join_flows_end_to_end() {
    let cancel = CancellationToken::new();
    let config = start_stack(&cancel).await;

    // Host side: a service that answers "pong!" to "ping!"
    let host_service = echo_service(b"ping!", b"pong!").await;
    let mut host = HostSession::open(config.clone())
        .await
        .expect("host open failed");
    assert_eq!(host.code().len(), 14);
    assert!(host.expires_at() > 0);

    let code = host.code().to_string();
    let watcher = host.watcher();

    let host_cancel = cancel.child_token();
    let host_target = BridgeTarget::Addr(host_service);
    let host_task =
        tokio::spawn(async move { host.run_bridge(host_target, host_cancel).await });

    // Joiner redeems the code and parks on the relay, which splices
    let mut joiner = JoinSession::open(&code, config.clone())
        .await
        .expect("join failed");
    assert!(!joiner.session_id().is_empty());

    // The watcher observes the joiner's arrival via the liveness flags
    let seen = tokio::time::timeout(Duration::from_secs(5), watcher.wait(&cancel))
        .await
        .expect("watcher timed out");
    assert!(seen, "watcher never saw the joiner connect");

    // The joiner's local app sits behind its entry listener
    let joiner_entry = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let entry_addr = joiner_entry.local_addr().unwrap().to_string();
    let app = tokio::spawn(async move {
        loop {
            let (mut stream, _) = joiner_entry.accept().await.unwrap();
            // The first connection may be the bridge's probe
            if stream.write_all(b"ping!").await.is_err() {
                continue;
            }
            let mut buf = [0u8; 5];
            match stream.read_exact(&mut buf).await {
                Ok(_) => return buf,
                Err(_) => continue,
            }
        }
    });

    let joiner_cancel = cancel.child_token();
    let joiner_task = tokio::spawn(async move {
        joiner
            .run_bridge(BridgeTarget::Addr(entry_addr), joiner_cancel)
            .await
    });

    let answer = tokio::time::timeout(Duration::from_secs(5), app)
        .await
        .expect("tunnel transfer timed out")
        .unwrap();
    assert_eq!(&answer, b"pong!");

    cancel.cancel();
    let _ = host_task.await;
    let _ = joiner_task.await;
}

#[tokio::test]
async fn test_join_with_wrong_code() {
    let cancel = CancellationToken::new();
    let config = start_stack(&cancel).await;

    let result = JoinSession::open("ZZ99-ZZ99-ZZ99", config).await;
    assert!(matches!(
        result,
        Err(PeerError::Rendezvous(RendezvousClientError::CodeNotFound))
    ));

    cancel.cancel();
}

#[tokio::test]
async fn test_second_join_conflicts() {
    let cancel = CancellationToken::new();
    let config = start_stack(&cancel).await;

    let host = HostSession::open(config.clone())
        .await
        .expect("host open failed");
    let code = host.code().to_string();

    let _first = JoinSession::open(&code, config.clone())
        .await
        .expect("first join failed");
    let second = JoinSession::open(&code, config).await;
    assert!(matches!(
        second,
        Err(PeerError::Rendezvous(RendezvousClientError::AlreadyJoined))
    ));

    // The joiner is parked on the relay, so the host-side wait resolves
    tokio::time::timeout(Duration::from_secs(5), host.wait_for_peer(&cancel))
        .await
        .expect("wait_for_peer timed out")
        .expect("wait_for_peer failed");

    cancel.cancel();
}

#[tokio::test]
async fn test_host_close_retires_the_code() {
    let cancel = CancellationToken::new();
    let config = start_stack(&cancel).await;

    let host = HostSession::open(config.clone())
        .await
        .expect("host open failed");
    let code = host.code().to_string();

    host.close().await.expect("close failed");

    let rejoin = JoinSession::open(&code, config).await;
    assert!(matches!(
        rejoin,
        Err(PeerError::Rendezvous(RendezvousClientError::CodeNotFound))
    ));

    cancel.cancel();
}

#[tokio::test]
async fn test_run_bridge_consumes_the_relay_connection() {
    let cancel = CancellationToken::new();
    let config = start_stack(&cancel).await;

    let service = echo_service(b"x", b"y").await;
    let mut host = HostSession::open(config.clone())
        .await
        .expect("host open failed");
    let code = host.code().to_string();

    // Pair the session so the first run_bridge terminates quickly
    let mut joiner = JoinSession::open(&code, config).await.expect("join failed");
    let joiner_cancel = cancel.child_token();
    let joiner_target = BridgeTarget::Addr(service.clone());
    tokio::spawn(async move { joiner.run_bridge(joiner_target, joiner_cancel).await });

    // Nothing sends any bytes, so end the first bridge with its own
    // cancellation after a moment
    let bridge_cancel = cancel.child_token();
    {
        let stop = bridge_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            stop.cancel();
        });
    }
    let first = host
        .run_bridge(BridgeTarget::Addr(service.clone()), bridge_cancel)
        .await;
    assert!(first.is_ok(), "cancelled bridge should close cleanly");

    let again = host
        .run_bridge(BridgeTarget::Addr(service), cancel.child_token())
        .await;
    assert!(matches!(again, Err(PeerError::AlreadyForwarding)));

    cancel.cancel();
}
