//! A complete tunnel on one machine: rendezvous, relay, two peers.
//!
//! Spins up both services on ephemeral ports, shares a tiny TCP echo
//! service through the host flow, joins it from the joiner flow and
//! sends one message through the spliced pipe.
//!
//! Run with: cargo run --example local_tunnel

use passage_core::bridge::BridgeTarget;
use passage_core::peer::{HostSession, JoinSession, PeerConfig};
use passage_core::relay::RelayServer;
use passage_core::rendezvous::RendezvousServer;
use passage_core::{RelayConfig, RendezvousConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const SECRET: &str = "local-demo-secret";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cancel = CancellationToken::new();

    // 1. Rendezvous on an ephemeral port
    let rendezvous_config = RendezvousConfig {
        secret: SECRET.to_string(),
        ..RendezvousConfig::default()
    };
    let rendezvous = RendezvousServer::new(rendezvous_config, cancel.clone());
    let bind_addr: SocketAddr = "127.0.0.1:0".parse()?;
    let (http_addr, serving) = rendezvous.bind(bind_addr)?;
    tokio::spawn(serving);
    let rendezvous_url = format!("http://{http_addr}");
    println!("rendezvous: {rendezvous_url}");

    // 2. Relay, reporting liveness back to the rendezvous
    let relay_config = RelayConfig {
        secret: SECRET.to_string(),
        rendezvous_url: Some(rendezvous_url.clone()),
        ..RelayConfig::default()
    };
    let relay = RelayServer::new(relay_config, cancel.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let relay_addr = listener.local_addr()?.to_string();
    {
        let relay = relay.clone();
        tokio::spawn(async move {
            let _ = relay.run(listener).await;
        });
    }
    println!("relay:      {relay_addr}");

    let peer_config = PeerConfig {
        rendezvous_url,
        relay_addr,
        ..PeerConfig::default()
    };

    // 3. The host's local service: upper-cases one line
    let service = TcpListener::bind("127.0.0.1:0").await?;
    let service_addr = service.local_addr()?.to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = service.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 64];
                if let Ok(n) = stream.read(&mut buf).await {
                    if n > 0 {
                        let reply = String::from_utf8_lossy(&buf[..n]).to_uppercase();
                        let _ = stream.write_all(reply.as_bytes()).await;
                    }
                }
            });
        }
    });

    // 4. Host flow: create, park on the relay, bridge the service
    let mut host = HostSession::open(peer_config.clone()).await?;
    let code = host.code().to_string();
    println!("code:       {code}");

    let host_cancel = cancel.child_token();
    let host_target = BridgeTarget::Addr(service_addr);
    tokio::spawn(async move {
        let _ = host.run_bridge(host_target, host_cancel).await;
    });

    // 5. Joiner flow: redeem the code, bridge a local entry point
    let mut joiner = JoinSession::open(&code, peer_config).await?;
    let entry = TcpListener::bind("127.0.0.1:0").await?;
    let entry_addr = entry.local_addr()?.to_string();

    // The "application": dials the entry point and speaks through it
    let app = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = entry.accept().await else {
                break None;
            };
            if stream.write_all(b"hello through the tunnel").await.is_err() {
                continue; // probe connection
            }
            let mut buf = [0u8; 64];
            match stream.read(&mut buf).await {
                Ok(n) if n > 0 => break Some(String::from_utf8_lossy(&buf[..n]).to_string()),
                _ => continue,
            }
        }
    });

    let joiner_cancel = cancel.child_token();
    tokio::spawn(async move {
        let _ = joiner
            .run_bridge(BridgeTarget::Addr(entry_addr), joiner_cancel)
            .await;
    });

    let answer = tokio::time::timeout(Duration::from_secs(10), app).await??;
    println!("answer:     {}", answer.unwrap_or_default());

    cancel.cancel();
    Ok(())
}
